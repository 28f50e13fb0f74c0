//! One-way replication from a producer tree to a consumer tree.

use crate::context::ExecutionContext;
use crate::error::{Result, SyncError};
use crate::queue::DeltaQueue;
use cambium_tree::{codec, Change, Delta, ObserverId, Tree};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Lifecycle hooks around delta propagation and application.
///
/// `should_propagate` is asked on the producer side before a new delta is
/// enqueued. `on_delta_armed` / `on_delta_disarmed` bracket every
/// application on the consumer side. All methods default to no-ops.
pub trait ReplicationHooks: Send + Sync {
    fn on_delta_armed(&self, _delta: &Delta) {}

    fn on_delta_disarmed(&self) {}

    fn should_propagate(&self, _delta: &Delta) -> bool {
        true
    }
}

/// A live subscription that copies every change of `producer` into
/// `consumer`, in order, on the consumer's execution context.
///
/// A link is watching from construction until it is dropped; dropping it
/// unsubscribes from the producer. Pending deltas are discarded with it.
pub struct ReplicationLink {
    producer: Tree,
    queue: Arc<DeltaQueue>,
    observer: ObserverId,
}

impl ReplicationLink {
    /// Replicate `producer` into `consumer`, applying on `context`.
    ///
    /// Fails with [`SyncError::SelfSync`] if both handles are the same tree.
    pub fn new(producer: &Tree, consumer: &Tree, context: ExecutionContext) -> Result<Self> {
        Self::with_hooks(producer, consumer, context, None)
    }

    /// Like [`new`](Self::new), with hooks consulted on both sides.
    pub fn with_hooks(
        producer: &Tree,
        consumer: &Tree,
        context: ExecutionContext,
        hooks: Option<Arc<dyn ReplicationHooks>>,
    ) -> Result<Self> {
        if producer.same_tree(consumer) {
            return Err(SyncError::SelfSync(producer.id()));
        }

        let queue = DeltaQueue::with_hooks(consumer.clone(), context, hooks.clone());
        let observer = {
            let queue = Arc::clone(&queue);
            producer.subscribe(move |change: &Change| {
                let delta = match codec::encode(change) {
                    Ok(delta) => delta,
                    Err(e) => {
                        warn!("failed to encode change, not replicated: {}", e);
                        return;
                    }
                };
                if let Some(hooks) = &hooks {
                    if !hooks.should_propagate(&delta) {
                        trace!(bytes = delta.len(), "echo suppressed");
                        return;
                    }
                }
                queue.enqueue(delta);
            })
        };

        debug!(
            producer = %producer.id(),
            consumer = %consumer.id(),
            context = %queue.context().name(),
            "replication link created"
        );

        Ok(Self {
            producer: producer.clone(),
            queue,
            observer,
        })
    }

    pub fn producer(&self) -> &Tree {
        &self.producer
    }

    pub fn consumer(&self) -> &Tree {
        self.queue.consumer()
    }

    pub fn context(&self) -> &ExecutionContext {
        self.queue.context()
    }

    pub fn queue(&self) -> &Arc<DeltaQueue> {
        &self.queue
    }

    pub fn pending_count(&self) -> usize {
        self.queue.pending_count()
    }

    /// Apply the oldest pending delta. Returns false if none was pending.
    pub fn drain_one(&self) -> bool {
        self.queue.drain_one()
    }

    /// Apply every pending delta. Returns how many were consumed.
    pub fn drain_all(&self) -> usize {
        self.queue.drain_all()
    }

    pub fn applied_count(&self) -> u64 {
        self.queue.applied_count()
    }
}

impl Drop for ReplicationLink {
    fn drop(&mut self) {
        self.producer.unsubscribe(self.observer);
        debug!(producer = %self.producer.id(), "replication link dropped");
    }
}
