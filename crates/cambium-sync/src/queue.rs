//! FIFO of pending deltas for one consumer tree.

use crate::context::ExecutionContext;
use crate::link::ReplicationHooks;
use crate::main_loop::MainLoop;
use cambium_tree::{Delta, Tree};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// Thread-safe queue of deltas waiting to be applied to a consumer tree.
///
/// Deltas are applied strictly in the order they were enqueued. The mutex
/// guards only the sequence itself: it is held for the length of one push
/// or one pop, never while a delta is being applied.
pub struct DeltaQueue {
    consumer: Tree,
    context: ExecutionContext,
    pending: Mutex<VecDeque<Delta>>,
    hooks: Option<Arc<dyn ReplicationHooks>>,
    applied: AtomicU64,
    failed: AtomicU64,
}

impl DeltaQueue {
    /// Create a queue feeding `consumer`, drained on `context`.
    pub fn new(consumer: Tree, context: ExecutionContext) -> Arc<Self> {
        Self::with_hooks(consumer, context, None)
    }

    /// Create a queue whose applications are bracketed by `hooks`.
    pub fn with_hooks(
        consumer: Tree,
        context: ExecutionContext,
        hooks: Option<Arc<dyn ReplicationHooks>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            consumer,
            context,
            pending: Mutex::new(VecDeque::new()),
            hooks,
            applied: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    pub fn consumer(&self) -> &Tree {
        &self.consumer
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Append a delta and wake the consumer's context.
    ///
    /// On the main loop this schedules a drain-everything callback. A worker
    /// context is only notified; draining is the worker's job.
    pub fn enqueue(self: &Arc<Self>, delta: Delta) {
        trace!(bytes = delta.len(), context = %self.context.name(), "enqueue delta");
        self.pending.lock().push_back(delta);

        match &self.context {
            ExecutionContext::MainLoop => {
                let queue = Arc::downgrade(self);
                let scheduled = MainLoop::call_async(move || {
                    debug_assert!(MainLoop::is_current_thread());
                    if let Some(queue) = queue.upgrade() {
                        queue.drain_all();
                    }
                });
                if let Err(e) = scheduled {
                    warn!(
                        pending = self.pending_count(),
                        "delta left pending, could not schedule drain: {}", e
                    );
                }
            }
            ExecutionContext::Worker(worker) => worker.notify(),
        }
    }

    /// Number of deltas waiting to be applied.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Pop the oldest delta and apply it to the consumer.
    ///
    /// Returns false if the queue was empty. A delta the codec rejects is
    /// logged, counted in [`failed_count`](Self::failed_count) and consumed.
    pub fn drain_one(&self) -> bool {
        let delta = match self.pending.lock().pop_front() {
            Some(delta) => delta,
            None => return false,
        };

        if let Some(hooks) = &self.hooks {
            hooks.on_delta_armed(&delta);
        }
        let result = self.consumer.apply_delta(&delta);
        if let Some(hooks) = &self.hooks {
            hooks.on_delta_disarmed();
        }

        match result {
            Ok(()) => {
                self.applied.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(tree = %self.consumer.id(), "dropping delta the consumer rejected: {}", e);
            }
        }
        true
    }

    /// Apply deltas until the queue is observed empty. Deltas enqueued
    /// while draining are applied too. Returns how many were consumed.
    pub fn drain_all(&self) -> usize {
        let mut drained = 0;
        while self.drain_one() {
            drained += 1;
        }
        drained
    }

    /// Deltas successfully applied so far.
    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Deltas rejected by the consumer so far.
    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}
