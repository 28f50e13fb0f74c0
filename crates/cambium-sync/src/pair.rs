//! Bidirectional replication with echo suppression.
//!
//! A `LinkPair` couples two opposed [`ReplicationLink`]s, A→B and B→A.
//! Applying a delta on one side makes that tree emit the same change, which
//! the reverse link would otherwise send straight back. To stop the
//! ping-pong, each direction keeps one "in flight" slot:
//!
//! ```text
//! B applies delta d (from A→B)   slot[A→B] = d       (armed)
//!   B emits change, encodes to d'
//!   B→A asks: d' == slot[A→B] ?   yes -> dropped
//! application finished           slot[A→B] = None    (disarmed)
//! ```
//!
//! Comparison is by exact bytes, so an unrelated edit made on B while d is
//! being applied still propagates. The window covers a single in-flight
//! delta per direction: it is exact for ping-pong chains, but it does not
//! try to recognise echoes that arrive reordered or batched.

use crate::context::ExecutionContext;
use crate::error::{Result, SyncError};
use crate::link::{ReplicationHooks, ReplicationLink};
use cambium_tree::{Delta, Tree};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Direction of one link in a pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    AToB,
    BToA,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::AToB => Direction::BToA,
            Direction::BToA => Direction::AToB,
        }
    }

    fn index(self) -> usize {
        match self {
            Direction::AToB => 0,
            Direction::BToA => 1,
        }
    }
}

/// Last delta being applied, per direction.
#[derive(Default)]
struct EchoGuard {
    in_flight: [Mutex<Option<Delta>>; 2],
    suppressed: AtomicU64,
}

/// Hooks installed on the link travelling in `direction`.
struct EchoHooks {
    direction: Direction,
    guard: Arc<EchoGuard>,
}

impl ReplicationHooks for EchoHooks {
    fn on_delta_armed(&self, delta: &Delta) {
        *self.guard.in_flight[self.direction.index()].lock() = Some(delta.clone());
    }

    fn on_delta_disarmed(&self) {
        *self.guard.in_flight[self.direction.index()].lock() = None;
    }

    fn should_propagate(&self, delta: &Delta) -> bool {
        let incoming = self.guard.in_flight[self.direction.reverse().index()].lock();
        if incoming.as_ref() == Some(delta) {
            self.guard.suppressed.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }
}

/// Two trees kept in sync in both directions, each updated on its own
/// execution context.
pub struct LinkPair {
    a_to_b: ReplicationLink,
    b_to_a: ReplicationLink,
    guard: Arc<EchoGuard>,
}

impl LinkPair {
    /// Pair tree `a` (owned by `a_context`) with tree `b` (owned by
    /// `b_context`). The contexts must differ.
    pub fn new(
        a: &Tree,
        a_context: ExecutionContext,
        b: &Tree,
        b_context: ExecutionContext,
    ) -> Result<Self> {
        if a_context == b_context {
            return Err(SyncError::SharedContext(a_context.name()));
        }

        let guard = Arc::new(EchoGuard::default());
        let hooks = |direction| -> Option<Arc<dyn ReplicationHooks>> {
            Some(Arc::new(EchoHooks {
                direction,
                guard: Arc::clone(&guard),
            }))
        };

        // changes to A are applied to B on B's context, and vice versa
        let a_to_b = ReplicationLink::with_hooks(a, b, b_context, hooks(Direction::AToB))?;
        let b_to_a = ReplicationLink::with_hooks(b, a, a_context, hooks(Direction::BToA))?;

        Ok(Self {
            a_to_b,
            b_to_a,
            guard,
        })
    }

    pub fn link(&self, direction: Direction) -> &ReplicationLink {
        match direction {
            Direction::AToB => &self.a_to_b,
            Direction::BToA => &self.b_to_a,
        }
    }

    /// Apply the next delta pending for the tree owned by `context`.
    pub fn perform_next_update(&self, context: &ExecutionContext) -> Result<bool> {
        Ok(self.route(context)?.drain_one())
    }

    /// Apply every delta pending for the tree owned by `context`.
    pub fn perform_all_updates(&self, context: &ExecutionContext) -> Result<usize> {
        Ok(self.route(context)?.drain_all())
    }

    pub fn pending_count(&self, context: &ExecutionContext) -> Result<usize> {
        Ok(self.route(context)?.pending_count())
    }

    /// Echoes dropped so far, both directions combined.
    pub fn suppressed_count(&self) -> u64 {
        self.guard.suppressed.load(Ordering::Relaxed)
    }

    fn route(&self, context: &ExecutionContext) -> Result<&ReplicationLink> {
        if self.a_to_b.context() == context {
            Ok(&self.a_to_b)
        } else if self.b_to_a.context() == context {
            Ok(&self.b_to_a)
        } else {
            Err(SyncError::UnknownContext(context.name()))
        }
    }
}
