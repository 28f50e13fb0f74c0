//! Observer lists keyed by stable identifiers.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use ulid::Ulid;

/// Stable handle returned when registering an observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObserverId(Ulid);

impl ObserverId {
    fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// An ordered list of callbacks for events of type `E`.
///
/// Callbacks run synchronously on the notifying thread, in registration
/// order. The list is not locked while callbacks run, so a callback may
/// register or remove observers (including itself) and may trigger nested
/// notifications. Removal takes effect from the next notification on.
pub struct ObserverList<E> {
    entries: Mutex<Vec<(ObserverId, Callback<E>)>>,
}

impl<E> ObserverList<E> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback and return its identifier.
    pub fn add<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ObserverId::generate();
        self.entries.lock().push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback. Returns false if `id` was not registered.
    pub fn remove(&self, id: ObserverId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    /// Invoke every registered callback with `event`.
    pub fn notify(&self, event: &E) {
        let callbacks: Vec<Callback<E>> = self
            .entries
            .lock()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in callbacks {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<E> Default for ObserverList<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for ObserverList<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverList")
            .field("len", &self.len())
            .finish()
    }
}
