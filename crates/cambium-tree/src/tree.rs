//! The shared, observable tree handle.

use crate::codec::{self, Change};
use crate::delta::Delta;
use crate::error::{Result, TreeError};
use crate::node::Node;
use crate::observer::{ObserverId, ObserverList};
use parking_lot::{ReentrantMutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::trace;
use ulid::Ulid;

/// Identity of a tree. Handles cloned from the same tree share one id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TreeId(Ulid);

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct TreeInner {
    id: TreeId,
    root: RwLock<Node>,
    observers: ObserverList<Change>,
    /// Held from mutation until observers have been notified.
    gate: ReentrantMutex<()>,
}

/// A thread-safe handle to a hierarchical document.
///
/// Cloning a `Tree` yields another handle to the same document. Every
/// mutation produces one [`Change`], which is delivered to observers after
/// the internal lock has been released, on the thread that performed the
/// mutation. Mutations are serialized together with their notifications,
/// so observers see changes in the order they were applied. Observers may
/// mutate the tree they observe.
#[derive(Clone)]
pub struct Tree {
    inner: Arc<TreeInner>,
}

impl Tree {
    /// Create an empty tree whose root has the given kind.
    pub fn new(kind: impl Into<String>) -> Self {
        Self::from_node(Node::new(kind))
    }

    /// Create a tree holding `root`.
    pub fn from_node(root: Node) -> Self {
        Self {
            inner: Arc::new(TreeInner {
                id: TreeId(Ulid::new()),
                root: RwLock::new(root),
                observers: ObserverList::new(),
                gate: ReentrantMutex::new(()),
            }),
        }
    }

    pub fn id(&self) -> TreeId {
        self.inner.id
    }

    /// True if both handles refer to the same document.
    pub fn same_tree(&self, other: &Tree) -> bool {
        self.inner.id == other.inner.id
    }

    pub fn kind(&self) -> String {
        self.inner.root.read().kind.clone()
    }

    /// A copy of the whole document.
    pub fn snapshot(&self) -> Node {
        self.inner.root.read().clone()
    }

    /// A copy of the subtree at `path`.
    pub fn node_at(&self, path: &[usize]) -> Option<Node> {
        self.inner.root.read().descend(path).cloned()
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn get(&self, name: &str) -> Option<Value> {
        self.get_at(&[], name)
    }

    pub fn get_at(&self, path: &[usize], name: &str) -> Option<Value> {
        self.inner
            .root
            .read()
            .descend(path)
            .and_then(|node| node.get(name).cloned())
    }

    /// Read a root property and deserialize it into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.get_at_as(&[], name)
    }

    pub fn get_at_as<T: DeserializeOwned>(&self, path: &[usize], name: &str) -> Option<T> {
        self.get_at(path, name)
            .and_then(|value| serde_json::from_value(value).ok())
    }

    pub fn child_count(&self, path: &[usize]) -> Result<usize> {
        self.inner
            .root
            .read()
            .descend(path)
            .map(|node| node.children.len())
            .ok_or_else(|| TreeError::PathNotFound(path.to_vec()))
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Set a root property. Returns true if the stored value changed.
    pub fn set(&self, name: impl Into<String>, value: impl Into<Value>) -> bool {
        // the root path always exists
        self.set_at(&[], name, value).unwrap_or(false)
    }

    /// Set a property on the node at `path`. Observers are only notified
    /// when the stored value actually changes.
    pub fn set_at(
        &self,
        path: &[usize],
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<bool> {
        self.apply(
            Change::PropertySet {
                path: path.to_vec(),
                name: name.into(),
                value: value.into(),
            },
            false,
        )
    }

    /// Set a property and notify observers even if the value is unchanged.
    pub fn set_forced_at(
        &self,
        path: &[usize],
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<()> {
        self.apply(
            Change::PropertySet {
                path: path.to_vec(),
                name: name.into(),
                value: value.into(),
            },
            true,
        )
        .map(|_| ())
    }

    /// Remove a root property. Returns true if it existed.
    pub fn remove(&self, name: impl Into<String>) -> bool {
        self.remove_at(&[], name).unwrap_or(false)
    }

    pub fn remove_at(&self, path: &[usize], name: impl Into<String>) -> Result<bool> {
        self.apply(
            Change::PropertyRemoved {
                path: path.to_vec(),
                name: name.into(),
            },
            false,
        )
    }

    /// Append `node` to the children of the node at `path` and return its index.
    pub fn add_child(&self, path: &[usize], node: Node) -> Result<usize> {
        let index = self.child_count(path)?;
        self.insert_child(path, index, node)?;
        Ok(index)
    }

    pub fn insert_child(&self, path: &[usize], index: usize, node: Node) -> Result<()> {
        self.apply(
            Change::ChildAdded {
                path: path.to_vec(),
                index,
                node,
            },
            false,
        )
        .map(|_| ())
    }

    /// Remove and return the child at `index` under the node at `path`.
    pub fn remove_child(&self, path: &[usize], index: usize) -> Result<Node> {
        let parent = self
            .node_at(path)
            .ok_or_else(|| TreeError::PathNotFound(path.to_vec()))?;
        let removed = parent
            .children
            .get(index)
            .cloned()
            .ok_or(TreeError::IndexOutOfBounds {
                index,
                length: parent.children.len(),
            })?;
        self.apply(
            Change::ChildRemoved {
                path: path.to_vec(),
                index,
            },
            false,
        )?;
        Ok(removed)
    }

    /// Replace the whole document.
    pub fn replace_root(&self, root: Node) -> bool {
        self.apply(Change::FullSync { root }, false).unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Codec
    // ------------------------------------------------------------------

    /// A delta that recreates the entire current state when applied.
    pub fn encode_full_state(&self) -> Result<Delta> {
        codec::encode(&Change::FullSync {
            root: self.snapshot(),
        })
    }

    /// Run `f` while no other thread can mutate the tree.
    ///
    /// Every change applied before `f` starts has already been delivered to
    /// observers, and every change applied after it returns is delivered
    /// afterwards. Use this to pair a snapshot with the start of a change
    /// stream. Mutations made by `f` itself, on this thread, go through.
    pub fn quiesced<R>(&self, f: impl FnOnce() -> R) -> R {
        let _gate = self.inner.gate.lock();
        f()
    }

    /// Decode `delta` and apply it, notifying observers like a local edit.
    pub fn apply_delta(&self, delta: &Delta) -> Result<()> {
        let change = codec::decode(delta)?;
        self.apply_change(change).map(|_| ())
    }

    /// Apply a decoded change. Returns true if the tree was modified.
    pub fn apply_change(&self, change: Change) -> Result<bool> {
        self.apply(change, false)
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    /// Register a callback invoked after every change to this tree.
    pub fn subscribe<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&Change) + Send + Sync + 'static,
    {
        self.inner.observers.add(callback)
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.inner.observers.remove(id)
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.len()
    }

    fn apply(&self, change: Change, force: bool) -> Result<bool> {
        let _gate = self.inner.gate.lock();
        let changed = {
            let mut root = self.inner.root.write();
            apply_to(&mut root, &change, force)?
        };
        if changed {
            trace!(tree = %self.inner.id, ?change, "tree changed");
            self.inner.observers.notify(&change);
        }
        Ok(changed)
    }
}

impl PartialEq for Tree {
    fn eq(&self, other: &Self) -> bool {
        self.same_tree(other)
    }
}

impl Eq for Tree {}

impl fmt::Debug for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tree")
            .field("id", &self.inner.id)
            .field("kind", &self.kind())
            .field("observers", &self.inner.observers.len())
            .finish()
    }
}

/// Apply `change` to `root`. Returns whether anything was modified.
fn apply_to(root: &mut Node, change: &Change, force: bool) -> Result<bool> {
    match change {
        Change::FullSync { root: replacement } => {
            if !force && root == replacement {
                return Ok(false);
            }
            *root = replacement.clone();
            Ok(true)
        }
        Change::PropertySet { path, name, value } => {
            let node = root.descend_mut(path)?;
            if !force && node.properties.get(name) == Some(value) {
                return Ok(false);
            }
            node.properties.insert(name.clone(), value.clone());
            Ok(true)
        }
        Change::PropertyRemoved { path, name } => {
            let node = root.descend_mut(path)?;
            Ok(node.properties.remove(name).is_some())
        }
        Change::ChildAdded { path, index, node } => {
            let parent = root.descend_mut(path)?;
            if *index > parent.children.len() {
                return Err(TreeError::IndexOutOfBounds {
                    index: *index,
                    length: parent.children.len(),
                });
            }
            parent.children.insert(*index, node.clone());
            Ok(true)
        }
        Change::ChildRemoved { path, index } => {
            let parent = root.descend_mut(path)?;
            if *index >= parent.children.len() {
                return Err(TreeError::IndexOutOfBounds {
                    index: *index,
                    length: parent.children.len(),
                });
            }
            parent.children.remove(*index);
            Ok(true)
        }
    }
}
