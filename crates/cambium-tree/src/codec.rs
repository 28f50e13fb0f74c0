//! Change records and their byte encoding.
//!
//! Every successful tree mutation is described by exactly one [`Change`].
//! The codec turns a `Change` into a [`Delta`] and back. Encoding is
//! deterministic: two equal changes always produce identical bytes. Echo
//! suppression in the sync layer compares deltas byte-for-byte, so a change
//! re-emitted by a tree that just applied a delta must encode to the very
//! same bytes it was decoded from.
//!
//! Properties are held in `BTreeMap`s and `serde_json` object maps are
//! ordered, which keeps the JSON output canonical. Floats are parsed exactly
//! (`float_roundtrip`), so a decoded `f64` prints back to the same digits.

use crate::delta::Delta;
use crate::error::{Result, TreeError};
use crate::node::{Node, NodePath};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single mutation of a tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Change {
    /// The entire tree was replaced.
    FullSync { root: Node },
    /// A property was created or overwritten.
    PropertySet {
        path: NodePath,
        name: String,
        value: Value,
    },
    /// A property was removed.
    PropertyRemoved { path: NodePath, name: String },
    /// A child was inserted at `index` under the node at `path`.
    ChildAdded {
        path: NodePath,
        index: usize,
        node: Node,
    },
    /// The child at `index` under the node at `path` was removed.
    ChildRemoved { path: NodePath, index: usize },
}

impl Change {
    /// Path of the node this change targets (empty for a full sync).
    pub fn path(&self) -> &[usize] {
        match self {
            Change::FullSync { .. } => &[],
            Change::PropertySet { path, .. }
            | Change::PropertyRemoved { path, .. }
            | Change::ChildAdded { path, .. }
            | Change::ChildRemoved { path, .. } => path,
        }
    }

    /// Name of the property this change touches, if any.
    pub fn property(&self) -> Option<&str> {
        match self {
            Change::PropertySet { name, .. } | Change::PropertyRemoved { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn is_full_sync(&self) -> bool {
        matches!(self, Change::FullSync { .. })
    }
}

/// Encode a change into its wire representation.
pub fn encode(change: &Change) -> Result<Delta> {
    Ok(Delta::from(serde_json::to_vec(change)?))
}

/// Decode a delta produced by [`encode`].
pub fn decode(delta: &Delta) -> Result<Change> {
    serde_json::from_slice(delta.as_bytes()).map_err(|e| TreeError::MalformedDelta(e.to_string()))
}
