//! Cambium Tree - the replicated document model
//!
//! This crate provides the small hierarchical data model that the
//! replication layers (`cambium-sync`, `cambium-ipc`) move between
//! execution contexts:
//!
//! - [`node`] - plain `Node` values (kind, properties, children)
//! - [`tree`] - the shared, observable `Tree` handle
//! - [`codec`] - `Change` records and their byte encoding (`Delta`)
//! - [`observer`] - observer lists keyed by stable identifiers
//!
//! # Change flow
//!
//! ```text
//! tree.set("x", 1)
//!   -> Change::PropertySet { path: [], name: "x", value: 1 }
//!   -> observers(&change)            // synchronous, on the mutating thread
//!   -> codec::encode(&change)        // Delta, deterministic bytes
//!   -> other_tree.apply_delta(&delta)
//! ```
//!
//! # Example
//!
//! ```rust
//! use cambium_tree::{codec, Tree};
//! use std::sync::{Arc, Mutex};
//!
//! let source = Tree::new("state");
//! let mirror = Tree::new("state");
//!
//! let deltas = Arc::new(Mutex::new(Vec::new()));
//! let sink = Arc::clone(&deltas);
//! source.subscribe(move |change| {
//!     sink.lock().unwrap().push(codec::encode(change).unwrap());
//! });
//!
//! source.set("volume", 11);
//! for delta in deltas.lock().unwrap().iter() {
//!     mirror.apply_delta(delta).unwrap();
//! }
//! assert_eq!(mirror.get_as::<i64>("volume"), Some(11));
//! ```

pub mod codec;
pub mod delta;
pub mod error;
pub mod node;
pub mod observer;
pub mod tree;

pub use codec::Change;
pub use delta::Delta;
pub use error::{Result, TreeError};
pub use node::{Node, NodePath};
pub use observer::{ObserverId, ObserverList};
pub use tree::{Tree, TreeId};

/// Re-exported so callers can build property values without a direct
/// `serde_json` dependency.
pub use serde_json::{json, Value};
