//! Plain tree nodes.
//!
//! A `Node` is a value: it has no identity and no observers. Shared,
//! observable state lives in [`crate::tree::Tree`], which owns a root node.

use crate::error::{Result, TreeError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Child indices leading from the root to a node. The empty path is the root.
pub type NodePath = Vec<usize>;

/// A typed node with ordered properties and ordered children.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub kind: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    #[serde(default)]
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            properties: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    /// Builder-style property setter.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Builder-style child append.
    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn child(&self, index: usize) -> Option<&Node> {
        self.children.get(index)
    }

    /// Follow `path` down from this node.
    pub fn descend(&self, path: &[usize]) -> Option<&Node> {
        path.iter()
            .try_fold(self, |node, &index| node.children.get(index))
    }

    /// Follow `path` down from this node, mutably.
    pub fn descend_mut(&mut self, path: &[usize]) -> Result<&mut Node> {
        let mut node = self;
        for &index in path {
            node = node
                .children
                .get_mut(index)
                .ok_or_else(|| TreeError::PathNotFound(path.to_vec()))?;
        }
        Ok(node)
    }

    /// Total number of nodes in this subtree, including `self`.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(Node::node_count).sum::<usize>()
    }
}
