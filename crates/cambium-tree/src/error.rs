//! Error types for the tree model.

use thiserror::Error;

/// Errors that can occur while mutating a tree or decoding a delta.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TreeError {
    #[error("Path not found: {0:?}")]
    PathNotFound(Vec<usize>),

    #[error("Invalid child index: {index} (length: {length})")]
    IndexOutOfBounds { index: usize, length: usize },

    #[error("Malformed delta: {0}")]
    MalformedDelta(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for TreeError {
    fn from(err: serde_json::Error) -> Self {
        TreeError::SerializationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TreeError>;
