//! Error types for the sync layer.

use cambium_tree::TreeId;
use thiserror::Error;

/// Errors raised by replication links, pairs and execution contexts.
///
/// `SelfSync`, `SharedContext` and `UnknownContext` signal programming
/// errors: the caller broke a documented precondition.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Cannot replicate tree {0} into itself")]
    SelfSync(TreeId),

    #[error("Both sides of a link pair use the same execution context: {0}")]
    SharedContext(String),

    #[error("Execution context {0} does not consume either side of this pair")]
    UnknownContext(String),

    #[error("The main loop is not running")]
    MainLoopNotRunning,

    #[error("Failed to spawn thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker thread {0} panicked")]
    WorkerPanicked(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
