//! Error types for the transport layer.

use crate::mode::ConnectOption;
use cambium_sync::SyncError;
use cambium_tree::TreeError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while configuring or running a transport.
///
/// `InvalidMode`, `InvalidConnectOption` and `InvalidTarget` are
/// programming errors. The rest are transient: nothing is retried
/// automatically, retry policy belongs to the caller.
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("Invalid update mode: {0}")]
    InvalidMode(String),

    #[error("Connect option {option:?} is not valid for {target}")]
    InvalidConnectOption { option: ConnectOption, target: String },

    #[error("Invalid endpoint target: {0}")]
    InvalidTarget(String),

    #[error("Connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("Pipe already exists: {0}")]
    PipeExists(PathBuf),

    #[error("Named pipes are not supported on this platform")]
    Unsupported,

    #[error("Protocol mismatch: expected magic {expected:#010x}, found {found:#010x}")]
    BadMagic { expected: u32, found: u32 },

    #[error("Message of {length} bytes exceeds the limit of {limit} bytes")]
    MessageTooLarge { length: usize, limit: usize },

    #[error("No async runtime available: {0}")]
    NoRuntime(String),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IpcError>;
