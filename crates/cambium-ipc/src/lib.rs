//! Cambium IPC - replicate trees across process boundaries
//!
//! An [`Endpoint`] watches a local [`Tree`] and mirrors its changes over a
//! stream connection (TCP socket or named pipe) to an endpoint in another
//! process; deltas arriving from the wire are queued and applied to the
//! same tree on a chosen execution context. A [`TransportServer`] accepts
//! any number of inbound endpoints for one shared tree.
//!
//! # Architecture
//!
//! - [`wire`] - length-prefixed frames tagged with a protocol magic number
//! - [`mode`] - which directions an endpoint replicates, pipe connect options
//! - [`properties`] - control-plane state exposed as observable trees
//! - [`endpoint`] - the client side of a connection
//! - [`server`] - the listening side, owning one endpoint per connection
//! - [`config`] - transport configuration
//! - [`error`] - error types
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use cambium_ipc::{ConnectOption, Endpoint, EndpointTarget, IpcConfig, TransportServer, UpdateMode};
//! use cambium_sync::{ExecutionContext, MainLoop};
//! use cambium_tree::Tree;
//!
//! # async fn demo() -> cambium_ipc::Result<()> {
//! let _main_loop = MainLoop::init()?;
//!
//! let published = Tree::new("mixer");
//! let server = TransportServer::new(
//!     &published,
//!     UpdateMode::SEND | UpdateMode::FULL_SYNC_ON_CONNECT,
//!     ExecutionContext::main_loop(),
//!     IpcConfig::default(),
//! )?;
//! server.start_server(9137, "127.0.0.1");
//!
//! let mirror = Tree::new("mixer");
//! let client = Endpoint::new(
//!     &mirror,
//!     EndpointTarget::socket("127.0.0.1", 9137),
//!     UpdateMode::RECEIVE,
//!     ExecutionContext::main_loop(),
//!     IpcConfig::default(),
//! )?;
//! client.connect(ConnectOption::NoOptions).await?;
//!
//! published.set("level", 0.8);
//! # Ok(())
//! # }
//! ```
//!
//! [`Tree`]: cambium_tree::Tree

pub mod config;
pub mod endpoint;
pub mod error;
pub mod mode;
pub mod properties;
pub mod server;
pub mod wire;

pub use config::{IpcConfig, IpcConfigBuilder};
pub use endpoint::{Endpoint, EndpointTarget};
pub use error::{IpcError, Result};
pub use mode::{ConnectOption, UpdateMode};
pub use properties::{ClientProperties, ServerProperties, ServerStatus};
pub use server::TransportServer;
pub use wire::DEFAULT_MAGIC;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::IpcConfig;
    pub use crate::endpoint::{Endpoint, EndpointTarget};
    pub use crate::mode::{ConnectOption, UpdateMode};
    pub use crate::server::TransportServer;
}
