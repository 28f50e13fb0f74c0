//! Control-plane state exposed as observable trees.
//!
//! Connection flags, counters and server status are ordinary properties on
//! a [`Tree`], so an application watches them with `subscribe` exactly like
//! any other document. The typed wrappers here only fix the property names.

use crate::error::Result;
use cambium_tree::{Node, NodePath, Tree, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

pub const CONNECTED: &str = "connected";
pub const RX_COUNT: &str = "rxCount";
pub const TX_COUNT: &str = "txCount";
pub const LABEL: &str = "label";

pub const RUNNING: &str = "running";
pub const STATUS: &str = "status";
pub const PORT_NUMBER: &str = "portNumber";
pub const BIND_ADDRESS: &str = "bindAddress";
pub const BOUND_PORT: &str = "boundPort";

/// Outcome of the most recent server start or stop request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServerStatus {
    #[default]
    Unknown,
    Initialized,
    StartedOkay,
    AlreadyRunning,
    ErrorStarting,
    StoppedOkay,
    AlreadyStopped,
    /// The listener was still running after a stop request.
    ErrorStopping,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Unknown => "unknown",
            ServerStatus::Initialized => "initialized",
            ServerStatus::StartedOkay => "startedOkay",
            ServerStatus::AlreadyRunning => "alreadyRunning",
            ServerStatus::ErrorStarting => "errorStarting",
            ServerStatus::StoppedOkay => "stoppedOkay",
            ServerStatus::AlreadyStopped => "alreadyStopped",
            ServerStatus::ErrorStopping => "errorStopping",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn write(tree: &Tree, path: &[usize], name: &str, value: Value, forced: bool) {
    let result = if forced {
        tree.set_forced_at(path, name, value)
    } else {
        tree.set_at(path, name, value).map(|_| ())
    };
    if let Err(e) = result {
        warn!(tree = %tree.id(), property = name, "control-plane write failed: {}", e);
    }
}

/// Connection state of one endpoint: `connected`, `rxCount`, `txCount`.
///
/// Either owns a tree of its own or lives as a child node inside a server's
/// control-plane tree.
#[derive(Clone, Debug)]
pub struct ClientProperties {
    tree: Tree,
    path: NodePath,
}

impl ClientProperties {
    /// Properties in a fresh tree of their own.
    pub fn new() -> Self {
        Self {
            tree: Tree::from_node(Self::initial_node()),
            path: NodePath::new(),
        }
    }

    /// Properties stored as a new child of `parent`'s root.
    pub fn attach_to(parent: &Tree, label: &str) -> Result<Self> {
        let node = Self::initial_node().with_property(LABEL, label);
        let index = parent.add_child(&[], node)?;
        Ok(Self {
            tree: parent.clone(),
            path: vec![index],
        })
    }

    fn initial_node() -> Node {
        Node::new("client")
            .with_property(CONNECTED, false)
            .with_property(RX_COUNT, 0u64)
            .with_property(TX_COUNT, 0u64)
    }

    /// The tree holding these properties.
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Location of the properties node inside [`tree`](Self::tree).
    pub fn path(&self) -> &[usize] {
        &self.path
    }

    pub fn connected(&self) -> bool {
        self.tree.get_at_as(&self.path, CONNECTED).unwrap_or(false)
    }

    pub fn rx_count(&self) -> u64 {
        self.tree.get_at_as(&self.path, RX_COUNT).unwrap_or(0)
    }

    pub fn tx_count(&self) -> u64 {
        self.tree.get_at_as(&self.path, TX_COUNT).unwrap_or(0)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        write(&self.tree, &self.path, CONNECTED, Value::from(connected), false);
    }

    pub(crate) fn set_rx_count(&self, count: u64) {
        write(&self.tree, &self.path, RX_COUNT, Value::from(count), false);
    }

    pub(crate) fn set_tx_count(&self, count: u64) {
        write(&self.tree, &self.path, TX_COUNT, Value::from(count), false);
    }
}

impl Default for ClientProperties {
    fn default() -> Self {
        Self::new()
    }
}

/// Server state: `running`, `status`, `portNumber`, `bindAddress`,
/// `boundPort`.
///
/// Writing `portNumber` is the request channel: a positive value asks the
/// owning server to listen on that port, a negative value asks it to stop.
/// `status` is rewritten on every request, even when unchanged, so
/// observers see each outcome.
#[derive(Clone, Debug)]
pub struct ServerProperties {
    tree: Tree,
}

impl ServerProperties {
    pub fn new() -> Self {
        let root = Node::new("server")
            .with_property(RUNNING, false)
            .with_property(STATUS, ServerStatus::Initialized.as_str())
            .with_property(PORT_NUMBER, 0)
            .with_property(BIND_ADDRESS, "")
            .with_property(BOUND_PORT, 0);
        Self {
            tree: Tree::from_node(root),
        }
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Ask the server to listen on `port` at `bind_address`.
    ///
    /// Port 0 is not a request; call
    /// [`TransportServer::start_server`](crate::TransportServer::start_server)
    /// directly for an ephemeral port.
    pub fn start_server(&self, port: u16, bind_address: &str) {
        write(&self.tree, &[], BIND_ADDRESS, Value::from(bind_address), false);
        write(&self.tree, &[], PORT_NUMBER, Value::from(port), true);
    }

    /// Ask the server to stop listening.
    pub fn stop_server(&self) {
        write(&self.tree, &[], PORT_NUMBER, Value::from(-1), true);
    }

    pub fn running(&self) -> bool {
        self.tree.get_as(RUNNING).unwrap_or(false)
    }

    pub fn status(&self) -> ServerStatus {
        self.tree.get_as(STATUS).unwrap_or_default()
    }

    pub fn port_number(&self) -> i64 {
        self.tree.get_as(PORT_NUMBER).unwrap_or(0)
    }

    pub fn bind_address(&self) -> String {
        self.tree.get_as(BIND_ADDRESS).unwrap_or_default()
    }

    /// Port actually bound; differs from `portNumber` for ephemeral binds.
    pub fn bound_port(&self) -> u16 {
        self.tree.get_as(BOUND_PORT).unwrap_or(0)
    }

    pub(crate) fn set_running(&self, running: bool) {
        write(&self.tree, &[], RUNNING, Value::from(running), false);
    }

    pub(crate) fn set_status(&self, status: ServerStatus) {
        write(&self.tree, &[], STATUS, Value::from(status.as_str()), true);
    }

    pub(crate) fn set_bound_port(&self, port: u16) {
        write(&self.tree, &[], BOUND_PORT, Value::from(port), false);
    }

    pub(crate) fn set_bind_address(&self, address: &str) {
        write(&self.tree, &[], BIND_ADDRESS, Value::from(address), false);
    }
}

impl Default for ServerProperties {
    fn default() -> Self {
        Self::new()
    }
}
