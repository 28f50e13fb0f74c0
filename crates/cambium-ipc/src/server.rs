//! Listening side of replication connections.

use crate::config::IpcConfig;
use crate::endpoint::Endpoint;
use crate::error::{IpcError, Result};
use crate::mode::UpdateMode;
use crate::properties::{ClientProperties, ServerProperties, ServerStatus, PORT_NUMBER};
use cambium_sync::ExecutionContext;
use cambium_tree::{Change, ObserverId, Tree};
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

struct Listening {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

enum StartOutcome {
    AlreadyRunning,
    Started(SocketAddr),
    Failed(IpcError),
}

struct ServerInner {
    tree: Tree,
    mode: UpdateMode,
    context: ExecutionContext,
    config: IpcConfig,
    properties: ServerProperties,
    runtime: Handle,
    listener: Mutex<Option<Listening>>,
    connections: Mutex<Vec<Endpoint>>,
    observer: Mutex<Option<ObserverId>>,
}

/// Accepts replication connections for one shared tree.
///
/// Every accepted connection gets its own [`Endpoint`] bound to the shared
/// tree, owned by the server until the server is dropped. Each endpoint's
/// [`ClientProperties`] is a child node of the server's control-plane tree.
///
/// ```text
/// server properties (root: running, status, portNumber, ...)
///   ├── client "127.0.0.1:53012" (connected, rxCount, txCount)
///   └── client "127.0.0.1:53020"
/// ```
pub struct TransportServer {
    inner: Arc<ServerInner>,
}

impl TransportServer {
    /// Create a stopped server for `tree`.
    ///
    /// Must be called from within a tokio runtime; the listener and
    /// connection tasks run on it.
    pub fn new(
        tree: &Tree,
        mode: UpdateMode,
        context: ExecutionContext,
        config: IpcConfig,
    ) -> Result<Self> {
        mode.validate()?;
        let runtime = Handle::try_current().map_err(|e| IpcError::NoRuntime(e.to_string()))?;

        let inner = Arc::new(ServerInner {
            tree: tree.clone(),
            mode,
            context,
            config,
            properties: ServerProperties::new(),
            runtime,
            listener: Mutex::new(None),
            connections: Mutex::new(Vec::new()),
            observer: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let id = inner.properties.tree().subscribe(move |change: &Change| {
            if let Change::PropertySet { path, name, value } = change {
                if path.is_empty() && name == PORT_NUMBER {
                    if let (Some(server), Some(port)) = (weak.upgrade(), value.as_i64()) {
                        server.port_requested(port);
                    }
                }
            }
        });
        *inner.observer.lock() = Some(id);

        debug!(tree = %tree.id(), mode = ?mode, "transport server created");
        Ok(Self { inner })
    }

    /// Listen on `bind_address:port`; port 0 picks an ephemeral port.
    ///
    /// Returns true if the server is listening afterwards. Calling this on a
    /// running server succeeds and reports `AlreadyRunning`.
    pub fn start_server(&self, port: u16, bind_address: &str) -> bool {
        self.inner.start_server(port, bind_address)
    }

    /// Stop accepting connections. Existing connections stay open.
    ///
    /// Calling this on a stopped server succeeds and reports
    /// `AlreadyStopped`.
    pub fn stop_server(&self) -> bool {
        self.inner.stop_server()
    }

    pub fn is_running(&self) -> bool {
        self.inner.listener.lock().is_some()
    }

    /// Address the server is listening on, if running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.listener.lock().as_ref().map(|l| l.local_addr)
    }

    pub fn properties(&self) -> &ServerProperties {
        &self.inner.properties
    }

    pub fn status(&self) -> ServerStatus {
        self.inner.properties.status()
    }

    pub fn tree(&self) -> &Tree {
        &self.inner.tree
    }

    pub fn mode(&self) -> UpdateMode {
        self.inner.mode
    }

    /// Connections accepted so far, including ones since closed.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    /// Connections currently open.
    pub fn connected_count(&self) -> usize {
        self.inner
            .connections
            .lock()
            .iter()
            .filter(|endpoint| endpoint.is_connected())
            .count()
    }

    /// Control-plane view of every accepted connection, in accept order.
    pub fn connections(&self) -> Vec<ClientProperties> {
        self.inner
            .connections
            .lock()
            .iter()
            .map(|endpoint| endpoint.properties().clone())
            .collect()
    }

    /// Apply every delta received on every connection. Only needed when
    /// the server drains on a worker context.
    pub fn drain_all(&self) -> usize {
        self.inner
            .connections
            .lock()
            .iter()
            .map(|endpoint| endpoint.drain_all())
            .sum()
    }
}

impl fmt::Debug for TransportServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportServer")
            .field("local_addr", &self.local_addr())
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        if let Some(id) = self.inner.observer.lock().take() {
            self.inner.properties.tree().unsubscribe(id);
        }
        if self.is_running() {
            self.inner.stop_server();
        }
        let connections = std::mem::take(&mut *self.inner.connections.lock());
        debug!(count = connections.len(), "releasing server connections");
        drop(connections);
    }
}

impl ServerInner {
    fn port_requested(self: &Arc<Self>, port: i64) {
        if port > 0 {
            match u16::try_from(port) {
                Ok(port) => {
                    let address = self.properties.bind_address();
                    self.start_server(port, &address);
                }
                Err(_) => {
                    warn!(port, "requested port out of range");
                    self.properties.set_status(ServerStatus::ErrorStarting);
                }
            }
        } else if port < 0 {
            self.stop_server();
        }
    }

    fn start_server(self: &Arc<Self>, port: u16, bind_address: &str) -> bool {
        let outcome = {
            let mut listener = self.listener.lock();
            if listener.is_some() {
                StartOutcome::AlreadyRunning
            } else {
                match self.listen(port, bind_address) {
                    Ok(listening) => {
                        let local_addr = listening.local_addr;
                        *listener = Some(listening);
                        StartOutcome::Started(local_addr)
                    }
                    Err(e) => StartOutcome::Failed(e),
                }
            }
        };

        match outcome {
            StartOutcome::AlreadyRunning => {
                debug!(port, "server already running");
                self.properties.set_status(ServerStatus::AlreadyRunning);
                true
            }
            StartOutcome::Started(local_addr) => {
                info!(%local_addr, "server listening");
                self.properties.set_bind_address(bind_address);
                self.properties.set_bound_port(local_addr.port());
                self.properties.set_running(true);
                self.properties.set_status(ServerStatus::StartedOkay);
                true
            }
            StartOutcome::Failed(e) => {
                warn!(port, bind_address, "server failed to start: {}", e);
                self.properties.set_running(false);
                self.properties.set_status(ServerStatus::ErrorStarting);
                false
            }
        }
    }

    fn listen(self: &Arc<Self>, port: u16, bind_address: &str) -> Result<Listening> {
        let std_listener = std::net::TcpListener::bind((bind_address, port))?;
        std_listener.set_nonblocking(true)?;

        let _runtime = self.runtime.enter();
        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;
        let task = self
            .runtime
            .spawn(accept_loop(Arc::downgrade(self), listener));

        Ok(Listening { local_addr, task })
    }

    fn stop_server(&self) -> bool {
        let stopped = self.listener.lock().take();
        match stopped {
            Some(listening) if !listening.task.is_finished() => {
                listening.task.abort();
                info!(local_addr = %listening.local_addr, "server stopped");
                self.properties.set_running(false);
                self.properties.set_status(ServerStatus::StoppedOkay);
                true
            }
            _ => {
                debug!("server already stopped");
                self.properties.set_running(false);
                self.properties.set_status(ServerStatus::AlreadyStopped);
                true
            }
        }
    }

    fn adopt(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(self.config.nodelay) {
            debug!(%peer, "could not set nodelay: {}", e);
        }

        let properties = match ClientProperties::attach_to(self.properties.tree(), &peer.to_string())
        {
            Ok(properties) => properties,
            Err(e) => {
                warn!(%peer, "rejecting connection: {}", e);
                return;
            }
        };

        match Endpoint::accepted(
            &self.tree,
            self.mode,
            self.context.clone(),
            self.config.clone(),
            properties,
        ) {
            Ok(endpoint) => {
                endpoint.attach(stream);
                info!(%peer, "connection accepted");
                self.connections.lock().push(endpoint);
            }
            Err(e) => warn!(%peer, "rejecting connection: {}", e),
        }
    }
}

async fn accept_loop(server: Weak<ServerInner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => match server.upgrade() {
                Some(server) => server.adopt(stream, peer),
                None => break,
            },
            Err(e) => {
                warn!("failed to accept connection: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}
