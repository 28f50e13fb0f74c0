//! Client side of a replication connection.
//!
//! An endpoint is a [`ReplicationLink`](cambium_sync::ReplicationLink) cut in
//! half by a stream: local changes are encoded and written to the wire,
//! frames read from the wire are queued and applied to the local tree on
//! the endpoint's execution context.
//!
//! Each connection runs two tasks, a reader and a writer fed by an unbounded
//! channel. Connections are numbered; a task that finds the connection it
//! belonged to already replaced does not touch the endpoint state.

use crate::config::IpcConfig;
use crate::error::{IpcError, Result};
use crate::mode::{ConnectOption, UpdateMode};
use crate::properties::ClientProperties;
use crate::wire::FrameCodec;
use cambium_sync::{DeltaQueue, ExecutionContext, ReplicationHooks};
use bytes::Bytes;
use cambium_tree::{codec, Change, Delta, ObserverId, Tree};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, ReentrantMutex};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

/// Where an endpoint connects to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndpointTarget {
    /// TCP connection to `host:port`.
    Socket { host: String, port: u16 },
    /// Named pipe, realised as a Unix domain socket at `path`.
    Pipe { path: PathBuf },
    /// A connection accepted by a [`TransportServer`](crate::TransportServer).
    Accepted,
}

impl EndpointTarget {
    pub fn socket(host: impl Into<String>, port: u16) -> Self {
        EndpointTarget::Socket {
            host: host.into(),
            port,
        }
    }

    pub fn pipe(path: impl Into<PathBuf>) -> Self {
        EndpointTarget::Pipe { path: path.into() }
    }
}

impl fmt::Display for EndpointTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointTarget::Socket { host, port } => write!(f, "socket {}:{}", host, port),
            EndpointTarget::Pipe { path } => write!(f, "pipe {}", path.display()),
            EndpointTarget::Accepted => write!(f, "accepted connection"),
        }
    }
}

/// The delta currently being applied from the wire.
#[derive(Default)]
struct WireEcho {
    in_flight: Mutex<Option<Delta>>,
    suppressed: AtomicU64,
}

impl ReplicationHooks for WireEcho {
    fn on_delta_armed(&self, delta: &Delta) {
        *self.in_flight.lock() = Some(delta.clone());
    }

    fn on_delta_disarmed(&self) {
        *self.in_flight.lock() = None;
    }

    fn should_propagate(&self, delta: &Delta) -> bool {
        if self.in_flight.lock().as_ref() == Some(delta) {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }
}

struct Connection {
    id: u64,
    outbound: mpsc::UnboundedSender<Delta>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    fn close(self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct EndpointInner {
    tree: Tree,
    target: EndpointTarget,
    mode: UpdateMode,
    config: IpcConfig,
    properties: ClientProperties,
    queue: Arc<DeltaQueue>,
    echo: Arc<WireEcho>,
    observer: Mutex<Option<ObserverId>>,
    connection: Mutex<Option<Connection>>,
    publish: ReentrantMutex<()>,
    next_connection: AtomicU64,
    rx_count: AtomicU64,
    tx_count: AtomicU64,
    pipe_listener: Mutex<Option<JoinHandle<()>>>,
    created_pipe: Mutex<Option<PathBuf>>,
}

/// One end of a replication connection.
///
/// Local changes are only sent while connected; anything produced while
/// disconnected is dropped, there is no backlog replay.
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl Endpoint {
    /// Create an endpoint for an outbound connection to `target`.
    ///
    /// Nothing is connected until [`connect`](Self::connect) is called.
    pub fn new(
        tree: &Tree,
        target: EndpointTarget,
        mode: UpdateMode,
        context: ExecutionContext,
        config: IpcConfig,
    ) -> Result<Self> {
        if target == EndpointTarget::Accepted {
            return Err(IpcError::InvalidTarget(
                "accepted endpoints are created by a server".to_string(),
            ));
        }
        Self::build(tree, target, mode, context, config, ClientProperties::new())
    }

    /// Endpoint for a connection a server has just accepted.
    pub(crate) fn accepted(
        tree: &Tree,
        mode: UpdateMode,
        context: ExecutionContext,
        config: IpcConfig,
        properties: ClientProperties,
    ) -> Result<Self> {
        Self::build(
            tree,
            EndpointTarget::Accepted,
            mode,
            context,
            config,
            properties,
        )
    }

    fn build(
        tree: &Tree,
        target: EndpointTarget,
        mode: UpdateMode,
        context: ExecutionContext,
        config: IpcConfig,
        properties: ClientProperties,
    ) -> Result<Self> {
        mode.validate()?;

        let echo = Arc::new(WireEcho::default());
        let hooks: Arc<dyn ReplicationHooks> = echo.clone();
        let queue = DeltaQueue::with_hooks(tree.clone(), context, Some(hooks));

        let inner = Arc::new(EndpointInner {
            tree: tree.clone(),
            target,
            mode,
            config,
            properties,
            queue,
            echo,
            observer: Mutex::new(None),
            connection: Mutex::new(None),
            publish: ReentrantMutex::new(()),
            next_connection: AtomicU64::new(0),
            rx_count: AtomicU64::new(0),
            tx_count: AtomicU64::new(0),
            pipe_listener: Mutex::new(None),
            created_pipe: Mutex::new(None),
        });

        if mode.contains(UpdateMode::SEND) {
            let weak = Arc::downgrade(&inner);
            let id = tree.subscribe(move |change: &Change| {
                if let Some(endpoint) = weak.upgrade() {
                    endpoint.local_change(change);
                }
            });
            *inner.observer.lock() = Some(id);
        }

        debug!(
            tree = %tree.id(),
            target = %inner.target,
            mode = ?mode,
            "endpoint created"
        );
        Ok(Self { inner })
    }

    /// Open the connection.
    ///
    /// Sockets ignore `option`. Pipes require one of `MustExist`,
    /// `CreateOrFail` or `CreateIfNeeded`; a pipe this endpoint creates is
    /// connected once a peer opens it, so `connect` returns before
    /// [`is_connected`](Self::is_connected) turns true.
    pub async fn connect(&self, option: ConnectOption) -> Result<()> {
        match &self.inner.target {
            EndpointTarget::Socket { host, port } => {
                let timeout = self.inner.config.connect_timeout;
                let stream = tokio::time::timeout(
                    timeout,
                    tokio::net::TcpStream::connect((host.as_str(), *port)),
                )
                .await
                .map_err(|_| IpcError::Timeout(timeout))??;
                stream.set_nodelay(self.inner.config.nodelay)?;
                self.inner.attach(stream);
                Ok(())
            }
            EndpointTarget::Pipe { path } => self.connect_pipe(path, option).await,
            EndpointTarget::Accepted => Err(IpcError::InvalidTarget(
                "accepted endpoints are connected by their server".to_string(),
            )),
        }
    }

    #[cfg(unix)]
    async fn connect_pipe(&self, path: &Path, option: ConnectOption) -> Result<()> {
        match option {
            ConnectOption::NoOptions => Err(IpcError::InvalidConnectOption {
                option,
                target: self.inner.target.to_string(),
            }),
            ConnectOption::MustExist => self.open_pipe(path).await,
            ConnectOption::CreateOrFail => {
                if path.exists() {
                    return Err(IpcError::PipeExists(path.to_path_buf()));
                }
                self.create_pipe(path)
            }
            ConnectOption::CreateIfNeeded => {
                if path.exists() {
                    match self.open_pipe(path).await {
                        Ok(()) => return Ok(()),
                        Err(e) => {
                            debug!(path = %path.display(), "replacing stale pipe: {}", e);
                            std::fs::remove_file(path)?;
                        }
                    }
                }
                self.create_pipe(path)
            }
        }
    }

    #[cfg(not(unix))]
    async fn connect_pipe(&self, _path: &Path, option: ConnectOption) -> Result<()> {
        if option == ConnectOption::NoOptions {
            return Err(IpcError::InvalidConnectOption {
                option,
                target: self.inner.target.to_string(),
            });
        }
        Err(IpcError::Unsupported)
    }

    #[cfg(unix)]
    async fn open_pipe(&self, path: &Path) -> Result<()> {
        let timeout = self.inner.config.connect_timeout;
        let stream = tokio::time::timeout(timeout, tokio::net::UnixStream::connect(path))
            .await
            .map_err(|_| IpcError::Timeout(timeout))??;
        self.inner.attach(stream);
        Ok(())
    }

    /// Create the pipe and wait in the background for one peer.
    #[cfg(unix)]
    fn create_pipe(&self, path: &Path) -> Result<()> {
        let listener = tokio::net::UnixListener::bind(path)?;
        *self.inner.created_pipe.lock() = Some(path.to_path_buf());
        debug!(path = %path.display(), "pipe created, waiting for peer");

        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            match listener.accept().await {
                Ok((stream, _)) => {
                    if let Some(endpoint) = weak.upgrade() {
                        endpoint.attach(stream);
                    }
                }
                Err(e) => warn!("pipe accept failed: {}", e),
            }
        });
        if let Some(previous) = self.inner.pipe_listener.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    /// Close the connection, if any. Returns true if one was open.
    pub fn disconnect(&self) -> bool {
        self.inner.disconnect()
    }

    /// Start replicating over an already established stream.
    pub(crate) fn attach<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.inner.attach(stream);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.lock().is_some()
    }

    pub fn tree(&self) -> &Tree {
        &self.inner.tree
    }

    pub fn target(&self) -> &EndpointTarget {
        &self.inner.target
    }

    pub fn mode(&self) -> UpdateMode {
        self.inner.mode
    }

    pub fn context(&self) -> &ExecutionContext {
        self.inner.queue.context()
    }

    pub fn properties(&self) -> &ClientProperties {
        &self.inner.properties
    }

    /// Messages received and queued for application.
    pub fn rx_count(&self) -> u64 {
        self.inner.rx_count.load(Ordering::Relaxed)
    }

    /// Messages written to the wire.
    pub fn tx_count(&self) -> u64 {
        self.inner.tx_count.load(Ordering::Relaxed)
    }

    /// Received deltas waiting to be applied.
    pub fn pending_count(&self) -> usize {
        self.inner.queue.pending_count()
    }

    /// Apply the oldest received delta. Only needed for worker contexts;
    /// the main loop drains on its own.
    pub fn drain_one(&self) -> bool {
        self.inner.queue.drain_one()
    }

    pub fn drain_all(&self) -> usize {
        self.inner.queue.drain_all()
    }

    /// Local changes not sent because they echoed a delta from the wire.
    pub fn suppressed_count(&self) -> u64 {
        self.inner.echo.suppressed.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("target", &self.inner.target)
            .field("mode", &self.inner.mode)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Some(id) = self.inner.observer.lock().take() {
            self.inner.tree.unsubscribe(id);
        }
        if let Some(task) = self.inner.pipe_listener.lock().take() {
            task.abort();
        }
        self.inner.disconnect();
        if let Some(path) = self.inner.created_pipe.lock().take() {
            if let Err(e) = std::fs::remove_file(&path) {
                debug!(path = %path.display(), "could not remove pipe: {}", e);
            }
        }
    }
}

impl EndpointInner {
    fn attach<S>(self: &Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound, pending) = mpsc::unbounded_channel();

        // Quiesced so the full state and the change stream meet exactly:
        // a change applied before the snapshot is not also sent on its own,
        // and one applied after it is queued behind it.
        let id = self.tree.quiesced(|| {
            if self.mode.contains(UpdateMode::FULL_SYNC_ON_CONNECT) {
                match self.tree.encode_full_state() {
                    Ok(delta) => {
                        trace!(bytes = delta.len(), "sending full state");
                        // the receiver is alive, it is handed to the writer below
                        let _ = outbound.send(delta);
                    }
                    Err(e) => warn!("could not encode full state: {}", e),
                }
            }

            // Held across spawn so a task that fails immediately still finds
            // its connection registered.
            let mut slot = self.connection.lock();
            let id = self.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
            let tasks = vec![
                tokio::spawn(read_loop(Arc::downgrade(self), reader, id)),
                tokio::spawn(write_loop(Arc::downgrade(self), writer, pending, id)),
            ];
            if let Some(previous) = slot.replace(Connection {
                id,
                outbound,
                tasks,
            }) {
                debug!(connection = previous.id, "replacing connection");
                previous.close();
            }
            id
        });
        self.publish_connected();

        debug!(connection = id, target = %self.target, "connected");
    }

    fn disconnect(&self) -> bool {
        let closed = self.connection.lock().take();
        match closed {
            Some(connection) => {
                debug!(connection = connection.id, target = %self.target, "disconnected");
                connection.close();
                self.publish_connected();
                true
            }
            None => false,
        }
    }

    fn connection_lost(&self, id: u64) {
        let lost = {
            let mut slot = self.connection.lock();
            match slot.as_ref() {
                Some(connection) if connection.id == id => slot.take(),
                _ => None,
            }
        };
        if let Some(connection) = lost {
            debug!(connection = id, target = %self.target, "connection lost");
            connection.close();
            self.publish_connected();
        }
    }

    /// Mirror the connection state into the `connected` property.
    ///
    /// The property write runs observers, so it happens outside the
    /// connection lock; the reentrant lock keeps concurrent publishers from
    /// writing a stale state last.
    fn publish_connected(&self) {
        let _publishing = self.publish.lock();
        let live = self.connection.lock().is_some();
        self.properties.set_connected(live);
    }

    fn local_change(&self, change: &Change) {
        let delta = match codec::encode(change) {
            Ok(delta) => delta,
            Err(e) => {
                warn!("failed to encode change, not sent: {}", e);
                return;
            }
        };
        if !self.echo.should_propagate(&delta) {
            trace!(bytes = delta.len(), "wire echo suppressed");
            return;
        }

        match self.connection.lock().as_ref() {
            Some(connection) => {
                if connection.outbound.send(delta).is_err() {
                    trace!("connection closing, delta dropped");
                }
            }
            None => trace!(bytes = delta.len(), "not connected, delta dropped"),
        }
    }

    fn received(&self, payload: &[u8]) {
        if !self.mode.contains(UpdateMode::RECEIVE) {
            trace!(bytes = payload.len(), "not receiving, message ignored");
            return;
        }
        let count = self.rx_count.fetch_add(1, Ordering::Relaxed) + 1;
        self.properties.set_rx_count(count);
        self.queue.enqueue(Delta::from(payload));
    }

    fn sent(&self) {
        let count = self.tx_count.fetch_add(1, Ordering::Relaxed) + 1;
        self.properties.set_tx_count(count);
    }
}

async fn read_loop<R>(endpoint: Weak<EndpointInner>, reader: R, id: u64)
where
    R: AsyncRead + Unpin,
{
    let codec = match endpoint.upgrade() {
        Some(endpoint) => FrameCodec::from_config(&endpoint.config),
        None => return,
    };
    let mut frames = FramedRead::new(reader, codec);

    loop {
        match frames.next().await {
            Some(Ok(payload)) => match endpoint.upgrade() {
                Some(endpoint) => {
                    trace!(connection = id, bytes = payload.len(), "frame received");
                    endpoint.received(&payload);
                }
                None => return,
            },
            None => {
                debug!(connection = id, "peer closed the connection");
                break;
            }
            Some(Err(e)) => {
                warn!(connection = id, "dropping connection: {}", e);
                break;
            }
        }
    }

    if let Some(endpoint) = endpoint.upgrade() {
        endpoint.connection_lost(id);
    }
}

async fn write_loop<W>(
    endpoint: Weak<EndpointInner>,
    writer: W,
    mut pending: mpsc::UnboundedReceiver<Delta>,
    id: u64,
) where
    W: AsyncWrite + Unpin,
{
    let codec = match endpoint.upgrade() {
        Some(endpoint) => FrameCodec::from_config(&endpoint.config),
        None => return,
    };
    let mut frames = FramedWrite::new(writer, codec);

    while let Some(delta) = pending.recv().await {
        if let Err(e) = frames.send(Bytes::copy_from_slice(delta.as_bytes())).await {
            debug!(connection = id, "write failed: {}", e);
            break;
        }
        match endpoint.upgrade() {
            Some(endpoint) => endpoint.sent(),
            None => return,
        }
    }
    let _ = frames.close().await;

    if let Some(endpoint) = endpoint.upgrade() {
        endpoint.connection_lost(id);
    }
}
