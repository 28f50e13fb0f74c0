//! End-to-end transport tests over real sockets and pipes.

use cambium_ipc::{
    ConnectOption, Endpoint, EndpointTarget, IpcConfig, IpcConfigBuilder, IpcError,
    ServerStatus, TransportServer, UpdateMode,
};
use cambium_sync::{ExecutionContext, MainLoop, WorkerContext};
use cambium_tree::{Node, Tree};
use std::time::{Duration, Instant};

const POLL: Duration = Duration::from_millis(10);
const DEADLINE: Duration = Duration::from_secs(10);
const SETTLE: Duration = Duration::from_millis(150);

async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + DEADLINE;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(POLL).await;
    }
}

fn start_server(tree: &Tree, mode: UpdateMode) -> (TransportServer, u16) {
    let server =
        TransportServer::new(tree, mode, ExecutionContext::main_loop(), IpcConfig::default())
            .unwrap();
    assert!(server.start_server(0, "127.0.0.1"));
    let port = server.local_addr().unwrap().port();
    (server, port)
}

fn client(tree: &Tree, port: u16, mode: UpdateMode) -> Endpoint {
    Endpoint::new(
        tree,
        EndpointTarget::socket("127.0.0.1", port),
        mode,
        ExecutionContext::main_loop(),
        IpcConfig::default(),
    )
    .unwrap()
}

// ============================================================================
// Server control plane
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_driven_through_properties() {
    let tree = Tree::new("doc");
    let server =
        TransportServer::new(&tree, UpdateMode::SEND, ExecutionContext::main_loop(), IpcConfig::default())
            .unwrap();

    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };

    server.properties().start_server(port, "127.0.0.1");
    assert_eq!(server.status(), ServerStatus::StartedOkay);
    assert!(server.properties().running());
    assert_eq!(server.properties().bound_port(), port);
    assert_eq!(server.local_addr().map(|a| a.port()), Some(port));

    server.properties().start_server(port, "127.0.0.1");
    assert_eq!(server.status(), ServerStatus::AlreadyRunning);

    server.properties().stop_server();
    assert_eq!(server.status(), ServerStatus::StoppedOkay);
    assert!(!server.properties().running());

    server.properties().stop_server();
    assert_eq!(server.status(), ServerStatus::AlreadyStopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stopped_server_refuses_connections() {
    let tree = Tree::new("doc");
    let (server, port) = start_server(&tree, UpdateMode::SEND);
    assert!(server.stop_server());

    let mirror = Tree::new("doc");
    let endpoint = client(&mirror, port, UpdateMode::RECEIVE);

    // the listener is released once its task is cancelled
    eventually("listener to close", || {
        std::net::TcpStream::connect(("127.0.0.1", port)).is_err()
    })
    .await;
    assert!(endpoint.connect(ConnectOption::NoOptions).await.is_err());
    assert!(!endpoint.is_connected());
}

// ============================================================================
// Replication
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_sync_then_incremental_updates() {
    let _main_loop = MainLoop::init().unwrap();

    let published = Tree::from_node(
        Node::new("mixer")
            .with_property("level", 5)
            .with_child(Node::new("track").with_property("gain", 0.5)),
    );
    let (server, port) = start_server(
        &published,
        UpdateMode::SEND | UpdateMode::FULL_SYNC_ON_CONNECT,
    );

    let mirror = Tree::new("mixer");
    let endpoint = client(&mirror, port, UpdateMode::RECEIVE);
    endpoint.connect(ConnectOption::NoOptions).await.unwrap();
    assert!(endpoint.is_connected());
    assert!(endpoint.properties().connected());

    eventually("full state", || mirror.snapshot() == published.snapshot()).await;

    published.set("level", 6);
    published.set_at(&[0], "gain", 0.75).unwrap();
    eventually("incremental updates", || {
        mirror.get_as::<i64>("level") == Some(6)
            && mirror.get_at_as::<f64>(&[0], "gain") == Some(0.75)
    })
    .await;

    assert_eq!(endpoint.rx_count(), 3);
    assert_eq!(endpoint.properties().rx_count(), 3);
    assert_eq!(endpoint.tx_count(), 0);

    assert_eq!(server.connection_count(), 1);
    let connections = server.connections();
    eventually("server tx count", || connections[0].tx_count() == 3).await;
    assert!(connections[0].connected());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_sync_concurrent_with_local_edits() {
    let _main_loop = MainLoop::init().unwrap();

    let published = Tree::new("list");
    let (_server, port) = start_server(
        &published,
        UpdateMode::SEND | UpdateMode::FULL_SYNC_ON_CONNECT,
    );

    // children added while clients connect must land exactly once
    let editor = {
        let published = published.clone();
        tokio::task::spawn_blocking(move || {
            for i in 0..300 {
                published
                    .add_child(&[], Node::new("item").with_property("n", i))
                    .unwrap();
                std::thread::sleep(Duration::from_millis(1));
            }
        })
    };

    let mut mirrors = Vec::new();
    for _ in 0..4 {
        let mirror = Tree::new("list");
        let endpoint = client(&mirror, port, UpdateMode::RECEIVE);
        endpoint.connect(ConnectOption::NoOptions).await.unwrap();
        mirrors.push((mirror, endpoint));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    editor.await.unwrap();

    for (mirror, _endpoint) in &mirrors {
        eventually("mirror to converge", || mirror.snapshot() == published.snapshot()).await;
        assert_eq!(mirror.child_count(&[]).unwrap(), 300);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bidirectional_updates_do_not_echo() {
    let _main_loop = MainLoop::init().unwrap();

    let shared = Tree::new("doc");
    let (server, port) = start_server(&shared, UpdateMode::BIDIRECTIONAL);

    let local = Tree::new("doc");
    let endpoint = client(&local, port, UpdateMode::BIDIRECTIONAL);
    endpoint.connect(ConnectOption::NoOptions).await.unwrap();
    eventually("server accept", || server.connected_count() == 1).await;

    local.set("v", 1);
    eventually("client update at server", || shared.get_as::<i64>("v") == Some(1)).await;
    tokio::time::sleep(SETTLE).await;

    let connections = server.connections();
    let remote = &connections[0];
    assert_eq!(endpoint.tx_count(), 1);
    assert_eq!(remote.rx_count(), 1);
    assert_eq!(remote.tx_count(), 0);
    assert_eq!(endpoint.rx_count(), 0);

    shared.set("w", 2);
    eventually("server update at client", || local.get_as::<i64>("w") == Some(2)).await;
    tokio::time::sleep(SETTLE).await;

    assert_eq!(endpoint.rx_count(), 1);
    assert_eq!(endpoint.tx_count(), 1);
    assert_eq!(endpoint.suppressed_count(), 1);
    assert_eq!(remote.tx_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_relays_between_clients() {
    let _main_loop = MainLoop::init().unwrap();

    let hub = Tree::new("doc");
    let (server, port) = start_server(&hub, UpdateMode::BIDIRECTIONAL);

    let first = Tree::new("doc");
    let second = Tree::new("doc");
    let first_endpoint = client(&first, port, UpdateMode::BIDIRECTIONAL);
    let second_endpoint = client(&second, port, UpdateMode::BIDIRECTIONAL);
    first_endpoint.connect(ConnectOption::NoOptions).await.unwrap();
    second_endpoint.connect(ConnectOption::NoOptions).await.unwrap();
    eventually("both accepted", || server.connected_count() == 2).await;

    first.set("note", "hello");
    eventually("relay to second client", || {
        second.get_as::<String>("note").as_deref() == Some("hello")
    })
    .await;
    assert_eq!(hub.get_as::<String>("note").as_deref(), Some("hello"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_context_drains_explicitly() {
    let published = Tree::new("doc");
    let (server, port) = start_server(&published, UpdateMode::SEND);

    let mirror = Tree::new("doc");
    let worker = WorkerContext::new("receiver");
    let endpoint = Endpoint::new(
        &mirror,
        EndpointTarget::socket("127.0.0.1", port),
        UpdateMode::RECEIVE,
        ExecutionContext::worker(&worker),
        IpcConfig::default(),
    )
    .unwrap();
    endpoint.connect(ConnectOption::NoOptions).await.unwrap();
    eventually("server accept", || server.connected_count() == 1).await;

    for i in 1..=3 {
        published.set("x", i);
    }
    eventually("frames queued", || endpoint.pending_count() == 3).await;
    assert_eq!(mirror.get("x"), None);
    assert!(worker.wait(Some(Duration::ZERO)));

    assert_eq!(endpoint.drain_all(), 3);
    assert_eq!(mirror.get_as::<i64>("x"), Some(3));
}

// ============================================================================
// Connection failures
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wrong_magic_drops_connection() {
    let _main_loop = MainLoop::init().unwrap();

    let shared = Tree::new("doc");
    let (server, port) = start_server(&shared, UpdateMode::RECEIVE);

    let foreign = Tree::new("doc");
    let endpoint = Endpoint::new(
        &foreign,
        EndpointTarget::socket("127.0.0.1", port),
        UpdateMode::SEND,
        ExecutionContext::main_loop(),
        IpcConfigBuilder::new().magic(0x1234_5678).build(),
    )
    .unwrap();
    endpoint.connect(ConnectOption::NoOptions).await.unwrap();
    eventually("server accept", || server.connection_count() == 1).await;

    foreign.set("x", 1);
    eventually("server to drop the connection", || server.connected_count() == 0).await;
    eventually("client to notice", || !endpoint.is_connected()).await;

    assert_eq!(shared.get("x"), None);
    assert_eq!(server.connections()[0].rx_count(), 0);
    assert!(!endpoint.properties().connected());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_changes_while_disconnected_are_not_replayed() {
    let _main_loop = MainLoop::init().unwrap();

    let shared = Tree::new("doc");
    let (server, port) = start_server(&shared, UpdateMode::RECEIVE);

    let local = Tree::new("doc");
    let endpoint = client(&local, port, UpdateMode::SEND);
    endpoint.connect(ConnectOption::NoOptions).await.unwrap();

    local.set("x", 1);
    eventually("first update", || shared.get_as::<i64>("x") == Some(1)).await;

    assert!(endpoint.disconnect());
    assert!(!endpoint.is_connected());
    assert!(!endpoint.properties().connected());
    eventually("server to see the close", || server.connected_count() == 0).await;

    local.set("x", 2);
    tokio::time::sleep(SETTLE).await;
    assert_eq!(endpoint.tx_count(), 1);

    endpoint.connect(ConnectOption::NoOptions).await.unwrap();
    local.set("y", 3);
    eventually("update after reconnect", || shared.get_as::<i64>("y") == Some(3)).await;

    assert_eq!(shared.get_as::<i64>("x"), Some(1));
    eventually("second send to be counted", || endpoint.tx_count() == 2).await;
    assert_eq!(server.connection_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_to_nothing_fails() {
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let endpoint = client(&Tree::new("doc"), port, UpdateMode::SEND);

    let result = endpoint.connect(ConnectOption::NoOptions).await;
    assert!(matches!(result, Err(IpcError::Io(_)) | Err(IpcError::Timeout(_))));
    assert!(!endpoint.is_connected());
}

// ============================================================================
// Named pipes
// ============================================================================

#[cfg(unix)]
mod pipes {
    use super::*;

    fn pipe_endpoint(tree: &Tree, path: &std::path::Path, mode: UpdateMode) -> Endpoint {
        Endpoint::new(
            tree,
            EndpointTarget::pipe(path),
            mode,
            ExecutionContext::main_loop(),
            IpcConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pipe_requires_an_option() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cambium.pipe");
        let endpoint = pipe_endpoint(&Tree::new("doc"), &path, UpdateMode::SEND);

        let result = endpoint.connect(ConnectOption::NoOptions).await;
        assert!(matches!(
            result,
            Err(IpcError::InvalidConnectOption { option: ConnectOption::NoOptions, .. })
        ));

        let result = endpoint.connect(ConnectOption::MustExist).await;
        assert!(matches!(result, Err(IpcError::Io(_))));
        assert!(!path.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_create_then_join_pipe() {
        let _main_loop = MainLoop::init().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cambium.pipe");

        let source = Tree::new("doc");
        let owner = pipe_endpoint(&source, &path, UpdateMode::SEND);
        owner.connect(ConnectOption::CreateOrFail).await.unwrap();
        assert!(path.exists());
        assert!(!owner.is_connected());

        let intruder = pipe_endpoint(&Tree::new("doc"), &path, UpdateMode::SEND);
        let result = intruder.connect(ConnectOption::CreateOrFail).await;
        assert!(matches!(result, Err(IpcError::PipeExists(p)) if p == path));

        let mirror = Tree::new("doc");
        let peer = pipe_endpoint(&mirror, &path, UpdateMode::RECEIVE);
        peer.connect(ConnectOption::MustExist).await.unwrap();
        eventually("pipe owner to connect", || owner.is_connected()).await;

        source.set("x", 42);
        eventually("update through pipe", || mirror.get_as::<i64>("x") == Some(42)).await;

        drop(owner);
        assert!(!path.exists());
        eventually("peer to notice", || !peer.is_connected()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_create_if_needed_replaces_stale_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cambium.pipe");
        std::fs::write(&path, b"stale").unwrap();

        let endpoint = pipe_endpoint(&Tree::new("doc"), &path, UpdateMode::SEND);
        endpoint.connect(ConnectOption::CreateIfNeeded).await.unwrap();
        assert!(path.exists());
        assert!(!endpoint.is_connected());

        let joiner = pipe_endpoint(&Tree::new("doc"), &path, UpdateMode::RECEIVE);
        joiner.connect(ConnectOption::CreateIfNeeded).await.unwrap();
        assert!(joiner.is_connected());
        eventually("creator to connect", || endpoint.is_connected()).await;
    }
}
