use cambium_ipc::{
    ConnectOption, Endpoint, EndpointTarget, IpcConfig, TransportServer, UpdateMode,
};
use cambium_sync::{
    Direction, ExecutionContext, LinkPair, MainLoop, ReplicationLink, WorkerContext,
};
use cambium_tree::{Change, Node, Tree};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub type ScenarioResult<T> = Result<T, Box<dyn Error>>;

const WAIT: Duration = Duration::from_millis(20);
const DEADLINE: Duration = Duration::from_secs(60);

/// Statistics collected during a replication run
#[derive(Clone, Debug)]
pub struct ScenarioStats {
    pub scenario: &'static str,
    pub updates: u64,
    pub applied: u64,
    pub suppressed: u64,
    pub total_time: Duration,
}

impl ScenarioStats {
    pub fn updates_per_second(&self) -> f64 {
        self.applied as f64 / self.total_time.as_secs_f64().max(f64::EPSILON)
    }

    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Replication Statistics                        ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Scenario:                  {:>30} ║", self.scenario);
        println!("║  Local Updates:             {:>30} ║", self.updates);
        println!("║  Deltas Applied:            {:>30} ║", self.applied);
        println!("║  Echoes Suppressed:         {:>30} ║", self.suppressed);
        println!("║  Total Time:                {:>29}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("║  Updates/Second:            {:>30.0} ║", self.updates_per_second());
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

/// Producer on this thread, consumer drained by a worker thread.
///
/// Every update sets `x` to the update number; with `tracks > 0` each update
/// also moves the level of a randomly chosen track first.
pub fn one_way(updates: u64, tracks: usize, seed: Option<u64>) -> ScenarioResult<ScenarioStats> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        One-Way Replication (worker consumer)               ║");
    println!("║  Updates: {} | Tracks: {}", updates, tracks);
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut root = Node::new("session").with_property("x", 0);
    for i in 0..tracks {
        root = root.with_child(Node::new("track").with_property("level", 0.0).with_property("index", i));
    }
    let producer = Tree::from_node(root.clone());
    let consumer = Tree::from_node(root);

    let worker = WorkerContext::new("one-way-consumer");
    let link = Arc::new(ReplicationLink::new(
        &producer,
        &consumer,
        ExecutionContext::worker(&worker),
    )?);

    let start = Instant::now();
    let target = updates as i64;
    let handle = {
        let link = Arc::clone(&link);
        let consumer = consumer.clone();
        worker.spawn(move |ctx| {
            while !ctx.should_exit() && start.elapsed() < DEADLINE {
                ctx.wait(Some(WAIT));
                link.drain_all();
                if consumer.get_as::<i64>("x") == Some(target) {
                    break;
                }
            }
        })?
    };

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    for i in 1..=target {
        if tracks > 0 {
            let track = rng.gen_range(0..tracks);
            producer.set_at(&[track], "level", rng.gen::<f64>())?;
        }
        producer.set("x", i);
    }
    handle.join()?;
    let total_time = start.elapsed();

    if consumer.snapshot() != producer.snapshot() {
        return Err("consumer did not converge on the producer state".into());
    }
    println!("[one-way] ✓ consumer matches producer");

    Ok(ScenarioStats {
        scenario: "one-way",
        updates,
        applied: link.applied_count(),
        suppressed: 0,
        total_time,
    })
}

/// Each side answers the other's value with that value plus one, until a
/// side has received a value above `limit`.
fn cascade_side(
    pair: Arc<LinkPair>,
    tree: Tree,
    limit: i64,
    start: Instant,
) -> impl FnOnce(WorkerContext) + Send + 'static {
    move |ctx| {
        let context = ExecutionContext::worker(&ctx);
        let mut last = tree.get_as::<i64>("value").unwrap_or(0);
        while !ctx.should_exit() && start.elapsed() < DEADLINE {
            ctx.wait(Some(WAIT));
            if let Err(e) = pair.perform_all_updates(&context) {
                warn!("{} cannot drain: {}", ctx.name(), e);
                return;
            }

            let received = tree.get_as::<i64>("value").unwrap_or(0);
            if received != last {
                last = received + 1;
                tree.set("value", last);
                if received > limit {
                    break;
                }
            }
        }
    }
}

/// Two trees on two worker threads, each bouncing the other's value back
/// incremented.
pub fn cascade(limit: i64) -> ScenarioResult<ScenarioStats> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Two-Way Cascade (link pair)                         ║");
    println!("║  Limit: {}", limit);
    println!("╚════════════════════════════════════════════════════════════╝");

    let left = Tree::from_node(Node::new("state").with_property("value", 0));
    let right = Tree::from_node(Node::new("state").with_property("value", 0));
    let left_worker = WorkerContext::new("cascade-left");
    let right_worker = WorkerContext::new("cascade-right");
    let pair = Arc::new(LinkPair::new(
        &left,
        ExecutionContext::worker(&left_worker),
        &right,
        ExecutionContext::worker(&right_worker),
    )?);

    let start = Instant::now();
    left.set("value", 1);

    let right_handle = right_worker.spawn(cascade_side(Arc::clone(&pair), right.clone(), limit, start))?;
    let left_handle = left_worker.spawn(cascade_side(Arc::clone(&pair), left.clone(), limit, start))?;
    right_handle.join()?;
    left_handle.join()?;
    let total_time = start.elapsed();

    let left_value = left.get_as::<i64>("value").unwrap_or(0);
    let right_value = right.get_as::<i64>("value").unwrap_or(0);
    println!("[cascade] ✓ left = {}, right = {}", left_value, right_value);

    let applied = pair.link(Direction::AToB).applied_count()
        + pair.link(Direction::BToA).applied_count();

    Ok(ScenarioStats {
        scenario: "cascade",
        updates: left_value.max(right_value).max(0) as u64,
        applied,
        suppressed: pair.suppressed_count(),
        total_time,
    })
}

/// Publish a counter tree and bump it every `interval` until `updates`
/// have been made (0 runs until interrupted).
pub async fn serve(port: u16, bind: &str, interval: Duration, updates: u64) -> ScenarioResult<()> {
    let _main_loop = MainLoop::init()?;
    let counter = Tree::from_node(Node::new("counter").with_property("count", 0));
    let server = TransportServer::new(
        &counter,
        UpdateMode::SEND | UpdateMode::FULL_SYNC_ON_CONNECT,
        ExecutionContext::main_loop(),
        IpcConfig::default(),
    )?;

    if !server.start_server(port, bind) {
        return Err(format!("could not listen on {}:{} ({})", bind, port, server.status()).into());
    }
    info!(addr = ?server.local_addr(), "serving counter");

    let mut ticker = tokio::time::interval(interval);
    let mut count = 0u64;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                count += 1;
                counter.set("count", count);
                if updates > 0 && count >= updates {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    server.stop_server();
    for (i, client) in server.connections().iter().enumerate() {
        println!(
            "[serve] client {}: connected = {}, sent = {}",
            i,
            client.connected(),
            client.tx_count()
        );
    }
    Ok(())
}

/// Mirror a served counter tree and print every change until interrupted
/// or the server goes away.
pub async fn connect(host: &str, port: u16) -> ScenarioResult<()> {
    let _main_loop = MainLoop::init()?;
    let mirror = Tree::new("counter");
    mirror.subscribe(|change: &Change| {
        if let Change::PropertySet { name, value, .. } = change {
            info!("{} = {}", name, value);
        }
    });

    let endpoint = Endpoint::new(
        &mirror,
        EndpointTarget::socket(host, port),
        UpdateMode::RECEIVE,
        ExecutionContext::main_loop(),
        IpcConfig::default(),
    )?;
    endpoint.connect(ConnectOption::NoOptions).await?;
    info!(host, port, "connected");

    let mut poll = tokio::time::interval(Duration::from_millis(100));
    loop {
        tokio::select! {
            _ = poll.tick() => {
                if !endpoint.is_connected() {
                    info!("server closed the connection");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    MainLoop::flush()?;
    println!("[connect] received {} messages", endpoint.rx_count());
    println!("{}", serde_json::to_string_pretty(&mirror.snapshot())?);
    Ok(())
}
