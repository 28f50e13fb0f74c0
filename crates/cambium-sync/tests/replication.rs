//! Cross-thread replication scenarios.
//!
//! These tests run producers and consumers on real threads: a worker that
//! loops wait → drain → wait, and the shared main loop.

use cambium_sync::{
    Direction, ExecutionContext, LinkPair, MainLoop, ReplicationLink, WorkerContext,
};
use cambium_tree::{Node, Tree};
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_millis(20);
const DEADLINE: Duration = Duration::from_secs(20);

// ============================================================================
// One-way
// ============================================================================

#[test]
fn test_one_way_worker_receives_every_update() {
    const UPDATES: i64 = 100;

    let producer = Tree::from_node(Node::new("state").with_property("x", 0));
    let consumer = Tree::from_node(Node::new("state").with_property("x", 0));
    let worker = WorkerContext::new("one-way");
    let link = Arc::new(
        ReplicationLink::new(&producer, &consumer, ExecutionContext::worker(&worker)).unwrap(),
    );

    let thread_link = Arc::clone(&link);
    let thread_consumer = consumer.clone();
    let handle = worker
        .spawn(move |ctx| {
            let started = Instant::now();
            while !ctx.should_exit() && started.elapsed() < DEADLINE {
                ctx.wait(Some(WAIT));
                thread_link.drain_all();
                if thread_consumer.get_as::<i64>("x") == Some(UPDATES) {
                    break;
                }
            }
        })
        .unwrap();

    for i in 1..=UPDATES {
        producer.set("x", i);
    }
    handle.join().unwrap();

    assert_eq!(consumer.get_as::<i64>("x"), Some(UPDATES));
    assert_eq!(link.applied_count(), UPDATES as u64);
    assert_eq!(link.pending_count(), 0);
}

#[test]
fn test_one_way_main_loop_consumer() {
    let _guard = MainLoop::init().unwrap();

    let producer = Tree::new("state");
    let consumer = Tree::new("state");
    let link = ReplicationLink::new(&producer, &consumer, ExecutionContext::main_loop()).unwrap();

    let track = producer.add_child(&[], Node::new("track")).unwrap();
    for i in 0..50 {
        producer.set_at(&[track], "gain", i).unwrap();
    }
    MainLoop::flush().unwrap();

    assert_eq!(link.pending_count(), 0);
    assert_eq!(link.applied_count(), 51);
    assert_eq!(consumer.snapshot(), producer.snapshot());
}

#[test]
fn test_link_dropped_before_main_loop_drain() {
    let _guard = MainLoop::init().unwrap();

    let producer = Tree::new("state");
    let consumer = Tree::new("state");

    // hold the loop so the drain callback cannot run before the link is gone
    let gate = Arc::new(parking_lot::Mutex::new(()));
    let held = gate.lock();
    let loop_gate = Arc::clone(&gate);
    MainLoop::call_async(move || drop(loop_gate.lock())).unwrap();

    let link = ReplicationLink::new(&producer, &consumer, ExecutionContext::main_loop()).unwrap();
    producer.set("x", 1);
    drop(link);
    drop(held);
    MainLoop::flush().unwrap();

    assert_eq!(consumer.get("x"), None);
}

// ============================================================================
// Two-way cascade
// ============================================================================

/// Each side waits for the other's value to arrive, then answers with that
/// value plus one. A side stops once it has received a value above `limit`.
fn cascade_worker(
    pair: Arc<LinkPair>,
    tree: Tree,
    limit: i64,
) -> impl FnOnce(WorkerContext) + Send + 'static {
    move |ctx| {
        let context = ExecutionContext::worker(&ctx);
        let mut last = tree.get_as::<i64>("value").unwrap_or(0);
        let started = Instant::now();
        while !ctx.should_exit() && started.elapsed() < DEADLINE {
            ctx.wait(Some(WAIT));
            pair.perform_all_updates(&context).unwrap();

            let received = tree.get_as::<i64>("value").unwrap_or(0);
            if received != last {
                assert!(received > last, "cascade must be monotonic");
                last = received + 1;
                tree.set("value", last);
                if received > limit {
                    break;
                }
            }
        }
    }
}

#[test]
fn test_two_way_cascade_terminates() {
    let left = Tree::from_node(Node::new("state").with_property("value", 0));
    let right = Tree::from_node(Node::new("state").with_property("value", 0));
    let left_worker = WorkerContext::new("left");
    let right_worker = WorkerContext::new("right");

    let pair = Arc::new(
        LinkPair::new(
            &left,
            ExecutionContext::worker(&left_worker),
            &right,
            ExecutionContext::worker(&right_worker),
        )
        .unwrap(),
    );

    // kick off the cascade before either worker runs
    left.set("value", 1);

    let right_handle = right_worker
        .spawn(cascade_worker(Arc::clone(&pair), right.clone(), 100))
        .unwrap();
    let left_handle = left_worker
        .spawn(cascade_worker(Arc::clone(&pair), left.clone(), 100))
        .unwrap();

    right_handle.join().unwrap();
    left_handle.join().unwrap();

    assert_eq!(left.get_as::<i64>("value"), Some(103));
    assert_eq!(right.get_as::<i64>("value"), Some(102));
    // the final 103 was sent but never applied: the right worker had exited
    assert_eq!(pair.link(Direction::AToB).pending_count(), 1);
    assert!(pair.suppressed_count() >= 100);
}

#[test]
fn test_pair_with_main_loop_side() {
    let _guard = MainLoop::init().unwrap();

    let ui = Tree::new("ui");
    let engine = Tree::new("engine");
    let worker = WorkerContext::new("engine");
    let engine_ctx = ExecutionContext::worker(&worker);
    let pair = LinkPair::new(&ui, ExecutionContext::main_loop(), &engine, engine_ctx.clone())
        .unwrap();

    engine.set("meter", 0.5);
    MainLoop::flush().unwrap();
    assert_eq!(ui.get_as::<f64>("meter"), Some(0.5));

    // the UI applying meter=0.5 must not bounce it back to the engine
    assert_eq!(pair.pending_count(&engine_ctx).unwrap(), 0);

    ui.set("gain", 3);
    assert_eq!(pair.perform_all_updates(&engine_ctx).unwrap(), 1);
    assert_eq!(engine.get_as::<i64>("gain"), Some(3));
}
