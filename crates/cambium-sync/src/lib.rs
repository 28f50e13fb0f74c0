//! Cambium Sync - ordered delta replication between execution contexts
//!
//! This crate moves tree mutations from a producer [`Tree`] owned by one
//! execution context to a consumer tree owned by another:
//!
//! - [`context`] - execution contexts: worker threads and the main loop
//! - [`main_loop`] - the process-wide cooperative loop
//! - [`queue`] - `DeltaQueue`, a FIFO of pending deltas for one consumer
//! - [`link`] - `ReplicationLink`, a one-way producer → consumer binding
//! - [`pair`] - `LinkPair`, two opposed links with echo suppression
//! - [`error`] - error types
//!
//! # Delivery model
//!
//! ```text
//! producer.set(..)
//!   -> Change -> codec::encode -> Delta
//!   -> DeltaQueue::enqueue            // never blocks the producer
//!   -> MainLoop::call_async(drain)    // consumer on the main loop
//!    | WorkerContext::notify()        // consumer on a worker thread
//!   -> consumer.apply_delta(..)       // in FIFO order
//! ```
//!
//! A worker thread owns its draining: it loops `wait → drain → wait` and
//! decides whether to drain one delta at a time or everything pending.
//!
//! [`Tree`]: cambium_tree::Tree

pub mod context;
pub mod error;
pub mod link;
pub mod main_loop;
pub mod pair;
pub mod queue;

pub use context::{ExecutionContext, WorkerContext, WorkerHandle};
pub use error::{Result, SyncError};
pub use link::{ReplicationHooks, ReplicationLink};
pub use main_loop::{MainLoop, MainLoopGuard};
pub use pair::{Direction, LinkPair};
pub use queue::DeltaQueue;
