//! The process-wide cooperative main loop.
//!
//! Consumers that are not bound to a worker thread are drained on this
//! loop. It runs on one dedicated thread and executes queued callbacks one
//! at a time, in submission order, each to completion.
//!
//! The loop is reference counted: [`MainLoop::init`] starts it (or joins the
//! running instance) and returns a [`MainLoopGuard`]; the loop is torn down
//! once the last guard is dropped. Callbacks queued before teardown still
//! run before the thread exits.

use crate::error::{Result, SyncError};
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

const LOOP_THREAD_NAME: &str = "cambium-main-loop";

type Task = Box<dyn FnOnce() + Send + 'static>;

struct LoopState {
    sender: mpsc::UnboundedSender<Task>,
    thread: JoinHandle<()>,
    guards: usize,
}

static LOOP: Mutex<Option<LoopState>> = parking_lot::const_mutex(None);

thread_local! {
    static ON_LOOP_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Namespace for the singleton loop.
pub struct MainLoop;

impl MainLoop {
    /// Start the loop, or register another user of the running loop.
    pub fn init() -> Result<MainLoopGuard> {
        let mut state = LOOP.lock();
        if let Some(running) = state.as_mut() {
            running.guards += 1;
            return Ok(MainLoopGuard { _private: () });
        }

        let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();
        let thread = thread::Builder::new()
            .name(LOOP_THREAD_NAME.to_string())
            .spawn(move || {
                ON_LOOP_THREAD.with(|flag| flag.set(true));
                debug!("main loop started");
                while let Some(task) = receiver.blocking_recv() {
                    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                        error!("main loop callback panicked");
                    }
                }
                debug!("main loop stopped");
            })
            .map_err(|source| SyncError::Spawn {
                name: LOOP_THREAD_NAME.to_string(),
                source,
            })?;

        *state = Some(LoopState {
            sender,
            thread,
            guards: 1,
        });
        Ok(MainLoopGuard { _private: () })
    }

    /// Release a guard obtained from [`MainLoop::init`].
    pub fn teardown(guard: MainLoopGuard) {
        drop(guard);
    }

    pub fn is_running() -> bool {
        LOOP.lock().is_some()
    }

    /// True when called from the loop's own thread.
    pub fn is_current_thread() -> bool {
        ON_LOOP_THREAD.with(|flag| flag.get())
    }

    /// Schedule `task` to run once on the loop. Never blocks.
    pub fn call_async<F>(task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let state = LOOP.lock();
        let running = state.as_ref().ok_or(SyncError::MainLoopNotRunning)?;
        running
            .sender
            .send(Box::new(task))
            .map_err(|_| SyncError::MainLoopNotRunning)
    }

    /// Block until every callback queued before this call has run.
    ///
    /// Returns immediately when called from the loop thread itself.
    pub fn flush() -> Result<()> {
        if Self::is_current_thread() {
            return Ok(());
        }

        let latch = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&latch);
        Self::call_async(move || {
            let (done, cond) = &*signal;
            *done.lock() = true;
            cond.notify_all();
        })?;

        let (done, cond) = &*latch;
        let mut finished = done.lock();
        while !*finished {
            cond.wait(&mut finished);
        }
        Ok(())
    }
}

/// Keeps the main loop alive. Dropping the last guard stops the loop.
#[must_use = "the main loop stops when the last guard is dropped"]
pub struct MainLoopGuard {
    _private: (),
}

impl Drop for MainLoopGuard {
    fn drop(&mut self) {
        let finished = {
            let mut state = LOOP.lock();
            match state.as_mut() {
                Some(running) if running.guards > 1 => {
                    running.guards -= 1;
                    None
                }
                _ => state.take(),
            }
        };

        if let Some(LoopState { sender, thread, .. }) = finished {
            // closing the channel lets the loop finish its backlog and exit
            drop(sender);
            if MainLoop::is_current_thread() {
                return;
            }
            if thread.join().is_err() {
                warn!("main loop thread terminated abnormally");
            }
        }
    }
}
