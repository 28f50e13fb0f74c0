//! Execution contexts: where a consumer tree gets updated.

use crate::error::{Result, SyncError};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::debug;
use ulid::Ulid;

/// The context that owns a consumer tree and applies its pending deltas.
#[derive(Clone)]
pub enum ExecutionContext {
    /// The process-wide cooperative loop (see [`crate::MainLoop`]).
    MainLoop,
    /// A dedicated worker thread that drains its own queues.
    Worker(WorkerContext),
}

impl ExecutionContext {
    pub fn main_loop() -> Self {
        ExecutionContext::MainLoop
    }

    pub fn worker(context: &WorkerContext) -> Self {
        ExecutionContext::Worker(context.clone())
    }

    pub fn name(&self) -> String {
        match self {
            ExecutionContext::MainLoop => "main-loop".to_string(),
            ExecutionContext::Worker(worker) => worker.name().to_string(),
        }
    }

    pub fn is_main_loop(&self) -> bool {
        matches!(self, ExecutionContext::MainLoop)
    }
}

impl PartialEq for ExecutionContext {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ExecutionContext::MainLoop, ExecutionContext::MainLoop) => true,
            (ExecutionContext::Worker(a), ExecutionContext::Worker(b)) => a.id() == b.id(),
            _ => false,
        }
    }
}

impl Eq for ExecutionContext {}

impl From<&WorkerContext> for ExecutionContext {
    fn from(context: &WorkerContext) -> Self {
        ExecutionContext::worker(context)
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionContext::MainLoop => write!(f, "MainLoop"),
            ExecutionContext::Worker(worker) => write!(f, "Worker({:?})", worker),
        }
    }
}

struct WorkerInner {
    id: Ulid,
    name: String,
    signalled: Mutex<bool>,
    wakeup: Condvar,
    exit: AtomicBool,
}

/// Wait/notify handle for a worker thread.
///
/// Producers call [`notify`](WorkerContext::notify) when they enqueue work;
/// the worker blocks in [`wait`](WorkerContext::wait) between drains. A
/// notification that arrives while the worker is busy is remembered, so the
/// next `wait` returns immediately.
#[derive(Clone)]
pub struct WorkerContext {
    inner: Arc<WorkerInner>,
}

impl WorkerContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                id: Ulid::new(),
                name: name.into(),
                signalled: Mutex::new(false),
                wakeup: Condvar::new(),
                exit: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> Ulid {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Wake the worker if it is waiting.
    pub fn notify(&self) {
        let mut signalled = self.inner.signalled.lock();
        *signalled = true;
        self.inner.wakeup.notify_one();
    }

    /// Block until notified or until `timeout` elapses (`None` waits forever).
    ///
    /// Returns true if a notification was consumed.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut signalled = self.inner.signalled.lock();
        while !*signalled {
            match deadline {
                Some(deadline) => {
                    if self.inner.wakeup.wait_until(&mut signalled, deadline).timed_out() {
                        break;
                    }
                }
                None => self.inner.wakeup.wait(&mut signalled),
            }
        }
        std::mem::replace(&mut *signalled, false)
    }

    /// Ask the worker to stop and wake it.
    pub fn signal_exit(&self) {
        self.inner.exit.store(true, Ordering::SeqCst);
        self.notify();
    }

    pub fn should_exit(&self) -> bool {
        self.inner.exit.load(Ordering::SeqCst)
    }

    /// Start a named OS thread running `body` with this context.
    pub fn spawn<F>(&self, body: F) -> Result<WorkerHandle>
    where
        F: FnOnce(WorkerContext) + Send + 'static,
    {
        let context = self.clone();
        let thread = std::thread::Builder::new()
            .name(self.inner.name.clone())
            .spawn(move || {
                debug!(worker = %context.name(), "worker started");
                body(context.clone());
                debug!(worker = %context.name(), "worker finished");
            })
            .map_err(|source| SyncError::Spawn {
                name: self.inner.name.clone(),
                source,
            })?;

        Ok(WorkerHandle {
            context: self.clone(),
            thread: Some(thread),
        })
    }
}

impl fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

/// A running worker thread. Dropping the handle asks the worker to exit and
/// joins it.
pub struct WorkerHandle {
    context: WorkerContext,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn context(&self) -> &WorkerContext {
        &self.context
    }

    pub fn signal_exit(&self) {
        self.context.signal_exit();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |thread| thread.is_finished())
    }

    /// Wait for the worker body to return.
    pub fn join(mut self) -> Result<()> {
        self.join_inner()
    }

    fn join_inner(&mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| SyncError::WorkerPanicked(self.context.name().to_string())),
            None => Ok(()),
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.context.signal_exit();
            let _ = self.join_inner();
        }
    }
}
