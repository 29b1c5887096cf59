//! Event loops - threads that repeatedly drive their registered handlers
//!
//! Every loop follows the same cycle while it is running:
//! 1. record the loop-start timestamp
//! 2. pick up handlers added since the last pass
//! 3. step every handler once, in registration order
//! 4. reset the pauser if any handler did work, pause it otherwise
//!
//! Lifecycle: created -> started -> stopped -> closed. A stopped loop can be
//! started again and keeps its handlers; a closed loop cannot.

mod blocking;
mod threaded;

pub use blocking::BlockingEventLoop;
pub use threaded::{LoopSettings, ThreadedEventLoop};

use crate::handler::EventHandler;
use crate::Result;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Owned, type-erased handler
pub(crate) type HandlerBox = Box<dyn EventHandler>;

/// Lifecycle and observation contract shared by all loops.
///
/// All methods take `&self`; loops are shared between their owner and the
/// watchdog that observes them.
pub trait EventLoop: Send + Sync {
    /// Loop name (also its thread name)
    fn name(&self) -> &str;

    /// Register a handler. Safe to call while the loop is running; the
    /// handler is stepped from the next pass on.
    fn add_handler(&self, handler: Box<dyn EventHandler>) -> Result<()>;

    /// Spawn the loop thread. No-op if already started.
    fn start(&self) -> Result<()>;

    /// Ask the loop thread to exit after its current pass. Does not
    /// interrupt a handler step.
    fn stop(&self);

    /// Stop and release the thread and all handlers. Idempotent.
    fn close(&self);

    /// Started and not stopped
    fn is_running(&self) -> bool;

    /// Loop thread exists and has not exited
    fn is_alive(&self) -> bool;

    /// Clock reading at the start of the current pass
    fn loop_start_ns(&self) -> u64;

    /// Number of registered handlers, including ones not yet picked up
    fn handler_count(&self) -> usize;

    /// Wake the loop if it is pausing
    fn unpause(&self);

    /// Capture the loop's state and hand it to its diagnostic sink
    fn dump_running_state(&self, message: &str);
}

/// Sentinel for "no handler step in progress"
const NOT_RUNNING: usize = usize::MAX;

/// Lock-free state a loop thread publishes for observers.
///
/// Written only by the loop thread; read from any thread.
#[derive(Debug)]
pub struct Heartbeat {
    loop_start_ns: AtomicU64,
    passes: AtomicU64,
    running: AtomicUsize,
    alive: AtomicBool,
}

impl Heartbeat {
    /// Heartbeat of a loop that has not started
    pub fn new() -> Self {
        Self {
            loop_start_ns: AtomicU64::new(0),
            passes: AtomicU64::new(0),
            running: AtomicUsize::new(NOT_RUNNING),
            alive: AtomicBool::new(false),
        }
    }

    /// Clock reading at the start of the current pass
    pub fn loop_start_ns(&self) -> u64 {
        self.loop_start_ns.load(Ordering::Acquire)
    }

    /// Passes begun since the loop was created
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Index of the handler whose step is executing
    pub fn running_index(&self) -> Option<usize> {
        match self.running.load(Ordering::Acquire) {
            NOT_RUNNING => None,
            index => Some(index),
        }
    }

    /// Loop thread is running its cycle
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Mark the thread alive until the guard drops (including by unwinding)
    pub(crate) fn enter(&self, now_ns: u64) -> AliveGuard<'_> {
        self.loop_start_ns.store(now_ns, Ordering::Release);
        self.alive.store(true, Ordering::Release);
        AliveGuard { heartbeat: self }
    }

    pub(crate) fn begin_pass(&self, now_ns: u64) {
        self.loop_start_ns.store(now_ns, Ordering::Release);
        self.passes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_running(&self, index: Option<usize>) {
        self.running.store(index.unwrap_or(NOT_RUNNING), Ordering::Release);
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

/// Clears the alive flag when the loop thread leaves its cycle
pub(crate) struct AliveGuard<'a> {
    heartbeat: &'a Heartbeat,
}

impl Drop for AliveGuard<'_> {
    fn drop(&mut self) {
        self.heartbeat.set_running(None);
        self.heartbeat.alive.store(false, Ordering::Release);
    }
}

/// Join a thread, giving up after `timeout`.
///
/// Returns the thread's result, or the handle back if it is still running.
pub(crate) fn join_within<T>(
    handle: JoinHandle<T>,
    timeout: Duration,
) -> std::result::Result<thread::Result<T>, JoinHandle<T>> {
    let start = Instant::now();
    loop {
        if handle.is_finished() {
            return Ok(handle.join());
        }
        if start.elapsed() > timeout {
            return Err(handle);
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Drop one registration; a count already cleared by `close()` stays at zero
pub(crate) fn release_registration(registered: &AtomicUsize) {
    let _ = registered.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
}

/// Log the end of a handler's registration
pub(crate) fn log_retired(loop_name: &str, handler_name: &str, err: &crate::HandlerError) {
    match err {
        crate::HandlerError::Retired => {
            log::debug!("{}: handler {} retired", loop_name, handler_name)
        }
        crate::HandlerError::Failed(reason) => {
            log::warn!("{}: handler {} failed and was removed: {}", loop_name, handler_name, reason)
        }
    }
}
