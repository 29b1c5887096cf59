//! Event loop bound to one dedicated thread.
//!
//! Both the core loop and the monitor loop are `ThreadedEventLoop`s; they
//! differ only in their pauser and in whether idle pauses are capped.

use super::{join_within, log_retired, release_registration, EventLoop, HandlerBox, Heartbeat};
use crate::clock::{Clock, MonotonicClock};
use crate::diagnostics::{DiagnosticSink, LogSink, LoopDump};
use crate::handler::EventHandler;
use crate::pauser::Pauser;
use crate::{Error, Result};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Construction parameters for a [`ThreadedEventLoop`]
#[derive(Clone)]
pub struct LoopSettings {
    /// Loop and thread name
    pub name: String,
    /// Wait strategy between idle passes
    pub pauser: Arc<dyn Pauser>,
    /// Cap applied to every idle pause (`pause_max`), if any
    pub max_pause: Option<Duration>,
    /// Daemon threads are detached by `close()` after `join_timeout`;
    /// non-daemon threads are waited for
    pub daemon: bool,
    /// Bounded wait used by `stop()` (and by `close()` for daemon loops)
    pub join_timeout: Duration,
    /// Time source for loop-start timestamps
    pub clock: Arc<dyn Clock>,
    /// Where state dumps go
    pub sink: Arc<dyn DiagnosticSink>,
}

impl LoopSettings {
    /// Daemon loop with the default clock, sink and join timeout
    pub fn new(name: impl Into<String>, pauser: Arc<dyn Pauser>) -> Self {
        Self {
            name: name.into(),
            pauser,
            max_pause: None,
            daemon: true,
            join_timeout: crate::defaults::JOIN_TIMEOUT,
            clock: Arc::new(MonotonicClock),
            sink: Arc::new(LogSink),
        }
    }

    /// Cap every idle pause at `max`
    pub fn with_max_pause(mut self, max: Duration) -> Self {
        self.max_pause = Some(max);
        self
    }

    /// Choose daemon or non-daemon thread semantics
    pub fn with_daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }

    /// Bounded join timeout
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Diagnostic sink
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }
}

/// State shared between the loop handle and its thread
struct LoopShared {
    name: String,
    pauser: Arc<dyn Pauser>,
    max_pause: Option<Duration>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn DiagnosticSink>,

    heartbeat: Heartbeat,

    /// Started and not stopped; the thread exits when this clears
    running: AtomicBool,
    closed: AtomicBool,

    /// Set once the loop thread has committed to leaving its cycle. Guards
    /// the hand-off between a thread that saw `running` clear and a
    /// `start()` that wants to keep it.
    handoff: Mutex<bool>,

    /// Handlers added but not yet picked up by the thread
    inbox_tx: Sender<HandlerBox>,
    inbox_rx: Receiver<HandlerBox>,

    /// Handlers held while no thread is running
    parked: Mutex<Vec<HandlerBox>>,

    registered: AtomicUsize,

    /// Handler names in run order; written when the set changes
    names: RwLock<Vec<String>>,
}

impl LoopShared {
    fn publish(&self, handlers: &[HandlerBox]) {
        *self.names.write() = handlers.iter().map(|h| h.name().to_string()).collect();
    }

    /// Move newly added handlers into the run list
    fn accept_new(&self, handlers: &mut Vec<HandlerBox>) -> bool {
        let before = handlers.len();
        handlers.extend(self.inbox_rx.try_iter());
        handlers.len() != before
    }

    /// Step every handler once; true if any did work
    fn run_pass(&self, handlers: &mut Vec<HandlerBox>) -> bool {
        let mut busy = false;
        let mut index = 0;

        while index < handlers.len() {
            self.heartbeat.set_running(Some(index));
            match handlers[index].run_once() {
                Ok(did_work) => {
                    busy |= did_work;
                    index += 1;
                }
                Err(err) => {
                    let handler = handlers.remove(index);
                    self.heartbeat.set_running(None);
                    release_registration(&self.registered);
                    self.publish(handlers);
                    log_retired(&self.name, handler.name(), &err);
                }
            }
        }
        self.heartbeat.set_running(None);

        busy
    }

    fn idle(&self) {
        match self.max_pause {
            Some(max) => self.pauser.pause_max(max),
            None => self.pauser.pause(),
        }
    }

    /// Loop thread body
    fn run(self: Arc<Self>) {
        let mut handlers = std::mem::take(&mut *self.parked.lock());
        let _alive = self.heartbeat.enter(self.clock.now_ns());
        let exit = ExitGuard { shared: &self };
        self.publish(&handlers);
        log::info!("{} started with {} handlers", self.name, handlers.len());

        loop {
            while self.running.load(Ordering::Acquire) {
                self.heartbeat.begin_pass(self.clock.now_ns());

                if self.accept_new(&mut handlers) {
                    self.publish(&handlers);
                }

                if self.run_pass(&mut handlers) {
                    self.pauser.reset();
                } else {
                    self.idle();
                }
            }
            if exit.commit() {
                break;
            }
        }

        self.parked.lock().append(&mut handlers);
        log::info!("{} exiting", self.name);
    }

    /// Keep the thread left by a timed-out stop as the loop thread. False
    /// if it has already committed to exiting.
    fn resume(&self) -> bool {
        let exited = self.handoff.lock();
        if *exited {
            return false;
        }
        self.running.store(true, Ordering::Release);
        true
    }

    /// Forget the handlers a panicked thread took down with it
    fn forget_lost_handlers(&self) {
        self.registered.store(self.inbox_rx.len(), Ordering::Release);
        self.names.write().clear();
    }

    /// Drop every handler and forget them
    fn discard_handlers(&self) {
        self.parked.lock().clear();
        while self.inbox_rx.try_recv().is_ok() {}
        self.registered.store(0, Ordering::Release);
        self.names.write().clear();
    }
}

/// Decides, under the hand-off lock, when the loop thread leaves its cycle.
///
/// Dropped by unwinding (a handler panicked), it clears `running` so the
/// next `start()` spawns a fresh thread.
struct ExitGuard<'a> {
    shared: &'a LoopShared,
}

impl ExitGuard<'_> {
    /// Commit to exiting unless `start()` set `running` again meanwhile
    fn commit(&self) -> bool {
        let mut exited = self.shared.handoff.lock();
        if self.shared.running.load(Ordering::Acquire) {
            return false;
        }
        *exited = true;
        true
    }
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        let mut exited = self.shared.handoff.lock();
        if !*exited {
            *exited = true;
            self.shared.running.store(false, Ordering::Release);
        }
    }
}

/// Loop control held by the owner side
struct Control {
    /// Loop thread; kept after a timed-out stop so close() can wait again
    handle: Option<JoinHandle<()>>,
}

/// Event loop running on one dedicated thread.
///
/// Loop-start timestamp, alive flag and pass count are published lock-free
/// through a [`Heartbeat`]. Handlers are handed to the thread over a channel
/// it drains at the start of every pass.
pub struct ThreadedEventLoop {
    shared: Arc<LoopShared>,
    daemon: bool,
    join_timeout: Duration,
    control: Mutex<Control>,
}

impl ThreadedEventLoop {
    /// Create a loop (not yet started)
    pub fn new(settings: LoopSettings) -> Self {
        let (inbox_tx, inbox_rx) = channel::unbounded();

        Self {
            shared: Arc::new(LoopShared {
                name: settings.name,
                pauser: settings.pauser,
                max_pause: settings.max_pause,
                clock: settings.clock,
                sink: settings.sink,
                heartbeat: Heartbeat::new(),
                running: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                handoff: Mutex::new(false),
                inbox_tx,
                inbox_rx,
                parked: Mutex::new(Vec::new()),
                registered: AtomicUsize::new(0),
                names: RwLock::new(Vec::new()),
            }),
            daemon: settings.daemon,
            join_timeout: settings.join_timeout,
            control: Mutex::new(Control { handle: None }),
        }
    }

    /// Published state of the loop thread
    pub fn heartbeat(&self) -> &Heartbeat {
        &self.shared.heartbeat
    }

    /// Names of the handlers the thread has picked up, in run order
    pub fn handler_names(&self) -> Vec<String> {
        self.shared.names.read().clone()
    }

    /// Whether `close()` detaches a stuck thread
    pub fn is_daemon(&self) -> bool {
        self.daemon
    }

    /// Whether `close()` has been called
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Record the result of a joined loop thread
    fn finish(&self, joined: thread::Result<()>) {
        if joined.is_err() {
            log::error!("{} thread panicked; its handlers were lost", self.shared.name);
            self.shared.forget_lost_handlers();
        }
    }
}

impl EventLoop for ThreadedEventLoop {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn add_handler(&self, handler: Box<dyn EventHandler>) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed(self.shared.name.clone()));
        }

        self.shared.registered.fetch_add(1, Ordering::AcqRel);
        if self.shared.inbox_tx.send(handler).is_err() {
            release_registration(&self.shared.registered);
            return Err(Error::Closed(self.shared.name.clone()));
        }
        if self.shared.closed.load(Ordering::SeqCst) {
            // close() may have drained the inbox before this send landed
            self.shared.discard_handlers();
            return Err(Error::Closed(self.shared.name.clone()));
        }
        self.shared.pauser.unpause();

        Ok(())
    }

    fn start(&self) -> Result<()> {
        let mut control = self.control.lock();

        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed(self.shared.name.clone()));
        }
        if self.shared.running.load(Ordering::Acquire) {
            return Ok(());
        }

        if let Some(handle) = control.handle.take() {
            if self.shared.resume() {
                control.handle = Some(handle);
                log::info!("{} resumed on its previous thread", self.shared.name);
                return Ok(());
            }
            // Committed to exiting: only its tail is left to run
            self.finish(handle.join());
        }

        *self.shared.handoff.lock() = false;
        self.shared.running.store(true, Ordering::Release);
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(self.shared.name.clone())
            .spawn(move || shared.run());

        match spawned {
            Ok(handle) => {
                control.handle = Some(handle);
                Ok(())
            }
            Err(source) => {
                self.shared.running.store(false, Ordering::Release);
                Err(Error::Spawn {
                    name: self.shared.name.clone(),
                    source,
                })
            }
        }
    }

    fn stop(&self) {
        let mut control = self.control.lock();

        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.pauser.unpause();

        if let Some(handle) = control.handle.take() {
            match join_within(handle, self.join_timeout) {
                Ok(joined) => self.finish(joined),
                Err(handle) => {
                    log::warn!(
                        "{} did not stop within {:?}; a handler step is still running",
                        self.shared.name,
                        self.join_timeout
                    );
                    control.handle = Some(handle);
                }
            }
        }
    }

    fn close(&self) {
        self.stop();

        let mut control = self.control.lock();
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = control.handle.take() {
            if self.daemon {
                match join_within(handle, self.join_timeout) {
                    Ok(joined) => self.finish(joined),
                    Err(_) => log::warn!("{} detached while still running", self.shared.name),
                }
            } else {
                self.finish(handle.join());
            }
        }

        self.shared.discard_handlers();
        log::info!("{} closed", self.shared.name);
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    fn is_alive(&self) -> bool {
        self.shared.heartbeat.is_alive()
    }

    fn loop_start_ns(&self) -> u64 {
        self.shared.heartbeat.loop_start_ns()
    }

    fn handler_count(&self) -> usize {
        self.shared.registered.load(Ordering::Acquire)
    }

    fn unpause(&self) {
        self.shared.pauser.unpause();
    }

    fn dump_running_state(&self, message: &str) {
        let heartbeat = &self.shared.heartbeat;
        let handlers = self.handler_names();
        let running_handler = heartbeat
            .running_index()
            .and_then(|index| handlers.get(index).cloned());
        let in_pass_for = self
            .shared
            .clock
            .now_ns()
            .saturating_sub(heartbeat.loop_start_ns());

        let dump = LoopDump {
            loop_name: self.shared.name.clone(),
            thread_name: self.shared.name.clone(),
            message: message.to_string(),
            alive: heartbeat.is_alive(),
            passes: heartbeat.passes(),
            running_handler,
            handlers,
            in_pass_for: Duration::from_nanos(in_pass_for),
        };
        self.shared.sink.report(&dump);
    }
}

impl Drop for ThreadedEventLoop {
    fn drop(&mut self) {
        self.close();
    }
}
