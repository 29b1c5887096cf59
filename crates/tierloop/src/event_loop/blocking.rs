//! Event loop for handlers whose steps may block.
//!
//! Each handler gets its own worker thread, so a step that blocks for
//! seconds only holds up itself. Workers are stopped only by the loop's own
//! `stop()`/`close()`; an [`EventGroup`](crate::EventGroup) leaves them
//! running on `stop()` and tears them down on `close()`.

use super::{join_within, log_retired, release_registration, EventLoop, HandlerBox, Heartbeat};
use crate::clock::Clock;
use crate::config::PauserConfig;
use crate::diagnostics::{DiagnosticSink, LoopDump};
use crate::handler::EventHandler;
use crate::pauser::Pauser;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Run flag of one worker and the hand-off that decides when it leaves.
///
/// `start()` may keep a worker left over from a timed-out `stop()` only
/// while the worker has not committed to exiting; both sides decide under
/// `exited`.
struct WorkerLink {
    running: AtomicBool,
    exited: Mutex<bool>,
    /// Handler returned an error and was dropped
    retired: AtomicBool,
}

impl WorkerLink {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            exited: Mutex::new(false),
            retired: AtomicBool::new(false),
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Set `running` again; false if the worker has committed to exiting
    fn resume(&self) -> bool {
        let exited = self.exited.lock();
        if *exited {
            return false;
        }
        self.running.store(true, Ordering::Release);
        true
    }

    /// Commit to exiting unless `running` was set again meanwhile
    fn commit_exit(&self) -> bool {
        let mut exited = self.exited.lock();
        if self.running.load(Ordering::Acquire) {
            return false;
        }
        *exited = true;
        true
    }

    fn mark_exited(&self) {
        let mut exited = self.exited.lock();
        if !*exited {
            *exited = true;
            self.running.store(false, Ordering::Release);
        }
    }
}

/// One handler and the thread driving it
struct BlockingWorker {
    thread_name: String,
    handler_name: String,
    heartbeat: Arc<Heartbeat>,
    link: Arc<WorkerLink>,
    pauser: Arc<dyn Pauser>,
    /// Holds the handler while the thread is not running it
    slot: Arc<Mutex<Option<HandlerBox>>>,
    handle: Option<JoinHandle<()>>,
}

impl BlockingWorker {
    fn signal_stop(&self) {
        self.link.running.store(false, Ordering::Release);
        self.pauser.unpause();
    }

    fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

/// State moved onto a worker thread
struct WorkerThread {
    name: String,
    slot: Arc<Mutex<Option<HandlerBox>>>,
    heartbeat: Arc<Heartbeat>,
    link: Arc<WorkerLink>,
    pauser: Arc<dyn Pauser>,
    clock: Arc<dyn Clock>,
    registered: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
}

impl WorkerThread {
    /// Step one handler until stopped or retired
    fn run(self) {
        let _exit = WorkerExit {
            link: &self.link,
            live: &self.live,
        };
        let Some(mut handler) = self.slot.lock().take() else {
            return;
        };
        let _alive = self.heartbeat.enter(self.clock.now_ns());

        loop {
            while self.link.is_running() {
                self.heartbeat.begin_pass(self.clock.now_ns());
                self.heartbeat.set_running(Some(0));
                let step = handler.run_once();
                self.heartbeat.set_running(None);

                match step {
                    Ok(true) => self.pauser.reset(),
                    Ok(false) => self.pauser.pause(),
                    Err(err) => {
                        self.link.retired.store(true, Ordering::Release);
                        release_registration(&self.registered);
                        log_retired(&self.name, handler.name(), &err);
                        return;
                    }
                }
            }
            if self.link.commit_exit() {
                break;
            }
        }

        *self.slot.lock() = Some(handler);
    }
}

/// Marks the worker exited and drops it from the live count, also when a
/// handler panics
struct WorkerExit<'a> {
    link: &'a WorkerLink,
    live: &'a AtomicUsize,
}

impl Drop for WorkerExit<'_> {
    fn drop(&mut self) {
        self.link.mark_exited();
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

struct BlockingState {
    workers: Vec<BlockingWorker>,
    /// Handlers waiting for `start()`
    parked: VecDeque<HandlerBox>,
}

/// Loop that dedicates a thread to every handler.
///
/// `is_alive` reads a live-worker counter and `loop_start_ns` a heartbeat
/// list republished whenever the worker set changes, so neither waits on
/// `stop()` or `close()` joining workers.
pub struct BlockingEventLoop {
    name: String,
    pauser: PauserConfig,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn DiagnosticSink>,
    join_timeout: Duration,

    running: AtomicBool,
    closed: AtomicBool,
    next_worker: AtomicUsize,
    registered: Arc<AtomicUsize>,
    /// Worker threads spawned and not yet returned
    live: Arc<AtomicUsize>,
    heartbeats: RwLock<Vec<Arc<Heartbeat>>>,

    /// Serializes start, stop and close
    lifecycle: Mutex<()>,
    state: Mutex<BlockingState>,
}

impl BlockingEventLoop {
    /// Create a loop (not yet started); every worker gets a pauser built
    /// from `pauser`
    pub fn new(
        name: impl Into<String>,
        pauser: PauserConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn DiagnosticSink>,
        join_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            pauser,
            clock,
            sink,
            join_timeout,
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            next_worker: AtomicUsize::new(0),
            registered: Arc::new(AtomicUsize::new(0)),
            live: Arc::new(AtomicUsize::new(0)),
            heartbeats: RwLock::new(Vec::new()),
            lifecycle: Mutex::new(()),
            state: Mutex::new(BlockingState {
                workers: Vec::new(),
                parked: VecDeque::new(),
            }),
        }
    }

    /// Number of worker threads currently alive
    pub fn alive_workers(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    fn publish(&self, state: &BlockingState) {
        *self.heartbeats.write() = state.workers.iter().map(|w| w.heartbeat.clone()).collect();
    }

    fn spawn_worker(&self, state: &mut BlockingState, handler: HandlerBox) -> Result<()> {
        let id = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let thread_name = format!("{}-{}", self.name, id);

        let body = WorkerThread {
            name: thread_name.clone(),
            slot: Arc::new(Mutex::new(None)),
            heartbeat: Arc::new(Heartbeat::new()),
            link: Arc::new(WorkerLink::new()),
            pauser: self.pauser.build(),
            clock: self.clock.clone(),
            registered: self.registered.clone(),
            live: self.live.clone(),
        };
        let mut worker = BlockingWorker {
            thread_name: thread_name.clone(),
            handler_name: handler.name().to_string(),
            heartbeat: body.heartbeat.clone(),
            link: body.link.clone(),
            pauser: body.pauser.clone(),
            slot: body.slot.clone(),
            handle: None,
        };
        *worker.slot.lock() = Some(handler);

        self.live.fetch_add(1, Ordering::AcqRel);
        match thread::Builder::new().name(thread_name.clone()).spawn(move || body.run()) {
            Ok(handle) => {
                worker.handle = Some(handle);
                state.workers.push(worker);
                Ok(())
            }
            Err(source) => {
                self.live.fetch_sub(1, Ordering::AcqRel);
                if let Some(handler) = worker.slot.lock().take() {
                    state.parked.push_back(handler);
                }
                Err(Error::Spawn {
                    name: thread_name,
                    source,
                })
            }
        }
    }

    /// Take back the handler of a joined worker
    fn reclaim(&self, worker: &BlockingWorker, joined: thread::Result<()>) -> Option<HandlerBox> {
        if joined.is_err() {
            log::error!("{} panicked; its handler was lost", worker.thread_name);
            release_registration(&self.registered);
        }
        worker.slot.lock().take()
    }

    /// Join finished workers and park the handlers they gave back
    fn reap(&self, state: &mut BlockingState) {
        let before = state.workers.len();
        for mut worker in std::mem::take(&mut state.workers) {
            if !worker.is_finished() {
                state.workers.push(worker);
                continue;
            }
            let joined = worker.handle.take().map_or(Ok(()), JoinHandle::join);
            state.parked.extend(self.reclaim(&worker, joined));
        }
        if state.workers.len() != before {
            self.publish(state);
        }
    }
}

impl EventLoop for BlockingEventLoop {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_handler(&self, handler: Box<dyn EventHandler>) -> Result<()> {
        let mut state = self.state.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed(self.name.clone()));
        }

        self.reap(&mut state);
        self.registered.fetch_add(1, Ordering::AcqRel);
        if self.running.load(Ordering::Acquire) {
            let spawned = self.spawn_worker(&mut state, handler);
            self.publish(&state);
            spawned
        } else {
            state.parked.push_back(handler);
            Ok(())
        }
    }

    fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        let mut state = self.state.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed(self.name.clone()));
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // A worker left by a timed-out stop keeps its thread unless it has
        // already committed to exiting
        let mut pending = VecDeque::new();
        for mut worker in std::mem::take(&mut state.workers) {
            if !worker.is_finished() && worker.link.resume() {
                state.workers.push(worker);
                continue;
            }
            let joined = worker.handle.take().map_or(Ok(()), JoinHandle::join);
            pending.extend(self.reclaim(&worker, joined));
        }
        pending.append(&mut state.parked);

        while let Some(handler) = pending.pop_front() {
            if let Err(err) = self.spawn_worker(&mut state, handler) {
                state.parked.extend(pending);
                self.publish(&state);
                return Err(err);
            }
        }
        self.publish(&state);
        log::info!("{} started with {} workers", self.name, state.workers.len());

        Ok(())
    }

    fn stop(&self) {
        let _lifecycle = self.lifecycle.lock();
        let workers = {
            let mut state = self.state.lock();
            if !self.running.swap(false, Ordering::AcqRel) {
                return;
            }
            for worker in &state.workers {
                worker.signal_stop();
            }
            std::mem::take(&mut state.workers)
        };

        // Joined without holding the state lock
        let mut stragglers = Vec::new();
        let mut reclaimed = Vec::new();
        for mut worker in workers {
            let Some(handle) = worker.handle.take() else {
                continue;
            };
            match join_within(handle, self.join_timeout) {
                Ok(joined) => reclaimed.extend(self.reclaim(&worker, joined)),
                Err(handle) => {
                    log::warn!(
                        "{} did not stop within {:?}; handler {} is still running",
                        worker.thread_name,
                        self.join_timeout,
                        worker.handler_name
                    );
                    worker.handle = Some(handle);
                    stragglers.push(worker);
                }
            }
        }

        let mut state = self.state.lock();
        state.workers.append(&mut stragglers);
        for handler in reclaimed.into_iter().rev() {
            state.parked.push_front(handler);
        }
        self.publish(&state);
        log::info!("{} stopped", self.name);
    }

    fn close(&self) {
        self.stop();

        let _lifecycle = self.lifecycle.lock();
        let workers = {
            let mut state = self.state.lock();
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            self.running.store(false, Ordering::Release);
            state.parked.clear();
            self.registered.store(0, Ordering::Release);
            std::mem::take(&mut state.workers)
        };

        for mut worker in workers {
            worker.signal_stop();
            if let Some(handle) = worker.handle.take() {
                if join_within(handle, self.join_timeout).is_err() {
                    log::warn!("{} detached while still running", worker.thread_name);
                }
            }
        }
        self.heartbeats.write().clear();
        log::info!("{} closed", self.name);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn is_alive(&self) -> bool {
        self.alive_workers() > 0
    }

    /// Start of the oldest step in progress across workers
    fn loop_start_ns(&self) -> u64 {
        self.heartbeats
            .read()
            .iter()
            .filter(|h| h.is_alive())
            .map(|h| h.loop_start_ns())
            .min()
            .unwrap_or_else(|| self.clock.now_ns())
    }

    fn handler_count(&self) -> usize {
        self.registered.load(Ordering::Acquire)
    }

    fn unpause(&self) {
        for worker in &self.state.lock().workers {
            worker.pauser.unpause();
        }
    }

    /// Dumps the worker whose current step has been running longest
    fn dump_running_state(&self, message: &str) {
        let mut state = self.state.lock();
        self.reap(&mut state);

        let now = self.clock.now_ns();
        let handlers: Vec<String> = state
            .workers
            .iter()
            .filter(|w| !w.link.is_retired())
            .map(|w| w.handler_name.clone())
            .chain(state.parked.iter().map(|h| h.name().to_string()))
            .collect();

        let stalled = state
            .workers
            .iter()
            .filter(|w| w.heartbeat.is_alive())
            .min_by_key(|w| w.heartbeat.loop_start_ns());

        let dump = match stalled {
            Some(worker) => {
                let started = worker.heartbeat.loop_start_ns();
                LoopDump {
                    loop_name: self.name.clone(),
                    thread_name: worker.thread_name.clone(),
                    message: message.to_string(),
                    alive: true,
                    passes: worker.heartbeat.passes(),
                    running_handler: worker
                        .heartbeat
                        .running_index()
                        .map(|_| worker.handler_name.clone()),
                    handlers,
                    in_pass_for: Duration::from_nanos(now.saturating_sub(started)),
                }
            }
            None => LoopDump {
                loop_name: self.name.clone(),
                thread_name: self.name.clone(),
                message: message.to_string(),
                alive: false,
                passes: 0,
                running_handler: None,
                handlers,
                in_pass_for: Duration::ZERO,
            },
        };
        drop(state);

        self.sink.report(&dump);
    }
}

impl Drop for BlockingEventLoop {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::diagnostics::{CollectingSink, LogSink};
    use crate::handler::{handler_fn, HandlerError};
    use std::sync::atomic::AtomicU64;
    use std::time::Instant;

    fn blocking_loop(sink: Arc<dyn DiagnosticSink>) -> BlockingEventLoop {
        BlockingEventLoop::new(
            "blocking-test",
            PauserConfig::adaptive(Duration::ZERO, Duration::from_millis(1)),
            Arc::new(MonotonicClock),
            sink,
            Duration::from_millis(500),
        )
    }

    #[test]
    fn test_each_handler_gets_a_thread() {
        let event_loop = blocking_loop(Arc::new(LogSink));
        let counters: Vec<_> = (0..3).map(|_| Arc::new(AtomicU64::new(0))).collect();

        for counter in &counters {
            let counter = counter.clone();
            event_loop
                .add_handler(Box::new(handler_fn("reader", None, move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                    thread::sleep(Duration::from_millis(5));
                    Ok(true)
                })))
                .unwrap();
        }
        assert_eq!(event_loop.handler_count(), 3);
        assert_eq!(event_loop.alive_workers(), 0);

        event_loop.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(event_loop.alive_workers(), 3);
        assert!(event_loop.is_alive());
        for counter in &counters {
            assert!(counter.load(Ordering::Relaxed) > 0);
        }

        event_loop.stop();
        assert!(!event_loop.is_alive());
        assert_eq!(event_loop.handler_count(), 3);
    }

    #[test]
    fn test_blocked_handler_does_not_stall_others() {
        let event_loop = blocking_loop(Arc::new(LogSink));
        let counter = Arc::new(AtomicU64::new(0));

        event_loop
            .add_handler(Box::new(handler_fn("stuck", None, || {
                thread::sleep(Duration::from_millis(200));
                Ok(false)
            })))
            .unwrap();
        {
            let counter = counter.clone();
            event_loop
                .add_handler(Box::new(handler_fn("fast", None, move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Ok(true)
                })))
                .unwrap();
        }

        event_loop.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(counter.load(Ordering::Relaxed) > 100);
        event_loop.close();
    }

    #[test]
    fn test_add_while_running_spawns_worker() {
        let event_loop = blocking_loop(Arc::new(LogSink));
        event_loop.start().unwrap();
        assert_eq!(event_loop.alive_workers(), 0);

        event_loop
            .add_handler(Box::new(handler_fn("late", None, || Ok(false))))
            .unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(event_loop.alive_workers(), 1);
        event_loop.close();
        assert_eq!(event_loop.alive_workers(), 0);
    }

    #[test]
    fn test_retired_handler_releases_worker() {
        let event_loop = blocking_loop(Arc::new(LogSink));
        let mut steps = 0;
        event_loop
            .add_handler(Box::new(handler_fn("one-shot", None, move || {
                steps += 1;
                if steps > 2 {
                    Err(HandlerError::Retired)
                } else {
                    Ok(true)
                }
            })))
            .unwrap();

        event_loop.start().unwrap();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(event_loop.handler_count(), 0);
        assert_eq!(event_loop.alive_workers(), 0);
        event_loop.close();
    }

    #[test]
    fn test_dump_names_stalled_worker() {
        let sink = Arc::new(CollectingSink::new());
        let event_loop = blocking_loop(sink.clone());
        event_loop
            .add_handler(Box::new(handler_fn("file-read", None, || {
                thread::sleep(Duration::from_millis(100));
                Ok(false)
            })))
            .unwrap();

        event_loop.start().unwrap();
        thread::sleep(Duration::from_millis(30));
        event_loop.dump_running_state("blocking worker is slow");
        event_loop.close();

        let dumps = sink.dumps();
        assert_eq!(dumps.len(), 1);
        assert_eq!(dumps[0].thread_name, "blocking-test-0");
        assert_eq!(dumps[0].running_handler.as_deref(), Some("file-read"));
        assert!(dumps[0].alive);
    }

    #[test]
    fn test_retired_workers_are_reaped() {
        let sink = Arc::new(CollectingSink::new());
        let event_loop = blocking_loop(sink.clone());
        event_loop.start().unwrap();

        for _ in 0..50 {
            event_loop
                .add_handler(Box::new(handler_fn("one-shot", None, || Err(HandlerError::Retired))))
                .unwrap();
        }
        thread::sleep(Duration::from_millis(100));
        event_loop.dump_running_state("after retirements");

        assert_eq!(event_loop.handler_count(), 0);
        assert_eq!(event_loop.alive_workers(), 0);
        assert!(event_loop.state.lock().workers.is_empty());
        let dumps = sink.dumps();
        assert_eq!(dumps.len(), 1);
        assert!(dumps[0].handlers.is_empty());
        event_loop.close();
    }

    #[test]
    fn test_observers_not_held_up_by_stop() {
        let event_loop = Arc::new(BlockingEventLoop::new(
            "blocking-test",
            PauserConfig::adaptive(Duration::ZERO, Duration::from_millis(1)),
            Arc::new(MonotonicClock),
            Arc::new(LogSink),
            Duration::from_millis(300),
        ));
        event_loop
            .add_handler(Box::new(handler_fn("slow-read", None, || {
                thread::sleep(Duration::from_millis(600));
                Ok(false)
            })))
            .unwrap();
        event_loop.start().unwrap();
        thread::sleep(Duration::from_millis(20));

        let stopper = {
            let event_loop = event_loop.clone();
            thread::spawn(move || event_loop.stop())
        };
        thread::sleep(Duration::from_millis(20));

        let began = Instant::now();
        let _ = event_loop.loop_start_ns();
        assert!(event_loop.is_alive());
        assert!(began.elapsed() < Duration::from_millis(100), "observers waited {:?}", began.elapsed());

        stopper.join().unwrap();
        event_loop.close();
    }

    #[test]
    fn test_start_after_timed_out_stop_keeps_workers_driven() {
        let event_loop = BlockingEventLoop::new(
            "blocking-test",
            PauserConfig::adaptive(Duration::ZERO, Duration::from_millis(1)),
            Arc::new(MonotonicClock),
            Arc::new(LogSink),
            Duration::from_millis(20),
        );
        let steps = Arc::new(AtomicU64::new(0));
        {
            let steps = steps.clone();
            event_loop
                .add_handler(Box::new(handler_fn("slow-read", None, move || {
                    steps.fetch_add(1, Ordering::Relaxed);
                    thread::sleep(Duration::from_millis(50));
                    Ok(true)
                })))
                .unwrap();
        }

        event_loop.start().unwrap();
        thread::sleep(Duration::from_millis(10));

        // Restart while the worker is still inside its step
        event_loop.stop();
        event_loop.start().unwrap();
        let before = steps.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(200));
        assert!(event_loop.is_running());
        assert_eq!(event_loop.alive_workers(), 1);
        assert!(steps.load(Ordering::Relaxed) > before);

        // Restart after the worker has returned its handler
        event_loop.stop();
        thread::sleep(Duration::from_millis(100));
        assert!(!event_loop.is_alive());
        event_loop.start().unwrap();
        let before = steps.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(200));
        assert_eq!(event_loop.alive_workers(), 1);
        assert!(steps.load(Ordering::Relaxed) > before);
        assert_eq!(event_loop.handler_count(), 1);

        event_loop.close();
    }

    #[test]
    fn test_add_racing_close_leaves_nothing_registered() {
        let event_loop = Arc::new(blocking_loop(Arc::new(LogSink)));

        let adders: Vec<_> = (0..4)
            .map(|_| {
                let event_loop = event_loop.clone();
                thread::spawn(move || {
                    while event_loop
                        .add_handler(Box::new(handler_fn("late", None, || Ok(false))))
                        .is_ok()
                    {}
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(10));
        event_loop.close();
        for adder in adders {
            adder.join().unwrap();
        }

        assert_eq!(event_loop.handler_count(), 0);
    }

    #[test]
    fn test_closed_rejects_handlers() {
        let event_loop = blocking_loop(Arc::new(LogSink));
        event_loop.close();
        assert!(matches!(
            event_loop.add_handler(Box::new(handler_fn("late", None, || Ok(false)))),
            Err(Error::Closed(_))
        ));
        assert!(matches!(event_loop.start(), Err(Error::Closed(_))));
    }
}
