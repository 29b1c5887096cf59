//! Event group - one core, one monitor and one blocking loop behind a single
//! handle.
//!
//! Handlers are routed to a loop by their [`HandlerPriority`]. The group
//! also installs a [`StallWatchdog`] into the monitor loop that watches the
//! core loop.

use crate::clock::{Clock, MonotonicClock};
use crate::config::EventGroupConfig;
use crate::defaults;
use crate::diagnostics::{debug_probe, DebugProbe, DiagnosticSink, LogSink};
use crate::event_loop::{BlockingEventLoop, EventLoop, LoopSettings, ThreadedEventLoop};
use crate::handler::{EventHandler, HandlerPriority};
use crate::watchdog::StallWatchdog;
use crate::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Which of the group's loops runs a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopKind {
    /// Latency-critical loop
    Core,
    /// Low-frequency loop hosting the watchdog
    Monitor,
    /// Thread-per-handler loop for blocking steps
    Blocking,
}

/// Priority to loop lookup table
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "BTreeMap<String, LoopKind>")]
pub struct RoutingTable {
    slots: [Option<LoopKind>; HandlerPriority::COUNT],
}

impl RoutingTable {
    /// Table with no routes
    pub fn new() -> Self {
        Self {
            slots: [None; HandlerPriority::COUNT],
        }
    }

    /// HIGH, MEDIUM, TIMER and DAEMON to core; MONITOR to monitor;
    /// BLOCKING to blocking
    pub fn standard() -> Self {
        Self::new()
            .with_route(HandlerPriority::High, LoopKind::Core)
            .with_route(HandlerPriority::Medium, LoopKind::Core)
            .with_route(HandlerPriority::Timer, LoopKind::Core)
            .with_route(HandlerPriority::Daemon, LoopKind::Core)
            .with_route(HandlerPriority::Monitor, LoopKind::Monitor)
            .with_route(HandlerPriority::Blocking, LoopKind::Blocking)
    }

    /// Route `priority` to `kind`
    pub fn with_route(mut self, priority: HandlerPriority, kind: LoopKind) -> Self {
        self.slots[priority.index()] = Some(kind);
        self
    }

    /// Loop for `priority`, if one is configured
    pub fn route(&self, priority: HandlerPriority) -> Option<LoopKind> {
        self.slots[priority.index()]
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Keys are priority names in any case; an unknown name is an error
impl TryFrom<BTreeMap<String, LoopKind>> for RoutingTable {
    type Error = Error;

    fn try_from(routes: BTreeMap<String, LoopKind>) -> Result<Self> {
        routes.into_iter().try_fold(Self::new(), |table, (name, kind)| {
            Ok(table.with_route(name.parse()?, kind))
        })
    }
}

/// The three loops of a process, started, stopped and closed together.
///
/// `stop()` halts the monitor and core loops only; blocking handlers may be
/// mid-operation and keep running until `close()`.
pub struct EventGroup {
    core: Arc<ThreadedEventLoop>,
    monitor: Arc<ThreadedEventLoop>,
    blocking: Arc<BlockingEventLoop>,
    routes: RoutingTable,
    clock: Arc<dyn Clock>,
    debug: DebugProbe,
    monitor_interval: Duration,
    watchdog_installed: AtomicBool,
}

impl EventGroup {
    /// Group with default settings and the given core-loop daemon flag
    pub fn new(daemon: bool) -> Self {
        Self::with_config(EventGroupConfig::with_daemon(daemon))
    }

    /// Group from a configuration, using the real clock, the log sink and
    /// the tracer probe
    pub fn with_config(config: EventGroupConfig) -> Self {
        Self::with_parts(
            config,
            Arc::new(MonotonicClock),
            debug_probe::tracer_attached(),
            Arc::new(LogSink),
        )
    }

    /// Group with every collaborator supplied
    pub fn with_parts(
        config: EventGroupConfig,
        clock: Arc<dyn Clock>,
        debug: DebugProbe,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Self {
        let join_timeout = config.join_timeout();
        let monitor_interval = config.monitor_interval();

        let core = LoopSettings::new(defaults::CORE_LOOP_NAME, config.core_pauser.build())
            .with_daemon(config.daemon)
            .with_join_timeout(join_timeout)
            .with_clock(clock.clone())
            .with_sink(sink.clone());

        // Capped so the watchdog ticks at the monitor interval
        let monitor = LoopSettings::new(defaults::MONITOR_LOOP_NAME, config.monitor_pauser.build())
            .with_max_pause(monitor_interval)
            .with_join_timeout(join_timeout)
            .with_clock(clock.clone())
            .with_sink(sink.clone());

        let blocking = BlockingEventLoop::new(
            defaults::BLOCKING_LOOP_NAME,
            config.blocking_pauser,
            clock.clone(),
            sink,
            join_timeout,
        );

        Self {
            core: Arc::new(ThreadedEventLoop::new(core)),
            monitor: Arc::new(ThreadedEventLoop::new(monitor)),
            blocking: Arc::new(blocking),
            routes: config.routes,
            clock,
            debug,
            monitor_interval,
            watchdog_installed: AtomicBool::new(false),
        }
    }

    /// Core loop
    pub fn core(&self) -> &Arc<ThreadedEventLoop> {
        &self.core
    }

    /// Monitor loop
    pub fn monitor(&self) -> &Arc<ThreadedEventLoop> {
        &self.monitor
    }

    /// Blocking loop
    pub fn blocking(&self) -> &Arc<BlockingEventLoop> {
        &self.blocking
    }

    /// Routing table in use
    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    /// Loop a handler of `priority` would be added to
    pub fn loop_for(&self, priority: HandlerPriority) -> Result<&dyn EventLoop> {
        match self.routes.route(priority) {
            Some(LoopKind::Core) => Ok(self.core.as_ref()),
            Some(LoopKind::Monitor) => Ok(self.monitor.as_ref()),
            Some(LoopKind::Blocking) => Ok(self.blocking.as_ref()),
            None => Err(Error::UnroutablePriority(priority)),
        }
    }

    fn install_watchdog(&self) -> Result<()> {
        if self.watchdog_installed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let watchdog = StallWatchdog::new(
            self.core.clone(),
            self.clock.clone(),
            self.debug.clone(),
            self.monitor_interval,
        );
        if let Err(err) = self.monitor.add_handler(Box::new(watchdog)) {
            self.watchdog_installed.store(false, Ordering::Release);
            return Err(err);
        }
        log::debug!("stall watchdog installed on {}", self.monitor.name());

        Ok(())
    }
}

impl EventLoop for EventGroup {
    fn name(&self) -> &str {
        defaults::GROUP_NAME
    }

    fn add_handler(&self, handler: Box<dyn EventHandler>) -> Result<()> {
        let priority = handler.priority().unwrap_or(HandlerPriority::Blocking);
        self.loop_for(priority)?.add_handler(handler)
    }

    /// Starts core, then monitor, then installs the watchdog (once). The
    /// blocking loop is started last; it may already be running after a
    /// `stop()`.
    fn start(&self) -> Result<()> {
        self.core.start()?;
        self.monitor.start()?;
        self.install_watchdog()?;
        self.blocking.start()
    }

    fn stop(&self) {
        self.monitor.stop();
        self.core.stop();
    }

    fn close(&self) {
        self.stop();
        self.monitor.close();
        self.blocking.close();
        self.core.close();
    }

    fn is_running(&self) -> bool {
        self.core.is_running()
    }

    fn is_alive(&self) -> bool {
        self.core.is_alive()
    }

    fn loop_start_ns(&self) -> u64 {
        self.core.loop_start_ns()
    }

    fn handler_count(&self) -> usize {
        self.core.handler_count() + self.monitor.handler_count() + self.blocking.handler_count()
    }

    fn unpause(&self) {
        self.core.unpause();
        self.monitor.unpause();
        self.blocking.unpause();
    }

    fn dump_running_state(&self, message: &str) {
        self.core.dump_running_state(message);
    }
}

impl Drop for EventGroup {
    fn drop(&mut self) {
        self.close();
    }
}
