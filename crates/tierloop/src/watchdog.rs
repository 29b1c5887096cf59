//! Stall watchdog for the core loop.
//!
//! Runs as a MONITOR handler. Every tick it measures how long the observed
//! loop has been inside its current pass and, when that grows past the last
//! baseline, asks the loop to dump its running state.
//!
//! Severity is the stall quantized to half monitor intervals:
//!
//! ```text
//! severity = (now - loop_start) / (monitor_interval / 2)
//! ```
//!
//! The baseline stays frozen while dumps are emitted, so a stall that keeps
//! growing dumps on every tick. It is rebased to `max(1, severity)` only on
//! ticks that do not dump.

use crate::clock::Clock;
use crate::diagnostics::DebugProbe;
use crate::event_loop::EventLoop;
use crate::handler::{EventHandler, HandlerError, HandlerPriority};
use std::sync::Arc;
use std::time::Duration;

/// Handler that dumps the observed loop when it stops making progress
pub struct StallWatchdog {
    observed: Arc<dyn EventLoop>,
    clock: Arc<dyn Clock>,
    debug: DebugProbe,
    half_interval_ns: u64,
    last_severity: u64,
}

impl StallWatchdog {
    /// Watch `observed`, measuring stalls in halves of `monitor_interval`
    pub fn new(
        observed: Arc<dyn EventLoop>,
        clock: Arc<dyn Clock>,
        debug: DebugProbe,
        monitor_interval: Duration,
    ) -> Self {
        let half_interval_ns = (monitor_interval.as_nanos() / 2).max(1) as u64;

        Self {
            observed,
            clock,
            debug,
            half_interval_ns,
            last_severity: 1,
        }
    }

    /// Baseline the next severity is compared against
    pub fn last_severity(&self) -> u64 {
        self.last_severity
    }

    fn check(&mut self) {
        let stalled_ns = self
            .clock
            .now_ns()
            .saturating_sub(self.observed.loop_start_ns());
        let severity = stalled_ns / self.half_interval_ns;

        if severity > self.last_severity && !(self.debug)() && self.observed.is_alive() {
            let message = format!(
                "{} thread has blocked for {} ms.",
                self.observed.name(),
                stalled_ns / 1_000_000
            );
            self.observed.dump_running_state(&message);
        } else {
            self.last_severity = severity.max(1);
        }
    }
}

impl EventHandler for StallWatchdog {
    fn run_once(&mut self) -> Result<bool, HandlerError> {
        self.check();
        Ok(false)
    }

    fn priority(&self) -> Option<HandlerPriority> {
        Some(HandlerPriority::Monitor)
    }

    fn name(&self) -> &str {
        "stall-watchdog"
    }
}
