//! Default constants for loop and pauser configuration.

use std::time::Duration;

/// Nominal sleep period of the monitor loop; the watchdog measures stalls
/// in units of half this interval.
pub const MONITOR_INTERVAL: Duration = Duration::from_millis(100);

/// Core loop spin window before it starts sleeping.
pub const CORE_SPIN: Duration = Duration::from_micros(20);

/// Longest sleep of the core loop between idle passes.
pub const CORE_MAX_SLEEP: Duration = Duration::from_micros(200);

/// Monitor loop spin window (none: it sleeps from the first idle pass).
pub const MONITOR_SPIN: Duration = Duration::ZERO;

/// Longest sleep of the monitor loop's pauser.
pub const MONITOR_MAX_SLEEP: Duration = Duration::from_secs(1);

/// Longest sleep of a blocking-loop worker between idle steps.
pub const BLOCKING_MAX_SLEEP: Duration = Duration::from_millis(20);

/// First sleep of an adaptive pauser once its spin window has passed.
pub const MIN_SLEEP: Duration = Duration::from_micros(10);

/// How long `stop()`/`close()` wait for a loop thread before detaching it.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Thread name of the core loop.
pub const CORE_LOOP_NAME: &str = "core-event-loop";

/// Thread name of the monitor loop.
pub const MONITOR_LOOP_NAME: &str = "monitor-event-loop";

/// Name prefix of blocking-loop worker threads.
pub const BLOCKING_LOOP_NAME: &str = "blocking-event-loop";

/// Name an [`EventGroup`](crate::EventGroup) reports as a loop.
pub const GROUP_NAME: &str = "event-group";
