//! Debugger detection for the stall watchdog.
//!
//! A thread paused at a breakpoint looks exactly like a stalled loop, so the
//! watchdog asks a probe before dumping. Probes are injected rather than
//! read from a global so the watchdog can be tested in isolation.

use std::sync::Arc;

/// Returns `true` while a debugger or profiler holds the process
pub type DebugProbe = Arc<dyn Fn() -> bool + Send + Sync>;

/// Probe that never reports a debugger
pub fn never() -> DebugProbe {
    Arc::new(|| false)
}

/// Probe that always reports a debugger
pub fn always() -> DebugProbe {
    Arc::new(|| true)
}

/// Probe that checks whether a tracer is attached to this process.
///
/// On Linux this reads `TracerPid` from `/proc/self/status`; a non-zero pid
/// means gdb, lldb, strace or similar is attached. Elsewhere it reports
/// `false`.
pub fn tracer_attached() -> DebugProbe {
    Arc::new(is_traced)
}

#[cfg(target_os = "linux")]
fn is_traced() -> bool {
    std::fs::read_to_string("/proc/self/status")
        .map(|status| tracer_pid(&status).is_some_and(|pid| pid != 0))
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_traced() -> bool {
    false
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn tracer_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|pid| pid.trim().parse().ok())
}
