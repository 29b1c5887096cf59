//! Stall diagnostics
//!
//! A loop asked to dump its running state captures a [`LoopDump`] and hands
//! it to a [`DiagnosticSink`]. Where the dump ends up is the sink's business;
//! the default [`LogSink`] writes it to the `log` facade.

pub mod debug_probe;

pub use debug_probe::DebugProbe;

use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;

/// Snapshot of a loop's state, taken on demand
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopDump {
    /// Loop name
    pub loop_name: String,
    /// Name of the thread driving the loop (or the stalled worker)
    pub thread_name: String,
    /// Caller-supplied reason for the dump
    pub message: String,
    /// Whether the thread was alive when the dump was taken
    pub alive: bool,
    /// Completed passes so far
    pub passes: u64,
    /// Handler whose step was executing, if any
    pub running_handler: Option<String>,
    /// Registered handlers, in run order
    pub handlers: Vec<String>,
    /// Time since the current pass began
    pub in_pass_for: Duration,
}

impl fmt::Display for LoopDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        writeln!(
            f,
            "  thread {} ({}) alive={} passes={} in-pass={:?}",
            self.thread_name, self.loop_name, self.alive, self.passes, self.in_pass_for
        )?;
        match &self.running_handler {
            Some(name) => writeln!(f, "  running: {}", name)?,
            None => writeln!(f, "  running: <between passes>")?,
        }
        write!(f, "  handlers: [{}]", self.handlers.join(", "))
    }
}

/// Destination for loop dumps
pub trait DiagnosticSink: Send + Sync {
    /// Deliver one dump
    fn report(&self, dump: &LoopDump);
}

/// Writes each dump as a single `warn!` record
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn report(&self, dump: &LoopDump) {
        log::warn!("{}", dump);
    }
}

/// Keeps dumps in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    dumps: Mutex<Vec<LoopDump>>,
}

impl CollectingSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Dumps received so far
    pub fn dumps(&self) -> Vec<LoopDump> {
        self.dumps.lock().clone()
    }

    /// Number of dumps received
    pub fn len(&self) -> usize {
        self.dumps.lock().len()
    }

    /// True if nothing has been reported
    pub fn is_empty(&self) -> bool {
        self.dumps.lock().is_empty()
    }

    /// Remove and return all dumps
    pub fn take(&self) -> Vec<LoopDump> {
        std::mem::take(&mut *self.dumps.lock())
    }
}

impl DiagnosticSink for CollectingSink {
    fn report(&self, dump: &LoopDump) {
        self.dumps.lock().push(dump.clone());
    }
}
