//! Tierloop - low-latency event loops
//!
//! A small, fixed set of event loops, each bound to its own thread:
//! - Core loop: latency-critical handlers (HIGH, MEDIUM, TIMER, DAEMON)
//! - Monitor loop: cheap, low-frequency handlers including the stall watchdog
//! - Blocking loop: handlers whose steps may block, one thread per handler
//!
//! Loops wait between idle passes through a [`Pauser`], trading CPU burn
//! against wake-up latency. [`EventGroup`] owns one of each loop and routes
//! handlers to them by [`HandlerPriority`].

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod clock;
pub mod config;
pub mod defaults;
pub mod diagnostics;
pub mod event_loop;
pub mod group;
pub mod handler;
pub mod pauser;
pub mod watchdog;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{EventGroupConfig, PauserConfig};
pub use diagnostics::{debug_probe, CollectingSink, DebugProbe, DiagnosticSink, LogSink, LoopDump};
pub use event_loop::{BlockingEventLoop, EventLoop, Heartbeat, LoopSettings, ThreadedEventLoop};
pub use group::{EventGroup, LoopKind, RoutingTable};
pub use handler::{handler_fn, EventHandler, FnHandler, HandlerError, HandlerPriority};
pub use pauser::{AdaptivePauser, BusyPauser, Pauser, SleepyPauser, YieldingPauser};
pub use watchdog::StallWatchdog;

/// Event loop errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No loop is configured for the handler's priority
    #[error("No event loop is routed for priority {0}")]
    UnroutablePriority(HandlerPriority),

    /// Priority code that names no tier
    #[error("Unknown priority {0}")]
    UnknownPriority(String),

    /// Loop has been closed
    #[error("Event loop {0} is closed")]
    Closed(String),

    /// Loop thread could not be spawned
    #[error("Failed to spawn thread for {name}: {source}")]
    Spawn {
        /// Loop or worker name
        name: String,
        /// OS error
        #[source]
        source: std::io::Error,
    },

    /// Configuration text could not be parsed
    #[error("Invalid configuration: {0}")]
    Config(#[from] toml::de::Error),
}

/// Event loop result
pub type Result<T> = std::result::Result<T, Error>;
