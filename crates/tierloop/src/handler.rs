//! Event handlers and their priority tiers

use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// Urgency tier of a handler; decides which loop runs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerPriority {
    /// Latency-critical work, core loop
    High,
    /// Regular work, core loop
    Medium,
    /// Timer-driven work, core loop
    Timer,
    /// Housekeeping, core loop
    Daemon,
    /// Low-frequency observation, monitor loop
    Monitor,
    /// Steps that may block, blocking loop
    Blocking,
}

impl HandlerPriority {
    /// Number of tiers
    pub const COUNT: usize = 6;

    /// Every tier, in declaration order
    pub const ALL: [HandlerPriority; Self::COUNT] = [
        HandlerPriority::High,
        HandlerPriority::Medium,
        HandlerPriority::Timer,
        HandlerPriority::Daemon,
        HandlerPriority::Monitor,
        HandlerPriority::Blocking,
    ];

    /// Position in [`HandlerPriority::ALL`]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Upper-case tier name
    pub fn as_str(self) -> &'static str {
        match self {
            HandlerPriority::High => "HIGH",
            HandlerPriority::Medium => "MEDIUM",
            HandlerPriority::Timer => "TIMER",
            HandlerPriority::Daemon => "DAEMON",
            HandlerPriority::Monitor => "MONITOR",
            HandlerPriority::Blocking => "BLOCKING",
        }
    }
}

impl fmt::Display for HandlerPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HandlerPriority {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| crate::Error::UnknownPriority(s.to_string()))
    }
}

impl TryFrom<u8> for HandlerPriority {
    type Error = crate::Error;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(code as usize)
            .copied()
            .ok_or_else(|| crate::Error::UnknownPriority(code.to_string()))
    }
}

/// Why a handler step ended the handler's registration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Handler has finished and asks to be removed
    #[error("Handler retired")]
    Retired,

    /// Handler step failed; it is removed and the failure logged
    #[error("Handler failed: {0}")]
    Failed(String),
}

/// A unit of work driven repeatedly by an event loop.
///
/// Once registered, the loop owns the handler and is the only caller of
/// [`run_once`](EventHandler::run_once).
pub trait EventHandler: Send + 'static {
    /// Perform one step. `Ok(true)` if any work was done, `Ok(false)` if
    /// there was nothing to do, `Err` to be removed from the loop.
    fn run_once(&mut self) -> Result<bool, HandlerError>;

    /// Tier this handler runs at; `None` is treated as BLOCKING
    fn priority(&self) -> Option<HandlerPriority> {
        None
    }

    /// Name used in logs and stall dumps
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Handler built from a closure
pub struct FnHandler<F> {
    name: String,
    priority: Option<HandlerPriority>,
    step: F,
}

/// Build a handler from a closure
pub fn handler_fn<F>(name: impl Into<String>, priority: Option<HandlerPriority>, step: F) -> FnHandler<F>
where
    F: FnMut() -> Result<bool, HandlerError> + Send + 'static,
{
    FnHandler {
        name: name.into(),
        priority,
        step,
    }
}

impl<F> EventHandler for FnHandler<F>
where
    F: FnMut() -> Result<bool, HandlerError> + Send + 'static,
{
    fn run_once(&mut self) -> Result<bool, HandlerError> {
        (self.step)()
    }

    fn priority(&self) -> Option<HandlerPriority> {
        self.priority
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish()
    }
}
