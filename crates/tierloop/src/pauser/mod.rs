//! Pausers - how a loop thread waits when a pass found no work
//!
//! Every loop owns exactly one pauser. After an idle pass the loop calls
//! [`Pauser::pause`]; after a busy pass it calls [`Pauser::reset`]. Producers
//! that hand the loop new work call [`Pauser::unpause`] so a sleeping loop
//! wakes without waiting out its current sleep.

mod adaptive;
mod busy;
mod parker;
mod sleepy;
mod yielding;

pub use adaptive::AdaptivePauser;
pub use busy::BusyPauser;
pub use sleepy::SleepyPauser;
pub use yielding::YieldingPauser;

pub(crate) use parker::Parker;

use std::time::Duration;

/// Wait strategy for an idle loop thread.
///
/// `reset`, `pause` and `pause_max` are only called from the owning loop
/// thread. `unpause` may be called from any thread.
pub trait Pauser: Send + Sync {
    /// Drop any accumulated backoff; the next pause is as short as possible
    fn reset(&self);

    /// Wait for a strategy-chosen duration
    fn pause(&self);

    /// Wait as `pause` would, but never longer than `max`
    fn pause_max(&self, max: Duration);

    /// Wake a thread currently inside `pause`/`pause_max`
    fn unpause(&self);

    /// Sleep the next backed-off pause will use; zero while spinning
    fn pause_duration(&self) -> Duration {
        Duration::ZERO
    }
}
