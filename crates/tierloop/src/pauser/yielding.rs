//! Spin-then-yield pauser.

use super::Pauser;
use crate::clock::monotonic_ns;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

const NO_STREAK: u64 = u64::MAX;

/// Spins for a window, then yields the CPU on every pause. Never sleeps,
/// so `unpause` has nothing to do.
#[derive(Debug)]
pub struct YieldingPauser {
    spin_ns: u64,
    idle_since_ns: AtomicU64,
}

impl YieldingPauser {
    /// Create a pauser that spins for `spin` before yielding
    pub fn new(spin: Duration) -> Self {
        Self {
            spin_ns: spin.as_nanos() as u64,
            idle_since_ns: AtomicU64::new(NO_STREAK),
        }
    }
}

impl Pauser for YieldingPauser {
    fn reset(&self) {
        self.idle_since_ns.store(NO_STREAK, Ordering::Relaxed);
    }

    fn pause(&self) {
        let now = monotonic_ns();
        let since = self.idle_since_ns.load(Ordering::Relaxed);
        if since == NO_STREAK {
            self.idle_since_ns.store(now, Ordering::Relaxed);
        }

        if since != NO_STREAK && now.saturating_sub(since) >= self.spin_ns {
            thread::yield_now();
        } else {
            std::hint::spin_loop();
        }
    }

    fn pause_max(&self, _max: Duration) {
        self.pause();
    }

    fn unpause(&self) {}
}
