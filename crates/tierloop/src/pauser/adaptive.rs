//! Spin-then-sleep pauser with exponential backoff.
//!
//! For `spin` after the first idle pass of a streak the pauser behaves like
//! [`BusyPauser`](super::BusyPauser). Past that window each pause sleeps,
//! starting at `min_sleep` and doubling up to `max_sleep`. `reset` returns
//! it to the spin phase.

use super::{Parker, Pauser};
use crate::clock::monotonic_ns;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// No idle streak in progress
const NO_STREAK: u64 = u64::MAX;

/// Adaptive spin/sleep pauser
#[derive(Debug)]
pub struct AdaptivePauser {
    spin_ns: u64,
    min_sleep_ns: u64,
    max_sleep_ns: u64,

    /// When the current idle streak began (loop thread only)
    idle_since_ns: AtomicU64,

    /// Backoff for the next sleep; zero until the first sleep of a streak
    sleep_ns: AtomicU64,

    parker: Parker,
}

impl AdaptivePauser {
    /// Create a pauser that spins for `spin`, then sleeps between
    /// `min_sleep` and `max_sleep`
    pub fn new(spin: Duration, min_sleep: Duration, max_sleep: Duration) -> Self {
        let max_sleep_ns = (max_sleep.as_nanos() as u64).max(1);
        let min_sleep_ns = (min_sleep.as_nanos() as u64).clamp(1, max_sleep_ns);

        Self {
            spin_ns: spin.as_nanos() as u64,
            min_sleep_ns,
            max_sleep_ns,
            idle_since_ns: AtomicU64::new(NO_STREAK),
            sleep_ns: AtomicU64::new(0),
            parker: Parker::new(),
        }
    }

    /// Pauser with the default minimum sleep
    pub fn with_spin(spin: Duration, max_sleep: Duration) -> Self {
        Self::new(spin, crate::defaults::MIN_SLEEP, max_sleep)
    }

    /// Configured spin window
    pub fn spin(&self) -> Duration {
        Duration::from_nanos(self.spin_ns)
    }

    /// Configured longest sleep
    pub fn max_sleep(&self) -> Duration {
        Duration::from_nanos(self.max_sleep_ns)
    }

    fn still_spinning(&self) -> bool {
        if self.spin_ns == 0 {
            return false;
        }

        let now = monotonic_ns();
        let since = self.idle_since_ns.load(Ordering::Relaxed);
        if since == NO_STREAK {
            self.idle_since_ns.store(now, Ordering::Relaxed);
            return true;
        }
        now.saturating_sub(since) < self.spin_ns
    }

    fn backoff(&self, cap_ns: u64) {
        if self.still_spinning() {
            std::hint::spin_loop();
            return;
        }

        let sleep = self.sleep_ns.load(Ordering::Relaxed).max(self.min_sleep_ns);
        self.parker.park_timeout(Duration::from_nanos(sleep.min(cap_ns)));

        let next = sleep.saturating_mul(2).min(self.max_sleep_ns);
        if next == self.max_sleep_ns && sleep < self.max_sleep_ns {
            log::trace!("adaptive pauser reached max sleep of {} ns", self.max_sleep_ns);
        }
        self.sleep_ns.store(next, Ordering::Relaxed);
    }
}

impl Pauser for AdaptivePauser {
    fn reset(&self) {
        self.idle_since_ns.store(NO_STREAK, Ordering::Relaxed);
        self.sleep_ns.store(0, Ordering::Relaxed);
    }

    fn pause(&self) {
        self.backoff(u64::MAX);
    }

    fn pause_max(&self, max: Duration) {
        self.backoff(max.as_nanos() as u64);
    }

    fn unpause(&self) {
        self.parker.unpark();
    }

    fn pause_duration(&self) -> Duration {
        Duration::from_nanos(self.sleep_ns.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_configured_windows() {
        let pauser = AdaptivePauser::with_spin(Duration::from_micros(20), Duration::from_micros(200));
        assert_eq!(pauser.spin(), Duration::from_micros(20));
        assert_eq!(pauser.max_sleep(), Duration::from_micros(200));

        // A zero cap still sleeps for at least a nanosecond
        let pauser = AdaptivePauser::new(Duration::ZERO, Duration::from_millis(1), Duration::ZERO);
        assert_eq!(pauser.spin(), Duration::ZERO);
        assert_eq!(pauser.max_sleep(), Duration::from_nanos(1));
    }

    #[test]
    fn test_spin_phase_does_not_sleep() {
        let pauser = AdaptivePauser::with_spin(Duration::from_secs(10), Duration::from_secs(1));

        let start = Instant::now();
        for _ in 0..1000 {
            pauser.pause();
        }
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(pauser.pause_duration(), Duration::ZERO);
    }

    #[test]
    fn test_backoff_is_non_decreasing_and_capped() {
        let max = Duration::from_micros(640);
        let pauser = AdaptivePauser::new(Duration::ZERO, Duration::from_micros(10), max);

        let mut previous = pauser.pause_duration();
        for _ in 0..12 {
            pauser.pause();
            let current = pauser.pause_duration();
            assert!(current >= previous);
            assert!(current <= max);
            previous = current;
        }
        assert_eq!(previous, max);
    }

    #[test]
    fn test_reset_returns_to_minimal_wait() {
        let pauser = AdaptivePauser::new(Duration::ZERO, Duration::from_micros(10), Duration::from_millis(1));
        for _ in 0..8 {
            pauser.pause();
        }
        assert!(pauser.pause_duration() > Duration::from_micros(10));

        pauser.reset();
        assert_eq!(pauser.pause_duration(), Duration::ZERO);

        // First sleep after a reset is the minimum
        pauser.pause();
        assert_eq!(pauser.pause_duration(), Duration::from_micros(20));
    }

    #[test]
    fn test_reset_restarts_spin_window() {
        let pauser = AdaptivePauser::with_spin(Duration::from_millis(1), Duration::from_millis(1));

        pauser.pause();
        thread::sleep(Duration::from_millis(2));
        pauser.pause();
        assert!(pauser.pause_duration() > Duration::ZERO);

        pauser.reset();
        pauser.pause();
        assert_eq!(pauser.pause_duration(), Duration::ZERO);
    }

    #[test]
    fn test_pause_max_bounds_sleep() {
        let pauser = AdaptivePauser::new(Duration::ZERO, Duration::from_secs(5), Duration::from_secs(5));

        let start = Instant::now();
        pauser.pause_max(Duration::from_millis(10));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_unpause_wakes_paused_thread() {
        let pauser = Arc::new(AdaptivePauser::new(
            Duration::ZERO,
            Duration::from_secs(10),
            Duration::from_secs(10),
        ));

        let sleeper = {
            let pauser = pauser.clone();
            thread::spawn(move || {
                let start = Instant::now();
                pauser.pause();
                start.elapsed()
            })
        };

        thread::sleep(Duration::from_millis(50));
        pauser.unpause();

        let slept = sleeper.join().unwrap();
        assert!(slept < Duration::from_secs(5));
    }
}
