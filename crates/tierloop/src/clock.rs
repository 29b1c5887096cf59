//! Nanosecond time sources shared by loops and the watchdog.
//!
//! Loops stamp their loop-start timestamp through a [`Clock`]; the watchdog
//! reads the same clock to measure how long a pass has been running. Both
//! sides must use the same source for the difference to mean anything.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Process-wide origin for [`MonotonicClock`].
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic nanosecond time source
pub trait Clock: Send + Sync {
    /// Nanoseconds since an arbitrary fixed origin
    fn now_ns(&self) -> u64;
}

/// Nanoseconds elapsed since the process epoch.
pub fn monotonic_ns() -> u64 {
    EPOCH.elapsed().as_nanos() as u64
}

/// Wall-independent clock backed by [`Instant`]
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        monotonic_ns()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock reading `start_ns`
    pub fn new(start_ns: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ns),
        }
    }

    /// Set the current reading
    pub fn set(&self, now_ns: u64) {
        self.now.store(now_ns, Ordering::Release);
    }

    /// Move the reading forward
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_nanos() as u64, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_clock_advances() {
        let clock = MonotonicClock;
        let a = clock.now_ns();
        std::thread::sleep(Duration::from_millis(2));
        let b = clock.now_ns();
        assert!(b > a);
        assert!(b - a >= 2_000_000);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(5);
        assert_eq!(clock.now_ns(), 5);

        clock.advance(Duration::from_micros(1));
        assert_eq!(clock.now_ns(), 1_005);

        clock.set(42);
        assert_eq!(clock.now_ns(), 42);
    }
}
