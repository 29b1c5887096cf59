//! Fixed-interval sleeping pauser.

use super::{Parker, Pauser};
use std::time::Duration;

/// Sleeps the same period on every idle pass. Cheap on CPU, slow to react
/// unless producers call `unpause`.
#[derive(Debug)]
pub struct SleepyPauser {
    sleep: Duration,
    parker: Parker,
}

impl SleepyPauser {
    /// Create a pauser sleeping `sleep` per pause
    pub fn new(sleep: Duration) -> Self {
        Self {
            sleep,
            parker: Parker::new(),
        }
    }
}

impl Pauser for SleepyPauser {
    fn reset(&self) {}

    fn pause(&self) {
        self.parker.park_timeout(self.sleep);
    }

    fn pause_max(&self, max: Duration) {
        self.parker.park_timeout(self.sleep.min(max));
    }

    fn unpause(&self) {
        self.parker.unpark();
    }

    fn pause_duration(&self) -> Duration {
        self.sleep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_sleeps_fixed_period() {
        let pauser = SleepyPauser::new(Duration::from_millis(10));
        let start = Instant::now();
        pauser.pause();
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert_eq!(pauser.pause_duration(), Duration::from_millis(10));
    }

    #[test]
    fn test_pause_max_shortens_sleep() {
        let pauser = SleepyPauser::new(Duration::from_secs(10));
        let start = Instant::now();
        pauser.pause_max(Duration::from_millis(5));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
