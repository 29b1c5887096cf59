//! Spin-only pauser for the most latency-sensitive loops.

use super::Pauser;
use std::time::Duration;

/// Never waits. The loop thread spins continuously and occupies a full core.
#[derive(Debug, Clone, Copy, Default)]
pub struct BusyPauser;

impl Pauser for BusyPauser {
    fn reset(&self) {}

    fn pause(&self) {}

    fn pause_max(&self, _max: Duration) {}

    fn unpause(&self) {}
}
