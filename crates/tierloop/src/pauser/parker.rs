//! Timed park with prompt wake-up, shared by the sleeping pausers.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// One sleeper, any number of wakers.
///
/// A wake that arrives while nobody sleeps is remembered and makes the next
/// park return at once, so work handed over just before a pause is not lost.
#[derive(Debug, Default)]
pub(crate) struct Parker {
    lock: Mutex<()>,
    cvar: Condvar,
    sleeping: AtomicBool,
    pending: AtomicBool,
}

impl Parker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Sleep for `timeout` or until `unpark`, whichever comes first
    pub(crate) fn park_timeout(&self, timeout: Duration) {
        if self.pending.swap(false, Ordering::SeqCst) {
            return;
        }

        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        // sleeping/pending are a store-then-load pair on both sides; with
        // SeqCst at least one side observes the other.
        self.sleeping.store(true, Ordering::SeqCst);
        while !self.pending.load(Ordering::SeqCst) {
            if self.cvar.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        self.sleeping.store(false, Ordering::SeqCst);
        self.pending.store(false, Ordering::SeqCst);
    }

    /// Wake the sleeper, or the next park if nobody is asleep
    pub(crate) fn unpark(&self) {
        self.pending.store(true, Ordering::SeqCst);
        if self.sleeping.load(Ordering::SeqCst) {
            let _guard = self.lock.lock();
            self.cvar.notify_one();
        }
    }
}
