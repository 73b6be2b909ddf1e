//! Group-wide time source for the stagnation timeout.
//!
//! Every worker reads `CLOCK_MONOTONIC`, which is shared by all processes on
//! the host, so timestamps written into the shared segment by one worker are
//! comparable by the others.

use nix::time::{clock_gettime, ClockId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Millisecond clock comparable across worker processes.
pub trait Clock {
    fn now_millis(&self) -> u64;
}

/// `CLOCK_MONOTONIC` in milliseconds
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        match clock_gettime(ClockId::CLOCK_MONOTONIC) {
            Ok(ts) => ts.tv_sec() as u64 * 1000 + ts.tv_nsec() as u64 / 1_000_000,
            Err(e) => {
                // CLOCK_MONOTONIC is mandatory on Linux.
                log::error!("clock_gettime(CLOCK_MONOTONIC) failed: {}", e);
                0
            }
        }
    }
}

/// Hand-driven clock; clones share the same time.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(start_millis)),
        }
    }

    pub fn advance_secs(&self, secs: u64) {
        self.millis.fetch_add(secs * 1000, Ordering::SeqCst);
    }

    pub fn set_millis(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_clock_does_not_go_backwards() {
        let clock = MonotonicClock;
        let first = clock.now_millis();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(clock.now_millis() >= first);
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::new(1_000);
        let other = clock.clone();
        clock.advance_secs(3);
        assert_eq!(other.now_millis(), 4_000);
    }
}
