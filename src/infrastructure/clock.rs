//! Wall-clock adapter.
//!
//! Window boundaries and record expiry are computed from [`Clock::now`], so
//! every process sharing a store should use a clock that agrees with the
//! others. Tests drive time with `MockClock` from
//! `crate::infrastructure::mocks` (behind `test-helpers`).

use crate::application::ports::Clock;
use std::time::SystemTime;

/// Reads the operating system's wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    #[test]
    fn test_reads_past_the_epoch() {
        let clock = SystemClock::new();
        let first = clock.now();
        assert!(first > UNIX_EPOCH);
        assert!(clock.now() >= first);
    }
}
