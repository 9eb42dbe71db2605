//! Mock clock for testing.

use crate::application::ports::Clock;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Mock clock for testing.
///
/// Lets tests control time explicitly so window boundaries, lease expiry and
/// TTLs can be crossed deterministically.
///
/// # Examples
///
/// ```
/// use request_governance::infrastructure::mocks::MockClock;
/// use request_governance::application::ports::Clock;
/// use std::time::{Duration, UNIX_EPOCH};
///
/// let clock = MockClock::at_epoch_secs(1_700_006_400);
/// clock.advance(Duration::from_secs(10));
/// assert_eq!(clock.now(), UNIX_EPOCH + Duration::from_secs(1_700_006_410));
/// ```
///
/// # Thread Safety
///
/// All clones share the same underlying time value, so advancing one clone
/// advances them all.
#[derive(Debug, Clone)]
pub struct MockClock {
    current_time: Arc<Mutex<SystemTime>>,
}

impl MockClock {
    /// Create a mock clock starting at a specific time.
    pub fn new(start: SystemTime) -> Self {
        Self {
            current_time: Arc::new(Mutex::new(start)),
        }
    }

    /// Create a mock clock `secs` seconds after the Unix epoch.
    pub fn at_epoch_secs(secs: u64) -> Self {
        Self::new(UNIX_EPOCH + Duration::from_secs(secs))
    }

    pub fn advance(&self, duration: Duration) {
        let mut time = self
            .current_time
            .lock()
            .expect("MockClock mutex poisoned - a test thread panicked while holding the lock");
        *time += duration;
    }

    pub fn set(&self, time: SystemTime) {
        let mut current = self
            .current_time
            .lock()
            .expect("MockClock mutex poisoned - a test thread panicked while holding the lock");
        *current = time;
    }
}

impl Clock for MockClock {
    fn now(&self) -> SystemTime {
        *self
            .current_time
            .lock()
            .expect("MockClock mutex poisoned - a test thread panicked while holding the lock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_clock() {
        let clock = MockClock::at_epoch_secs(100);
        assert_eq!(clock.now(), UNIX_EPOCH + Duration::from_secs(100));

        clock.advance(Duration::from_millis(1_500));
        assert_eq!(clock.now(), UNIX_EPOCH + Duration::from_millis(101_500));

        let shared = clock.clone();
        shared.set(UNIX_EPOCH);
        assert_eq!(clock.now(), UNIX_EPOCH);
    }
}
