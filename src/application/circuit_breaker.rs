//! Circuit breaker in front of the Counter Store.
//!
//! A shared backend that is down tends to fail slowly (connect timeouts).
//! After `failure_threshold` consecutive `BackendUnavailable` errors the
//! circuit opens and governance calls report an indeterminate result
//! immediately, without touching the store, until `recovery_timeout` has
//! passed. One trial call is then let through; its result closes or reopens
//! the circuit. Other callers keep getting indeterminate results while the
//! trial call is outstanding. A trial call that never reports back is
//! replaced after another `recovery_timeout`.
//!
//! The breaker never decides allow or deny by itself. Callers still apply
//! the deployment's [`FailurePolicy`](crate::FailurePolicy).

use crate::application::ports::Clock;
use crate::domain::window::epoch_millis;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Store calls go through.
    Closed = 0,
    /// Store calls are skipped and reported as indeterminate.
    Open = 1,
    /// One trial call is allowed to test recovery.
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive store failures before the circuit opens
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Circuit breaker shared by the rate limiter and the idempotency
/// coordinator, so one outage trips both.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU64,
    opened_at_ms: AtomicU64,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_config(CircuitBreakerConfig::default(), clock)
    }

    pub fn with_config(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU64::new(0),
            opened_at_ms: AtomicU64::new(0),
            config,
            clock,
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Whether a store call should be attempted.
    pub fn allow_call(&self) -> bool {
        let state = self.state();
        if state == CircuitState::Closed {
            return true;
        }

        let now_ms = epoch_millis(self.clock.now());
        let since = self.opened_at_ms.load(Ordering::Acquire);
        let timeout_ms =
            u64::try_from(self.config.recovery_timeout.as_millis()).unwrap_or(u64::MAX);
        if now_ms.saturating_sub(since) < timeout_ms {
            return false;
        }

        // Only one caller wins and makes the trial call. `opened_at_ms` then
        // marks when the trial call started.
        if self
            .opened_at_ms
            .compare_exchange(since, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        match state {
            CircuitState::Open => self
                .state
                .compare_exchange(
                    CircuitState::Open as u8,
                    CircuitState::HalfOpen as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok(),
            _ => {
                tracing::debug!("trial call did not report back, allowing another");
                true
            }
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        if self.state() == CircuitState::HalfOpen {
            self.state
                .store(CircuitState::Closed as u8, Ordering::Release);
            tracing::info!("counter store recovered, circuit closed");
        }
    }

    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;

        let should_open = match self.state() {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => failures >= u64::from(self.config.failure_threshold),
            CircuitState::Open => false,
        };

        if should_open {
            self.opened_at_ms
                .store(epoch_millis(self.clock.now()), Ordering::Release);
            self.state.store(CircuitState::Open as u8, Ordering::Release);
            tracing::warn!(
                consecutive_failures = failures,
                recovery_timeout_ms = self.config.recovery_timeout.as_millis() as u64,
                "counter store unavailable, circuit opened"
            );
        }
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Close the circuit and forget past failures.
    pub fn reset(&self) {
        self.state
            .store(CircuitState::Closed as u8, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mocks::MockClock;
    use std::thread;

    fn breaker(threshold: u32, recovery_secs: u64) -> (CircuitBreaker, MockClock) {
        let clock = MockClock::at_epoch_secs(1_000);
        let config = CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_secs(recovery_secs),
        };
        (
            CircuitBreaker::with_config(config, Arc::new(clock.clone())),
            clock,
        )
    }

    #[test]
    fn test_initial_state() {
        let (cb, _) = breaker(3, 10);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_call());
    }

    #[test]
    fn test_opens_at_threshold() {
        let (cb, _) = breaker(3, 10);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_call());
    }

    #[test]
    fn test_single_trial_after_recovery_timeout() {
        let (cb, clock) = breaker(1, 10);
        cb.record_failure();
        assert!(!cb.allow_call());

        clock.advance(Duration::from_secs(10));
        assert!(cb.allow_call());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_admits_one_caller() {
        let (cb, clock) = breaker(1, 10);
        cb.record_failure();
        clock.advance(Duration::from_secs(10));

        assert!(cb.allow_call());
        assert!(!cb.allow_call());
        assert!(!cb.allow_call());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert!(cb.allow_call());
    }

    #[test]
    fn test_concurrent_callers_get_one_trial() {
        let (cb, clock) = breaker(1, 10);
        cb.record_failure();
        clock.advance(Duration::from_secs(10));

        let cb = Arc::new(cb);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cb = Arc::clone(&cb);
                thread::spawn(move || cb.allow_call())
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|allowed| *allowed)
            .count();
        assert_eq!(admitted, 1);
    }

    #[test]
    fn test_silent_trial_replaced_after_timeout() {
        let (cb, clock) = breaker(1, 10);
        cb.record_failure();
        clock.advance(Duration::from_secs(10));
        assert!(cb.allow_call());

        clock.advance(Duration::from_secs(9));
        assert!(!cb.allow_call());
        clock.advance(Duration::from_secs(1));
        assert!(cb.allow_call());
        assert!(!cb.allow_call());
    }

    #[test]
    fn test_trial_success_closes() {
        let (cb, clock) = breaker(1, 10);
        cb.record_failure();
        clock.advance(Duration::from_secs(11));
        assert!(cb.allow_call());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[test]
    fn test_trial_failure_reopens_with_fresh_timeout() {
        let (cb, clock) = breaker(1, 10);
        cb.record_failure();
        clock.advance(Duration::from_secs(11));
        assert!(cb.allow_call());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_call());

        clock.advance(Duration::from_secs(10));
        assert!(cb.allow_call());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let (cb, _) = breaker(5, 10);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.consecutive_failures(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_reset() {
        let (cb, _) = breaker(1, 10);
        cb.record_failure();
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_call());
    }

    #[test]
    fn test_concurrent_failures_open_once() {
        let (cb, _) = breaker(5, 10);
        let cb = Arc::new(cb);
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let cb = Arc::clone(&cb);
                thread::spawn(move || cb.record_failure())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cb.consecutive_failures(), 10);
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
