//! Sliding window rate limiter.
//!
//! Each check counts the request first and then evaluates the weighted
//! count, so an over-limit request is itself recorded and rejected. Clients
//! that keep retrying while limited therefore keep their window full.

use crate::application::circuit_breaker::CircuitBreaker;
use crate::application::metrics::GovernanceMetrics;
use crate::application::ports::{Clock, CounterStore, Limiter, StoreError};
use crate::domain::key::RateLimitKey;
use crate::domain::rate::Rate;
use crate::domain::window::{weighted_count, Decision, Quota, WindowSnapshot};
use std::panic;
use std::sync::Arc;
use std::time::SystemTime;

/// Default prefix for rate limit counter keys in the store.
pub const DEFAULT_COUNTER_PREFIX: &str = "gov:rl";

/// Rate limiter over a [`CounterStore`].
///
/// Holds no per-key state of its own: everything lives in the store, so
/// several limiters (or processes) sharing a store share their limits.
#[derive(Debug, Clone)]
pub struct RateLimiter<S> {
    store: S,
    clock: Arc<dyn Clock>,
    metrics: GovernanceMetrics,
    circuit_breaker: Arc<CircuitBreaker>,
    prefix: Arc<str>,
}

impl<S: CounterStore> RateLimiter<S> {
    /// Create a limiter with its own circuit breaker and metrics.
    pub fn new(store: S, clock: Arc<dyn Clock>) -> Self {
        let circuit_breaker = Arc::new(CircuitBreaker::new(Arc::clone(&clock)));
        Self::with_parts(store, clock, GovernanceMetrics::new(), circuit_breaker)
    }

    /// Create a limiter sharing metrics and a circuit breaker with other
    /// components.
    pub fn with_parts(
        store: S,
        clock: Arc<dyn Clock>,
        metrics: GovernanceMetrics,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            store,
            clock,
            metrics,
            circuit_breaker,
            prefix: Arc::from(DEFAULT_COUNTER_PREFIX),
        }
    }

    /// Use a different store key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<Arc<str>>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Count one request against `key` and decide whether it is within `rate`.
    ///
    /// Never returns an error: an unreachable store yields
    /// [`Decision::Indeterminate`], left for the caller's failure policy.
    pub fn check(&self, key: &RateLimitKey, rate: &Rate) -> Decision {
        if !self.circuit_breaker.allow_call() {
            self.metrics.record_indeterminate();
            return Decision::Indeterminate;
        }

        let storage_key = format!("{}:{}", self.prefix, key);
        let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            self.store.increment_and_check(&storage_key, rate.period())
        }))
        .unwrap_or_else(|_| Err(StoreError::unavailable("counter store panicked")));

        let snapshot = match result {
            Ok(snapshot) => {
                self.circuit_breaker.record_success();
                snapshot
            }
            Err(e) => {
                self.circuit_breaker.record_failure();
                self.metrics.record_indeterminate();
                tracing::warn!(key = %key, error = %e, "rate limit check failed");
                return Decision::Indeterminate;
            }
        };

        let decision = evaluate(&snapshot, rate, self.clock.now());
        match &decision {
            Decision::Allowed(_) => self.metrics.record_allowed(),
            Decision::Limited(quota) => {
                self.metrics.record_limited();
                tracing::warn!(
                    key = %key,
                    rate = %rate,
                    count = snapshot.count,
                    reset_in_secs = quota.retry_after(self.clock.now()),
                    "rate limit exceeded"
                );
            }
            Decision::Indeterminate => self.metrics.record_indeterminate(),
        }
        decision
    }

    pub fn metrics(&self) -> &GovernanceMetrics {
        &self.metrics
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: CounterStore> Limiter for RateLimiter<S> {
    fn check(&self, key: &RateLimitKey, rate: &Rate) -> Decision {
        RateLimiter::check(self, key, rate)
    }
}

/// Turn a post-increment snapshot into a decision at `now`.
pub fn evaluate(snapshot: &WindowSnapshot, rate: &Rate, now: SystemTime) -> Decision {
    let period = rate.period();
    let fraction = snapshot.elapsed_fraction(now, period);
    let weighted = weighted_count(snapshot.count, snapshot.previous, fraction);
    let limit = rate.limit() as f64;

    let quota = Quota {
        limit: rate.limit(),
        remaining: if weighted >= limit {
            0
        } else {
            (limit - weighted).floor() as u64
        },
        reset_at: snapshot.window_start + period,
    };

    if weighted <= limit {
        Decision::Allowed(quota)
    } else {
        Decision::Limited(quota)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::circuit_breaker::CircuitBreakerConfig;
    use crate::domain::key::ClientId;
    use crate::domain::window::from_epoch_millis;
    use crate::infrastructure::mocks::{MockClock, OutageStore};
    use crate::infrastructure::storage::MemoryStore;
    use std::thread;
    use std::time::Duration;

    const T0: u64 = 1_700_006_400;

    fn limiter() -> (RateLimiter<Arc<MemoryStore>>, MockClock) {
        let clock = MockClock::at_epoch_secs(T0);
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(MemoryStore::new(Arc::clone(&shared)));
        (RateLimiter::new(store, shared), clock)
    }

    fn key(route: &str) -> RateLimitKey {
        RateLimitKey::new(route, ClientId::Ip("10.0.0.1".to_string()))
    }

    #[test]
    fn test_three_per_minute() {
        let (limiter, clock) = limiter();
        let rate: Rate = "3/minute".parse().unwrap();
        let k = key("orders.list");

        let mut remaining = vec![];
        for _ in 0..3 {
            let decision = limiter.check(&k, &rate);
            assert!(decision.is_allowed());
            remaining.push(decision.remaining().unwrap());
            clock.advance(Duration::from_millis(200));
        }
        assert_eq!(remaining, vec![2, 1, 0]);

        let fourth = limiter.check(&k, &rate);
        assert!(fourth.is_limited());
        assert_eq!(fourth.remaining(), Some(0));
        assert_eq!(
            fourth.reset_at(),
            Some(from_epoch_millis((T0 + 60) * 1_000))
        );
    }

    #[test]
    fn test_rejected_requests_still_count() {
        let (limiter, clock) = limiter();
        let rate = Rate::per_minute(2);
        let k = key("search");

        for _ in 0..6 {
            limiter.check(&k, &rate);
        }

        // Half way through the next window the previous six still weigh 3.
        clock.advance(Duration::from_secs(90));
        assert!(limiter.check(&k, &rate).is_limited());
    }

    #[test]
    fn test_previous_window_decays() {
        let (limiter, clock) = limiter();
        let rate = Rate::per_minute(10);
        let k = key("feed");

        for _ in 0..10 {
            assert!(limiter.check(&k, &rate).is_allowed());
        }

        // (elapsed seconds into next window, expected allowed hits before limit)
        let table = [(0u64, 0u64), (30, 5), (45, 7)];
        for (elapsed, expected) in table {
            let (limiter, clock) = self::limiter();
            for _ in 0..10 {
                limiter.check(&k, &rate);
            }
            clock.advance(Duration::from_secs(60 + elapsed));
            let mut allowed = 0;
            while limiter.check(&k, &rate).is_allowed() {
                allowed += 1;
            }
            assert_eq!(allowed, expected, "elapsed {}s", elapsed);
        }

        // After a full idle window the old count no longer matters.
        clock.advance(Duration::from_secs(120));
        assert_eq!(limiter.check(&k, &rate).remaining(), Some(9));
    }

    #[test]
    fn test_keys_are_independent() {
        let (limiter, _clock) = limiter();
        let rate = Rate::per_second(1);

        assert!(limiter.check(&key("a"), &rate).is_allowed());
        assert!(limiter.check(&key("b"), &rate).is_allowed());
        assert!(limiter.check(&key("a"), &rate).is_limited());

        let other_client = RateLimitKey::new("a", ClientId::User("42".to_string()));
        assert!(limiter.check(&other_client, &rate).is_allowed());
    }

    #[test]
    fn test_outage_is_indeterminate() {
        let clock = MockClock::at_epoch_secs(T0);
        let shared: Arc<dyn Clock> = Arc::new(clock);
        let store = OutageStore::new(MemoryStore::new(Arc::clone(&shared)));
        let limiter = RateLimiter::new(store.clone(), shared);
        let rate = Rate::per_minute(1);

        store.go_down();
        assert_eq!(limiter.check(&key("r"), &rate), Decision::Indeterminate);
        assert_eq!(limiter.metrics().indeterminate(), 1);

        store.come_back();
        assert!(limiter.check(&key("r"), &rate).is_allowed());
    }

    #[test]
    fn test_open_circuit_skips_store() {
        let clock = MockClock::at_epoch_secs(T0);
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = OutageStore::new(MemoryStore::new(Arc::clone(&shared)));
        let breaker = Arc::new(CircuitBreaker::with_config(
            CircuitBreakerConfig {
                failure_threshold: 2,
                recovery_timeout: Duration::from_secs(5),
            },
            Arc::clone(&shared),
        ));
        let limiter = RateLimiter::with_parts(
            store.clone(),
            shared,
            GovernanceMetrics::new(),
            breaker,
        );
        let rate = Rate::per_minute(100);

        store.go_down();
        for _ in 0..5 {
            assert!(limiter.check(&key("r"), &rate).is_indeterminate());
        }
        assert_eq!(store.rejected_calls(), 2);

        store.come_back();
        assert!(limiter.check(&key("r"), &rate).is_indeterminate());

        clock.advance(Duration::from_secs(5));
        assert!(limiter.check(&key("r"), &rate).is_allowed());
        assert!(limiter.check(&key("r"), &rate).is_allowed());
    }

    #[test]
    fn test_concurrent_checks_admit_exactly_limit() {
        let (limiter, _clock) = limiter();
        let limiter = Arc::new(limiter);
        let rate = Rate::per_minute(50);

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                thread::spawn(move || {
                    (0..20)
                        .filter(|_| limiter.check(&key("hot"), &rate).is_allowed())
                        .count()
                })
            })
            .collect();

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 50);
        assert_eq!(limiter.metrics().limited(), 150);
    }
}
