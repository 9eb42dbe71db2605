//! Idempotency coordinator.
//!
//! Record lifecycle per key:
//!
//! ```text
//! ABSENT --begin--> PENDING --complete--> COMPLETED --ttl--> ABSENT
//!                      |  \--abort-----------------------------^
//!                      \--lease elapses--> treated as ABSENT
//! ```
//!
//! At most one caller holds PENDING for a key at a time; the store's
//! acquire-if-absent is the only arbiter. `begin` hands the winner a
//! [`LeaseToken`], and `complete` and `abort` act only while that token
//! still holds the record. A holder that outlived its lease therefore
//! cannot overwrite or delete what the next holder stored.

use crate::application::circuit_breaker::CircuitBreaker;
use crate::application::metrics::GovernanceMetrics;
use crate::application::ports::{Clock, CounterStore, IdempotencyGuard, StoreError};
use crate::domain::key::{IdempotencyKey, IdempotencyScope};
use crate::domain::policy::ConcurrencyPolicy;
use crate::domain::record::{IdempotencyRecord, LeaseToken, Outcome, RecordState};
use std::collections::HashMap;
use std::panic;
use std::sync::Arc;
use std::time::Duration;

/// Header carrying the client's idempotency token.
pub const DEFAULT_HEADER: &str = "X-Idempotency-Key";

/// Default prefix for idempotency record keys in the store.
pub const DEFAULT_RECORD_PREFIX: &str = "gov:idem";

/// Settings for the idempotency coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyConfig {
    /// Header the boundary reads the client token from.
    pub header: String,
    /// How long completed results are replayed.
    pub default_ttl: Duration,
    /// How long a pending record blocks duplicates before it is presumed
    /// abandoned.
    pub lease: Duration,
    pub prefix: String,
    pub scope: IdempotencyScope,
    /// Upper-case method names that are guarded.
    pub methods: Vec<String>,
    pub concurrency: ConcurrencyPolicy,
    /// Guard routes that have no entry in `routes`. When off, only the
    /// routes listed there are guarded.
    pub all_routes: bool,
    /// Per-route overrides.
    pub routes: HashMap<String, RouteIdempotency>,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            header: DEFAULT_HEADER.to_string(),
            default_ttl: Duration::from_secs(24 * 60 * 60),
            lease: Duration::from_secs(30),
            prefix: DEFAULT_RECORD_PREFIX.to_string(),
            scope: IdempotencyScope::User,
            methods: vec!["POST".to_string(), "PATCH".to_string()],
            concurrency: ConcurrencyPolicy::Reject,
            all_routes: true,
            routes: HashMap::new(),
        }
    }
}

impl IdempotencyConfig {
    /// Whether requests with this method are guarded on routes without an
    /// override. Case-insensitive.
    pub fn guards(&self, method: &str) -> bool {
        guards(&self.methods, method)
    }

    /// Settings in effect for `route`, or `None` when the route is not
    /// guarded at all.
    pub fn for_route(&self, route: &str) -> Option<RouteGuard<'_>> {
        match self.routes.get(route) {
            Some(route) if !route.enabled => None,
            Some(route) => Some(RouteGuard {
                ttl: route.ttl.unwrap_or(self.default_ttl),
                scope: route.scope.unwrap_or(self.scope),
                methods: route.methods.as_deref().unwrap_or(&self.methods),
            }),
            None if self.all_routes => Some(RouteGuard {
                ttl: self.default_ttl,
                scope: self.scope,
                methods: &self.methods,
            }),
            None => None,
        }
    }
}

fn guards(methods: &[String], method: &str) -> bool {
    methods.iter().any(|m| m.eq_ignore_ascii_case(method))
}

/// Idempotency override for one route. Unset fields inherit the
/// deployment's settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteIdempotency {
    pub enabled: bool,
    pub ttl: Option<Duration>,
    pub scope: Option<IdempotencyScope>,
    pub methods: Option<Vec<String>>,
}

impl Default for RouteIdempotency {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: None,
            scope: None,
            methods: None,
        }
    }
}

impl RouteIdempotency {
    /// Never deduplicate requests to the route.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_scope(mut self, scope: IdempotencyScope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn with_methods<I, M>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: AsRef<str>,
    {
        self.methods = Some(
            methods
                .into_iter()
                .map(|m| m.as_ref().to_ascii_uppercase())
                .collect(),
        );
        self
    }
}

/// Idempotency settings resolved for one route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteGuard<'a> {
    pub ttl: Duration,
    pub scope: IdempotencyScope,
    methods: &'a [String],
}

impl RouteGuard<'_> {
    pub fn guards(&self, method: &str) -> bool {
        guards(self.methods, method)
    }
}

/// Coordinates duplicate suppression through a [`CounterStore`].
#[derive(Debug, Clone)]
pub struct IdempotencyCoordinator<S> {
    store: S,
    metrics: GovernanceMetrics,
    circuit_breaker: Arc<CircuitBreaker>,
    config: IdempotencyConfig,
}

impl<S: CounterStore> IdempotencyCoordinator<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>) -> Self {
        Self::with_parts(
            store,
            IdempotencyConfig::default(),
            GovernanceMetrics::new(),
            Arc::new(CircuitBreaker::new(clock)),
        )
    }

    pub fn with_parts(
        store: S,
        config: IdempotencyConfig,
        metrics: GovernanceMetrics,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            store,
            metrics,
            circuit_breaker,
            config,
        }
    }

    pub fn with_config(mut self, config: IdempotencyConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    pub fn metrics(&self) -> &GovernanceMetrics {
        &self.metrics
    }

    /// Try to take ownership of `key` for `lease`, counting the outcome.
    ///
    /// Never returns an error: an unreachable store yields
    /// [`Outcome::Indeterminate`].
    pub fn begin(&self, key: &IdempotencyKey, lease: Duration) -> Outcome {
        let outcome = self.try_begin(key, lease);
        self.record_outcome(&outcome);
        outcome
    }

    /// [`begin`](Self::begin) without touching metrics, for callers that
    /// poll and count only the outcome they finally act on.
    pub fn try_begin(&self, key: &IdempotencyKey, lease: Duration) -> Outcome {
        let storage_key = key.storage_key(&self.config.prefix);
        match self.acquire(&storage_key, lease) {
            Ok(Outcome::Replay(result)) => {
                tracing::debug!(
                    route = key.route(),
                    bytes = result.len(),
                    "replaying stored result"
                );
                Outcome::Replay(result)
            }
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(
                    route = key.route(),
                    error = %e,
                    "idempotency check failed"
                );
                Outcome::Indeterminate
            }
        }
    }

    /// Count an outcome returned by [`try_begin`](Self::try_begin).
    pub fn record_outcome(&self, outcome: &Outcome) {
        match outcome {
            Outcome::New(_) => {}
            Outcome::InFlight => self.metrics.record_conflict(),
            Outcome::Replay(_) => self.metrics.record_replay(),
            Outcome::Indeterminate => self.metrics.record_indeterminate(),
        }
    }

    /// Store `result` for replay and move the record to COMPLETED.
    ///
    /// Returns `false` without writing when `lease` no longer holds the
    /// record: it lapsed and was released or taken over.
    ///
    /// # Errors
    /// Returns the store error if the result could not be written. The
    /// pending record then expires with its lease.
    pub fn complete(
        &self,
        key: &IdempotencyKey,
        lease: LeaseToken,
        result: &[u8],
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let storage_key = key.storage_key(&self.config.prefix);
        match self.write(|| self.store.complete_if_held(&storage_key, lease, result, ttl)) {
            Ok(true) => Ok(true),
            Ok(false) => {
                tracing::warn!(
                    route = key.route(),
                    %lease,
                    "lease lost before completion, result not stored"
                );
                Ok(false)
            }
            Err(e) => {
                tracing::warn!(route = key.route(), error = %e, "failed to store idempotent result");
                Err(e)
            }
        }
    }

    /// Drop the record so the next attempt with `key` starts fresh.
    ///
    /// Only the pending record `lease` still holds is removed; a completed
    /// record or another caller's lease is left alone and `false` is
    /// returned.
    ///
    /// # Errors
    /// Returns the store error if the record could not be removed. The
    /// pending record then expires with its lease.
    pub fn abort(&self, key: &IdempotencyKey, lease: LeaseToken) -> Result<bool, StoreError> {
        let storage_key = key.storage_key(&self.config.prefix);
        match self.write(|| self.store.release_if_held(&storage_key, lease)) {
            Ok(released) => {
                if !released {
                    tracing::debug!(route = key.route(), %lease, "lease no longer held, nothing released");
                }
                Ok(released)
            }
            Err(e) => {
                tracing::warn!(route = key.route(), error = %e, "failed to release idempotency record");
                Err(e)
            }
        }
    }

    /// [`begin`](Self::begin), then apply the configured
    /// [`ConcurrencyPolicy`] to an `InFlight` result.
    #[cfg(feature = "async")]
    pub async fn begin_or_wait(&self, key: &IdempotencyKey, lease: Duration) -> Outcome {
        begin_or_wait(self, key, lease, self.config.concurrency).await
    }

    fn acquire(&self, storage_key: &str, lease: Duration) -> Result<Outcome, StoreError> {
        self.read_through(|| {
            if let Some(outcome) = self.existing(storage_key)? {
                return Ok(outcome);
            }
            if let Some(token) = self.store.acquire_lease(storage_key, lease)? {
                return Ok(Outcome::New(token));
            }
            // Lost the race: whoever won has either completed or is pending.
            Ok(self
                .existing(storage_key)?
                .unwrap_or(Outcome::InFlight))
        })
    }

    fn existing(&self, storage_key: &str) -> Result<Option<Outcome>, StoreError> {
        Ok(self.store.read(storage_key)?.map(outcome_for))
    }

    /// Run a store interaction behind the circuit breaker.
    fn read_through<T>(
        &self,
        op: impl FnOnce() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        if !self.circuit_breaker.allow_call() {
            return Err(StoreError::unavailable("circuit open"));
        }
        self.write(op)
    }

    /// Run a store interaction, recording its result with the circuit
    /// breaker. Writes that settle a lease are attempted even while the
    /// circuit is open.
    fn write<T>(&self, op: impl FnOnce() -> Result<T, StoreError>) -> Result<T, StoreError> {
        let result = panic::catch_unwind(panic::AssertUnwindSafe(op))
            .unwrap_or_else(|_| Err(StoreError::unavailable("counter store panicked")));
        match &result {
            Ok(_) => self.circuit_breaker.record_success(),
            Err(_) => self.circuit_breaker.record_failure(),
        }
        result
    }
}

/// Begin through any [`IdempotencyGuard`], waiting out an `InFlight`
/// result when `policy` says so.
///
/// Under `WaitAndReplay` the guard is polled until the holder completes
/// (`Replay`), aborts or lets its lease lapse (`New` for this caller), or
/// the timeout passes (`InFlight`). Only the final outcome is counted.
#[cfg(feature = "async")]
pub async fn begin_or_wait<G>(
    guard: &G,
    key: &IdempotencyKey,
    lease: Duration,
    policy: ConcurrencyPolicy,
) -> Outcome
where
    G: IdempotencyGuard + ?Sized,
{
    let first = guard.try_begin(key, lease);
    let (timeout, poll_interval) = match policy {
        ConcurrencyPolicy::WaitAndReplay {
            timeout,
            poll_interval,
        } if first.is_in_flight() => (timeout, poll_interval),
        _ => {
            guard.record(&first);
            return first;
        }
    };

    let waited = tokio::time::timeout(timeout, async {
        loop {
            tokio::time::sleep(poll_interval).await;
            match guard.try_begin(key, lease) {
                Outcome::InFlight => continue,
                other => return other,
            }
        }
    })
    .await;

    let outcome = waited.unwrap_or(Outcome::InFlight);
    guard.record(&outcome);
    outcome
}

fn outcome_for(record: IdempotencyRecord) -> Outcome {
    match record.state {
        RecordState::Pending => Outcome::InFlight,
        RecordState::Completed => Outcome::Replay(record.result.unwrap_or_default()),
    }
}

impl<S: CounterStore> IdempotencyGuard for IdempotencyCoordinator<S> {
    fn try_begin(&self, key: &IdempotencyKey, lease: Duration) -> Outcome {
        IdempotencyCoordinator::try_begin(self, key, lease)
    }

    fn record(&self, outcome: &Outcome) {
        self.record_outcome(outcome);
    }

    fn begin(&self, key: &IdempotencyKey, lease: Duration) -> Outcome {
        IdempotencyCoordinator::begin(self, key, lease)
    }

    fn complete(
        &self,
        key: &IdempotencyKey,
        lease: LeaseToken,
        result: &[u8],
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        IdempotencyCoordinator::complete(self, key, lease, result, ttl)
    }

    fn abort(&self, key: &IdempotencyKey, lease: LeaseToken) -> Result<bool, StoreError> {
        IdempotencyCoordinator::abort(self, key, lease)
    }
}
