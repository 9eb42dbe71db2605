//! Governance pipeline.
//!
//! A [`Governor`] composes a [`Limiter`], an [`IdempotencyGuard`] and an
//! [`Emitter`] around one operation:
//!
//! 1. `RequestStarted` is emitted.
//! 2. The rate limit for the route is checked.
//! 3. Guarded methods carrying an idempotency token go through `begin`.
//! 4. The caller runs the operation and settles the [`Permit`] with
//!    [`complete`](Governor::complete) or [`fail`](Governor::fail).
//!
//! Unknown governance state (store unreachable) is resolved by the single
//! deployment-wide [`FailurePolicy`].

use crate::application::events::EventBus;
use crate::application::idempotency::IdempotencyConfig;
use crate::application::metrics::GovernanceMetrics;
use crate::application::ports::{
    Clock, CounterStore, Emitter, IdempotencyGuard, Limiter, StoreError,
};
use crate::domain::event::EventType;
use crate::domain::key::{CallerContext, IdempotencyKey, KeyStrategy, RateLimitKey};
use crate::domain::policy::FailurePolicy;
use crate::domain::rate::Rate;
use crate::domain::record::{LeaseToken, Outcome};
use crate::domain::window::{Decision, Quota};
use crate::payload;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Rate limit override for one route.
#[derive(Debug, Clone, Default)]
pub struct RouteLimit {
    /// Rate for the route; `None` inherits the default rate.
    pub rate: Option<Rate>,
    /// Key strategy for the route; `None` inherits the default strategy.
    pub key: Option<KeyStrategy>,
    /// Skip rate limiting for the route entirely.
    pub exempt: bool,
}

impl RouteLimit {
    pub fn rate(rate: Rate) -> Self {
        Self {
            rate: Some(rate),
            ..Self::default()
        }
    }

    pub fn exempt() -> Self {
        Self {
            exempt: true,
            ..Self::default()
        }
    }

    pub fn with_key(mut self, key: KeyStrategy) -> Self {
        self.key = Some(key);
        self
    }
}

/// Everything the pipeline decides with, fixed at build time.
#[derive(Debug, Clone, Default)]
pub struct GovernorSettings {
    pub default_rate: Option<Rate>,
    pub default_key: KeyStrategy,
    pub routes: HashMap<String, RouteLimit>,
    pub failure_policy: FailurePolicy,
    pub idempotency: IdempotencyConfig,
}

impl GovernorSettings {
    /// Rate and key strategy for `route`, or `None` when it is not limited.
    pub fn limit_for(&self, route: &str) -> Option<(Rate, &KeyStrategy)> {
        let route_limit = self.routes.get(route);
        if route_limit.is_some_and(|r| r.exempt) {
            return None;
        }
        let rate = route_limit.and_then(|r| r.rate).or(self.default_rate)?;
        let key = route_limit
            .and_then(|r| r.key.as_ref())
            .unwrap_or(&self.default_key);
        Some((rate, key))
    }
}

/// What the boundary knows about one incoming operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationContext {
    pub route: String,
    pub method: String,
    pub caller: CallerContext,
    /// Value of the idempotency header, if the client sent one.
    pub idempotency_token: Option<String>,
}

impl OperationContext {
    pub fn new(route: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            method: method.into(),
            ..Self::default()
        }
    }

    pub fn caller(mut self, caller: CallerContext) -> Self {
        self.caller = caller;
        self
    }

    pub fn idempotency_token(mut self, token: impl Into<String>) -> Self {
        self.idempotency_token = Some(token.into());
        self
    }
}

/// An idempotency lease held on behalf of a permit.
#[derive(Debug)]
struct HeldLease {
    key: IdempotencyKey,
    token: LeaseToken,
    ttl: Duration,
}

/// Permission to run an admitted operation.
///
/// Settle it with [`Governor::complete`] or [`Governor::fail`]. A permit
/// that is dropped unsettled leaves its idempotency record pending until
/// the lease runs out.
#[derive(Debug)]
#[must_use = "an admitted operation must be settled with complete or fail"]
pub struct Permit {
    route: String,
    method: String,
    held: Option<HeldLease>,
    quota: Option<Quota>,
    started_at: SystemTime,
}

impl Permit {
    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// The key this permit holds the lease for, if the operation is guarded.
    pub fn idempotency_key(&self) -> Option<&IdempotencyKey> {
        self.held.as_ref().map(|held| &held.key)
    }

    pub fn lease(&self) -> Option<LeaseToken> {
        self.held.as_ref().map(|held| held.token)
    }

    /// Replay TTL the result will be stored with by
    /// [`Governor::complete`].
    pub fn replay_ttl(&self) -> Option<Duration> {
        self.held.as_ref().map(|held| held.ttl)
    }

    pub fn is_guarded(&self) -> bool {
        self.held.is_some()
    }

    pub fn quota(&self) -> Option<&Quota> {
        self.quota.as_ref()
    }
}

/// Result of [`Governor::admit`].
#[derive(Debug)]
pub enum Admission {
    /// Run the operation, then settle the permit.
    Proceed(Permit),
    /// Over the rate limit.
    RateLimited(Quota),
    /// The same idempotency key is being processed by another caller.
    Conflict,
    /// The operation already ran; return this stored result.
    Replayed(Vec<u8>),
    /// Governance state was unknown and the failure policy is closed.
    Unavailable,
}

impl Admission {
    pub fn is_proceed(&self) -> bool {
        matches!(self, Admission::Proceed(_))
    }

    pub fn permit(&self) -> Option<&Permit> {
        match self {
            Admission::Proceed(permit) => Some(permit),
            _ => None,
        }
    }

    pub fn into_permit(self) -> Option<Permit> {
        match self {
            Admission::Proceed(permit) => Some(permit),
            _ => None,
        }
    }

    /// Quota to report to the client, when a rate limit was evaluated.
    pub fn quota(&self) -> Option<&Quota> {
        match self {
            Admission::Proceed(permit) => permit.quota(),
            Admission::RateLimited(quota) => Some(quota),
            _ => None,
        }
    }

    pub fn limit(&self) -> Option<u64> {
        self.quota().map(|q| q.limit)
    }

    pub fn remaining(&self) -> Option<u64> {
        self.quota().map(|q| q.remaining)
    }

    pub fn reset_at(&self) -> Option<SystemTime> {
        self.quota().map(|q| q.reset_at)
    }
}

/// The governance pipeline.
pub struct Governor {
    limiter: Arc<dyn Limiter>,
    guard: Arc<dyn IdempotencyGuard>,
    emitter: Arc<dyn Emitter>,
    clock: Arc<dyn Clock>,
    metrics: GovernanceMetrics,
    settings: GovernorSettings,
    events: Option<Arc<EventBus>>,
    store: Option<Arc<dyn CounterStore>>,
}

impl fmt::Debug for Governor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Governor")
            .field("settings", &self.settings)
            .field("metrics", &self.metrics.snapshot())
            .finish_non_exhaustive()
    }
}

impl Governor {
    /// Assemble a governor from its stages. Most callers want
    /// [`GovernorBuilder`](crate::GovernorBuilder).
    pub fn from_parts(
        limiter: Arc<dyn Limiter>,
        guard: Arc<dyn IdempotencyGuard>,
        emitter: Arc<dyn Emitter>,
        clock: Arc<dyn Clock>,
        settings: GovernorSettings,
    ) -> Self {
        Self {
            limiter,
            guard,
            emitter,
            clock,
            metrics: GovernanceMetrics::new(),
            settings,
            events: None,
            store: None,
        }
    }

    pub fn with_metrics(mut self, metrics: GovernanceMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Keep a handle on the bus events are published to, for subscribers.
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Keep a handle on the store behind the limiter and guard, for
    /// [`reset`](Self::reset).
    pub fn with_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// The event bus, when the governor was built with one.
    pub fn events(&self) -> Option<&Arc<EventBus>> {
        self.events.as_ref()
    }

    /// Drop all counters, records, subscriptions and metrics. Intended for
    /// test harnesses.
    ///
    /// # Errors
    /// Returns the store error if the store could not be cleared.
    pub fn reset(&self) -> Result<(), StoreError> {
        if let Some(store) = &self.store {
            store.reset()?;
        }
        if let Some(events) = &self.events {
            events.clear();
        }
        self.metrics.reset();
        Ok(())
    }

    pub fn settings(&self) -> &GovernorSettings {
        &self.settings
    }

    pub fn metrics(&self) -> &GovernanceMetrics {
        &self.metrics
    }

    /// Decide whether an operation may run.
    ///
    /// A second caller with an in-flight key is refused immediately; see
    /// [`admit_async`](Self::admit_async) for the waiting variant.
    pub fn admit(&self, ctx: &OperationContext) -> Admission {
        let quota = match self.check_rate(ctx) {
            Ok(quota) => quota,
            Err(refused) => return refused,
        };
        let begun = self.idempotency_key(ctx).map(|(key, ttl)| {
            let outcome = self.guard.begin(&key, self.settings.idempotency.lease);
            (key, ttl, outcome)
        });
        self.resolve(ctx, quota, begun)
    }

    /// [`admit`](Self::admit), honouring the configured
    /// [`ConcurrencyPolicy`](crate::ConcurrencyPolicy) for in-flight keys.
    #[cfg(feature = "async")]
    pub async fn admit_async(&self, ctx: &OperationContext) -> Admission {
        let quota = match self.check_rate(ctx) {
            Ok(quota) => quota,
            Err(refused) => return refused,
        };
        let begun = match self.idempotency_key(ctx) {
            Some((key, ttl)) => {
                let outcome = crate::application::idempotency::begin_or_wait(
                    &*self.guard,
                    &key,
                    self.settings.idempotency.lease,
                    self.settings.idempotency.concurrency,
                )
                .await;
                Some((key, ttl, outcome))
            }
            None => None,
        };
        self.resolve(ctx, quota, begun)
    }

    /// Settle a permit after the operation succeeded.
    ///
    /// Guarded operations store `result` for replay with the route's TTL.
    /// `RequestCompleted` is emitted either way; its `result_stored` field
    /// is false when the permit's lease had already lapsed.
    ///
    /// # Errors
    /// Returns the store error if the result could not be recorded. The
    /// operation itself still succeeded; duplicates are refused until the
    /// lease expires and then run again.
    pub fn complete(&self, permit: Permit, result: &[u8]) -> Result<(), StoreError> {
        let ttl = permit.replay_ttl();
        self.settle(permit, result, ttl)
    }

    /// [`complete`](Self::complete) with an explicit replay TTL.
    pub fn complete_with_ttl(
        &self,
        permit: Permit,
        result: &[u8],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.settle(permit, result, Some(ttl))
    }

    fn settle(
        &self,
        permit: Permit,
        result: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let stored = match &permit.held {
            Some(held) => self.guard.complete(
                &held.key,
                held.token,
                result,
                ttl.unwrap_or(held.ttl),
            ),
            None => Ok(false),
        };
        self.metrics.record_completed();
        self.emitter.emit(
            EventType::RequestCompleted,
            payload! {
                "route" => permit.route,
                "method" => permit.method,
                "duration_ms" => self.elapsed_ms(permit.started_at),
                "idempotent" => permit.held.is_some(),
                "result_stored" => matches!(stored, Ok(true)),
            },
        );
        stored.map(|_| ())
    }

    /// Settle a permit after the operation failed.
    ///
    /// Guarded operations release their record so a retry runs again.
    /// `UnhandledError` is emitted either way; `release_failed` is set when
    /// the record could not be released and stays pending until its lease
    /// expires.
    pub fn fail(&self, permit: Permit, error: &dyn fmt::Display) {
        let release_failed = match &permit.held {
            Some(held) => self.guard.abort(&held.key, held.token).is_err(),
            None => false,
        };
        self.metrics.record_failed();
        self.emitter.emit(
            EventType::UnhandledError,
            payload! {
                "route" => permit.route,
                "method" => permit.method,
                "error" => error.to_string(),
                "duration_ms" => self.elapsed_ms(permit.started_at),
                "release_failed" => release_failed,
            },
        );
    }

    /// Emit `RequestStarted` and apply the rate limit.
    fn check_rate(&self, ctx: &OperationContext) -> Result<Option<Quota>, Admission> {
        self.emitter.emit(
            EventType::RequestStarted,
            payload! {
                "route" => ctx.route,
                "method" => ctx.method,
                "user_id" => ctx.caller.user_id,
            },
        );

        let Some((rate, strategy)) = self.settings.limit_for(&ctx.route) else {
            return Ok(None);
        };
        let key = RateLimitKey::new(ctx.route.as_str(), strategy.resolve(&ctx.caller));

        match self.limiter.check(&key, &rate) {
            Decision::Allowed(quota) => Ok(Some(quota)),
            Decision::Limited(quota) => {
                self.emitter.emit(
                    EventType::RateLimitExceeded,
                    payload! {
                        "key" => key.to_string(),
                        "route" => ctx.route,
                        "rate" => rate.to_string(),
                        "remaining" => quota.remaining,
                        "retry_after" => quota.retry_after(self.clock.now()),
                    },
                );
                Err(Admission::RateLimited(quota))
            }
            Decision::Indeterminate => {
                if self.settings.failure_policy.admits_unknown() {
                    tracing::warn!(key = %key, "rate limit unknown, admitting");
                    Ok(None)
                } else {
                    tracing::warn!(key = %key, "rate limit unknown, refusing");
                    Err(Admission::Unavailable)
                }
            }
        }
    }

    /// Key and replay TTL for a guarded operation.
    fn idempotency_key(&self, ctx: &OperationContext) -> Option<(IdempotencyKey, Duration)> {
        let token = ctx.idempotency_token.as_deref()?;
        let route = self.settings.idempotency.for_route(&ctx.route)?;
        if token.is_empty() || !route.guards(&ctx.method) {
            return None;
        }
        let key = IdempotencyKey::new(
            ctx.route.as_str(),
            route.scope,
            ctx.caller.user_id.as_deref(),
            token,
        );
        Some((key, route.ttl))
    }

    fn resolve(
        &self,
        ctx: &OperationContext,
        quota: Option<Quota>,
        begun: Option<(IdempotencyKey, Duration, Outcome)>,
    ) -> Admission {
        let held = match begun {
            None => None,
            Some((key, ttl, Outcome::New(token))) => Some(HeldLease { key, token, ttl }),
            Some((key, _, Outcome::InFlight)) => {
                self.emitter.emit(
                    EventType::IdempotencyConflict,
                    payload! {
                        "route" => ctx.route,
                        "idempotency_key" => key.token(),
                    },
                );
                return Admission::Conflict;
            }
            Some((key, _, Outcome::Replay(result))) => {
                self.emitter.emit(
                    EventType::IdempotencyReplay,
                    payload! {
                        "route" => ctx.route,
                        "idempotency_key" => key.token(),
                    },
                );
                return Admission::Replayed(result);
            }
            Some((key, _, Outcome::Indeterminate)) => {
                if self.settings.failure_policy.admits_unknown() {
                    tracing::warn!(
                        route = %ctx.route,
                        idempotency_key = key.token(),
                        "idempotency state unknown, running unguarded"
                    );
                    None
                } else {
                    tracing::warn!(
                        route = %ctx.route,
                        idempotency_key = key.token(),
                        "idempotency state unknown, refusing"
                    );
                    return Admission::Unavailable;
                }
            }
        };

        Admission::Proceed(Permit {
            route: ctx.route.clone(),
            method: ctx.method.clone(),
            held,
            quota,
            started_at: self.clock.now(),
        })
    }

    fn elapsed_ms(&self, since: SystemTime) -> u64 {
        self.clock
            .now()
            .duration_since(since)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::idempotency::RouteIdempotency;
    use crate::domain::event::Payload;
    use crate::domain::key::{ClientId, IdempotencyScope};
    use crate::domain::window::from_epoch_millis;
    use std::sync::Mutex;

    const T0: u64 = 1_700_006_400;

    #[derive(Debug)]
    struct FixedClock;

    impl Clock for FixedClock {
        fn now(&self) -> SystemTime {
            from_epoch_millis(T0 * 1_000)
        }
    }

    fn quota(remaining: u64) -> Quota {
        Quota {
            limit: 5,
            remaining,
            reset_at: from_epoch_millis((T0 + 60) * 1_000),
        }
    }

    struct ScriptedLimiter {
        decision: Decision,
        seen: Mutex<Vec<String>>,
    }

    impl Limiter for ScriptedLimiter {
        fn check(&self, key: &RateLimitKey, _rate: &Rate) -> Decision {
            self.seen.lock().unwrap().push(key.to_string());
            self.decision
        }
    }

    #[derive(Default)]
    struct ScriptedGuard {
        outcome: Mutex<Option<Outcome>>,
        begun: Mutex<Vec<IdempotencyKey>>,
        completed: Mutex<Vec<Vec<u8>>>,
        ttls: Mutex<Vec<Duration>>,
        aborted: Mutex<usize>,
        lease_lost: Mutex<bool>,
        store_down: Mutex<bool>,
    }

    impl IdempotencyGuard for ScriptedGuard {
        fn try_begin(&self, key: &IdempotencyKey, _lease: Duration) -> Outcome {
            self.begun.lock().unwrap().push(key.clone());
            self.outcome
                .lock()
                .unwrap()
                .clone()
                .unwrap_or(Outcome::New(LeaseToken::new(1)))
        }

        fn complete(
            &self,
            _key: &IdempotencyKey,
            _lease: LeaseToken,
            result: &[u8],
            ttl: Duration,
        ) -> Result<bool, StoreError> {
            if *self.lease_lost.lock().unwrap() {
                return Ok(false);
            }
            self.completed.lock().unwrap().push(result.to_vec());
            self.ttls.lock().unwrap().push(ttl);
            Ok(true)
        }

        fn abort(&self, _key: &IdempotencyKey, _lease: LeaseToken) -> Result<bool, StoreError> {
            if *self.store_down.lock().unwrap() {
                return Err(StoreError::unavailable("connection refused"));
            }
            *self.aborted.lock().unwrap() += 1;
            Ok(true)
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(EventType, Payload)>>);

    impl Emitter for Recorder {
        fn emit(&self, event_type: EventType, payload: Payload) {
            self.0.lock().unwrap().push((event_type, payload));
        }
    }

    impl Recorder {
        fn types(&self) -> Vec<EventType> {
            self.0.lock().unwrap().iter().map(|(t, _)| *t).collect()
        }
    }

    struct Fixture {
        governor: Governor,
        limiter: Arc<ScriptedLimiter>,
        guard: Arc<ScriptedGuard>,
        events: Arc<Recorder>,
    }

    fn fixture(decision: Decision, settings: GovernorSettings) -> Fixture {
        let limiter = Arc::new(ScriptedLimiter {
            decision,
            seen: Mutex::new(Vec::new()),
        });
        let guard = Arc::new(ScriptedGuard::default());
        let events = Arc::new(Recorder::default());
        let governor = Governor::from_parts(
            limiter.clone(),
            guard.clone(),
            events.clone(),
            Arc::new(FixedClock),
            settings,
        );
        Fixture {
            governor,
            limiter,
            guard,
            events,
        }
    }

    fn limited_settings() -> GovernorSettings {
        GovernorSettings {
            default_rate: Some(Rate::per_minute(5)),
            ..GovernorSettings::default()
        }
    }

    fn post() -> OperationContext {
        OperationContext::new("orders.create", "POST")
            .caller(CallerContext::user(None, "u1"))
            .idempotency_token("order-42")
    }

    #[test]
    fn test_allowed_unguarded_request() {
        let f = fixture(Decision::Allowed(quota(4)), limited_settings());
        let ctx = OperationContext::new("orders.list", "GET")
            .caller(CallerContext::anonymous("10.0.0.1".parse().unwrap()))
            .idempotency_token("ignored-for-get");

        let admission = f.governor.admit(&ctx);
        assert_eq!(admission.remaining(), Some(4));
        let permit = admission.into_permit().unwrap();
        assert!(!permit.is_guarded());
        assert_eq!(
            *f.limiter.seen.lock().unwrap(),
            vec!["orders.list:ip:10.0.0.1"]
        );

        f.governor.complete(permit, b"[]").unwrap();
        assert!(f.guard.completed.lock().unwrap().is_empty());
        assert_eq!(
            f.events.types(),
            vec![EventType::RequestStarted, EventType::RequestCompleted]
        );
    }

    #[test]
    fn test_rate_limited_emits_and_stops() {
        let f = fixture(Decision::Limited(quota(0)), limited_settings());

        let admission = f.governor.admit(&post());
        assert!(matches!(admission, Admission::RateLimited(_)));
        assert_eq!(admission.remaining(), Some(0));

        let events = f.events.0.lock().unwrap();
        assert_eq!(events[1].0, EventType::RateLimitExceeded);
        assert_eq!(events[1].1["key"], "orders.create:ip:unknown");
        assert_eq!(events[1].1["rate"], "5/minute");
        assert_eq!(events[1].1["retry_after"], 60);
    }

    #[test]
    fn test_route_override_and_exemption() {
        let mut settings = limited_settings();
        settings.routes.insert(
            "orders.create".to_string(),
            RouteLimit::rate(Rate::per_minute(1)).with_key(KeyStrategy::User),
        );
        settings
            .routes
            .insert("health".to_string(), RouteLimit::exempt());

        let (rate, key) = settings.limit_for("orders.create").unwrap();
        assert_eq!(rate, Rate::per_minute(1));
        assert_eq!(
            key.resolve(&CallerContext::user(None, "u1")),
            ClientId::User("u1".to_string())
        );
        assert!(settings.limit_for("health").is_none());
        assert_eq!(settings.limit_for("other").unwrap().0, Rate::per_minute(5));
        assert!(GovernorSettings::default().limit_for("other").is_none());
    }

    #[test]
    fn test_guarded_request_completes_with_result() {
        let f = fixture(Decision::Allowed(quota(4)), limited_settings());

        let permit = f.governor.admit(&post()).into_permit().unwrap();
        let key = permit.idempotency_key().unwrap().clone();
        assert_eq!(
            key,
            IdempotencyKey::new("orders.create", IdempotencyScope::User, Some("u1"), "order-42")
        );

        f.governor.complete(permit, b"{\"id\": 7}").unwrap();
        assert_eq!(
            *f.guard.completed.lock().unwrap(),
            vec![b"{\"id\": 7}".to_vec()]
        );
        assert_eq!(f.governor.metrics().completed(), 1);
    }

    #[test]
    fn test_conflict_and_replay() {
        let f = fixture(Decision::Allowed(quota(4)), limited_settings());

        *f.guard.outcome.lock().unwrap() = Some(Outcome::InFlight);
        assert!(matches!(f.governor.admit(&post()), Admission::Conflict));

        *f.guard.outcome.lock().unwrap() = Some(Outcome::Replay(b"stored".to_vec()));
        match f.governor.admit(&post()) {
            Admission::Replayed(body) => assert_eq!(body, b"stored"),
            other => panic!("expected replay, got {:?}", other),
        }

        let types = f.events.types();
        assert!(types.contains(&EventType::IdempotencyConflict));
        assert!(types.contains(&EventType::IdempotencyReplay));
    }

    #[test]
    fn test_fail_aborts_and_emits_error() {
        let f = fixture(Decision::Allowed(quota(4)), limited_settings());

        let permit = f.governor.admit(&post()).into_permit().unwrap();
        assert_eq!(permit.lease(), Some(LeaseToken::new(1)));
        f.governor.fail(permit, &"db timeout");

        assert_eq!(*f.guard.aborted.lock().unwrap(), 1);
        let events = f.events.0.lock().unwrap();
        let (last_type, last_payload) = events.last().unwrap();
        assert_eq!(*last_type, EventType::UnhandledError);
        assert_eq!(last_payload["error"], "db timeout");
        assert_eq!(last_payload["release_failed"], false);
    }

    #[test]
    fn test_fail_reports_unreleased_record() {
        let f = fixture(Decision::Allowed(quota(4)), limited_settings());

        let permit = f.governor.admit(&post()).into_permit().unwrap();
        *f.guard.store_down.lock().unwrap() = true;
        f.governor.fail(permit, &"db timeout");

        assert_eq!(*f.guard.aborted.lock().unwrap(), 0);
        let events = f.events.0.lock().unwrap();
        let (_, last_payload) = events.last().unwrap();
        assert_eq!(last_payload["release_failed"], true);
        assert_eq!(f.governor.metrics().failed(), 1);
    }

    #[test]
    fn test_lost_lease_reported_on_completion() {
        let f = fixture(Decision::Allowed(quota(4)), limited_settings());

        let permit = f.governor.admit(&post()).into_permit().unwrap();
        *f.guard.lease_lost.lock().unwrap() = true;
        f.governor.complete(permit, b"late").unwrap();

        assert!(f.guard.completed.lock().unwrap().is_empty());
        let events = f.events.0.lock().unwrap();
        let (last_type, last_payload) = events.last().unwrap();
        assert_eq!(*last_type, EventType::RequestCompleted);
        assert_eq!(last_payload["idempotent"], true);
        assert_eq!(last_payload["result_stored"], false);
    }

    #[test]
    fn test_route_idempotency_overrides() {
        let mut settings = limited_settings();
        settings.idempotency.routes.insert(
            "payments.capture".to_string(),
            RouteIdempotency::default()
                .with_ttl(Duration::from_secs(600))
                .with_scope(IdempotencyScope::Global)
                .with_methods(["PUT"]),
        );
        settings
            .idempotency
            .routes
            .insert("orders.create".to_string(), RouteIdempotency::disabled());
        let f = fixture(Decision::Allowed(quota(4)), settings);

        let permit = f.governor.admit(&post()).into_permit().unwrap();
        assert!(!permit.is_guarded());
        f.governor.complete(permit, b"{}").unwrap();

        let capture = |method: &str| {
            OperationContext::new("payments.capture", method)
                .caller(CallerContext::user(None, "u1"))
                .idempotency_token("cap-1")
        };
        let post_permit = f.governor.admit(&capture("POST")).into_permit().unwrap();
        assert!(!post_permit.is_guarded());
        f.governor.complete(post_permit, b"{}").unwrap();

        let permit = f.governor.admit(&capture("PUT")).into_permit().unwrap();
        assert_eq!(
            permit.idempotency_key(),
            Some(&IdempotencyKey::global("payments.capture", "cap-1"))
        );
        assert_eq!(permit.replay_ttl(), Some(Duration::from_secs(600)));
        f.governor.complete(permit, b"captured").unwrap();

        assert_eq!(f.guard.begun.lock().unwrap().len(), 1);
        assert_eq!(*f.guard.ttls.lock().unwrap(), vec![Duration::from_secs(600)]);
    }

    #[test]
    fn test_default_ttl_used_without_override() {
        let f = fixture(Decision::Allowed(quota(4)), limited_settings());

        let permit = f.governor.admit(&post()).into_permit().unwrap();
        f.governor.complete(permit, b"ok").unwrap();

        assert_eq!(
            *f.guard.ttls.lock().unwrap(),
            vec![IdempotencyConfig::default().default_ttl]
        );
    }

    #[test]
    fn test_failure_policy_applies_to_both_stages() {
        let closed = fixture(Decision::Indeterminate, limited_settings());
        assert!(matches!(
            closed.governor.admit(&post()),
            Admission::Unavailable
        ));

        let open = fixture(
            Decision::Indeterminate,
            GovernorSettings {
                failure_policy: FailurePolicy::FailOpen,
                ..limited_settings()
            },
        );
        *open.guard.outcome.lock().unwrap() = Some(Outcome::Indeterminate);
        let permit = open.governor.admit(&post()).into_permit().unwrap();
        assert!(!permit.is_guarded());
        assert!(permit.quota().is_none());

        let closed_guard = fixture(Decision::Allowed(quota(4)), limited_settings());
        *closed_guard.guard.outcome.lock().unwrap() = Some(Outcome::Indeterminate);
        assert!(matches!(
            closed_guard.governor.admit(&post()),
            Admission::Unavailable
        ));
    }
}
