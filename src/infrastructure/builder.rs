//! Governor assembly.
//!
//! [`GovernorBuilder`] wires one store, one clock, one set of metrics and
//! one circuit breaker into the rate limiter, the idempotency coordinator
//! and the event bus, and hands back a ready [`Governor`].

use crate::application::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::application::events::EventBus;
use crate::application::governor::{Governor, GovernorSettings, RouteLimit};
use crate::application::idempotency::{
    IdempotencyConfig, IdempotencyCoordinator, RouteIdempotency,
};
use crate::application::limiter::RateLimiter;
use crate::application::metrics::GovernanceMetrics;
use crate::application::ports::{Clock, CounterStore, Emitter};
use crate::domain::key::KeyStrategy;
use crate::domain::policy::{ConcurrencyPolicy, FailurePolicy};
use crate::domain::rate::Rate;
use crate::infrastructure::clock::SystemClock;
use crate::infrastructure::config::{validate, ConfigError, GovernanceConfig};
use crate::infrastructure::storage::MemoryStore;
use std::sync::Arc;

/// Builder for [`Governor`].
///
/// # Example
/// ```
/// use request_governance::{GovernorBuilder, Rate, RouteLimit, KeyStrategy};
///
/// let governor = GovernorBuilder::new()
///     .default_rate(Rate::per_minute(200))
///     .route("orders.create", RouteLimit::rate(Rate::per_minute(5)).with_key(KeyStrategy::User))
///     .route("health", RouteLimit::exempt())
///     .build()
///     .unwrap();
///
/// assert!(governor.settings().limit_for("health").is_none());
/// ```
#[derive(Debug, Default)]
pub struct GovernorBuilder {
    clock: Option<Arc<dyn Clock>>,
    store: Option<Arc<dyn CounterStore>>,
    event_bus: Option<Arc<EventBus>>,
    settings: GovernorSettings,
    circuit_breaker: CircuitBreakerConfig,
    counter_prefix: Option<String>,
}

impl GovernorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from file configuration.
    ///
    /// # Errors
    /// Returns the first invalid value in the document.
    pub fn from_config(config: &GovernanceConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            settings: config.settings()?,
            ..Self::default()
        })
    }

    /// Set a custom clock (mainly for testing).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Counter Store shared by the limiter and the coordinator.
    ///
    /// Default: an in-process [`MemoryStore`].
    pub fn store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Publish lifecycle events to an existing bus.
    ///
    /// Default: a fresh bus, reachable through [`Governor::events`].
    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Rate applied to routes without an override. Without one, only routes
    /// with an explicit rate are limited.
    pub fn default_rate(mut self, rate: Rate) -> Self {
        self.settings.default_rate = Some(rate);
        self
    }

    pub fn default_key(mut self, key: KeyStrategy) -> Self {
        self.settings.default_key = key;
        self
    }

    /// Override the limit for one route.
    pub fn route(mut self, route: impl Into<String>, limit: RouteLimit) -> Self {
        self.settings.routes.insert(route.into(), limit);
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.settings.failure_policy = policy;
        self
    }

    pub fn idempotency(mut self, config: IdempotencyConfig) -> Self {
        self.settings.idempotency = config;
        self
    }

    /// Override idempotency for one route: turn it off, or change its
    /// replay TTL, scope or guarded methods.
    pub fn idempotent_route(mut self, route: impl Into<String>, config: RouteIdempotency) -> Self {
        self.settings.idempotency.routes.insert(route.into(), config);
        self
    }

    /// What a second caller with an in-flight key experiences.
    pub fn concurrency(mut self, policy: ConcurrencyPolicy) -> Self {
        self.settings.idempotency.concurrency = policy;
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    /// Store key prefix for window counters.
    pub fn counter_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.counter_prefix = Some(prefix.into());
        self
    }

    /// Build the governor.
    ///
    /// # Errors
    /// Returns `ConfigError` if the settings are invalid.
    pub fn build(self) -> Result<Governor, ConfigError> {
        validate(&self.settings)?;
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Zero("circuit breaker failure_threshold"));
        }

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()) as Arc<dyn Clock>);
        let store = self.store.unwrap_or_else(|| {
            Arc::new(MemoryStore::new(Arc::clone(&clock))) as Arc<dyn CounterStore>
        });

        // One breaker for both stages: they talk to the same backend.
        let metrics = GovernanceMetrics::new();
        let circuit_breaker = Arc::new(CircuitBreaker::with_config(
            self.circuit_breaker,
            Arc::clone(&clock),
        ));

        let mut limiter = RateLimiter::with_parts(
            Arc::clone(&store),
            Arc::clone(&clock),
            metrics.clone(),
            Arc::clone(&circuit_breaker),
        );
        if let Some(prefix) = self.counter_prefix {
            limiter = limiter.with_prefix(prefix);
        }
        let coordinator = IdempotencyCoordinator::with_parts(
            Arc::clone(&store),
            self.settings.idempotency.clone(),
            metrics.clone(),
            circuit_breaker,
        );
        let events = self.event_bus.unwrap_or_else(|| {
            Arc::new(EventBus::with_metrics(Arc::clone(&clock), metrics.clone()))
        });

        tracing::debug!(
            default_rate = ?self.settings.default_rate,
            routes = self.settings.routes.len(),
            failure_policy = ?self.settings.failure_policy,
            "governor built"
        );

        Ok(Governor::from_parts(
            Arc::new(limiter),
            Arc::new(coordinator),
            Arc::clone(&events) as Arc<dyn Emitter>,
            clock,
            self.settings,
        )
        .with_metrics(metrics)
        .with_event_bus(events)
        .with_store(store))
    }
}

impl Governor {
    /// Start configuring a governor.
    pub fn builder() -> GovernorBuilder {
        GovernorBuilder::new()
    }
}
