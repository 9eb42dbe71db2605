//! # request-governance
//!
//! Rate limiting, idempotency-key deduplication and lifecycle events for API
//! operations, independent of any web framework.
//!
//! A [`Governor`] sits in front of an operation. For every call it:
//!
//! 1. emits `RequestStarted`,
//! 2. counts the call against the route's sliding-window rate limit,
//! 3. for guarded methods carrying an idempotency token, claims the token or
//!    replays the stored result of an earlier call,
//! 4. hands back a [`Permit`] that the caller settles with
//!    [`Governor::complete`] or [`Governor::fail`].
//!
//! Counters and records live in a [`CounterStore`]: the in-process
//! [`MemoryStore`] by default, or [`RedisStore`] (feature `redis-store`) to
//! share state across processes.
//!
//! ## Quick Start
//!
//! ```rust
//! use request_governance::{
//!     Admission, CallerContext, GovernorBuilder, KeyStrategy, OperationContext, Rate, RouteLimit,
//! };
//! use std::net::{IpAddr, Ipv4Addr};
//!
//! let governor = GovernorBuilder::new()
//!     .default_rate(Rate::per_minute(200))
//!     .route("orders.create", RouteLimit::rate("5/minute".parse().unwrap()).with_key(KeyStrategy::User))
//!     .build()
//!     .unwrap();
//!
//! let ctx = OperationContext::new("orders.create", "POST")
//!     .caller(CallerContext::user(Some(IpAddr::V4(Ipv4Addr::LOCALHOST)), "u-42"))
//!     .idempotency_token("order-7f3a");
//!
//! match governor.admit(&ctx) {
//!     Admission::Proceed(permit) => {
//!         let response = br#"{"order":17}"#;
//!         governor.complete(permit, response).unwrap();
//!     }
//!     Admission::Replayed(body) => println!("replaying {} bytes", body.len()),
//!     Admission::RateLimited(quota) => println!("retry at {:?}", quota.reset_at),
//!     Admission::Conflict => println!("same key still running"),
//!     Admission::Unavailable => println!("governance backend down"),
//! }
//!
//! // A retry with the same token replays the stored response.
//! assert!(matches!(governor.admit(&ctx), Admission::Replayed(_)));
//! ```
//!
//! ## Rate Limiting
//!
//! Limits use a weighted sliding window: the previous fixed window's count
//! is blended into the current one by how much of the current window is
//! left, so a client cannot double its quota at a window boundary.
//!
//! - Rates are written `"<limit>/<second|minute|hour|day>"` and parsed once
//! - Keys combine the route with the client: address, user id, or a custom function
//! - Every call counts, including rejected ones
//! - Routes can override the default rate or be exempted entirely
//!
//! ## Idempotency
//!
//! A token moves through `pending` (lease held) and `completed` (result
//! stored for replay). Exactly one concurrent caller wins a token; the rest
//! get a conflict, or with [`ConcurrencyPolicy::WaitAndReplay`] and
//! [`Governor::admit_async`], wait for the winner and replay its result.
//! A failed operation releases its token so a retry runs again; a crashed
//! one is released when its lease expires.
//!
//! ## Events
//!
//! The [`EventBus`] delivers lifecycle events to subscribers in subscription
//! order. A failing or panicking handler is logged and counted, never
//! propagated:
//!
//! ```rust
//! use request_governance::{EventType, GovernorBuilder, Handler};
//!
//! let governor = GovernorBuilder::new().build().unwrap();
//! governor.events().unwrap().subscribe(
//!     EventType::RateLimitExceeded,
//!     Handler::sync(|event| {
//!         println!("limited: {:?}", event.str_field("key"));
//!         Ok(())
//!     }),
//! );
//! ```
//!
//! ## Failure Handling
//!
//! When the store cannot be reached the governance state is unknown. One
//! deployment-wide [`FailurePolicy`] decides the outcome: `FailClosed`
//! (default) refuses with [`Admission::Unavailable`]; `FailOpen` runs the
//! operation without the failed check. A [`CircuitBreaker`] shared by the
//! limiter and the coordinator stops calling a dead backend until its
//! recovery timeout has passed.
//!
//! ## Configuration
//!
//! Everything the builder accepts can also come from TOML; see
//! [`GovernanceConfig`].
//!
//! ## Feature Flags
//!
//! - `async` (default): [`EventBus::emit_async`], [`Governor::admit_async`], [`PurgeTask`]
//! - `redis-store`: [`RedisStore`]
//! - `test-helpers`: mocks under `infrastructure::mocks`

// Domain layer - pure business logic
pub mod domain;

// Application layer - orchestration
pub mod application;

// Infrastructure layer - external adapters
pub mod infrastructure;

#[doc(hidden)]
pub use serde_json as __serde_json;

// Re-export commonly used types for convenience
pub use domain::{
    event::{EventEnvelope, EventType, Payload, UnknownEventType},
    key::{CallerContext, ClientId, IdempotencyKey, IdempotencyScope, KeyStrategy, RateLimitKey},
    policy::{ConcurrencyPolicy, FailurePolicy},
    rate::{parse_ttl, Rate, RateParseError, TtlParseError},
    record::{IdempotencyRecord, LeaseToken, Outcome, RecordState},
    window::{Decision, Quota, WindowSnapshot},
};

pub use application::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState},
    events::{EventBus, EventFilter, Handler, HandlerError, HandlerResult, SubscriptionId},
    governor::{Admission, Governor, GovernorSettings, OperationContext, Permit, RouteLimit},
    idempotency::{IdempotencyConfig, IdempotencyCoordinator, RouteGuard, RouteIdempotency},
    limiter::RateLimiter,
    metrics::{GovernanceMetrics, MetricsSnapshot},
    ports::{Clock, CounterStore, Emitter, IdempotencyGuard, Limiter, StoreError},
};

pub use infrastructure::{
    builder::GovernorBuilder,
    clock::SystemClock,
    config::{ConfigError, GovernanceConfig},
    storage::MemoryStore,
};

#[cfg(feature = "async")]
pub use infrastructure::maintenance::{PurgeHandle, PurgeTask};

#[cfg(feature = "redis-store")]
pub use infrastructure::redis_store::{RedisStore, RedisStoreConfig};
