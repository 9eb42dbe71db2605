//! Ports (interfaces) for the application layer.
//!
//! The Counter Store and Clock are driven ports implemented by
//! infrastructure adapters. `Limiter`, `IdempotencyGuard` and `Emitter` are
//! the narrow capabilities the [`Governor`](crate::Governor) pipeline is
//! composed from, so each stage can be swapped or faked independently.

use crate::domain::event::{EventType, Payload};
use crate::domain::key::{IdempotencyKey, RateLimitKey};
use crate::domain::rate::Rate;
use crate::domain::record::{IdempotencyRecord, LeaseToken, Outcome};
use crate::domain::window::{Decision, WindowSnapshot};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Port for obtaining the current wall-clock time.
///
/// Wall-clock rather than monotonic time, because window boundaries and
/// record expiry must agree across processes sharing one backend.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> SystemTime;
}

/// Errors raised by a Counter Store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backing storage could not be reached or did not answer.
    #[error("counter store backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl StoreError {
    pub fn unavailable(reason: impl std::fmt::Display) -> Self {
        StoreError::BackendUnavailable(reason.to_string())
    }
}

/// Port for key→counter persistence shared by the limiter and coordinator.
///
/// Every operation is atomic with respect to concurrent callers on the same
/// key. Operations on different keys must not serialize through one lock.
pub trait CounterStore: Send + Sync + Debug {
    /// Count one hit for `key` in the window of length `window` containing
    /// now, rolling the counter forward first if needed.
    fn increment_and_check(&self, key: &str, window: Duration)
        -> Result<WindowSnapshot, StoreError>;

    /// Create a pending record leased for `lease` iff no unexpired record
    /// exists. Returns whether the record was created.
    fn try_acquire(&self, key: &str, lease: Duration) -> Result<bool, StoreError> {
        Ok(self.acquire_lease(key, lease)?.is_some())
    }

    /// [`try_acquire`](Self::try_acquire), returning the token of the new
    /// lease. Every successful acquire issues a token never issued before
    /// for `key`.
    fn acquire_lease(&self, key: &str, lease: Duration)
        -> Result<Option<LeaseToken>, StoreError>;

    /// Overwrite the record as completed with `result`, expiring after `ttl`.
    fn complete(&self, key: &str, result: &[u8], ttl: Duration) -> Result<(), StoreError>;

    /// [`complete`](Self::complete), but only while `lease` is the unexpired
    /// lease on a pending record. Returns whether the record was written.
    fn complete_if_held(
        &self,
        key: &str,
        lease: LeaseToken,
        result: &[u8],
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Read the record for `key`. Expired records read as absent.
    fn read(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Delete the record for `key` unconditionally.
    fn release(&self, key: &str) -> Result<(), StoreError>;

    /// Delete the record only while `lease` is the unexpired lease on a
    /// pending record. Completed records are never touched. Returns whether
    /// a record was deleted.
    fn release_if_held(&self, key: &str, lease: LeaseToken) -> Result<bool, StoreError>;

    /// Drop expired counters and records. Never required for correctness.
    fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(0)
    }

    /// Remove all state. Intended for test harnesses.
    fn reset(&self) -> Result<(), StoreError>;
}

impl<T> CounterStore for Arc<T>
where
    T: CounterStore + ?Sized,
{
    fn increment_and_check(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<WindowSnapshot, StoreError> {
        (**self).increment_and_check(key, window)
    }

    fn try_acquire(&self, key: &str, lease: Duration) -> Result<bool, StoreError> {
        (**self).try_acquire(key, lease)
    }

    fn acquire_lease(
        &self,
        key: &str,
        lease: Duration,
    ) -> Result<Option<LeaseToken>, StoreError> {
        (**self).acquire_lease(key, lease)
    }

    fn complete(&self, key: &str, result: &[u8], ttl: Duration) -> Result<(), StoreError> {
        (**self).complete(key, result, ttl)
    }

    fn complete_if_held(
        &self,
        key: &str,
        lease: LeaseToken,
        result: &[u8],
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        (**self).complete_if_held(key, lease, result, ttl)
    }

    fn read(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        (**self).read(key)
    }

    fn release(&self, key: &str) -> Result<(), StoreError> {
        (**self).release(key)
    }

    fn release_if_held(&self, key: &str, lease: LeaseToken) -> Result<bool, StoreError> {
        (**self).release_if_held(key, lease)
    }

    fn purge_expired(&self) -> Result<usize, StoreError> {
        (**self).purge_expired()
    }

    fn reset(&self) -> Result<(), StoreError> {
        (**self).reset()
    }
}

/// Rate limiting capability.
pub trait Limiter: Send + Sync {
    fn check(&self, key: &RateLimitKey, rate: &Rate) -> Decision;
}

/// Idempotency capability.
///
/// `complete` and `abort` settle only the record `lease` still holds and
/// report whether they did.
pub trait IdempotencyGuard: Send + Sync {
    /// Look up or acquire `key` without counting the outcome.
    fn try_begin(&self, key: &IdempotencyKey, lease: Duration) -> Outcome;

    /// Count an outcome the caller acted on.
    fn record(&self, _outcome: &Outcome) {}

    /// [`try_begin`](Self::try_begin), counted.
    fn begin(&self, key: &IdempotencyKey, lease: Duration) -> Outcome {
        let outcome = self.try_begin(key, lease);
        self.record(&outcome);
        outcome
    }

    fn complete(
        &self,
        key: &IdempotencyKey,
        lease: LeaseToken,
        result: &[u8],
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    fn abort(&self, key: &IdempotencyKey, lease: LeaseToken) -> Result<bool, StoreError>;
}

/// Lifecycle notification capability.
pub trait Emitter: Send + Sync {
    fn emit(&self, event_type: EventType, payload: Payload);
}
