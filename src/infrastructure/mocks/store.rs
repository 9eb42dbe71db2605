//! Counter Store wrapper that can simulate a backend outage.

use crate::application::ports::{CounterStore, StoreError};
use crate::domain::record::{IdempotencyRecord, LeaseToken};
use crate::domain::window::WindowSnapshot;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Wraps a store and fails every call with `BackendUnavailable` while the
/// outage switch is on.
///
/// Clones share the switch, so a test can keep one handle and give another
/// to the component under test.
///
/// ```
/// use request_governance::infrastructure::mocks::{MockClock, OutageStore};
/// use request_governance::application::ports::CounterStore;
/// use request_governance::MemoryStore;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let clock = Arc::new(MockClock::at_epoch_secs(0));
/// let store = OutageStore::new(MemoryStore::new(clock));
/// store.go_down();
/// assert!(store.try_acquire("k", Duration::from_secs(1)).is_err());
/// store.come_back();
/// assert!(store.try_acquire("k", Duration::from_secs(1)).unwrap());
/// ```
#[derive(Debug)]
pub struct OutageStore<S> {
    inner: Arc<S>,
    down: Arc<AtomicBool>,
    rejected_calls: Arc<AtomicU64>,
}

impl<S> Clone for OutageStore<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            down: Arc::clone(&self.down),
            rejected_calls: Arc::clone(&self.rejected_calls),
        }
    }
}

impl<S: CounterStore> OutageStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner: Arc::new(inner),
            down: Arc::new(AtomicBool::new(false)),
            rejected_calls: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn go_down(&self) {
        self.down.store(true, Ordering::SeqCst);
    }

    pub fn come_back(&self) {
        self.down.store(false, Ordering::SeqCst);
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }

    /// Calls refused while the outage was active.
    pub fn rejected_calls(&self) -> u64 {
        self.rejected_calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn guard(&self) -> Result<(), StoreError> {
        if self.is_down() {
            self.rejected_calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::unavailable("simulated outage"))
        } else {
            Ok(())
        }
    }
}

impl<S: CounterStore> CounterStore for OutageStore<S> {
    fn increment_and_check(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<WindowSnapshot, StoreError> {
        self.guard()?;
        self.inner.increment_and_check(key, window)
    }

    fn acquire_lease(
        &self,
        key: &str,
        lease: Duration,
    ) -> Result<Option<LeaseToken>, StoreError> {
        self.guard()?;
        self.inner.acquire_lease(key, lease)
    }

    fn complete(&self, key: &str, result: &[u8], ttl: Duration) -> Result<(), StoreError> {
        self.guard()?;
        self.inner.complete(key, result, ttl)
    }

    fn complete_if_held(
        &self,
        key: &str,
        lease: LeaseToken,
        result: &[u8],
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.guard()?;
        self.inner.complete_if_held(key, lease, result, ttl)
    }

    fn read(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        self.guard()?;
        self.inner.read(key)
    }

    fn release(&self, key: &str) -> Result<(), StoreError> {
        self.guard()?;
        self.inner.release(key)
    }

    fn release_if_held(&self, key: &str, lease: LeaseToken) -> Result<bool, StoreError> {
        self.guard()?;
        self.inner.release_if_held(key, lease)
    }

    fn purge_expired(&self) -> Result<usize, StoreError> {
        self.guard()?;
        self.inner.purge_expired()
    }

    fn reset(&self) -> Result<(), StoreError> {
        self.inner.reset()
    }
}
