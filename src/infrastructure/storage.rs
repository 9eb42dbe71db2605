//! In-process Counter Store.
//!
//! Window counters and idempotency records live in two sharded maps. All
//! read-modify-write operations go through `DashMap::entry`, which holds the
//! shard's write lock for the duration of the closure: operations on one key
//! are linearizable while unrelated keys proceed on other shards.
//!
//! Expired state is dropped lazily. Reads hide expired records, and writes
//! sweep both maps at most once per sweep interval, so keys that are never
//! touched again do not accumulate without a maintenance task.

use crate::application::ports::{Clock, CounterStore, StoreError};
use crate::domain::record::{IdempotencyRecord, LeaseToken};
use crate::domain::window::{align_window, epoch_millis, WindowCounter, WindowSnapshot};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// How often writes sweep expired entries unless configured otherwise.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    counter: WindowCounter,
    window_ms: u64,
}

/// Thread-safe sharded Counter Store backed by DashMap.
///
/// Suitable for single-process deployments and tests.
#[derive(Debug)]
pub struct MemoryStore {
    counters: DashMap<String, CounterEntry>,
    records: DashMap<String, IdempotencyRecord>,
    clock: Arc<dyn Clock>,
    next_lease: AtomicU64,
    sweep_interval: Option<Duration>,
    last_sweep_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let now_ms = epoch_millis(clock.now());
        Self {
            counters: DashMap::new(),
            records: DashMap::new(),
            clock,
            next_lease: AtomicU64::new(1),
            sweep_interval: Some(DEFAULT_SWEEP_INTERVAL),
            last_sweep_ms: AtomicU64::new(now_ms),
        }
    }

    /// Change how often writes sweep expired entries. `None` leaves expired
    /// entries in place until [`purge_expired`](CounterStore::purge_expired).
    pub fn with_sweep_interval(mut self, every: Option<Duration>) -> Self {
        self.sweep_interval = every;
        self
    }

    /// Number of tracked window counters, expired ones included.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    /// Number of stored idempotency records, expired ones included.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    fn sweep(&self, now: SystemTime) -> usize {
        let now_ms = epoch_millis(now);
        let before = self.counters.len() + self.records.len();

        self.counters
            .retain(|_, e| !e.counter.is_expired(now_ms, e.window_ms));
        self.records.retain(|_, r| !r.is_expired(now));

        let after = self.counters.len() + self.records.len();
        before.saturating_sub(after)
    }

    /// Sweep if the interval has passed. Must not be called while holding a
    /// map guard.
    fn maybe_sweep(&self, now: SystemTime) {
        let Some(every) = self.sweep_interval else {
            return;
        };
        let now_ms = epoch_millis(now);
        let last = self.last_sweep_ms.load(Ordering::Acquire);
        if now_ms.saturating_sub(last) < window_millis(every) {
            return;
        }
        // One writer per interval pays for the sweep.
        if self
            .last_sweep_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let removed = self.sweep(now);
        if removed > 0 {
            tracing::debug!(removed, "swept expired counters and records");
        }
    }
}

fn window_millis(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1)
}

impl CounterStore for MemoryStore {
    fn increment_and_check(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<WindowSnapshot, StoreError> {
        let window_ms = window_millis(window);
        let now = self.clock.now();
        let now_ms = epoch_millis(now);

        let snapshot = {
            let mut entry = self
                .counters
                .entry(key.to_string())
                .or_insert_with(|| CounterEntry {
                    counter: WindowCounter::new(align_window(now_ms, window_ms)),
                    window_ms,
                });

            // A key reused with a different period starts over.
            if entry.window_ms != window_ms {
                *entry = CounterEntry {
                    counter: WindowCounter::new(align_window(now_ms, window_ms)),
                    window_ms,
                };
            }
            entry.counter.increment(now_ms, window_ms)
        };

        self.maybe_sweep(now);
        Ok(snapshot)
    }

    fn acquire_lease(
        &self,
        key: &str,
        lease: Duration,
    ) -> Result<Option<LeaseToken>, StoreError> {
        let now = self.clock.now();
        let pending = |token| IdempotencyRecord::pending(key, token, now, now + lease);

        let acquired = match self.records.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    let token = LeaseToken::new(self.next_lease.fetch_add(1, Ordering::Relaxed));
                    occupied.insert(pending(token));
                    Some(token)
                } else {
                    None
                }
            }
            Entry::Vacant(vacant) => {
                let token = LeaseToken::new(self.next_lease.fetch_add(1, Ordering::Relaxed));
                vacant.insert(pending(token));
                Some(token)
            }
        };

        self.maybe_sweep(now);
        Ok(acquired)
    }

    fn complete(&self, key: &str, result: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.records.insert(
            key.to_string(),
            IdempotencyRecord::completed(key, result.to_vec(), now, now + ttl),
        );
        Ok(())
    }

    fn complete_if_held(
        &self,
        key: &str,
        lease: LeaseToken,
        result: &[u8],
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        match self.records.get_mut(key) {
            Some(mut record) if record.is_held_by(lease, now) => {
                *record = IdempotencyRecord::completed(key, result.to_vec(), now, now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn read(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        let now = self.clock.now();
        let record = self.records.get(key).map(|r| r.value().clone());

        match record {
            Some(r) if r.is_expired(now) => {
                self.records.remove_if(key, |_, v| v.is_expired(now));
                Ok(None)
            }
            other => Ok(other),
        }
    }

    fn release(&self, key: &str) -> Result<(), StoreError> {
        self.records.remove(key);
        Ok(())
    }

    fn release_if_held(&self, key: &str, lease: LeaseToken) -> Result<bool, StoreError> {
        let now = self.clock.now();
        Ok(self
            .records
            .remove_if(key, |_, record| record.is_held_by(lease, now))
            .is_some())
    }

    fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(self.sweep(self.clock.now()))
    }

    fn reset(&self) -> Result<(), StoreError> {
        self.counters.clear();
        self.records.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::record::RecordState;
    use crate::infrastructure::mocks::MockClock;
    use std::thread;

    const T0: u64 = 1_700_006_400;

    fn store() -> (MemoryStore, MockClock) {
        let clock = MockClock::at_epoch_secs(T0);
        (MemoryStore::new(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_increment_counts_per_key() {
        let (store, _clock) = store();
        let minute = Duration::from_secs(60);

        assert_eq!(store.increment_and_check("a", minute).unwrap().count, 1);
        assert_eq!(store.increment_and_check("a", minute).unwrap().count, 2);
        assert_eq!(store.increment_and_check("b", minute).unwrap().count, 1);
        assert_eq!(store.counter_count(), 2);
    }

    #[test]
    fn test_increment_rolls_window() {
        let (store, clock) = store();
        let minute = Duration::from_secs(60);

        for _ in 0..3 {
            store.increment_and_check("a", minute).unwrap();
        }
        clock.advance(Duration::from_secs(60));
        let snap = store.increment_and_check("a", minute).unwrap();
        assert_eq!(snap.count, 1);
        assert_eq!(snap.previous, 3);
    }

    #[test]
    fn test_try_acquire_is_exclusive_until_lease_expires() {
        let (store, clock) = store();
        let lease = Duration::from_secs(30);

        assert!(store.try_acquire("k", lease).unwrap());
        assert!(!store.try_acquire("k", lease).unwrap());

        clock.advance(Duration::from_secs(30));
        assert!(store.try_acquire("k", lease).unwrap());
    }

    #[test]
    fn test_complete_overwrites_and_read_hides_expired() {
        let (store, clock) = store();

        store.try_acquire("k", Duration::from_secs(30)).unwrap();
        store
            .complete("k", b"{\"id\":7}", Duration::from_secs(60))
            .unwrap();

        let record = store.read("k").unwrap().unwrap();
        assert_eq!(record.state, RecordState::Completed);
        assert_eq!(record.result.as_deref(), Some(&b"{\"id\":7}"[..]));

        clock.advance(Duration::from_secs(60));
        assert!(store.read("k").unwrap().is_none());
        assert_eq!(store.record_count(), 0);
    }

    #[test]
    fn test_release_is_unconditional() {
        let (store, _clock) = store();
        store.try_acquire("k", Duration::from_secs(30)).unwrap();
        store.release("k").unwrap();
        store.release("missing").unwrap();
        assert!(store.read("k").unwrap().is_none());
    }

    #[test]
    fn test_stale_lease_cannot_settle() {
        let (store, clock) = store();
        let lease = Duration::from_secs(30);

        let stale = store.acquire_lease("k", lease).unwrap().unwrap();
        clock.advance(Duration::from_secs(31));
        let live = store.acquire_lease("k", lease).unwrap().unwrap();
        assert_ne!(stale, live);

        assert!(!store.release_if_held("k", stale).unwrap());
        assert!(!store.complete_if_held("k", stale, b"late", lease).unwrap());
        assert_eq!(store.read("k").unwrap().unwrap().lease, Some(live));

        assert!(store
            .complete_if_held("k", live, b"charged-once", Duration::from_secs(3_600))
            .unwrap());
        // Completed records are never released, not even by their last holder.
        assert!(!store.release_if_held("k", live).unwrap());
        assert!(!store.release_if_held("k", stale).unwrap());

        let record = store.read("k").unwrap().unwrap();
        assert_eq!(record.state, RecordState::Completed);
        assert_eq!(record.result.as_deref(), Some(&b"charged-once"[..]));
    }

    #[test]
    fn test_holder_releases_its_own_lease() {
        let (store, _clock) = store();
        let token = store
            .acquire_lease("k", Duration::from_secs(30))
            .unwrap()
            .unwrap();
        assert!(store.release_if_held("k", token).unwrap());
        assert!(store.read("k").unwrap().is_none());
        assert!(!store.release_if_held("k", token).unwrap());
    }

    #[test]
    fn test_idle_keys_swept_on_write() {
        let (store, clock) = store();
        for i in 0..1_000 {
            store
                .increment_and_check(&format!("gov:rl:{}", i), Duration::from_secs(1))
                .unwrap();
        }
        store.try_acquire("gov:idem:old", Duration::from_secs(30)).unwrap();
        assert_eq!(store.counter_count(), 1_000);

        clock.advance(Duration::from_secs(3_600));
        for _ in 0..10 {
            store
                .increment_and_check("gov:rl:fresh", Duration::from_secs(1))
                .unwrap();
        }

        assert_eq!(store.counter_count(), 1);
        assert_eq!(store.record_count(), 0);
    }

    #[test]
    fn test_sweep_waits_for_interval() {
        let (store, clock) = store();
        store
            .increment_and_check("a", Duration::from_secs(1))
            .unwrap();

        clock.advance(Duration::from_secs(30));
        store
            .increment_and_check("b", Duration::from_secs(1))
            .unwrap();
        assert_eq!(store.counter_count(), 2);

        clock.advance(Duration::from_secs(30));
        store
            .increment_and_check("b", Duration::from_secs(1))
            .unwrap();
        assert_eq!(store.counter_count(), 1);
    }

    #[test]
    fn test_sweep_can_be_disabled() {
        let clock = MockClock::at_epoch_secs(T0);
        let store = MemoryStore::new(Arc::new(clock.clone())).with_sweep_interval(None);
        store
            .increment_and_check("a", Duration::from_secs(1))
            .unwrap();
        clock.advance(Duration::from_secs(3_600));
        store
            .increment_and_check("b", Duration::from_secs(1))
            .unwrap();
        assert_eq!(store.counter_count(), 2);
        assert_eq!(store.purge_expired().unwrap(), 1);
    }

    #[test]
    fn test_purge_expired() {
        let (store, clock) = store();
        store
            .increment_and_check("c", Duration::from_secs(1))
            .unwrap();
        store.try_acquire("r", Duration::from_secs(5)).unwrap();
        store
            .complete("kept", b"x", Duration::from_secs(3_600))
            .unwrap();

        clock.advance(Duration::from_secs(10));
        assert_eq!(store.purge_expired().unwrap(), 2);
        assert_eq!(store.counter_count(), 0);
        assert_eq!(store.record_count(), 1);
    }

    #[test]
    fn test_reset_clears_everything() {
        let (store, _clock) = store();
        store
            .increment_and_check("c", Duration::from_secs(60))
            .unwrap();
        store.try_acquire("r", Duration::from_secs(5)).unwrap();
        store.reset().unwrap();
        assert_eq!(store.counter_count() + store.record_count(), 0);
    }

    #[test]
    fn test_concurrent_acquire_single_winner() {
        let (store, _clock) = store();
        let store = Arc::new(store);
        let mut handles = vec![];

        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                store.try_acquire("contended", Duration::from_secs(30)).unwrap()
            }));
        }

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let (store, _clock) = store();
        let store = Arc::new(store);
        let mut handles = vec![];

        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    store
                        .increment_and_check("hot", Duration::from_secs(60))
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let snap = store
            .increment_and_check("hot", Duration::from_secs(60))
            .unwrap();
        assert_eq!(snap.count, 801);
    }
}
