//! Counters describing what governance decided.
//!
//! Not an export layer: these are plain atomic counters a host can read and
//! forward to whatever metrics system it runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared governance counters.
///
/// Clones share the same counters. All updates are relaxed atomic adds.
#[derive(Debug, Clone, Default)]
pub struct GovernanceMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    allowed: AtomicU64,
    limited: AtomicU64,
    indeterminate: AtomicU64,
    conflicts: AtomicU64,
    replays: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    handler_failures: AtomicU64,
}

impl GovernanceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_allowed(&self) {
        self.inner.allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_limited(&self) {
        self.inner.limited.fetch_add(1, Ordering::Relaxed);
    }

    /// A store call whose answer could not be obtained.
    pub(crate) fn record_indeterminate(&self) {
        self.inner.indeterminate.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_conflict(&self) {
        self.inner.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_replay(&self) {
        self.inner.replays.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self) {
        self.inner.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.inner.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handler_failure(&self) {
        self.inner.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Rate limit checks that were within the limit.
    pub fn allowed(&self) -> u64 {
        self.inner.allowed.load(Ordering::Relaxed)
    }

    /// Rate limit checks that were over the limit.
    pub fn limited(&self) -> u64 {
        self.inner.limited.load(Ordering::Relaxed)
    }

    pub fn indeterminate(&self) -> u64 {
        self.inner.indeterminate.load(Ordering::Relaxed)
    }

    pub fn conflicts(&self) -> u64 {
        self.inner.conflicts.load(Ordering::Relaxed)
    }

    pub fn replays(&self) -> u64 {
        self.inner.replays.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.inner.failed.load(Ordering::Relaxed)
    }

    /// Event handlers that returned an error or panicked.
    pub fn handler_failures(&self) -> u64 {
        self.inner.handler_failures.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            allowed: self.allowed(),
            limited: self.limited(),
            indeterminate: self.indeterminate(),
            conflicts: self.conflicts(),
            replays: self.replays(),
            completed: self.completed(),
            failed: self.failed(),
            handler_failures: self.handler_failures(),
        }
    }

    pub fn reset(&self) {
        let inner = &self.inner;
        for counter in [
            &inner.allowed,
            &inner.limited,
            &inner.indeterminate,
            &inner.conflicts,
            &inner.replays,
            &inner.completed,
            &inner.failed,
            &inner.handler_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// A point-in-time copy of [`GovernanceMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub allowed: u64,
    pub limited: u64,
    pub indeterminate: u64,
    pub conflicts: u64,
    pub replays: u64,
    pub completed: u64,
    pub failed: u64,
    pub handler_failures: u64,
}

impl MetricsSnapshot {
    /// Share of rate limit checks that were rejected, 0.0 when none ran.
    pub fn rejection_rate(&self) -> f64 {
        let total = self.total_checks();
        if total == 0 {
            0.0
        } else {
            self.limited as f64 / total as f64
        }
    }

    /// Rate limit checks with a definite answer.
    pub fn total_checks(&self) -> u64 {
        self.allowed.saturating_add(self.limited)
    }
}
