//! Weighted sliding window arithmetic.
//!
//! Two adjacent fixed windows of length `period` are tracked per key. The
//! effective count blends the previous window's count into the current one
//! by how much of the current window is still ahead:
//!
//! ```text
//! weighted = current + previous * (1 - elapsed_fraction)
//! ```
//!
//! Windows are aligned to multiples of the period since the Unix epoch so
//! every process sharing a backend agrees on the boundaries.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, saturating at zero for earlier times.
pub fn epoch_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().try_into().unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Inverse of [`epoch_millis`].
pub fn from_epoch_millis(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

/// Start of the window of length `window_ms` containing `now_ms`.
pub fn align_window(now_ms: u64, window_ms: u64) -> u64 {
    if window_ms == 0 {
        return now_ms;
    }
    now_ms - (now_ms % window_ms)
}

/// Counter for one key: the current window plus the carried-over count of
/// the window immediately before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCounter {
    pub count: u64,
    pub previous: u64,
    /// Start of the current window, epoch milliseconds.
    pub window_start_ms: u64,
}

impl WindowCounter {
    pub fn new(window_start_ms: u64) -> Self {
        Self {
            count: 0,
            previous: 0,
            window_start_ms,
        }
    }

    /// Move the counter into the window containing `now_ms`.
    ///
    /// Adjacent windows carry the old count over as `previous`; a gap of a
    /// full window or more drops it.
    pub fn roll(&mut self, now_ms: u64, window_ms: u64) {
        let aligned = align_window(now_ms, window_ms);
        if aligned <= self.window_start_ms {
            return;
        }
        self.previous = if aligned == self.window_start_ms.saturating_add(window_ms) {
            self.count
        } else {
            0
        };
        self.count = 0;
        self.window_start_ms = aligned;
    }

    /// Roll into the current window, then count one hit.
    pub fn increment(&mut self, now_ms: u64, window_ms: u64) -> WindowSnapshot {
        self.roll(now_ms, window_ms);
        self.count = self.count.saturating_add(1);
        self.snapshot()
    }

    /// True once the counter can no longer contribute to any decision.
    pub fn is_expired(&self, now_ms: u64, window_ms: u64) -> bool {
        now_ms >= self.window_start_ms.saturating_add(window_ms.saturating_mul(2))
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            count: self.count,
            previous: self.previous,
            window_start: from_epoch_millis(self.window_start_ms),
        }
    }
}

/// Result of an atomic increment: counts after the increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    /// Hits in the current window, including the one just recorded.
    pub count: u64,
    /// Hits in the immediately preceding window.
    pub previous: u64,
    pub window_start: SystemTime,
}

impl WindowSnapshot {
    /// Fraction of the current window that has elapsed at `now`, in `[0, 1]`.
    pub fn elapsed_fraction(&self, now: SystemTime, period: Duration) -> f64 {
        if period.is_zero() {
            return 1.0;
        }
        let elapsed = now
            .duration_since(self.window_start)
            .unwrap_or(Duration::ZERO);
        (elapsed.as_secs_f64() / period.as_secs_f64()).clamp(0.0, 1.0)
    }
}

/// `current + previous * (1 - elapsed_fraction)`.
pub fn weighted_count(current: u64, previous: u64, elapsed_fraction: f64) -> f64 {
    let fraction = elapsed_fraction.clamp(0.0, 1.0);
    current as f64 + previous as f64 * (1.0 - fraction)
}

/// Quota state reported alongside a rate limit decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub limit: u64,
    pub remaining: u64,
    /// When the current window ends.
    pub reset_at: SystemTime,
}

impl Quota {
    /// Seconds until the window resets, rounded up.
    pub fn retry_after(&self, now: SystemTime) -> u64 {
        match self.reset_at.duration_since(now) {
            Ok(d) if d.subsec_nanos() > 0 => d.as_secs() + 1,
            Ok(d) => d.as_secs(),
            Err(_) => 0,
        }
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Within the limit.
    Allowed(Quota),
    /// Over the limit; the request was still counted.
    Limited(Quota),
    /// The Counter Store could not be reached.
    Indeterminate,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed(_))
    }

    pub fn is_limited(&self) -> bool {
        matches!(self, Decision::Limited(_))
    }

    pub fn is_indeterminate(&self) -> bool {
        matches!(self, Decision::Indeterminate)
    }

    pub fn quota(&self) -> Option<&Quota> {
        match self {
            Decision::Allowed(q) | Decision::Limited(q) => Some(q),
            Decision::Indeterminate => None,
        }
    }

    /// Seconds until the window resets; `None` when the store was unreachable.
    pub fn retry_after(&self, now: SystemTime) -> Option<u64> {
        self.quota().map(|q| q.retry_after(now))
    }

    pub fn remaining(&self) -> Option<u64> {
        self.quota().map(|q| q.remaining)
    }

    pub fn reset_at(&self) -> Option<SystemTime> {
        self.quota().map(|q| q.reset_at)
    }
}
