//! Deployment-wide policies for degraded and contended operation.

use crate::domain::window::Decision;
use std::time::Duration;

/// How an unreachable Counter Store is resolved.
///
/// Chosen once per deployment and applied to both the rate limiter and
/// the idempotency coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Admit operations when governance state is unavailable.
    FailOpen,
    /// Refuse operations when governance state is unavailable.
    #[default]
    FailClosed,
}

impl FailurePolicy {
    /// Whether an operation with this rate limit decision may proceed.
    ///
    /// ```
    /// use request_governance::{Decision, FailurePolicy};
    ///
    /// assert!(FailurePolicy::FailOpen.admits(&Decision::Indeterminate));
    /// assert!(!FailurePolicy::FailClosed.admits(&Decision::Indeterminate));
    /// ```
    pub fn admits(&self, decision: &Decision) -> bool {
        match decision {
            Decision::Allowed(_) => true,
            Decision::Limited(_) => false,
            Decision::Indeterminate => self.admits_unknown(),
        }
    }

    /// Whether an operation may proceed when its governance state is unknown.
    pub fn admits_unknown(&self) -> bool {
        matches!(self, FailurePolicy::FailOpen)
    }
}

/// What a second caller with an in-flight idempotency key experiences.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConcurrencyPolicy {
    /// Refuse immediately with a conflict.
    #[default]
    Reject,
    /// Wait for the holder to finish and replay its result, up to `timeout`.
    WaitAndReplay {
        timeout: Duration,
        poll_interval: Duration,
    },
}

impl ConcurrencyPolicy {
    /// How long a waiter holds on when no timeout is configured.
    pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
    /// How often a waiter re-checks the record.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

    pub fn wait(timeout: Duration) -> Self {
        ConcurrencyPolicy::WaitAndReplay {
            timeout,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }
}
