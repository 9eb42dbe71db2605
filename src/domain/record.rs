//! Idempotency records and begin outcomes.

use std::fmt;
use std::time::SystemTime;

/// Proof of holding the lease on a pending record.
///
/// The store issues a fresh token every time it creates a pending record.
/// Settling the record requires the token, so a holder whose lease lapsed
/// and was taken over cannot overwrite or delete the new holder's record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseToken(u64);

impl LeaseToken {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a stored idempotency record.
///
/// `ABSENT` is not a state: it is the absence of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// A caller holds the lease and is executing the guarded operation.
    Pending,
    /// The operation finished; `result` holds the response to replay.
    Completed,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Pending => "pending",
            RecordState::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RecordState::Pending),
            "completed" => Some(RecordState::Completed),
            _ => None,
        }
    }
}

/// A record stored per (route, scope, idempotency key).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub key: String,
    pub state: RecordState,
    pub result: Option<Vec<u8>>,
    /// Token of the current holder. Only pending records carry one.
    pub lease: Option<LeaseToken>,
    pub created_at: SystemTime,
    /// Lease end for pending records, TTL end for completed ones.
    pub expires_at: SystemTime,
}

impl IdempotencyRecord {
    pub fn pending(
        key: impl Into<String>,
        lease: LeaseToken,
        now: SystemTime,
        expires_at: SystemTime,
    ) -> Self {
        Self {
            key: key.into(),
            state: RecordState::Pending,
            result: None,
            lease: Some(lease),
            created_at: now,
            expires_at,
        }
    }

    pub fn completed(
        key: impl Into<String>,
        result: Vec<u8>,
        now: SystemTime,
        expires_at: SystemTime,
    ) -> Self {
        Self {
            key: key.into(),
            state: RecordState::Completed,
            result: Some(result),
            lease: None,
            created_at: now,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }

    /// Whether `lease` is the unexpired lease on this pending record.
    pub fn is_held_by(&self, lease: LeaseToken, now: SystemTime) -> bool {
        self.state == RecordState::Pending && self.lease == Some(lease) && !self.is_expired(now)
    }
}

/// Result of [`begin`](crate::IdempotencyCoordinator::begin).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The caller now holds the lease and must execute the operation, then
    /// call `complete` or `abort` with this token.
    New(LeaseToken),
    /// Another caller holds an unexpired lease; refuse the duplicate.
    InFlight,
    /// The operation already completed; this is its stored result.
    Replay(Vec<u8>),
    /// The Counter Store could not be reached.
    Indeterminate,
}

impl Outcome {
    pub fn is_new(&self) -> bool {
        matches!(self, Outcome::New(_))
    }

    /// The lease taken by this caller, for a `New` outcome.
    pub fn lease(&self) -> Option<LeaseToken> {
        match self {
            Outcome::New(lease) => Some(*lease),
            _ => None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, Outcome::InFlight)
    }

    pub fn replayed(&self) -> Option<&[u8]> {
        match self {
            Outcome::Replay(bytes) => Some(bytes),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_state_names_round_trip() {
        for state in [RecordState::Pending, RecordState::Completed] {
            assert_eq!(RecordState::parse(state.as_str()), Some(state));
        }
        assert_eq!(RecordState::parse("absent"), None);
    }

    #[test]
    fn test_expiry_is_inclusive() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let record =
            IdempotencyRecord::pending("k", LeaseToken::new(1), now, now + Duration::from_secs(30));
        assert!(!record.is_expired(now + Duration::from_secs(29)));
        assert!(record.is_expired(now + Duration::from_secs(30)));
    }

    #[test]
    fn test_only_the_live_lease_holds() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let lease = LeaseToken::new(7);
        let record = IdempotencyRecord::pending("k", lease, now, now + Duration::from_secs(30));

        assert!(record.is_held_by(lease, now));
        assert!(!record.is_held_by(LeaseToken::new(8), now));
        assert!(!record.is_held_by(lease, now + Duration::from_secs(30)));

        let done = IdempotencyRecord::completed("k", b"ok".to_vec(), now, now + Duration::from_secs(60));
        assert!(!done.is_held_by(lease, now));
    }

    #[test]
    fn test_outcome_accessors() {
        let lease = LeaseToken::new(3);
        assert!(Outcome::New(lease).is_new());
        assert_eq!(Outcome::New(lease).lease(), Some(lease));
        assert_eq!(Outcome::InFlight.lease(), None);
        assert!(Outcome::InFlight.is_in_flight());
        assert_eq!(Outcome::Replay(b"ok".to_vec()).replayed(), Some(&b"ok"[..]));
        assert_eq!(Outcome::Indeterminate.replayed(), None);
    }
}
