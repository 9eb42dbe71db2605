//! Lifecycle event types and envelopes.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

/// Event payload: named JSON values.
pub type Payload = BTreeMap<String, Value>;

/// The fixed set of lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    RequestStarted,
    RequestCompleted,
    RateLimitExceeded,
    IdempotencyConflict,
    IdempotencyReplay,
    UnhandledError,
}

impl EventType {
    pub const ALL: [EventType; 6] = [
        EventType::RequestStarted,
        EventType::RequestCompleted,
        EventType::RateLimitExceeded,
        EventType::IdempotencyConflict,
        EventType::IdempotencyReplay,
        EventType::UnhandledError,
    ];

    /// Stable name subscribers register by.
    pub fn name(&self) -> &'static str {
        match self {
            EventType::RequestStarted => "before_request",
            EventType::RequestCompleted => "after_response",
            EventType::RateLimitExceeded => "on_rate_limit_exceeded",
            EventType::IdempotencyConflict => "on_idempotency_conflict",
            EventType::IdempotencyReplay => "on_idempotency_replay",
            EventType::UnhandledError => "on_error",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when parsing an event name outside the fixed set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event type '{0}'")]
pub struct UnknownEventType(pub String);

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.name() == s)
            .ok_or_else(|| UnknownEventType(s.to_string()))
    }
}

/// One emission, alive only for the duration of dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub event_type: EventType,
    pub payload: Payload,
    pub timestamp: SystemTime,
}

impl EventEnvelope {
    pub fn new(event_type: EventType, payload: Payload, timestamp: SystemTime) -> Self {
        Self {
            event_type,
            payload,
            timestamp,
        }
    }

    /// Shortcut for a string field in the payload.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.payload.get(name).and_then(Value::as_str)
    }
}

/// Build a [`Payload`] from `name => value` pairs.
///
/// ```
/// use request_governance::payload;
///
/// let p = payload! { "route" => "orders.create", "remaining" => 0 };
/// assert_eq!(p["remaining"], 0);
/// ```
#[macro_export]
macro_rules! payload {
    () => { $crate::domain::event::Payload::new() };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::domain::event::Payload::new();
        $( map.insert(($name).to_string(), $crate::__serde_json::json!($value)); )+
        map
    }};
}
