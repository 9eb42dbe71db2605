//! Domain layer - pure governance rules with no I/O.
//!
//! - Rate and TTL parsing
//! - Rate limit and idempotency keys
//! - Sliding window arithmetic and decisions
//! - Idempotency records and outcomes
//! - Lifecycle event types
//! - Failure and concurrency policies

pub mod event;
pub mod key;
pub mod policy;
pub mod rate;
pub mod record;
pub mod window;
