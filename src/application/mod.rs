//! Application layer - orchestration of domain logic.
//!
//! - Rate limiter (sliding window decisions over the Counter Store)
//! - Idempotency coordinator (record lifecycle over the Counter Store)
//! - Event bus (lifecycle notifications)
//! - Governor (the pipeline combining the three)
//!
//! ## Ports
//!
//! The application layer defines ports (traits) that infrastructure
//! adapters must implement. This keeps the application layer independent
//! from infrastructure details.

pub mod circuit_breaker;
pub mod events;
pub mod governor;
pub mod idempotency;
pub mod limiter;
pub mod metrics;
pub mod ports;
