//! Infrastructure layer - external adapters and integrations.
//!
//! This layer provides adapters for:
//! - Clock abstraction (system time vs mock)
//! - Counter Stores (sharded in-process maps, Redis)
//! - File configuration and governor assembly
//! - Periodic store maintenance

pub mod builder;
pub mod clock;
pub mod config;
pub mod storage;

#[cfg(feature = "async")]
pub mod maintenance;

#[cfg(feature = "redis-store")]
pub mod redis_store;

/// Mock implementations for testing.
///
/// This module is only available when the `test-helpers` feature is enabled,
/// or during test builds. It provides controllable test doubles for testing
/// governance behavior.
///
/// To use these mocks in integration tests, add to your `Cargo.toml`:
/// ```toml
/// [dev-dependencies]
/// request-governance = { version = "*", features = ["test-helpers"] }
/// ```
#[cfg(any(test, feature = "test-helpers"))]
pub mod mocks;
