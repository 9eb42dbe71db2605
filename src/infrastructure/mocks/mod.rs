//! Mock implementations for testing.
//!
//! Test doubles for infrastructure adapters, enabling controlled testing of
//! governance logic: a settable clock, a store that can go down on demand,
//! and a tracing layer that captures log output.

pub mod clock;
pub mod layer;
pub mod store;

pub use clock::MockClock;
pub use layer::{CapturedEvent, MockCaptureLayer};
pub use store::OutageStore;
