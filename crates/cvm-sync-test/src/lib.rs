//! Integration test infrastructure for the vCenter manager sync engine
//!
//! Provides:
//! - Scripted inventory and recording controller clients
//! - Update stream fixtures
//! - Store snapshot verification helpers
//! - An engine harness running supervisor and monitor on the fakes

pub mod fakes;
pub mod fixtures;
mod harness;
mod verification;

pub use fakes::{ControllerCall, FakeInventoryClient, RecordingControllerClient, Step};
pub use fixtures::*;
pub use harness::{TestEngine, TEST_TIMEOUT};
pub use verification::*;
