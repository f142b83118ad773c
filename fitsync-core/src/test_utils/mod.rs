//! Test utilities for fitsync
//!
//! Fixtures, a scripted push transport, recording connection handlers and
//! reproducible randomness, shared by unit and integration tests.

pub mod assertions;
pub mod async_helpers;
pub mod deterministic_rng;
pub mod fixtures;
pub mod scripted_transport;

pub use assertions::*;
pub use async_helpers::*;
pub use deterministic_rng::*;
pub use fixtures::*;
pub use scripted_transport::*;
