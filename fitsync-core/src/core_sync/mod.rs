//! Synchronization orchestrator
//!
//! Chooses between push and poll, and turns server-side change signals into
//! group store resyncs.

pub mod mode;
pub mod orchestrator;

pub use mode::{select_transport, TransportMode};
pub use orchestrator::SyncOrchestrator;
