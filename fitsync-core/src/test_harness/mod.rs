//! In-memory server of record
//!
//! Useful for integration tests, local development against the CLI, and
//! demonstrations. [`InMemoryBackend`] can be used directly as a
//! [`GroupApi`](crate::core_backend::GroupApi) or served over HTTP with
//! [`HarnessServer`].

pub mod api;
pub mod backend;
pub mod handlers;
pub mod server;
pub mod state;
pub mod types;

pub use backend::InMemoryBackend;
pub use server::{start_server, HarnessServer};
