//! Shared state for harness requests

use std::sync::Arc;

use super::backend::InMemoryBackend;

/// Server state shared across requests
#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<InMemoryBackend>,
}

impl AppState {
    pub fn new(backend: Arc<InMemoryBackend>) -> Self {
        Self { backend }
    }
}
