//! Harness routes

use super::handlers;
use super::state::AppState;
use axum::{
    routing::{delete, get, patch, post},
    Router,
};
use std::sync::Arc;

/// Build the router serving every backend endpoint plus the push channel
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        // Groups
        .route("/groups", get(handlers::list_groups).post(handlers::create_group))
        .route("/groups/:id", patch(handlers::update_group).delete(handlers::delete_group))
        .route("/groups/:id/members", get(handlers::list_members))
        // Identifier table
        .route("/group-ids", get(handlers::list_identifiers))
        .route("/group-ids/reset", post(handlers::reset_identifiers))
        .route("/group-ids/:id", delete(handlers::delete_identifier))
        // Push
        .route("/ws", get(handlers::push_channel))
        .with_state(state)
}
