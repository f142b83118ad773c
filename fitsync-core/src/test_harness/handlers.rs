//! HTTP and WebSocket handlers for the harness

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use super::state::AppState;
use super::types::{ErrorResponse, HealthResponse};
use crate::core_backend::{ApiError, CreateGroupRequest, GroupApi, RawIdentifierTable};
use crate::core_connection::PushMessage;
use crate::core_groups::types::{Group, GroupId, GroupPatch, Membership};

/// Backend failure rendered as `{ "error": ... }` with a matching status
pub struct HarnessError(ApiError);

impl IntoResponse for HarnessError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ApiError::Http { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            ApiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Decode(_) => StatusCode::BAD_REQUEST,
            ApiError::Transport(_) => StatusCode::BAD_GATEWAY,
        };
        let message = match self.0 {
            ApiError::Http { message, .. } => message,
            other => other.to_string(),
        };
        (status, Json(ErrorResponse { error: message, details: None })).into_response()
    }
}

impl From<ApiError> for HarnessError {
    fn from(err: ApiError) -> Self {
        HarnessError(err)
    }
}

type HarnessResult<T> = Result<T, HarnessError>;

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        groups: state.backend.groups().len(),
        mappings: state.backend.identifiers().len(),
    })
}

/// GET /groups
pub async fn list_groups(State(state): State<Arc<AppState>>) -> HarnessResult<Json<Vec<Group>>> {
    Ok(Json(state.backend.list_groups().await?))
}

/// POST /groups
pub async fn create_group(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateGroupRequest>,
) -> HarnessResult<(StatusCode, Json<Group>)> {
    let group = state.backend.create_group(&req).await?;
    Ok((StatusCode::CREATED, Json(group)))
}

/// PATCH /groups/:id
pub async fn update_group(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Json(patch): Json<GroupPatch>,
) -> HarnessResult<Json<Group>> {
    Ok(Json(state.backend.update_group(GroupId(id), &patch).await?))
}

/// DELETE /groups/:id
pub async fn delete_group(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> HarnessResult<StatusCode> {
    state.backend.delete_group(GroupId(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /groups/:id/members
pub async fn list_members(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> HarnessResult<Json<Vec<Membership>>> {
    Ok(Json(state.backend.list_members(GroupId(id)).await?))
}

/// GET /group-ids
pub async fn list_identifiers(
    State(state): State<Arc<AppState>>,
) -> HarnessResult<Json<RawIdentifierTable>> {
    Ok(Json(state.backend.fetch_identifiers().await?))
}

/// DELETE /group-ids/:id
pub async fn delete_identifier(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> HarnessResult<StatusCode> {
    state.backend.delete_identifier(GroupId(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /group-ids/reset
pub async fn reset_identifiers(
    State(state): State<Arc<AppState>>,
) -> HarnessResult<Json<RawIdentifierTable>> {
    Ok(Json(state.backend.reset_identifiers().await?))
}

/// GET /ws - push channel
pub async fn push_channel(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| serve_push(socket, state))
}

async fn serve_push(mut socket: WebSocket, state: Arc<AppState>) {
    let mut updates = state.backend.subscribe_updates();
    let mut subscribed = false;

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                let text = match inbound {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(error = %e, "Push socket error");
                        break;
                    }
                };
                match PushMessage::parse(&text) {
                    Some(PushMessage::Subscribe { topic }) if topic == PushMessage::GROUPS_TOPIC => {
                        subscribed = true;
                    }
                    Some(PushMessage::Ping { timestamp }) => {
                        let pong = PushMessage::Pong { timestamp: Some(timestamp) };
                        if socket.send(Message::Text(pong.to_json())).await.is_err() {
                            break;
                        }
                    }
                    other => debug!(message = ?other, "Ignoring push message"),
                }
            }
            update = updates.recv() => {
                let message = match update {
                    Ok(message) => message,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Push subscriber lagged, sending catch-all update");
                        PushMessage::GroupUpdate { group_id: None }
                    }
                    Err(RecvError::Closed) => break,
                };
                if subscribed && socket.send(Message::Text(message.to_json())).await.is_err() {
                    break;
                }
            }
        }
    }
}
