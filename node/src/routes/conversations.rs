use crate::state::AppState;
use crate::sync::{ConnectionStatus, ConversationHandle, SyncError};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chatsync_messaging::{Attachment, Message, MessageId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Debug, Deserialize)]
pub struct SendPayload {
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Serialize)]
pub struct SendResponse {
    pub id: MessageId,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub conversation: String,
    pub status: ConnectionStatus,
    pub messages: usize,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/conversations/:peer/messages",
            get(list_messages).post(send_message),
        )
        .route("/conversations/:peer/messages/:id", delete(delete_message))
        .route("/conversations/:peer/focus", post(focus))
        .route("/conversations/:peer/unfocus", post(unfocus))
        .route("/conversations/:peer/older", post(load_older))
        .route("/conversations/:peer/status", get(status))
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let status = match &self {
            SyncError::InvalidConversation(_) => StatusCode::BAD_REQUEST,
            SyncError::Send(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SyncError::SessionClosed => StatusCode::SERVICE_UNAVAILABLE,
            SyncError::Transport(_) | SyncError::Fetch(_) | SyncError::Receipt(_) => {
                StatusCode::BAD_GATEWAY
            }
            SyncError::Cache(_) => {
                error!(err = %self, "cache failure surfaced to client");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

fn conversation(state: &AppState, peer: String) -> Result<ConversationHandle, SyncError> {
    state.engine().conversation(UserId::new(peer))
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(peer): Path<String>,
) -> Result<Json<Vec<Message>>, SyncError> {
    let handle = conversation(&state, peer)?;
    handle.barrier().await?;
    Ok(Json(handle.messages()))
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(peer): Path<String>,
    Json(payload): Json<SendPayload>,
) -> Result<(StatusCode, Json<SendResponse>), SyncError> {
    let handle = conversation(&state, peer)?;
    let id = handle
        .send_optimistic(payload.content, payload.attachments)
        .await?;
    debug!(conversation = %handle.key(), %id, "message queued");
    Ok((StatusCode::ACCEPTED, Json(SendResponse { id })))
}

async fn delete_message(
    State(state): State<Arc<AppState>>,
    Path((peer, id)): Path<(String, String)>,
) -> Result<StatusCode, SyncError> {
    let handle = conversation(&state, peer)?;
    handle.delete(MessageId::new(id))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn focus(
    State(state): State<Arc<AppState>>,
    Path(peer): Path<String>,
) -> Result<StatusCode, SyncError> {
    conversation(&state, peer)?.focus()?;
    Ok(StatusCode::ACCEPTED)
}

async fn unfocus(
    State(state): State<Arc<AppState>>,
    Path(peer): Path<String>,
) -> Result<StatusCode, SyncError> {
    conversation(&state, peer)?.unfocus()?;
    Ok(StatusCode::ACCEPTED)
}

async fn load_older(
    State(state): State<Arc<AppState>>,
    Path(peer): Path<String>,
) -> Result<StatusCode, SyncError> {
    conversation(&state, peer)?.load_older()?;
    Ok(StatusCode::ACCEPTED)
}

async fn status(
    State(state): State<Arc<AppState>>,
    Path(peer): Path<String>,
) -> Result<Json<StatusResponse>, SyncError> {
    let handle = conversation(&state, peer)?;
    handle.barrier().await?;
    Ok(Json(StatusResponse {
        conversation: handle.key().to_string(),
        status: handle.connection_status(),
        messages: handle.messages().len(),
    }))
}
