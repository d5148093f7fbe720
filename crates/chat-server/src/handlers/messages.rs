//! Message Handlers
//!
//! HTTP counterparts of the socket send path, plus history and presence reads.

use crate::config::AppState;
use crate::ctx::Ctx;
use crate::error::{ChatError, Result};
use crate::models::{Message, Participant, RequestStatus, Role};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

/// Body of `POST /chat/messages`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub receiver_id: String,
    pub receiver_role: Role,
    #[serde(alias = "message")]
    pub body: String,
}

/// GET /chat/messages/{friend_id} - Conversation history, oldest first
pub async fn get_history(
    Path(friend_id): Path<String>,
    State(state): State<AppState>,
    ctx: Ctx,
) -> Result<Json<Vec<Message>>> {
    let me = &ctx.identity().id;

    let status = state
        .bounded(state.relationships.status_between(ctx.store(), me, &friend_id))
        .await?;
    if status != Some(RequestStatus::Accepted) {
        return Err(ChatError::Forbidden(
            "you must be friends to view this conversation".to_string(),
        ));
    }

    let history = state
        .bounded(state.messages.history(ctx.store(), me, &friend_id))
        .await?;

    Ok(Json(history))
}

/// POST /chat/messages - Send a message without a live socket
pub async fn send_message(
    State(state): State<AppState>,
    ctx: Ctx,
    Json(req): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Message>)> {
    let sender = ctx.participant();
    let receiver = Participant::new(req.receiver_id, req.receiver_role);

    let message = state
        .send_direct(ctx.store(), &sender, &receiver, &req.body)
        .await?;

    Ok((StatusCode::CREATED, Json(message)))
}

/// GET /chat/online - Identity ids online in the caller's tenant
pub async fn list_online(State(state): State<AppState>, ctx: Ctx) -> Json<Vec<String>> {
    Json(state.presence.online(&ctx.identity().tenant))
}
