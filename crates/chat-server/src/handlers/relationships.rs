//! Chat Request Handlers

use crate::config::AppState;
use crate::ctx::Ctx;
use crate::error::Result;
use crate::models::{
    Counterparty, Decision, PendingRequest, Participant, RelationshipRequest, Role, TenantUser,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Body of `POST /chat/requests`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    pub receiver_id: String,
    pub receiver_role: Role,
    pub message: Option<String>,
}

/// Body of `PUT /chat/requests/{id}`
#[derive(Debug, Deserialize)]
pub struct RespondRequest {
    pub action: Decision,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
}

/// POST /chat/requests - Send a chat request
pub async fn send_chat_request(
    State(state): State<AppState>,
    ctx: Ctx,
    Json(req): Json<CreateRequest>,
) -> Result<(StatusCode, Json<RelationshipRequest>)> {
    let from = ctx.participant();
    let to = Participant::new(req.receiver_id, req.receiver_role);

    let request = state
        .bounded(
            state
                .relationships
                .create(ctx.store(), &from, &to, req.message),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(request)))
}

/// GET /chat/requests - Pending requests addressed to the caller
pub async fn list_pending_requests(
    State(state): State<AppState>,
    ctx: Ctx,
) -> Result<Json<Vec<PendingRequest>>> {
    let me = ctx.participant();
    let pending = state
        .bounded(state.relationships.find_pending(ctx.store(), &me))
        .await?;

    Ok(Json(pending))
}

/// PUT /chat/requests/{request_id} - Accept or reject a chat request
pub async fn respond_chat_request(
    Path(request_id): Path<String>,
    State(state): State<AppState>,
    ctx: Ctx,
    Json(req): Json<RespondRequest>,
) -> Result<Json<RelationshipRequest>> {
    let me = ctx.participant();
    let request = state
        .bounded(
            state
                .relationships
                .decide(ctx.store(), &request_id, &me, req.action),
        )
        .await?;

    info!(
        "[Relationships] {} answered request {} from {}",
        me,
        request.id,
        request.sender()
    );
    Ok(Json(request))
}

/// GET /chat/friends - Accepted counterparties of the caller
pub async fn list_friends(
    State(state): State<AppState>,
    ctx: Ctx,
) -> Result<Json<Vec<Counterparty>>> {
    let me = ctx.participant();
    let friends = state
        .bounded(state.relationships.list_accepted(ctx.store(), &me))
        .await?;

    Ok(Json(friends))
}

/// GET /chat/status/{other_id} - Request status between the caller and another account
pub async fn get_chat_status(
    Path(other_id): Path<String>,
    State(state): State<AppState>,
    ctx: Ctx,
) -> Result<Json<StatusResponse>> {
    let status = state
        .bounded(
            state
                .relationships
                .status_between(ctx.store(), &ctx.identity().id, &other_id),
        )
        .await?;

    Ok(Json(StatusResponse {
        status: status.map_or("NONE", |s| s.as_str()).to_string(),
    }))
}

/// GET /chat/users - Every other account of the tenant with the caller's request status
pub async fn list_users(
    State(state): State<AppState>,
    ctx: Ctx,
) -> Result<Json<Vec<TenantUser>>> {
    let me = ctx.participant();
    let entries = state.bounded(state.directory.list(ctx.store())).await?;
    let statuses = state
        .bounded(state.relationships.statuses_for(ctx.store(), &me.id))
        .await?;

    let users = entries
        .into_iter()
        .filter(|entry| entry.participant != me)
        .map(|entry| TenantUser {
            chat_status: statuses
                .get(&entry.participant.id)
                .map_or("NONE", |s| s.as_str())
                .to_string(),
            id: entry.participant.id,
            role: entry.participant.role,
            name: entry.display.name,
            email: entry.display.email,
        })
        .collect();

    Ok(Json(users))
}
