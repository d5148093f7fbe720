//! Realtime Gateway
//!
//! WebSocket entry point. A credential may arrive as `?token=`, as a bearer
//! header, or as the first `authenticate` frame.

pub mod protocol;
pub mod session;

use crate::auth::bearer_token;
use crate::config::AppState;
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::HeaderMap,
    response::Response,
};
use std::collections::HashMap;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let credential = params
        .get("token")
        .cloned()
        .or_else(|| bearer_token(&headers).map(str::to_string));

    ws.on_upgrade(move |socket| session::run_connection(socket, state, credential))
}
