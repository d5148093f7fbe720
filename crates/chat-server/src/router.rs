use crate::auth::middleware::mw_require_auth;
use crate::config::AppState;
use crate::gateway::ws_handler;
use crate::handlers::{
    get_chat_status, get_history, list_friends, list_online, list_pending_requests, list_users,
    respond_chat_request, send_chat_request, send_message,
};
use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};

/// Build the full HTTP + WebSocket router
pub fn build_router(state: AppState) -> Router {
    let chat = Router::new()
        // Chat requests
        .route(
            "/chat/requests",
            get(list_pending_requests).post(send_chat_request),
        )
        .route("/chat/requests/{request_id}", put(respond_chat_request))
        .route("/chat/status/{other_id}", get(get_chat_status))
        .route("/chat/friends", get(list_friends))
        .route("/chat/users", get(list_users))
        // Messages
        .route("/chat/messages", post(send_message))
        .route("/chat/messages/{friend_id}", get(get_history))
        // Presence
        .route("/chat/online", get(list_online))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            mw_require_auth,
        ));

    Router::new()
        .merge(chat)
        // The gateway authenticates on its own, after the upgrade
        .route("/ws", get(ws_handler))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn health_check() -> &'static str {
    "OK - Gym Chat Server"
}
