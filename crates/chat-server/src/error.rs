use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Why a credential was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// No credential was presented
    Missing,
    /// Malformed, badly signed, expired, or missing required claims
    Invalid,
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("authentication failed: {0:?}")]
    Unauthenticated(AuthFailure),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("a chat request already exists between these users")]
    DuplicateRequest,

    #[error("request {0} has already been decided")]
    AlreadyDecided(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("tenant store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = core::result::Result<T, ChatError>;

impl ChatError {
    /// Stable machine-readable code, shared by HTTP bodies and socket `error` events
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Unauthenticated(_) => "UNAUTHENTICATED",
            ChatError::Forbidden(_) => "FORBIDDEN",
            ChatError::NotFound(_) => "NOT_FOUND",
            ChatError::DuplicateRequest => "DUPLICATE_REQUEST",
            ChatError::AlreadyDecided(_) => "ALREADY_DECIDED",
            ChatError::BadRequest(_) => "BAD_REQUEST",
            ChatError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            ChatError::Protocol(_) => "PROTOCOL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ChatError::Forbidden(_) => StatusCode::FORBIDDEN,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::DuplicateRequest | ChatError::AlreadyDecided(_) => StatusCode::CONFLICT,
            ChatError::BadRequest(_) | ChatError::Protocol(_) => StatusCode::BAD_REQUEST,
            ChatError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Only store outages are worth retrying at a higher layer
    pub fn is_transient(&self) -> bool {
        matches!(self, ChatError::StoreUnavailable(_))
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        }));

        (self.status(), body).into_response()
    }
}

impl From<sqlx::Error> for ChatError {
    fn from(err: sqlx::Error) -> Self {
        ChatError::StoreUnavailable(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ChatError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ChatError::StoreUnavailable("store call timed out".to_string())
    }
}
