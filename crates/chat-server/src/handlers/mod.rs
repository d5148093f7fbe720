//! Handlers for server
//!
//! Every handler here runs behind the auth middleware and receives a [`Ctx`](crate::ctx::Ctx).

pub mod messages;
pub mod relationships;

// Re-export AppState from config
pub use crate::config::AppState;

// Chat request handlers
pub use relationships::{
    get_chat_status, list_friends, list_pending_requests, list_users, respond_chat_request,
    send_chat_request,
};

// Message handlers
pub use messages::{get_history, list_online, send_message};
