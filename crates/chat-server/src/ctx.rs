use crate::error::{AuthFailure, ChatError, Result};
use crate::models::{Identity, Participant};
use crate::store::TenantStore;
use axum::{extract::FromRequestParts, http::request::Parts};
use std::sync::Arc;

/// Per-request context set by the auth middleware
#[derive(Clone, Debug)]
pub struct Ctx {
    identity: Identity,
    store: Arc<TenantStore>,
}

impl Ctx {
    pub fn new(identity: Identity, store: Arc<TenantStore>) -> Self {
        Self { identity, store }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn participant(&self) -> Participant {
        self.identity.participant()
    }

    /// Store of the caller's own tenant
    pub fn store(&self) -> &TenantStore {
        &self.store
    }
}

impl<S> FromRequestParts<S> for Ctx
where
    S: Send + Sync,
{
    type Rejection = ChatError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        parts
            .extensions
            .get::<Ctx>()
            .cloned()
            .ok_or(ChatError::Unauthenticated(AuthFailure::Missing))
    }
}
