//! Authentication Module
//!
//! Verifies signed bearer credentials (HS256 JWT) and turns them into an
//! [`Identity`]. Shared by the HTTP middleware and the WebSocket gateway.

pub mod middleware;

use crate::error::{AuthFailure, ChatError, Result};
use crate::models::{Identity, Role};
use crate::store::normalize_tenant_id;
use axum::http::{header, HeaderMap};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Claims carried by a chat credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub id: String,
    pub role: Role,
    #[serde(alias = "institutionName")]
    pub tenant: String,
    pub exp: usize,
}

/// Verifies and issues bearer credentials
pub struct AuthGate {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl AuthGate {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Verify signature and expiry, then extract `{id, role, tenant}`
    pub fn authenticate(&self, credential: Option<&str>) -> Result<Identity> {
        let token = match credential.map(str::trim) {
            Some(t) if !t.is_empty() => t,
            _ => return Err(ChatError::Unauthenticated(AuthFailure::Missing)),
        };

        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            debug!("[Auth] Rejected credential: {}", e);
            ChatError::Unauthenticated(AuthFailure::Invalid)
        })?;
        let claims = data.claims;

        if claims.id.trim().is_empty() {
            warn!("[Auth] Credential without subject id");
            return Err(ChatError::Unauthenticated(AuthFailure::Invalid));
        }
        let tenant = normalize_tenant_id(&claims.tenant).ok_or_else(|| {
            warn!("[Auth] Credential for {} without tenant", claims.id);
            ChatError::Unauthenticated(AuthFailure::Invalid)
        })?;

        Ok(Identity {
            id: claims.id,
            role: claims.role,
            tenant,
        })
    }

    /// Issue a credential for `identity` valid for `ttl`
    pub fn issue(&self, identity: &Identity, ttl: chrono::Duration) -> Result<String> {
        let exp = (Utc::now() + ttl).timestamp().max(0) as usize;
        let claims = Claims {
            id: identity.id.clone(),
            role: identity.role,
            tenant: identity.tenant.clone(),
            exp,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| ChatError::BadRequest(format!("cannot issue credential: {}", e)))
    }
}

/// Extract `<token>` from an `Authorization: Bearer <token>` header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}
