use crate::auth::bearer_token;
use crate::config::AppState;
use crate::ctx::Ctx;
use crate::error::Result;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use tracing::debug;

/// Authenticate the caller and attach identity plus tenant store to the request
pub async fn mw_require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response> {
    debug!("MIDDLEWARE: require_auth");

    let identity = state.auth.authenticate(bearer_token(req.headers()))?;
    let store = state.bounded(state.tenants.resolve(&identity.tenant)).await?;

    req.extensions_mut().insert(Ctx::new(identity, store));

    Ok(next.run(req).await)
}
