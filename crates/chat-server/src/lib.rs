//! Gym Chat Server Library
//!
//! Multi-tenant direct messaging for gym staff and members: chat requests,
//! persisted messages and a WebSocket gateway for live delivery.

pub mod auth;
pub mod config;
pub mod ctx;
pub mod delivery;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod messages;
pub mod models;
pub mod presence;
pub mod relationships;
pub mod router;
pub mod store;

use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::{AppState, ChatServerConfig};
use directory::AccountTables;

pub use router::build_router;

pub async fn run() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_err()
    {
        // Already set, ignore
    }

    info!("=== Gym Chat Server ===");

    // Initialize configuration
    let config = ChatServerConfig::from_env()?;
    config.ensure_dirs().await?;
    info!("Data directory: {:?}", config.data_dir);

    let addr = config.bind_addr;
    let state = AppState::new(config, Arc::new(AccountTables));
    let app = build_router(state.clone());

    info!("Chat server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    state.presence.clear();
    let open = state.tenants.tenants().await;
    info!("Closing {} tenant stores: {:?}", open.len(), open);
    state.tenants.close_all().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}
