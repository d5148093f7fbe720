//! Chat server configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::auth::AuthGate;
use crate::delivery::DeliveryRouter;
use crate::directory::DisplayDirectory;
use crate::error::ChatError;
use crate::messages::MessageLedger;
use crate::models::{Message, Participant};
use crate::presence::PresenceRegistry;
use crate::relationships::RelationshipLedger;
use crate::store::{TenantStore, TenantStoreRouter};

/// Configuration for the chat server
#[derive(Clone, Debug)]
pub struct ChatServerConfig {
    /// Directory holding one SQLite database per tenant
    pub data_dir: PathBuf,
    /// Address the HTTP/WebSocket listener binds to
    pub bind_addr: SocketAddr,
    /// HMAC secret for bearer credentials
    pub jwt_secret: String,
    /// Interval between liveness pings
    pub ping_interval: Duration,
    /// Consecutive unanswered pings before a connection is dropped
    pub max_missed_pings: u32,
    /// How long a new connection may take to present a credential
    pub auth_timeout: Duration,
    /// Upper bound on any single ledger call
    pub store_timeout: Duration,
    /// How far back reconnect catch-up looks for unread messages
    pub catchup_window: chrono::Duration,
    /// Pool size per tenant database
    pub max_pool_connections: u32,
}

impl Default for ChatServerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("gym_chat_data"),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 10000)),
            jwt_secret: String::new(),
            ping_interval: Duration::from_secs(30),
            max_missed_pings: 2,
            auth_timeout: Duration::from_secs(10),
            store_timeout: Duration::from_secs(5),
            catchup_window: chrono::Duration::hours(24),
            max_pool_connections: 5,
        }
    }
}

impl ChatServerConfig {
    /// Create config with custom data directory
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: base_dir.into(),
            ..Self::default()
        }
    }

    /// Read configuration from the environment, falling back to defaults.
    ///
    /// `JWT_SECRET` is required.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("GYMCHAT_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(port) = env_parse::<u16>("PORT")? {
            config.bind_addr.set_port(port);
        }
        config.jwt_secret = std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        if let Some(secs) = env_parse::<u64>("GYMCHAT_PING_INTERVAL_SECS")? {
            config.ping_interval = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<u32>("GYMCHAT_MAX_MISSED_PINGS")? {
            config.max_missed_pings = n.max(1);
        }
        if let Some(secs) = env_parse::<u64>("GYMCHAT_AUTH_TIMEOUT_SECS")? {
            config.auth_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("GYMCHAT_STORE_TIMEOUT_SECS")? {
            config.store_timeout = Duration::from_secs(secs);
        }
        if let Some(hours) = env_parse::<i64>("GYMCHAT_CATCHUP_HOURS")? {
            config.catchup_window = chrono::Duration::hours(hours);
        }

        Ok(config)
    }

    /// Ensure the data directory exists
    pub async fn ensure_dirs(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.data_dir).await?;
        Ok(())
    }
}

fn env_parse<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        Err(_) => Ok(None),
    }
}

/// App state shared across all handlers and gateway sessions
#[derive(Clone)]
pub struct AppState {
    pub config: ChatServerConfig,
    pub auth: Arc<AuthGate>,
    pub tenants: Arc<TenantStoreRouter>,
    pub relationships: Arc<RelationshipLedger>,
    pub messages: Arc<MessageLedger>,
    pub presence: Arc<PresenceRegistry>,
    pub delivery: Arc<DeliveryRouter>,
    pub directory: Arc<dyn DisplayDirectory>,
}

impl AppState {
    /// Wire up every component from a config and a display directory
    pub fn new(config: ChatServerConfig, directory: Arc<dyn DisplayDirectory>) -> Self {
        let auth = Arc::new(AuthGate::new(config.jwt_secret.as_bytes()));
        let tenants = Arc::new(TenantStoreRouter::new(
            config.data_dir.clone(),
            config.max_pool_connections,
        ));
        let presence = Arc::new(PresenceRegistry::new());
        let delivery = Arc::new(DeliveryRouter::new(presence.clone()));

        Self {
            auth,
            tenants,
            relationships: Arc::new(RelationshipLedger::new(directory.clone())),
            messages: Arc::new(MessageLedger::new()),
            presence,
            delivery,
            directory,
            config,
        }
    }

    /// Run a ledger future under the configured store timeout
    pub async fn bounded<T, F>(&self, fut: F) -> crate::error::Result<T>
    where
        F: std::future::Future<Output = crate::error::Result<T>>,
    {
        tokio::time::timeout(self.config.store_timeout, fut).await?
    }

    /// Authorized send shared by the socket and HTTP paths: checks the
    /// relationship and that the receiver account exists, persists, then
    /// fans out to both parties.
    pub async fn send_direct(
        &self,
        store: &TenantStore,
        sender: &Participant,
        receiver: &Participant,
        body: &str,
    ) -> crate::error::Result<Message> {
        if body.trim().is_empty() {
            return Err(ChatError::BadRequest("message body is empty".to_string()));
        }

        let authorized = self
            .bounded(self.relationships.is_authorized(store, sender, receiver))
            .await?;
        if !authorized {
            return Err(ChatError::Forbidden(
                "you must be friends to send messages".to_string(),
            ));
        }

        let exists = self.bounded(self.directory.resolve(store, receiver)).await?;
        if exists.is_none() {
            return Err(ChatError::NotFound(format!("recipient {}", receiver)));
        }

        self.bounded(
            self.delivery
                .dispatch(&self.messages, store, sender, receiver, body),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_expectations() {
        let config = ChatServerConfig::with_base_dir("/tmp/chat");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/chat"));
        assert_eq!(config.max_missed_pings, 2);
        assert_eq!(config.catchup_window, chrono::Duration::hours(24));
        assert_eq!(config.bind_addr.port(), 10000);
    }
}
