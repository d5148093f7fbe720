use crate::error::{ChatError, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Lowercase the tenant id and replace anything outside `[a-z0-9]` with `_`.
///
/// Returns `None` for ids that are empty after trimming.
pub fn normalize_tenant_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(
        trimmed
            .chars()
            .map(|c| {
                let c = c.to_ascii_lowercase();
                if c.is_ascii_lowercase() || c.is_ascii_digit() {
                    c
                } else {
                    '_'
                }
            })
            .collect(),
    )
}

/// Timestamps are stored as integer microseconds since the epoch
pub(crate) fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

pub(crate) fn from_micros(us: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(us).unwrap_or_default()
}

/// Handle to one tenant's isolated database
#[derive(Debug)]
pub struct TenantStore {
    tenant: String,
    pool: SqlitePool,
}

impl TenantStore {
    /// Open (creating if missing) the database for an already-normalized tenant id
    pub async fn open(data_dir: &Path, tenant: &str, max_connections: u32) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| ChatError::StoreUnavailable(e.to_string()))?;

        let path = data_dir.join(format!("gym_{}.sqlite", tenant));
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        let store = Self {
            tenant: tenant.to_string(),
            pool,
        };
        store.init_db().await?;
        Ok(store)
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_db(&self) -> Result<()> {
        // pair_key is the sorted pair of ids, so one row per unordered pair
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS relationship_requests (
                id TEXT PRIMARY KEY,
                pair_key TEXT NOT NULL UNIQUE,
                from_id TEXT NOT NULL,
                from_role TEXT NOT NULL,
                to_id TEXT NOT NULL,
                to_role TEXT NOT NULL,
                message TEXT,
                status TEXT NOT NULL DEFAULT 'PENDING',
                created_at INTEGER NOT NULL,
                responded_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_requests_to ON relationship_requests (to_id, status)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                sender_id TEXT NOT NULL,
                sender_role TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                receiver_role TEXT NOT NULL,
                body TEXT NOT NULL,
                timestamp_us INTEGER NOT NULL,
                read INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_receiver ON messages (receiver_id, read, timestamp_us)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_pair ON messages (sender_id, receiver_id, timestamp_us)",
        )
        .execute(&self.pool)
        .await?;

        // Account tables are owned by the registration flows; only read here
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS staff_accounts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                email TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS member_accounts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                email TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Resolves tenant ids to cached store handles.
///
/// Handles are never evicted; the cache grows by one entry per tenant seen.
pub struct TenantStoreRouter {
    data_dir: PathBuf,
    max_connections: u32,
    stores: RwLock<HashMap<String, Arc<TenantStore>>>,
}

impl TenantStoreRouter {
    pub fn new(data_dir: impl Into<PathBuf>, max_connections: u32) -> Self {
        Self {
            data_dir: data_dir.into(),
            max_connections,
            stores: RwLock::new(HashMap::new()),
        }
    }

    /// Get the store for a tenant, opening it on first access
    pub async fn resolve(&self, tenant_id: &str) -> Result<Arc<TenantStore>> {
        let tenant = normalize_tenant_id(tenant_id)
            .ok_or_else(|| ChatError::BadRequest("empty tenant id".to_string()))?;

        {
            let stores = self.stores.read().await;
            if let Some(store) = stores.get(&tenant) {
                return Ok(store.clone());
            }
        }

        // Open outside the lock so one slow tenant does not stall the others
        let opened = match TenantStore::open(&self.data_dir, &tenant, self.max_connections).await {
            Ok(store) => store,
            Err(e) => {
                warn!("[Tenants] Failed to open store for {}: {}", tenant, e);
                return Err(e);
            }
        };

        let opened = Arc::new(opened);
        let winner = {
            let mut stores = self.stores.write().await;
            match stores.entry(tenant) {
                Entry::Occupied(entry) => entry.get().clone(),
                Entry::Vacant(entry) => {
                    info!("[Tenants] Opened store for {}", entry.key());
                    entry.insert(opened.clone()).clone()
                }
            }
        };

        // Lost the race to a concurrent first access
        if !Arc::ptr_eq(&winner, &opened) {
            opened.close().await;
        }
        Ok(winner)
    }

    /// Normalized ids of every tenant opened so far
    pub async fn tenants(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.stores.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drain the cache and close every pool
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.stores.write().await.drain().collect();
        for (tenant, store) in drained {
            store.close().await;
            info!("[Tenants] Closed store for {}", tenant);
        }
    }
}
