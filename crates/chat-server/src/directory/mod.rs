//! Display identity lookup
//!
//! Accounts belong to the registration flows; chat only needs a name and
//! email to decorate request and friend listings.

use crate::error::Result;
use crate::models::{DirectoryEntry, DisplayIdentity, Participant, Role};
use crate::store::TenantStore;
use async_trait::async_trait;

/// Resolves an account to its display identity within one tenant
#[async_trait]
pub trait DisplayDirectory: Send + Sync {
    /// `Ok(None)` when the account no longer exists
    async fn resolve(
        &self,
        store: &TenantStore,
        participant: &Participant,
    ) -> Result<Option<DisplayIdentity>>;

    /// Every account of the tenant, staff first, each role ordered by name
    async fn list(&self, store: &TenantStore) -> Result<Vec<DirectoryEntry>>;
}

/// Directory backed by the tenant database's account tables
#[derive(Debug, Default, Clone)]
pub struct AccountTables;

impl AccountTables {
    fn table(role: Role) -> &'static str {
        match role {
            Role::Staff => "staff_accounts",
            Role::Member => "member_accounts",
        }
    }

    /// Insert or update an account row (seeding and tests)
    pub async fn register(
        store: &TenantStore,
        participant: &Participant,
        name: &str,
        email: &str,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (id, name, email) VALUES (?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, email = excluded.email",
            Self::table(participant.role)
        );
        sqlx::query(&sql)
            .bind(&participant.id)
            .bind(name)
            .bind(email)
            .execute(store.pool())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DisplayDirectory for AccountTables {
    async fn resolve(
        &self,
        store: &TenantStore,
        participant: &Participant,
    ) -> Result<Option<DisplayIdentity>> {
        let sql = format!(
            "SELECT name, email FROM {} WHERE id = ?",
            Self::table(participant.role)
        );
        let row: Option<(String, String)> = sqlx::query_as(&sql)
            .bind(&participant.id)
            .fetch_optional(store.pool())
            .await?;

        Ok(row.map(|(name, email)| DisplayIdentity { name, email }))
    }

    async fn list(&self, store: &TenantStore) -> Result<Vec<DirectoryEntry>> {
        let mut entries = Vec::new();
        for role in [Role::Staff, Role::Member] {
            let sql = format!(
                "SELECT id, name, email FROM {} ORDER BY name ASC, id ASC",
                Self::table(role)
            );
            let rows: Vec<(String, String, String)> =
                sqlx::query_as(&sql).fetch_all(store.pool()).await?;

            entries.extend(rows.into_iter().map(|(id, name, email)| DirectoryEntry {
                participant: Participant::new(id, role),
                display: DisplayIdentity { name, email },
            }));
        }
        Ok(entries)
    }
}
