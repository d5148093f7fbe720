//! Relationship Request Module
//!
//! Handles chat requests between two accounts of a tenant. Two accounts may
//! exchange messages only once a request between them has been accepted.

use crate::directory::DisplayDirectory;
use crate::error::{ChatError, Result};
use crate::models::{
    Counterparty, Decision, PendingRequest, Participant, RelationshipRequest, RequestSender,
    RequestStatus,
};
use crate::store::tenant::{from_micros, to_micros};
use crate::store::TenantStore;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Order-independent key for a pair of account ids
pub(crate) fn pair_key(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{}\u{1f}{}", lo, hi)
}

type RequestRow = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    i64,
    Option<i64>,
);

const REQUEST_COLUMNS: &str =
    "id, from_id, from_role, to_id, to_role, message, status, created_at, responded_at";

fn row_to_request(row: RequestRow) -> Result<RelationshipRequest> {
    let (id, from, from_role, to, to_role, message, status, created_at, responded_at) = row;
    let corrupt = |e: String| ChatError::StoreUnavailable(format!("corrupt request row: {}", e));

    Ok(RelationshipRequest {
        id,
        from,
        from_role: from_role.parse().map_err(corrupt)?,
        to,
        to_role: to_role.parse().map_err(corrupt)?,
        message,
        status: status.parse().map_err(corrupt)?,
        created_at: from_micros(created_at),
        responded_at: responded_at.map(from_micros),
    })
}

/// Relationship ledger handles all request-related operations
pub struct RelationshipLedger {
    directory: Arc<dyn DisplayDirectory>,
}

impl RelationshipLedger {
    pub fn new(directory: Arc<dyn DisplayDirectory>) -> Self {
        Self { directory }
    }

    /// Create a pending request from `from` to `to`.
    ///
    /// Fails with `DuplicateRequest` if any request already exists for the
    /// pair, in either direction and with any status.
    pub async fn create(
        &self,
        store: &TenantStore,
        from: &Participant,
        to: &Participant,
        message: Option<String>,
    ) -> Result<RelationshipRequest> {
        if from.id == to.id {
            return Err(ChatError::BadRequest(
                "cannot send a chat request to yourself".to_string(),
            ));
        }

        let request = RelationshipRequest {
            id: Uuid::new_v4().to_string(),
            from: from.id.clone(),
            from_role: from.role,
            to: to.id.clone(),
            to_role: to.role,
            message,
            status: RequestStatus::Pending,
            created_at: Utc::now(),
            responded_at: None,
        };

        // The UNIQUE pair_key makes check-and-insert a single atomic step
        let inserted = sqlx::query(
            "INSERT INTO relationship_requests
             (id, pair_key, from_id, from_role, to_id, to_role, message, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&request.id)
        .bind(pair_key(&from.id, &to.id))
        .bind(&request.from)
        .bind(request.from_role.as_str())
        .bind(&request.to)
        .bind(request.to_role.as_str())
        .bind(&request.message)
        .bind(request.status.as_str())
        .bind(to_micros(request.created_at))
        .execute(store.pool())
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                debug!("[Relationships] Duplicate request {} -> {}", from, to);
                return Err(ChatError::DuplicateRequest);
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            "[Relationships] Request {} created in {}: {} -> {}",
            request.id,
            store.tenant(),
            from,
            to
        );
        Ok(request)
    }

    pub async fn get(&self, store: &TenantStore, request_id: &str) -> Result<Option<RelationshipRequest>> {
        let sql = format!(
            "SELECT {} FROM relationship_requests WHERE id = ?",
            REQUEST_COLUMNS
        );
        let row: Option<RequestRow> = sqlx::query_as(&sql)
            .bind(request_id)
            .fetch_optional(store.pool())
            .await?;

        row.map(row_to_request).transpose()
    }

    /// Pending requests addressed to `recipient`, newest first, with the
    /// sender's display identity. Senders that no longer resolve keep empty
    /// name and email.
    pub async fn find_pending(
        &self,
        store: &TenantStore,
        recipient: &Participant,
    ) -> Result<Vec<PendingRequest>> {
        let sql = format!(
            "SELECT {} FROM relationship_requests
             WHERE to_id = ? AND to_role = ? AND status = 'PENDING'
             ORDER BY created_at DESC",
            REQUEST_COLUMNS
        );
        let rows: Vec<RequestRow> = sqlx::query_as(&sql)
            .bind(&recipient.id)
            .bind(recipient.role.as_str())
            .fetch_all(store.pool())
            .await?;

        let mut pending = Vec::with_capacity(rows.len());
        for row in rows {
            let request = row_to_request(row)?;
            let sender = request.sender();
            let display = self
                .directory
                .resolve(store, &sender)
                .await?
                .unwrap_or_default();

            pending.push(PendingRequest {
                id: request.id,
                from: RequestSender {
                    id: sender.id,
                    role: sender.role,
                    name: display.name,
                    email: display.email,
                },
                message: request.message,
                created_at: request.created_at,
            });
        }

        Ok(pending)
    }

    /// Accept or reject a request. Only the recipient may decide, and only once.
    pub async fn decide(
        &self,
        store: &TenantStore,
        request_id: &str,
        decider: &Participant,
        decision: Decision,
    ) -> Result<RelationshipRequest> {
        let mut request = self
            .get(store, request_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("request {}", request_id)))?;

        if request.recipient() != *decider {
            return Err(ChatError::Forbidden(
                "only the recipient can respond to this request".to_string(),
            ));
        }
        if request.status != RequestStatus::Pending {
            return Err(ChatError::AlreadyDecided(request.id));
        }

        let status = decision.status();
        let responded_at = Utc::now();

        // Guarded on PENDING so two concurrent decisions cannot both land
        let updated = sqlx::query(
            "UPDATE relationship_requests SET status = ?, responded_at = ?
             WHERE id = ? AND status = 'PENDING'",
        )
        .bind(status.as_str())
        .bind(to_micros(responded_at))
        .bind(request_id)
        .execute(store.pool())
        .await?;

        if updated.rows_affected() != 1 {
            return Err(ChatError::AlreadyDecided(request.id));
        }

        request.status = status;
        request.responded_at = Some(responded_at);

        info!(
            "[Relationships] Request {} {} by {}",
            request.id,
            status.as_str(),
            decider
        );
        Ok(request)
    }

    /// True iff an accepted request links exactly these two participants,
    /// in either direction, with matching roles.
    pub async fn is_authorized(
        &self,
        store: &TenantStore,
        a: &Participant,
        b: &Participant,
    ) -> Result<bool> {
        let found: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM relationship_requests
             WHERE status = 'ACCEPTED' AND (
                (from_id = ? AND from_role = ? AND to_id = ? AND to_role = ?) OR
                (from_id = ? AND from_role = ? AND to_id = ? AND to_role = ?)
             )
             LIMIT 1",
        )
        .bind(&a.id)
        .bind(a.role.as_str())
        .bind(&b.id)
        .bind(b.role.as_str())
        .bind(&b.id)
        .bind(b.role.as_str())
        .bind(&a.id)
        .bind(a.role.as_str())
        .fetch_optional(store.pool())
        .await?;

        Ok(found.is_some())
    }

    /// Status of the request between two account ids, if any
    pub async fn status_between(
        &self,
        store: &TenantStore,
        a: &str,
        b: &str,
    ) -> Result<Option<RequestStatus>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT status FROM relationship_requests WHERE pair_key = ?")
                .bind(pair_key(a, b))
                .fetch_optional(store.pool())
                .await?;

        row.map(|(status,)| status.parse().map_err(ChatError::StoreUnavailable))
            .transpose()
    }

    /// Status of every request involving the account id `who`, keyed by the
    /// other account's id.
    pub async fn statuses_for(
        &self,
        store: &TenantStore,
        who: &str,
    ) -> Result<HashMap<String, RequestStatus>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT from_id, to_id, status FROM relationship_requests
             WHERE from_id = ? OR to_id = ?",
        )
        .bind(who)
        .bind(who)
        .fetch_all(store.pool())
        .await?;

        let mut statuses = HashMap::with_capacity(rows.len());
        for (from, to, status) in rows {
            let other = if from == who { to } else { from };
            statuses.insert(other, status.parse().map_err(ChatError::StoreUnavailable)?);
        }
        Ok(statuses)
    }

    /// Counterparties of every accepted relationship involving `who`.
    /// Counterparties whose accounts no longer resolve are left out.
    pub async fn list_accepted(
        &self,
        store: &TenantStore,
        who: &Participant,
    ) -> Result<Vec<Counterparty>> {
        let sql = format!(
            "SELECT {} FROM relationship_requests
             WHERE status = 'ACCEPTED' AND (
                (from_id = ? AND from_role = ?) OR (to_id = ? AND to_role = ?)
             )
             ORDER BY responded_at ASC",
            REQUEST_COLUMNS
        );
        let rows: Vec<RequestRow> = sqlx::query_as(&sql)
            .bind(&who.id)
            .bind(who.role.as_str())
            .bind(&who.id)
            .bind(who.role.as_str())
            .fetch_all(store.pool())
            .await?;

        let mut friends = Vec::with_capacity(rows.len());
        for row in rows {
            let request = row_to_request(row)?;
            let other = if request.sender() == *who {
                request.recipient()
            } else {
                request.sender()
            };

            match self.directory.resolve(store, &other).await? {
                Some(display) => friends.push(Counterparty {
                    counterparty_id: other.id,
                    counterparty_role: other.role,
                    name: display.name,
                    email: display.email,
                }),
                None => debug!("[Relationships] Dropping unresolved counterparty {}", other),
            }
        }

        Ok(friends)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_key_ignores_direction() {
        assert_eq!(pair_key("a", "b"), pair_key("b", "a"));
        assert_ne!(pair_key("a", "bc"), pair_key("ab", "c"));
    }
}
