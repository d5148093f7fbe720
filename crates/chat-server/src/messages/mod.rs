//! Message Ledger
//!
//! Persists direct messages per tenant. The ledger does not check
//! relationships; callers authorize before appending.

use crate::error::{ChatError, Result};
use crate::models::{Message, Participant};
use crate::store::tenant::{from_micros, to_micros};
use crate::store::TenantStore;
use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

type MessageRow = (String, String, String, String, String, String, i64, bool);

const MESSAGE_COLUMNS: &str =
    "id, sender_id, sender_role, receiver_id, receiver_role, body, timestamp_us, read";

fn row_to_message(row: MessageRow) -> Result<Message> {
    let (id, sender_id, sender_role, receiver_id, receiver_role, body, timestamp_us, read) = row;
    let corrupt = |e: String| ChatError::StoreUnavailable(format!("corrupt message row: {}", e));

    Ok(Message {
        id,
        sender_id,
        sender_role: sender_role.parse().map_err(corrupt)?,
        receiver_id,
        receiver_role: receiver_role.parse().map_err(corrupt)?,
        body,
        timestamp: from_micros(timestamp_us),
        read,
    })
}

#[derive(Debug, Default)]
pub struct MessageLedger;

impl MessageLedger {
    pub fn new() -> Self {
        Self
    }

    /// Persist a new unread message
    pub async fn append(
        &self,
        store: &TenantStore,
        sender: &Participant,
        receiver: &Participant,
        body: &str,
    ) -> Result<Message> {
        // Round-trip through micros so the returned value matches what is stored
        let timestamp = from_micros(to_micros(Utc::now()));
        let message = Message {
            id: Uuid::new_v4().to_string(),
            sender_id: sender.id.clone(),
            sender_role: sender.role,
            receiver_id: receiver.id.clone(),
            receiver_role: receiver.role,
            body: body.to_string(),
            timestamp,
            read: false,
        };

        sqlx::query(
            "INSERT INTO messages
             (id, sender_id, sender_role, receiver_id, receiver_role, body, timestamp_us, read)
             VALUES (?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(&message.id)
        .bind(&message.sender_id)
        .bind(message.sender_role.as_str())
        .bind(&message.receiver_id)
        .bind(message.receiver_role.as_str())
        .bind(&message.body)
        .bind(to_micros(message.timestamp))
        .execute(store.pool())
        .await?;

        debug!(
            "[Messages] {} stored in {}: {} -> {}",
            message.id,
            store.tenant(),
            sender,
            receiver
        );
        Ok(message)
    }

    pub async fn get(&self, store: &TenantStore, message_id: &str) -> Result<Option<Message>> {
        let sql = format!("SELECT {} FROM messages WHERE id = ?", MESSAGE_COLUMNS);
        let row: Option<MessageRow> = sqlx::query_as(&sql)
            .bind(message_id)
            .fetch_optional(store.pool())
            .await?;

        row.map(row_to_message).transpose()
    }

    /// Every message between two account ids, oldest first
    pub async fn history(&self, store: &TenantStore, a: &str, b: &str) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {} FROM messages
             WHERE (sender_id = ? AND receiver_id = ?) OR (sender_id = ? AND receiver_id = ?)
             ORDER BY timestamp_us ASC, seq ASC",
            MESSAGE_COLUMNS
        );
        let rows: Vec<MessageRow> = sqlx::query_as(&sql)
            .bind(a)
            .bind(b)
            .bind(b)
            .bind(a)
            .fetch_all(store.pool())
            .await?;

        rows.into_iter().map(row_to_message).collect()
    }

    /// Mark a message read on behalf of its receiver.
    ///
    /// Marking an already-read message is a no-op.
    pub async fn mark_read(
        &self,
        store: &TenantStore,
        message_id: &str,
        reader: &Participant,
    ) -> Result<Message> {
        let mut message = self
            .get(store, message_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id)))?;

        if message.receiver() != *reader {
            return Err(ChatError::Forbidden(
                "only the receiver can mark a message as read".to_string(),
            ));
        }
        if message.read {
            return Ok(message);
        }

        sqlx::query("UPDATE messages SET read = 1 WHERE id = ? AND read = 0")
            .bind(message_id)
            .execute(store.pool())
            .await?;

        message.read = true;
        info!("[Messages] {} marked read by {}", message.id, reader);
        Ok(message)
    }

    /// Unread messages addressed to `receiver` at or after `since`, oldest first
    pub async fn unseen_since(
        &self,
        store: &TenantStore,
        receiver: &Participant,
        since: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {} FROM messages
             WHERE receiver_id = ? AND receiver_role = ? AND read = 0 AND timestamp_us >= ?
             ORDER BY timestamp_us ASC, seq ASC",
            MESSAGE_COLUMNS
        );
        let rows: Vec<MessageRow> = sqlx::query_as(&sql)
            .bind(&receiver.id)
            .bind(receiver.role.as_str())
            .bind(to_micros(since))
            .fetch_all(store.pool())
            .await?;

        rows.into_iter().map(row_to_message).collect()
    }
}
