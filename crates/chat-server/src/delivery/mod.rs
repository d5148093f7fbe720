//! Delivery Router
//!
//! Persists outbound messages and fans them out to whichever of the two
//! parties currently holds a live connection.

use crate::error::Result;
use crate::gateway::protocol::ServerEvent;
use crate::messages::MessageLedger;
use crate::models::{Message, Participant};
use crate::presence::{PresenceKey, PresenceRegistry};
use crate::relationships::pair_key;
use crate::store::TenantStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

/// Prune idle pair locks once the map grows past this
const PAIR_LOCK_PRUNE_THRESHOLD: usize = 1024;

/// Which sides of a message had a live connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivered {
    pub sender: bool,
    pub receiver: bool,
}

pub struct DeliveryRouter {
    presence: Arc<PresenceRegistry>,
    pair_locks: Mutex<HashMap<(String, String), Arc<AsyncMutex<()>>>>,
}

impl DeliveryRouter {
    pub fn new(presence: Arc<PresenceRegistry>) -> Self {
        Self {
            presence,
            pair_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Serialize append+deliver for one pair so delivery order matches append order
    async fn lock_pair(&self, tenant: &str, a: &str, b: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.pair_locks.lock();
            if locks.len() > PAIR_LOCK_PRUNE_THRESHOLD {
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            locks
                .entry((tenant.to_string(), pair_key(a, b)))
                .or_default()
                .clone()
        };
        lock.lock_owned().await
    }

    /// Append through the ledger, then deliver to both parties.
    ///
    /// Callers must have checked the relationship first.
    pub async fn dispatch(
        &self,
        ledger: &MessageLedger,
        store: &TenantStore,
        sender: &Participant,
        receiver: &Participant,
        body: &str,
    ) -> Result<Message> {
        let _guard = self.lock_pair(store.tenant(), &sender.id, &receiver.id).await;
        let message = ledger.append(store, sender, receiver, body).await?;
        self.deliver(store.tenant(), &message);
        Ok(message)
    }

    /// Push `receive_message` to the sender's and receiver's live connections
    pub fn deliver(&self, tenant: &str, message: &Message) -> Delivered {
        let event = ServerEvent::ReceiveMessage(message.clone());
        let delivered = Delivered {
            sender: self.notify(tenant, &message.sender_id, event.clone()),
            receiver: self.notify(tenant, &message.receiver_id, event),
        };

        if !delivered.receiver {
            debug!(
                "[Delivery] {} held for catch-up, receiver offline",
                message.id
            );
        }
        delivered
    }

    /// Best-effort push of one event to one identity; false if offline
    pub fn notify(&self, tenant: &str, identity_id: &str, event: ServerEvent) -> bool {
        match self.presence.get(&PresenceKey::new(tenant, identity_id)) {
            Some(handle) => handle.push(event),
            None => false,
        }
    }
}
