//! Presence Registry
//!
//! Tracks which live connection currently speaks for each identity, plus one
//! broadcast channel per tenant for online/offline announcements.
//!
//! Locks here are never held across an `.await`.

use crate::gateway::protocol::ServerEvent;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};
use uuid::Uuid;

/// Buffered frames per tenant broadcast channel
const TENANT_CHANNEL_CAPACITY: usize = 256;

/// A live connection's delivery queue, tagged with its connection id.
///
/// The queue is unbounded so a registered connection never loses a
/// delivery; a reader that stops answering pings is dropped by liveness.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub connection_id: Uuid,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl ConnectionHandle {
    pub fn new(connection_id: Uuid, tx: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self { connection_id, tx }
    }

    /// Queue an event without waiting; false if the connection is gone
    pub fn push(&self, event: ServerEvent) -> bool {
        if self.tx.send(event).is_err() {
            debug!("[Presence] Connection {} already closed", self.connection_id);
            return false;
        }
        true
    }
}

/// Registry key: identity ids are only unique within a tenant
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PresenceKey {
    pub tenant: String,
    pub identity_id: String,
}

impl PresenceKey {
    pub fn new(tenant: impl Into<String>, identity_id: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            identity_id: identity_id.into(),
        }
    }
}

#[derive(Default)]
pub struct PresenceRegistry {
    connections: RwLock<HashMap<PresenceKey, ConnectionHandle>>,
    channels: RwLock<HashMap<String, broadcast::Sender<ServerEvent>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` for `key`, returning the connection it supersedes
    pub fn set(&self, key: PresenceKey, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let previous = self.connections.write().insert(key.clone(), handle);
        if let Some(prev) = &previous {
            info!(
                "[Presence] {}/{} superseded connection {}",
                key.tenant, key.identity_id, prev.connection_id
            );
        }
        previous
    }

    /// Remove the entry only if it still belongs to `connection_id`.
    ///
    /// Returns true when an entry was removed.
    pub fn remove(&self, key: &PresenceKey, connection_id: Uuid) -> bool {
        let mut connections = self.connections.write();
        match connections.get(key) {
            Some(current) if current.connection_id == connection_id => {
                connections.remove(key);
                true
            }
            Some(_) => {
                debug!(
                    "[Presence] Stale disconnect for {}/{} ignored",
                    key.tenant, key.identity_id
                );
                false
            }
            None => false,
        }
    }

    pub fn get(&self, key: &PresenceKey) -> Option<ConnectionHandle> {
        self.connections.read().get(key).cloned()
    }

    pub fn is_online(&self, tenant: &str, identity_id: &str) -> bool {
        self.connections
            .read()
            .contains_key(&PresenceKey::new(tenant, identity_id))
    }

    /// Identity ids currently online in a tenant, sorted
    pub fn online(&self, tenant: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .connections
            .read()
            .keys()
            .filter(|k| k.tenant == tenant)
            .map(|k| k.identity_id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn channel(&self, tenant: &str) -> broadcast::Sender<ServerEvent> {
        if let Some(tx) = self.channels.read().get(tenant) {
            return tx.clone();
        }
        self.channels
            .write()
            .entry(tenant.to_string())
            .or_insert_with(|| broadcast::channel(TENANT_CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Join a tenant's broadcast channel
    pub fn subscribe(&self, tenant: &str) -> broadcast::Receiver<ServerEvent> {
        self.channel(tenant).subscribe()
    }

    /// Best-effort send to every subscriber of a tenant; returns the receiver count
    pub fn broadcast(&self, tenant: &str, event: ServerEvent) -> usize {
        self.channel(tenant).send(event).unwrap_or(0)
    }

    /// Drop every registration and channel (process shutdown)
    pub fn clear(&self) {
        let dropped = {
            let mut connections = self.connections.write();
            let count = connections.len();
            connections.clear();
            count
        };
        self.channels.write().clear();
        info!("[Presence] Cleared {} registrations", dropped);
    }
}
