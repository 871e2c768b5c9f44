//! The hub: live-connection set, named-peer registry, broadcast primitives.
//!
//! The hub exclusively owns both maps. Every named-peer entry refers to a
//! connection that is authenticated, non-transient and carries the matching
//! peer name; insertion and removal each happen exactly once, both performed
//! by the authentication gate inside a dispatch pass. Because dispatch
//! passes never interleave, the registry is never observed half-updated.

use crate::connection::Connection;
use crate::error::ServerError;
use crate::protocol;
use beacon_event_system::EventBus;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

pub struct Hub {
    bus: Arc<EventBus<Connection>>,
    heartbeat_interval: Duration,
    connections: RwLock<HashMap<Uuid, Arc<Connection>>>,
    peers: RwLock<HashMap<String, Arc<Connection>>>,
}

impl Hub {
    pub fn new(bus: Arc<EventBus<Connection>>, heartbeat_interval: Duration) -> Self {
        Self {
            bus,
            heartbeat_interval,
            connections: RwLock::new(HashMap::new()),
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn bus(&self) -> Arc<EventBus<Connection>> {
        self.bus.clone()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub async fn insert_connection(&self, conn: Arc<Connection>) {
        self.connections.write().await.insert(conn.id(), conn);
    }

    pub async fn remove_connection(&self, id: Uuid) {
        self.connections.write().await.remove(&id);
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Registers an authenticated connection under its display name.
    ///
    /// Refuses to overwrite: a name collision here means the key-in-use
    /// check was bypassed somehow, and silently replacing the existing peer
    /// would strand it.
    pub async fn register_peer(&self, name: &str, conn: Arc<Connection>) -> Result<(), ServerError> {
        let mut peers = self.peers.write().await;
        if peers.contains_key(name) {
            return Err(ServerError::Registry(format!(
                "peer name '{name}' is already registered"
            )));
        }
        debug!(connection = %conn.id(), "Registered peer '{name}'");
        peers.insert(name.to_string(), conn);
        Ok(())
    }

    /// Removes the registry entry for `name`, but only if it still refers to
    /// connection `id`. Returns whether an entry was removed.
    pub async fn unregister_peer(&self, name: &str, id: Uuid) -> bool {
        let mut peers = self.peers.write().await;
        if peers.get(name).is_some_and(|c| c.id() == id) {
            peers.remove(name);
            debug!("Unregistered peer '{name}'");
            true
        } else {
            false
        }
    }

    pub async fn peer(&self, name: &str) -> Option<Arc<Connection>> {
        self.peers.read().await.get(name).cloned()
    }

    pub async fn peer_names(&self) -> Vec<String> {
        self.peers.read().await.keys().cloned().collect()
    }

    /// Snapshot of the registry, for extensions that enumerate peers.
    pub async fn peers_snapshot(&self) -> Vec<(String, Arc<Connection>)> {
        self.peers
            .read()
            .await
            .iter()
            .map(|(name, conn)| (name.clone(), conn.clone()))
            .collect()
    }

    /// Whether some other live connection already authenticated with `key`.
    ///
    /// This scans the live set; two sockets presenting the same key at
    /// nearly the same instant are resolved by dispatch ordering, not by an
    /// atomic check-and-set.
    pub async fn key_in_use(&self, key: &str, excluding: Uuid) -> bool {
        let connections: Vec<Arc<Connection>> =
            self.connections.read().await.values().cloned().collect();
        for conn in connections {
            if conn.id() == excluding {
                continue;
            }
            if conn.api_key().await.as_deref() == Some(key) {
                return true;
            }
        }
        false
    }

    /// Delivers `frame` to every live connection except `sender`,
    /// independent of authentication.
    pub async fn broadcast_others(&self, sender: Uuid, frame: &Value) {
        let connections: Vec<Arc<Connection>> =
            self.connections.read().await.values().cloned().collect();
        for conn in connections {
            if conn.id() != sender {
                conn.send(frame);
            }
        }
    }

    /// Delivers `frame` to every registered peer except `sender`. Transient
    /// and unauthenticated connections are not in the registry, so lifecycle
    /// announcements never reach them.
    pub async fn broadcast_peers(&self, sender: Uuid, frame: &Value) {
        for (_, conn) in self.peers_snapshot().await {
            if conn.id() != sender {
                conn.send(frame);
            }
        }
    }

    /// Delivers `frame` to every live connection.
    pub async fn send_all(&self, frame: &Value) {
        let connections: Vec<Arc<Connection>> =
            self.connections.read().await.values().cloned().collect();
        for conn in connections {
            conn.send(frame);
        }
    }

    /// Shutdown notice to everyone, then forced close of every transport.
    pub async fn close_all(&self) {
        let connections: Vec<Arc<Connection>> =
            self.connections.read().await.values().cloned().collect();
        info!("Closing {} connection(s)", connections.len());
        self.send_all(&protocol::shutdown_frame()).await;
        for conn in &connections {
            conn.close();
        }
    }
}
