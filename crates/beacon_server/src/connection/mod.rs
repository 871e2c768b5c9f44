//! Per-socket connection state.
//!
//! A [`Connection`] is created on accept and lives behind an `Arc` shared by
//! the reader loop, the heartbeat task, the hub and every event handler that
//! receives it as an event source. Outbound frames funnel through an
//! unbounded channel into a dedicated writer task; once the connection is
//! closed, sends are silently dropped.

mod lifecycle;

pub use lifecycle::handle_connection;

use crate::hub::Hub;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{Notify, RwLock};
use tracing::warn;
use uuid::Uuid;

/// Outbound writer commands.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// One serialized frame, without the trailing newline.
    Frame(String),
    /// Flush whatever is queued ahead of this and shut the write half down.
    Close,
}

/// Mutable per-connection protocol state, guarded by one lock so handlers
/// observe it whole.
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    /// Set by the authentication gate, never unset.
    pub authenticated: bool,
    /// The key this connection authenticated with.
    pub api_key: Option<String>,
    /// Display name looked up from the key table.
    pub peer_name: Option<String>,
    /// Transient peers are excluded from the registry and from lifecycle
    /// broadcasts.
    pub transient: bool,
    /// Timestamps of pings that have not been acknowledged yet, oldest
    /// first. Three outstanding pings is fatal.
    pub outstanding_pings: Vec<String>,
}

/// One client connection.
pub struct Connection {
    id: Uuid,
    remote_addr: SocketAddr,
    hub: Weak<Hub>,
    outbound: UnboundedSender<Outbound>,
    connected: AtomicBool,
    disconnect_fired: AtomicBool,
    closed: Notify,
    connected_at: SystemTime,
    state: RwLock<ConnectionState>,
    /// Per-connection extension state, keyed by extension id. Replaces
    /// ad-hoc attribute injection: an extension owns exactly its own slot.
    extension_state: RwLock<HashMap<String, Value>>,
}

impl Connection {
    pub(crate) fn new(
        remote_addr: SocketAddr,
        hub: Weak<Hub>,
        outbound: UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            hub,
            outbound,
            connected: AtomicBool::new(true),
            disconnect_fired: AtomicBool::new(false),
            closed: Notify::new(),
            connected_at: SystemTime::now(),
            state: RwLock::new(ConnectionState::default()),
            extension_state: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    /// The hub this connection belongs to, if it is still alive.
    pub fn hub(&self) -> Option<Arc<Hub>> {
        self.hub.upgrade()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Queues a frame for delivery. Frames sent after close are dropped
    /// silently; failed sends are never retried.
    pub fn send(&self, frame: &Value) {
        if !self.is_connected() {
            return;
        }
        match serde_json::to_string(frame) {
            Ok(line) => {
                let _ = self.outbound.send(Outbound::Frame(line));
            }
            Err(e) => warn!(connection = %self.id, "Dropping unserializable frame: {e}"),
        }
    }

    /// Closes the transport. Idempotent; queued frames ahead of the close
    /// are still flushed. The reader loop wakes up and runs the disconnect
    /// path.
    pub fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.outbound.send(Outbound::Close);
            self.closed.notify_one();
        }
    }

    /// Resolves when [`close`](Connection::close) has been called.
    pub(crate) async fn closed(&self) {
        self.closed.notified().await;
    }

    /// True exactly once: whoever wins runs the disconnect dispatch.
    pub(crate) fn begin_disconnect(&self) -> bool {
        self.connected.store(false, Ordering::SeqCst);
        !self.disconnect_fired.swap(true, Ordering::SeqCst)
    }

    /// A consistent snapshot of the protocol state.
    pub async fn state(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state.read().await.authenticated
    }

    pub async fn peer_name(&self) -> Option<String> {
        self.state.read().await.peer_name.clone()
    }

    pub async fn api_key(&self) -> Option<String> {
        self.state.read().await.api_key.clone()
    }

    /// Resets the authentication fields. The gate runs this on
    /// `protocol_built`, before any other extension observes the connection.
    pub async fn reset_auth(&self) {
        let mut state = self.state.write().await;
        state.authenticated = false;
        state.api_key = None;
        state.peer_name = None;
        state.transient = false;
    }

    /// One-shot promotion to authenticated; there is no way back.
    pub async fn set_authenticated(&self, api_key: String, peer_name: String, transient: bool) {
        let mut state = self.state.write().await;
        state.authenticated = true;
        state.api_key = Some(api_key);
        state.peer_name = Some(peer_name);
        state.transient = transient;
    }

    /// Appends a ping timestamp and returns how many are now outstanding.
    pub async fn push_ping(&self, timestamp: String) -> usize {
        let mut state = self.state.write().await;
        state.outstanding_pings.push(timestamp);
        state.outstanding_pings.len()
    }

    pub async fn outstanding_pings(&self) -> usize {
        self.state.read().await.outstanding_pings.len()
    }

    /// Removes the matching outstanding ping, if any. An acknowledgment for
    /// a timestamp that was never sent (or already acknowledged) is ignored.
    pub async fn take_pong(&self, timestamp: &str) -> bool {
        let mut state = self.state.write().await;
        match state.outstanding_pings.iter().position(|t| t == timestamp) {
            Some(idx) => {
                state.outstanding_pings.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Stores `value` in this connection's slot for `extension_id`.
    pub async fn set_extension_state(&self, extension_id: &str, value: Value) {
        self.extension_state
            .write()
            .await
            .insert(extension_id.to_string(), value);
    }

    /// Reads the slot for `extension_id`.
    pub async fn extension_state(&self, extension_id: &str) -> Option<Value> {
        self.extension_state.read().await.get(extension_id).cloned()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("connected", &self.is_connected())
            .finish()
    }
}
