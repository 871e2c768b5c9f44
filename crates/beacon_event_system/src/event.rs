//! The event value passed through a dispatch pass.

use serde_json::Value;
use std::sync::Arc;

/// Well-known event names emitted by the hub core.
///
/// Extensions are free to dispatch their own names as well; these constants
/// only exist so the core and the built-in extensions agree on spelling.
pub mod events {
    /// A connection object has been built but nothing has been sent yet.
    /// Extensions attach per-connection state here.
    pub const PROTOCOL_BUILT: &str = "protocol_built";
    /// The greeting has been sent and the heartbeat is running.
    pub const CLIENT_CONNECTED: &str = "client_connected";
    /// The transport closed; fired exactly once per connection.
    pub const CLIENT_DISCONNECTED: &str = "client_disconnected";
    /// A parsed inbound frame that is not a heartbeat acknowledgment.
    pub const DATA_RECEIVED: &str = "data_received";
    /// A heartbeat ping went out; payload carries the timestamp.
    pub const PING_SENT: &str = "ping_sent";
    /// A matching heartbeat acknowledgment came back.
    pub const PONG_RECEIVED: &str = "pong_received";
    /// The authentication gate promoted a connection to a named peer.
    pub const AUTHORIZED: &str = "authorized";
    /// A single extension finished setup.
    pub const EXTENSION_LOADED: &str = "extension_loaded";
    /// All extensions finished setup.
    pub const EXTENSIONS_LOADED: &str = "extensions_loaded";
}

/// A single emitted event.
///
/// Events are created immediately before dispatch, passed by mutable
/// reference through every eligible handler in one pass, and discarded
/// afterwards. `S` is the source/caller type (the server's connection).
#[derive(Debug)]
pub struct Event<S> {
    name: String,
    source: Option<Arc<S>>,
    data: Value,
    cancelled: bool,
}

impl<S> Event<S> {
    /// Creates an event with no source connection (system-level events).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: None,
            data: Value::Null,
            cancelled: false,
        }
    }

    /// Creates an event attributed to a source connection.
    pub fn with_source(name: impl Into<String>, source: Arc<S>) -> Self {
        Self {
            name: name.into(),
            source: Some(source),
            data: Value::Null,
            cancelled: false,
        }
    }

    /// Attaches an event-specific payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> Option<&Arc<S>> {
        self.source.as_ref()
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Cancels the event. Remaining handlers in the current pass only run if
    /// they were registered with `accepts_cancelled`. There is no way to
    /// un-cancel an event.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled
    }
}
