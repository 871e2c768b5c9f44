//! Wire protocol frames.
//!
//! Every frame on the wire is one newline-delimited JSON object. This module
//! centralizes the frames the core and the authentication gate produce so the
//! shapes stay uniform: user-visible failures are always `{"error": ...}`,
//! optionally with `from` and `code`.

use serde_json::{json, Value};

/// Protocol version advertised in the greeting frame.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Server → client, first frame on every connection.
pub fn greeting_frame() -> Value {
    json!({ "version": PROTOCOL_VERSION })
}

/// Reply to a line that did not parse as a JSON object. Sent to the offending
/// sender only; the connection stays open.
pub fn malformed_frame_reply() -> Value {
    json!({ "error": "No JSON object could be decoded", "from": "core" })
}

/// Heartbeat ping. The client must echo `{"pong": <same timestamp>}`.
pub fn ping_frame(timestamp: &str) -> Value {
    json!({ "from": "ping", "timestamp": timestamp })
}

/// Sent right before force-closing a connection that missed three
/// consecutive heartbeats.
pub fn ping_timeout_frame() -> Value {
    json!({ "error": "Ping timeout", "from": "core" })
}

/// Sent to every live connection before the listener goes away.
pub fn shutdown_frame() -> Value {
    json!({ "error": "Server is shutting down", "from": "core" })
}

/// Peer lifecycle announcement, broadcast to the other registered peers.
/// `action` is `"authenticated"` or `"disconnected"`.
pub fn auth_announcement(action: &str, name: &str) -> Value {
    json!({ "from": "auth", "action": action, "name": name, "status": "success" })
}

/// Authentication error codes.
///
/// Code 1 is a warning (the connection stays open); codes 2–4 are fatal and
/// the gate force-closes the connection after replying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthCode {
    AlreadyAuthenticated = 1,
    KeyInUse = 2,
    InvalidKey = 3,
    MissingKey = 4,
}

impl AuthCode {
    pub fn text(self) -> &'static str {
        match self {
            AuthCode::AlreadyAuthenticated => "You have already authenticated.",
            AuthCode::KeyInUse => "Another server is already using your API key.",
            AuthCode::InvalidKey => "Your API key is invalid or not recognized.",
            AuthCode::MissingKey => "You did not provide an API key.",
        }
    }

    pub fn reply(self) -> Value {
        json!({
            "error": self.text(),
            "from": "auth",
            "status": "error",
            "code": self as i64,
        })
    }
}

/// Extracts the acknowledged timestamp from a `{"pong": ...}` frame.
///
/// Clients are expected to echo the timestamp string verbatim, but a numeric
/// echo of a numeric-looking timestamp is accepted too.
pub fn pong_timestamp(frame: &Value) -> Option<String> {
    match frame.get("pong")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
