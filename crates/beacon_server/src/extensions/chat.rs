//! Chat relay between named peers.
//!
//! Relays chat frames to a single target peer or to every other peer, and
//! keeps a bounded in-memory buffer of the most recent messages so polling
//! clients (dashboards) can pull history down periodically.
//!
//! Error codes:
//!   1 | The target peer was not found. | Alert the user and continue.

use super::{Extension, ExtensionContext};
use crate::connection::Connection;
use crate::error::ExtensionError;
use crate::hub::Hub;
use async_trait::async_trait;
use beacon_event_system::utils::current_timestamp_secs_f64;
use beacon_event_system::{events, Event, EventError, EventHandler};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

const CHAT_PRIORITY: i32 = 100;

/// Messages kept in the history buffer.
const HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    message: String,
    time: f64,
    user: String,
    source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<String>,
}

pub struct ChatExtension {
    history: Arc<Mutex<Vec<ChatMessage>>>,
}

impl Default for ChatExtension {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatExtension {
    pub fn new() -> Self {
        Self {
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl Extension for ChatExtension {
    fn name(&self) -> &'static str {
        "chat"
    }

    fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    async fn setup(&self, ctx: ExtensionContext) -> Result<(), ExtensionError> {
        ctx.bus
            .register(
                events::DATA_RECEIVED,
                &ctx.extension_id,
                CHAT_PRIORITY,
                false,
                Arc::new(OnDataReceived {
                    hub: ctx.hub.clone(),
                    history: self.history.clone(),
                }),
            )
            .await?;
        Ok(())
    }
}

struct OnDataReceived {
    hub: Arc<Hub>,
    history: Arc<Mutex<Vec<ChatMessage>>>,
}

impl OnDataReceived {
    /// Appends to the buffer, keeping it time-ordered and bounded; the
    /// oldest messages are dropped first.
    async fn save_message(&self, message: ChatMessage) {
        let mut history = self.history.lock().await;
        history.push(message);
        history.sort_by(|a, b| a.time.total_cmp(&b.time));
        while history.len() > HISTORY_LIMIT {
            history.remove(0);
        }
    }
}

#[async_trait]
impl EventHandler<Connection> for OnDataReceived {
    async fn handle(&self, event: &mut Event<Connection>) -> Result<(), EventError> {
        let Some(conn) = event.source().cloned() else {
            return Ok(());
        };
        // Only named peers take part in chat.
        let Some(source) = conn.peer_name().await else {
            return Ok(());
        };
        let data = event.data().clone();

        match data.get("action").and_then(Value::as_str) {
            Some("chat") => {
                let (Some(message), Some(user)) = (
                    data.get("message").and_then(Value::as_str),
                    data.get("user").and_then(Value::as_str),
                ) else {
                    debug!(connection = %conn.id(), "Chat frame without message/user");
                    return Ok(());
                };
                let target = data
                    .get("target")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let time = current_timestamp_secs_f64();

                self.save_message(ChatMessage {
                    message: message.to_string(),
                    time,
                    user: user.to_string(),
                    source: source.clone(),
                    target: target.clone(),
                })
                .await;

                info!("<{user}@{source}> {message}");

                let relay = json!({
                    "from": "chat",
                    "source": source,
                    "time": time,
                    "message": message,
                    "user": user,
                });
                match target {
                    Some(target) => match self.hub.peer(&target).await {
                        Some(peer) => peer.send(&relay),
                        None => conn.send(&json!({
                            "from": "chat",
                            "error": format!("Unable to locate server: {target}"),
                            "code": 1,
                        })),
                    },
                    None => self.hub.broadcast_peers(conn.id(), &relay).await,
                }
            }
            Some("chat-history") => {
                let history = self.history.lock().await;
                conn.send(&json!({ "from": "chat", "history": &*history }));
            }
            _ => {}
        }
        Ok(())
    }
}
