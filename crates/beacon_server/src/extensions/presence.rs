//! Player presence tracking.
//!
//! Each peer reports its own players coming online and going offline; the
//! extension mirrors those lists into the per-connection extension-state
//! slot and lets any peer enumerate another peer's players, or everyone
//! else's at once.

use super::{Extension, ExtensionContext};
use crate::connection::Connection;
use crate::error::ExtensionError;
use crate::hub::Hub;
use async_trait::async_trait;
use beacon_event_system::{events, Event, EventError, EventHandler};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Presence runs after every other built-in data handler; it only reads the
/// frame.
const PRESENCE_PRIORITY: i32 = 0;
/// The state slot must exist before any traffic handler can run, so the
/// `protocol_built` registration sits near the top.
const BUILD_PRIORITY: i32 = 9_999;

pub struct PresenceExtension;

#[async_trait]
impl Extension for PresenceExtension {
    fn name(&self) -> &'static str {
        "presence"
    }

    fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    async fn setup(&self, ctx: ExtensionContext) -> Result<(), ExtensionError> {
        ctx.bus
            .register(
                events::PROTOCOL_BUILT,
                &ctx.extension_id,
                BUILD_PRIORITY,
                false,
                Arc::new(OnProtocolBuilt {
                    extension_id: ctx.extension_id.clone(),
                }),
            )
            .await?;
        ctx.bus
            .register(
                events::DATA_RECEIVED,
                &ctx.extension_id,
                PRESENCE_PRIORITY,
                false,
                Arc::new(OnDataReceived {
                    hub: ctx.hub.clone(),
                    extension_id: ctx.extension_id.clone(),
                }),
            )
            .await?;
        Ok(())
    }
}

struct OnProtocolBuilt {
    extension_id: String,
}

#[async_trait]
impl EventHandler<Connection> for OnProtocolBuilt {
    async fn handle(&self, event: &mut Event<Connection>) -> Result<(), EventError> {
        let Some(conn) = event.source().cloned() else {
            return Ok(());
        };
        conn.set_extension_state(&self.extension_id, json!([])).await;
        debug!(connection = %conn.id(), "Attached player list");
        Ok(())
    }
}

struct OnDataReceived {
    hub: Arc<Hub>,
    extension_id: String,
}

impl OnDataReceived {
    async fn players_of(&self, conn: &Arc<Connection>) -> Vec<Value> {
        match conn.extension_state(&self.extension_id).await {
            Some(Value::Array(players)) => players,
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl EventHandler<Connection> for OnDataReceived {
    async fn handle(&self, event: &mut Event<Connection>) -> Result<(), EventError> {
        let Some(conn) = event.source().cloned() else {
            return Ok(());
        };
        if !conn.is_authenticated().await {
            return Ok(());
        }
        let data = event.data().clone();
        if data.get("action").and_then(Value::as_str) != Some("players") {
            return Ok(());
        }
        let source = conn
            .peer_name()
            .await
            .unwrap_or_else(|| conn.id().to_string());

        match data.get("type").and_then(Value::as_str) {
            Some("online") => {
                let Some(player) = data.get("player").and_then(Value::as_str) else {
                    return Ok(());
                };
                debug!("Player connected to {source}: {player}");
                let mut players = self.players_of(&conn).await;
                players.push(Value::String(player.to_string()));
                conn.set_extension_state(&self.extension_id, Value::Array(players))
                    .await;
                self.hub
                    .broadcast_peers(
                        conn.id(),
                        &json!({
                            "from": "players",
                            "type": "online",
                            "player": player,
                            "target": source,
                        }),
                    )
                    .await;
            }
            Some("offline") => {
                let Some(player) = data.get("player").and_then(Value::as_str) else {
                    return Ok(());
                };
                let mut players = self.players_of(&conn).await;
                let Some(idx) = players.iter().position(|p| p.as_str() == Some(player)) else {
                    return Ok(());
                };
                debug!("Player disconnected from {source}: {player}");
                players.remove(idx);
                conn.set_extension_state(&self.extension_id, Value::Array(players))
                    .await;
                self.hub
                    .broadcast_peers(
                        conn.id(),
                        &json!({
                            "from": "players",
                            "type": "offline",
                            "player": player,
                            "target": source,
                        }),
                    )
                    .await;
            }
            Some("list") => {
                let reply = match data.get("target").and_then(Value::as_str) {
                    Some(target) => match self.hub.peer(target).await {
                        Some(peer) => {
                            debug!("Server {source} requested players from server {target}");
                            json!({
                                "from": "players",
                                "players": self.players_of(&peer).await,
                                "type": "list",
                                "target": target,
                            })
                        }
                        None => json!({
                            "from": "players",
                            "error": format!("Unknown server: {target}"),
                        }),
                    },
                    None => {
                        debug!("Server {source} requested players from all servers");
                        let mut all_players = Map::new();
                        for (name, peer) in self.hub.peers_snapshot().await {
                            if peer.id() != conn.id() {
                                all_players
                                    .insert(name, Value::Array(self.players_of(&peer).await));
                            }
                        }
                        json!({
                            "from": "players",
                            "players": all_players,
                            "type": "list",
                            "target": "all",
                        })
                    }
                };
                conn.send(&reply);
            }
            other => {
                conn.send(&json!({
                    "from": "players",
                    "error": format!("Unknown action type: {}", other.unwrap_or("none")),
                }));
            }
        }
        Ok(())
    }
}
