//! The authentication gate.
//!
//! Every connection's first substantive frame must carry an `api_key`. The
//! gate runs at the highest priority for `data_received`, so it sees each
//! frame before any other extension and can cancel it, reply with an error
//! code and close the transport. On success the connection becomes a named
//! peer in the hub registry (unless the frame marked it transient) and the
//! other registered peers hear about it.
//!
//! Error codes:
//!   1 | Already authenticated.        | Warning only, connection stays open.
//!   2 | Key in use by another socket. | Fatal, connection closes.
//!   3 | Key not in the key table.     | Fatal, connection closes.
//!   4 | No key provided.              | Fatal, connection closes.
//!
//! The key table lives in the configuration store under the `auth` key
//! (`auth.toml`, `[keys]` table of key → display name) and is reloaded
//! before every check, so keys can be rotated live.

use super::{Extension, ExtensionContext};
use crate::config::ConfigStore;
use crate::connection::Connection;
use crate::error::ExtensionError;
use crate::hub::Hub;
use crate::protocol::{self, AuthCode};
use async_trait::async_trait;
use beacon_event_system::{events, Event, EventBus, EventError, EventHandler};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The gate brackets the whole system: nothing may observe a frame before
/// it, and registry cleanup must run after everyone else's disconnect
/// handling.
const GATE_PRIORITY: i32 = 10_000;
const CLEANUP_PRIORITY: i32 = -10_000;

pub struct AuthExtension;

#[async_trait]
impl Extension for AuthExtension {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    async fn setup(&self, ctx: ExtensionContext) -> Result<(), ExtensionError> {
        // First run: create an empty key table so operators have a file to
        // fill in.
        if ctx.config.get_mapping("auth").await?.is_none() {
            ctx.config.save_mapping("auth", "auth.toml").await?;
            let mut root = toml::value::Table::new();
            root.insert(
                "keys".to_string(),
                toml::Value::Table(toml::value::Table::new()),
            );
            ctx.config
                .save_file("auth.toml", &toml::Value::Table(root))
                .await?;
            ctx.config.reload().await?;
        }

        let gate = Arc::new(Gate {
            hub: ctx.hub.clone(),
            bus: ctx.bus.clone(),
            config: ctx.config.clone(),
        });

        ctx.bus
            .register(
                events::PROTOCOL_BUILT,
                &ctx.extension_id,
                GATE_PRIORITY,
                false,
                Arc::new(OnProtocolBuilt),
            )
            .await?;
        ctx.bus
            .register(
                events::DATA_RECEIVED,
                &ctx.extension_id,
                GATE_PRIORITY,
                false,
                Arc::new(OnDataReceived(gate.clone())),
            )
            .await?;
        // Cleanup accepts cancelled events: the registry entry must go away
        // no matter what another extension did to the disconnect event.
        ctx.bus
            .register(
                events::CLIENT_DISCONNECTED,
                &ctx.extension_id,
                CLEANUP_PRIORITY,
                true,
                Arc::new(OnClientDisconnected(gate)),
            )
            .await?;
        Ok(())
    }
}

struct Gate {
    hub: Arc<Hub>,
    bus: Arc<EventBus<Connection>>,
    config: Arc<ConfigStore>,
}

impl Gate {
    /// Looks up the display name for `key`, reloading the table first so a
    /// rotated file takes effect immediately.
    async fn lookup_name(&self, key: &str) -> Option<String> {
        if let Err(e) = self.config.reload_key("auth").await {
            warn!("Could not reload key table, using cached copy: {e}");
        }
        self.config
            .get("auth")
            .await?
            .get("keys")?
            .get(key)?
            .as_str()
            .map(str::to_string)
    }

    fn reject(&self, conn: &Arc<Connection>, event: &mut Event<Connection>, code: AuthCode) {
        event.cancel();
        conn.send(&code.reply());
        conn.close();
    }
}

struct OnProtocolBuilt;

#[async_trait]
impl EventHandler<Connection> for OnProtocolBuilt {
    async fn handle(&self, event: &mut Event<Connection>) -> Result<(), EventError> {
        let Some(conn) = event.source().cloned() else {
            return Ok(());
        };
        conn.reset_auth().await;
        debug!(connection = %conn.id(), "Initialized authentication state");
        Ok(())
    }
}

struct OnDataReceived(Arc<Gate>);

#[async_trait]
impl EventHandler<Connection> for OnDataReceived {
    async fn handle(&self, event: &mut Event<Connection>) -> Result<(), EventError> {
        let Some(conn) = event.source().cloned() else {
            return Ok(());
        };
        let gate = &self.0;
        let data = event.data().clone();

        if conn.is_authenticated().await {
            // Re-presenting a key is a client bug worth flagging, but the
            // frame is otherwise ordinary traffic: no cancel, no close.
            if data.get("api_key").is_some() {
                warn!(connection = %conn.id(), "Already-authenticated client re-sent an API key");
                conn.send(&AuthCode::AlreadyAuthenticated.reply());
            }
            return Ok(());
        }

        let Some(key_value) = data.get("api_key") else {
            gate.reject(&conn, event, AuthCode::MissingKey);
            return Ok(());
        };
        // A key that is present but not a string can never match the table.
        let Some(key) = key_value.as_str() else {
            gate.reject(&conn, event, AuthCode::InvalidKey);
            return Ok(());
        };

        if gate.hub.key_in_use(key, conn.id()).await {
            gate.reject(&conn, event, AuthCode::KeyInUse);
            return Ok(());
        }

        let Some(name) = gate.lookup_name(key).await else {
            gate.reject(&conn, event, AuthCode::InvalidKey);
            return Ok(());
        };

        let transient = data
            .get("not_server")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        conn.set_authenticated(key.to_string(), name.clone(), transient)
            .await;
        info!("Client authenticated: {name}");

        if transient {
            debug!(connection = %conn.id(), "Transient client, skipping registry");
            return Ok(());
        }

        gate.hub
            .register_peer(&name, conn.clone())
            .await
            .map_err(|e| EventError::HandlerExecution(e.to_string()))?;
        gate.hub
            .broadcast_peers(conn.id(), &protocol::auth_announcement("authenticated", &name))
            .await;

        let mut authorized = Event::with_source(events::AUTHORIZED, conn.clone())
            .with_data(json!({ "name": name }));
        gate.bus.dispatch(&mut authorized).await;
        Ok(())
    }
}

struct OnClientDisconnected(Arc<Gate>);

#[async_trait]
impl EventHandler<Connection> for OnClientDisconnected {
    async fn handle(&self, event: &mut Event<Connection>) -> Result<(), EventError> {
        let Some(conn) = event.source().cloned() else {
            return Ok(());
        };
        let gate = &self.0;
        let state = conn.state().await;

        let Some(name) = state.peer_name else {
            return Ok(());
        };

        if !state.transient {
            gate.hub.unregister_peer(&name, conn.id()).await;
        }

        if state.authenticated && !state.transient {
            gate.hub
                .broadcast_peers(conn.id(), &protocol::auth_announcement("disconnected", &name))
                .await;
        }
        Ok(())
    }
}
