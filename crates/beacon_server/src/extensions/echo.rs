//! Echo extension: sends received frames back to the sender.
//!
//! Mostly useful for wiring up and debugging new clients. Controlled by
//! `echo.toml` (`enabled`); disabled deployments keep the extension loaded
//! but inert.

use super::{Extension, ExtensionContext};
use crate::config::ConfigStore;
use crate::connection::Connection;
use crate::error::ExtensionError;
use async_trait::async_trait;
use beacon_event_system::{events, Event, EventError, EventHandler};
use std::sync::Arc;

const ECHO_PRIORITY: i32 = 10;

pub struct EchoExtension;

#[async_trait]
impl Extension for EchoExtension {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    async fn setup(&self, ctx: ExtensionContext) -> Result<(), ExtensionError> {
        if ctx.config.get_mapping("echo").await?.is_none() {
            ctx.config.save_mapping("echo", "echo.toml").await?;
            let mut root = toml::value::Table::new();
            root.insert("enabled".to_string(), toml::Value::Boolean(true));
            ctx.config
                .save_file("echo.toml", &toml::Value::Table(root))
                .await?;
            ctx.config.reload().await?;
        }

        ctx.bus
            .register(
                events::DATA_RECEIVED,
                &ctx.extension_id,
                ECHO_PRIORITY,
                false,
                Arc::new(OnDataReceived {
                    config: ctx.config.clone(),
                }),
            )
            .await?;
        Ok(())
    }
}

struct OnDataReceived {
    config: Arc<ConfigStore>,
}

#[async_trait]
impl EventHandler<Connection> for OnDataReceived {
    async fn handle(&self, event: &mut Event<Connection>) -> Result<(), EventError> {
        let Some(conn) = event.source().cloned() else {
            return Ok(());
        };
        let enabled = self
            .config
            .get("echo")
            .await
            .and_then(|v| v.get("enabled").and_then(toml::Value::as_bool))
            .unwrap_or(false);
        if enabled {
            conn.send(event.data());
        }
        Ok(())
    }
}
