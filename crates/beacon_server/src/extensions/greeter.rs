//! Greeter extension: the smallest possible behavior-bearing unit.
//!
//! Logs a configurable message at setup and whenever traffic arrives. Kept
//! as a working reference for extension authors.

use super::{Extension, ExtensionContext};
use crate::config::ConfigStore;
use crate::connection::Connection;
use crate::error::ExtensionError;
use async_trait::async_trait;
use beacon_event_system::{events, Event, EventError, EventHandler};
use std::sync::Arc;
use tracing::info;

const GREETER_PRIORITY: i32 = 1;
const DEFAULT_MESSAGE: &str = "Hello, world!";

pub struct GreeterExtension;

fn configured_message(value: Option<toml::Value>) -> String {
    value
        .and_then(|v| {
            v.get("message")
                .and_then(toml::Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| DEFAULT_MESSAGE.to_string())
}

#[async_trait]
impl Extension for GreeterExtension {
    fn name(&self) -> &'static str {
        "greeter"
    }

    fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    async fn setup(&self, ctx: ExtensionContext) -> Result<(), ExtensionError> {
        if ctx.config.get_mapping("greeter").await?.is_none() {
            ctx.config.save_mapping("greeter", "greeter.toml").await?;
            let mut root = toml::value::Table::new();
            root.insert(
                "message".to_string(),
                toml::Value::String(DEFAULT_MESSAGE.to_string()),
            );
            ctx.config
                .save_file("greeter.toml", &toml::Value::Table(root))
                .await?;
            ctx.config.reload().await?;
        }

        info!("{}", configured_message(ctx.config.get("greeter").await));

        ctx.bus
            .register(
                events::DATA_RECEIVED,
                &ctx.extension_id,
                GREETER_PRIORITY,
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
    async fn handle(&self, _event: &mut Event<Connection>) -> Result<(), EventError> {
        info!("{}", configured_message(self.config.get("greeter").await));
        Ok(())
    }
}
