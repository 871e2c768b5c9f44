//! Extension lifecycle: the capability contract and the manager.
//!
//! An extension is a unit of behavior that registers event handlers. The
//! lifecycle is discover → activate → inject (hub reference and stable
//! identity, via [`ExtensionContext`]) → setup. A setup failure deactivates
//! only that extension; the rest of the system keeps running. Teardown runs
//! in registration order during shutdown, after every connection has been
//! closed, so no post-teardown events reach removed handlers.

pub mod auth;
pub mod chat;
pub mod echo;
pub mod greeter;
pub mod presence;

pub use auth::AuthExtension;
pub use chat::ChatExtension;
pub use echo::EchoExtension;
pub use greeter::GreeterExtension;
pub use presence::PresenceExtension;

use crate::config::ConfigStore;
use crate::connection::Connection;
use crate::error::ExtensionError;
use crate::hub::Hub;
use async_trait::async_trait;
use beacon_event_system::{events, Event, EventBus};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Everything an extension needs, injected before `setup` runs.
#[derive(Clone)]
pub struct ExtensionContext {
    pub hub: Arc<Hub>,
    pub bus: Arc<EventBus<Connection>>,
    pub config: Arc<ConfigStore>,
    /// Stable identity; also the extension's registration id on the bus and
    /// its key into per-connection extension-state slots.
    pub extension_id: String,
}

/// The capability interface every extension implements.
#[async_trait]
pub trait Extension: Send + Sync {
    /// Stable name; doubles as the bus registration id.
    fn name(&self) -> &'static str;

    fn version(&self) -> &'static str;

    /// Register handlers and prepare state. Runs once, after injection.
    async fn setup(&self, ctx: ExtensionContext) -> Result<(), ExtensionError>;

    /// Clean up on shutdown or after a failed setup. Handler
    /// unregistration is the manager's job, not the extension's.
    async fn teardown(&self) -> Result<(), ExtensionError> {
        Ok(())
    }
}

/// The built-in extensions, in their fixed activation order.
pub fn builtin_extensions() -> Vec<Box<dyn Extension>> {
    vec![
        Box::new(AuthExtension),
        Box::new(ChatExtension::new()),
        Box::new(EchoExtension),
        Box::new(GreeterExtension),
        Box::new(PresenceExtension),
    ]
}

struct LoadedExtension {
    extension: Box<dyn Extension>,
    active: bool,
}

/// Owns the extensions and runs their lifecycle.
pub struct ExtensionManager {
    extensions: RwLock<Vec<LoadedExtension>>,
}

impl Default for ExtensionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtensionManager {
    pub fn new() -> Self {
        Self {
            extensions: RwLock::new(Vec::new()),
        }
    }

    /// Adds a discovered extension. Order of registration is the order of
    /// setup and teardown.
    pub async fn register(&self, extension: Box<dyn Extension>) {
        self.extensions.write().await.push(LoadedExtension {
            extension,
            active: false,
        });
    }

    pub async fn extension_names(&self) -> Vec<String> {
        self.extensions
            .read()
            .await
            .iter()
            .map(|e| e.extension.name().to_string())
            .collect()
    }

    pub async fn active_count(&self) -> usize {
        self.extensions
            .read()
            .await
            .iter()
            .filter(|e| e.active)
            .count()
    }

    /// Activates every registered extension: inject the context, run setup,
    /// announce `extension_loaded`. A failing setup is logged, its handlers
    /// are unregistered and the unit stays inactive; everything else loads.
    pub async fn setup_all(
        &self,
        hub: Arc<Hub>,
        bus: Arc<EventBus<Connection>>,
        config: Arc<ConfigStore>,
    ) {
        info!("Loading extensions..");
        let mut extensions = self.extensions.write().await;
        for loaded in extensions.iter_mut() {
            let name = loaded.extension.name();
            let version = loaded.extension.version();
            let ctx = ExtensionContext {
                hub: hub.clone(),
                bus: bus.clone(),
                config: config.clone(),
                extension_id: name.to_string(),
            };
            match loaded.extension.setup(ctx).await {
                Ok(()) => {
                    loaded.active = true;
                    info!("Loaded extension: {name} v{version}");
                    let mut event = Event::new(events::EXTENSION_LOADED)
                        .with_data(json!({ "name": name, "version": version }));
                    bus.dispatch(&mut event).await;
                }
                Err(e) => {
                    warn!("Unable to load extension {name} v{version}: {e}");
                    bus.unregister_all(name).await;
                    if let Err(e) = loaded.extension.teardown().await {
                        warn!("Teardown after failed setup of {name}: {e}");
                    }
                }
            }
        }
        drop(extensions);

        let mut event = Event::new(events::EXTENSIONS_LOADED);
        bus.dispatch(&mut event).await;
        info!("Finished loading extensions.");
    }

    /// Deactivates every active extension, in registration order.
    pub async fn teardown_all(&self, bus: Arc<EventBus<Connection>>) {
        info!("Disabling extensions..");
        let mut extensions = self.extensions.write().await;
        for loaded in extensions.iter_mut() {
            if !loaded.active {
                continue;
            }
            let name = loaded.extension.name();
            let version = loaded.extension.version();
            match loaded.extension.teardown().await {
                Ok(()) => info!("Disabled extension: {name} v{version}"),
                Err(e) => warn!("Error disabling extension {name} v{version}: {e}"),
            }
            bus.unregister_all(name).await;
            loaded.active = false;
        }
        info!("Finished disabling extensions.");
    }
}
