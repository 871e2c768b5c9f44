//! Composition root: wires the bus, hub, config store and extensions
//! together and runs the accept loop.

use crate::config::ConfigStore;
use crate::connection::{handle_connection, Connection};
use crate::error::ServerError;
use crate::extensions::{builtin_extensions, ExtensionManager};
use crate::hub::Hub;
use beacon_event_system::EventBus;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// How long `serve` waits for closed connections to finish their disconnect
/// dispatch before extensions are torn down.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Server configuration settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Address the TCP listener binds to.
    pub bind_address: SocketAddr,
    /// Interval between heartbeat pings.
    pub heartbeat_interval: Duration,
    /// Root directory of the configuration store.
    pub config_directory: PathBuf,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8022".parse().expect("static address"),
            heartbeat_interval: Duration::from_secs(30),
            config_directory: PathBuf::from("config"),
        }
    }
}

/// The rendezvous hub server.
///
/// Construct once per process and share behind an `Arc`; the bus and hub are
/// created here and passed explicitly to everything that needs them, so
/// there is no hidden global lookup.
pub struct Server {
    settings: ServerSettings,
    config: Arc<ConfigStore>,
    bus: Arc<EventBus<Connection>>,
    hub: Arc<Hub>,
    extensions: ExtensionManager,
    shutdown_sender: broadcast::Sender<()>,
}

impl Server {
    pub fn new(settings: ServerSettings) -> Self {
        let bus = Arc::new(EventBus::new());
        let config = Arc::new(ConfigStore::new(&settings.config_directory));
        let hub = Arc::new(Hub::new(bus.clone(), settings.heartbeat_interval));
        let (shutdown_sender, _) = broadcast::channel(1);

        Self {
            settings,
            config,
            bus,
            hub,
            extensions: ExtensionManager::new(),
            shutdown_sender,
        }
    }

    pub fn hub(&self) -> Arc<Hub> {
        self.hub.clone()
    }

    pub fn bus(&self) -> Arc<EventBus<Connection>> {
        self.bus.clone()
    }

    pub fn config_store(&self) -> Arc<ConfigStore> {
        self.config.clone()
    }

    /// Loads configuration and brings up the built-in extensions. Runs once
    /// before [`serve`](Server::serve).
    pub async fn setup(&self) -> Result<(), ServerError> {
        self.config.load().await?;
        for extension in builtin_extensions() {
            self.extensions.register(extension).await;
        }
        self.extensions
            .setup_all(self.hub.clone(), self.bus.clone(), self.config.clone())
            .await;
        Ok(())
    }

    /// Full startup: setup, bind, and serve until shutdown.
    pub async fn start(&self) -> Result<(), ServerError> {
        info!("🚀 Starting beacon hub on {}", self.settings.bind_address);
        self.setup().await?;

        let listener = TcpListener::bind(self.settings.bind_address)
            .await
            .map_err(|e| ServerError::Network(format!("Bind failed: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Network(e.to_string()))?;
        info!("Now listening on {local_addr}");

        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener. Returns after the
    /// coordinated drain: stop accepting → notify and close every live
    /// connection → deactivate extensions.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut shutdown_receiver = self.shutdown_sender.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let hub = self.hub.clone();
                        tokio::spawn(handle_connection(hub, stream, addr));
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {e}");
                        break;
                    }
                },
                _ = shutdown_receiver.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        info!("Shutting down..");
        drop(listener);
        self.hub.close_all().await;
        // Connection tasks dispatch client_disconnected on their way out;
        // extensions must still be registered when that happens.
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while self.hub.connection_count().await > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!("Drain timed out with connections still live");
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.extensions.teardown_all(self.bus.clone()).await;
        info!("Finished shutting down.");
        Ok(())
    }

    /// Initiates the coordinated shutdown drain.
    pub fn shutdown(&self) {
        let _ = self.shutdown_sender.send(());
    }
}
