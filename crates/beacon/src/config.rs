//! Application configuration loaded from a TOML file, with defaults created
//! on first run and validation before the hub starts.

use beacon_server::ServerSettings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_config_directory() -> String {
    "config".to_string()
}

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Hub configuration settings
    pub hub: HubSettings,
    /// Logging configuration settings
    pub logging: LoggingSettings,
}

/// Hub-specific configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSettings {
    /// Network address to bind the listener to (e.g., "127.0.0.1:8022")
    pub bind_address: String,
    /// Seconds between heartbeat pings
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    /// Directory holding the extension configuration store
    #[serde(default = "default_config_directory")]
    pub config_directory: String,
}

/// Logging system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            hub: HubSettings {
                bind_address: "127.0.0.1:8022".to_string(),
                heartbeat_interval: 30,
                config_directory: "config".to_string(),
            },
            logging: LoggingSettings {
                level: "info".to_string(),
                json_format: false,
            },
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file does not exist, writes a default configuration there so
    /// operators have a file to edit, and returns the defaults.
    pub async fn load_from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Converts the application configuration into the hub's server settings.
    pub fn to_server_settings(&self) -> Result<ServerSettings, Box<dyn std::error::Error>> {
        Ok(ServerSettings {
            bind_address: self.hub.bind_address.parse()?,
            heartbeat_interval: Duration::from_secs(self.hub.heartbeat_interval),
            config_directory: PathBuf::from(&self.hub.config_directory),
        })
    }

    /// Validates the configuration for consistency before startup.
    pub fn validate(&self) -> Result<(), String> {
        if self.hub.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!("Invalid bind address: {}", &self.hub.bind_address));
        }

        if self.hub.heartbeat_interval == 0 {
            return Err("Heartbeat interval must be at least 1 second".to_string());
        }

        if self.hub.config_directory.is_empty() {
            return Err("Configuration directory cannot be empty".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }
}
