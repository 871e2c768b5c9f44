//! Error types for the hub core.

use beacon_event_system::EventError;
use thiserror::Error;

/// Errors from the configuration store.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Errors from extension setup and teardown. Fatal only to the offending
/// extension; the manager logs, unregisters its handlers and carries on.
#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("Extension setup failed: {0}")]
    SetupFailed(String),
    #[error("Extension teardown failed: {0}")]
    TeardownFailed(String),
    #[error("Event error: {0}")]
    Event(#[from] EventError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Server-level errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Registry error: {0}")]
    Registry(String),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Extension error: {0}")]
    Extension(#[from] ExtensionError),
    #[error("Event error: {0}")]
    Event(#[from] EventError),
    #[error("Internal error: {0}")]
    Internal(String),
}
