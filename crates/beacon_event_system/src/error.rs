//! Error types for the event system.

use thiserror::Error;

/// Errors surfaced by the event bus.
#[derive(Debug, Error)]
pub enum EventError {
    /// An extension tried to register a second handler for the same event.
    /// One handler per (event name, extension id) pair; the first
    /// registration stays in place.
    #[error("extension '{extension}' has already registered a handler for '{event}'")]
    DuplicateRegistration { event: String, extension: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Handler execution error: {0}")]
    HandlerExecution(String),
}
