//! Error types for the storage contracts, configuration and feed adapters

use thiserror::Error;

/// Failure talking to the archive or the speed layer
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Remote answered with an unexpected status
    #[error("{operation} on {path} failed with status {status}")]
    Status {
        operation: &'static str,
        path: String,
        status: u16,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Failure inside a feed adapter. Never fatal; adapters log and carry on.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Unexpected status {0}")]
    Status(u16),

    #[error("Malformed payload: {0}")]
    Malformed(String),
}
