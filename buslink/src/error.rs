//! Common error types for buslink.
//!
//! This module provides a centralized Error enum using thiserror,
//! with conversions from underlying error types used throughout the crate.

use thiserror::Error;

/// Main error type for buslink operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port errors
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// Wire serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The link is not usable and will not become usable
    #[error("Link down: {0}")]
    LinkDown(String),

    /// A request saw no correlated reply within its timeout
    #[error("Request {id} timed out after {elapsed_ms}ms")]
    Timeout { id: String, elapsed_ms: u64 },

    /// The transaction manager task is no longer running
    #[error("Transaction manager stopped")]
    ManagerStopped,
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
