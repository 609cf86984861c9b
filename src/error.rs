//! Error types for the Blockgate service.

use thiserror::Error;

/// Failure reported by a storage backend.
///
/// Every variant is fail-closed: the limiter turns it into a denial and
/// hands it back to the caller, which must report an internal failure
/// rather than a rate-limit rejection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The backend could not be reached, failed, or timed out.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// A stored count or block value could not be parsed.
    #[error("Malformed record at {key}: {value:?}")]
    MalformedRecord { key: String, value: String },
}

impl From<redis::RedisError> for StorageError {
    fn from(e: redis::RedisError) -> Self {
        StorageError::Unavailable(e.to_string())
    }
}

/// Main error type for Blockgate operations.
#[derive(Error, Debug)]
pub enum GateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy that cannot be enforced (zero limit, out-of-range duration)
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    /// Storage backend errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for GateError {
    fn from(e: config::ConfigError) -> Self {
        GateError::Config(e.to_string())
    }
}

/// Result type alias for Blockgate operations.
pub type Result<T> = std::result::Result<T, GateError>;
