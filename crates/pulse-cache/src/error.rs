//! Error types for cache store operations

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while talking to a cache store
#[derive(Debug, Error)]
pub enum CacheError {
    /// Store backend failed (connection refused, protocol error, ...)
    #[error("Backend error: {0}")]
    Backend(String),

    /// Store did not answer within the allotted time
    #[error("Cache operation timed out after {0:?}")]
    Timeout(Duration),

    /// Store is at capacity and cannot accept new entries
    #[error("Cache capacity exceeded")]
    CapacityExceeded,

    /// Value could not be encoded for storage
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stored value could not be decoded
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Invalid store configuration
    #[error("Invalid cache configuration: {0}")]
    InvalidConfiguration(String),

    /// Scan pattern could not be interpreted
    #[error("Invalid scan pattern: {0}")]
    InvalidPattern(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Self::Deserialization(err.to_string())
        } else {
            Self::Serialization(err.to_string())
        }
    }
}

/// Result type alias for cache operations
pub type CacheResult<T> = Result<T, CacheError>;
