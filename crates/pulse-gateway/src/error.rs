//! Error types for the gateway.

use pulse_cache::CacheError;
use thiserror::Error;

/// Server setup and runtime errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind the HTTP listener
    #[error("Failed to bind HTTP server to {addr}: {source}")]
    HttpBindFailed {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Invalid gateway configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid coordinator configuration
    #[error("Coordinator configuration error: {0}")]
    Coordinator(#[from] pulse_coordinator::ConfigError),

    /// The cache store could not be created
    #[error("Cache store error: {0}")]
    Cache(#[from] CacheError),

    /// The upstream HTTP client could not be created
    #[error("Upstream client error: {0}")]
    UpstreamClient(#[from] reqwest::Error),

    #[error("Server shutdown error: {0}")]
    Shutdown(String),
}

/// Failures of the HTTP upstream adapter.
///
/// The messages are what the coordinator classifies, so they keep the status
/// line and any `retry-after` hint.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("HTTP {status}: {body}{}", retry_hint(.retry_after.as_deref()))]
    Status {
        status: reqwest::StatusCode,
        body: String,
        retry_after: Option<String>,
    },

    #[error("upstream request timed out: {0}")]
    Timeout(#[source] reqwest::Error),

    #[error("upstream connection failed: {0}")]
    Connect(#[source] reqwest::Error),

    #[error("upstream network error: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("invalid upstream response body: {0}")]
    Body(#[source] reqwest::Error),
}

fn retry_hint(retry_after: Option<&str>) -> String {
    retry_after.map(|r| format!(" (retry-after: {r})")).unwrap_or_default()
}

impl UpstreamError {
    pub(crate) fn from_send(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err)
        } else if err.is_connect() {
            Self::Connect(err)
        } else {
            Self::Transport(err)
        }
    }
}
