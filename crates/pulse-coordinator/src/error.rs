//! Error taxonomy for coordinated upstream requests
//!
//! Raw upstream failures are opaque. They are mapped exactly once, by
//! [`crate::classify::classify`], into a [`ClassifiedError`] carrying one
//! [`ErrorKind`] from a fixed set. Everything downstream of that point only
//! sees the typed taxonomy.

use pulse_cache::RequestKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Boxed raw error returned by upstream adapters
pub type RawError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Fixed error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    Validation,
    Config,
    /// Cache failures are absorbed locally and never retried
    Cache,
    Quota,
    RateLimit,
    Network,
    Timeout,
    Generic,
}

impl ErrorKind {
    pub const ALL: [Self; 9] = [
        Self::Auth,
        Self::Validation,
        Self::Config,
        Self::Cache,
        Self::Quota,
        Self::RateLimit,
        Self::Network,
        Self::Timeout,
        Self::Generic,
    ];

    /// Static retryability default for the kind.
    pub const fn default_retryable(self) -> bool {
        match self {
            Self::Auth | Self::Validation | Self::Config | Self::Cache => false,
            Self::Quota | Self::RateLimit | Self::Network | Self::Timeout | Self::Generic => true,
        }
    }

    /// Stable machine-readable code exposed to callers.
    pub const fn code(self) -> &'static str {
        match self {
            Self::Auth => "AUTH_ERROR",
            Self::Validation => "VALIDATION_ERROR",
            Self::Config => "CONFIG_ERROR",
            Self::Cache => "CACHE_ERROR",
            Self::Quota => "QUOTA_EXCEEDED",
            Self::RateLimit => "RATE_LIMITED",
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Generic => "UPSTREAM_ERROR",
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Validation => "validation",
            Self::Config => "config",
            Self::Cache => "cache",
            Self::Quota => "quota",
            Self::RateLimit => "rate_limit",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Generic => "generic",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One classified upstream failure. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct ClassifiedError {
    kind: ErrorKind,
    message: String,
    retryable: bool,
    retry_after: Option<Duration>,
    original_cause: Option<String>,
}

impl ClassifiedError {
    /// New error with the kind's default retryability.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.default_retryable(),
            retry_after: None,
            original_cause: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.original_cause = Some(cause.into());
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let err = Self::new(ErrorKind::RateLimit, message);
        match retry_after {
            Some(wait) => err.with_retry_after(wait),
            None => err,
        }
    }

    pub fn quota_exceeded(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let err = Self::new(ErrorKind::Quota, message);
        match retry_after {
            Some(wait) => err.with_retry_after(wait),
            None => err,
        }
    }

    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub const fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn original_cause(&self) -> Option<&str> {
        self.original_cause.as_deref()
    }

    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }
}

/// Errors returned by the request coordinator
#[derive(Debug, Clone, Error)]
pub enum CoordinatorError {
    /// The upstream fetch failed after classification and retries
    #[error(transparent)]
    Upstream(#[from] ClassifiedError),

    /// A waiter gave up before the in-flight request settled
    #[error("Timed out after {waited:?} waiting for in-flight request {key}")]
    WaitTimeout { key: RequestKey, waited: Duration },

    /// Too many callers already queued behind the in-flight request
    #[error("Too many callers ({limit}) queued on in-flight request {key}")]
    QueueFull { key: RequestKey, limit: usize },

    /// The caller driving the in-flight request went away before it settled
    #[error("In-flight request {key} was abandoned before completing")]
    Abandoned { key: RequestKey },
}

impl CoordinatorError {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Upstream(err) => err.code(),
            Self::WaitTimeout { .. } => "DEDUP_WAIT_TIMEOUT",
            Self::QueueFull { .. } => "DEDUP_QUEUE_FULL",
            Self::Abandoned { .. } => "DEDUP_ABANDONED",
        }
    }

    /// Only upstream errors carry retryability; queue conditions never retry automatically
    /// but a client may re-issue once the in-flight request has settled.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Upstream(err) => err.is_retryable(),
            Self::WaitTimeout { .. } | Self::QueueFull { .. } | Self::Abandoned { .. } => true,
        }
    }

    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Upstream(err) => err.retry_after(),
            _ => None,
        }
    }

    pub const fn upstream_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Upstream(err) => Some(err.kind()),
            _ => None,
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Unknown quota type: {0}")]
    UnknownQuota(String),

    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_cache::QueryOptions;

    #[test]
    fn test_default_retryability() {
        let retryable: Vec<ErrorKind> = ErrorKind::ALL
            .into_iter()
            .filter(|k| k.default_retryable())
            .collect();
        assert_eq!(
            retryable,
            vec![
                ErrorKind::Quota,
                ErrorKind::RateLimit,
                ErrorKind::Network,
                ErrorKind::Timeout,
                ErrorKind::Generic
            ]
        );
    }

    #[test]
    fn test_classified_error_builders() {
        let err = ClassifiedError::quota_exceeded("daily quota", Some(Duration::from_secs(30)))
            .with_cause("RESOURCE_EXHAUSTED");
        assert_eq!(err.kind(), ErrorKind::Quota);
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(err.original_cause(), Some("RESOURCE_EXHAUSTED"));
        assert_eq!(err.code(), "QUOTA_EXCEEDED");
        assert_eq!(err.to_string(), "quota error: daily quota");
    }

    #[test]
    fn test_coordinator_error_codes() {
        let key = RequestKey::new("sessions", "p", &QueryOptions::default());
        let err = CoordinatorError::QueueFull {
            key: key.clone(),
            limit: 100,
        };
        assert_eq!(err.code(), "DEDUP_QUEUE_FULL");
        assert!(err.upstream_kind().is_none());
        assert!(err.to_string().contains("100"));

        let err: CoordinatorError = ClassifiedError::validation("bad dimension").into();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(!err.is_retryable());
    }
}
