//! Cache store contract
//!
//! The coordinator consumes a network-backed key-value store through this
//! trait. Every method may fail or time out on its own; callers are expected
//! to absorb those failures rather than surface them.

use crate::error::CacheResult;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Remaining lifetime of a stored key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key does not exist (or has expired)
    Missing,
    /// Key exists without an expiry
    Persistent,
    Expires(Duration),
}

impl KeyTtl {
    /// Redis convention: `-2` missing, `-1` no expiry, otherwise whole seconds left.
    pub fn as_seconds(&self) -> i64 {
        match self {
            Self::Missing => -2,
            Self::Persistent => -1,
            Self::Expires(remaining) => remaining.as_secs() as i64,
        }
    }

    pub fn exists(&self) -> bool {
        !matches!(self, Self::Missing)
    }
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Returns None for missing or expired keys.
    async fn get(&self, key: &str) -> CacheResult<Option<Bytes>>;

    /// Returns true when the value was stored.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> CacheResult<bool>;

    /// Returns true if the key was present and removed.
    async fn del(&self, key: &str) -> CacheResult<bool>;

    async fn ttl(&self, key: &str) -> CacheResult<KeyTtl>;

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        Ok(self.ttl(key).await?.exists())
    }

    /// Keys matching a Redis-style glob (`*`, `?`).
    async fn scan(&self, pattern: &str) -> CacheResult<Vec<String>>;

    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str {
        "unknown"
    }
}
