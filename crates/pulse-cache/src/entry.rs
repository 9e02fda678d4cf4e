//! Cached query results
//!
//! The store only ever sees an opaque blob. The blob is a JSON-encoded
//! [`CacheEntry`] carrying the payload plus enough metadata to judge
//! freshness on read, independently of whatever TTL the store enforces.

use crate::error::CacheResult;
use crate::key::RequestKey;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Where a cached payload originally came from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub data_type: String,
    pub target_id: String,
    /// Upstream latency of the fetch that produced the payload
    pub fetch_millis: u64,
    /// True when the entry was written by the background warmer
    #[serde(default)]
    pub warmed: bool,
}

/// One cached query result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: RequestKey,
    pub payload: Value,
    /// Milliseconds since the Unix epoch
    pub cached_at: u64,
    pub ttl_seconds: u64,
    #[serde(default)]
    pub source_metadata: SourceMetadata,
}

impl CacheEntry {
    pub fn new(
        key: RequestKey,
        payload: Value,
        cached_at: SystemTime,
        ttl: Duration,
        source_metadata: SourceMetadata,
    ) -> Self {
        Self {
            key,
            payload,
            cached_at: cached_at
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            ttl_seconds: ttl.as_secs(),
            source_metadata,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn expires_at(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.cached_at) + self.ttl()
    }

    /// Fresh strictly before `cached_at + ttl`.
    pub fn is_fresh(&self, now: SystemTime) -> bool {
        now < self.expires_at()
    }

    /// Zero once expired.
    pub fn remaining_ttl(&self, now: SystemTime) -> Duration {
        self.expires_at()
            .duration_since(now)
            .unwrap_or(Duration::ZERO)
    }

    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(UNIX_EPOCH + Duration::from_millis(self.cached_at))
            .unwrap_or_default()
    }

    pub fn to_bytes(&self) -> CacheResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_bytes(raw: &[u8]) -> CacheResult<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}
