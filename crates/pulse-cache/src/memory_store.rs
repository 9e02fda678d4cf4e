//! In-process cache store
//!
//! A [`CacheStore`] backed by a `DashMap`, used for single-node deployments
//! and in tests. Expiry is evaluated lazily on read and swept periodically by
//! an optional background task. Capacity is a hard bound: once full (after
//! purging expired entries) new keys are rejected and the caller carries on
//! without caching, the same as it would with an unreachable network store.

use crate::{
    clock::{SharedClock, SystemClock},
    error::{CacheError, CacheResult},
    key::glob_match,
    stats::{AtomicStoreMetrics, StoreStats},
    traits::{CacheStore, KeyTtl},
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::{task::JoinHandle, time::interval};

/// Memory store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStoreConfig {
    /// Maximum number of live entries
    pub max_entries: usize,
    /// Interval of the background expiry sweep (zero disables it)
    pub cleanup_interval: Duration,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            max_entries: 50_000,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl MemoryStoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn with_cleanup_interval(mut self, cleanup_interval: Duration) -> Self {
        self.cleanup_interval = cleanup_interval;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_entries == 0 {
            return Err("max_entries must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Bytes,
    expires_at: Option<SystemTime>,
}

impl StoredValue {
    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|expires| now >= expires)
    }
}

/// DashMap-backed cache store
pub struct MemoryStore {
    storage: Arc<DashMap<String, StoredValue>>,
    config: MemoryStoreConfig,
    clock: SharedClock,
    metrics: Arc<AtomicStoreMetrics>,
    cleanup_handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.storage.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    pub fn new(config: MemoryStoreConfig) -> CacheResult<Self> {
        Self::with_clock(config, SystemClock::shared())
    }

    pub fn with_clock(config: MemoryStoreConfig, clock: SharedClock) -> CacheResult<Self> {
        config
            .validate()
            .map_err(CacheError::InvalidConfiguration)?;

        Ok(Self {
            storage: Arc::new(DashMap::with_capacity(config.max_entries.min(1024))),
            config,
            clock,
            metrics: Arc::new(AtomicStoreMetrics::new()),
            cleanup_handle: None,
        })
    }

    /// Create the store and start the background expiry sweep.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new_with_cleanup(config: MemoryStoreConfig, clock: SharedClock) -> CacheResult<Self> {
        let cleanup_interval = config.cleanup_interval;
        let mut store = Self::with_clock(config, clock)?;
        if cleanup_interval > Duration::ZERO {
            store.start_cleanup_task(cleanup_interval);
        }
        Ok(store)
    }

    fn start_cleanup_task(&mut self, cleanup_interval: Duration) {
        let storage = Arc::clone(&self.storage);
        let metrics = Arc::clone(&self.metrics);
        let clock = Arc::clone(&self.clock);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(cleanup_interval);
            loop {
                ticker.tick().await;
                let removed = purge_expired(&storage, clock.now());
                if removed > 0 {
                    metrics.record_expirations(removed);
                    tracing::debug!(removed, "Swept expired cache entries");
                }
            }
        });

        self.cleanup_handle = Some(handle);
    }

    /// Remove every expired entry now; returns how many were dropped.
    pub fn purge_expired(&self) -> u64 {
        let removed = purge_expired(&self.storage, self.clock.now());
        self.metrics.record_expirations(removed);
        removed
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn stats(&self) -> StoreStats {
        self.metrics.snapshot(self.storage.len() as u64)
    }

    pub fn clear(&self) {
        self.storage.clear();
    }

    fn has_room_for(&self, key: &str) -> bool {
        if self.storage.contains_key(key) || self.storage.len() < self.config.max_entries {
            return true;
        }
        let removed = purge_expired(&self.storage, self.clock.now());
        self.metrics.record_expirations(removed);
        self.storage.len() < self.config.max_entries
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Some(handle) = self.cleanup_handle.take() {
            handle.abort();
        }
    }
}

fn purge_expired(storage: &DashMap<String, StoredValue>, now: SystemTime) -> u64 {
    let before = storage.len();
    storage.retain(|_, stored| !stored.is_expired(now));
    before.saturating_sub(storage.len()) as u64
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Bytes>> {
        let now = self.clock.now();
        // Release the shard guard before any removal on the same shard
        let lookup = self
            .storage
            .get(key)
            .map(|stored| (stored.is_expired(now), stored.value.clone()));
        let found = match lookup {
            Some((false, value)) => Some(value),
            Some((true, _)) => {
                self.storage.remove_if(key, |_, stored| stored.is_expired(now));
                self.metrics.record_expirations(1);
                None
            }
            None => None,
        };
        self.metrics.record_get(found.is_some());
        Ok(found)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> CacheResult<bool> {
        if !self.has_room_for(key) {
            self.metrics.record_set(false);
            return Err(CacheError::CapacityExceeded);
        }

        let expires_at = (!ttl.is_zero()).then(|| self.clock.now() + ttl);
        self.storage
            .insert(key.to_string(), StoredValue { value, expires_at });
        self.metrics.record_set(true);
        Ok(true)
    }

    async fn del(&self, key: &str) -> CacheResult<bool> {
        let removed = self.storage.remove(key).is_some();
        if removed {
            self.metrics.record_delete();
        }
        Ok(removed)
    }

    async fn ttl(&self, key: &str) -> CacheResult<KeyTtl> {
        let now = self.clock.now();
        Ok(match self.storage.get(key) {
            None => KeyTtl::Missing,
            Some(stored) => match stored.expires_at {
                None => KeyTtl::Persistent,
                Some(expires) => match expires.duration_since(now) {
                    Ok(remaining) if !remaining.is_zero() => KeyTtl::Expires(remaining),
                    _ => KeyTtl::Missing,
                },
            },
        })
    }

    async fn scan(&self, pattern: &str) -> CacheResult<Vec<String>> {
        if pattern.is_empty() {
            return Err(CacheError::InvalidPattern("empty pattern".to_string()));
        }
        self.metrics.record_scan();
        let now = self.clock.now();
        let mut keys: Vec<String> = self
            .storage
            .iter()
            .filter(|entry| !entry.value().is_expired(now) && glob_match(pattern, entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
