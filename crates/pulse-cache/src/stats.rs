//! Store statistics
//!
//! Lock-free counters updated on every store operation, plus a plain
//! snapshot type for reporting.

#![allow(clippy::cast_precision_loss)] // Ratios intentionally accept precision loss

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub get_count: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub set_count: u64,
    pub delete_count: u64,
    pub scan_count: u64,
    pub expiration_count: u64,
    pub rejected_count: u64,
    pub entry_count: u64,
}

impl StoreStats {
    /// Hit rate in `[0, 1]`; zero when nothing has been read.
    pub fn hit_rate(&self) -> f64 {
        if self.get_count == 0 {
            0.0
        } else {
            self.hit_count as f64 / self.get_count as f64
        }
    }
}

/// Atomic counters shared by store implementations
#[derive(Debug, Default)]
pub struct AtomicStoreMetrics {
    get_count: AtomicU64,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
    set_count: AtomicU64,
    delete_count: AtomicU64,
    scan_count: AtomicU64,
    expiration_count: AtomicU64,
    rejected_count: AtomicU64,
}

impl AtomicStoreMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_get(&self, hit: bool) {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.miss_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_set(&self, stored: bool) {
        if stored {
            self.set_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_delete(&self) {
        self.delete_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_scan(&self) {
        self.scan_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_expirations(&self, count: u64) {
        self.expiration_count.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self, entry_count: u64) -> StoreStats {
        StoreStats {
            get_count: self.get_count.load(Ordering::Relaxed),
            hit_count: self.hit_count.load(Ordering::Relaxed),
            miss_count: self.miss_count.load(Ordering::Relaxed),
            set_count: self.set_count.load(Ordering::Relaxed),
            delete_count: self.delete_count.load(Ordering::Relaxed),
            scan_count: self.scan_count.load(Ordering::Relaxed),
            expiration_count: self.expiration_count.load(Ordering::Relaxed),
            rejected_count: self.rejected_count.load(Ordering::Relaxed),
            entry_count,
        }
    }
}
