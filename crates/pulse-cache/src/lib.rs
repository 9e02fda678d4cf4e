//! Cache primitives for the pulse request coordination layer
//!
//! This crate holds the pieces of the cache path that do not depend on the
//! coordinator itself:
//!
//! - [`RequestKey`]: deterministic key for one logical analytics query
//! - [`CacheEntry`]: the JSON blob written to the store, with freshness metadata
//! - [`CacheStore`]: async contract for the external key-value store
//! - [`MemoryStore`]: in-process store implementing the contract
//! - [`Clock`]: injectable wall clock shared by every time-aware component
//!
//! # Example
//!
//! ```rust
//! use pulse_cache::{CacheStore, MemoryStore, MemoryStoreConfig, QueryOptions, RequestKey};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryStore::new(MemoryStoreConfig::default())?;
//! let options = QueryOptions::new().with_dimension("country").with_limit(10);
//! let key = RequestKey::new("sessions", "property-42", &options);
//!
//! store.set(key.as_str(), bytes::Bytes::from("{}"), Duration::from_secs(60)).await?;
//! assert!(store.exists(key.as_str()).await?);
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod entry;
pub mod error;
pub mod key;
pub mod memory_store;
pub mod stats;
pub mod traits;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use entry::{CacheEntry, SourceMetadata};
pub use error::{CacheError, CacheResult};
pub use key::{DateRange, QueryOptions, RequestKey, glob_match};
pub use memory_store::{MemoryStore, MemoryStoreConfig};
pub use stats::{AtomicStoreMetrics, StoreStats};
pub use traits::{CacheStore, KeyTtl};
