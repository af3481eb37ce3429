//! Storage layer for Tether
//!
//! This crate provides the key-value persistence adapters, the
//! namespaced persisted-record helper, and the per-category
//! freshness cache.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod clock;
pub mod kv;
pub mod persistence;

pub use cache::{
    CacheCategory, CacheConfig, CacheEntry, CacheError, CacheEvent, CacheStats, CategoryStats,
    FreshnessCache,
};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use kv::{KeyValueStore, KvConfig, KvError, LazyStore, MemoryStore, SledStore};
pub use persistence::{PersistedRecord, PersistenceError};
