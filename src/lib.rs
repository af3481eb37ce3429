//! Tether: offline-aware local state
//!
//! Wires one [`ConnectivityTracker`] and one [`FreshnessCache`] over a single
//! shared key-value store, and answers the question every screen asks
//! before hitting the network: is this data worth refetching right now?
//!
//! # Example
//!
//! ```rust
//! use tether::{CacheCategory, NetworkObservation, Tether, TetherConfig};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let tether = Tether::open(TetherConfig::in_memory()).await;
//!
//! assert!(tether.should_refetch(CacheCategory::Projects, "p1"));
//!
//! tether.tracker().update_network_state(NetworkObservation::offline()).await;
//! assert!(!tether.should_refetch(CacheCategory::Projects, "p1"));
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

pub use networking::{
    ChannelSource, ConnectionType, ConnectivityConfig, ConnectivitySource, ConnectivityState,
    ConnectivityTracker, MonitorHandle, NetworkObservation,
};
pub use storage::{
    CacheCategory, CacheConfig, CacheEntry, CacheEvent, CacheStats, FreshnessCache, KeyValueStore,
    KvConfig, LazyStore, MemoryStore,
};

/// Environment variable read by [`init_tracing`]
pub const LOG_ENV: &str = "TETHER_LOG";

/// Application configuration
#[derive(Debug, Clone)]
pub struct TetherConfig {
    /// Directory holding the on-device database
    pub data_dir: PathBuf,
    /// Sled store settings; `path` is derived from `data_dir`
    pub kv: KvConfig,
    /// Freshness cache settings
    pub cache: CacheConfig,
    /// Connectivity tracker settings
    pub connectivity: ConnectivityConfig,
    /// Keep everything in memory (tests, ephemeral sessions)
    pub use_memory_store: bool,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("tether_data"),
            kv: KvConfig::default(),
            cache: CacheConfig::default(),
            connectivity: ConnectivityConfig::default(),
            use_memory_store: false,
        }
    }
}

impl TetherConfig {
    /// Create a configuration rooted at `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into(), ..Default::default() }
    }

    /// Configuration that never touches disk
    pub fn in_memory() -> Self {
        Self { use_memory_store: true, ..Default::default() }
    }

    /// Set sled store settings
    pub fn kv(mut self, kv: KvConfig) -> Self {
        self.kv = kv;
        self
    }

    /// Set freshness cache settings
    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Set connectivity tracker settings
    pub fn connectivity(mut self, connectivity: ConnectivityConfig) -> Self {
        self.connectivity = connectivity;
        self
    }

    /// Toggle the in-memory store
    pub fn use_memory_store(mut self, enabled: bool) -> Self {
        self.use_memory_store = enabled;
        self
    }

    fn kv_config(&self) -> KvConfig {
        let path = self.data_dir.join("tether.db");
        KvConfig { path: path.to_string_lossy().into_owned(), ..self.kv.clone() }
    }
}

/// Process-wide owner of the connectivity tracker and the freshness cache
pub struct Tether {
    tracker: Arc<ConnectivityTracker>,
    cache: Arc<FreshnessCache>,
    backing: Backing,
}

enum Backing {
    Memory,
    Disk(Arc<LazyStore>),
    External,
}

impl Tether {
    /// Open the shared store and rehydrate both components
    ///
    /// Never fails. A database still locked by a previous handle is waited
    /// for; if it cannot be opened at all, both components start from
    /// defaults and keep working in memory while every later write retries
    /// the open.
    pub async fn open(config: TetherConfig) -> Self {
        if config.use_memory_store {
            let store = Arc::new(MemoryStore::new());
            return Self::with_store(store, config, Backing::Memory).await;
        }

        if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
            tracing::warn!(
                "Cannot create data directory {}: {}",
                config.data_dir.display(),
                e
            );
        }

        let lazy = Arc::new(LazyStore::sled(config.kv_config()));
        if let Err(e) = lazy.handle().await {
            tracing::warn!("Running in memory until the store opens: {}", e);
        }

        let store: Arc<dyn KeyValueStore> = Arc::clone(&lazy) as Arc<dyn KeyValueStore>;
        Self::with_store(store, config, Backing::Disk(lazy)).await
    }

    /// Rehydrate both components from a caller-provided store
    pub async fn open_with_store(store: Arc<dyn KeyValueStore>, config: TetherConfig) -> Self {
        Self::with_store(store, config, Backing::External).await
    }

    async fn with_store(store: Arc<dyn KeyValueStore>, config: TetherConfig, backing: Backing) -> Self {
        let tracker = ConnectivityTracker::load(Arc::clone(&store), config.connectivity).await;
        let cache = FreshnessCache::load(store, config.cache).await;

        Self { tracker: Arc::new(tracker), cache: Arc::new(cache), backing }
    }

    /// The connectivity tracker
    pub fn tracker(&self) -> &Arc<ConnectivityTracker> {
        &self.tracker
    }

    /// The freshness cache
    pub fn cache(&self) -> &Arc<FreshnessCache> {
        &self.cache
    }

    /// Whether state currently reaches durable storage
    pub fn is_persistent(&self) -> bool {
        match &self.backing {
            Backing::Memory => false,
            Backing::Disk(lazy) => lazy.is_open(),
            Backing::External => true,
        }
    }

    /// Whether to hit the network for this entry now
    ///
    /// Stale data is still served while offline; only a stale entry on a
    /// usable connection is worth refetching.
    pub fn should_refetch(&self, category: CacheCategory, key: &str) -> bool {
        self.cache.is_stale(category, key) && !self.tracker.is_offline()
    }
}

/// Install a `tracing` subscriber filtered by `TETHER_LOG`
///
/// Falls back to `default_filter` when the variable is unset or invalid.
/// Returns false if a global subscriber was already installed.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_in_memory_open() {
        let tether = Tether::open(TetherConfig::in_memory()).await;

        assert!(!tether.is_persistent());
        assert!(!tether.tracker().is_offline());
        assert!(tether.cache().is_empty());
    }

    #[tokio::test]
    async fn test_should_refetch() {
        let tether = Tether::open(TetherConfig::in_memory()).await;
        let cache = tether.cache();

        assert!(tether.should_refetch(CacheCategory::Sessions, "s1"));

        cache
            .set(CacheCategory::Sessions, "s1", &"payload", None)
            .await
            .unwrap();
        assert!(!tether.should_refetch(CacheCategory::Sessions, "s1"));

        cache
            .set(CacheCategory::Sessions, "s2", &"payload", Some(Duration::ZERO))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(tether.should_refetch(CacheCategory::Sessions, "s2"));

        tether.tracker().update_network_state(NetworkObservation::offline()).await;
        assert!(!tether.should_refetch(CacheCategory::Sessions, "s2"));
    }

    #[tokio::test]
    async fn test_components_share_store() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let tether = Tether::open_with_store(Arc::clone(&store), TetherConfig::default()).await;

        tether.tracker().update_network_state(NetworkObservation::offline()).await;
        tether.cache().set(CacheCategory::Projects, "p1", &1, None).await.unwrap();

        assert!(store.get("network-storage").await.unwrap().is_some());
        assert!(store.get("cache-storage").await.unwrap().is_some());
    }

    #[test]
    fn test_config_builder() {
        let config = TetherConfig::new("/tmp/tether")
            .cache(CacheConfig::new().ttl(CacheCategory::Messages, Duration::from_secs(5)))
            .use_memory_store(true);

        assert!(config.use_memory_store);
        assert_eq!(config.cache.ttl_for(CacheCategory::Messages), Duration::from_secs(5));
        assert!(config.kv_config().path.ends_with("tether.db"));
    }

    #[test]
    fn test_init_tracing_twice() {
        init_tracing("debug");
        assert!(!init_tracing("debug"));
    }
}
