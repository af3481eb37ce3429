//! Per-category freshness cache
//!
//! This module keeps recently fetched entities (projects, sessions,
//! messages) with a time-to-live per entry, access bookkeeping, and
//! write-through persistence under a single namespace key.
//!
//! Staleness is evaluated lazily: nothing is ever dropped because it is
//! old, callers ask [`FreshnessCache::is_stale`] and decide whether to
//! refetch. Entries leave the cache only through [`FreshnessCache::remove`],
//! [`FreshnessCache::evict_stale`] or [`FreshnessCache::reset`].

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

use crate::clock::{elapsed_between, system_clock, truncate_duration_to_millis, SharedClock};
use crate::kv::KeyValueStore;
use crate::persistence::PersistedRecord;

/// Default storage key for the cache document
pub const CACHE_STORAGE_KEY: &str = "cache-storage";

/// TTL used for a category with no entry in the TTL table
pub const FALLBACK_TTL: Duration = Duration::from_secs(60);

/// Cache error types
#[derive(Debug, Error)]
pub enum CacheError {
    /// Payload could not be converted to or from JSON
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Entity category; decides the default TTL of its entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheCategory {
    /// Projects (low churn)
    Projects,
    /// Sessions (moderate churn)
    Sessions,
    /// Messages (high churn, conversational data)
    Messages,
}

impl CacheCategory {
    /// Every category, in persisted order
    pub const ALL: [CacheCategory; 3] =
        [CacheCategory::Projects, CacheCategory::Sessions, CacheCategory::Messages];

    /// Name used in the persisted document and in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheCategory::Projects => "projects",
            CacheCategory::Sessions => "sessions",
            CacheCategory::Messages => "messages",
        }
    }

    /// Built-in TTL for this category
    pub fn default_ttl(&self) -> Duration {
        match self {
            CacheCategory::Projects => Duration::from_secs(5 * 60),
            CacheCategory::Sessions => Duration::from_secs(2 * 60),
            CacheCategory::Messages => Duration::from_secs(30),
        }
    }
}

impl fmt::Display for CacheCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "projects" => Ok(CacheCategory::Projects),
            "sessions" => Ok(CacheCategory::Sessions),
            "messages" => Ok(CacheCategory::Messages),
            other => Err(format!("unknown cache category: {}", other)),
        }
    }
}

/// TTLs persist as whole milliseconds
mod ttl_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(ttl: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// One cached snapshot plus its freshness bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Cached payload
    pub data: Value,
    /// When this entry was written
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// Time-to-live fixed at write time
    #[serde(with = "ttl_millis")]
    pub ttl: Duration,
    /// Most recent successful refresh
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_sync_at: DateTime<Utc>,
    /// Reads since the last write, counting the write itself
    pub access_count: u32,
    /// Most recent read
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_accessed: DateTime<Utc>,
}

impl CacheEntry {
    fn new(data: Value, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            data,
            timestamp: now,
            ttl,
            last_sync_at: now,
            access_count: 1,
            last_accessed: now,
        }
    }

    /// Stale once strictly more than `ttl` has passed since the write
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        elapsed_between(self.timestamp, now) > self.ttl
    }

    /// Time since the entry was written
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        elapsed_between(self.timestamp, now)
    }

    /// Remaining fresh time, zero once stale
    pub fn time_until_stale_at(&self, now: DateTime<Utc>) -> Duration {
        self.ttl.saturating_sub(self.age_at(now))
    }

    /// Decode the payload into a concrete type
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(&self.data)?)
    }
}

/// Entries of one category, keyed by entity id
pub type CategoryMap = HashMap<String, CacheEntry>;

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Storage key that holds the cache document
    pub storage_key: String,
    /// Default TTL per category
    pub ttls: HashMap<CacheCategory, Duration>,
    /// TTL for categories missing from `ttls`
    pub fallback_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            storage_key: CACHE_STORAGE_KEY.to_string(),
            ttls: CacheCategory::ALL
                .iter()
                .map(|category| (*category, category.default_ttl()))
                .collect(),
            fallback_ttl: FALLBACK_TTL,
        }
    }
}

impl CacheConfig {
    /// Create a new cache configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the storage key
    pub fn storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    /// Set the default TTL of a category
    pub fn ttl(mut self, category: CacheCategory, ttl: Duration) -> Self {
        self.ttls.insert(category, ttl);
        self
    }

    /// Remove a category from the TTL table so it uses the fallback
    pub fn clear_ttl(mut self, category: CacheCategory) -> Self {
        self.ttls.remove(&category);
        self
    }

    /// Set the fallback TTL
    pub fn fallback_ttl(mut self, ttl: Duration) -> Self {
        self.fallback_ttl = ttl;
        self
    }

    /// Effective default TTL for a category
    pub fn ttl_for(&self, category: CacheCategory) -> Duration {
        self.ttls.get(&category).copied().unwrap_or(self.fallback_ttl)
    }
}

/// Change notifications published after each persisted mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// An entry was written
    Updated {
        /// Category of the entry
        category: CacheCategory,
        /// Entity key
        key: String,
    },
    /// An entry was removed explicitly
    Removed {
        /// Category of the entry
        category: CacheCategory,
        /// Entity key
        key: String,
    },
    /// Stale entries were swept
    Evicted {
        /// Swept category, `None` for all
        category: Option<CacheCategory>,
        /// Number of entries dropped
        count: usize,
    },
    /// A category (or everything) was cleared
    Reset {
        /// Cleared category, `None` for all
        category: Option<CacheCategory>,
    },
}

/// Per-category counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CategoryStats {
    /// Number of entries
    pub entries: usize,
    /// Entries past their TTL
    pub stale: usize,
    /// Sum of access counts
    pub accesses: u64,
}

/// Point-in-time view of the whole cache
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Project counters
    pub projects: CategoryStats,
    /// Session counters
    pub sessions: CategoryStats,
    /// Message counters
    pub messages: CategoryStats,
}

impl CacheStats {
    /// Counters of one category
    pub fn category(&self, category: CacheCategory) -> CategoryStats {
        match category {
            CacheCategory::Projects => self.projects,
            CacheCategory::Sessions => self.sessions,
            CacheCategory::Messages => self.messages,
        }
    }

    /// Entries across all categories
    pub fn total_entries(&self) -> usize {
        self.projects.entries + self.sessions.entries + self.messages.entries
    }

    /// Stale entries across all categories
    pub fn total_stale(&self) -> usize {
        self.projects.stale + self.sessions.stale + self.messages.stale
    }
}

/// What a mutation did to the cache state
enum Change {
    /// Nothing to persist
    None,
    /// Bookkeeping only; persisted but not announced
    Silent,
    /// Persisted and announced to subscribers
    Announce(CacheEvent),
}

/// In-memory state; each category map is replaced wholesale on write
#[derive(Debug, Clone, Default)]
struct CacheState {
    projects: Arc<CategoryMap>,
    sessions: Arc<CategoryMap>,
    messages: Arc<CategoryMap>,
}

impl CacheState {
    fn slot(&self, category: CacheCategory) -> &Arc<CategoryMap> {
        match category {
            CacheCategory::Projects => &self.projects,
            CacheCategory::Sessions => &self.sessions,
            CacheCategory::Messages => &self.messages,
        }
    }

    fn slot_mut(&mut self, category: CacheCategory) -> &mut Arc<CategoryMap> {
        match category {
            CacheCategory::Projects => &mut self.projects,
            CacheCategory::Sessions => &mut self.sessions,
            CacheCategory::Messages => &mut self.messages,
        }
    }

    fn as_document(&self) -> CacheDocumentRef<'_> {
        CacheDocumentRef {
            projects: &self.projects,
            sessions: &self.sessions,
            messages: &self.messages,
        }
    }
}

#[derive(Serialize)]
struct CacheDocumentRef<'a> {
    projects: &'a CategoryMap,
    sessions: &'a CategoryMap,
    messages: &'a CategoryMap,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CacheDocument {
    projects: CategoryMap,
    sessions: CategoryMap,
    messages: CategoryMap,
}

impl From<CacheDocument> for CacheState {
    fn from(doc: CacheDocument) -> Self {
        Self {
            projects: Arc::new(doc.projects),
            sessions: Arc::new(doc.sessions),
            messages: Arc::new(doc.messages),
        }
    }
}

/// Keyed, typed storage of entity snapshots with per-category TTLs
///
/// Reads are synchronous and never touch storage. Every mutating call
/// (including `get`, which bumps access bookkeeping) persists the whole
/// document before returning; storage failures are logged and the cache
/// keeps working in memory.
///
/// # Example
///
/// ```rust
/// use storage::cache::{CacheCategory, CacheConfig, FreshnessCache};
/// use storage::kv::MemoryStore;
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let cache = FreshnessCache::load(Arc::new(MemoryStore::new()), CacheConfig::default()).await;
///
/// assert!(cache.is_stale(CacheCategory::Projects, "p1"));
/// cache.set(CacheCategory::Projects, "p1", &"alpha", None).await.unwrap();
/// assert!(!cache.is_stale(CacheCategory::Projects, "p1"));
///
/// let name: Option<String> = cache.get(CacheCategory::Projects, "p1").await.unwrap();
/// assert_eq!(name.as_deref(), Some("alpha"));
/// # }
/// ```
pub struct FreshnessCache {
    state: RwLock<CacheState>,
    record: PersistedRecord,
    config: CacheConfig,
    clock: SharedClock,
    write_lock: Mutex<()>,
    events_tx: broadcast::Sender<CacheEvent>,
}

impl FreshnessCache {
    /// Rehydrate the cache from `store` using the system clock
    pub async fn load(store: Arc<dyn KeyValueStore>, config: CacheConfig) -> Self {
        Self::load_with_clock(store, config, system_clock()).await
    }

    /// Rehydrate the cache from `store` with an explicit clock
    pub async fn load_with_clock(
        store: Arc<dyn KeyValueStore>,
        config: CacheConfig,
        clock: SharedClock,
    ) -> Self {
        let record = PersistedRecord::new(store, config.storage_key.clone());
        let document: CacheDocument = record.load_or_default().await;
        let state = CacheState::from(document);
        let (events_tx, _) = broadcast::channel(64);

        tracing::debug!(
            "Loaded cache from {}: {} projects, {} sessions, {} messages",
            record.key(),
            state.projects.len(),
            state.sessions.len(),
            state.messages.len()
        );

        Self {
            state: RwLock::new(state),
            record,
            config,
            clock,
            write_lock: Mutex::new(()),
            events_tx,
        }
    }

    /// Apply a mutation, persist the result, then publish the event
    ///
    /// Unchanged state is neither persisted nor announced.
    async fn commit<R>(
        &self,
        mutate: impl FnOnce(&mut CacheState, DateTime<Utc>) -> (R, Change),
    ) -> R {
        let _guard = self.write_lock.lock().await;
        let now = self.clock.now_millis();

        let (result, change, snapshot) = {
            let mut state = self.state.write();
            let (result, change) = mutate(&mut state, now);
            let snapshot = (!matches!(change, Change::None)).then(|| state.clone());
            (result, change, snapshot)
        };

        if let Some(snapshot) = snapshot {
            self.record.store(&snapshot.as_document()).await;
        }
        if let Change::Announce(event) = change {
            let _ = self.events_tx.send(event);
        }

        result
    }

    /// Store a JSON payload, replacing any previous entry for the key
    ///
    /// The entry's access count restarts at 1: a write opens a new
    /// freshness epoch.
    pub async fn set_value(
        &self,
        category: CacheCategory,
        key: impl Into<String>,
        data: Value,
        ttl_override: Option<Duration>,
    ) {
        let key = key.into();
        let ttl = truncate_duration_to_millis(
            ttl_override.unwrap_or_else(|| self.config.ttl_for(category)),
        );

        tracing::debug!("Caching {}/{} (ttl {:?})", category, key, ttl);

        self.commit(|state, now| {
            let mut map = CategoryMap::clone(state.slot(category));
            map.insert(key.clone(), CacheEntry::new(data, ttl, now));
            *state.slot_mut(category) = Arc::new(map);
            ((), Change::Announce(CacheEvent::Updated { category, key }))
        })
        .await
    }

    /// Store a serializable payload
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        category: CacheCategory,
        key: impl Into<String>,
        data: &T,
        ttl_override: Option<Duration>,
    ) -> Result<()> {
        let value = serde_json::to_value(data)?;
        self.set_value(category, key, value, ttl_override).await;
        Ok(())
    }

    /// Read a payload, stale or not, recording the access
    pub async fn get_value(&self, category: CacheCategory, key: &str) -> Option<Value> {
        self.commit(|state, now| {
            if !state.slot(category).contains_key(key) {
                return (None, Change::None);
            }

            let map = Arc::make_mut(state.slot_mut(category));
            let Some(entry) = map.get_mut(key) else {
                return (None, Change::None);
            };
            entry.access_count = entry.access_count.saturating_add(1);
            entry.last_accessed = now;

            (Some(entry.data.clone()), Change::Silent)
        })
        .await
    }

    /// Read and decode a payload, stale or not, recording the access
    pub async fn get<T: DeserializeOwned>(
        &self,
        category: CacheCategory,
        key: &str,
    ) -> Result<Option<T>> {
        match self.get_value(category, key).await {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Whether the key needs refetching: absent, or older than its TTL
    ///
    /// Depends on the current time, so repeated calls may disagree even
    /// without writes in between.
    pub fn is_stale(&self, category: CacheCategory, key: &str) -> bool {
        let now = self.clock.now();
        self.state
            .read()
            .slot(category)
            .get(key)
            .map(|entry| entry.is_stale_at(now))
            .unwrap_or(true)
    }

    /// Copy of an entry without touching its bookkeeping
    pub fn peek(&self, category: CacheCategory, key: &str) -> Option<CacheEntry> {
        self.state.read().slot(category).get(key).cloned()
    }

    /// Remaining fresh time of an entry
    pub fn time_until_stale(&self, category: CacheCategory, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        self.state
            .read()
            .slot(category)
            .get(key)
            .map(|entry| entry.time_until_stale_at(now))
    }

    /// Remove one entry, returning whether it existed
    pub async fn remove(&self, category: CacheCategory, key: &str) -> bool {
        self.commit(|state, _| {
            if !state.slot(category).contains_key(key) {
                return (false, Change::None);
            }

            let mut map = CategoryMap::clone(state.slot(category));
            map.remove(key);
            *state.slot_mut(category) = Arc::new(map);
            (true, Change::Announce(CacheEvent::Removed { category, key: key.to_string() }))
        })
        .await
    }

    /// Drop every stale entry of one category, or of all of them
    pub async fn evict_stale(&self, category: Option<CacheCategory>) -> usize {
        let targets: Vec<CacheCategory> = match category {
            Some(category) => vec![category],
            None => CacheCategory::ALL.to_vec(),
        };

        let count = self
            .commit(|state, now| {
                let mut count = 0;
                for target in &targets {
                    let before = state.slot(*target).len();
                    let kept: CategoryMap = state
                        .slot(*target)
                        .iter()
                        .filter(|(_, entry)| !entry.is_stale_at(now))
                        .map(|(key, entry)| (key.clone(), entry.clone()))
                        .collect();
                    if kept.len() != before {
                        count += before - kept.len();
                        *state.slot_mut(*target) = Arc::new(kept);
                    }
                }

                let change = if count > 0 {
                    Change::Announce(CacheEvent::Evicted { category, count })
                } else {
                    Change::None
                };
                (count, change)
            })
            .await;

        if count > 0 {
            tracing::debug!("Evicted {} stale cache entries", count);
        }
        count
    }

    /// Clear one category, or every category when `None`
    pub async fn reset(&self, category: Option<CacheCategory>) {
        match category {
            Some(category) => tracing::info!("Resetting {} cache", category),
            None => tracing::info!("Resetting entire cache"),
        }

        self.commit(|state, _| {
            match category {
                Some(category) => *state.slot_mut(category) = Arc::default(),
                None => *state = CacheState::default(),
            }
            ((), Change::Announce(CacheEvent::Reset { category }))
        })
        .await
    }

    /// Immutable view of one category
    ///
    /// Later writes replace the map rather than mutating it, so the view
    /// never changes underneath the caller.
    pub fn snapshot(&self, category: CacheCategory) -> Arc<CategoryMap> {
        Arc::clone(self.state.read().slot(category))
    }

    /// Keys of one category
    pub fn keys(&self, category: CacheCategory) -> Vec<String> {
        let mut keys: Vec<String> = self.state.read().slot(category).keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Total number of entries
    pub fn len(&self) -> usize {
        let state = self.state.read();
        CacheCategory::ALL.iter().map(|c| state.slot(*c).len()).sum()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counters for every category
    pub fn stats(&self) -> CacheStats {
        let now = self.clock.now();
        let state = self.state.read();
        let count = |category: CacheCategory| {
            let map = state.slot(category);
            CategoryStats {
                entries: map.len(),
                stale: map.values().filter(|e| e.is_stale_at(now)).count(),
                accesses: map.values().map(|e| u64::from(e.access_count)).sum(),
            }
        };

        CacheStats {
            projects: count(CacheCategory::Projects),
            sessions: count(CacheCategory::Sessions),
            messages: count(CacheCategory::Messages),
        }
    }

    /// Effective default TTL of a category
    pub fn ttl_for(&self, category: CacheCategory) -> Duration {
        self.config.ttl_for(category)
    }

    /// Active configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Subscribe to cache changes
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events_tx.subscribe()
    }
}
