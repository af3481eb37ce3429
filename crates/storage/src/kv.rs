//! Key-value storage adapters
//!
//! Components persist through the narrow [`KeyValueStore`] capability:
//! raw bytes in, raw bytes out, one namespace key per component. The sled
//! adapter is the on-device store; [`MemoryStore`] backs tests and
//! ephemeral sessions; [`LazyStore`] defers opening until first use.

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use parking_lot::Mutex;
use sled::Db;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;

/// How long an open keeps retrying while another handle holds the lock
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(3);

/// Key-value store error types
#[derive(Debug, Error)]
pub enum KvError {
    /// Sled database error
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Store could not be reached
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl KvError {
    /// Whether the database lock is held by another handle
    ///
    /// Sled releases its file lock asynchronously after the last handle is
    /// dropped, so this is usually transient.
    pub fn is_lock_contention(&self) -> bool {
        let io = match self {
            KvError::Database(sled::Error::Io(e)) | KvError::Io(e) => e,
            _ => return false,
        };
        io.kind() == ErrorKind::WouldBlock || io.to_string().contains("could not acquire lock")
    }
}

/// Result type for key-value operations
pub type Result<T> = std::result::Result<T, KvError>;

/// Byte-oriented storage capability shared by every persisted component
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replace the value stored under `key`
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Delete `key`, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;
}

/// Sled store configuration
#[derive(Debug, Clone)]
pub struct KvConfig {
    /// Database path
    pub path: String,
    /// Cache capacity in bytes
    pub cache_capacity: u64,
    /// Enable compression
    pub use_compression: bool,
    /// Flush to disk before a write returns
    pub flush_on_write: bool,
    /// Retry window for an open blocked on the database lock
    pub open_timeout: Duration,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            path: "tether_kv.db".to_string(),
            cache_capacity: 8 * 1024 * 1024, // 8MB
            use_compression: true,
            flush_on_write: true,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
        }
    }
}

impl KvConfig {
    /// Create a new configuration with a custom path
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into(), ..Default::default() }
    }

    /// Set cache capacity in bytes
    pub fn cache_capacity(mut self, bytes: u64) -> Self {
        self.cache_capacity = bytes;
        self
    }

    /// Enable or disable compression
    pub fn use_compression(mut self, enabled: bool) -> Self {
        self.use_compression = enabled;
        self
    }

    /// Enable or disable flushing on every write
    pub fn flush_on_write(mut self, enabled: bool) -> Self {
        self.flush_on_write = enabled;
        self
    }

    /// Set how long a locked database is retried before giving up
    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }
}

/// Sled-backed store
pub struct SledStore {
    db: Db,
    flush_on_write: bool,
}

impl SledStore {
    /// Open (or create) the database described by `config`
    pub fn new(config: KvConfig) -> Result<Self> {
        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_capacity)
            .use_compression(config.use_compression)
            .open()?;

        Ok(Self { db, flush_on_write: config.flush_on_write })
    }

    /// Create a temporary store that is removed on drop (for testing)
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;

        Ok(Self { db, flush_on_write: false })
    }

    /// Number of keys in the store
    pub fn len(&self) -> usize {
        self.db.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for SledStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key.as_bytes())?.map(|bytes| bytes.to_vec()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.db.insert(key.as_bytes(), value)?;
        if self.flush_on_write {
            self.db.flush_async().await?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let existed = self.db.remove(key.as_bytes())?.is_some();
        if existed && self.flush_on_write {
            self.db.flush_async().await?;
        }
        Ok(existed)
    }
}

/// Process-local store that forgets everything on drop
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys in the store
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.lock().remove(key).is_some())
    }
}

type Opener = Box<dyn Fn() -> Result<Arc<dyn KeyValueStore>> + Send + Sync>;

/// Store handle opened on first access
///
/// A successful open is memoized for the life of the handle; a failed open
/// is not, so the next access tries again. Lock contention is retried with
/// exponential backoff for up to the open timeout before an open fails.
pub struct LazyStore {
    opener: Opener,
    handle: OnceCell<Arc<dyn KeyValueStore>>,
    open_timeout: Duration,
}

impl LazyStore {
    /// Create a lazy handle around an opener
    pub fn new<F>(opener: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn KeyValueStore>> + Send + Sync + 'static,
    {
        Self {
            opener: Box::new(opener),
            handle: OnceCell::new(),
            open_timeout: DEFAULT_OPEN_TIMEOUT,
        }
    }

    /// Lazily open a sled database
    pub fn sled(config: KvConfig) -> Self {
        let open_timeout = config.open_timeout;
        Self::new(move || {
            let store = SledStore::new(config.clone())?;
            Ok(Arc::new(store) as Arc<dyn KeyValueStore>)
        })
        .with_open_timeout(open_timeout)
    }

    /// Set how long lock contention is retried per open attempt
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Get the underlying store, opening it if needed
    pub async fn handle(&self) -> Result<Arc<dyn KeyValueStore>> {
        let store = self.handle.get_or_try_init(|| self.open()).await?;
        Ok(Arc::clone(store))
    }

    async fn open(&self) -> Result<Arc<dyn KeyValueStore>> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(10))
            .with_max_interval(Duration::from_millis(250))
            .with_max_elapsed_time(Some(self.open_timeout))
            .build();

        backoff::future::retry(policy, || async move {
            (self.opener)().map_err(|e| {
                if e.is_lock_contention() {
                    tracing::debug!("Key-value store is locked, retrying: {}", e);
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await
        .inspect_err(|e| tracing::warn!("Failed to open key-value store: {}", e))
    }

    /// Whether the store has been opened successfully
    pub fn is_open(&self) -> bool {
        self.handle.initialized()
    }
}

#[async_trait]
impl KeyValueStore for LazyStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.handle().await?.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.handle().await?.set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.handle().await?.delete(key).await
    }
}
