//! Data persistence layer
//!
//! A [`PersistedRecord`] owns exactly one namespace key in a shared
//! [`KeyValueStore`] and stores a single JSON document under it. Each
//! component gets its own record and never touches another's key.
//!
//! Two flavours of every operation exist: the checked ones return a
//! [`PersistenceError`], the lenient ones (`load_or_default`, `store`)
//! log the failure and carry on, which is what the background-facing
//! components use.

use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::kv::{KeyValueStore, KvError};

/// Persistence error types
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Underlying store failed to open, read or write
    #[error("Storage unavailable: {0}")]
    Storage(#[from] KvError),

    /// Stored document does not match the expected shape
    #[error("Malformed persisted state under {key}: {source}")]
    Malformed {
        /// Namespace key that held the document
        key: String,
        /// Decoding failure
        #[source]
        source: serde_json::Error,
    },

    /// Value could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for persistence operations
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// One JSON document under one fixed key
#[derive(Clone)]
pub struct PersistedRecord {
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl PersistedRecord {
    /// Bind a record to `key` in `store`
    pub fn new(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self { store, key: key.into() }
    }

    /// The namespace key this record owns
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Load the document, `None` if nothing has been stored yet
    pub async fn load<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        let Some(bytes) = self.store.get(&self.key).await? else {
            return Ok(None);
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| PersistenceError::Malformed { key: self.key.clone(), source })
    }

    /// Load the document, falling back to the default on any failure
    pub async fn load_or_default<T: DeserializeOwned + Default>(&self) -> T {
        match self.load().await {
            Ok(Some(value)) => value,
            Ok(None) => {
                tracing::debug!("No persisted state under {}, starting fresh", self.key);
                T::default()
            }
            Err(e) => {
                tracing::warn!("Discarding persisted state under {}: {}", self.key, e);
                T::default()
            }
        }
    }

    /// Replace the document
    pub async fn save<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.store.set(&self.key, bytes).await?;
        Ok(())
    }

    /// Replace the document, logging and dropping any failure
    ///
    /// Returns whether the write landed.
    pub async fn store<T: Serialize + ?Sized>(&self, value: &T) -> bool {
        match self.save(value).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to persist state under {}: {}", self.key, e);
                false
            }
        }
    }

    /// Remove the document
    pub async fn clear(&self) -> Result<bool> {
        Ok(self.store.delete(&self.key).await?)
    }
}

impl std::fmt::Debug for PersistedRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistedRecord").field("key", &self.key).finish()
    }
}
