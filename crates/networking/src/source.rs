//! Platform connectivity sources
//!
//! A [`ConnectivitySource`] is whatever tells us the network changed: the
//! OS reachability API on device, or a [`ChannelSource`] that platform glue
//! (and tests) push observations into.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::connectivity::NetworkObservation;

/// Source error types
#[derive(Debug, Error)]
pub enum SourceError {
    /// The platform API could not be reached
    #[error("Connectivity source unavailable: {0}")]
    Unavailable(String),

    /// Notifying an observer failed
    #[error("Failed to deliver observation: {0}")]
    Delivery(String),

    /// The source was shut down
    #[error("Connectivity source closed")]
    Closed,
}

/// Result type for source operations
pub type Result<T> = std::result::Result<T, SourceError>;

/// Where a source delivers observations
pub type ObservationSink = mpsc::UnboundedSender<NetworkObservation>;

/// Network-change notifications plus a one-shot current-state query
#[async_trait]
pub trait ConnectivitySource: Send + Sync {
    /// Start delivering observations to `sink` until the subscription is dropped
    fn subscribe(&self, sink: ObservationSink) -> Result<SourceSubscription>;

    /// Current connectivity, without waiting for a change
    async fn fetch(&self) -> Result<NetworkObservation>;
}

/// Live registration with a source; detaches when unsubscribed or dropped
pub struct SourceSubscription {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SourceSubscription {
    /// Create a subscription that runs `detach` exactly once
    pub fn new(detach: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self { detach: Some(Box::new(detach)) }
    }

    /// Detach from the source now
    pub fn unsubscribe(mut self) {
        self.detach_now();
    }

    fn detach_now(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for SourceSubscription {
    fn drop(&mut self) {
        self.detach_now();
    }
}

impl std::fmt::Debug for SourceSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceSubscription")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}

#[derive(Default)]
struct ChannelInner {
    current: Mutex<Option<NetworkObservation>>,
    subscribers: Mutex<HashMap<u64, ObservationSink>>,
    next_id: AtomicU64,
}

/// In-process source fed by [`ChannelSource::publish`]
///
/// Cloned handles share subscribers and the current observation.
///
/// # Example
///
/// ```rust
/// use networking::connectivity::{ConnectionType, NetworkObservation};
/// use networking::source::ChannelSource;
///
/// let source = ChannelSource::new();
/// assert_eq!(source.publish(NetworkObservation::online(ConnectionType::Wifi)), 0);
/// assert!(source.current().is_some());
/// ```
#[derive(Clone, Default)]
pub struct ChannelSource {
    inner: Arc<ChannelInner>,
}

impl ChannelSource {
    /// Create a source with no observation yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a source that already knows the current state
    pub fn with_current(observation: NetworkObservation) -> Self {
        let source = Self::new();
        *source.inner.current.lock() = Some(observation);
        source
    }

    /// Record a new observation and notify every subscriber
    ///
    /// Returns the number of subscribers reached. Subscribers whose
    /// receiving side is gone are logged and dropped.
    pub fn publish(&self, observation: NetworkObservation) -> usize {
        *self.inner.current.lock() = Some(observation);

        let mut subscribers = self.inner.subscribers.lock();
        let mut delivered = 0;
        subscribers.retain(|id, sink| match sink.send(observation) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(_) => {
                let err = SourceError::Delivery(format!("subscriber {} is gone", id));
                tracing::warn!("{}", err);
                false
            }
        });
        delivered
    }

    /// Latest published observation
    pub fn current(&self) -> Option<NetworkObservation> {
        *self.inner.current.lock()
    }

    /// Number of attached subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

#[async_trait]
impl ConnectivitySource for ChannelSource {
    fn subscribe(&self, sink: ObservationSink) -> Result<SourceSubscription> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribers.lock().insert(id, sink);

        let inner: Weak<ChannelInner> = Arc::downgrade(&self.inner);
        Ok(SourceSubscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.subscribers.lock().remove(&id);
            }
        }))
    }

    async fn fetch(&self) -> Result<NetworkObservation> {
        self.current()
            .ok_or_else(|| SourceError::Unavailable("no observation published yet".to_string()))
    }
}
