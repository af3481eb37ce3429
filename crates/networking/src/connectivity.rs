//! Device connectivity tracking
//!
//! This module normalizes raw platform observations into a persisted
//! [`ConnectivityState`] and exposes cheap selectors (offline, connection
//! type, offline duration) for the rest of the application.
//!
//! The device is offline when the link is down or the internet is known to
//! be unreachable. Unknown reachability never counts as offline by itself.
//! `offline_since` marks the start of the current offline episode and is
//! only set on the first offline observation of that episode.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use storage::clock::{elapsed_between, system_clock, SharedClock};
use storage::{KeyValueStore, PersistedRecord};
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};

use crate::monitor::{MonitorHandle, MonitorInner};
use crate::source::ConnectivitySource;

/// Default storage key for the connectivity record
pub const NETWORK_STORAGE_KEY: &str = "network-storage";

/// Transport reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    /// Wi-Fi
    Wifi,
    /// Cellular data
    Cellular,
    /// Wired ethernet
    Ethernet,
    /// Bluetooth tethering
    Bluetooth,
    /// WiMAX
    Wimax,
    /// VPN
    Vpn,
    /// Some other transport
    Other,
    /// No transport
    None,
    /// Not determined
    #[default]
    #[serde(other)]
    Unknown,
}

impl ConnectionType {
    /// Name as persisted and reported by platforms
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Wifi => "wifi",
            ConnectionType::Cellular => "cellular",
            ConnectionType::Ethernet => "ethernet",
            ConnectionType::Bluetooth => "bluetooth",
            ConnectionType::Wimax => "wimax",
            ConnectionType::Vpn => "vpn",
            ConnectionType::Other => "other",
            ConnectionType::None => "none",
            ConnectionType::Unknown => "unknown",
        }
    }

    /// Parse a platform type string; anything unrecognized is `Unknown`
    pub fn from_platform(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "wifi" => ConnectionType::Wifi,
            "cellular" => ConnectionType::Cellular,
            "ethernet" => ConnectionType::Ethernet,
            "bluetooth" => ConnectionType::Bluetooth,
            "wimax" => ConnectionType::Wimax,
            "vpn" => ConnectionType::Vpn,
            "other" => ConnectionType::Other,
            "none" => ConnectionType::None,
            _ => ConnectionType::Unknown,
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_platform(s))
    }
}

/// One raw connectivity report from the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkObservation {
    /// Link-layer connectivity
    pub is_connected: bool,
    /// Internet reachability; `None` while undetermined
    pub is_internet_reachable: Option<bool>,
    /// Transport
    pub connection_type: ConnectionType,
}

impl NetworkObservation {
    /// Create an observation
    pub fn new(
        is_connected: bool,
        is_internet_reachable: Option<bool>,
        connection_type: ConnectionType,
    ) -> Self {
        Self { is_connected, is_internet_reachable, connection_type }
    }

    /// Create an observation from a platform type string
    pub fn from_platform(
        is_connected: bool,
        is_internet_reachable: Option<bool>,
        connection_type: &str,
    ) -> Self {
        Self::new(is_connected, is_internet_reachable, ConnectionType::from_platform(connection_type))
    }

    /// Connected and reachable over `connection_type`
    pub fn online(connection_type: ConnectionType) -> Self {
        Self::new(true, Some(true), connection_type)
    }

    /// No link at all
    pub fn offline() -> Self {
        Self::new(false, Some(false), ConnectionType::None)
    }

    /// Whether this observation puts the device offline
    pub fn is_offline(&self) -> bool {
        !self.is_connected || self.is_internet_reachable == Some(false)
    }
}

/// Last known connectivity, as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectivityState {
    /// Link-layer connectivity
    pub is_connected: bool,
    /// Internet reachability; `None` while undetermined
    pub is_internet_reachable: Option<bool>,
    /// Transport, `None` before the first observation
    pub connection_type: Option<ConnectionType>,
    /// Transport is Wi-Fi
    pub is_wifi: bool,
    /// Transport is cellular
    pub is_cellular: bool,
    /// Last instant the device was confirmed online
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub last_known_connection_at: Option<DateTime<Utc>>,
    /// Start of the current offline episode; `None` while online
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub offline_since: Option<DateTime<Utc>>,
}

impl Default for ConnectivityState {
    /// Nothing known yet: assume online so callers still try the network
    fn default() -> Self {
        Self {
            is_connected: true,
            is_internet_reachable: None,
            connection_type: None,
            is_wifi: false,
            is_cellular: false,
            last_known_connection_at: None,
            offline_since: None,
        }
    }
}

impl ConnectivityState {
    /// Link down or internet known unreachable
    pub fn is_offline(&self) -> bool {
        !self.is_connected || self.is_internet_reachable == Some(false)
    }

    /// Length of the current offline episode at `now`
    pub fn offline_duration_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        if !self.is_offline() {
            return None;
        }
        self.offline_since.map(|since| elapsed_between(since, now))
    }

    /// State after applying `observation` at `now`
    pub fn next(&self, observation: &NetworkObservation, now: DateTime<Utc>) -> Self {
        let offline = observation.is_offline();

        Self {
            is_connected: observation.is_connected,
            is_internet_reachable: observation.is_internet_reachable,
            connection_type: Some(observation.connection_type),
            is_wifi: observation.connection_type == ConnectionType::Wifi,
            is_cellular: observation.connection_type == ConnectionType::Cellular,
            last_known_connection_at: if offline {
                self.last_known_connection_at
            } else {
                Some(now)
            },
            offline_since: if offline {
                self.offline_since.or(Some(now))
            } else {
                None
            },
        }
    }

    /// Restore derived fields and the offline invariant on a loaded record
    ///
    /// Returns `None` when the record is already consistent.
    fn repaired(&self, now: DateTime<Utc>) -> Option<Self> {
        let mut fixed = self.clone();
        fixed.is_wifi = fixed.connection_type == Some(ConnectionType::Wifi);
        fixed.is_cellular = fixed.connection_type == Some(ConnectionType::Cellular);
        if fixed.is_offline() {
            fixed.offline_since = fixed.offline_since.or(Some(now));
        } else {
            fixed.offline_since = None;
        }

        (fixed != *self).then_some(fixed)
    }
}

/// Connectivity tracker configuration
#[derive(Debug, Clone)]
pub struct ConnectivityConfig {
    /// Storage key that holds the connectivity record
    pub storage_key: String,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self { storage_key: NETWORK_STORAGE_KEY.to_string() }
    }
}

impl ConnectivityConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the storage key
    pub fn storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }
}

/// Debounced, persisted view of device connectivity
///
/// Selectors are synchronous projections of the in-memory state and never
/// perform I/O. [`update_network_state`](Self::update_network_state) persists
/// before publishing; a failed write is logged and dropped so observers on
/// background channels are never disturbed.
///
/// # Example
///
/// ```rust
/// use networking::connectivity::{ConnectivityConfig, ConnectivityTracker, NetworkObservation};
/// use storage::MemoryStore;
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let tracker =
///     ConnectivityTracker::load(Arc::new(MemoryStore::new()), ConnectivityConfig::default()).await;
/// assert!(!tracker.is_offline());
///
/// tracker.update_network_state(NetworkObservation::offline()).await;
/// assert!(tracker.is_offline());
/// assert!(tracker.offline_duration().is_some());
/// # }
/// ```
pub struct ConnectivityTracker {
    state_tx: watch::Sender<ConnectivityState>,
    record: PersistedRecord,
    clock: SharedClock,
    write_lock: AsyncMutex<()>,
    monitor: Mutex<Option<Arc<MonitorInner>>>,
}

impl ConnectivityTracker {
    /// Rehydrate the last known state from `store` using the system clock
    pub async fn load(store: Arc<dyn KeyValueStore>, config: ConnectivityConfig) -> Self {
        Self::load_with_clock(store, config, system_clock()).await
    }

    /// Rehydrate the last known state from `store` with an explicit clock
    pub async fn load_with_clock(
        store: Arc<dyn KeyValueStore>,
        config: ConnectivityConfig,
        clock: SharedClock,
    ) -> Self {
        let record = PersistedRecord::new(store, config.storage_key);
        let mut state: ConnectivityState = record.load_or_default().await;

        if let Some(fixed) = state.repaired(clock.now_millis()) {
            tracing::warn!("Repaired inconsistent connectivity record under {}", record.key());
            record.store(&fixed).await;
            state = fixed;
        }

        tracing::debug!(
            "Loaded connectivity from {}: offline={}, type={:?}",
            record.key(),
            state.is_offline(),
            state.connection_type
        );

        let (state_tx, _) = watch::channel(state);

        Self {
            state_tx,
            record,
            clock,
            write_lock: AsyncMutex::new(()),
            monitor: Mutex::new(None),
        }
    }

    /// Apply a platform observation, persist, then publish the new state
    pub async fn update_network_state(&self, observation: NetworkObservation) {
        let _guard = self.write_lock.lock().await;
        let now = self.clock.now_millis();

        let previous = self.state_tx.borrow().clone();
        let next = previous.next(&observation, now);

        match (previous.is_offline(), next.is_offline()) {
            (false, true) => tracing::info!(
                "Device went offline (connected={}, reachable={:?})",
                observation.is_connected,
                observation.is_internet_reachable
            ),
            (true, false) => tracing::info!(
                "Device back online via {} after {:?}",
                observation.connection_type,
                previous.offline_duration_at(now).unwrap_or_default()
            ),
            _ => tracing::debug!("Connectivity observation: {:?}", observation),
        }

        if next == previous {
            return;
        }

        self.record.store(&next).await;
        self.state_tx.send_replace(next);
    }

    /// Link down or internet known unreachable
    pub fn is_offline(&self) -> bool {
        self.state_tx.borrow().is_offline()
    }

    /// How long the current offline episode has lasted; `None` while online
    ///
    /// Recomputed from the clock on every call.
    pub fn offline_duration(&self) -> Option<Duration> {
        self.state_tx.borrow().offline_duration_at(self.clock.now())
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> ConnectivityState {
        self.state_tx.borrow().clone()
    }

    /// Current transport, if any has been observed
    pub fn connection_type(&self) -> Option<ConnectionType> {
        self.state_tx.borrow().connection_type
    }

    /// Whether the transport is Wi-Fi
    pub fn is_wifi(&self) -> bool {
        self.state_tx.borrow().is_wifi
    }

    /// Whether the transport is cellular
    pub fn is_cellular(&self) -> bool {
        self.state_tx.borrow().is_cellular
    }

    /// Last instant the device was confirmed online
    pub fn last_known_connection_at(&self) -> Option<DateTime<Utc>> {
        self.state_tx.borrow().last_known_connection_at
    }

    /// Start of the current offline episode
    pub fn offline_since(&self) -> Option<DateTime<Utc>> {
        self.state_tx.borrow().offline_since
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state_tx.subscribe()
    }

    /// Fetch the current platform state once and apply it
    ///
    /// Returns whether an observation was applied.
    pub async fn refresh(&self, source: &dyn ConnectivitySource) -> bool {
        match source.fetch().await {
            Ok(observation) => {
                self.update_network_state(observation).await;
                true
            }
            Err(e) => {
                tracing::warn!("Connectivity fetch failed: {}", e);
                false
            }
        }
    }

    /// Subscribe to `source` and apply every observation it delivers
    ///
    /// The current state is fetched once right away instead of waiting for
    /// the first change. Any monitor already running is torn down first, so
    /// at most one subscription is ever active. Must be called from within
    /// a Tokio runtime.
    pub fn start_monitoring(self: &Arc<Self>, source: Arc<dyn ConnectivitySource>) -> MonitorHandle {
        let mut slot = self.monitor.lock();
        if let Some(previous) = slot.take() {
            previous.cancel();
        }

        let (sink, observations) = mpsc::unbounded_channel();
        let subscription = match source.subscribe(sink) {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                tracing::warn!("Failed to subscribe to connectivity changes: {}", e);
                None
            }
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_monitor(Arc::downgrade(self), source, observations, stop_rx));

        let inner = Arc::new(MonitorInner::new(subscription, stop_tx, task));
        *slot = Some(Arc::clone(&inner));

        tracing::debug!("Connectivity monitoring started");
        MonitorHandle::new(inner)
    }

    /// Stop the active monitor, if any
    pub fn stop_monitoring(&self) {
        if let Some(inner) = self.monitor.lock().take() {
            inner.cancel();
        }
    }

    /// Whether a monitor is currently active
    pub fn is_monitoring(&self) -> bool {
        self.monitor
            .lock()
            .as_ref()
            .map(|inner| inner.is_active())
            .unwrap_or(false)
    }
}

impl Drop for ConnectivityTracker {
    fn drop(&mut self) {
        if let Some(inner) = self.monitor.get_mut().take() {
            inner.cancel();
        }
    }
}

async fn run_monitor(
    tracker: Weak<ConnectivityTracker>,
    source: Arc<dyn ConnectivitySource>,
    mut observations: mpsc::UnboundedReceiver<NetworkObservation>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let initial = tokio::select! {
        biased;
        _ = &mut stop_rx => return,
        initial = source.fetch() => initial,
    };

    match initial {
        Ok(observation) => match tracker.upgrade() {
            Some(tracker) => tracker.update_network_state(observation).await,
            None => return,
        },
        Err(e) => tracing::warn!("Initial connectivity fetch failed: {}", e),
    }

    loop {
        let observation = tokio::select! {
            biased;
            _ = &mut stop_rx => break,
            observation = observations.recv() => observation,
        };

        let Some(observation) = observation else {
            tracing::debug!("Connectivity source closed its channel");
            break;
        };
        let Some(tracker) = tracker.upgrade() else {
            break;
        };
        tracker.update_network_state(observation).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{ChannelSource, SourceError, SourceSubscription};
    use async_trait::async_trait;
    use storage::clock::{Clock, ManualClock};
    use storage::kv::{self, KvError};
    use storage::MemoryStore;
    use tokio::time::timeout;

    mockall::mock! {
        Store {}

        #[async_trait]
        impl KeyValueStore for Store {
            async fn get(&self, key: &str) -> kv::Result<Option<Vec<u8>>>;
            async fn set(&self, key: &str, value: Vec<u8>) -> kv::Result<()>;
            async fn delete(&self, key: &str) -> kv::Result<bool>;
        }
    }

    async fn tracker_with_clock() -> (ConnectivityTracker, ManualClock, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new();
        let tracker = ConnectivityTracker::load_with_clock(
            store.clone(),
            ConnectivityConfig::default(),
            Arc::new(clock.clone()),
        )
        .await;
        (tracker, clock, store)
    }

    async fn wait_for(
        rx: &mut watch::Receiver<ConnectivityState>,
        predicate: impl Fn(&ConnectivityState) -> bool,
    ) {
        timeout(Duration::from_secs(2), rx.wait_for(|state| predicate(state)))
            .await
            .expect("timed out waiting for connectivity state")
            .expect("tracker dropped");
    }

    #[test]
    fn test_default_state_is_online_assumed() {
        let state = ConnectivityState::default();
        assert!(!state.is_offline());
        assert_eq!(state.is_internet_reachable, None);
        assert_eq!(state.offline_since, None);
    }

    #[test]
    fn test_offline_guard() {
        let now = Utc::now();
        let base = ConnectivityState::default();

        let unreachable = base.next(&NetworkObservation::new(true, Some(false), ConnectionType::Wifi), now);
        assert!(unreachable.is_offline());

        let unknown = base.next(&NetworkObservation::new(true, None, ConnectionType::Wifi), now);
        assert!(!unknown.is_offline());
        assert_eq!(unknown.offline_since, None);

        let unlinked = base.next(&NetworkObservation::new(false, None, ConnectionType::None), now);
        assert!(unlinked.is_offline());
        assert_eq!(unlinked.offline_since, Some(now));
    }

    #[test]
    fn test_derived_flags_follow_connection_type() {
        let now = Utc::now();
        let base = ConnectivityState::default();

        let wifi = base.next(&NetworkObservation::online(ConnectionType::Wifi), now);
        assert!(wifi.is_wifi && !wifi.is_cellular);

        let cell = wifi.next(&NetworkObservation::online(ConnectionType::Cellular), now);
        assert!(cell.is_cellular && !cell.is_wifi);
        assert_eq!(cell.connection_type, Some(ConnectionType::Cellular));

        let none = cell.next(&NetworkObservation::offline(), now);
        assert!(!none.is_wifi && !none.is_cellular);
    }

    #[test]
    fn test_connection_type_parsing() {
        assert_eq!(ConnectionType::from_platform("WIFI"), ConnectionType::Wifi);
        assert_eq!(ConnectionType::from_platform("cellular"), ConnectionType::Cellular);
        assert_eq!(ConnectionType::from_platform("satellite"), ConnectionType::Unknown);
        assert_eq!("none".parse::<ConnectionType>(), Ok(ConnectionType::None));

        let parsed: ConnectionType = serde_json::from_str("\"satellite\"").unwrap();
        assert_eq!(parsed, ConnectionType::Unknown);
    }

    #[tokio::test]
    async fn test_offline_is_idempotent() {
        let (tracker, clock, _) = tracker_with_clock().await;

        tracker.update_network_state(NetworkObservation::offline()).await;
        let first = tracker.offline_since();
        assert_eq!(first, Some(clock.now()));

        clock.advance(Duration::from_secs(5));
        tracker
            .update_network_state(NetworkObservation::new(false, None, ConnectionType::Unknown))
            .await;

        assert_eq!(tracker.offline_since(), first);
        assert_eq!(tracker.offline_duration(), Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_offline_to_online() {
        let (tracker, clock, _) = tracker_with_clock().await;

        tracker.update_network_state(NetworkObservation::offline()).await;
        clock.advance(Duration::from_secs(30));
        tracker.update_network_state(NetworkObservation::online(ConnectionType::Wifi)).await;

        assert!(!tracker.is_offline());
        assert_eq!(tracker.offline_since(), None);
        assert_eq!(tracker.last_known_connection_at(), Some(clock.now()));
        assert_eq!(tracker.offline_duration(), None);
        assert!(tracker.is_wifi());
    }

    #[tokio::test]
    async fn test_offline_keeps_last_known_connection() {
        let (tracker, clock, _) = tracker_with_clock().await;

        tracker.update_network_state(NetworkObservation::online(ConnectionType::Cellular)).await;
        let online_at = clock.now();
        clock.advance(Duration::from_secs(12));
        tracker.update_network_state(NetworkObservation::offline()).await;

        assert_eq!(tracker.last_known_connection_at(), Some(online_at));
        assert_eq!(tracker.offline_since(), Some(clock.now()));
    }

    #[tokio::test]
    async fn test_offline_duration_grows_in_real_time() {
        let tracker =
            ConnectivityTracker::load(Arc::new(MemoryStore::new()), ConnectivityConfig::default())
                .await;

        tracker.update_network_state(NetworkObservation::offline()).await;
        let first = tracker.offline_duration().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = tracker.offline_duration().unwrap();

        assert!(second > first);
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let (tracker, clock, store) = tracker_with_clock().await;

        tracker.update_network_state(NetworkObservation::online(ConnectionType::Wifi)).await;
        clock.advance(Duration::from_secs(1));
        tracker.update_network_state(NetworkObservation::offline()).await;

        let reloaded = ConnectivityTracker::load_with_clock(
            store,
            ConnectivityConfig::default(),
            Arc::new(clock.clone()),
        )
        .await;

        assert_eq!(reloaded.snapshot(), tracker.snapshot());
        assert!(reloaded.is_offline());
    }

    #[tokio::test]
    async fn test_persisted_record_layout() {
        let (tracker, clock, store) = tracker_with_clock().await;

        tracker.update_network_state(NetworkObservation::online(ConnectionType::Cellular)).await;

        let bytes = store.get(NETWORK_STORAGE_KEY).await.unwrap().unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(doc["isConnected"], true);
        assert_eq!(doc["isInternetReachable"], true);
        assert_eq!(doc["connectionType"], "cellular");
        assert_eq!(doc["isWifi"], false);
        assert_eq!(doc["isCellular"], true);
        assert_eq!(doc["lastKnownConnectionAt"], clock.now().timestamp_millis());
        assert!(doc["offlineSince"].is_null());
    }

    #[tokio::test]
    async fn test_malformed_record_falls_back_to_default() {
        let store = Arc::new(MemoryStore::new());
        store.set(NETWORK_STORAGE_KEY, b"\x00garbage".to_vec()).await.unwrap();

        let tracker = ConnectivityTracker::load(store, ConnectivityConfig::default()).await;

        assert_eq!(tracker.snapshot(), ConnectivityState::default());
    }

    #[tokio::test]
    async fn test_inconsistent_record_is_repaired() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new();
        store
            .set(
                NETWORK_STORAGE_KEY,
                br#"{"isConnected":false,"isInternetReachable":null,"connectionType":"wifi","isWifi":false,"isCellular":true,"lastKnownConnectionAt":null,"offlineSince":null}"#.to_vec(),
            )
            .await
            .unwrap();

        let tracker = ConnectivityTracker::load_with_clock(
            store,
            ConnectivityConfig::default(),
            Arc::new(clock.clone()),
        )
        .await;

        let state = tracker.snapshot();
        assert!(state.is_wifi);
        assert!(!state.is_cellular);
        assert_eq!(state.offline_since, Some(clock.now()));
    }

    #[tokio::test]
    async fn test_storage_failure_does_not_propagate() {
        let mut mock = MockStore::new();
        mock.expect_get()
            .returning(|_| Err(KvError::Unavailable("keychain locked".to_string())));
        mock.expect_set()
            .returning(|_, _| Err(KvError::Unavailable("keychain locked".to_string())));

        let tracker = ConnectivityTracker::load(Arc::new(mock), ConnectivityConfig::default()).await;
        tracker.update_network_state(NetworkObservation::offline()).await;

        assert!(tracker.is_offline());
    }

    #[tokio::test]
    async fn test_subscribe_sees_updates() {
        let (tracker, _, _) = tracker_with_clock().await;
        let mut rx = tracker.subscribe();

        tracker.update_network_state(NetworkObservation::offline()).await;

        rx.changed().await.unwrap();
        assert!(rx.borrow().is_offline());
    }

    #[tokio::test]
    async fn test_refresh() {
        let (tracker, _, _) = tracker_with_clock().await;

        assert!(!tracker.refresh(&ChannelSource::new()).await);

        let source = ChannelSource::with_current(NetworkObservation::offline());
        assert!(tracker.refresh(&source).await);
        assert!(tracker.is_offline());
    }

    #[tokio::test]
    async fn test_monitoring_fetches_initial_state() {
        let (tracker, _, _) = tracker_with_clock().await;
        let tracker = Arc::new(tracker);
        let mut rx = tracker.subscribe();
        let source = ChannelSource::with_current(NetworkObservation::offline());

        let handle = tracker.start_monitoring(Arc::new(source.clone()));

        wait_for(&mut rx, |state| state.is_offline()).await;
        assert!(handle.is_active());
        assert!(tracker.is_monitoring());
    }

    #[tokio::test]
    async fn test_monitoring_applies_changes() {
        let (tracker, _, _) = tracker_with_clock().await;
        let tracker = Arc::new(tracker);
        let mut rx = tracker.subscribe();
        let source = ChannelSource::new();

        let _handle = tracker.start_monitoring(Arc::new(source.clone()));

        assert_eq!(source.publish(NetworkObservation::offline()), 1);
        wait_for(&mut rx, |state| state.is_offline()).await;

        source.publish(NetworkObservation::online(ConnectionType::Ethernet));
        wait_for(&mut rx, |state| state.connection_type == Some(ConnectionType::Ethernet)).await;
        assert!(!tracker.is_offline());
    }

    #[tokio::test]
    async fn test_cancel_detaches_subscription() {
        let (tracker, _, _) = tracker_with_clock().await;
        let tracker = Arc::new(tracker);
        let source = ChannelSource::new();

        let handle = tracker.start_monitoring(Arc::new(source.clone()));
        assert_eq!(source.subscriber_count(), 1);

        handle.cancel();
        handle.cancel();

        assert_eq!(source.subscriber_count(), 0);
        assert_eq!(source.publish(NetworkObservation::offline()), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!tracker.is_offline());
        assert!(!tracker.is_monitoring());
    }

    #[tokio::test]
    async fn test_restart_replaces_previous_monitor() {
        let (tracker, _, _) = tracker_with_clock().await;
        let tracker = Arc::new(tracker);
        let source = ChannelSource::new();

        let first = tracker.start_monitoring(Arc::new(source.clone()));
        let second = tracker.start_monitoring(Arc::new(source.clone()));

        assert_eq!(source.subscriber_count(), 1);
        assert!(!first.is_active());
        assert!(second.is_active());

        drop(first);
        assert_eq!(source.subscriber_count(), 1);

        drop(second);
        assert_eq!(source.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_monitoring() {
        let (tracker, _, _) = tracker_with_clock().await;
        let tracker = Arc::new(tracker);
        let source = ChannelSource::new();

        let handle = tracker.start_monitoring(Arc::new(source.clone()));
        tracker.stop_monitoring();

        assert!(!handle.is_active());
        assert_eq!(source.subscriber_count(), 0);
    }

    struct BrokenSource;

    #[async_trait]
    impl ConnectivitySource for BrokenSource {
        fn subscribe(&self, _sink: crate::source::ObservationSink) -> crate::source::Result<SourceSubscription> {
            Err(SourceError::Unavailable("no reachability API".to_string()))
        }

        async fn fetch(&self) -> crate::source::Result<NetworkObservation> {
            Ok(NetworkObservation::online(ConnectionType::Vpn))
        }
    }

    #[tokio::test]
    async fn test_subscribe_failure_still_fetches() {
        let (tracker, _, _) = tracker_with_clock().await;
        let tracker = Arc::new(tracker);
        let mut rx = tracker.subscribe();

        let _handle = tracker.start_monitoring(Arc::new(BrokenSource));

        wait_for(&mut rx, |state| state.connection_type == Some(ConnectionType::Vpn)).await;
    }

    #[tokio::test]
    async fn test_offline_duration_none_while_online() {
        let (tracker, clock, _) = tracker_with_clock().await;

        assert_eq!(tracker.offline_duration(), None);
        tracker.update_network_state(NetworkObservation::online(ConnectionType::Wifi)).await;
        clock.advance(Duration::from_secs(60));
        assert_eq!(tracker.offline_duration(), None);
    }
}
