//! Offline Fallback Integration Tests
//!
//! Storage and connectivity failures must degrade to in-memory operation
//! without ever surfacing to callers.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storage::kv::{self, KvError, SledStore};
use tempfile::TempDir;
use tether::{
    CacheCategory, ChannelSource, ConnectionType, KeyValueStore, KvConfig, NetworkObservation,
    Tether, TetherConfig,
};
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

fn unavailable() -> KvError {
    KvError::Unavailable("disk full".to_string())
}

/// A data directory that cannot hold a database falls back to memory
#[tokio::test]
async fn test_unopenable_store_falls_back_to_memory() {
    let temp_dir = TempDir::new().unwrap();
    let blocker = temp_dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"occupied").unwrap();

    let tether = Tether::open(TetherConfig::new(&blocker)).await;

    assert!(!tether.is_persistent());
    tether.cache().set(CacheCategory::Projects, "p1", &"alpha", None).await.unwrap();
    assert!(!tether.cache().is_stale(CacheCategory::Projects, "p1"));
}

/// A store locked past the open timeout is reopened by a later write
#[tokio::test]
async fn test_locked_store_is_retried_on_next_write() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("tether.db").to_string_lossy().into_owned();
    let config = || {
        TetherConfig::new(temp_dir.path())
            .kv(KvConfig::default().open_timeout(Duration::from_millis(30)))
    };

    let holder = SledStore::new(KvConfig::new(db_path)).unwrap();
    let tether = Tether::open(config()).await;
    assert!(!tether.is_persistent());

    tether.cache().set(CacheCategory::Projects, "p1", &"written while locked", None).await.unwrap();
    drop(holder);

    let mut attempts = 0;
    while !tether.is_persistent() && attempts < 100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        tether.cache().set(CacheCategory::Projects, "p2", &"after release", None).await.unwrap();
        attempts += 1;
    }
    assert!(tether.is_persistent());
    drop(tether);

    let reopened = Tether::open(TetherConfig::new(temp_dir.path())).await;
    assert!(reopened.is_persistent());
    assert!(reopened.cache().peek(CacheCategory::Projects, "p1").is_some());
    assert!(reopened.cache().peek(CacheCategory::Projects, "p2").is_some());
}

/// Every read and write failing leaves both components fully usable
#[tokio::test]
async fn test_failing_store_keeps_working_in_memory() {
    let writes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&writes);

    let mut mock = MockStore::new();
    mock.expect_get().returning(|_| Err(unavailable()));
    mock.expect_set().returning(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(unavailable())
    });

    let tether = Tether::open_with_store(Arc::new(mock), TetherConfig::default()).await;

    tether.cache().set(CacheCategory::Sessions, "s1", &7, None).await.unwrap();
    let value: Option<i32> = tether.cache().get(CacheCategory::Sessions, "s1").await.unwrap();
    assert_eq!(value, Some(7));

    tether.tracker().update_network_state(NetworkObservation::offline()).await;
    assert!(tether.tracker().is_offline());

    // set + get bookkeeping + connectivity update
    assert_eq!(writes.load(Ordering::SeqCst), 3);
}

/// Malformed persisted documents are ignored, not fatal
#[tokio::test]
async fn test_malformed_documents_start_empty() {
    let mut mock = MockStore::new();
    mock.expect_get().returning(|_| Ok(Some(b"{not json".to_vec())));
    mock.expect_set().returning(|_, _| Ok(()));

    let tether = Tether::open_with_store(Arc::new(mock), TetherConfig::default()).await;

    assert!(tether.cache().is_empty());
    assert!(!tether.tracker().is_offline());
    assert_eq!(tether.tracker().offline_since(), None);
}

/// Monitoring drives offline state and stops on drop
#[tokio::test]
async fn test_monitoring_offline_episode() {
    let tether = Tether::open(TetherConfig::in_memory()).await;
    let tracker = Arc::clone(tether.tracker());
    let source = ChannelSource::with_current(NetworkObservation::online(ConnectionType::Wifi));
    let mut rx = tracker.subscribe();

    let handle = tracker.start_monitoring(Arc::new(source.clone()));
    timeout(Duration::from_secs(2), rx.wait_for(|state| state.is_wifi))
        .await
        .unwrap()
        .unwrap();

    source.publish(NetworkObservation::new(true, Some(false), ConnectionType::Wifi));
    timeout(Duration::from_secs(2), rx.wait_for(|state| state.is_offline()))
        .await
        .unwrap()
        .unwrap();

    let since = tracker.offline_since().unwrap();
    source.publish(NetworkObservation::offline());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(tracker.offline_since(), Some(since));
    assert!(tracker.offline_duration().unwrap() >= Duration::from_millis(20));

    drop(handle);
    assert!(!tracker.is_monitoring());
    assert_eq!(source.subscriber_count(), 0);

    source.publish(NetworkObservation::online(ConnectionType::Wifi));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(tracker.is_offline());
}
