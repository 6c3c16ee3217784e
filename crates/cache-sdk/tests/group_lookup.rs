use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cache_sdk::group::{Fetcher, Group, Loader, PeerPicker};
use cache_sdk::store::{LocalStore, LruStore};
use cache_sdk::{ByteView, CacheError, FetchError, LoadError};
use test_timeout::tokio_timeout_test;

/// Stand-in for the scores table behind the cache.
struct ScoresTable {
    rows: HashMap<&'static str, &'static str>,
    calls: AtomicUsize,
    delay: Duration,
}

impl ScoresTable {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            rows: HashMap::from([("Tom", "630"), ("Jack", "589"), ("Sam", "567")]),
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Loader for ScoresTable {
    async fn load(&self, key: &str) -> Result<Bytes, LoadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.rows
            .get(key)
            .map(|value| Bytes::from_static(value.as_bytes()))
            .ok_or_else(|| LoadError::NotFound(key.to_string()))
    }
}

/// Peer that owns every key starting with `prefix`.
struct PrefixPicker {
    prefix: &'static str,
    peer: Arc<RecordingPeer>,
}

impl PeerPicker for PrefixPicker {
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn Fetcher>> {
        key.starts_with(self.prefix)
            .then(|| Arc::clone(&self.peer) as Arc<dyn Fetcher>)
    }
}

#[derive(Default)]
struct RecordingPeer {
    requests: parking_lot::Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Fetcher for RecordingPeer {
    async fn fetch(&self, group: &str, key: &str) -> Result<Bytes, CacheError> {
        self.requests
            .lock()
            .push((group.to_string(), key.to_string()));
        if key.ends_with("missing") {
            return Err(FetchError {
                group: group.to_string(),
                key: key.to_string(),
                peer: "beach-cache/10.0.0.2:9999".into(),
                reason: "status 404".into(),
            }
            .into());
        }
        Ok(Bytes::from(format!("remote:{key}")))
    }
}

#[tokio_timeout_test(10)]
async fn local_hit_skips_loader_and_peers() {
    let table = ScoresTable::new(Duration::ZERO);
    let store = Arc::new(LruStore::new(2 << 10));
    store.put("Tom", ByteView::from("630"));
    let group = Group::new("scores", store, table.clone());
    let peer = Arc::new(RecordingPeer::default());
    group
        .register_peers(Arc::new(PrefixPicker {
            prefix: "",
            peer: peer.clone(),
        }))
        .unwrap();

    let value = group.get("Tom").await.unwrap();
    assert_eq!(value.to_string(), "630");
    assert_eq!(table.calls(), 0);
    assert!(peer.requests.lock().is_empty());
    assert_eq!(group.stats().hits, 1);
}

#[tokio_timeout_test(10)]
async fn locally_owned_miss_loads_once_then_hits() {
    let table = ScoresTable::new(Duration::ZERO);
    let store = Arc::new(LruStore::new(2 << 10));
    let group = Group::new("scores", store.clone(), table.clone());

    assert_eq!(group.get("Jack").await.unwrap().to_string(), "589");
    assert_eq!(table.calls(), 1);
    assert_eq!(store.get("Jack").unwrap().to_string(), "589");

    assert_eq!(group.get("Jack").await.unwrap().to_string(), "589");
    assert_eq!(table.calls(), 1);

    let stats = group.stats();
    assert_eq!(stats.gets, 2);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.local_loads, 1);
}

#[tokio_timeout_test(10, paused)]
async fn concurrent_misses_invoke_loader_once() {
    let table = ScoresTable::new(Duration::from_millis(100));
    let group = Group::with_capacity("scores", 2 << 10, table.clone());

    let lookups = (0..8).map(|_| group.get("Sam"));
    let results = futures::future::join_all(lookups).await;

    assert_eq!(table.calls(), 1);
    for result in results {
        assert_eq!(result.unwrap().to_string(), "567");
    }
}

#[tokio_timeout_test(10)]
async fn remote_owner_is_fetched_without_local_caching() {
    let table = ScoresTable::new(Duration::ZERO);
    let store = Arc::new(LruStore::new(2 << 10));
    let group = Group::new("scores", store.clone(), table.clone());
    let peer = Arc::new(RecordingPeer::default());
    group
        .register_peers(Arc::new(PrefixPicker {
            prefix: "remote-",
            peer: peer.clone(),
        }))
        .unwrap();

    let value = group.get("remote-Tom").await.unwrap();
    assert_eq!(value.to_string(), "remote:remote-Tom");
    assert_eq!(table.calls(), 0);
    assert!(store.get("remote-Tom").is_none());

    group.get("remote-Tom").await.unwrap();
    assert_eq!(
        *peer.requests.lock(),
        vec![
            ("scores".to_string(), "remote-Tom".to_string()),
            ("scores".to_string(), "remote-Tom".to_string()),
        ]
    );
    assert_eq!(group.stats().peer_loads, 2);
}

#[tokio_timeout_test(10)]
async fn remote_failure_is_surfaced_unchanged() {
    let table = ScoresTable::new(Duration::ZERO);
    let group = Group::with_capacity("scores", 2 << 10, table.clone());
    let peer = Arc::new(RecordingPeer::default());
    group
        .register_peers(Arc::new(PrefixPicker {
            prefix: "remote-",
            peer,
        }))
        .unwrap();

    let err = group.get("remote-missing").await.unwrap_err();
    match err {
        CacheError::Fetch(fetch) => {
            assert_eq!(fetch.group, "scores");
            assert_eq!(fetch.key, "remote-missing");
            assert_eq!(fetch.peer, "beach-cache/10.0.0.2:9999");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(table.calls(), 0);
}

#[tokio_timeout_test(10)]
async fn loader_not_found_is_transparent_and_not_cached() {
    let table = ScoresTable::new(Duration::ZERO);
    let store = Arc::new(LruStore::new(2 << 10));
    let group = Group::new("scores", store.clone(), table.clone());

    for attempt in 1..=2 {
        let err = group.get("Absent").await.unwrap_err();
        assert!(
            matches!(&err, CacheError::Load(LoadError::NotFound(key)) if key == "Absent"),
            "unexpected error: {err:?}"
        );
        assert_eq!(err.to_string(), "Absent not exist");
        assert_eq!(table.calls(), attempt);
    }
    assert!(store.is_empty());
    assert_eq!(group.stats().errors, 2);

    assert_eq!(group.get("Tom").await.unwrap().to_string(), "630");
}
