use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, trace};

use crate::error::{CacheError, CacheResult, LoadError};
use crate::flight::Flight;
use crate::store::{LocalStore, LruStore};
use crate::ByteView;

/// Authoritative source consulted on a miss for a key this node owns.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(&self, key: &str) -> Result<Bytes, LoadError>;
}

/// Adapter turning an async closure into a [`Loader`].
pub struct LoaderFn<F>(pub F);

pub fn loader_fn<F, Fut>(f: F) -> LoaderFn<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Bytes, LoadError>> + Send,
{
    LoaderFn(f)
}

#[async_trait]
impl<F, Fut> Loader for LoaderFn<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Bytes, LoadError>> + Send,
{
    async fn load(&self, key: &str) -> Result<Bytes, LoadError> {
        (self.0)(key.to_string()).await
    }
}

/// Gets a value for `(group, key)` from some other node.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, group: &str, key: &str) -> CacheResult<Bytes>;
}

/// Key placement. Returns the fetcher for the peer owning `key`, or `None`
/// when this node owns it.
pub trait PeerPicker: Send + Sync {
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn Fetcher>>;
}

#[derive(Default)]
struct GroupStats {
    gets: AtomicU64,
    hits: AtomicU64,
    loads: AtomicU64,
    local_loads: AtomicU64,
    peer_loads: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GroupStatsSnapshot {
    pub gets: u64,
    pub hits: u64,
    pub loads: u64,
    pub local_loads: u64,
    pub peer_loads: u64,
    pub errors: u64,
}

/// A named cache namespace: local store, backing loader, optional peers.
pub struct Group {
    name: String,
    store: Arc<dyn LocalStore>,
    loader: Arc<dyn Loader>,
    peers: OnceLock<Arc<dyn PeerPicker>>,
    flight: Flight<CacheResult<ByteView>>,
    stats: GroupStats,
}

impl Group {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn LocalStore>,
        loader: Arc<dyn Loader>,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            loader,
            peers: OnceLock::new(),
            flight: Flight::new(),
            stats: GroupStats::default(),
        }
    }

    /// Group backed by an [`LruStore`] bounded to `cache_bytes`.
    pub fn with_capacity(
        name: impl Into<String>,
        cache_bytes: usize,
        loader: Arc<dyn Loader>,
    ) -> Self {
        Self::new(name, Arc::new(LruStore::new(cache_bytes)), loader)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach key placement. Allowed once per group.
    pub fn register_peers(&self, picker: Arc<dyn PeerPicker>) -> CacheResult<()> {
        self.peers
            .set(picker)
            .map_err(|_| CacheError::PeersAlreadyRegistered(self.name.clone()))
    }

    pub async fn get(&self, key: &str) -> CacheResult<ByteView> {
        if key.is_empty() {
            return Err(CacheError::InvalidKey);
        }
        self.stats.gets.fetch_add(1, Ordering::Relaxed);

        if let Some(value) = self.store.get(key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            trace!(group = %self.name, key, "cache hit");
            return Ok(value);
        }

        let result = self.flight.run(key, || self.load(key)).await;
        if result.is_err() {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn load(&self, key: &str) -> CacheResult<ByteView> {
        // A flight that finished just before this one may already have filled the store.
        if let Some(value) = self.store.get(key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }
        self.stats.loads.fetch_add(1, Ordering::Relaxed);

        if let Some(peer) = self.peers.get().and_then(|picker| picker.pick_peer(key)) {
            self.stats.peer_loads.fetch_add(1, Ordering::Relaxed);
            debug!(group = %self.name, key, "loading from owning peer");
            // Remote values stay with their owner; they are not cached here.
            return peer.fetch(&self.name, key).await.map(ByteView::from);
        }

        self.stats.local_loads.fetch_add(1, Ordering::Relaxed);
        debug!(group = %self.name, key, "loading from backing source");
        let value = ByteView::from(self.loader.load(key).await?);
        self.store.put(key, value.clone());
        Ok(value)
    }

    pub fn stats(&self) -> GroupStatsSnapshot {
        GroupStatsSnapshot {
            gets: self.stats.gets.load(Ordering::Relaxed),
            hits: self.stats.hits.load(Ordering::Relaxed),
            loads: self.stats.loads.load(Ordering::Relaxed),
            local_loads: self.stats.local_loads.load(Ordering::Relaxed),
            peer_loads: self.stats.peer_loads.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
        }
    }
}

/// Groups served by this process, looked up by name when peers ask for keys.
#[derive(Clone, Default)]
pub struct GroupRegistry {
    groups: Arc<RwLock<HashMap<String, Arc<Group>>>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `group`, replacing any group with the same name.
    pub fn insert(&self, group: Group) -> Arc<Group> {
        let group = Arc::new(group);
        self.groups
            .write()
            .insert(group.name().to_string(), Arc::clone(&group));
        group
    }

    pub fn get(&self, name: &str) -> Option<Arc<Group>> {
        self.groups.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_loader() -> Arc<dyn Loader> {
        Arc::new(loader_fn(|key: String| async move {
            Ok(Bytes::from(format!("value-of-{key}")))
        }))
    }

    #[tokio::test]
    async fn empty_key_is_rejected() {
        let group = Group::with_capacity("scores", 1024, static_loader());
        assert!(matches!(group.get("").await, Err(CacheError::InvalidKey)));
        assert_eq!(group.stats().gets, 0);
    }

    #[test]
    fn peers_register_once() {
        struct Nobody;
        impl PeerPicker for Nobody {
            fn pick_peer(&self, _key: &str) -> Option<Arc<dyn Fetcher>> {
                None
            }
        }

        let group = Group::with_capacity("scores", 1024, static_loader());
        group.register_peers(Arc::new(Nobody)).unwrap();
        assert!(matches!(
            group.register_peers(Arc::new(Nobody)),
            Err(CacheError::PeersAlreadyRegistered(name)) if name == "scores"
        ));
    }

    #[test]
    fn registry_replaces_by_name() {
        let registry = GroupRegistry::new();
        registry.insert(Group::with_capacity("scores", 1, static_loader()));
        let replacement = registry.insert(Group::with_capacity("scores", 2, static_loader()));
        registry.insert(Group::with_capacity("ages", 1, static_loader()));

        assert_eq!(registry.names(), vec!["ages".to_string(), "scores".to_string()]);
        assert!(Arc::ptr_eq(&registry.get("scores").unwrap(), &replacement));
        assert!(registry.get("missing").is_none());
    }
}
