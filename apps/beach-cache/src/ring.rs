use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use cache_sdk::coordination::CoordinationStore;
use cache_sdk::group::{Fetcher, PeerPicker};
use cache_sdk::placement::select_owner;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::client::PeerClient;
use crate::discovery::PeerResolver;

/// The current peer set, used to place keys. Peers are identified by service
/// name; this node's own id is always a member and maps to "local".
pub struct PeerRing {
    self_id: String,
    resolver: PeerResolver,
    fetch_timeout: Duration,
    state: RwLock<RingState>,
}

#[derive(Default)]
struct RingState {
    ids: Vec<String>,
    clients: HashMap<String, Arc<PeerClient>>,
}

impl PeerRing {
    pub fn new(self_id: impl Into<String>, resolver: PeerResolver, fetch_timeout: Duration) -> Arc<Self> {
        let self_id = self_id.into();
        let ring = Arc::new(Self {
            self_id: self_id.clone(),
            resolver,
            fetch_timeout,
            state: RwLock::new(RingState::default()),
        });
        ring.set_peers([self_id]);
        ring
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Replace the peer set. Returns whether membership changed.
    pub fn set_peers<I, S>(&self, ids: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut wanted: BTreeSet<String> = ids.into_iter().map(Into::into).collect();
        wanted.insert(self.self_id.clone());
        let ids: Vec<String> = wanted.into_iter().collect();

        let mut state = self.state.write();
        if state.ids == ids {
            return false;
        }
        let mut clients = std::mem::take(&mut state.clients);
        state.clients = ids
            .iter()
            .filter(|id| **id != self.self_id)
            .map(|id| {
                let client = clients.remove(id).unwrap_or_else(|| {
                    Arc::new(PeerClient::new(
                        id.clone(),
                        self.resolver.clone(),
                        self.fetch_timeout,
                    ))
                });
                (id.clone(), client)
            })
            .collect();
        state.ids = ids;
        true
    }

    pub fn peers(&self) -> Vec<String> {
        self.state.read().ids.clone()
    }
}

impl PeerPicker for PeerRing {
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn Fetcher>> {
        let state = self.state.read();
        let owner = select_owner(key, &state.ids)?;
        if owner == self.self_id {
            return None;
        }
        state
            .clients
            .get(owner)
            .map(|client| Arc::clone(client) as Arc<dyn Fetcher>)
    }
}

/// Keep `ring` in step with the endpoints registered under `service_prefix`.
/// A failed listing leaves the previous peer set in place.
pub fn spawn_membership_refresh(
    ring: Arc<PeerRing>,
    store: Arc<dyn CoordinationStore>,
    service_prefix: String,
    period: Duration,
) -> JoinHandle<()> {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let prefix = format!("{service_prefix}/");
    tokio::spawn(async move {
        loop {
            interval.tick().await;
            match store.list(&prefix).await {
                Ok(endpoints) => {
                    if ring.set_peers(endpoints.into_iter().map(|endpoint| endpoint.service)) {
                        info!(peers = ?ring.peers(), "peer membership changed");
                    }
                }
                Err(err) => warn!(prefix = %prefix, error = %err, "membership refresh failed"),
            }
        }
    })
}
