use std::sync::Arc;
use std::time::Instant;

use cache_sdk::group::GroupRegistry;

use crate::ring::PeerRing;

#[derive(Clone)]
pub struct AppState {
    start: Instant,
    peer_id: String,
    groups: GroupRegistry,
    ring: Option<Arc<PeerRing>>,
}

impl AppState {
    pub fn new(peer_id: impl Into<String>, groups: GroupRegistry, ring: Option<Arc<PeerRing>>) -> Self {
        Self {
            start: Instant::now(),
            peer_id: peer_id.into(),
            groups,
            ring,
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn groups(&self) -> &GroupRegistry {
        &self.groups
    }

    /// Current membership, or just this node when it runs without peers.
    pub fn peers(&self) -> Vec<String> {
        match &self.ring {
            Some(ring) => ring.peers(),
            None => vec![self.peer_id.clone()],
        }
    }
}
