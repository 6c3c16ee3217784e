use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub type LeaseId = i64;

/// Time-bounded liveness claim. Everything published under it disappears when
/// it expires or is revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub id: LeaseId,
    pub ttl: Duration,
}

/// One address registered under a service name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub service: String,
    pub addr: String,
    pub lease: LeaseId,
}

impl Endpoint {
    pub fn key(&self) -> String {
        endpoint_key(&self.service, &self.addr)
    }
}

pub fn endpoint_key(service: &str, addr: &str) -> String {
    format!("{service}/{addr}")
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinationError {
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),
    #[error("coordination store error: {0}")]
    Store(String),
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn grant(&self, ttl: Duration) -> Result<Lease, CoordinationError>;

    /// Renew a lease once. `Ok(None)` means the lease is already gone.
    async fn refresh(&self, lease: LeaseId) -> Result<Option<Duration>, CoordinationError>;

    async fn revoke(&self, lease: LeaseId) -> Result<(), CoordinationError>;

    /// Publish `addr` under `service`, bound to `lease`.
    async fn publish(
        &self,
        service: &str,
        addr: &str,
        lease: LeaseId,
    ) -> Result<(), CoordinationError>;

    /// All live endpoints whose key (`service/addr`) starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<Endpoint>, CoordinationError>;

    /// Live endpoints registered under exactly `service`.
    async fn endpoints(&self, service: &str) -> Result<Vec<Endpoint>, CoordinationError> {
        let prefix = format!("{service}/");
        Ok(self
            .list(&prefix)
            .await?
            .into_iter()
            .filter(|endpoint| endpoint.service == service)
            .collect())
    }

    /// Cancelled when the client's session with the store ends.
    fn session(&self) -> CancellationToken;

    /// End the session. Leases are left to expire on their own.
    fn close(&self) {
        self.session().cancel();
    }
}

/// In-memory coordinator for tests, single-process runs and static bootstrap.
/// Expiry follows the Tokio clock so paused-time tests can drive it.
pub struct MemoryCoordinator {
    state: Mutex<MemoryState>,
    session: CancellationToken,
}

struct MemoryState {
    next_lease: LeaseId,
    leases: HashMap<LeaseId, MemoryLease>,
    endpoints: BTreeMap<String, Endpoint>,
    reachable: bool,
}

struct MemoryLease {
    ttl: Duration,
    expires_at: Instant,
    keys: HashSet<String>,
}

impl MemoryCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MemoryState {
                next_lease: 1,
                leases: HashMap::new(),
                endpoints: BTreeMap::new(),
                reachable: true,
            }),
            session: CancellationToken::new(),
        })
    }

    /// Simulate losing (or regaining) connectivity; while unreachable every
    /// call fails with [`CoordinationError::Unavailable`].
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut MemoryState) -> Result<T, CoordinationError>,
    ) -> Result<T, CoordinationError> {
        let mut state = self.state.lock();
        if !state.reachable {
            return Err(CoordinationError::Unavailable(
                "memory coordinator marked unreachable".into(),
            ));
        }
        state.purge_expired(Instant::now());
        f(&mut state)
    }
}

impl MemoryState {
    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.drop_lease(id);
        }
    }

    fn drop_lease(&mut self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };
        for key in lease.keys {
            self.endpoints.remove(&key);
        }
        true
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinator {
    async fn grant(&self, ttl: Duration) -> Result<Lease, CoordinationError> {
        self.with_state(|state| {
            let id = state.next_lease;
            state.next_lease += 1;
            state.leases.insert(
                id,
                MemoryLease {
                    ttl,
                    expires_at: Instant::now() + ttl,
                    keys: HashSet::new(),
                },
            );
            Ok(Lease { id, ttl })
        })
    }

    async fn refresh(&self, lease: LeaseId) -> Result<Option<Duration>, CoordinationError> {
        self.with_state(|state| {
            Ok(state.leases.get_mut(&lease).map(|entry| {
                entry.expires_at = Instant::now() + entry.ttl;
                entry.ttl
            }))
        })
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), CoordinationError> {
        self.with_state(|state| {
            if state.drop_lease(lease) {
                Ok(())
            } else {
                Err(CoordinationError::LeaseNotFound(lease))
            }
        })
    }

    async fn publish(
        &self,
        service: &str,
        addr: &str,
        lease: LeaseId,
    ) -> Result<(), CoordinationError> {
        self.with_state(|state| {
            if !state.leases.contains_key(&lease) {
                return Err(CoordinationError::LeaseNotFound(lease));
            }
            let endpoint = Endpoint {
                service: service.to_string(),
                addr: addr.to_string(),
                lease,
            };
            let key = endpoint.key();
            if let Some(previous) = state.endpoints.insert(key.clone(), endpoint) {
                if let Some(owner) = state.leases.get_mut(&previous.lease) {
                    owner.keys.remove(&key);
                }
            }
            if let Some(owner) = state.leases.get_mut(&lease) {
                owner.keys.insert(key);
            }
            Ok(())
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Endpoint>, CoordinationError> {
        self.with_state(|state| {
            Ok(state
                .endpoints
                .range(prefix.to_string()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(_, endpoint)| endpoint.clone())
                .collect())
        })
    }

    fn session(&self) -> CancellationToken {
        self.session.clone()
    }
}
