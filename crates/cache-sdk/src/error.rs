use thiserror::Error;

use crate::coordination::CoordinationError;

/// Failure reported by a group's backing loader. Passed through to callers
/// untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("{0} not exist")]
    NotFound(String),
    #[error("source error: {0}")]
    Source(String),
}

/// No live peer could be reached for a service.
#[derive(Debug, Clone, Error)]
pub enum DiscoveryError {
    #[error("no reachable endpoint for {service} within {timeout_ms}ms")]
    Timeout { service: String, timeout_ms: u64 },
    #[error("discovery for {service} failed: {source}")]
    Coordination {
        service: String,
        #[source]
        source: CoordinationError,
    },
}

/// Uniform failure of a remote get. Transport errors and remote misses are
/// deliberately indistinguishable here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("could not get {group}/{key} from peer {peer}: {reason}")]
pub struct FetchError {
    pub group: String,
    pub key: String,
    pub peer: String,
    pub reason: String,
}

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("key is required")]
    InvalidKey,
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("peers already registered for group {0}")]
    PeersAlreadyRegistered(String),
}

pub type CacheResult<T> = Result<T, CacheError>;
