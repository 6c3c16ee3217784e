use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cache_sdk::group::Fetcher;
use cache_sdk::{CacheError, DiscoveryError, FetchError};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::discovery::{PeerChannel, PeerResolver};
use crate::metrics;
use crate::protocol::{ErrorResponse, GetRequest, GetResponse, PEER_GET_PATH};

/// Ask the peer behind `channel` for `group`/`key`, bounded by `timeout`.
///
/// Every failure (deadline, transport, non-2xx status, bad body) comes back
/// as the same [`FetchError`]; a remote miss looks exactly like an outage.
pub async fn fetch(
    channel: &PeerChannel,
    group: &str,
    key: &str,
    timeout: Duration,
) -> Result<Bytes, FetchError> {
    let outcome = match tokio::time::timeout(timeout, exchange(channel, group, key)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
    };
    match outcome {
        Ok(value) => {
            metrics::REMOTE_FETCHES.with_label_values(&["ok"]).inc();
            Ok(value)
        }
        Err(reason) => {
            metrics::REMOTE_FETCHES.with_label_values(&["error"]).inc();
            let err = FetchError {
                group: group.to_string(),
                key: key.to_string(),
                peer: channel.service().to_string(),
                reason,
            };
            debug!(addr = channel.addr(), error = %err, "remote get failed");
            Err(err)
        }
    }
}

async fn exchange(channel: &PeerChannel, group: &str, key: &str) -> Result<Bytes, String> {
    let request = GetRequest {
        group: group.to_string(),
        key: key.to_string(),
    };
    let res = channel
        .http()
        .post(channel.url(PEER_GET_PATH))
        .json(&request)
        .send()
        .await
        .map_err(|err| format!("request failed: {err}"))?;

    let status = res.status();
    if !status.is_success() {
        let detail = match res.json::<ErrorResponse>().await {
            Ok(body) => body.error,
            Err(_) => String::from("no error detail"),
        };
        return Err(format!("status {status}: {detail}"));
    }

    let body: GetResponse = res
        .json()
        .await
        .map_err(|err| format!("invalid response body: {err}"))?;
    body.decode()
        .map_err(|err| format!("invalid value encoding: {err}"))
}

/// [`Fetcher`] for one peer. The resolved channel is kept across calls and
/// dropped after a failed fetch, so the next call resolves the service again.
pub struct PeerClient {
    service: String,
    resolver: PeerResolver,
    fetch_timeout: Duration,
    channel: Mutex<Option<PeerChannel>>,
}

impl PeerClient {
    pub fn new(service: impl Into<String>, resolver: PeerResolver, fetch_timeout: Duration) -> Self {
        Self {
            service: service.into(),
            resolver,
            fetch_timeout,
            channel: Mutex::new(None),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    async fn channel(&self) -> Result<PeerChannel, DiscoveryError> {
        if let Some(channel) = self.channel.lock().clone() {
            return Ok(channel);
        }
        let channel = self.resolver.resolve(&self.service).await?;
        *self.channel.lock() = Some(channel.clone());
        Ok(channel)
    }

    fn forget(&self, failed: &PeerChannel) {
        let mut cached = self.channel.lock();
        // A concurrent call may already have replaced it.
        if cached.as_ref().is_some_and(|channel| channel.addr() == failed.addr()) {
            *cached = None;
        }
    }
}

#[async_trait]
impl Fetcher for PeerClient {
    async fn fetch(&self, group: &str, key: &str) -> Result<Bytes, CacheError> {
        let channel = self.channel().await.map_err(|err| {
            metrics::REMOTE_FETCHES
                .with_label_values(&["unresolved"])
                .inc();
            warn!(group, key, peer = %self.service, error = %err, "owning peer unreachable");
            err
        })?;
        fetch(&channel, group, key, self.fetch_timeout)
            .await
            .map_err(|err| {
                self.forget(&channel);
                err.into()
            })
    }
}
