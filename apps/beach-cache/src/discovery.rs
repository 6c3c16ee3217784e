use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cache_sdk::coordination::CoordinationStore;
use cache_sdk::DiscoveryError;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::config::peer_id;

const REDIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Where a resolver reads the live addresses of a service from.
#[derive(Clone)]
pub enum AddressSource {
    /// Endpoints currently published in the coordination store.
    Coordinated(Arc<dyn CoordinationStore>),
    /// Fixed bootstrap book of service name -> addresses.
    Static(Arc<BTreeMap<String, Vec<String>>>),
}

impl AddressSource {
    /// Static book with one `<prefix>/<addr>` service per address.
    pub fn fixed<I, S>(service_prefix: &str, addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let book = addrs
            .into_iter()
            .map(|addr| {
                let addr = addr.into();
                (peer_id(service_prefix, &addr), vec![addr])
            })
            .collect();
        Self::Static(Arc::new(book))
    }

    async fn addresses(&self, service: &str) -> Result<Vec<String>, DiscoveryError> {
        match self {
            Self::Coordinated(store) => store
                .endpoints(service)
                .await
                .map(|endpoints| endpoints.into_iter().map(|e| e.addr).collect())
                .map_err(|source| DiscoveryError::Coordination {
                    service: service.to_string(),
                    source,
                }),
            Self::Static(book) => Ok(book.get(service).cloned().unwrap_or_default()),
        }
    }
}

/// A dialed peer. Cheap to clone and reusable across requests; connections
/// are pooled by the shared HTTP client.
#[derive(Clone, Debug)]
pub struct PeerChannel {
    service: String,
    addr: String,
    http: reqwest::Client,
}

impl PeerChannel {
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }
}

/// Turns a service name into a live [`PeerChannel`].
#[derive(Clone)]
pub struct PeerResolver {
    source: AddressSource,
    http: reqwest::Client,
    dial_timeout: Duration,
    next: Arc<AtomicUsize>,
}

impl PeerResolver {
    pub fn new(source: AddressSource, dial_timeout: Duration) -> Self {
        Self {
            source,
            http: reqwest::Client::new(),
            dial_timeout,
            next: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Dial an instance of `service`, trying endpoints round-robin until one
    /// accepts a connection or the dial timeout elapses.
    pub async fn resolve(&self, service: &str) -> Result<PeerChannel, DiscoveryError> {
        let addr = tokio::time::timeout(self.dial_timeout, self.dial_any(service))
            .await
            .map_err(|_| DiscoveryError::Timeout {
                service: service.to_string(),
                timeout_ms: self.dial_timeout.as_millis() as u64,
            })??;
        debug!(service, addr = %addr, "resolved peer");
        Ok(PeerChannel {
            service: service.to_string(),
            addr,
            http: self.http.clone(),
        })
    }

    async fn dial_any(&self, service: &str) -> Result<String, DiscoveryError> {
        loop {
            let addrs = self.source.addresses(service).await?;
            if !addrs.is_empty() {
                let start = self.next.fetch_add(1, Ordering::Relaxed);
                for offset in 0..addrs.len() {
                    let addr = &addrs[(start + offset) % addrs.len()];
                    match TcpStream::connect(addr.as_str()).await {
                        Ok(_) => return Ok(addr.clone()),
                        Err(err) => trace!(service, addr = %addr, error = %err, "dial failed"),
                    }
                }
            }
            tokio::time::sleep(REDIAL_BACKOFF).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache_sdk::coordination::MemoryCoordinator;
    use test_timeout::tokio_timeout_test;
    use tokio::net::TcpListener;

    #[tokio_timeout_test(10)]
    async fn static_book_resolves_listening_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let resolver = PeerResolver::new(
            AddressSource::fixed("beach-cache", [addr.clone()]),
            Duration::from_secs(2),
        );

        let channel = resolver
            .resolve(&format!("beach-cache/{addr}"))
            .await
            .unwrap();
        assert_eq!(channel.addr(), addr);
        assert_eq!(channel.url("/peer/get"), format!("http://{addr}/peer/get"));
    }

    #[tokio_timeout_test(10)]
    async fn unknown_service_times_out() {
        let resolver = PeerResolver::new(
            AddressSource::fixed("beach-cache", Vec::<String>::new()),
            Duration::from_millis(250),
        );
        match resolver.resolve("beach-cache/10.0.0.9:9999").await {
            Err(DiscoveryError::Timeout { service, timeout_ms }) => {
                assert_eq!(service, "beach-cache/10.0.0.9:9999");
                assert_eq!(timeout_ms, 250);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio_timeout_test(10)]
    async fn coordinated_source_reports_store_failures() {
        let store = MemoryCoordinator::new();
        store.set_reachable(false);
        let resolver = PeerResolver::new(
            AddressSource::Coordinated(store),
            Duration::from_secs(1),
        );
        assert!(matches!(
            resolver.resolve("beach-cache/127.0.0.1:1").await,
            Err(DiscoveryError::Coordination { .. })
        ));
    }

    #[tokio_timeout_test(10)]
    async fn coordinated_source_skips_dead_endpoints() {
        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_addr = live.local_addr().unwrap().to_string();
        let dead_addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };

        let store = MemoryCoordinator::new();
        let lease = store.grant(Duration::from_secs(30)).await.unwrap();
        store.publish("svc", &dead_addr, lease.id).await.unwrap();
        store.publish("svc", &live_addr, lease.id).await.unwrap();

        let resolver = PeerResolver::new(
            AddressSource::Coordinated(store),
            Duration::from_secs(2),
        );
        for _ in 0..3 {
            assert_eq!(resolver.resolve("svc").await.unwrap().addr(), live_addr);
        }
    }
}
