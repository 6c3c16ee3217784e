//! Automatic lease renewal.
//!
//! [`KeepAlive::spawn`] renews a lease every third of its TTL and yields one
//! [`LeaseKeepAlive`] per successful renewal. The stream ends when the lease is
//! gone, when the store could not be reached for a full TTL, or when the
//! store session ends; in the first two cases the lease has lapsed (or is
//! about to) and whatever was published under it is no longer visible.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::coordination::{CoordinationStore, Lease, LeaseId};

const ACK_BUFFER: usize = 16;
const MIN_RENEW_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseKeepAlive {
    pub lease: LeaseId,
    pub ttl: Duration,
}

pub struct KeepAlive {
    receiver: mpsc::Receiver<LeaseKeepAlive>,
    task: JoinHandle<()>,
}

impl KeepAlive {
    pub fn spawn(store: Arc<dyn CoordinationStore>, lease: Lease) -> Self {
        let (sender, receiver) = mpsc::channel(ACK_BUFFER);
        let task = tokio::spawn(renew_loop(store, lease, sender));
        Self { receiver, task }
    }

    /// Next renewal ack; `None` once renewal has stopped for good.
    pub async fn recv(&mut self) -> Option<LeaseKeepAlive> {
        self.receiver.recv().await
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn renew_period(ttl: Duration) -> Duration {
    (ttl / 3).max(MIN_RENEW_PERIOD)
}

async fn renew_loop(
    store: Arc<dyn CoordinationStore>,
    lease: Lease,
    sender: mpsc::Sender<LeaseKeepAlive>,
) {
    let session = store.session();
    let period = renew_period(lease.ttl);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_renewed = Instant::now();

    loop {
        tokio::select! {
            _ = session.cancelled() => {
                debug!(lease = lease.id, "store session closed; stopping lease renewal");
                return;
            }
            _ = sender.closed() => return,
            _ = ticker.tick() => {}
        }

        let outcome = match tokio::time::timeout(period, store.refresh(lease.id)).await {
            Ok(outcome) => outcome.map_err(|err| err.to_string()),
            Err(_) => Err(format!("renewal timed out after {}ms", period.as_millis())),
        };

        match outcome {
            Ok(Some(ttl)) => {
                last_renewed = Instant::now();
                let ack = LeaseKeepAlive {
                    lease: lease.id,
                    ttl,
                };
                // Acks are informational; a slow reader must not stall renewal.
                if let Err(mpsc::error::TrySendError::Closed(_)) = sender.try_send(ack) {
                    return;
                }
            }
            Ok(None) => {
                warn!(lease = lease.id, "lease expired before it could be renewed");
                return;
            }
            Err(reason) => {
                let unrenewed = last_renewed.elapsed();
                if unrenewed >= lease.ttl {
                    warn!(
                        lease = lease.id,
                        error = %reason,
                        unrenewed_ms = unrenewed.as_millis() as u64,
                        "lease not renewed within its ttl; giving up"
                    );
                    return;
                }
                debug!(lease = lease.id, error = %reason, "lease renewal failed; will retry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordinator;
    use test_timeout::tokio_timeout_test;

    #[tokio_timeout_test(10, paused)]
    async fn acks_arrive_while_store_is_reachable() {
        let store = MemoryCoordinator::new();
        let lease = store.grant(Duration::from_secs(3)).await.unwrap();
        let mut keep_alive = KeepAlive::spawn(store.clone(), lease);

        for _ in 0..3 {
            let ack = keep_alive.recv().await.expect("ack");
            assert_eq!(ack.lease, lease.id);
            assert_eq!(ack.ttl, lease.ttl);
        }
    }

    #[tokio_timeout_test(30, paused)]
    async fn stream_closes_after_a_ttl_without_renewal() {
        let store = MemoryCoordinator::new();
        let lease = store.grant(Duration::from_secs(3)).await.unwrap();
        let mut keep_alive = KeepAlive::spawn(store.clone(), lease);
        keep_alive.recv().await.expect("first ack");

        store.set_reachable(false);
        let started = Instant::now();
        while keep_alive.recv().await.is_some() {}
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2), "closed too early: {elapsed:?}");
        assert!(elapsed <= Duration::from_secs(5), "closed too late: {elapsed:?}");
    }

    #[tokio_timeout_test(10, paused)]
    async fn stream_closes_when_lease_is_revoked() {
        let store = MemoryCoordinator::new();
        let lease = store.grant(Duration::from_secs(3)).await.unwrap();
        let mut keep_alive = KeepAlive::spawn(store.clone(), lease);
        keep_alive.recv().await.expect("first ack");

        store.revoke(lease.id).await.unwrap();
        while keep_alive.recv().await.is_some() {}
    }

    #[tokio_timeout_test(10, paused)]
    async fn stream_closes_with_the_session() {
        let store = MemoryCoordinator::new();
        let lease = store.grant(Duration::from_secs(3)).await.unwrap();
        let mut keep_alive = KeepAlive::spawn(store.clone(), lease);
        keep_alive.recv().await.expect("first ack");

        store.close();
        while keep_alive.recv().await.is_some() {}
    }
}
