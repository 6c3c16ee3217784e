//! Request coalescing for cache misses.
//!
//! Every caller of [`Flight::run`] for a key that already has a computation in
//! flight waits for that computation's result instead of starting its own. The
//! record is dropped as soon as the result is published, so nothing is cached
//! here: the next caller after completion runs the computation again.

use std::collections::HashMap;
use std::future::Future;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::trace;

pub struct Flight<T> {
    calls: Mutex<HashMap<String, watch::Receiver<Option<T>>>>,
}

impl<T> Default for Flight<T> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> Flight<T>
where
    T: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `computation` for `key` unless another caller already is, in which
    /// case wait for and return that caller's result.
    ///
    /// The computation is awaited inline on the calling task. If the caller
    /// driving it is cancelled or the computation panics, waiters are released
    /// and one of them takes over with its own computation.
    pub async fn run<F, Fut>(&self, key: &str, computation: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        loop {
            let pending = {
                let mut calls = self.calls.lock();
                match calls.get(key) {
                    Some(receiver) => Ok(receiver.clone()),
                    None => {
                        let (sender, receiver) = watch::channel(None);
                        calls.insert(key.to_string(), receiver);
                        Err(sender)
                    }
                }
            };

            match pending {
                Ok(mut receiver) => {
                    trace!(key, "joining in-flight call");
                    let outcome = match receiver.wait_for(Option::is_some).await {
                        Ok(value) => value.clone(),
                        Err(_) => None,
                    };
                    match outcome {
                        Some(value) => return value,
                        None => {
                            trace!(key, "in-flight call abandoned; retrying");
                            continue;
                        }
                    }
                }
                Err(sender) => {
                    let call = InFlightCall {
                        calls: &self.calls,
                        key,
                        sender,
                    };
                    let value = computation().await;
                    call.complete(value.clone());
                    return value;
                }
            }
        }
    }

    /// Number of keys with a computation currently in flight.
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }
}

/// Leader-side handle for one key. Dropping it removes the record, and with it
/// the sender, so waiters wake even when the leader never completes.
struct InFlightCall<'a, T> {
    calls: &'a Mutex<HashMap<String, watch::Receiver<Option<T>>>>,
    key: &'a str,
    sender: watch::Sender<Option<T>>,
}

impl<T> InFlightCall<'_, T> {
    fn complete(self, value: T) {
        self.sender.send_replace(Some(value));
    }
}

impl<T> Drop for InFlightCall<'_, T> {
    fn drop(&mut self) {
        self.calls.lock().remove(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use test_timeout::tokio_timeout_test;
    use tokio::sync::oneshot;

    #[tokio_timeout_test(10, paused)]
    async fn concurrent_callers_share_one_execution() {
        let flight: Flight<Result<u32, String>> = Flight::new();
        let executions = AtomicUsize::new(0);

        let calls = (0..16).map(|_| {
            flight.run("Tom", || async {
                executions.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(630)
            })
        });
        let results = futures::future::join_all(calls).await;

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r == &Ok(630)));
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio_timeout_test(10, paused)]
    async fn errors_are_shared_but_not_kept() {
        let flight: Flight<Result<u32, String>> = Flight::new();
        let executions = AtomicUsize::new(0);

        let calls = (0..4).map(|_| {
            flight.run("Absent", || async {
                executions.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err::<u32, _>("Absent not exist".to_string())
            })
        });
        let results = futures::future::join_all(calls).await;
        assert!(results
            .iter()
            .all(|r| r == &Err("Absent not exist".to_string())));
        assert_eq!(executions.load(Ordering::SeqCst), 1);

        let retried = flight
            .run("Absent", || async {
                executions.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await;
        assert_eq!(retried, Ok(1));
        assert_eq!(executions.load(Ordering::SeqCst), 2);
    }

    #[tokio_timeout_test(10)]
    async fn completed_calls_are_not_cached() {
        let flight: Flight<u32> = Flight::new();
        let executions = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = flight
                .run("Jack", || async { executions.fetch_add(1, Ordering::SeqCst) as u32 })
                .await;
            assert_eq!(flight.in_flight(), 0);
            assert_eq!(value as usize + 1, executions.load(Ordering::SeqCst));
        }
        assert_eq!(executions.load(Ordering::SeqCst), 3);
    }

    #[tokio_timeout_test(10)]
    async fn distinct_keys_do_not_block_each_other() {
        let flight: Arc<Flight<&'static str>> = Arc::new(Flight::new());
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel::<()>();

        let slow = tokio::spawn({
            let flight = flight.clone();
            async move {
                flight
                    .run("slow", || async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        "slow"
                    })
                    .await
            }
        });
        started_rx.await.expect("slow call started");

        let fast = flight.run("fast", || async { "fast" }).await;
        assert_eq!(fast, "fast");
        assert_eq!(flight.in_flight(), 1);

        release_tx.send(()).expect("release slow call");
        assert_eq!(slow.await.expect("slow task"), "slow");
        assert_eq!(flight.in_flight(), 0);
    }

    fn flight_should_panic() -> bool {
        true
    }

    #[tokio_timeout_test(10, paused)]
    async fn panicking_leader_releases_waiters() {
        let flight: Arc<Flight<u32>> = Arc::new(Flight::new());

        let leader = tokio::spawn({
            let flight = flight.clone();
            async move {
                flight
                    .run("Sam", || async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        if flight_should_panic() {
                            panic!("backing source exploded");
                        }
                        0
                    })
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(flight.in_flight(), 1);

        let waiter = flight.run("Sam", || async { 567 }).await;
        assert_eq!(waiter, 567);
        assert!(leader.await.is_err());
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio_timeout_test(10, paused)]
    async fn cancelled_leader_releases_waiters() {
        let flight: Flight<u32> = Flight::new();

        let leader = tokio::time::timeout(
            Duration::from_millis(10),
            flight.run("Tom", || async {
                std::future::pending::<()>().await;
                0
            }),
        );
        let waiter = async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            flight.run("Tom", || async { 630 }).await
        };

        let (leader, waiter) = tokio::join!(leader, waiter);
        assert!(leader.is_err());
        assert_eq!(waiter, 630);
        assert_eq!(flight.in_flight(), 0);
    }
}
