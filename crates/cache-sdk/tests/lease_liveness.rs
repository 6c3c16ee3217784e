use std::time::Duration;

use cache_sdk::coordination::{CoordinationStore, MemoryCoordinator};
use cache_sdk::lease::KeepAlive;
use test_timeout::tokio_timeout_test;
use tokio::time::Instant;

const SERVICE: &str = "beach-cache/127.0.0.1:9999";
const TTL: Duration = Duration::from_secs(5);

#[tokio_timeout_test(120, paused)]
async fn endpoint_stays_while_heartbeats_continue() {
    let store = MemoryCoordinator::new();
    let lease = store.grant(TTL).await.unwrap();
    store.publish(SERVICE, "127.0.0.1:9999", lease.id).await.unwrap();
    let _keep_alive = KeepAlive::spawn(store.clone(), lease);

    for _ in 0..6 {
        tokio::time::sleep(TTL).await;
        assert_eq!(store.endpoints(SERVICE).await.unwrap().len(), 1);
    }
}

#[tokio_timeout_test(60, paused)]
async fn endpoint_disappears_within_ttl_once_heartbeats_stop() {
    let store = MemoryCoordinator::new();
    let lease = store.grant(TTL).await.unwrap();
    store.publish(SERVICE, "127.0.0.1:9999", lease.id).await.unwrap();
    let mut keep_alive = KeepAlive::spawn(store.clone(), lease);

    tokio::time::sleep(Duration::from_secs(12)).await;
    keep_alive.recv().await.expect("renewals are flowing");
    drop(keep_alive);
    let stopped = Instant::now();

    while !store.endpoints(SERVICE).await.unwrap().is_empty() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let gone_after = stopped.elapsed();
    assert!(
        gone_after <= TTL + Duration::from_millis(200),
        "endpoint outlived its lease by {gone_after:?}"
    );
}
