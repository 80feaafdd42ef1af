//! Lease behavior across instances: expiry, heartbeat keep-alive, retrying
//! acquisition, and shutdown cleanup.

use std::sync::Arc;
use std::time::Duration;

use solana_mpc_crank::app::{AcquireOptions, LockService, LockServiceConfig};
use solana_mpc_crank::infra::store::SqliteStore;

async fn shared_store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::open_in_memory().await.unwrap())
}

fn service(store: &Arc<SqliteStore>, config: LockServiceConfig) -> Arc<LockService> {
    Arc::new(LockService::new(Arc::clone(store), config))
}

#[tokio::test]
async fn test_expired_lease_is_taken_over() {
    let store = shared_store().await;
    let first = service(&store, LockServiceConfig::default());
    let second = service(&store, LockServiceConfig::default());

    let handle = first
        .try_acquire("job", Some(Duration::from_secs(1)))
        .await
        .unwrap()
        .unwrap();
    assert!(second.try_acquire("job", None).await.unwrap().is_none());

    // Expiry comparison is strict, so wait past the full second
    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert!(second.try_acquire("job", None).await.unwrap().is_some());

    // The original holder finds out through its handle
    assert!(!handle.is_valid().await.unwrap());
    assert!(!handle.extend(None).await.unwrap());
}

#[tokio::test]
async fn test_heartbeat_keeps_short_lease_alive() {
    let store = shared_store().await;
    let holder = service(
        &store,
        LockServiceConfig {
            default_ttl: Duration::from_secs(1),
            heartbeat_interval: Duration::from_millis(200),
        },
    );
    let challenger = service(&store, LockServiceConfig::default());

    let handle = holder.try_acquire("job", None).await.unwrap().unwrap();
    holder.start_heartbeat();

    // Without the heartbeat the one-second lease would have expired
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(challenger.try_acquire("job", None).await.unwrap().is_none());
    assert!(handle.is_valid().await.unwrap());

    holder.shutdown().await;
    assert!(challenger.try_acquire("job", None).await.unwrap().is_some());
}

#[tokio::test]
async fn test_retrying_acquire_outlasts_short_holder() {
    let store = shared_store().await;
    let first = service(&store, LockServiceConfig::default());
    let second = service(&store, LockServiceConfig::default());

    let held = first.try_acquire("job", None).await.unwrap().unwrap();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        held.release().await.unwrap();
    });

    let handle = second
        .acquire(
            "job",
            AcquireOptions {
                retry: true,
                max_retries: 20,
                retry_delay: Duration::from_millis(100),
                ..AcquireOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(handle.is_some());
}

#[tokio::test]
async fn test_retrying_acquire_gives_up_after_budget() {
    let store = shared_store().await;
    let first = service(&store, LockServiceConfig::default());
    let second = service(&store, LockServiceConfig::default());

    let _held = first.try_acquire("job", None).await.unwrap().unwrap();

    let handle = second
        .acquire(
            "job",
            AcquireOptions {
                retry: true,
                max_retries: 2,
                retry_delay: Duration::from_millis(50),
                ..AcquireOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(handle.is_none());
}

#[tokio::test]
async fn test_different_lock_names_are_independent() {
    let store = shared_store().await;
    let first = service(&store, LockServiceConfig::default());
    let second = service(&store, LockServiceConfig::default());

    assert!(first.try_acquire("matching", None).await.unwrap().is_some());
    assert!(
        second
            .try_acquire("maintenance", None)
            .await
            .unwrap()
            .is_some()
    );

    assert_eq!(first.list_held_locks(), vec!["matching".to_string()]);
    assert!(second.holds_lock("maintenance"));
}
