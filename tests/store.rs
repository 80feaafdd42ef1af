//! Ledger semantics: idempotent inserts, conditional claims, retry
//! bookkeeping, replay suppression, and retention.

use chrono::{Duration as ChronoDuration, Utc};
use solana_mpc_crank::domain::{
    OperationStatus, OperationType, RequestStatus, RequestType, TxStatus, operation_key,
};
use solana_mpc_crank::infra::store::SqliteStore;
use solana_sdk::pubkey::Pubkey;

async fn store() -> SqliteStore {
    SqliteStore::open_in_memory().await.unwrap()
}

fn key() -> String {
    operation_key(OperationType::Match, &[&Pubkey::new_unique()])
}

#[tokio::test]
async fn test_same_operation_key_inserts_once() {
    let store = store().await;
    let key = key();

    assert!(
        store
            .insert_operation_if_absent(&key, OperationType::Match, None, 3)
            .await
            .unwrap()
    );
    assert!(
        !store
            .insert_operation_if_absent(&key, OperationType::Match, None, 3)
            .await
            .unwrap()
    );

    let operation = store.get_operation(&key).await.unwrap().unwrap();
    assert_eq!(operation.status, OperationStatus::Pending);
    assert_eq!(operation.retry_count, 0);
}

#[tokio::test]
async fn test_claim_is_exclusive_until_stale() {
    let store = store().await;
    let key = key();
    store
        .insert_operation_if_absent(&key, OperationType::Match, None, 3)
        .await
        .unwrap();

    assert!(store.claim_operation(&key, "instance-a", 120).await.unwrap());
    // A fresh claim blocks every other claimant
    assert!(!store.claim_operation(&key, "instance-b", 120).await.unwrap());
    // With a zero staleness window the same row is immediately re-claimable,
    // which is exactly the crash-recovery path
    assert!(store.claim_operation(&key, "instance-b", -1).await.unwrap());

    let operation = store.get_operation(&key).await.unwrap().unwrap();
    assert_eq!(operation.locked_by.as_deref(), Some("instance-b"));
}

#[tokio::test]
async fn test_completion_records_history_atomically() {
    let store = store().await;
    let key = key();
    store
        .insert_operation_if_absent(&key, OperationType::Match, None, 3)
        .await
        .unwrap();
    assert!(store.claim_operation(&key, "instance-a", 120).await.unwrap());

    store
        .complete_operation(&key, OperationType::Match, "sig-1", Some(42))
        .await
        .unwrap();

    let operation = store.get_operation(&key).await.unwrap().unwrap();
    assert_eq!(operation.status, OperationStatus::Completed);
    assert!(operation.locked_by.is_none());

    let record = store.get_transaction("sig-1").await.unwrap().unwrap();
    assert_eq!(record.status, TxStatus::Confirmed);
    assert_eq!(record.operation_key.as_deref(), Some(&*key));
    assert_eq!(record.slot, Some(42));
}

#[tokio::test]
async fn test_retry_budget_flips_to_failed_at_limit() {
    let store = store().await;
    let key = key();
    store
        .insert_operation_if_absent(&key, OperationType::Match, None, 2)
        .await
        .unwrap();

    assert!(store.claim_operation(&key, "a", 120).await.unwrap());
    let after_first = store.record_operation_failure(&key, "timeout").await.unwrap();
    assert_eq!(after_first.status, OperationStatus::Pending);
    assert_eq!(after_first.retry_count, 1);

    assert!(store.claim_operation(&key, "a", 120).await.unwrap());
    let after_second = store.record_operation_failure(&key, "timeout").await.unwrap();
    assert_eq!(after_second.status, OperationStatus::Failed);
    assert_eq!(after_second.retry_count, 2);
    assert_eq!(after_second.last_error.as_deref(), Some("timeout"));

    // Exhausted rows can no longer be claimed
    assert!(!store.claim_operation(&key, "b", -1).await.unwrap());
}

#[tokio::test]
async fn test_request_replay_is_suppressed() {
    let store = store().await;

    let first = store
        .mark_request_processed(
            "req-1",
            RequestType::Computation,
            RequestStatus::Processed,
            Some("match"),
            Some("sig-1"),
            None,
        )
        .await
        .unwrap();
    assert!(first);
    assert!(store.is_request_processed("req-1").await.unwrap());

    // Replay keeps the original record untouched
    let replay = store
        .mark_request_processed(
            "req-1",
            RequestType::Computation,
            RequestStatus::Failed,
            None,
            None,
            Some("should not overwrite"),
        )
        .await
        .unwrap();
    assert!(!replay);

    let record = store.get_processed_request("req-1").await.unwrap().unwrap();
    assert_eq!(record.status, RequestStatus::Processed);
    assert_eq!(record.tx_signature.as_deref(), Some("sig-1"));
}

#[tokio::test]
async fn test_transaction_status_updates_in_place() {
    let store = store().await;
    store
        .record_transaction("sig-9", OperationType::LiquidationCheck, None)
        .await
        .unwrap();

    assert!(
        store
            .update_transaction_status("sig-9", TxStatus::Failed, Some("blockhash expired"), None)
            .await
            .unwrap()
    );
    let record = store.get_transaction("sig-9").await.unwrap().unwrap();
    assert_eq!(record.status, TxStatus::Failed);
    assert_eq!(record.error_message.as_deref(), Some("blockhash expired"));

    assert!(
        !store
            .update_transaction_status("missing", TxStatus::Failed, None, None)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_purges_only_touch_finished_rows() {
    let store = store().await;
    let finished = key();
    let live = key();

    store
        .insert_operation_if_absent(&finished, OperationType::Match, None, 3)
        .await
        .unwrap();
    store.claim_operation(&finished, "a", 120).await.unwrap();
    store
        .complete_operation(&finished, OperationType::Match, "sig-f", None)
        .await
        .unwrap();
    store
        .insert_operation_if_absent(&live, OperationType::Match, None, 3)
        .await
        .unwrap();

    // Cutoff in the future: everything finished is old enough
    let cutoff = Utc::now() + ChronoDuration::hours(1);
    assert_eq!(store.purge_finished_operations(cutoff).await.unwrap(), 1);
    assert_eq!(store.purge_transaction_history(cutoff).await.unwrap(), 1);

    assert!(store.get_operation(&finished).await.unwrap().is_none());
    assert!(store.get_operation(&live).await.unwrap().is_some());
}

#[tokio::test]
async fn test_reset_stuck_operations_scoped_by_type() {
    let store = store().await;
    let match_key = key();
    let margin_key = operation_key(OperationType::MarginUpdate, &[&Pubkey::new_unique()]);

    for (op_key, op_type) in [
        (&match_key, OperationType::Match),
        (&margin_key, OperationType::MarginUpdate),
    ] {
        store
            .insert_operation_if_absent(op_key, op_type, None, 3)
            .await
            .unwrap();
        assert!(store.claim_operation(op_key, "dead-instance", 120).await.unwrap());
    }

    let reset = store
        .reset_stuck_operations(OperationType::Match, -1)
        .await
        .unwrap();
    assert_eq!(reset, 1);

    let match_op = store.get_operation(&match_key).await.unwrap().unwrap();
    assert_eq!(match_op.status, OperationStatus::Pending);
    let margin_op = store.get_operation(&margin_key).await.unwrap().unwrap();
    assert_eq!(margin_op.status, OperationStatus::InProgress);
}
