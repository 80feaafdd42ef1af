//! End-to-end processor flow over mocked chain collaborators: discovery,
//! claim, submission, retry exhaustion, and crank lifecycle.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use solana_mpc_crank::app::jobs::{JobContext, MarginJob};
use solana_mpc_crank::app::{
    CrankConfig, CrankService, JobFamily, LockService, LockServiceConfig, PollProcessor,
    ProcessorConfig,
};
use solana_mpc_crank::domain::{
    AppError, ChainError, MpcTrigger, OperationStatus, OperationType, TxStatus, operation_key,
};
use solana_mpc_crank::infra::chain::{EndpointConfig, FailoverConfig, FailoverManager};
use solana_mpc_crank::infra::store::SqliteStore;
use solana_mpc_crank::test_utils::{MockChainClient, MockMpcTrigger};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;

/// Borsh-compatible confidential position bytes behind the account
/// discriminator, with an encrypted tail the crank must ignore.
fn position_account(status: u8, pending_request: [u8; 32]) -> Vec<u8> {
    let mut data = Sha256::digest(b"account:ConfidentialPosition")[..8].to_vec();
    data.extend_from_slice(&[1u8; 32]); // trader
    data.extend_from_slice(&[2u8; 32]); // market
    data.extend_from_slice(&[3u8; 16]); // position id
    data.push(0); // side: long
    data.push(status);
    data.push(1); // threshold_verified
    data.extend_from_slice(&pending_request);
    data.extend_from_slice(&[9u8; 64]); // encrypted fields
    data
}

struct Harness {
    store: Arc<SqliteStore>,
    chain: Arc<FailoverManager>,
    mock: Arc<MockChainClient>,
    trigger: Arc<MockMpcTrigger>,
    processor: Arc<PollProcessor>,
}

async fn margin_harness() -> Harness {
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    let locks = Arc::new(LockService::new(
        Arc::clone(&store),
        LockServiceConfig::default(),
    ));
    let mock = Arc::new(MockChainClient::healthy());
    let client = Arc::clone(&mock);
    let chain = Arc::new(
        FailoverManager::new(
            vec![EndpointConfig::new("mock://primary", 10)],
            FailoverConfig::default(),
            Box::new(move |_url| client.clone()),
        )
        .unwrap(),
    );
    let trigger = Arc::new(MockMpcTrigger::default());
    let ctx = JobContext::new(
        Pubkey::new_unique(),
        Arc::new(Keypair::new()),
        trigger.clone() as Arc<dyn MpcTrigger>,
        Arc::clone(&store),
    );
    let family: Arc<dyn JobFamily> = Arc::new(MarginJob::new(ctx));
    let processor = Arc::new(PollProcessor::new(
        family,
        Arc::clone(&store),
        Arc::clone(&chain),
        locks,
        ProcessorConfig {
            poll_interval: Duration::from_millis(50),
            ..ProcessorConfig::default()
        },
    ));

    Harness {
        store,
        chain,
        mock,
        trigger,
        processor,
    }
}

#[tokio::test]
async fn test_only_eligible_positions_are_processed() {
    let harness = margin_harness().await;
    let eligible_a = Pubkey::new_unique();
    let no_request = Pubkey::new_unique();
    let eligible_c = Pubkey::new_unique();

    harness.mock.set_accounts(vec![
        (eligible_a, position_account(0, [7u8; 32])),
        (no_request, position_account(0, [0u8; 32])),
        (eligible_c, position_account(0, [8u8; 32])),
    ]);

    harness.processor.start().await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    harness.processor.stop().await;

    for (position, request) in [(eligible_a, [7u8; 32]), (eligible_c, [8u8; 32])] {
        let key = operation_key(
            OperationType::MarginUpdate,
            &[&position, &Pubkey::new_from_array(request)],
        );
        let operation = harness.store.get_operation(&key).await.unwrap().unwrap();
        assert_eq!(operation.status, OperationStatus::Completed);
    }

    // One submission each despite many poll cycles, and none for the
    // position without a pending request
    assert_eq!(harness.mock.submit_calls(), 2);
    let mut calls = harness.trigger.calls();
    calls.sort();
    let mut expected = vec![format!("margin:{eligible_a}"), format!("margin:{eligible_c}")];
    expected.sort();
    assert_eq!(calls, expected);

    let status = harness.processor.status();
    assert_eq!(status.processing_count, 0);
    assert_eq!(status.failed_count, 0);
}

#[tokio::test]
async fn test_transient_failures_retry_then_give_up() {
    let harness = margin_harness().await;
    let position = Pubkey::new_unique();
    harness
        .mock
        .set_accounts(vec![(position, position_account(0, [7u8; 32]))]);

    // Each ledger attempt burns the connection wrapper's three tries, so
    // nine scripted errors exhaust the three-attempt retry budget
    for _ in 0..9 {
        harness.mock.push_submit_error(AppError::Chain(ChainError::Timeout(
            "mock timeout".to_string(),
        )));
    }

    harness.processor.start().await;
    tokio::time::sleep(Duration::from_millis(700)).await;
    harness.processor.stop().await;

    let key = operation_key(
        OperationType::MarginUpdate,
        &[&position, &Pubkey::new_from_array([7u8; 32])],
    );
    let operation = harness.store.get_operation(&key).await.unwrap().unwrap();
    assert_eq!(operation.status, OperationStatus::Failed);
    assert_eq!(operation.retry_count, 3);
    // Budget spent: no further submissions even though polling continued
    assert_eq!(harness.mock.submit_calls(), 9);
    assert_eq!(harness.processor.status().failed_count, 1);
}

#[tokio::test]
async fn test_crank_lifecycle_is_idempotent() {
    let harness = margin_harness().await;
    let locks = Arc::new(LockService::new(
        Arc::clone(&harness.store),
        LockServiceConfig::default(),
    ));
    let crank = CrankService::new(
        Arc::clone(&harness.store),
        Arc::clone(&harness.chain),
        locks,
        vec![Arc::clone(&harness.processor)],
        CrankConfig::default(),
    );

    crank.start().await.unwrap();
    crank.start().await.unwrap();
    let status = crank.status();
    assert!(status.running);
    assert_eq!(status.processors.len(), 1);
    assert!(status.processors[0].is_polling);

    crank.pause();
    assert!(crank.status().paused);
    crank.resume();
    assert!(!crank.status().paused);

    crank.stop().await;
    crank.stop().await;
    let status = crank.status();
    assert!(!status.running);
    assert!(!status.processors[0].is_polling);
}

#[tokio::test]
async fn test_transaction_history_tracks_submission_outcomes() {
    let harness = margin_harness().await;
    let position = Pubkey::new_unique();
    harness
        .mock
        .set_accounts(vec![(position, position_account(0, [7u8; 32]))]);
    harness.mock.push_submit_error(AppError::Chain(ChainError::Timeout(
        "mock timeout".to_string(),
    )));

    harness.processor.start().await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    harness.processor.stop().await;

    let key = operation_key(
        OperationType::MarginUpdate,
        &[&position, &Pubkey::new_from_array([7u8; 32])],
    );
    let operation = harness.store.get_operation(&key).await.unwrap().unwrap();
    assert_eq!(operation.status, OperationStatus::Completed);

    // The failed first attempt and the confirmed second one both left a row
    let history = harness
        .store
        .get_transactions_for_operation(&key)
        .await
        .unwrap();
    let statuses: Vec<TxStatus> = history.iter().map(|tx| tx.status).collect();
    assert!(statuses.contains(&TxStatus::Failed));
    assert!(statuses.contains(&TxStatus::Confirmed));

    let failed = history
        .iter()
        .find(|tx| tx.status == TxStatus::Failed)
        .unwrap();
    assert!(failed.error_message.is_some());
}

#[tokio::test]
async fn test_crank_restart_keeps_lock_service_alive() {
    let harness = margin_harness().await;
    let locks = Arc::new(LockService::new(
        Arc::clone(&harness.store),
        LockServiceConfig::default(),
    ));
    let crank = CrankService::new(
        Arc::clone(&harness.store),
        Arc::clone(&harness.chain),
        Arc::clone(&locks),
        vec![Arc::clone(&harness.processor)],
        CrankConfig::default(),
    );

    crank.start().await.unwrap();
    crank.stop().await;
    crank.start().await.unwrap();
    assert!(crank.status().running);

    // Leases must still be grantable after a stop/start round trip
    let handle = locks.try_acquire("restart-check", None).await.unwrap();
    assert!(handle.is_some());
    handle.unwrap().release().await.unwrap();

    crank.shutdown().await;
    assert!(!crank.status().running);
    assert!(locks.try_acquire("post-exit", None).await.unwrap().is_none());
}

#[tokio::test]
async fn test_clear_stuck_operations_revives_failed_work() {
    let harness = margin_harness().await;
    let position = Pubkey::new_unique();
    harness
        .mock
        .set_accounts(vec![(position, position_account(0, [7u8; 32]))]);
    for _ in 0..9 {
        harness.mock.push_submit_error(AppError::Chain(ChainError::Timeout(
            "mock timeout".to_string(),
        )));
    }

    harness.processor.start().await;
    tokio::time::sleep(Duration::from_millis(700)).await;
    harness.processor.stop().await;
    assert_eq!(harness.processor.status().failed_count, 1);

    let locks = Arc::new(LockService::new(
        Arc::clone(&harness.store),
        LockServiceConfig::default(),
    ));
    let crank = CrankService::new(
        Arc::clone(&harness.store),
        Arc::clone(&harness.chain),
        locks,
        vec![Arc::clone(&harness.processor)],
        CrankConfig::default(),
    );
    crank
        .clear_stuck_operations(OperationType::MarginUpdate, Duration::from_secs(0))
        .await
        .unwrap();

    assert_eq!(harness.processor.status().failed_count, 0);
}
