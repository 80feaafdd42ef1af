//! Generic polling job processor.
//!
//! Each job family describes how to discover eligible work on chain and how
//! to submit one unit of it; the processor owns everything else: the poll
//! loop, claim and retry bookkeeping in the operation ledger, bounded
//! submission concurrency, and the optional event subscription. Events are
//! hints that wake an extra cycle early; polling remains the source of
//! truth, so a missed event is only latency, never lost work.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use solana_sdk::{pubkey::Pubkey, signature::Signature};
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::app::lock::{AcquireOptions, LockService};
use crate::domain::{
    AppError, ErrorKind, LogEvent, OperationStatus, OperationType, ProcessorStatus, RequestStatus,
    RequestType, WorkItem,
};
use crate::infra::chain::FailoverManager;
use crate::infra::store::SqliteStore;

/// One family of crank work: what to look for, and how to act on it.
#[async_trait]
pub trait JobFamily: Send + Sync + 'static {
    /// Stable processor name for logs and status
    fn name(&self) -> &'static str;

    /// Ledger category this family's operations are recorded under
    fn operation_type(&self) -> OperationType;

    /// Lock this family's cycles must run under, if the work is not safe to
    /// discover concurrently across the fleet
    fn lock_name(&self) -> Option<&'static str> {
        None
    }

    /// Program whose log stream should wake this processor early
    fn event_program(&self) -> Option<Pubkey> {
        None
    }

    /// Discover currently eligible work on chain
    async fn fetch_candidates(&self, chain: &FailoverManager) -> Result<Vec<WorkItem>, AppError>;

    /// Submit one unit of work and wait for confirmation
    async fn submit(&self, chain: &FailoverManager, item: &WorkItem)
    -> Result<Signature, AppError>;
}

/// Processor configuration
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub poll_interval: Duration,
    /// Age after which another instance may re-claim an in-progress row
    pub stale_claim_after: Duration,
    /// Concurrent submissions per cycle
    pub max_concurrent: usize,
    /// Retry budget persisted per operation
    pub max_retries: i64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            stale_claim_after: Duration::from_secs(120),
            max_concurrent: 5,
            max_retries: 3,
        }
    }
}

/// Drives one [`JobFamily`] on a poll loop.
///
/// Cycles are strictly sequential: the loop runs one cycle to completion
/// before selecting again, so overlapping discovery within one instance is
/// impossible by construction. Cross-instance overlap is handled by the
/// ledger's conditional claims, not by anything in memory.
pub struct PollProcessor {
    family: Arc<dyn JobFamily>,
    store: Arc<SqliteStore>,
    chain: Arc<FailoverManager>,
    locks: Arc<LockService>,
    config: ProcessorConfig,
    /// Claimant identity written into the ledger, shared with the lock owner
    instance_id: String,
    is_polling: AtomicBool,
    paused: AtomicBool,
    /// Keys currently being submitted by this instance
    processing: DashMap<String, ()>,
    /// Keys that exhausted their budget or were rejected; skipped until
    /// an operator clears them
    failed: DashMap<String, ()>,
    stop: std::sync::Mutex<Option<watch::Sender<bool>>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PollProcessor {
    #[must_use]
    pub fn new(
        family: Arc<dyn JobFamily>,
        store: Arc<SqliteStore>,
        chain: Arc<FailoverManager>,
        locks: Arc<LockService>,
        config: ProcessorConfig,
    ) -> Self {
        let instance_id = locks.owner_id().to_string();
        Self {
            family,
            store,
            chain,
            locks,
            config,
            instance_id,
            is_polling: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            processing: DashMap::new(),
            failed: DashMap::new(),
            stop: std::sync::Mutex::new(None),
            task: tokio::sync::Mutex::new(None),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.family.name()
    }

    #[must_use]
    pub fn operation_type(&self) -> OperationType {
        self.family.operation_type()
    }

    /// Start the poll loop. Idempotent: calling while running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut task_guard = self.task.lock().await;
        if task_guard.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        *self.stop.lock().expect("stop state poisoned") = Some(stop_tx);
        self.is_polling.store(true, Ordering::SeqCst);

        let processor = Arc::clone(self);
        *task_guard = Some(tokio::spawn(async move {
            processor.run_loop(stop_rx).await;
            processor.is_polling.store(false, Ordering::SeqCst);
        }));
        info!(processor = self.name(), "Processor started");
    }

    /// Stop the poll loop and wait for the in-flight cycle to finish.
    /// Idempotent.
    pub async fn stop(&self) {
        let sender = self.stop.lock().expect("stop state poisoned").take();
        let Some(sender) = sender else { return };
        let _ = sender.send(true);

        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        info!(processor = self.name(), "Processor stopped");
    }

    /// Suspend cycle execution without tearing the loop down
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn status(&self) -> ProcessorStatus {
        ProcessorStatus {
            name: self.name().to_string(),
            is_polling: self.is_polling.load(Ordering::SeqCst),
            processing_count: self.processing.len(),
            failed_count: self.failed.len(),
        }
    }

    /// Forget in-memory failure markers so the ledger rows an operator reset
    /// become eligible again
    pub fn clear_failed(&self) -> usize {
        let count = self.failed.len();
        self.failed.clear();
        count
    }

    async fn run_loop(self: &Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut events = self.open_event_stream().await;

        loop {
            let should_cycle = tokio::select! {
                _ = stop_rx.changed() => break,
                _ = ticker.tick() => true,
                event = recv_event(&mut events) => {
                    match event {
                        // A fresh event wakes an early cycle; a replay does not
                        Some(event) => self.handle_event(event).await,
                        None => {
                            // Stream closed upstream; fall back to pure polling
                            warn!(processor = self.name(), "Event stream closed");
                            events = None;
                            false
                        }
                    }
                }
            };

            if !should_cycle || self.paused.load(Ordering::SeqCst) {
                continue;
            }
            if let Err(error) = self.run_cycle().await {
                error!(
                    processor = self.name(),
                    error = %error,
                    "Poll cycle failed"
                );
            }
        }
    }

    async fn open_event_stream(&self) -> Option<mpsc::Receiver<LogEvent>> {
        let program = self.family.event_program()?;
        match self.chain.connection().subscribe_logs(&program).await {
            Ok(receiver) => {
                info!(processor = self.name(), %program, "Subscribed to program logs");
                Some(receiver)
            }
            Err(AppError::NotSupported(_)) => {
                debug!(processor = self.name(), "Log subscription unsupported; polling only");
                None
            }
            Err(error) => {
                warn!(processor = self.name(), error = %error, "Log subscription failed");
                None
            }
        }
    }

    /// Record the event in the dedup ledger. A replayed signature is dropped
    /// and does not wake an extra cycle.
    async fn handle_event(&self, event: LogEvent) -> bool {
        match self
            .store
            .mark_request_processed(
                &event.signature,
                RequestType::Event,
                RequestStatus::Processed,
                None,
                Some(&event.signature),
                None,
            )
            .await
        {
            Ok(first_time) => {
                if !first_time {
                    debug!(processor = self.name(), signature = %event.signature, "Replayed event ignored");
                }
                first_time
            }
            Err(error) => {
                warn!(processor = self.name(), error = %error, "Event dedup write failed");
                false
            }
        }
    }

    async fn run_cycle(self: &Arc<Self>) -> Result<(), AppError> {
        match self.family.lock_name() {
            Some(lock_name) => {
                let processor = Arc::clone(self);
                let outcome = self
                    .locks
                    .with_lock(lock_name, AcquireOptions::default(), || async move {
                        processor.process_candidates().await
                    })
                    .await?;
                if outcome.is_none() {
                    debug!(processor = self.name(), lock = lock_name, "Cycle skipped, lock contended");
                }
                Ok(())
            }
            None => self.process_candidates().await,
        }
    }

    async fn process_candidates(self: &Arc<Self>) -> Result<(), AppError> {
        let candidates = self.family.fetch_candidates(&self.chain).await?;
        if candidates.is_empty() {
            return Ok(());
        }
        debug!(
            processor = self.name(),
            count = candidates.len(),
            "Discovered eligible work"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut submissions = JoinSet::new();

        for item in candidates {
            if self.processing.contains_key(&item.key) || self.failed.contains_key(&item.key) {
                continue;
            }

            // A store error affects only this item; the cycle moves on
            if let Err(error) = self
                .store
                .insert_operation_if_absent(
                    &item.key,
                    item.operation_type,
                    Some(&item.payload),
                    self.config.max_retries,
                )
                .await
            {
                warn!(
                    processor = self.name(),
                    key = %item.key,
                    error = %error,
                    "Ledger insert failed, skipping item"
                );
                continue;
            }

            let claimed = match self
                .store
                .claim_operation(
                    &item.key,
                    &self.instance_id,
                    self.config.stale_claim_after.as_secs() as i64,
                )
                .await
            {
                Ok(claimed) => claimed,
                Err(error) => {
                    warn!(
                        processor = self.name(),
                        key = %item.key,
                        error = %error,
                        "Claim attempt failed, skipping item"
                    );
                    continue;
                }
            };
            if !claimed {
                debug!(processor = self.name(), key = %item.key, "Claim lost or exhausted");
                continue;
            }

            self.processing.insert(item.key.clone(), ());
            let processor = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            submissions.spawn(async move {
                let _guard = ProcessingGuard {
                    processor: Arc::clone(&processor),
                    key: item.key.clone(),
                };
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                processor.submit_item(item).await;
            });
        }

        // Drain before returning so cycles stay strictly sequential
        while let Some(joined) = submissions.join_next().await {
            if let Err(error) = joined {
                error!(processor = self.name(), error = %error, "Submission task panicked");
            }
        }
        Ok(())
    }

    async fn submit_item(&self, item: WorkItem) {
        let result = self.family.submit(&self.chain, &item).await;
        match result {
            Ok(signature) => {
                let slot = self
                    .chain
                    .connection()
                    .current_slot()
                    .await
                    .ok()
                    .map(|slot| slot as i64);
                if let Err(error) = self
                    .store
                    .complete_operation(
                        &item.key,
                        item.operation_type,
                        &signature.to_string(),
                        slot,
                    )
                    .await
                {
                    warn!(key = %item.key, error = %error, "Failed to record completion");
                }
                info!(
                    processor = self.name(),
                    key = %item.key,
                    signature = %signature,
                    "Operation confirmed"
                );
            }
            Err(error) if error.kind() == ErrorKind::Rejected => {
                // The program said no; retrying the same bytes cannot help
                warn!(
                    processor = self.name(),
                    key = %item.key,
                    error = %error,
                    "Operation rejected, marking failed"
                );
                if let Err(store_error) =
                    self.store.fail_operation(&item.key, &error.to_string()).await
                {
                    warn!(key = %item.key, error = %store_error, "Failed to record rejection");
                }
                self.failed.insert(item.key.clone(), ());
            }
            Err(error) => {
                match self
                    .store
                    .record_operation_failure(&item.key, &error.to_string())
                    .await
                {
                    Ok(operation) if operation.status == OperationStatus::Failed => {
                        warn!(
                            processor = self.name(),
                            key = %item.key,
                            retries = operation.retry_count,
                            "Retry budget exhausted"
                        );
                        self.failed.insert(item.key.clone(), ());
                    }
                    Ok(operation) => {
                        debug!(
                            processor = self.name(),
                            key = %item.key,
                            retry_count = operation.retry_count,
                            error = %error,
                            "Operation failed, will retry"
                        );
                    }
                    Err(store_error) => {
                        warn!(key = %item.key, error = %store_error, "Failed to record failure");
                    }
                }
            }
        }
    }
}

/// Clears the in-flight marker however the submission task ends, panics
/// and aborts included.
struct ProcessingGuard {
    processor: Arc<PollProcessor>,
    key: String,
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        self.processor.processing.remove(&self.key);
    }
}

async fn recv_event(events: &mut Option<mpsc::Receiver<LogEvent>>) -> Option<LogEvent> {
    match events {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}
