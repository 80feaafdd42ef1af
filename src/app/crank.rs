//! Crank service: composition root over the lock service, the failover
//! pool, and the per-family processors.
//!
//! The service itself holds almost no logic. Startup recovery, pausing, and
//! maintenance are thin orchestrations over the pieces that own the real
//! behavior, which keeps every lifecycle transition individually testable.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::app::lock::{AcquireOptions, LockService};
use crate::app::processor::PollProcessor;
use crate::domain::{AppError, CrankStatus, OperationType, lock_names};
use crate::infra::chain::FailoverManager;
use crate::infra::store::SqliteStore;

/// Crank-level configuration
#[derive(Debug, Clone)]
pub struct CrankConfig {
    /// Finished ledger rows older than this are purged by maintenance
    pub retention: Duration,
    /// Claims older than this are reset to pending during startup recovery
    pub startup_stale_after: Duration,
}

impl Default for CrankConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            startup_stale_after: Duration::from_secs(120),
        }
    }
}

/// Rows removed by one maintenance run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub operations_purged: u64,
    pub transactions_purged: u64,
}

pub struct CrankService {
    store: Arc<SqliteStore>,
    chain: Arc<FailoverManager>,
    locks: Arc<LockService>,
    processors: Vec<Arc<PollProcessor>>,
    config: CrankConfig,
    running: AtomicBool,
    paused: AtomicBool,
}

impl CrankService {
    #[must_use]
    pub fn new(
        store: Arc<SqliteStore>,
        chain: Arc<FailoverManager>,
        locks: Arc<LockService>,
        processors: Vec<Arc<PollProcessor>>,
        config: CrankConfig,
    ) -> Self {
        Self {
            store,
            chain,
            locks,
            processors,
            config,
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        }
    }

    /// Start the crank: run startup recovery, then bring up the heartbeat,
    /// the health probes, and every processor. Idempotent.
    pub async fn start(&self) -> Result<(), AppError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.startup_recovery().await?;
        self.locks.start_heartbeat();
        self.chain.start_health_checks();
        for processor in &self.processors {
            processor.start().await;
        }
        info!(processors = self.processors.len(), "Crank service started");
        Ok(())
    }

    /// Reset stale in-progress claims left by a previous crash.
    ///
    /// Runs under the bootstrap lock; when another instance is already
    /// recovering, this one skips the sweep and starts normally.
    async fn startup_recovery(&self) -> Result<(), AppError> {
        let store = Arc::clone(&self.store);
        let stale = self.config.startup_stale_after.as_secs() as i64;
        let families: Vec<OperationType> =
            self.processors.iter().map(|p| p.operation_type()).collect();

        let outcome = self
            .locks
            .with_lock(lock_names::STARTUP_BOOTSTRAP, AcquireOptions::default(), || async move {
                let mut total = 0u64;
                for operation_type in families {
                    total += store.reset_stuck_operations(operation_type, stale).await?;
                }
                Ok(total)
            })
            .await?;

        match outcome {
            Some(reset) if reset > 0 => {
                info!(reset, "Startup recovery reset stale operation claims");
            }
            Some(_) => {}
            None => info!("Startup recovery skipped, another instance holds the bootstrap lock"),
        }
        Ok(())
    }

    /// Stop everything and release every held lock. Idempotent, and the
    /// crank can be started again afterwards.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for processor in &self.processors {
            processor.stop().await;
        }
        self.chain.stop_health_checks();
        self.locks.stop_heartbeat();
        if let Err(error) = self.locks.release_all().await {
            warn!(error = %error, "Failed to release locks while stopping");
        }
        info!("Crank service stopped");
    }

    /// Terminal stop for process exit: also shuts the lock service down so
    /// no new lease can be taken mid-teardown.
    pub async fn shutdown(&self) {
        self.stop().await;
        self.locks.shutdown().await;
        info!("Crank service shut down");
    }

    /// Suspend all cycles without tearing down loops or releasing locks
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        for processor in &self.processors {
            processor.pause();
        }
        info!("Crank service paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        for processor in &self.processors {
            processor.resume();
        }
        info!("Crank service resumed");
    }

    #[must_use]
    pub fn status(&self) -> CrankStatus {
        CrankStatus {
            running: self.running.load(Ordering::SeqCst),
            paused: self.paused.load(Ordering::SeqCst),
            processors: self.processors.iter().map(|p| p.status()).collect(),
        }
    }

    /// Operator recovery: reset stale claims of one family and clear its
    /// in-memory failure markers so reset rows become eligible again.
    pub async fn clear_stuck_operations(
        &self,
        operation_type: OperationType,
        stale_after: Duration,
    ) -> Result<u64, AppError> {
        let reset = self
            .store
            .reset_stuck_operations(operation_type, stale_after.as_secs() as i64)
            .await?;

        for processor in &self.processors {
            if processor.operation_type() == operation_type {
                let cleared = processor.clear_failed();
                if cleared > 0 {
                    info!(
                        processor = processor.name(),
                        cleared, "Cleared in-memory failure markers"
                    );
                }
            }
        }
        Ok(reset)
    }

    /// Purge finished ledger rows past retention, under the fleet-wide
    /// maintenance lock. Returns `None` when another instance is already
    /// running maintenance.
    pub async fn run_maintenance(&self) -> Result<Option<MaintenanceReport>, AppError> {
        let store = Arc::clone(&self.store);
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.retention)
                .map_err(|e| AppError::Internal(format!("retention out of range: {e}")))?;

        let report = self
            .locks
            .with_lock(lock_names::DB_MAINTENANCE, AcquireOptions::default(), || async move {
                let operations_purged = store.purge_finished_operations(cutoff).await?;
                let transactions_purged = store.purge_transaction_history(cutoff).await?;
                Ok(MaintenanceReport {
                    operations_purged,
                    transactions_purged,
                })
            })
            .await?;

        match &report {
            Some(report) => info!(
                operations = report.operations_purged,
                transactions = report.transactions_purged,
                "Maintenance run complete"
            ),
            None => warn!("Maintenance skipped, lock contended"),
        }
        Ok(report)
    }
}
