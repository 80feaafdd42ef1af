//! Embedded SQLite operation store.
//!
//! Single writer of durable state: the lock table, the pending-operation
//! ledger, the processed-request dedup ledger, and the transaction history.
//! Every mutation is a conditional/atomic statement (insert-if-absent,
//! update-where-status) because the same logical resource may be polled by
//! more than one fleet instance. WAL journaling bounds crash loss to the
//! most recent uncommitted write.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

use crate::domain::{
    AppError, LockRecord, OperationStatus, OperationType, PendingOperation, ProcessedRequest,
    RequestStatus, RequestType, StoreError, TransactionRecord, TxStatus,
};

/// SQLite pool configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub busy_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(3),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Embedded operation store with connection pooling
pub struct SqliteStore {
    pool: SqlitePool,
}

fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

impl SqliteStore {
    /// Open (creating if missing) the on-disk store with custom configuration
    pub async fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, AppError> {
        info!(path = %path.as_ref().display(), "Opening operation store");
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(|e| AppError::Store(StoreError::Connection(e.to_string())))?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Open the on-disk store with default configuration
    pub async fn open_with_defaults(path: impl AsRef<Path>) -> Result<Self, AppError> {
        Self::open(path, StoreConfig::default()).await
    }

    /// Open an in-memory store, for tests.
    ///
    /// A single connection keeps every statement on the same in-memory
    /// database.
    pub async fn open_in_memory() -> Result<Self, AppError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| AppError::Store(StoreError::Connection(e.to_string())))?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), AppError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Store(StoreError::Migration(e.to_string())))?;
        Ok(())
    }

    /// Close the pool; in-flight statements complete first
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Check store connectivity
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Store(StoreError::Connection(e.to_string())))?;
        Ok(())
    }

    /// Begin an explicit transaction for multi-statement callers
    pub async fn begin(&self) -> Result<Transaction<'_, Sqlite>, AppError> {
        self.pool
            .begin()
            .await
            .map_err(|e| AppError::Store(StoreError::from(e)))
    }

    /// Underlying pool, for tests
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Lock table
    // ------------------------------------------------------------------

    /// Atomic insert-if-absent-or-expired lock claim.
    ///
    /// Succeeds when the row is free, expired, or already owned by this
    /// owner (re-acquire extends the lease in place). Returns `false` when
    /// another live owner holds the lock; contention is not an error.
    #[instrument(skip(self))]
    pub async fn try_acquire_lock(
        &self,
        lock_name: &str,
        owner_id: &str,
        ttl_seconds: i64,
        metadata: Option<&str>,
    ) -> Result<bool, AppError> {
        let now = now_epoch();
        let expires = now + ttl_seconds;
        let result = sqlx::query(
            r#"
            INSERT INTO locks (lock_name, owner_id, acquired_at, expires_at, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(lock_name) DO UPDATE SET
                owner_id = excluded.owner_id,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at,
                metadata = excluded.metadata
            WHERE locks.expires_at < ?3 OR locks.owner_id = excluded.owner_id
            "#,
        )
        .bind(lock_name)
        .bind(owner_id)
        .bind(now)
        .bind(expires)
        .bind(metadata)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::from(e)))?;

        Ok(result.rows_affected() == 1)
    }

    /// Push a held lease's expiry forward; `false` when no longer owned
    #[instrument(skip(self))]
    pub async fn extend_lock(
        &self,
        lock_name: &str,
        owner_id: &str,
        ttl_seconds: i64,
    ) -> Result<bool, AppError> {
        let expires = now_epoch() + ttl_seconds;
        let result = sqlx::query(
            "UPDATE locks SET expires_at = ?1 WHERE lock_name = ?2 AND owner_id = ?3",
        )
        .bind(expires)
        .bind(lock_name)
        .bind(owner_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::from(e)))?;

        Ok(result.rows_affected() == 1)
    }

    /// Delete a lease if still owned; idempotent
    #[instrument(skip(self))]
    pub async fn release_lock(&self, lock_name: &str, owner_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM locks WHERE lock_name = ?1 AND owner_id = ?2")
            .bind(lock_name)
            .bind(owner_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Store(StoreError::from(e)))?;

        Ok(result.rows_affected() == 1)
    }

    /// Delete every lease held by an owner; returns how many were released
    #[instrument(skip(self))]
    pub async fn release_all_locks(&self, owner_id: &str) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM locks WHERE owner_id = ?1")
            .bind(owner_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Store(StoreError::from(e)))?;

        Ok(result.rows_affected())
    }

    /// Read a lock row regardless of expiry
    #[instrument(skip(self))]
    pub async fn get_lock(&self, lock_name: &str) -> Result<Option<LockRecord>, AppError> {
        let row = sqlx::query(
            "SELECT lock_name, owner_id, acquired_at, expires_at, metadata FROM locks WHERE lock_name = ?1",
        )
        .bind(lock_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::from(e)))?;

        Ok(row.map(|row| Self::row_to_lock(&row)))
    }

    fn row_to_lock(row: &SqliteRow) -> LockRecord {
        LockRecord {
            lock_name: row.get("lock_name"),
            owner_id: row.get("owner_id"),
            acquired_at: row.get("acquired_at"),
            expires_at: row.get("expires_at"),
            metadata: row.get("metadata"),
        }
    }

    // ------------------------------------------------------------------
    // Pending-operation ledger
    // ------------------------------------------------------------------

    /// Insert a freshly observed operation if its key is not yet known.
    ///
    /// Returns `true` when a row was inserted; `false` when the key already
    /// exists (same real-world operation re-discovered).
    #[instrument(skip(self, payload))]
    pub async fn insert_operation_if_absent(
        &self,
        operation_key: &str,
        operation_type: OperationType,
        payload: Option<&serde_json::Value>,
        max_retries: i64,
    ) -> Result<bool, AppError> {
        let now = Utc::now();
        let payload_text = payload.map(|p| p.to_string());
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO pending_operations (
                operation_key, operation_type, status, payload,
                retry_count, max_retries, created_at, updated_at
            )
            VALUES (?1, ?2, 'pending', ?3, 0, ?4, ?5, ?6)
            "#,
        )
        .bind(operation_key)
        .bind(operation_type.as_str())
        .bind(payload_text)
        .bind(max_retries)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::from(e)))?;

        Ok(result.rows_affected() == 1)
    }

    /// Conditional claim: pending, or in-progress with a stale claim.
    ///
    /// This is the whole restart-recovery story — a claimant that died mid
    /// flight leaves a stale `locked_at`, and the next poll re-claims the row
    /// with the same statement. At-most-one-active-claimant comes from the
    /// conditional update, not from any in-process state.
    #[instrument(skip(self))]
    pub async fn claim_operation(
        &self,
        operation_key: &str,
        claimant: &str,
        stale_after_seconds: i64,
    ) -> Result<bool, AppError> {
        let now = now_epoch();
        let stale_cutoff = now - stale_after_seconds;
        let result = sqlx::query(
            r#"
            UPDATE pending_operations
            SET status = 'in_progress', locked_by = ?1, locked_at = ?2, updated_at = ?3
            WHERE operation_key = ?4
              AND retry_count < max_retries
              AND (
                status = 'pending'
                OR (status = 'in_progress' AND locked_at IS NOT NULL AND locked_at < ?5)
              )
            "#,
        )
        .bind(claimant)
        .bind(now)
        .bind(Utc::now())
        .bind(operation_key)
        .bind(stale_cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::from(e)))?;

        Ok(result.rows_affected() == 1)
    }

    /// Mark an operation completed and record its transaction in one
    /// atomic write.
    #[instrument(skip(self))]
    pub async fn complete_operation(
        &self,
        operation_key: &str,
        operation_type: OperationType,
        tx_signature: &str,
        slot: Option<i64>,
    ) -> Result<(), AppError> {
        let now = Utc::now();
        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            UPDATE pending_operations
            SET status = 'completed', last_error = NULL,
                locked_by = NULL, locked_at = NULL, updated_at = ?1
            WHERE operation_key = ?2 AND status = 'in_progress'
            "#,
        )
        .bind(now)
        .bind(operation_key)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::Store(StoreError::from(e)))?;

        sqlx::query(
            r#"
            INSERT INTO transaction_history (
                tx_signature, tx_type, status, operation_key, slot, created_at, updated_at
            )
            VALUES (?1, ?2, 'confirmed', ?3, ?4, ?5, ?6)
            ON CONFLICT(tx_signature) DO UPDATE SET
                status = 'confirmed', slot = excluded.slot, updated_at = excluded.updated_at
            "#,
        )
        .bind(tx_signature)
        .bind(operation_type.as_str())
        .bind(operation_key)
        .bind(slot)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::Store(StoreError::from(e)))?;

        tx.commit()
            .await
            .map_err(|e| AppError::Store(StoreError::from(e)))?;
        Ok(())
    }

    /// Record a retryable failure: increments the persisted retry count,
    /// releases the claim, and flips the row to `failed` once the budget is
    /// exhausted. Returns the row as it now stands.
    #[instrument(skip(self, error))]
    pub async fn record_operation_failure(
        &self,
        operation_key: &str,
        error: &str,
    ) -> Result<PendingOperation, AppError> {
        sqlx::query(
            r#"
            UPDATE pending_operations
            SET retry_count = retry_count + 1,
                last_error = ?1,
                status = CASE
                    WHEN retry_count + 1 >= max_retries THEN 'failed'
                    ELSE 'pending'
                END,
                locked_by = NULL, locked_at = NULL, updated_at = ?2
            WHERE operation_key = ?3
            "#,
        )
        .bind(error)
        .bind(Utc::now())
        .bind(operation_key)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::from(e)))?;

        self.get_operation(operation_key).await?.ok_or_else(|| {
            AppError::Store(StoreError::NotFound(operation_key.to_string()))
        })
    }

    /// Permanent failure: a business rejection that consumes no retry budget
    #[instrument(skip(self, error))]
    pub async fn fail_operation(&self, operation_key: &str, error: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE pending_operations
            SET status = 'failed', last_error = ?1,
                locked_by = NULL, locked_at = NULL, updated_at = ?2
            WHERE operation_key = ?3
            "#,
        )
        .bind(error)
        .bind(Utc::now())
        .bind(operation_key)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::from(e)))?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_operation(
        &self,
        operation_key: &str,
    ) -> Result<Option<PendingOperation>, AppError> {
        let row = sqlx::query(
            r#"
            SELECT operation_key, operation_type, status, payload, retry_count,
                   max_retries, last_error, locked_by, locked_at, created_at, updated_at
            FROM pending_operations
            WHERE operation_key = ?1
            "#,
        )
        .bind(operation_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::from(e)))?;

        match row {
            Some(row) => Ok(Some(Self::row_to_operation(&row)?)),
            None => Ok(None),
        }
    }

    /// Administrative recovery: release stale in-progress claims of one
    /// operation type back to `pending`. Returns how many rows were reset.
    #[instrument(skip(self))]
    pub async fn reset_stuck_operations(
        &self,
        operation_type: OperationType,
        stale_after_seconds: i64,
    ) -> Result<u64, AppError> {
        let stale_cutoff = now_epoch() - stale_after_seconds;
        let result = sqlx::query(
            r#"
            UPDATE pending_operations
            SET status = 'pending', locked_by = NULL, locked_at = NULL, updated_at = ?1
            WHERE operation_type = ?2
              AND status = 'in_progress'
              AND (locked_at IS NULL OR locked_at < ?3)
            "#,
        )
        .bind(Utc::now())
        .bind(operation_type.as_str())
        .bind(stale_cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::from(e)))?;

        Ok(result.rows_affected())
    }

    /// Retention: drop completed/failed operations older than the cutoff
    #[instrument(skip(self))]
    pub async fn purge_finished_operations(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM pending_operations
            WHERE status IN ('completed', 'failed') AND updated_at < ?1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::from(e)))?;

        Ok(result.rows_affected())
    }

    fn row_to_operation(row: &SqliteRow) -> Result<PendingOperation, AppError> {
        let operation_type: String = row.get("operation_type");
        let status: String = row.get("status");
        let payload: Option<String> = row.get("payload");
        let payload = match payload {
            Some(text) => Some(serde_json::from_str(&text).map_err(|e| {
                AppError::Store(StoreError::Query(format!("corrupt payload: {}", e)))
            })?),
            None => None,
        };

        Ok(PendingOperation {
            operation_key: row.get("operation_key"),
            operation_type: OperationType::from_str(&operation_type)
                .map_err(|e| AppError::Store(StoreError::Query(e)))?,
            status: OperationStatus::from_str(&status)
                .map_err(|e| AppError::Store(StoreError::Query(e)))?,
            payload,
            retry_count: row.get("retry_count"),
            max_retries: row.get("max_retries"),
            last_error: row.get("last_error"),
            locked_by: row.get("locked_by"),
            locked_at: row.get("locked_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    // ------------------------------------------------------------------
    // Processed-request dedup ledger
    // ------------------------------------------------------------------

    /// Record a request as handled; `false` when the key was already present
    /// (replay observed).
    #[instrument(skip(self))]
    pub async fn mark_request_processed(
        &self,
        request_key: &str,
        request_type: RequestType,
        status: RequestStatus,
        computation_type: Option<&str>,
        tx_signature: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO processed_requests (
                request_key, request_type, status, computation_type,
                tx_signature, error_message, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(request_key)
        .bind(request_type.as_str())
        .bind(status.as_str())
        .bind(computation_type)
        .bind(tx_signature)
        .bind(error_message)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::from(e)))?;

        Ok(result.rows_affected() == 1)
    }

    /// Consulted before acting on a freshly observed event or callback so
    /// replays are ignored rather than re-executed.
    #[instrument(skip(self))]
    pub async fn is_request_processed(&self, request_key: &str) -> Result<bool, AppError> {
        let row = sqlx::query("SELECT 1 FROM processed_requests WHERE request_key = ?1")
            .bind(request_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Store(StoreError::from(e)))?;
        Ok(row.is_some())
    }

    #[instrument(skip(self))]
    pub async fn get_processed_request(
        &self,
        request_key: &str,
    ) -> Result<Option<ProcessedRequest>, AppError> {
        let row = sqlx::query(
            r#"
            SELECT request_key, request_type, status, computation_type,
                   tx_signature, error_message, created_at
            FROM processed_requests
            WHERE request_key = ?1
            "#,
        )
        .bind(request_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::from(e)))?;

        match row {
            Some(row) => {
                let request_type: String = row.get("request_type");
                let status: String = row.get("status");
                Ok(Some(ProcessedRequest {
                    request_key: row.get("request_key"),
                    request_type: RequestType::from_str(&request_type)
                        .map_err(|e| AppError::Store(StoreError::Query(e)))?,
                    status: RequestStatus::from_str(&status)
                        .map_err(|e| AppError::Store(StoreError::Query(e)))?,
                    computation_type: row.get("computation_type"),
                    tx_signature: row.get("tx_signature"),
                    error_message: row.get("error_message"),
                    created_at: row.get("created_at"),
                }))
            }
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Transaction history
    // ------------------------------------------------------------------

    /// Insert a submitted transaction with `pending` status; idempotent on
    /// re-submission of the same signature.
    #[instrument(skip(self))]
    pub async fn record_transaction(
        &self,
        tx_signature: &str,
        tx_type: OperationType,
        operation_key: Option<&str>,
    ) -> Result<(), AppError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO transaction_history (
                tx_signature, tx_type, status, operation_key, created_at, updated_at
            )
            VALUES (?1, ?2, 'pending', ?3, ?4, ?5)
            "#,
        )
        .bind(tx_signature)
        .bind(tx_type.as_str())
        .bind(operation_key)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::from(e)))?;
        Ok(())
    }

    /// Update a transaction's confirmation status in place
    #[instrument(skip(self))]
    pub async fn update_transaction_status(
        &self,
        tx_signature: &str,
        status: TxStatus,
        error_message: Option<&str>,
        slot: Option<i64>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE transaction_history
            SET status = ?1, error_message = ?2, slot = COALESCE(?3, slot), updated_at = ?4
            WHERE tx_signature = ?5
            "#,
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(slot)
        .bind(Utc::now())
        .bind(tx_signature)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::from(e)))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    pub async fn get_transaction(
        &self,
        tx_signature: &str,
    ) -> Result<Option<TransactionRecord>, AppError> {
        let row = sqlx::query(
            r#"
            SELECT tx_signature, tx_type, status, operation_key, error_message,
                   slot, created_at, updated_at
            FROM transaction_history
            WHERE tx_signature = ?1
            "#,
        )
        .bind(tx_signature)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::from(e)))?;

        match row {
            Some(row) => Ok(Some(Self::row_to_transaction(&row)?)),
            None => Ok(None),
        }
    }

    fn row_to_transaction(row: &SqliteRow) -> Result<TransactionRecord, AppError> {
        let tx_type: String = row.get("tx_type");
        let status: String = row.get("status");
        Ok(TransactionRecord {
            tx_signature: row.get("tx_signature"),
            tx_type: OperationType::from_str(&tx_type)
                .map_err(|e| AppError::Store(StoreError::Query(e)))?,
            status: TxStatus::from_str(&status)
                .map_err(|e| AppError::Store(StoreError::Query(e)))?,
            operation_key: row.get("operation_key"),
            error_message: row.get("error_message"),
            slot: row.get("slot"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    /// Every submission attempt recorded for one operation, oldest first
    #[instrument(skip(self))]
    pub async fn get_transactions_for_operation(
        &self,
        operation_key: &str,
    ) -> Result<Vec<TransactionRecord>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT tx_signature, tx_type, status, operation_key, error_message,
                   slot, created_at, updated_at
            FROM transaction_history
            WHERE operation_key = ?1
            ORDER BY created_at, tx_signature
            "#,
        )
        .bind(operation_key)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::from(e)))?;

        rows.iter().map(Self::row_to_transaction).collect()
    }

    /// Retention: drop settled history rows older than the cutoff
    #[instrument(skip(self))]
    pub async fn purge_transaction_history(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM transaction_history
            WHERE status IN ('confirmed', 'failed', 'expired') AND updated_at < ?1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::from(e)))?;

        Ok(result.rows_affected())
    }
}
