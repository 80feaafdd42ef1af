//! Core domain types for the crank's durable ledgers and status reporting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use solana_sdk::pubkey::Pubkey;

/// Well-known lock names partitioning mutually-exclusive job families.
///
/// A fleet of N crank instances never runs two of the same family
/// concurrently, while different families run in parallel.
pub mod lock_names {
    pub const ORDER_MATCHING: &str = "crank:order_matching";
    pub const MPC_CALLBACK: &str = "crank:mpc_callback";
    pub const SETTLEMENT: &str = "crank:settlement";
    pub const STARTUP_BOOTSTRAP: &str = "crank:startup_bootstrap";
    pub const DB_MAINTENANCE: &str = "crank:db_maintenance";
}

/// Category of pending work tracked in the operation ledger
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Match,
    MarginUpdate,
    VerifyThreshold,
    LiquidationCheck,
    Settlement,
    MpcCallback,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Match => "match",
            Self::MarginUpdate => "margin_update",
            Self::VerifyThreshold => "verify_threshold",
            Self::LiquidationCheck => "liquidation_check",
            Self::Settlement => "settlement",
            Self::MpcCallback => "mpc_callback",
        }
    }
}

impl std::str::FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "match" => Ok(Self::Match),
            "margin_update" => Ok(Self::MarginUpdate),
            "verify_threshold" => Ok(Self::VerifyThreshold),
            "liquidation_check" => Ok(Self::LiquidationCheck),
            "settlement" => Ok(Self::Settlement),
            "mpc_callback" => Ok(Self::MpcCallback),
            _ => Err(format!("Invalid operation type: {}", s)),
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of a pending operation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid operation status: {}", s)),
        }
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A row in the pending-operation ledger.
///
/// `operation_key` is a content-derived idempotency key: re-discovering the
/// same real-world operation maps to the same key, so a crash between claim
/// and completion cannot lead to duplicate execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingOperation {
    pub operation_key: String,
    pub operation_type: OperationType,
    pub status: OperationStatus,
    pub payload: Option<serde_json::Value>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub last_error: Option<String>,
    pub locked_by: Option<String>,
    /// Epoch seconds of the last claim; staleness is compared in SQL
    pub locked_at: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Kind of replay-suppressed request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Computation,
    Event,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Computation => "computation",
            Self::Event => "event",
        }
    }
}

impl std::str::FromStr for RequestType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "computation" => Ok(Self::Computation),
            "event" => Ok(Self::Event),
            _ => Err(format!("Invalid request type: {}", s)),
        }
    }
}

/// Outcome recorded in the dedup ledger
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Processed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid request status: {}", s)),
        }
    }
}

/// A row in the processed-request dedup ledger.
/// Pure crash-restart duplicate suppression, not retry bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessedRequest {
    pub request_key: String,
    pub request_type: RequestType,
    pub status: RequestStatus,
    pub computation_type: Option<String>,
    pub tx_signature: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Confirmation state of a submitted transaction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    #[default]
    Pending,
    Confirmed,
    Failed,
    Expired,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

impl std::str::FromStr for TxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("Invalid transaction status: {}", s)),
        }
    }
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Append-mostly audit row for a submitted transaction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionRecord {
    pub tx_signature: String,
    pub tx_type: OperationType,
    pub status: TxStatus,
    pub operation_key: Option<String>,
    pub error_message: Option<String>,
    pub slot: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A held or observed lock row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockRecord {
    pub lock_name: String,
    pub owner_id: String,
    /// Epoch seconds
    pub acquired_at: i64,
    /// Epoch seconds
    pub expires_at: i64,
    pub metadata: Option<String>,
}

impl LockRecord {
    #[must_use]
    pub fn is_expired_at(&self, now_epoch: i64) -> bool {
        self.expires_at < now_epoch
    }
}

/// One unit of eligible work discovered by a poll cycle
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Content-derived idempotency key
    pub key: String,
    pub operation_type: OperationType,
    /// Primary on-chain account this item acts on
    pub address: Pubkey,
    /// Job-specific parameters carried to submission
    pub payload: serde_json::Value,
}

/// Status snapshot of one polling job processor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessorStatus {
    pub name: String,
    pub is_polling: bool,
    pub processing_count: usize,
    pub failed_count: usize,
}

/// Aggregated status of the crank service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CrankStatus {
    pub running: bool,
    pub paused: bool,
    pub processors: Vec<ProcessorStatus>,
}

/// Observability snapshot of one RPC endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointStatus {
    pub url: String,
    pub weight: u32,
    pub is_healthy: bool,
    pub is_current: bool,
    pub consecutive_failures: u32,
    pub latency_ms: Option<u64>,
}

/// Derive a content-addressed idempotency key from the on-chain addresses an
/// operation involves. The same real-world operation always maps to the same
/// key, regardless of which instance or poll cycle discovers it.
#[must_use]
pub fn operation_key(operation_type: OperationType, addresses: &[&Pubkey]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(operation_type.as_str().as_bytes());
    for address in addresses {
        hasher.update(address.as_ref());
    }
    let digest = hasher.finalize();
    format!(
        "{}:{}",
        operation_type.as_str(),
        bs58::encode(&digest[..16]).into_string()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_operation_status_display_and_parsing() {
        let statuses = vec![
            (OperationStatus::Pending, "pending"),
            (OperationStatus::InProgress, "in_progress"),
            (OperationStatus::Completed, "completed"),
            (OperationStatus::Failed, "failed"),
        ];

        for (status, string) in statuses {
            assert_eq!(status.as_str(), string);
            assert_eq!(OperationStatus::from_str(string).unwrap(), status);
        }

        assert!(OperationStatus::from_str("invalid").is_err());
    }

    #[test]
    fn test_operation_type_display_and_parsing() {
        let types = vec![
            (OperationType::Match, "match"),
            (OperationType::MarginUpdate, "margin_update"),
            (OperationType::VerifyThreshold, "verify_threshold"),
            (OperationType::LiquidationCheck, "liquidation_check"),
            (OperationType::Settlement, "settlement"),
            (OperationType::MpcCallback, "mpc_callback"),
        ];

        for (ty, string) in types {
            assert_eq!(ty.as_str(), string);
            assert_eq!(ty.to_string(), string);
            assert_eq!(OperationType::from_str(string).unwrap(), ty);
        }
    }

    #[test]
    fn test_tx_status_parsing() {
        for (status, string) in [
            (TxStatus::Pending, "pending"),
            (TxStatus::Confirmed, "confirmed"),
            (TxStatus::Failed, "failed"),
            (TxStatus::Expired, "expired"),
        ] {
            assert_eq!(status.as_str(), string);
            assert_eq!(TxStatus::from_str(string).unwrap(), status);
        }
    }

    #[test]
    fn test_operation_key_is_stable_and_order_sensitive() {
        let a = Pubkey::new_unique();
        let b = Pubkey::new_unique();

        let k1 = operation_key(OperationType::Match, &[&a, &b]);
        let k2 = operation_key(OperationType::Match, &[&a, &b]);
        assert_eq!(k1, k2);

        let k3 = operation_key(OperationType::Match, &[&b, &a]);
        assert_ne!(k1, k3);

        let k4 = operation_key(OperationType::Settlement, &[&a, &b]);
        assert_ne!(k1, k4);
        assert!(k4.starts_with("settlement:"));
    }

    #[test]
    fn test_lock_record_expiry() {
        let lock = LockRecord {
            lock_name: lock_names::ORDER_MATCHING.to_string(),
            owner_id: "owner-1".to_string(),
            acquired_at: 1_000,
            expires_at: 1_060,
            metadata: None,
        };

        assert!(!lock.is_expired_at(1_059));
        assert!(!lock.is_expired_at(1_060));
        assert!(lock.is_expired_at(1_061));
    }
}
