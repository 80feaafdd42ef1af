//! Collaborator traits the orchestration engine is written against.

use async_trait::async_trait;
use solana_sdk::{
    hash::Hash, instruction::Instruction, pubkey::Pubkey, signature::Signature,
    transaction::Transaction,
};
use tokio::sync::mpsc;

use super::error::AppError;

/// Server-side filter applied to a program-account scan
#[derive(Debug, Clone, Default)]
pub struct AccountFilter {
    /// Restrict results to accounts of exactly this size
    pub data_size: Option<u64>,
    /// Restrict results to accounts whose data matches these bytes at offset
    pub memcmp: Option<(usize, Vec<u8>)>,
}

impl AccountFilter {
    #[must_use]
    pub fn by_size(data_size: u64) -> Self {
        Self {
            data_size: Some(data_size),
            ..Self::default()
        }
    }
}

/// One log notification from a program subscription
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub signature: String,
    pub logs: Vec<String>,
}

/// Chain read/write collaborator.
///
/// The failover connection manager wraps exactly this surface; processors
/// never talk to an endpoint directly.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Check endpoint liveness
    async fn health_check(&self) -> Result<(), AppError>;

    /// Filtered scan of a program's accounts
    async fn get_filtered_accounts(
        &self,
        program_id: &Pubkey,
        filter: &AccountFilter,
    ) -> Result<Vec<(Pubkey, Vec<u8>)>, AppError>;

    /// Submit a signed transaction and wait for confirmation
    async fn submit_and_confirm(&self, transaction: &Transaction) -> Result<Signature, AppError>;

    /// Latest blockhash for transaction construction
    async fn latest_blockhash(&self) -> Result<Hash, AppError>;

    /// Current slot, used for health probes and history records
    async fn current_slot(&self) -> Result<u64, AppError>;

    /// Subscribe to a program's log stream, delivered over a channel.
    ///
    /// Optional: plain HTTP endpoints cannot stream, and processors fall
    /// back to pure polling when this is unsupported.
    async fn subscribe_logs(
        &self,
        program_id: &Pubkey,
    ) -> Result<mpsc::Receiver<LogEvent>, AppError> {
        let _ = program_id;
        Err(AppError::NotSupported(
            "subscribe_logs not implemented".to_string(),
        ))
    }
}

/// Builds the instructions that hand work to the MPC program.
///
/// The crank only needs "instruction bytes given inputs"; the computation
/// protocol itself is the MPC network's concern.
pub trait MpcTrigger: Send + Sync {
    /// Price-comparison match between a bid and an ask
    fn match_orders(&self, bid: &Pubkey, ask: &Pubkey) -> Result<Instruction, AppError>;

    /// Apply a position's pending margin-change request
    fn apply_margin_update(&self, position: &Pubkey) -> Result<Instruction, AppError>;

    /// Verify a position's encrypted liquidation thresholds
    fn verify_position(&self, position: &Pubkey) -> Result<Instruction, AppError>;

    /// Batch liquidation-eligibility check over positions of one market
    fn check_liquidations(
        &self,
        market: &Pubkey,
        positions: &[Pubkey],
    ) -> Result<Instruction, AppError>;
}
