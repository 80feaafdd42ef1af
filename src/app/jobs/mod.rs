//! The concrete job families the crank drives.
//!
//! Each family is a [`JobFamily`](crate::app::processor::JobFamily)
//! implementation: margin-request application, position threshold
//! verification, batched liquidation checks, and order matching. They share
//! the account-scan and transaction-submission helpers here; everything
//! stateful lives in the processor and the store.

use std::str::FromStr;
use std::sync::Arc;

use borsh::BorshDeserialize;
use sha2::{Digest, Sha256};
use solana_sdk::{
    instruction::Instruction,
    pubkey::Pubkey,
    signature::{Keypair, Signature},
    signer::Signer,
    transaction::Transaction,
};
use tracing::warn;

use crate::domain::{
    AccountFilter, AppError, MpcTrigger, OperationType, TxStatus, accounts::decode_account,
};
use crate::infra::chain::{ExecuteOptions, FailoverManager};
use crate::infra::store::SqliteStore;

mod liquidation;
mod margin;
mod matching;
mod verification;

pub use liquidation::LiquidationJob;
pub use margin::MarginJob;
pub use matching::MatchingJob;
pub use verification::VerificationJob;

/// Shared dependencies every job family needs
#[derive(Clone)]
pub struct JobContext {
    pub program_id: Pubkey,
    pub payer: Arc<Keypair>,
    pub trigger: Arc<dyn MpcTrigger>,
    pub store: Arc<SqliteStore>,
}

impl JobContext {
    #[must_use]
    pub fn new(
        program_id: Pubkey,
        payer: Arc<Keypair>,
        trigger: Arc<dyn MpcTrigger>,
        store: Arc<SqliteStore>,
    ) -> Self {
        Self {
            program_id,
            payer,
            trigger,
            store,
        }
    }
}

/// Anchor account discriminator for a named account type
fn account_discriminator(account_name: &str) -> [u8; 8] {
    let digest = Sha256::digest(format!("account:{account_name}").as_bytes());
    let mut discriminator = [0u8; 8];
    discriminator.copy_from_slice(&digest[..8]);
    discriminator
}

/// Scan the program for accounts of one type and decode them.
///
/// An account that fails to decode is logged and skipped; one malformed
/// account must not take the whole cycle down.
async fn scan_accounts<T: BorshDeserialize>(
    chain: &FailoverManager,
    program_id: &Pubkey,
    account_name: &str,
) -> Result<Vec<(Pubkey, T)>, AppError> {
    let filter = AccountFilter {
        data_size: None,
        memcmp: Some((0, account_discriminator(account_name).to_vec())),
    };

    let accounts = chain
        .execute_with_failover(ExecuteOptions::default(), |client| {
            let filter = filter.clone();
            let program_id = *program_id;
            async move { client.get_filtered_accounts(&program_id, &filter).await }
        })
        .await?;

    let mut views = Vec::with_capacity(accounts.len());
    for (address, data) in accounts {
        match decode_account::<T>(&address, &data) {
            Ok(view) => views.push((address, view)),
            Err(error) => {
                warn!(address = %address, error = %error, "Skipping undecodable account");
            }
        }
    }
    Ok(views)
}

/// Sign and submit one instruction through the failover pool.
///
/// The blockhash is fetched inside the retry closure so a retry after an
/// endpoint switch signs against a hash that endpoint will accept. Each
/// signed attempt lands in the transaction history as `pending` and is
/// flipped to `failed` when its submission errors; the caller records the
/// confirmation of the signature this returns.
async fn send_instruction(
    ctx: &JobContext,
    chain: &FailoverManager,
    tx_type: OperationType,
    operation_key: &str,
    instruction: &Instruction,
) -> Result<Signature, AppError> {
    let payer = &ctx.payer;
    let store = &ctx.store;
    chain
        .execute_with_failover(ExecuteOptions::default(), |client| {
            let instruction = instruction.clone();
            async move {
                let blockhash = client.latest_blockhash().await?;
                let transaction = Transaction::new_signed_with_payer(
                    &[instruction],
                    Some(&payer.pubkey()),
                    &[payer.as_ref()],
                    blockhash,
                );
                let signature = transaction.signatures[0];
                if let Err(store_error) = store
                    .record_transaction(&signature.to_string(), tx_type, Some(operation_key))
                    .await
                {
                    warn!(
                        signature = %signature,
                        error = %store_error,
                        "Failed to record pending transaction"
                    );
                }
                match client.submit_and_confirm(&transaction).await {
                    Ok(signature) => Ok(signature),
                    Err(error) => {
                        if let Err(store_error) = store
                            .update_transaction_status(
                                &signature.to_string(),
                                TxStatus::Failed,
                                Some(&error.to_string()),
                                None,
                            )
                            .await
                        {
                            warn!(
                                signature = %signature,
                                error = %store_error,
                                "Failed to record submission failure"
                            );
                        }
                        Err(error)
                    }
                }
            }
        })
        .await
}

/// Read a pubkey out of a work-item payload field
fn payload_pubkey(payload: &serde_json::Value, field: &str) -> Result<Pubkey, AppError> {
    let text = payload
        .get(field)
        .and_then(|value| value.as_str())
        .ok_or_else(|| AppError::Internal(format!("payload missing field '{field}'")))?;
    Pubkey::from_str(text)
        .map_err(|e| AppError::Internal(format!("payload field '{field}' is not a pubkey: {e}")))
}
