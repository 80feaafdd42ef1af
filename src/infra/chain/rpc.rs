//! Solana RPC implementation of the chain collaborator.
//!
//! All error classification happens here, at the boundary: every failure
//! leaving this module is already a [`ChainError`] variant the failover
//! manager can act on without inspecting message text.

use std::time::Duration;

use async_trait::async_trait;
use solana_account_decoder::UiAccountEncoding;
use solana_client::nonblocking::rpc_client::RpcClient as SolanaRpcClient;
use solana_client::rpc_config::{RpcAccountInfoConfig, RpcProgramAccountsConfig};
use solana_client::rpc_filter::{Memcmp, RpcFilterType};
use solana_client::rpc_request::RpcError;
use solana_commitment_config::CommitmentConfig;
use solana_sdk::{
    account::Account,
    hash::Hash,
    pubkey::Pubkey,
    signature::Signature,
    signer::keypair::Keypair,
    transaction::Transaction,
};
use tracing::{debug, instrument, warn};

use crate::domain::{AccountFilter, AppError, ChainClient, ChainError};

/// JSON-RPC error code a node returns while catching up
const NODE_UNHEALTHY_CODE: i64 = -32005;

/// RPC client configuration
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    pub request_timeout: Duration,
    pub commitment: CommitmentConfig,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            commitment: CommitmentConfig::confirmed(),
        }
    }
}

/// Chain client bound to a single RPC endpoint
pub struct RpcChainClient {
    client: SolanaRpcClient,
    url: String,
}

impl RpcChainClient {
    pub fn new(url: &str, config: RpcClientConfig) -> Self {
        let client = SolanaRpcClient::new_with_timeout_and_commitment(
            url.to_string(),
            config.request_timeout,
            config.commitment,
        );
        Self {
            client,
            url: url.to_string(),
        }
    }

    pub fn with_defaults(url: &str) -> Self {
        Self::new(url, RpcClientConfig::default())
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn health_check(&self) -> Result<(), AppError> {
        self.client
            .get_slot()
            .await
            .map_err(map_solana_client_error)?;
        Ok(())
    }

    #[instrument(skip(self, filter), fields(program = %program_id))]
    async fn get_filtered_accounts(
        &self,
        program_id: &Pubkey,
        filter: &AccountFilter,
    ) -> Result<Vec<(Pubkey, Vec<u8>)>, AppError> {
        let mut filters = Vec::new();
        if let Some(size) = filter.data_size {
            filters.push(RpcFilterType::DataSize(size));
        }
        if let Some((offset, ref bytes)) = filter.memcmp {
            filters.push(RpcFilterType::Memcmp(Memcmp::new_raw_bytes(
                offset,
                bytes.clone(),
            )));
        }

        let config = RpcProgramAccountsConfig {
            filters: if filters.is_empty() {
                None
            } else {
                Some(filters)
            },
            account_config: RpcAccountInfoConfig {
                encoding: Some(UiAccountEncoding::Base64),
                ..RpcAccountInfoConfig::default()
            },
            ..RpcProgramAccountsConfig::default()
        };

        let accounts = self
            .client
            .get_program_ui_accounts_with_config(program_id, config)
            .await
            .map_err(map_solana_client_error)?;

        debug!(count = accounts.len(), "Fetched program accounts");
        Ok(accounts
            .into_iter()
            .filter_map(|(address, account)| match account.decode::<Account>() {
                Some(account) => Some((address, account.data)),
                None => {
                    warn!(address = %address, "Skipping account with undecodable encoding");
                    None
                }
            })
            .collect())
    }

    #[instrument(skip(self, transaction))]
    async fn submit_and_confirm(&self, transaction: &Transaction) -> Result<Signature, AppError> {
        self.client
            .send_and_confirm_transaction(transaction)
            .await
            .map_err(map_solana_client_error)
    }

    async fn latest_blockhash(&self) -> Result<Hash, AppError> {
        self.client
            .get_latest_blockhash()
            .await
            .map_err(map_solana_client_error)
    }

    async fn current_slot(&self) -> Result<u64, AppError> {
        self.client.get_slot().await.map_err(map_solana_client_error)
    }
}

/// Map Solana client errors into the closed chain-error taxonomy.
fn map_solana_client_error(err: solana_client::client_error::ClientError) -> AppError {
    use solana_client::client_error::ClientErrorKind;

    let msg = err.to_string();

    let chain_error = match err.kind() {
        ClientErrorKind::Io(_) => ChainError::Connection(msg),
        ClientErrorKind::Reqwest(e) if e.is_timeout() => ChainError::Timeout(msg),
        ClientErrorKind::Reqwest(e) if e.is_connect() => ChainError::Connection(msg),
        ClientErrorKind::Reqwest(_) => ChainError::Unavailable(msg),
        ClientErrorKind::RpcError(rpc) => match rpc {
            RpcError::RpcRequestError(_) => ChainError::Connection(msg),
            RpcError::RpcResponseError { code, .. } if *code == NODE_UNHEALTHY_CODE => {
                ChainError::Unavailable(msg)
            }
            RpcError::ForUser(_) | RpcError::ParseError(_) => ChainError::Rpc(msg),
            _ => ChainError::Rejected(msg),
        },
        ClientErrorKind::TransactionError(_) => ChainError::Rejected(msg),
        _ => ChainError::Rpc(msg),
    };

    AppError::Chain(chain_error)
}

/// Parse a base58-encoded secret key into the payer keypair
pub fn keypair_from_base58(secret: &str) -> Result<Keypair, AppError> {
    let key_bytes = bs58::decode(secret)
        .into_vec()
        .map_err(|e| AppError::Internal(format!("Invalid base58 secret key: {}", e)))?;
    Keypair::try_from(key_bytes.as_slice())
        .map_err(|e| AppError::Internal(format!("Invalid secret key bytes: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::signer::Signer;

    #[test]
    fn test_keypair_from_base58_round_trip() {
        let keypair = Keypair::new();
        let encoded = bs58::encode(keypair.to_bytes()).into_string();

        let parsed = keypair_from_base58(&encoded).unwrap();
        assert_eq!(parsed.pubkey(), keypair.pubkey());
    }

    #[test]
    fn test_keypair_from_base58_rejects_garbage() {
        assert!(keypair_from_base58("not-base58-!!").is_err());
        assert!(keypair_from_base58("1111").is_err());
    }
}
