//! In-memory doubles for the chain collaborators.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use solana_sdk::{
    hash::Hash,
    instruction::{AccountMeta, Instruction},
    pubkey::Pubkey,
    signature::Signature,
    transaction::Transaction,
};
use tokio::sync::mpsc;

use crate::domain::{AccountFilter, AppError, ChainClient, LogEvent, MpcTrigger};

/// Scriptable [`ChainClient`] double.
///
/// Accounts are served from an in-memory list; submissions succeed with a
/// fresh signature unless failures have been scripted with
/// [`MockChainClient::push_submit_error`].
pub struct MockChainClient {
    accounts: Mutex<Vec<(Pubkey, Vec<u8>)>>,
    submit_errors: Mutex<VecDeque<AppError>>,
    submit_calls: AtomicUsize,
    slot: AtomicU64,
    healthy: AtomicBool,
    log_sender: Mutex<Option<mpsc::Sender<LogEvent>>>,
    logs_supported: bool,
}

impl MockChainClient {
    /// A healthy client with no accounts and no log stream
    #[must_use]
    pub fn healthy() -> Self {
        Self {
            accounts: Mutex::new(Vec::new()),
            submit_errors: Mutex::new(VecDeque::new()),
            submit_calls: AtomicUsize::new(0),
            slot: AtomicU64::new(100),
            healthy: AtomicBool::new(true),
            log_sender: Mutex::new(None),
            logs_supported: false,
        }
    }

    /// A healthy client that also supports log subscriptions
    #[must_use]
    pub fn with_log_stream() -> Self {
        Self {
            logs_supported: true,
            ..Self::healthy()
        }
    }

    pub fn set_accounts(&self, accounts: Vec<(Pubkey, Vec<u8>)>) {
        *self.accounts.lock().expect("mock state poisoned") = accounts;
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Queue an error for the next submission; errors are consumed in order
    pub fn push_submit_error(&self, error: AppError) {
        self.submit_errors
            .lock()
            .expect("mock state poisoned")
            .push_back(error);
    }

    #[must_use]
    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    /// Deliver a log event to the subscriber, if any
    pub async fn emit_log(&self, event: LogEvent) -> bool {
        let sender = self
            .log_sender
            .lock()
            .expect("mock state poisoned")
            .clone();
        match sender {
            Some(sender) => sender.send(event).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn health_check(&self) -> Result<(), AppError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppError::Chain(crate::domain::ChainError::Unavailable(
                "mock endpoint down".to_string(),
            )))
        }
    }

    async fn get_filtered_accounts(
        &self,
        _program_id: &Pubkey,
        filter: &AccountFilter,
    ) -> Result<Vec<(Pubkey, Vec<u8>)>, AppError> {
        let accounts = self.accounts.lock().expect("mock state poisoned").clone();
        Ok(accounts
            .into_iter()
            .filter(|(_, data)| match &filter.memcmp {
                Some((offset, bytes)) => data
                    .get(*offset..*offset + bytes.len())
                    .is_some_and(|window| window == bytes.as_slice()),
                None => true,
            })
            .filter(|(_, data)| match filter.data_size {
                Some(size) => data.len() as u64 == size,
                None => true,
            })
            .collect())
    }

    async fn submit_and_confirm(&self, transaction: &Transaction) -> Result<Signature, AppError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .submit_errors
            .lock()
            .expect("mock state poisoned")
            .pop_front();
        match scripted {
            Some(error) => Err(error),
            None => Ok(transaction
                .signatures
                .first()
                .copied()
                .unwrap_or_else(Signature::new_unique)),
        }
    }

    async fn latest_blockhash(&self) -> Result<Hash, AppError> {
        Ok(Hash::new_unique())
    }

    async fn current_slot(&self) -> Result<u64, AppError> {
        Ok(self.slot.fetch_add(1, Ordering::SeqCst))
    }

    async fn subscribe_logs(
        &self,
        _program_id: &Pubkey,
    ) -> Result<mpsc::Receiver<LogEvent>, AppError> {
        if !self.logs_supported {
            return Err(AppError::NotSupported(
                "mock log stream disabled".to_string(),
            ));
        }
        let (sender, receiver) = mpsc::channel(16);
        *self.log_sender.lock().expect("mock state poisoned") = Some(sender);
        Ok(receiver)
    }
}

/// [`MpcTrigger`] double that records which computations were requested.
pub struct MockMpcTrigger {
    program_id: Pubkey,
    calls: Mutex<Vec<String>>,
}

impl Default for MockMpcTrigger {
    fn default() -> Self {
        Self {
            program_id: Pubkey::new_unique(),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl MockMpcTrigger {
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("mock state poisoned").clone()
    }

    // Only the payer may be a required signer: callers sign with nothing else
    fn record(&self, call: String) -> Instruction {
        self.calls.lock().expect("mock state poisoned").push(call);
        Instruction {
            program_id: self.program_id,
            accounts: vec![AccountMeta::new(Pubkey::new_unique(), false)],
            data: vec![0u8; 8],
        }
    }
}

impl MpcTrigger for MockMpcTrigger {
    fn match_orders(&self, bid: &Pubkey, ask: &Pubkey) -> Result<Instruction, AppError> {
        Ok(self.record(format!("match:{bid}:{ask}")))
    }

    fn apply_margin_update(&self, position: &Pubkey) -> Result<Instruction, AppError> {
        Ok(self.record(format!("margin:{position}")))
    }

    fn verify_position(&self, position: &Pubkey) -> Result<Instruction, AppError> {
        Ok(self.record(format!("verify:{position}")))
    }

    fn check_liquidations(
        &self,
        market: &Pubkey,
        positions: &[Pubkey],
    ) -> Result<Instruction, AppError> {
        Ok(self.record(format!("liquidate:{market}:{}", positions.len())))
    }
}
