//! Position threshold verification.
//!
//! A freshly opened position carries encrypted liquidation thresholds that
//! the MPC network has not yet attested. Until verified, the position cannot
//! enter liquidation checks, so this family exists to drain the unverified
//! backlog quickly after position creation.

use async_trait::async_trait;
use solana_sdk::{pubkey::Pubkey, signature::Signature};

use crate::app::processor::JobFamily;
use crate::domain::{AppError, OperationType, WorkItem, accounts::PositionView, operation_key};
use crate::infra::chain::FailoverManager;

use super::{JobContext, scan_accounts, send_instruction};

pub struct VerificationJob {
    ctx: JobContext,
}

impl VerificationJob {
    #[must_use]
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobFamily for VerificationJob {
    fn name(&self) -> &'static str {
        "verification"
    }

    fn operation_type(&self) -> OperationType {
        OperationType::VerifyThreshold
    }

    async fn fetch_candidates(&self, chain: &FailoverManager) -> Result<Vec<WorkItem>, AppError> {
        let positions: Vec<(Pubkey, PositionView)> =
            scan_accounts(chain, &self.ctx.program_id, "ConfidentialPosition").await?;

        Ok(positions
            .into_iter()
            .filter(|(_, view)| view.needs_verification())
            .map(|(address, _)| WorkItem {
                key: operation_key(OperationType::VerifyThreshold, &[&address]),
                operation_type: OperationType::VerifyThreshold,
                address,
                payload: serde_json::json!({ "position": address.to_string() }),
            })
            .collect())
    }

    async fn submit(
        &self,
        chain: &FailoverManager,
        item: &WorkItem,
    ) -> Result<Signature, AppError> {
        let instruction = self.ctx.trigger.verify_position(&item.address)?;
        send_instruction(&self.ctx, chain, item.operation_type, &item.key, &instruction).await
    }
}
