//! Margin-request application.
//!
//! Traders queue encrypted margin changes on their positions; the crank
//! notices the pending request and hands it to the MPC program for
//! application. Eligibility is `open position with a pending request` —
//! nothing else, since the amounts themselves are encrypted.

use async_trait::async_trait;
use solana_sdk::{pubkey::Pubkey, signature::Signature};

use crate::app::processor::JobFamily;
use crate::domain::{AppError, OperationType, WorkItem, accounts::PositionView, operation_key};
use crate::infra::chain::FailoverManager;

use super::{JobContext, scan_accounts, send_instruction};

pub struct MarginJob {
    ctx: JobContext,
}

impl MarginJob {
    #[must_use]
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobFamily for MarginJob {
    fn name(&self) -> &'static str {
        "margin"
    }

    fn operation_type(&self) -> OperationType {
        OperationType::MarginUpdate
    }

    async fn fetch_candidates(&self, chain: &FailoverManager) -> Result<Vec<WorkItem>, AppError> {
        let positions: Vec<(Pubkey, PositionView)> =
            scan_accounts(chain, &self.ctx.program_id, "ConfidentialPosition").await?;

        Ok(positions
            .into_iter()
            .filter(|(_, view)| view.is_open() && view.has_pending_margin_request())
            .map(|(address, view)| {
                // Keyed by position and request id: a later request on the
                // same position is new work, not a replay
                let request = Pubkey::new_from_array(view.pending_margin_request);
                WorkItem {
                    key: operation_key(OperationType::MarginUpdate, &[&address, &request]),
                    operation_type: OperationType::MarginUpdate,
                    address,
                    payload: serde_json::json!({
                        "position": address.to_string(),
                        "request": request.to_string(),
                    }),
                }
            })
            .collect())
    }

    async fn submit(
        &self,
        chain: &FailoverManager,
        item: &WorkItem,
    ) -> Result<Signature, AppError> {
        let instruction = self.ctx.trigger.apply_margin_update(&item.address)?;
        send_instruction(&self.ctx, chain, item.operation_type, &item.key, &instruction).await
    }
}
