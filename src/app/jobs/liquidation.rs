//! Batched liquidation-eligibility checks.
//!
//! Whether a position is under water is an encrypted question, so the crank
//! cannot pre-filter by price; it sweeps every verified open position of a
//! market through an MPC batch check and lets the program act on the
//! encrypted verdicts. Positions are grouped per market and chunked so one
//! transaction never carries more accounts than the runtime tolerates.

use std::collections::BTreeMap;

use async_trait::async_trait;
use solana_sdk::{pubkey::Pubkey, signature::Signature};

use crate::app::processor::JobFamily;
use crate::domain::{AppError, OperationType, WorkItem, accounts::PositionView, operation_key};
use crate::infra::chain::FailoverManager;

use super::{JobContext, payload_pubkey, scan_accounts, send_instruction};

/// Positions per liquidation-check transaction
const BATCH_SIZE: usize = 10;

pub struct LiquidationJob {
    ctx: JobContext,
}

impl LiquidationJob {
    #[must_use]
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobFamily for LiquidationJob {
    fn name(&self) -> &'static str {
        "liquidation"
    }

    fn operation_type(&self) -> OperationType {
        OperationType::LiquidationCheck
    }

    async fn fetch_candidates(&self, chain: &FailoverManager) -> Result<Vec<WorkItem>, AppError> {
        let positions: Vec<(Pubkey, PositionView)> =
            scan_accounts(chain, &self.ctx.program_id, "ConfidentialPosition").await?;

        // BTreeMap keeps market iteration order stable across cycles, which
        // keeps batch composition and therefore operation keys stable
        let mut by_market: BTreeMap<Pubkey, Vec<Pubkey>> = BTreeMap::new();
        for (address, view) in positions {
            if view.can_be_liquidation_checked() {
                by_market.entry(view.market_pubkey()).or_default().push(address);
            }
        }

        let mut items = Vec::new();
        for (market, mut addresses) in by_market {
            addresses.sort();
            for chunk in addresses.chunks(BATCH_SIZE) {
                let mut key_parts: Vec<&Pubkey> = vec![&market];
                key_parts.extend(chunk.iter());
                items.push(WorkItem {
                    key: operation_key(OperationType::LiquidationCheck, &key_parts),
                    operation_type: OperationType::LiquidationCheck,
                    address: market,
                    payload: serde_json::json!({
                        "market": market.to_string(),
                        "positions": chunk.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
                    }),
                });
            }
        }
        Ok(items)
    }

    async fn submit(
        &self,
        chain: &FailoverManager,
        item: &WorkItem,
    ) -> Result<Signature, AppError> {
        let market = payload_pubkey(&item.payload, "market")?;
        let positions: Vec<Pubkey> = item
            .payload
            .get("positions")
            .and_then(|value| value.as_array())
            .ok_or_else(|| AppError::Internal("payload missing 'positions'".to_string()))?
            .iter()
            .map(|value| {
                value
                    .as_str()
                    .ok_or_else(|| AppError::Internal("position entry is not a string".to_string()))
                    .and_then(|text| {
                        text.parse::<Pubkey>().map_err(|e| {
                            AppError::Internal(format!("invalid position pubkey: {e}"))
                        })
                    })
            })
            .collect::<Result<_, _>>()?;

        let instruction = self.ctx.trigger.check_liquidations(&market, &positions)?;
        send_instruction(&self.ctx, chain, item.operation_type, &item.key, &instruction).await
    }
}
