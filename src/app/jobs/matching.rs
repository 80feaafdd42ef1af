//! Order matching.
//!
//! Pairs an eligible bid with an eligible ask on the same pair and queues an
//! encrypted price comparison. Whether they actually cross is decided inside
//! the MPC computation; a non-crossing pair comes back as a no-op. Cycles
//! run under the fleet-wide matching lock so two instances never queue
//! comparisons for the same orders, and the program's log stream wakes the
//! processor early when a new order lands.

use async_trait::async_trait;
use solana_sdk::{pubkey::Pubkey, signature::Signature};
use std::collections::BTreeMap;

use crate::app::processor::JobFamily;
use crate::domain::{
    AppError, OperationType, WorkItem, accounts::{OrderSide, OrderView}, lock_names, operation_key,
};
use crate::infra::chain::FailoverManager;

use super::{JobContext, payload_pubkey, scan_accounts, send_instruction};

pub struct MatchingJob {
    ctx: JobContext,
}

impl MatchingJob {
    #[must_use]
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }

    /// Pair eligible bids and asks per trading pair, first-come order.
    fn pair_orders(orders: Vec<(Pubkey, OrderView)>) -> Vec<(Pubkey, Pubkey)> {
        let mut by_pair: BTreeMap<Pubkey, (Vec<Pubkey>, Vec<Pubkey>)> = BTreeMap::new();
        for (address, view) in orders {
            if !view.can_match() {
                continue;
            }
            let entry = by_pair.entry(view.pair_pubkey()).or_default();
            match view.side {
                OrderSide::Bid => entry.0.push(address),
                OrderSide::Ask => entry.1.push(address),
            }
        }

        let mut pairs = Vec::new();
        for (_, (mut bids, mut asks)) in by_pair {
            bids.sort();
            asks.sort();
            pairs.extend(bids.into_iter().zip(asks));
        }
        pairs
    }
}

#[async_trait]
impl JobFamily for MatchingJob {
    fn name(&self) -> &'static str {
        "matching"
    }

    fn operation_type(&self) -> OperationType {
        OperationType::Match
    }

    fn lock_name(&self) -> Option<&'static str> {
        Some(lock_names::ORDER_MATCHING)
    }

    fn event_program(&self) -> Option<Pubkey> {
        Some(self.ctx.program_id)
    }

    async fn fetch_candidates(&self, chain: &FailoverManager) -> Result<Vec<WorkItem>, AppError> {
        let orders: Vec<(Pubkey, OrderView)> =
            scan_accounts(chain, &self.ctx.program_id, "ConfidentialOrder").await?;

        Ok(Self::pair_orders(orders)
            .into_iter()
            .map(|(bid, ask)| WorkItem {
                key: operation_key(OperationType::Match, &[&bid, &ask]),
                operation_type: OperationType::Match,
                address: bid,
                payload: serde_json::json!({
                    "bid": bid.to_string(),
                    "ask": ask.to_string(),
                }),
            })
            .collect())
    }

    async fn submit(
        &self,
        chain: &FailoverManager,
        item: &WorkItem,
    ) -> Result<Signature, AppError> {
        let bid = payload_pubkey(&item.payload, "bid")?;
        let ask = payload_pubkey(&item.payload, "ask")?;
        let instruction = self.ctx.trigger.match_orders(&bid, &ask)?;
        send_instruction(&self.ctx, chain, item.operation_type, &item.key, &instruction).await
    }
}
