//! Decoded views of the exchange's on-chain accounts.
//!
//! The crank only reads the fields it needs for eligibility decisions; the
//! authoritative layout belongs to the on-chain program. Accounts carry an
//! 8-byte discriminator prefix ahead of the borsh body.

use borsh::BorshDeserialize;
use solana_sdk::pubkey::Pubkey;

use super::error::{AppError, ChainError};

/// Discriminator prefix length on program accounts
pub const DISCRIMINATOR_LEN: usize = 8;

/// Position side
#[derive(BorshDeserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSide {
    Long,
    Short,
}

/// Position lifecycle status
#[derive(BorshDeserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionStatus {
    Open,
    Closed,
    Liquidated,
    AutoDeleveraged,
    /// Awaiting MPC verification of liquidation eligibility
    PendingLiquidationCheck,
}

/// Crank-relevant view of a confidential position account
#[derive(BorshDeserialize, Debug, Clone)]
pub struct PositionView {
    pub trader: [u8; 32],
    pub market: [u8; 32],
    pub position_id: [u8; 16],
    pub side: PositionSide,
    pub status: PositionStatus,
    /// Whether the encrypted liquidation thresholds have been MPC-verified
    pub threshold_verified: bool,
    /// Pending margin-change computation id; all zeros when none
    pub pending_margin_request: [u8; 32],
}

impl PositionView {
    pub fn is_open(&self) -> bool {
        matches!(self.status, PositionStatus::Open)
    }

    pub fn has_pending_margin_request(&self) -> bool {
        self.pending_margin_request != [0u8; 32]
    }

    /// Threshold verification is still outstanding for this position
    pub fn needs_verification(&self) -> bool {
        self.is_open() && !self.threshold_verified
    }

    /// Eligible for a batch MPC liquidation-eligibility check
    pub fn can_be_liquidation_checked(&self) -> bool {
        self.is_open() && self.threshold_verified
    }

    pub fn trader_pubkey(&self) -> Pubkey {
        Pubkey::new_from_array(self.trader)
    }

    pub fn market_pubkey(&self) -> Pubkey {
        Pubkey::new_from_array(self.market)
    }
}

/// Order side
#[derive(BorshDeserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Bid,
    Ask,
}

/// Order lifecycle status
#[derive(BorshDeserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Active,
    Filled,
    Cancelled,
    Expired,
}

/// Crank-relevant view of a confidential order account
#[derive(BorshDeserialize, Debug, Clone)]
pub struct OrderView {
    pub owner: [u8; 32],
    pub pair: [u8; 32],
    pub side: OrderSide,
    pub status: OrderStatus,
    /// Set while an MPC price comparison is in flight
    pub is_matching: bool,
    /// Pending match computation id; all zeros when none
    pub pending_match_request: [u8; 32],
}

impl OrderView {
    /// Active and not already claimed by an in-flight match
    pub fn can_match(&self) -> bool {
        matches!(self.status, OrderStatus::Active) && !self.is_matching
    }

    pub fn has_pending_match(&self) -> bool {
        self.pending_match_request != [0u8; 32]
    }

    pub fn pair_pubkey(&self) -> Pubkey {
        Pubkey::new_from_array(self.pair)
    }
}

/// Strip the discriminator and borsh-decode an account body.
///
/// Trailing bytes are tolerated: the on-chain structs carry encrypted fields
/// the crank never reads.
pub fn decode_account<T: BorshDeserialize>(address: &Pubkey, data: &[u8]) -> Result<T, AppError> {
    if data.len() <= DISCRIMINATOR_LEN {
        return Err(AppError::Chain(ChainError::MalformedAccount {
            address: address.to_string(),
            reason: format!("account data too short: {} bytes", data.len()),
        }));
    }
    let mut body = &data[DISCRIMINATOR_LEN..];
    T::deserialize(&mut body).map_err(|e| {
        AppError::Chain(ChainError::MalformedAccount {
            address: address.to_string(),
            reason: e.to_string(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use borsh::BorshSerialize;

    #[derive(BorshSerialize)]
    struct RawPosition {
        trader: [u8; 32],
        market: [u8; 32],
        position_id: [u8; 16],
        side: u8,
        status: u8,
        threshold_verified: bool,
        pending_margin_request: [u8; 32],
        // Encrypted tail the crank must tolerate and ignore
        encrypted_tail: [u8; 64],
    }

    fn encoded_position(status: u8, verified: bool, pending: [u8; 32]) -> Vec<u8> {
        let raw = RawPosition {
            trader: [1u8; 32],
            market: [2u8; 32],
            position_id: [3u8; 16],
            side: 0,
            status,
            threshold_verified: verified,
            pending_margin_request: pending,
            encrypted_tail: [9u8; 64],
        };
        let mut data = vec![0u8; DISCRIMINATOR_LEN];
        raw.serialize(&mut data).unwrap();
        data
    }

    #[test]
    fn test_decode_position_with_trailing_bytes() {
        let data = encoded_position(0, true, [7u8; 32]);
        let view: PositionView = decode_account(&Pubkey::new_unique(), &data).unwrap();

        assert!(view.is_open());
        assert!(view.can_be_liquidation_checked());
        assert!(view.has_pending_margin_request());
        assert_eq!(view.trader_pubkey(), Pubkey::new_from_array([1u8; 32]));
    }

    #[test]
    fn test_decode_rejects_short_data() {
        let err = decode_account::<PositionView>(&Pubkey::new_unique(), &[0u8; 4]).unwrap_err();
        assert!(matches!(
            err,
            AppError::Chain(ChainError::MalformedAccount { .. })
        ));
    }

    #[test]
    fn test_unverified_open_position_needs_verification() {
        let data = encoded_position(0, false, [0u8; 32]);
        let view: PositionView = decode_account(&Pubkey::new_unique(), &data).unwrap();

        assert!(view.needs_verification());
        assert!(!view.can_be_liquidation_checked());
        assert!(!view.has_pending_margin_request());
    }

    #[test]
    fn test_closed_position_is_never_eligible() {
        let data = encoded_position(1, true, [7u8; 32]);
        let view: PositionView = decode_account(&Pubkey::new_unique(), &data).unwrap();

        assert!(!view.is_open());
        assert!(!view.needs_verification());
        assert!(!view.can_be_liquidation_checked());
    }
}
