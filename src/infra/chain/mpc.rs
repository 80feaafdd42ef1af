//! Instruction builder for the confidential-exchange program.
//!
//! Each crank operation maps to exactly one program instruction that queues
//! an encrypted computation. The instruction data layout follows the Anchor
//! convention: an 8-byte method discriminator derived from the global method
//! name, followed by borsh-serialized arguments.

use sha2::{Digest, Sha256};
use solana_sdk::{
    instruction::{AccountMeta, Instruction},
    pubkey::Pubkey,
};

use crate::domain::{AppError, MpcTrigger};

/// Anchor global-namespace method discriminator
fn method_discriminator(name: &str) -> [u8; 8] {
    let digest = Sha256::digest(format!("global:{name}").as_bytes());
    let mut discriminator = [0u8; 8];
    discriminator.copy_from_slice(&digest[..8]);
    discriminator
}

/// [`MpcTrigger`] bound to one deployed program and one crank authority.
///
/// The authority signs every triggering transaction and pays the computation
/// fee; the program enforces that it is a permitted crank caller.
pub struct ProgramMpcTrigger {
    program_id: Pubkey,
    authority: Pubkey,
}

impl ProgramMpcTrigger {
    #[must_use]
    pub fn new(program_id: Pubkey, authority: Pubkey) -> Self {
        Self {
            program_id,
            authority,
        }
    }

    #[must_use]
    pub fn program_id(&self) -> &Pubkey {
        &self.program_id
    }

    fn instruction(&self, method: &str, accounts: Vec<AccountMeta>) -> Instruction {
        Instruction {
            program_id: self.program_id,
            accounts,
            data: method_discriminator(method).to_vec(),
        }
    }
}

impl MpcTrigger for ProgramMpcTrigger {
    fn match_orders(&self, bid: &Pubkey, ask: &Pubkey) -> Result<Instruction, AppError> {
        if bid == ask {
            return Err(AppError::Internal(
                "cannot match an order against itself".to_string(),
            ));
        }
        Ok(self.instruction(
            "match_orders",
            vec![
                AccountMeta::new(self.authority, true),
                AccountMeta::new(*bid, false),
                AccountMeta::new(*ask, false),
            ],
        ))
    }

    fn apply_margin_update(&self, position: &Pubkey) -> Result<Instruction, AppError> {
        Ok(self.instruction(
            "apply_margin_update",
            vec![
                AccountMeta::new(self.authority, true),
                AccountMeta::new(*position, false),
            ],
        ))
    }

    fn verify_position(&self, position: &Pubkey) -> Result<Instruction, AppError> {
        Ok(self.instruction(
            "verify_position_thresholds",
            vec![
                AccountMeta::new(self.authority, true),
                AccountMeta::new(*position, false),
            ],
        ))
    }

    fn check_liquidations(
        &self,
        market: &Pubkey,
        positions: &[Pubkey],
    ) -> Result<Instruction, AppError> {
        if positions.is_empty() {
            return Err(AppError::Internal(
                "liquidation check requires at least one position".to_string(),
            ));
        }
        let mut accounts = vec![
            AccountMeta::new(self.authority, true),
            AccountMeta::new_readonly(*market, false),
        ];
        accounts.extend(positions.iter().map(|p| AccountMeta::new(*p, false)));
        Ok(self.instruction("check_liquidation_batch", accounts))
    }
}
