//! Off-chain crank for an MPC-backed confidential exchange.
//!
//! The on-chain program cannot act on its own: margin requests, threshold
//! verification, liquidation checks, and order matching all need an
//! off-chain caller to notice eligible state and submit the triggering
//! transaction. This crate is that caller, built to run as a fleet:
//! distributed locks partition mutually-exclusive work, a weighted failover
//! pool rides out RPC endpoint incidents, and an embedded ledger makes every
//! operation idempotent across crashes and restarts.

pub mod app;
pub mod config;
pub mod domain;
pub mod infra;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use app::{CrankConfig, CrankService, JobFamily, LockService, PollProcessor};
pub use config::Config;
pub use domain::{AppError, ErrorKind};
pub use infra::chain::FailoverManager;
pub use infra::store::SqliteStore;
