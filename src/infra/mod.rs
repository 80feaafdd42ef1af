//! Infrastructure layer: durable storage and chain connectivity.

pub mod chain;
pub mod store;

pub use chain::{FailoverManager, RpcChainClient};
pub use store::SqliteStore;
