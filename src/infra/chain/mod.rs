//! Chain-facing infrastructure: the RPC client, the weighted failover pool,
//! and the MPC instruction builder.

pub mod failover;
pub mod mpc;
pub mod rpc;

pub use failover::{
    ConnectFn, EndpointChangeFn, EndpointConfig, ExecuteOptions, FailoverConfig, FailoverManager,
};
pub use mpc::ProgramMpcTrigger;
pub use rpc::{RpcChainClient, RpcClientConfig, keypair_from_base58};
