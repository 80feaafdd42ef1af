use std::sync::Arc;

use anyhow::Context;
use solana_sdk::signer::Signer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use solana_mpc_crank::app::jobs::{
    JobContext, LiquidationJob, MarginJob, MatchingJob, VerificationJob,
};
use solana_mpc_crank::app::{
    CrankConfig, CrankService, LockService, LockServiceConfig, PollProcessor, ProcessorConfig,
};
use solana_mpc_crank::app::processor::JobFamily;
use solana_mpc_crank::config::Config;
use solana_mpc_crank::domain::MpcTrigger;
use solana_mpc_crank::infra::chain::{
    FailoverConfig, FailoverManager, ProgramMpcTrigger, RpcChainClient, keypair_from_base58,
};
use solana_mpc_crank::infra::store::{SqliteStore, StoreConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().context("loading configuration")?;
    if !config.enabled {
        info!("Crank disabled via CRANK_ENABLED, exiting");
        return Ok(());
    }

    let payer = Arc::new(
        keypair_from_base58(&config.payer_secret).context("parsing CRANK_PAYER_KEY")?,
    );
    info!(payer = %payer.pubkey(), program = %config.program_id, "Starting crank");

    let store = Arc::new(
        SqliteStore::open(&config.database_path, StoreConfig::default())
            .await
            .context("opening operation store")?,
    );

    let locks = Arc::new(LockService::new(
        Arc::clone(&store),
        LockServiceConfig {
            default_ttl: config.lock_ttl,
            heartbeat_interval: config.heartbeat_interval,
        },
    ));

    let chain = Arc::new(
        FailoverManager::new(
            config.rpc_endpoints.clone(),
            FailoverConfig {
                max_consecutive_failures: config.max_consecutive_failures,
                health_check_interval: config.health_check_interval,
            },
            Box::new(|url| Arc::new(RpcChainClient::with_defaults(url))),
        )
        .context("building failover pool")?
        .with_endpoint_change_callback(Box::new(|old, new, reason| {
            warn!(from = old, to = new, reason, "RPC endpoint changed");
        })),
    );

    let trigger: Arc<dyn MpcTrigger> =
        Arc::new(ProgramMpcTrigger::new(config.program_id, payer.pubkey()));
    let ctx = JobContext::new(
        config.program_id,
        Arc::clone(&payer),
        trigger,
        Arc::clone(&store),
    );

    let processor_config = ProcessorConfig {
        poll_interval: config.poll_interval,
        stale_claim_after: config.stale_claim_after,
        max_concurrent: config.max_concurrent,
        max_retries: config.max_retries,
    };

    let families: Vec<Arc<dyn JobFamily>> = vec![
        Arc::new(MarginJob::new(ctx.clone())),
        Arc::new(VerificationJob::new(ctx.clone())),
        Arc::new(LiquidationJob::new(ctx.clone())),
        Arc::new(MatchingJob::new(ctx)),
    ];
    let processors: Vec<Arc<PollProcessor>> = families
        .into_iter()
        .map(|family| {
            Arc::new(PollProcessor::new(
                family,
                Arc::clone(&store),
                Arc::clone(&chain),
                Arc::clone(&locks),
                processor_config.clone(),
            ))
        })
        .collect();

    let crank = CrankService::new(
        Arc::clone(&store),
        chain,
        locks,
        processors,
        CrankConfig {
            retention: config.retention,
            startup_stale_after: config.stale_claim_after,
        },
    );

    crank.start().await.context("starting crank service")?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    crank.shutdown().await;
    store.close().await;
    Ok(())
}
