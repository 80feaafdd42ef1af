//! Environment-driven configuration.
//!
//! Everything operational is tunable through environment variables so one
//! container image serves every environment; only the endpoint list, the
//! program id, and the payer key are required.

use std::str::FromStr;
use std::time::Duration;

use solana_sdk::pubkey::Pubkey;

use crate::domain::{AppError, ConfigError};
use crate::infra::chain::EndpointConfig;

#[derive(Debug, Clone)]
pub struct Config {
    /// Weighted upstream RPC endpoints
    pub rpc_endpoints: Vec<EndpointConfig>,
    /// Path of the embedded operation store
    pub database_path: String,
    /// The confidential-exchange program this crank drives
    pub program_id: Pubkey,
    /// Base58-encoded payer secret key
    pub payer_secret: String,
    /// Master switch; a disabled crank exits immediately after startup
    pub enabled: bool,
    pub poll_interval: Duration,
    pub lock_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub max_consecutive_failures: u32,
    pub health_check_interval: Duration,
    pub stale_claim_after: Duration,
    pub max_concurrent: usize,
    pub max_retries: i64,
    pub retention: Duration,
}

fn required(name: &str) -> Result<String, AppError> {
    std::env::var(name).map_err(|_| AppError::Config(ConfigError::Missing(name.to_string())))
}

fn parse_or<T: FromStr>(name: &str, default: T) -> Result<T, AppError> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| {
            AppError::Config(ConfigError::Invalid {
                field: name.to_string(),
                message: format!("cannot parse '{raw}'"),
            })
        }),
        Err(_) => Ok(default),
    }
}

fn secs_or(name: &str, default: u64) -> Result<Duration, AppError> {
    Ok(Duration::from_secs(parse_or(name, default)?))
}

/// Parse `url@weight[,url@weight...]`; a bare URL gets weight 1.
fn parse_endpoints(raw: &str) -> Result<Vec<EndpointConfig>, AppError> {
    let mut endpoints = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (url, weight) = match entry.rsplit_once('@') {
            Some((url, weight)) => {
                let weight = weight.parse::<u32>().map_err(|_| {
                    AppError::Config(ConfigError::Invalid {
                        field: "RPC_ENDPOINTS".to_string(),
                        message: format!("invalid weight in '{entry}'"),
                    })
                })?;
                (url, weight)
            }
            None => (entry, 1),
        };
        endpoints.push(EndpointConfig::new(url, weight));
    }
    if endpoints.is_empty() {
        return Err(AppError::Config(ConfigError::Invalid {
            field: "RPC_ENDPOINTS".to_string(),
            message: "no endpoints configured".to_string(),
        }));
    }
    Ok(endpoints)
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let program_id_raw = required("EXCHANGE_PROGRAM_ID")?;
        let program_id = Pubkey::from_str(&program_id_raw).map_err(|e| {
            AppError::Config(ConfigError::Invalid {
                field: "EXCHANGE_PROGRAM_ID".to_string(),
                message: e.to_string(),
            })
        })?;

        Ok(Self {
            rpc_endpoints: parse_endpoints(&required("RPC_ENDPOINTS")?)?,
            database_path: parse_or("CRANK_DB_PATH", "crank.db".to_string())?,
            program_id,
            payer_secret: required("CRANK_PAYER_KEY")?,
            enabled: parse_or("CRANK_ENABLED", true)?,
            poll_interval: secs_or("CRANK_POLL_INTERVAL_SECS", 5)?,
            lock_ttl: secs_or("LOCK_TTL_SECS", 60)?,
            heartbeat_interval: secs_or("LOCK_HEARTBEAT_SECS", 20)?,
            max_consecutive_failures: parse_or("RPC_MAX_CONSECUTIVE_FAILURES", 3)?,
            health_check_interval: secs_or("RPC_HEALTH_CHECK_SECS", 30)?,
            stale_claim_after: secs_or("CRANK_STALE_CLAIM_SECS", 120)?,
            max_concurrent: parse_or("CRANK_MAX_CONCURRENT", 5)?,
            max_retries: parse_or("CRANK_MAX_RETRIES", 3)?,
            retention: secs_or("CRANK_RETENTION_SECS", 7 * 24 * 60 * 60)?,
        })
    }
}
