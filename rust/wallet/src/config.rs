use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use starknet::core::types::Felt;
use tokio::time::sleep;
use tracing::debug;
use url::Url;

use crate::codec::parse_felt;
use crate::error::ClientError;
use crate::merkle::DEFAULT_TREE_DEPTH;
use crate::notes::Address;

pub const CONFIG_ENV: &str = "ZYLITH_WALLET_CONFIG";
pub const ASP_TIMEOUT_ENV: &str = "ZYLITH_ASP_TIMEOUT_SECS";
pub const PROVER_TIMEOUT_ENV: &str = "ZYLITH_PROVER_TIMEOUT_SECS";

const ASP_TIMEOUT_SECS: u64 = 60;
const PROVER_TIMEOUT_SECS: u64 = 300;
const MAX_PRICE_IMPACT_BPS: u128 = 500;
const POOL_FEE: u128 = 3000;
const MAX_TREE_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 500,
        }
    }
}

/// Runs `f` until it succeeds, fails with a non-retryable error, or attempts run out.
pub async fn with_retry<F, Fut, T>(retry: RetryConfig, mut f: F) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ClientError>>,
{
    let mut attempt = 0usize;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if !err.is_retryable() || attempt >= retry.max_attempts {
                    return Err(err);
                }
                debug!(attempt, error = %err, "retrying");
                sleep(Duration::from_millis(retry.delay_ms)).await;
            }
        }
    }
}

pub(crate) fn timeout_from_env(var: &str, default_secs: u64) -> Result<Duration, ClientError> {
    match std::env::var(var) {
        Ok(value) => {
            let secs = value
                .parse::<u64>()
                .map_err(|_| ClientError::Validation(format!("invalid {var}")))?;
            if secs == 0 {
                return Err(ClientError::Validation(format!("{var} must be > 0")));
            }
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(Duration::from_secs(default_secs)),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    asp_url: String,
    rpc_url: String,
    prover_url: String,
    pool_address: String,
    token0: String,
    token1: String,
    tree_depth: Option<usize>,
    prover_timeout_secs: Option<u64>,
    asp_timeout_secs: Option<u64>,
    retry: Option<RetryConfig>,
    max_price_impact_bps: Option<u128>,
    pool_fee: Option<u128>,
    strict_validation: Option<bool>,
    data_dir: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WalletConfig {
    pub asp_url: Url,
    pub rpc_url: Url,
    pub prover_url: Url,
    pub pool_address: Address,
    pub token0: Address,
    pub token1: Address,
    pub tree_depth: usize,
    pub prover_timeout: Duration,
    pub asp_timeout: Duration,
    pub retry: RetryConfig,
    pub max_price_impact_bps: u128,
    /// Parts per million.
    pub pool_fee: u128,
    pub strict_validation: bool,
    pub data_dir: PathBuf,
}

impl WalletConfig {
    /// Reads the TOML file named by `ZYLITH_WALLET_CONFIG`, or `wallet.toml`.
    pub fn load() -> Result<Self, ClientError> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "wallet.toml".to_string());
        Self::from_path(Path::new(&path))
    }

    pub fn from_path(path: &Path) -> Result<Self, ClientError> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| ClientError::Validation(format!("config {}: {err}", path.display())))?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_toml(&text, &base_dir)
    }

    pub fn from_toml(text: &str, base_dir: &Path) -> Result<Self, ClientError> {
        let raw: RawConfig = toml::from_str(text)?;
        finalize_config(raw, base_dir)
    }

    pub fn notes_path(&self) -> PathBuf {
        self.data_dir.join("notes.vault")
    }

    pub fn history_path(&self) -> PathBuf {
        self.data_dir.join("history.json")
    }

    pub fn sync_path(&self) -> PathBuf {
        self.data_dir.join("pool_state.json")
    }

    pub fn token_id(&self, token: Address) -> Result<u8, ClientError> {
        if token == self.token0 {
            Ok(0)
        } else if token == self.token1 {
            Ok(1)
        } else {
            Err(ClientError::Validation("unknown token".to_string()))
        }
    }
}

fn finalize_config(raw: RawConfig, base_dir: &Path) -> Result<WalletConfig, ClientError> {
    let asp_url = parse_url("asp_url", &raw.asp_url)?;
    let rpc_url = parse_url("rpc_url", &raw.rpc_url)?;
    let prover_url = parse_url("prover_url", &raw.prover_url)?;
    let pool_address = parse_address("pool_address", &raw.pool_address)?;
    let token0 = parse_address("token0", &raw.token0)?;
    let token1 = parse_address("token1", &raw.token1)?;
    if token0 == token1 {
        return Err(ClientError::Validation(
            "token0 and token1 must be different".to_string(),
        ));
    }

    let tree_depth = raw.tree_depth.unwrap_or(DEFAULT_TREE_DEPTH);
    if tree_depth == 0 || tree_depth > MAX_TREE_DEPTH {
        return Err(ClientError::Validation(format!(
            "tree_depth must be within 1..={MAX_TREE_DEPTH}"
        )));
    }
    let retry = raw.retry.unwrap_or_default();
    if retry.max_attempts == 0 {
        return Err(ClientError::Validation(
            "retry.max_attempts must be >= 1".to_string(),
        ));
    }
    let pool_fee = raw.pool_fee.unwrap_or(POOL_FEE);
    if pool_fee >= 1_000_000 {
        return Err(ClientError::Validation(
            "pool_fee must be below 1000000".to_string(),
        ));
    }
    let max_price_impact_bps = raw.max_price_impact_bps.unwrap_or(MAX_PRICE_IMPACT_BPS);
    if max_price_impact_bps > 10_000 {
        return Err(ClientError::Validation(
            "max_price_impact_bps must be <= 10000".to_string(),
        ));
    }

    let prover_timeout = timeout_override(
        PROVER_TIMEOUT_ENV,
        raw.prover_timeout_secs,
        PROVER_TIMEOUT_SECS,
        "prover_timeout_secs",
    )?;
    let asp_timeout = timeout_override(
        ASP_TIMEOUT_ENV,
        raw.asp_timeout_secs,
        ASP_TIMEOUT_SECS,
        "asp_timeout_secs",
    )?;

    let data_dir = resolve_path(base_dir, raw.data_dir.as_deref().unwrap_or("zylith-data"));

    Ok(WalletConfig {
        asp_url,
        rpc_url,
        prover_url,
        pool_address,
        token0,
        token1,
        tree_depth,
        prover_timeout,
        asp_timeout,
        retry,
        max_price_impact_bps,
        pool_fee,
        strict_validation: raw.strict_validation.unwrap_or(true),
        data_dir,
    })
}

fn timeout_override(
    var: &str,
    configured: Option<u64>,
    default_secs: u64,
    field: &str,
) -> Result<Duration, ClientError> {
    if std::env::var(var).is_ok() {
        return timeout_from_env(var, default_secs);
    }
    match configured {
        Some(0) => Err(ClientError::Validation(format!("{field} must be >= 1"))),
        Some(secs) => Ok(Duration::from_secs(secs)),
        None => Ok(Duration::from_secs(default_secs)),
    }
}

fn parse_url(field: &str, value: &str) -> Result<Url, ClientError> {
    Url::parse(value).map_err(|err| ClientError::Validation(format!("{field}: {err}")))
}

fn parse_address(field: &str, value: &str) -> Result<Felt, ClientError> {
    let address = parse_felt(value).map_err(|err| ClientError::Validation(format!("{field}: {err}")))?;
    if address == Felt::ZERO {
        return Err(ClientError::Validation(format!("{field} cannot be zero")));
    }
    Ok(address)
}

fn resolve_path(base: &Path, value: &str) -> PathBuf {
    let path = PathBuf::from(value);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}
