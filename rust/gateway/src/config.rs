use std::error::Error;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

pub const CONFIG_ENV: &str = "ZYLITH_GATEWAY_CONFIG";

const REQUEST_TIMEOUT_SECS: u64 = 30;
const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    bind_addr: String,
    asp_url: String,
    rpc_url: String,
    request_timeout_secs: Option<u64>,
    max_body_bytes: Option<usize>,
    cors_allow_origins: Vec<String>,
    rate_limit_per_minute: u64,
    rate_limit_burst: u64,
    trust_proxy: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub asp_url: Url,
    pub rpc_url: Url,
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
    pub cors_allow_origins: Vec<String>,
    pub rate_limit_per_minute: u64,
    pub rate_limit_burst: u64,
    pub trust_proxy: bool,
}

pub fn load_config(path: &Path) -> Result<RawConfig, Box<dyn Error>> {
    let contents = fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    let config: RawConfig = toml::from_str(&contents)?;
    Ok(config)
}

pub fn finalize_config(raw: RawConfig) -> Result<GatewayConfig, Box<dyn Error>> {
    let bind_addr = raw
        .bind_addr
        .parse::<SocketAddr>()
        .map_err(|e| format!("invalid bind_addr: {e}"))?;
    let asp_url = upstream_url("asp_url", &raw.asp_url)?;
    let rpc_url = upstream_url("rpc_url", &raw.rpc_url)?;

    let request_timeout_secs = raw.request_timeout_secs.unwrap_or(REQUEST_TIMEOUT_SECS);
    if request_timeout_secs == 0 {
        return Err("request_timeout_secs must be >= 1".into());
    }
    let max_body_bytes = raw.max_body_bytes.unwrap_or(MAX_BODY_BYTES);
    if max_body_bytes == 0 {
        return Err("max_body_bytes must be >= 1".into());
    }
    if raw.cors_allow_origins.is_empty() {
        return Err("cors_allow_origins must not be empty".into());
    }
    if raw.rate_limit_per_minute == 0 {
        return Err("rate_limit_per_minute must be >= 1".into());
    }
    if raw.rate_limit_burst == 0 {
        return Err("rate_limit_burst must be >= 1".into());
    }

    Ok(GatewayConfig {
        bind_addr,
        asp_url,
        rpc_url,
        request_timeout: Duration::from_secs(request_timeout_secs),
        max_body_bytes,
        cors_allow_origins: raw.cors_allow_origins,
        rate_limit_per_minute: raw.rate_limit_per_minute,
        rate_limit_burst: raw.rate_limit_burst,
        trust_proxy: raw.trust_proxy.unwrap_or(false),
    })
}

fn upstream_url(name: &str, value: &str) -> Result<Url, Box<dyn Error>> {
    let url = Url::parse(value).map_err(|e| format!("{name}: {e}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("{name} must be http or https").into());
    }
    if url.query().is_some() {
        return Err(format!("{name} must not carry a query string").into());
    }
    Ok(url)
}
