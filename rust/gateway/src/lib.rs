//! Zylith gateway: forward-only ASP proxy and ledger RPC proxy.

pub mod config;
mod error;
mod limiter;
mod proxy;

pub use config::{finalize_config, load_config, GatewayConfig, RawConfig, CONFIG_ENV};
pub use error::GatewayError;
pub use limiter::{client_ip, RateLimiter};
pub use proxy::{router, serve, validate_jsonrpc, AppState};
