use std::error::Error;
use std::path::PathBuf;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use zylith_gateway::{finalize_config, load_config, router, serve, AppState, CONFIG_ENV};

const DEFAULT_CONFIG_PATH: &str = "gateway.toml";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(err) = run().await {
        error!("{err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let config_path = std::env::var(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = finalize_config(load_config(&config_path)?)?;
    let bind_addr = config.bind_addr;
    info!(asp = %config.asp_url, rpc = %config.rpc_url, "proxy upstreams configured");

    let app = router(AppState::new(config)?)?;
    info!("zylith gateway listening on {bind_addr}");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    serve(listener, app).await?;
    Ok(())
}
