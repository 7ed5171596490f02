use market_collector::config::SettingsManager;
use market_collector::{AppState, Result};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        error!("Fatal: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Optional settings-file path as the only argument.
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let settings = SettingsManager::new(config_path).load()?;

    let state = AppState::new(settings)?;
    state.start();
    info!("Collection engine running, Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    state.shutdown().await;
    Ok(())
}
