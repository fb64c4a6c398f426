//! Quarto Match Server
//!
//! Reads configuration from `QUARTO_*` environment variables and serves
//! matches until Ctrl+C.

use std::sync::Arc;
use std::time::Duration;
use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use quarto::{FileRatingStore, GameServer, ServerConfig, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Quarto Server v{}", VERSION);

    let config = ServerConfig::from_env().context("reading configuration")?;
    info!("Bind address: {}", config.bind_addr);
    info!("Pairing: {:?}", config.pairing);

    let ratings = FileRatingStore::open(&config.ratings_path)
        .with_context(|| format!("opening rating file {}", config.ratings_path.display()))?;

    let server = GameServer::new(config, Arc::new(ratings));

    let run = server.run();
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C received, shutting down");
            server.shutdown();
            if tokio::time::timeout(Duration::from_secs(5), &mut run).await.is_err() {
                warn!("Server did not stop in time");
            }
        }
    }

    Ok(())
}
