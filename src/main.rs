use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod cache;
mod config;
mod downloads;
mod error;
mod preview;
mod progress;
mod server;
mod ytdlp;

use cache::CacheStore;
use config::Config;
use downloads::DownloadManager;
use progress::ProgressBroadcaster;
use server::AppState;
use ytdlp::YtDlp;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    let cache = CacheStore::new(config.cache_dir.clone(), config.retention)
        .context("could not initialize cache directory")?;

    // Periodic eviction. The first tick fires immediately, so files left
    // over from a previous run are swept at startup.
    let sweeper = cache.clone();
    let sweep_every = config.sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_every);
        loop {
            ticker.tick().await;
            let removed = sweeper.evict_expired();
            if removed > 0 {
                info!("[cache] sweep removed {} expired file(s)", removed);
            }
        }
    });

    let state = AppState {
        downloads: DownloadManager::new(cache, YtDlp::from_env(), ProgressBroadcaster::new(256)),
        http: reqwest::Client::new(),
    };

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("could not bind port {}", config.port))?;
    info!("Server running on port {}", config.port);

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("shutdown signal received, stopping");
}
