//! RaceReplay Server
//!
//! Serves interpolated replay frames for a session over HTTP

use anyhow::{Context, Result};
use clap::Parser;
use rr_server::{api, config, state};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = config::Args::parse();
    let config = config::ServerConfig::load(&args)?;

    info!("Starting RaceReplay Server with {:?} source", config.source);

    let bind = config.bind.clone();
    let state = state::AppState::from_config(config).context("building sample sources")?;
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {}", bind))?;
    info!("Server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}
