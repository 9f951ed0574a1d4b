//! # tack server
//!
//! Realtime sync server for collaborative task boards.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! tack
//!
//! # Run with a config file at ./tack.toml or /etc/tack/tack.toml
//! tack
//!
//! # Run with environment variables
//! TACK_PORT=8080 TACK_HOST=0.0.0.0 tack
//! ```

mod config;
mod handlers;
mod metrics;
mod rest;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tack=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting tack server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
