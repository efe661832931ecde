//! predfund - prediction-market fund backend
//!
//! Serves the fund lifecycle, share accounting, snapshot ledger and venue
//! quotes over HTTP.

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use predfund_backend::{
    api,
    config::AppConfig,
    fund::{FundDb, FundService},
    markets::{HttpMarketAdapter, MarketAdapters, Venue},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize environment and logging
    load_env();
    init_tracing();

    let config = AppConfig::parse();
    info!("Starting predfund v{}", env!("CARGO_PKG_VERSION"));

    let db_path = config.resolved_db_path();
    let db = FundDb::new(&db_path).context("Failed to open fund database")?;
    info!("Fund database initialized at: {}", db_path);

    let settings = config.adapter_settings();
    let adapters = MarketAdapters::new()
        .with(Arc::new(
            HttpMarketAdapter::new(Venue::Polygon, &config.polygon_api_base, settings.clone())
                .context("Failed to build Polygon adapter")?,
        ))
        .with(Arc::new(
            HttpMarketAdapter::new(Venue::Solana, &config.solana_api_base, settings.clone())
                .context("Failed to build Solana adapter")?,
        ));
    info!(
        timeout_secs = settings.timeout.as_secs(),
        max_attempts = settings.max_attempts,
        "Venue adapters ready: {}, {}",
        config.polygon_api_base,
        config.solana_api_base
    );

    let funds = FundService::new(db, adapters, config.fund_defaults());
    let app = api::app(funds);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("API server listening on {}", config.bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("Server error")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "predfund_backend=debug,predfund=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // Also try the crate directory when launched with --manifest-path from elsewhere
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidate = manifest_dir.join(".env");
    if candidate.exists() {
        let _ = dotenv::from_path(&candidate);
    }
}
