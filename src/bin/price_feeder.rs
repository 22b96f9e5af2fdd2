//! # price-feeder
//!
//! Standalone loop that keeps the on-chain price oracle in step with the
//! Soroswap aggregator.
//!
//! ## Flow
//! ```text
//! loop every FEED_INTERVAL_SECS:
//!   1. GET  /price?asset=<contract>       (per configured asset)
//!   2. price → micro-units
//!   3. stellar contract invoke … update_price_from_oracle
//! ```

use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use meridian::config::FeederConfig;
use meridian::engine::{SoroswapClient, StellarCliRecorder};
use meridian::feeder::run_cycle;

/// Gap between assets inside one cycle.
const ASSET_PAUSE: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env()
            .add_directive("meridian=debug".parse()?)
            .add_directive("price_feeder=debug".parse()?)
            .add_directive("reqwest=warn".parse()?))
        .init();

    let config = FeederConfig::from_env().context("Failed to load config")?;
    let client = SoroswapClient::new(reqwest::Client::new(), config.soroswap.clone());
    let recorder = StellarCliRecorder::new(config.contract.clone());

    info!(
        contract = %config.contract.contract_id,
        network  = %config.contract.network,
        assets   = config.assets.iter().count(),
        interval = ?config.interval,
        "🚀 Price feeder started"
    );

    // ── Feed Loop ─────────────────────────────────────────────────────────────
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }

        info!("📊 Feed cycle starting...");
        let summary = run_cycle(&client, &recorder, &config.assets, ASSET_PAUSE).await;

        if summary.failed.is_empty() {
            info!(recorded = summary.recorded.len(), "✅ Feed cycle complete");
        } else {
            warn!(
                recorded = summary.recorded.len(),
                failed   = ?summary.failed,
                "Feed cycle finished with failures, retrying next interval"
            );
        }
    }

    Ok(())
}
