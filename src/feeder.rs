//! # feeder
//!
//! One pass of the `price-feeder` loop: for every configured asset, fetch the
//! aggregator's spot price and push it into the oracle contract.
//!
//! ```text
//! for (SYMBOL, contract) in ASSETS:
//!   QuoteClient::get_price(contract) → price (f64)
//!   units::price_to_micros(price)     → micros (i64)
//!   PriceRecorder::record_price(SYMBOL, micros)
//! ```
//!
//! A failing asset is logged and counted; the remaining assets still run.

use std::time::Duration;

use serde::Serialize;
use tracing::{error, info};

use crate::config::AssetRegistry;
use crate::engine::price_recorder::PriceRecorder;
use crate::engine::quote_client::QuoteClient;
use crate::units::price_to_micros;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleSummary {
    pub recorded: Vec<(String, i64)>,
    pub failed:   Vec<(String, String)>,
}

/// Runs one feed cycle. `pause` is waited between assets to stay under the
/// aggregator's rate limit.
pub async fn run_cycle(
    quotes:   &dyn QuoteClient,
    recorder: &dyn PriceRecorder,
    assets:   &AssetRegistry,
    pause:    Duration,
) -> CycleSummary {
    let mut summary = CycleSummary::default();

    for (i, (symbol, contract)) in assets.iter().enumerate() {
        if i > 0 && !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }

        let price = match quotes.get_price(contract).await {
            Ok(quote) => quote.price,
            Err(e) => {
                error!(asset = %symbol, error = %e, "❌ [FEEDER] Price fetch failed");
                summary.failed.push((symbol.to_string(), e.to_string()));
                continue;
            }
        };

        let micros = price_to_micros(price);
        info!(asset = %symbol, price, micros, "💰 [FEEDER] Price fetched");

        match recorder.record_price(symbol, micros).await {
            Ok(()) => summary.recorded.push((symbol.to_string(), micros)),
            Err(e) => summary.failed.push((symbol.to_string(), e.to_string())),
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SwapError;
    use crate::models::quote::{PriceQuote, Quote, QuoteRequest};

    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FixedPrices;

    #[async_trait]
    impl QuoteClient for FixedPrices {
        async fn get_quote(&self, _req: &QuoteRequest) -> Result<Quote, SwapError> {
            Err(SwapError::QuoteUnavailable("not used".into()))
        }

        async fn get_price(&self, asset: &str) -> Result<PriceQuote, SwapError> {
            match asset {
                "CXLM" => Ok(PriceQuote { asset: asset.into(), price: 0.1532, fetched_at: chrono::Utc::now() }),
                "CUSDC" => Ok(PriceQuote { asset: asset.into(), price: 1.0, fetched_at: chrono::Utc::now() }),
                _ => Err(SwapError::QuoteUnavailable("HTTP 404".into())),
            }
        }
    }

    #[derive(Default)]
    struct Recorded(Mutex<Vec<(String, i64)>>);

    #[async_trait]
    impl PriceRecorder for Recorded {
        async fn record_price(&self, asset_symbol: &str, price_micros: i64) -> Result<(), SwapError> {
            if asset_symbol == "USDC" {
                return Err(SwapError::PriceUpdateFailed("contract trapped".into()));
            }
            self.0.lock().unwrap().push((asset_symbol.to_string(), price_micros));
            Ok(())
        }
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_the_cycle() {
        let assets = AssetRegistry::parse("AQUA=CAQUA,USDC=CUSDC,XLM=CXLM").unwrap();
        let recorder = Recorded::default();

        let summary = run_cycle(&FixedPrices, &recorder, &assets, Duration::ZERO).await;

        assert_eq!(summary.recorded, vec![("XLM".to_string(), 153_200)]);
        assert_eq!(summary.failed.len(), 2);
        assert_eq!(summary.failed[0].0, "AQUA");
        assert!(summary.failed[1].1.contains("contract trapped"));
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }
}
