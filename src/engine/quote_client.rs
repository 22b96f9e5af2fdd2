//! # engine::quote_client
//!
//! **QuoteClient**: asks the aggregator for a swap quote and refuses to hand
//! back anything the pipeline must not act on.
//!
//! One network call per `get_quote`, no retries: quoting is idempotent, so
//! the orchestrator owns the retry policy.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::soroswap::SoroswapClient;
use crate::error::{snippet, SwapError};
use crate::models::quote::{PriceQuote, Quote, QuoteRequest, RouteLeg};
use crate::units::Stroops;

#[async_trait]
pub trait QuoteClient: Send + Sync {
    /// Validated quote for swapping `req.amount` of `asset_in` (exact in).
    async fn get_quote(&self, req: &QuoteRequest) -> Result<Quote, SwapError>;

    /// Spot price of `asset` (contract address).
    async fn get_price(&self, asset: &str) -> Result<PriceQuote, SwapError>;
}

// ─── Wire Format ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QuoteBody<'a> {
    asset_in:           &'a str,
    asset_out:          &'a str,
    amount:             Stroops,
    trade_type:         &'static str,
    protocols:          &'a [String],
    slippage_tolerance: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteResponse {
    #[serde(default)]
    amount_in:  Option<Stroops>,
    amount_out: Stroops,
    #[serde(default, alias = "routePlan")]
    route:      Vec<RouteLeg>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct PriceEntry {
    #[serde(default)]
    asset: Option<String>,
    price: PriceValue,
}

/// The price endpoint has sent both `"0.15"` and `0.15`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PriceValue {
    Number(f64),
    Text(String),
}

impl PriceValue {
    fn as_f64(&self) -> Option<f64> {
        match self {
            PriceValue::Number(n) => Some(*n),
            PriceValue::Text(s) => s.trim().parse().ok(),
        }
    }
}

// ─── Soroswap ─────────────────────────────────────────────────────────────────

#[async_trait]
impl QuoteClient for SoroswapClient {
    async fn get_quote(&self, req: &QuoteRequest) -> Result<Quote, SwapError> {
        req.validate()?;

        let cfg = self.config();
        let body = QuoteBody {
            asset_in:           &req.asset_in,
            asset_out:          &req.asset_out,
            amount:             req.amount,
            trade_type:         "EXACT_IN",
            protocols:          &cfg.protocols,
            slippage_tolerance: req.slippage_bps,
        };

        debug!(
            asset_in  = %req.asset_in,
            asset_out = %req.asset_out,
            amount    = %req.amount,
            slippage  = req.slippage_bps,
            "📊 [QUOTE] Requesting quote"
        );

        // ── HTTP POST ─────────────────────────────────────────────────────────
        let response = self
            .request(Method::POST, "/quote", cfg.quote_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "Quote endpoint unreachable");
                SwapError::QuoteUnavailable(format!("quote endpoint unreachable: {e}"))
            })?;

        // ── HTTP Status ───────────────────────────────────────────────────────
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| SwapError::QuoteUnavailable(format!("quote body unreadable: {e}")))?;
        if !status.is_success() {
            warn!(http_status = %status, body = %snippet(&text), "Quote endpoint returned HTTP error");
            return Err(SwapError::QuoteUnavailable(format!("HTTP {status}: {}", snippet(&text))));
        }

        // ── Parse ─────────────────────────────────────────────────────────────
        let raw: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
            SwapError::QuoteUnavailable(format!("malformed quote body ({e}): {}", snippet(&text)))
        })?;
        let parsed: QuoteResponse = serde_json::from_value(raw.clone()).map_err(|e| {
            SwapError::QuoteUnavailable(format!("malformed quote body ({e}): {}", snippet(&text)))
        })?;

        let valid_for = match parsed.expires_at {
            Some(expires_at) => (expires_at - Utc::now()).to_std().unwrap_or_default(),
            None => cfg.quote_ttl,
        };

        let quote = Quote::new(
            req.asset_in.clone(),
            req.asset_out.clone(),
            parsed.amount_in.unwrap_or(req.amount),
            parsed.amount_out,
            parsed.route,
            valid_for,
            raw,
        );

        // ── Validate ──────────────────────────────────────────────────────────
        quote.validate()?;

        info!(
            quote_id   = %quote.id,
            amount_in  = %quote.amount_in,
            amount_out = %quote.amount_out,
            hops       = quote.route.len(),
            ttl_ms     = quote.time_left().as_millis() as u64,
            "✅ [QUOTE] Quote received"
        );

        Ok(quote)
    }

    async fn get_price(&self, asset: &str) -> Result<PriceQuote, SwapError> {
        if asset.trim().is_empty() {
            return Err(SwapError::InvalidRequest("asset must not be empty".into()));
        }

        let response = self
            .request(Method::GET, "/price", self.config().quote_timeout)
            .query(&[("asset", asset)])
            .send()
            .await
            .map_err(|e| SwapError::QuoteUnavailable(format!("price endpoint unreachable: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| SwapError::QuoteUnavailable(format!("price body unreadable: {e}")))?;
        if !status.is_success() {
            return Err(SwapError::QuoteUnavailable(format!("HTTP {status}: {}", snippet(&text))));
        }

        // The endpoint answers with an array; the first element is ours.
        let entries: Vec<PriceEntry> = serde_json::from_str(&text).map_err(|e| {
            SwapError::QuoteUnavailable(format!("malformed price body ({e}): {}", snippet(&text)))
        })?;
        let first = entries
            .into_iter()
            .next()
            .ok_or_else(|| SwapError::InvalidQuote(format!("no price returned for {asset}")))?;
        let price = first
            .price
            .as_f64()
            .filter(|p| p.is_finite() && *p > 0.0)
            .ok_or_else(|| SwapError::InvalidQuote(format!("unusable price for {asset}")))?;

        Ok(PriceQuote {
            asset: first.asset.unwrap_or_else(|| asset.to_string()),
            price,
            fetched_at: Utc::now(),
        })
    }
}
