//! # models::quote
//!
//! [`Quote`] is the aggregator's priced proposal for one swap. It is immutable
//! once received and only usable until its deadline.
//!
//! Expiry is tracked on a **monotonic** clock: the wall-clock `expiresAt` from
//! the API is turned into an [`Instant`] deadline at receipt, so a system clock
//! jump cannot revive a stale quote.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SwapError;
use crate::units::{self, Stroops};

/// Upper bound for slippage tolerance (100%).
pub const MAX_SLIPPAGE_BPS: u32 = 10_000;

// ─── QuoteRequest ─────────────────────────────────────────────────────────────

/// Input to `QuoteClient::get_quote`. Assets are Soroban contract addresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteRequest {
    pub asset_in:      String,
    pub asset_out:     String,
    pub amount:        Stroops,
    pub slippage_bps:  u32,
}

impl QuoteRequest {
    pub fn validate(&self) -> Result<(), SwapError> {
        if !self.amount.is_positive() {
            return Err(SwapError::InvalidRequest(format!(
                "amount must be > 0, got {}",
                self.amount
            )));
        }
        if self.slippage_bps > MAX_SLIPPAGE_BPS {
            return Err(SwapError::InvalidRequest(format!(
                "slippage tolerance {} bps outside 0..={MAX_SLIPPAGE_BPS}",
                self.slippage_bps
            )));
        }
        if self.asset_in.trim().is_empty() || self.asset_out.trim().is_empty() {
            return Err(SwapError::InvalidRequest("asset addresses must not be empty".into()));
        }
        if self.asset_in == self.asset_out {
            return Err(SwapError::InvalidRequest(format!(
                "asset_in and asset_out are both {}",
                self.asset_in
            )));
        }
        Ok(())
    }
}

// ─── Route ────────────────────────────────────────────────────────────────────

/// One leg of the aggregator's route plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteLeg {
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub path:     Vec<String>,
}

// ─── Quote ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct Quote {
    pub id:          Uuid,
    pub asset_in:    String,
    pub asset_out:   String,
    pub amount_in:   Stroops,
    pub amount_out:  Stroops,
    pub route:       Vec<RouteLeg>,
    /// Wall-clock expiry, for display only.
    pub expires_at:  DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    #[serde(skip)]
    deadline:        Instant,
    /// Aggregator body, echoed verbatim to the build endpoint.
    #[serde(skip)]
    raw:             serde_json::Value,
}

impl Quote {
    /// Builds a quote that stays usable for `valid_for` from now.
    pub fn new(
        asset_in:   impl Into<String>,
        asset_out:  impl Into<String>,
        amount_in:  Stroops,
        amount_out: Stroops,
        route:      Vec<RouteLeg>,
        valid_for:  Duration,
        raw:        serde_json::Value,
    ) -> Self {
        let received_at = Utc::now();
        let wall_ttl = chrono::Duration::from_std(valid_for).unwrap_or(chrono::Duration::zero());
        Self {
            id: Uuid::new_v4(),
            asset_in: asset_in.into(),
            asset_out: asset_out.into(),
            amount_in,
            amount_out,
            route,
            expires_at: received_at + wall_ttl,
            received_at,
            deadline: Instant::now() + valid_for,
            raw,
        }
    }

    /// Rejects quotes the pipeline must never act on.
    pub fn validate(&self) -> Result<(), SwapError> {
        if !self.amount_out.is_positive() {
            return Err(SwapError::InvalidQuote(format!(
                "amountOut must be > 0, got {}",
                self.amount_out
            )));
        }
        if self.route.is_empty() {
            return Err(SwapError::InvalidQuote("empty route".into()));
        }
        if self.is_expired() {
            return Err(SwapError::QuoteExpired { quote_id: self.id });
        }
        Ok(())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn time_left(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// `amount_out / amount_in` in whole units.
    pub fn execution_price(&self) -> Option<f64> {
        units::execution_price(self.amount_in, self.amount_out)
    }

    pub fn raw(&self) -> &serde_json::Value {
        &self.raw
    }
}

// ─── PriceQuote ───────────────────────────────────────────────────────────────

/// Spot price from the aggregator's `/price` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceQuote {
    pub asset:      String,
    pub price:      f64,
    pub fetched_at: DateTime<Utc>,
}
