//! # engine::builder
//!
//! **TransactionBuilder**: exchanges a validated quote for a signed,
//! submittable envelope.
//!
//! The signing key never enters this process: the build collaborator returns
//! an envelope that is already signed for `from`.

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::soroswap::SoroswapClient;
use crate::error::{snippet, SwapError};
use crate::models::quote::Quote;
use crate::models::transaction::SignedTransaction;

#[async_trait]
pub trait TransactionBuilder: Send + Sync {
    /// Fails with `QuoteExpired` before any network call when the quote's
    /// monotonic deadline has passed.
    async fn build(&self, quote: &Quote, from: &str, to: &str) -> Result<SignedTransaction, SwapError>;
}

#[derive(Debug, Serialize)]
struct BuildBody<'a> {
    quote: &'a serde_json::Value,
    from:  &'a str,
    to:    &'a str,
}

#[derive(Debug, Deserialize)]
struct BuildResponse {
    #[serde(default, alias = "payload")]
    xdr: Option<String>,
}

#[async_trait]
impl TransactionBuilder for SoroswapClient {
    async fn build(&self, quote: &Quote, from: &str, to: &str) -> Result<SignedTransaction, SwapError> {
        // ── Guard: expiry (monotonic) ─────────────────────────────────────────
        if quote.is_expired() {
            warn!(quote_id = %quote.id, "Quote expired before build");
            return Err(SwapError::QuoteExpired { quote_id: quote.id });
        }
        if from.trim().is_empty() || to.trim().is_empty() {
            return Err(SwapError::InvalidRequest("from/to address must not be empty".into()));
        }

        let body = BuildBody { quote: quote.raw(), from, to };

        // ── HTTP POST ─────────────────────────────────────────────────────────
        let response = self
            .request(Method::POST, "/quote/build", self.config().build_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| SwapError::BuildFailed(format!("build endpoint unreachable: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| SwapError::BuildFailed(format!("build body unreadable: {e}")))?;
        if !status.is_success() {
            warn!(http_status = %status, body = %snippet(&text), "Build endpoint returned HTTP error");
            return Err(SwapError::BuildFailed(format!("HTTP {status}: {}", snippet(&text))));
        }

        // ── Parse ─────────────────────────────────────────────────────────────
        let parsed: BuildResponse = serde_json::from_str(&text).map_err(|e| {
            SwapError::BuildFailed(format!("malformed build body ({e}): {}", snippet(&text)))
        })?;
        let payload = parsed
            .xdr
            .filter(|x| !x.trim().is_empty())
            .ok_or(SwapError::MissingPayload)?;

        let tx = SignedTransaction::new(payload, quote.id);
        info!(
            quote_id = %quote.id,
            tx_id    = %tx.id,
            digest   = %tx.digest,
            "🔨 [BUILD] Transaction built"
        );
        Ok(tx)
    }
}
