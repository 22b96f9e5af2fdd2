//! # engine::submitter
//!
//! **Submitter**: hands a signed envelope to the network exactly once.
//!
//! ## Outcome mapping
//! ```text
//! connection refused (nothing sent)      → Ok(status = FAILED)
//! timeout / transport error after send   → Err(AmbiguousSubmission)
//! HTTP 5xx                               → Err(AmbiguousSubmission)
//! HTTP 4xx                               → Ok(status = FAILED, error_detail)
//! body { status: SUCCESS, txHash }       → Ok(status = CONFIRMED)
//! body { status: PENDING }               → Ok(status = PENDING)
//! body { status: FAILED | ERROR }        → Ok(status = FAILED, error_detail)
//! ```
//! An ambiguous or pending outcome must be reconciled with [`Submitter::status`];
//! resubmitting the same envelope risks a double spend.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::engine::soroswap::SoroswapClient;
use crate::error::{snippet, SwapError};
use crate::models::transaction::{SignedTransaction, SubmissionReceipt, SubmissionResult};

#[async_trait]
pub trait Submitter: Send + Sync {
    /// Consumes the envelope; it cannot be sent again.
    async fn submit(&self, tx: SignedTransaction) -> Result<SubmissionResult, SwapError>;

    /// Current outcome of an earlier `submit`, looked up by digest.
    async fn status(&self, receipt: &SubmissionReceipt) -> Result<SubmissionResult, SwapError>;
}

#[derive(Debug, Serialize)]
struct SendBody<'a> {
    xdr: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    #[serde(default)]
    status:     Option<String>,
    #[serde(default, alias = "hash")]
    tx_hash:    Option<String>,
    /// Horizon-style bodies only carry `successful`.
    #[serde(default)]
    successful: Option<bool>,
    #[serde(default)]
    error:      Option<serde_json::Value>,
}

/// Maps a 2xx send/status body to a `SubmissionResult`.
fn interpret(digest: &str, body: &str) -> Result<SubmissionResult, SwapError> {
    let parsed: SendResponse = serde_json::from_str(body).map_err(|e| SwapError::AmbiguousSubmission {
        digest: digest.to_string(),
        detail: format!("unreadable submit body ({e}): {}", snippet(body)),
    })?;

    let hash = parsed.tx_hash.filter(|h| !h.trim().is_empty());
    let status = parsed.status.as_deref().map(str::to_ascii_uppercase);
    let error_detail = || {
        parsed
            .error
            .as_ref()
            .map(|e| match e {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| snippet(body))
    };

    match (status.as_deref(), parsed.successful) {
        (Some("SUCCESS") | Some("CONFIRMED"), _) | (None, Some(true)) => match hash {
            Some(hash) => Ok(SubmissionResult::confirmed(hash)),
            // Can't derive an idempotency key without a hash.
            None => Err(SwapError::AmbiguousSubmission {
                digest: digest.to_string(),
                detail: "confirmed without a transaction hash".into(),
            }),
        },
        (Some("PENDING") | Some("NOT_FOUND") | Some("TRY_AGAIN_LATER"), _) => Ok(SubmissionResult::pending(hash)),
        (Some("FAILED") | Some("ERROR"), _) | (None, Some(false)) => {
            let mut result = SubmissionResult::failed(error_detail());
            result.tx_hash = hash;
            Ok(result)
        }
        (other, _) => Err(SwapError::AmbiguousSubmission {
            digest: digest.to_string(),
            detail: format!("unrecognised submit status {other:?}: {}", snippet(body)),
        }),
    }
}

#[async_trait]
impl Submitter for SoroswapClient {
    async fn submit(&self, tx: SignedTransaction) -> Result<SubmissionResult, SwapError> {
        let digest = tx.digest.clone();

        info!(tx_id = %tx.id, digest = %digest, "🚀 [SUBMIT] Sending transaction");

        // ── HTTP POST (single attempt) ────────────────────────────────────────
        let sent = self
            .request(Method::POST, "/send", self.config().submit_timeout)
            .json(&SendBody { xdr: &tx.payload })
            .send()
            .await;
        drop(tx);

        let response = match sent {
            Ok(response) => response,
            Err(e) if e.is_connect() => {
                warn!(error = %e, digest = %digest, "Submit endpoint unreachable, nothing was sent");
                return Ok(SubmissionResult::failed(format!("submit endpoint unreachable: {e}")));
            }
            Err(e) => {
                error!(error = %e, digest = %digest, "Submit outcome unknown");
                return Err(SwapError::AmbiguousSubmission {
                    digest,
                    detail: format!("transport error after dispatch: {e}"),
                });
            }
        };

        let status = response.status();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                return Err(SwapError::AmbiguousSubmission {
                    digest,
                    detail: format!("HTTP {status}, body lost: {e}"),
                })
            }
        };

        if status.is_server_error() {
            error!(http_status = %status, digest = %digest, "Submit endpoint failed after accepting payload");
            return Err(SwapError::AmbiguousSubmission {
                digest,
                detail: format!("HTTP {status}: {}", snippet(&text)),
            });
        }
        if !status.is_success() {
            warn!(http_status = %status, body = %snippet(&text), "Submission rejected");
            return Ok(SubmissionResult::failed(format!("HTTP {status}: {}", snippet(&text))));
        }

        let result = interpret(&digest, &text)?;
        info!(
            digest  = %digest,
            status  = ?result.status,
            tx_hash = ?result.tx_hash,
            "[SUBMIT] Network answered"
        );
        Ok(result)
    }

    async fn status(&self, receipt: &SubmissionReceipt) -> Result<SubmissionResult, SwapError> {
        let ambiguous = |detail: String| SwapError::AmbiguousSubmission {
            digest: receipt.digest.clone(),
            detail,
        };

        let response = self
            .request(Method::GET, "/send/status", self.config().submit_timeout)
            .query(&[("digest", receipt.digest.as_str())])
            .send()
            .await
            .map_err(|e| ambiguous(format!("status endpoint unreachable: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ambiguous(format!("status body unreadable: {e}")))?;

        if status == StatusCode::NOT_FOUND {
            return Ok(SubmissionResult::pending(None));
        }
        if !status.is_success() {
            return Err(ambiguous(format!("HTTP {status}: {}", snippet(&text))));
        }
        interpret(&receipt.digest, &text)
    }
}
