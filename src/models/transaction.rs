//! # models::transaction
//!
//! `SignedTransaction` = payload that is ready to send, owned by exactly one
//! orchestration attempt.
//! `SubmissionReceipt` = what is left after it has been sent, used to poll
//! for the outcome.
//! `SubmissionResult`  = the network's answer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ─── SignedTransaction ────────────────────────────────────────────────────────

/// A signed, submittable transaction envelope.
///
/// Deliberately not `Clone`: `Submitter::submit` takes it by value, so the
/// same envelope cannot be handed to the network twice.
#[derive(Debug)]
pub struct SignedTransaction {
    pub id:        Uuid,
    /// Base64 XDR envelope as returned by the build endpoint.
    pub payload:   String,
    /// SHA-256 of `payload`, hex encoded. Stable reconciliation handle.
    pub digest:    String,
    pub quote_id:  Uuid,
    pub built_at:  DateTime<Utc>,
}

impl SignedTransaction {
    pub fn new(payload: String, quote_id: Uuid) -> Self {
        let digest = payload_digest(&payload);
        Self {
            id: Uuid::new_v4(),
            payload,
            digest,
            quote_id,
            built_at: Utc::now(),
        }
    }

    pub fn receipt(&self) -> SubmissionReceipt {
        SubmissionReceipt {
            tx_id:        self.id,
            digest:       self.digest.clone(),
            submitted_at: Utc::now(),
        }
    }
}

pub fn payload_digest(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}

// ─── SubmissionReceipt ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub tx_id:        Uuid,
    pub digest:       String,
    pub submitted_at: DateTime<Utc>,
}

// ─── SubmissionResult ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    /// Accepted by the network, not yet in a closed ledger.
    Pending,
    Confirmed,
    /// Definitively rejected (or never sent).
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub status:       SubmissionStatus,
    pub tx_hash:      Option<String>,
    pub error_detail: Option<String>,
}

impl SubmissionResult {
    pub fn confirmed(tx_hash: impl Into<String>) -> Self {
        Self { status: SubmissionStatus::Confirmed, tx_hash: Some(tx_hash.into()), error_detail: None }
    }

    pub fn pending(tx_hash: Option<String>) -> Self {
        Self { status: SubmissionStatus::Pending, tx_hash, error_detail: None }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self { status: SubmissionStatus::Failed, tx_hash: None, error_detail: Some(detail.into()) }
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == SubmissionStatus::Confirmed
    }
}
