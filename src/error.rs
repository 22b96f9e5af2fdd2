//! # error
//!
//! Typed errors for every stage of the swap pipeline, plus the HTTP-facing
//! [`AppError`].
//!
//! * [`SwapError`]     - what a single collaborator call can fail with.
//! * [`LedgerError`]   - caller errors from the position ledger (never retried).
//! * [`WorkflowError`] - what `SwapOrchestrator::execute` reports: the failing
//!   stage, the attempt count, and the underlying `SwapError`.
//!
//! Every handler returns `Result<_, AppError>`. Axum's `IntoResponse` impl
//! turns these into structured JSON bodies so callers always get a
//! machine-readable response, even on failure.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::engine::orchestrator::SwapStage;
use crate::models::position::UserId;

/// External response bodies are cut to this many characters in errors.
pub const SNIPPET_LEN: usize = 256;

/// Truncates an upstream body for inclusion in an error message.
pub fn snippet(body: &str) -> String {
    let body = body.trim();
    if body.chars().count() <= SNIPPET_LEN {
        return body.to_string();
    }
    let cut: String = body.chars().take(SNIPPET_LEN).collect();
    format!("{cut}…")
}

// ─── Ledger ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    #[error("user {user_id} already has an open position")]
    PositionAlreadyOpen { user_id: UserId },

    #[error("user {user_id} has no open position")]
    NoOpenPosition { user_id: UserId },

    #[error("invalid ledger input: {0}")]
    InvalidInput(String),

    /// The same confirmed submission was delivered to settlement twice.
    #[error("settlement {key} was already applied")]
    DuplicateSettlement { key: String },
}

// ─── Swap ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum SwapError {
    /// Rejected before any network call.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("quote unavailable: {0}")]
    QuoteUnavailable(String),

    #[error("invalid quote: {0}")]
    InvalidQuote(String),

    #[error("quote {quote_id} expired")]
    QuoteExpired { quote_id: Uuid },

    #[error("build failed: {0}")]
    BuildFailed(String),

    #[error("build response has no signable payload")]
    MissingPayload,

    /// Sent, but the outcome is unknown. Never resubmit; poll by digest.
    #[error("submission {digest} outcome unknown: {detail}")]
    AmbiguousSubmission { digest: String, detail: String },

    #[error("submission rejected: {0}")]
    SubmissionRejected(String),

    #[error("submission {digest} still unresolved after {attempts} status polls")]
    Unreconciled { digest: String, attempts: u32 },

    #[error("price update failed: {0}")]
    PriceUpdateFailed(String),

    /// Another workflow (or a parked settlement) already owns this user.
    #[error("a swap workflow is already in progress for user {user_id}")]
    WorkflowInProgress { user_id: UserId },

    #[error("workflow cancelled before submission")]
    Cancelled,

    #[error("deadline exceeded before {0} stage")]
    DeadlineExceeded(SwapStage),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl SwapError {
    /// Errors after which the whole workflow may safely start again from a
    /// fresh quote (nothing external was mutated).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SwapError::QuoteUnavailable(_) | SwapError::BuildFailed(_) | SwapError::QuoteExpired { .. }
        )
    }
}

// ─── Workflow ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum WorkflowError {
    /// Quoting kept failing; no side effects, caller may retry from scratch.
    #[error("quoting failed after {attempts} attempt(s): {source}")]
    RetryableQuote { attempts: u32, #[source] source: SwapError },

    /// Building kept failing; no side effects, caller may retry from scratch.
    #[error("building failed after {attempts} attempt(s): {source}")]
    RetryableBuild { attempts: u32, #[source] source: SwapError },

    #[error("{stage} stage failed: {source}")]
    Stage { stage: SwapStage, #[source] source: SwapError },
}

impl WorkflowError {
    pub fn at(stage: SwapStage, source: impl Into<SwapError>) -> Self {
        WorkflowError::Stage { stage, source: source.into() }
    }

    pub fn stage(&self) -> SwapStage {
        match self {
            WorkflowError::RetryableQuote { .. } => SwapStage::Quoting,
            WorkflowError::RetryableBuild { .. } => SwapStage::Building,
            WorkflowError::Stage { stage, .. } => *stage,
        }
    }

    pub fn source_error(&self) -> &SwapError {
        match self {
            WorkflowError::RetryableQuote { source, .. }
            | WorkflowError::RetryableBuild { source, .. }
            | WorkflowError::Stage { source, .. } => source,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, WorkflowError::RetryableQuote { .. } | WorkflowError::RetryableBuild { .. })
    }
}

// ─── HTTP ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AppError {
    /// The request payload was syntactically correct but semantically invalid.
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Swap(#[from] SwapError),

    /// Catch-all for unexpected failures.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

fn swap_status(err: &SwapError) -> StatusCode {
    match err {
        SwapError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        SwapError::Ledger(LedgerError::InvalidInput(_)) => StatusCode::BAD_REQUEST,
        SwapError::Ledger(_) | SwapError::WorkflowInProgress { .. } => StatusCode::CONFLICT,
        SwapError::InvalidQuote(_) | SwapError::SubmissionRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
        SwapError::AmbiguousSubmission { .. } | SwapError::Unreconciled { .. } => StatusCode::ACCEPTED,
        SwapError::Cancelled | SwapError::DeadlineExceeded(_) => StatusCode::REQUEST_TIMEOUT,
        SwapError::QuoteUnavailable(_)
        | SwapError::QuoteExpired { .. }
        | SwapError::BuildFailed(_)
        | SwapError::MissingPayload
        | SwapError::PriceUpdateFailed(_) => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message, stage, retryable) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None, false),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone(), None, false),
            AppError::Workflow(err) => (
                swap_status(err.source_error()),
                err.to_string(),
                Some(err.stage()),
                err.is_retryable(),
            ),
            AppError::Swap(err) => (swap_status(err), err.to_string(), None, err.is_transient()),
            AppError::Internal(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal error: {err}"),
                None,
                false,
            ),
        };

        let body = Json(json!({
            "ok":        false,
            "error":     message,
            "stage":     stage,
            "retryable": retryable,
        }));

        (status, body).into_response()
    }
}
