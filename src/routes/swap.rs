//! # routes::swap
//!
//! | Method | Path                          | Description                          |
//! |--------|-------------------------------|--------------------------------------|
//! | POST   | `/api/swap/quote`             | Preview a quote (no side effects)    |
//! | POST   | `/api/swap/execute`           | Run an open/close intent end to end  |
//! | POST   | `/api/swap/reconcile/:digest` | Resume a parked settlement           |
//!
//! Amounts in request bodies are whole token units (`"amount": 100` = 100 XLM).

use std::time::{Duration, Instant};

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::info;

use crate::engine::orchestrator::{CancelToken, ExecutionReport, IntentKind, TradeIntent};
use crate::error::{AppError, SwapError, WorkflowError};
use crate::events::WsEvent;
use crate::models::position::{Side, UserId};
use crate::state::SharedState;
use crate::units::Stroops;

fn to_stroops(amount: f64) -> Result<Stroops, AppError> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(AppError::BadRequest(format!("amount must be a positive number, got {amount}")));
    }
    Ok(Stroops::from_units(amount))
}

// ─── Quote Preview ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct QuoteBody {
    pub asset:        String,
    pub quote_asset:  String,
    pub amount:       f64,
    pub slippage_bps: Option<u32>,
}

/// POST /api/swap/quote
pub async fn preview_quote(
    State(state): State<SharedState>,
    Json(body): Json<QuoteBody>,
) -> Result<impl IntoResponse, AppError> {
    let amount = to_stroops(body.amount)?;
    let quote = state
        .orchestrator
        .preview_quote(&body.asset, &body.quote_asset, amount, body.slippage_bps)
        .await?;

    Ok(Json(json!({
        "ok":    true,
        "price": quote.execution_price(),
        "quote": quote,
    })))
}

// ─── Execute ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Open,
    Close,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteBody {
    pub user_id:      UserId,
    pub action:       Action,
    /// `Open` only; defaults to long.
    pub side:         Option<Side>,
    pub asset:        Option<String>,
    pub quote_asset:  String,
    pub amount:       Option<f64>,
    pub slippage_bps: Option<u32>,
    /// Overall deadline for the pre-submit stages.
    pub timeout_ms:   Option<u64>,
}

impl ExecuteBody {
    fn into_intent(self) -> Result<TradeIntent, AppError> {
        let kind = match self.action {
            Action::Open => IntentKind::Open { side: self.side.unwrap_or(Side::Long) },
            Action::Close => IntentKind::Close,
        };
        let amount = self.amount.map(to_stroops).transpose()?;
        Ok(TradeIntent {
            user_id:      self.user_id,
            kind,
            asset:        self.asset,
            quote_asset:  self.quote_asset,
            amount,
            slippage_bps: self.slippage_bps,
            deadline:     self.timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms)),
        })
    }
}

/// POST /api/swap/execute
pub async fn execute_swap(
    State(state): State<SharedState>,
    Json(body): Json<ExecuteBody>,
) -> Result<impl IntoResponse, AppError> {
    let intent = body.into_intent()?;
    let user_id = intent.user_id;

    info!(user_id, kind = ?intent.kind, "📥 [API] Swap intent received");
    // Runs detached so a dropped connection cannot abandon a submitted swap.
    let task = tokio::spawn(async move {
        let cancel = CancelToken::none();
        let outcome = state.orchestrator.execute(intent, &cancel).await;
        respond(&state, user_id, outcome)
    });
    joined(task).await
}

/// POST /api/swap/reconcile/:digest
pub async fn reconcile_swap(
    State(state): State<SharedState>,
    Path(digest): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let Some(user_id) = state.orchestrator.parked_user(&digest).await else {
        return Err(AppError::NotFound(format!("no parked submission with digest {digest}")));
    };
    let task = tokio::spawn(async move {
        let outcome = state.orchestrator.reconcile(&digest).await;
        respond(&state, user_id, outcome)
    });
    joined(task).await
}

async fn joined(task: JoinHandle<Result<Json<Value>, AppError>>) -> Result<Json<Value>, AppError> {
    task.await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("swap task aborted: {e}")))?
}

fn respond(
    state:   &SharedState,
    user_id: UserId,
    outcome: Result<ExecutionReport, WorkflowError>,
) -> Result<Json<Value>, AppError> {
    match outcome {
        Ok(report) => {
            state.record_outcome(true);
            let body = json!({ "ok": true, "report": &report });
            state.broadcast(&WsEvent::SwapCompleted { report: Box::new(report) });
            Ok(Json(body))
        }
        Err(err) => {
            match err.source_error() {
                SwapError::Unreconciled { digest, .. } => {
                    state.broadcast(&WsEvent::SettlementParked { user_id, digest: digest.clone() });
                }
                _ => {
                    state.record_outcome(false);
                    state.broadcast(&WsEvent::SwapFailed {
                        user_id,
                        stage:     err.stage(),
                        error:     err.to_string(),
                        retryable: err.is_retryable(),
                    });
                }
            }
            Err(err.into())
        }
    }
}
