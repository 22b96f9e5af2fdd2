//! # routes::positions
//!
//! | Method | Path                              | Description                       |
//! |--------|-----------------------------------|-----------------------------------|
//! | GET    | `/api/positions/:user_id`         | Open position, or `null`          |
//! | GET    | `/api/positions/:user_id/history` | Closed positions + realized PnL   |
//! | GET    | `/api/positions/:user_id/audit`   | Audit trail                       |

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use crate::models::position::UserId;
use crate::state::SharedState;

/// GET /api/positions/:user_id
pub async fn get_position(
    State(state): State<SharedState>,
    Path(user_id): Path<UserId>,
) -> impl IntoResponse {
    let position = state.ledger.get(user_id).await;
    Json(json!({
        "ok":       true,
        "user_id":  user_id,
        "position": position,
    }))
}

/// GET /api/positions/:user_id/history
pub async fn get_history(
    State(state): State<SharedState>,
    Path(user_id): Path<UserId>,
) -> impl IntoResponse {
    let closed = state.ledger.history(user_id).await;
    let realized_pnl = state.ledger.realized_pnl(user_id).await;
    Json(json!({
        "ok":           true,
        "user_id":      user_id,
        "count":        closed.len(),
        "realized_pnl": realized_pnl,
        "closed":       closed,
    }))
}

/// GET /api/positions/:user_id/audit
pub async fn get_audit(
    State(state): State<SharedState>,
    Path(user_id): Path<UserId>,
) -> impl IntoResponse {
    let entries = state.ledger.audit(user_id).await;
    let replayed_pnl = state.ledger.replay_realized_pnl(user_id).await;
    Json(json!({
        "ok":           true,
        "user_id":      user_id,
        "count":        entries.len(),
        "replayed_pnl": replayed_pnl,
        "entries":      entries,
    }))
}
