//! HTTP surface of the service.

pub mod monitor;
pub mod positions;
pub mod swap;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::auth::require_api_key;
use crate::state::SharedState;

pub fn router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Swap pipeline ─────────────────────────────────────────────────────
        .route("/api/swap/quote",                  post(swap::preview_quote))
        .route("/api/swap/execute",                post(swap::execute_swap))
        .route("/api/swap/reconcile/:digest",      post(swap::reconcile_swap))
        // ── Ledger ────────────────────────────────────────────────────────────
        .route("/api/positions/:user_id",          get(positions::get_position))
        .route("/api/positions/:user_id/history",  get(positions::get_history))
        .route("/api/positions/:user_id/audit",    get(positions::get_audit))
        // ── Monitor ───────────────────────────────────────────────────────────
        .route("/api/health",                      get(monitor::health_check))
        .route("/api/monitor/stats",               get(monitor::get_stats))
        .route("/ws/monitor",                      get(monitor::ws_monitor))
        // ── Middleware ────────────────────────────────────────────────────────
        .layer(axum::middleware::from_fn_with_state(state.clone(), require_api_key))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
