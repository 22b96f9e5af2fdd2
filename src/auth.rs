//! # auth - API Key Middleware
//!
//! Protects every endpoint with an `X-API-Key` header.
//!
//! ## Mode
//! - `API_KEY` unset (or empty) → **Allow All** (dev mode)
//! - `API_KEY` set → every request must send `X-API-Key: <key>`
//!
//! ## Exempt
//! `/api/health`
//!
//! ## Usage
//! ```bash
//! curl -H "X-API-Key: $API_KEY" http://localhost:3000/api/positions/42
//! ```

use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use tracing::warn;

use crate::state::SharedState;

const HEALTH_PATH: &str = "/api/health";

pub async fn require_api_key(
    State(state): State<SharedState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    // ── Dev Mode ──────────────────────────────────────────────────────────────
    let Some(expected) = state.service_key.as_ref() else {
        return next.run(request).await;
    };

    if request.uri().path() == HEALTH_PATH {
        return next.run(request).await;
    }

    let provided = request
        .headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if provided == expected.expose() {
        next.run(request).await
    } else {
        let path = request.uri().path();
        warn!(path, "❌ Unauthorized request: invalid or missing X-API-Key");
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "ok":    false,
                "error": "Unauthorized: invalid or missing X-API-Key header",
            })),
        )
            .into_response()
    }
}
