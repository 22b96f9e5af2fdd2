//! # routes::monitor
//!
//! ## Endpoints
//!
//! | Method    | Path                 | Description                              |
//! |-----------|----------------------|------------------------------------------|
//! | GET (WS)  | `/ws/monitor`        | WebSocket real-time event stream         |
//! | GET       | `/api/health`        | Liveness, no auth                        |
//! | GET       | `/api/monitor/stats` | Swap counters, parked settlements, uptime|

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    Json,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::atomic::Ordering;
use tracing::{debug, info};

use crate::{events::WsEvent, state::SharedState};

// ─── WebSocket Handler ────────────────────────────────────────────────────────

/// Every `WsEvent` arrives as one JSON text frame.
pub async fn ws_monitor(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let mut rx = state.broadcast_tx.subscribe();
    let (mut sender, mut receiver) = socket.split();

    info!("🔌 WebSocket client connected");

    // ── Snapshot on connect ───────────────────────────────────────────────────
    let snapshot = json!({
        "event":           "SNAPSHOT",
        "swaps_completed": state.swaps_completed.load(Ordering::Relaxed),
        "swaps_failed":    state.swaps_failed.load(Ordering::Relaxed),
        "parked":          state.orchestrator.parked_digests().await,
    })
    .to_string();

    if sender.send(Message::Text(snapshot)).await.is_err() {
        return;
    }

    // ── Event Loop ────────────────────────────────────────────────────────────
    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(json_str) => {
                        if sender.send(Message::Text(json_str)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!("WS client lagged, skipped {n} events");
                    }
                    Err(_) => break,
                }
            }

            result = receiver.next() => {
                match result {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("🔌 WebSocket client disconnected");
}

// ─── REST ─────────────────────────────────────────────────────────────────────

/// GET /api/health
pub async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({
        "ok":          true,
        "status":      "healthy",
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

/// GET /api/monitor/stats. Also pushes a `SERVER_STATS` event.
pub async fn get_stats(State(state): State<SharedState>) -> impl IntoResponse {
    let uptime_secs     = state.started_at.elapsed().as_secs();
    let swaps_completed = state.swaps_completed.load(Ordering::Relaxed);
    let swaps_failed    = state.swaps_failed.load(Ordering::Relaxed);
    let parked          = state.orchestrator.parked_digests().await.len();

    state.broadcast(&WsEvent::ServerStats { uptime_secs, swaps_completed, swaps_failed, parked });

    Json(json!({
        "ok":              true,
        "uptime_secs":     uptime_secs,
        "swaps_completed": swaps_completed,
        "swaps_failed":    swaps_failed,
        "parked":          parked,
    }))
}
