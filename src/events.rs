//! # events
//!
//! Defines [`WsEvent`], everything the service broadcasts to `/ws/monitor`
//! subscribers.
//!
//! Events go through a `tokio::sync::broadcast::Sender<String>` as
//! pre-serialized JSON, so receivers never need the payload types.

use serde::Serialize;

use crate::engine::orchestrator::{ExecutionReport, SwapStage};
use crate::models::position::{AuditEntry, UserId};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WsEvent {
    /// A workflow reached `Done`; the ledger has been updated.
    SwapCompleted {
        report: Box<ExecutionReport>,
    },

    /// A workflow stopped before settling.
    SwapFailed {
        user_id:   UserId,
        stage:     SwapStage,
        error:     String,
        retryable: bool,
    },

    /// Submitted, outcome unknown; waiting for `/api/swap/reconcile/:digest`.
    SettlementParked {
        user_id: UserId,
        digest:  String,
    },

    /// One ledger mutation (open or close).
    LedgerUpdated {
        entry: AuditEntry,
    },

    /// Polled by dashboards to keep the socket alive.
    ServerStats {
        uptime_secs:     u64,
        swaps_completed: u64,
        swaps_failed:    u64,
        parked:          usize,
    },
}

impl WsEvent {
    #[inline]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"event":"SERIALIZATION_ERROR"}"#.to_string())
    }
}
