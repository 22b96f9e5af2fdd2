//! # state
//!
//! `AppState`: the orchestrator, the ledger it settles into, the WebSocket
//! broadcast channel and a few counters, shared by every handler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{Config, Secret};
use crate::engine::{PositionLedger, SoroswapClient, StellarCliRecorder, SwapOrchestrator};
use crate::events::WsEvent;

/// Buffered WebSocket events per subscriber before it starts lagging.
const BROADCAST_CAPACITY: usize = 256;

// ─── AppState ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    // ── Pipeline ──────────────────────────────────────────────────────────────
    pub orchestrator: Arc<SwapOrchestrator>,
    pub ledger:       Arc<PositionLedger>,

    // ── Monitor / WebSocket ───────────────────────────────────────────────────
    /// Pre-serialized `WsEvent` JSON.
    pub broadcast_tx: broadcast::Sender<String>,

    // ── Auth ──────────────────────────────────────────────────────────────────
    pub service_key:  Option<Secret>,

    // ── Metrics ───────────────────────────────────────────────────────────────
    pub swaps_completed: Arc<AtomicU64>,
    pub swaps_failed:    Arc<AtomicU64>,
    pub started_at:      Instant,
}

impl AppState {
    pub fn new(orchestrator: Arc<SwapOrchestrator>, service_key: Option<Secret>) -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let ledger = Arc::clone(orchestrator.ledger());

        Self {
            orchestrator,
            ledger,
            broadcast_tx,
            service_key,
            swaps_completed: Arc::new(AtomicU64::new(0)),
            swaps_failed:    Arc::new(AtomicU64::new(0)),
            started_at:      Instant::now(),
        }
    }

    // ── Helper Methods ────────────────────────────────────────────────────────

    /// Never fails: a send error only means nobody is listening.
    pub fn broadcast(&self, event: &WsEvent) {
        let _ = self.broadcast_tx.send(event.to_json());
    }

    pub fn record_outcome(&self, ok: bool) {
        let counter = if ok { &self.swaps_completed } else { &self.swaps_failed };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Re-publishes every ledger mutation as `LEDGER_UPDATED`.
    pub fn forward_ledger_events(&self) -> JoinHandle<()> {
        let mut rx = self.ledger.subscribe();
        let state = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(entry) => state.broadcast(&WsEvent::LedgerUpdated { entry }),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("ledger forwarder lagged, skipped {n} entries");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Convenience type alias
pub type SharedState = Arc<AppState>;

/// Wires the Soroswap client, ledger, optional oracle recorder and
/// orchestrator from configuration.
pub fn build_state(config: &Config) -> anyhow::Result<SharedState> {
    let http = reqwest::Client::builder()
        .user_agent(concat!("meridian/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    let soroswap = Arc::new(SoroswapClient::new(http, config.soroswap.clone()));
    let ledger = Arc::new(PositionLedger::new());

    let mut orchestrator = SwapOrchestrator::new(
        soroswap.clone(),
        soroswap.clone(),
        soroswap,
        ledger,
        config.assets.clone(),
        config.workflow.clone(),
    );
    match &config.contract {
        Some(contract) => {
            info!(contract = %contract.contract_id, "Oracle price recording enabled");
            orchestrator = orchestrator.with_price_recorder(Arc::new(StellarCliRecorder::new(contract.clone())));
        }
        None => info!("PRICE_CONTRACT_ID not set, oracle price recording disabled"),
    }

    Ok(Arc::new(AppState::new(Arc::new(orchestrator), config.service_key.clone())))
}
