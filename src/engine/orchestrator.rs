//! # engine::orchestrator
//!
//! **SwapOrchestrator**: runs one trade intent through the whole pipeline:
//!
//! ```text
//! Quoting ─► Building ─► Submitting ─► (Reconciling) ─► Settling ─► Done
//!    ▲           │             │               │
//!    └─ retry ◄──┘             │               └─ still unknown → parked
//!                              └─ rejected → Failed
//! ```
//!
//! ## Rules
//! - Quoting and Building have no external side effects, so transient
//!   failures restart from a fresh quote (exponential backoff, bounded by
//!   `max_attempts`).
//! - Submitting happens at most once per `SignedTransaction`. An unknown
//!   outcome is reconciled by polling the status endpoint, never by resending.
//! - The ledger is mutated only after a confirmed submission, exactly once,
//!   keyed by `tx:<txHash>`.
//! - Cancellation and the intent deadline are honoured up to the moment
//!   `submit` is called, and ignored afterwards.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{AssetRegistry, WorkflowConfig};
use crate::engine::builder::TransactionBuilder;
use crate::engine::ledger::{settlement_key, PositionLedger};
use crate::engine::price_recorder::PriceRecorder;
use crate::engine::quote_client::QuoteClient;
use crate::engine::submitter::Submitter;
use crate::error::{LedgerError, SwapError, WorkflowError};
use crate::models::position::{ClosedPosition, Position, Side, UserId};
use crate::models::quote::{Quote, QuoteRequest};
use crate::models::transaction::{SubmissionReceipt, SubmissionResult, SubmissionStatus};
use crate::units::{price_to_micros, Stroops};

// ─── Stages ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapStage {
    Quoting,
    Building,
    Submitting,
    Reconciling,
    Settling,
    Done,
    Failed,
}

impl std::fmt::Display for SwapStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SwapStage::Quoting     => "quoting",
            SwapStage::Building    => "building",
            SwapStage::Submitting  => "submitting",
            SwapStage::Reconciling => "reconciling",
            SwapStage::Settling    => "settling",
            SwapStage::Done        => "done",
            SwapStage::Failed      => "failed",
        };
        f.write_str(name)
    }
}

// ─── Cancellation ─────────────────────────────────────────────────────────────

/// Owner side of a cancellation flag.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self(watch::channel(false).0)
    }

    pub fn token(&self) -> CancelToken {
        CancelToken(Some(self.0.subscribe()))
    }

    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side; cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelToken(Option<watch::Receiver<bool>>);

impl CancelToken {
    /// A token that never fires.
    pub fn none() -> Self {
        Self(None)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once cancelled. Never resolves if the handle is dropped first.
    pub async fn cancelled(&self) {
        if let Some(rx) = &self.0 {
            let mut rx = rx.clone();
            if rx.wait_for(|cancelled| *cancelled).await.is_ok() {
                return;
            }
        }
        std::future::pending::<()>().await
    }
}

// ─── Intent / Report ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum IntentKind {
    /// Sell `amount` of `asset` for the quote asset and book a position.
    Open { side: Side },
    /// Sell the open position's amount back and settle it.
    Close,
}

#[derive(Debug, Clone)]
pub struct TradeIntent {
    pub user_id:      UserId,
    pub kind:         IntentKind,
    /// Asset symbol. Required for `Open`; for `Close` it must match the open
    /// position when given.
    pub asset:        Option<String>,
    pub quote_asset:  String,
    /// Required for `Open`; `Close` always uses the open position's amount.
    pub amount:       Option<Stroops>,
    pub slippage_bps: Option<u32>,
    pub deadline:     Option<Instant>,
}

/// Everything `settle` needs once a submission is confirmed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettlementPlan {
    pub execution_id: Uuid,
    pub user_id:      UserId,
    pub kind:         IntentKind,
    /// Asset symbol, as the ledger stores it.
    pub asset:        String,
    pub amount:       Stroops,
    /// Execution price: entry for `Open`, exit for `Close`.
    pub price:        f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Settlement {
    Opened(Position),
    Closed(ClosedPosition),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum PriceUpdateOutcome {
    Recorded { micros: i64 },
    /// No recorder configured.
    Skipped,
    Failed { detail: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct QuoteSummary {
    pub quote_id:   Uuid,
    pub amount_in:  Stroops,
    pub amount_out: Stroops,
    pub price:      f64,
}

impl QuoteSummary {
    fn of(quote: &Quote, price: f64) -> Self {
        Self { quote_id: quote.id, amount_in: quote.amount_in, amount_out: quote.amount_out, price }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub execution_id: Uuid,
    pub user_id:      UserId,
    pub stages:       Vec<SwapStage>,
    pub quote:        QuoteSummary,
    pub digest:       String,
    pub tx_hash:      String,
    pub settlement:   Settlement,
    pub price_update: PriceUpdateOutcome,
    /// Quoting + Building attempts used.
    pub attempts:     u32,
}

/// A confirmed-or-not-yet-known submission waiting for `reconcile`.
#[derive(Debug, Clone)]
struct Parked {
    plan:     SettlementPlan,
    receipt:  SubmissionReceipt,
    quote:    QuoteSummary,
    stages:   Vec<SwapStage>,
    attempts: u32,
}

/// Resolved view of an intent, computed before any network call.
struct Prepared {
    asset:   String,
    request: QuoteRequest,
}

// ─── Orchestrator ─────────────────────────────────────────────────────────────

pub struct SwapOrchestrator {
    quotes:    Arc<dyn QuoteClient>,
    builder:   Arc<dyn TransactionBuilder>,
    submitter: Arc<dyn Submitter>,
    ledger:    Arc<PositionLedger>,
    recorder:  Option<Arc<dyn PriceRecorder>>,
    assets:    AssetRegistry,
    config:    WorkflowConfig,
    parked:    Mutex<HashMap<String, Parked>>,
    inflight:  std::sync::Mutex<HashSet<UserId>>,
}

/// Releases a user's in-flight slot on drop.
struct InflightGuard<'a> {
    set:     &'a std::sync::Mutex<HashSet<UserId>>,
    user_id: UserId,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.user_id);
    }
}

impl SwapOrchestrator {
    pub fn new(
        quotes:    Arc<dyn QuoteClient>,
        builder:   Arc<dyn TransactionBuilder>,
        submitter: Arc<dyn Submitter>,
        ledger:    Arc<PositionLedger>,
        assets:    AssetRegistry,
        config:    WorkflowConfig,
    ) -> Self {
        Self {
            quotes,
            builder,
            submitter,
            ledger,
            recorder: None,
            assets,
            config,
            parked: Mutex::new(HashMap::new()),
            inflight: std::sync::Mutex::new(HashSet::new()),
        }
    }

    pub fn with_price_recorder(mut self, recorder: Arc<dyn PriceRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn ledger(&self) -> &Arc<PositionLedger> {
        &self.ledger
    }

    /// Digests of submissions awaiting `reconcile`.
    pub async fn parked_digests(&self) -> Vec<String> {
        self.parked.lock().await.keys().cloned().collect()
    }

    /// Owner of a parked submission.
    pub async fn parked_user(&self, digest: &str) -> Option<UserId> {
        self.parked.lock().await.get(digest).map(|p| p.plan.user_id)
    }

    // ─── Execute ──────────────────────────────────────────────────────────────

    pub async fn execute(&self, intent: TradeIntent, cancel: &CancelToken) -> Result<ExecutionReport, WorkflowError> {
        let _slot = self.claim(intent.user_id).await.map_err(|e| WorkflowError::at(SwapStage::Quoting, e))?;

        let execution_id = Uuid::new_v4();
        let prepared = self.prepare(&intent).await.map_err(|e| WorkflowError::at(SwapStage::Quoting, e))?;

        info!(
            %execution_id,
            user_id = intent.user_id,
            kind    = ?intent.kind,
            asset   = %prepared.asset,
            amount  = %prepared.request.amount,
            "🧭 [SWAP] Workflow started"
        );

        let mut stages = Vec::with_capacity(6);
        let mut attempts = 0u32;

        // ── Quoting + Building (retryable) ────────────────────────────────────
        let (quote, tx) = loop {
            attempts += 1;

            checkpoint(SwapStage::Quoting, &intent, cancel).map_err(|e| WorkflowError::at(SwapStage::Quoting, e))?;
            push_stage(&mut stages, SwapStage::Quoting);
            let quote = match guarded(SwapStage::Quoting, cancel, intent.deadline, self.quotes.get_quote(&prepared.request)).await {
                Ok(quote) => quote,
                Err(e) => {
                    self.retry_or_fail(SwapStage::Quoting, e, attempts, cancel, &intent).await?;
                    continue;
                }
            };

            checkpoint(SwapStage::Building, &intent, cancel).map_err(|e| WorkflowError::at(SwapStage::Building, e))?;
            push_stage(&mut stages, SwapStage::Building);
            let trader = self.config.trader_address.as_str();
            match guarded(SwapStage::Building, cancel, intent.deadline, self.builder.build(&quote, trader, trader)).await {
                Ok(tx) => break (quote, tx),
                Err(e) => {
                    self.retry_or_fail(SwapStage::Building, e, attempts, cancel, &intent).await?;
                }
            }
        };

        let price = quote
            .execution_price()
            .ok_or_else(|| WorkflowError::at(SwapStage::Quoting, SwapError::InvalidQuote("quote has no usable price".into())))?;
        let summary = QuoteSummary::of(&quote, price);
        let plan = SettlementPlan {
            execution_id,
            user_id: intent.user_id,
            kind: intent.kind,
            asset: prepared.asset.clone(),
            amount: quote.amount_in,
            price,
        };

        // ── Submitting (at most once) ─────────────────────────────────────────
        checkpoint(SwapStage::Submitting, &intent, cancel).map_err(|e| WorkflowError::at(SwapStage::Submitting, e))?;
        push_stage(&mut stages, SwapStage::Submitting);

        let receipt = tx.receipt();
        let outcome = self.submitter.submit(tx).await;

        let result = match outcome {
            Ok(result) if result.status == SubmissionStatus::Confirmed => result,
            Ok(result) if result.status == SubmissionStatus::Failed => {
                let detail = result.error_detail.unwrap_or_else(|| "no detail".into());
                warn!(%execution_id, digest = %receipt.digest, %detail, "❌ [SWAP] Submission rejected");
                return Err(WorkflowError::at(SwapStage::Submitting, SwapError::SubmissionRejected(detail)));
            }
            Ok(_) | Err(SwapError::AmbiguousSubmission { .. }) => {
                push_stage(&mut stages, SwapStage::Reconciling);
                match self.poll_until_known(&receipt).await {
                    Some(Ok(result)) => result,
                    Some(Err(e)) => return Err(WorkflowError::at(SwapStage::Reconciling, e)),
                    None => {
                        return Err(self
                            .park(Parked { plan, receipt, quote: summary, stages, attempts })
                            .await)
                    }
                }
            }
            Err(e) => return Err(WorkflowError::at(SwapStage::Submitting, e)),
        };

        self.finish(plan, receipt, result, summary, stages, attempts).await
    }

    /// Side-effect-free quote for the given symbols.
    pub async fn preview_quote(
        &self,
        asset:        &str,
        quote_asset:  &str,
        amount:       Stroops,
        slippage_bps: Option<u32>,
    ) -> Result<Quote, SwapError> {
        let request = QuoteRequest {
            asset_in:     self.resolve(asset)?.to_string(),
            asset_out:    self.resolve(quote_asset)?.to_string(),
            amount,
            slippage_bps: slippage_bps.unwrap_or(self.config.default_slippage_bps),
        };
        self.quotes.get_quote(&request).await
    }

    // ─── Settlement ───────────────────────────────────────────────────────────

    /// Applies a confirmed submission to the ledger. Delivering the same
    /// confirmation twice yields `DuplicateSettlement`.
    pub async fn settle(&self, plan: &SettlementPlan, result: &SubmissionResult) -> Result<Settlement, SwapError> {
        match result.status {
            SubmissionStatus::Confirmed => {}
            SubmissionStatus::Failed => {
                return Err(SwapError::SubmissionRejected(
                    result.error_detail.clone().unwrap_or_else(|| "no detail".into()),
                ))
            }
            SubmissionStatus::Pending => {
                return Err(SwapError::InvalidRequest("cannot settle a pending submission".into()))
            }
        }
        let tx_hash = result
            .tx_hash
            .as_deref()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| SwapError::InvalidRequest("confirmed submission has no transaction hash".into()))?;
        let key = settlement_key(tx_hash);

        let settlement = match plan.kind {
            IntentKind::Open { side } => Settlement::Opened(
                self.ledger
                    .open_settled(&key, plan.user_id, &plan.asset, plan.amount, side, plan.price)
                    .await?,
            ),
            IntentKind::Close => Settlement::Closed(self.ledger.close_settled(&key, plan.user_id, plan.price).await?),
        };
        Ok(settlement)
    }

    // ─── Reconcile ────────────────────────────────────────────────────────────

    /// One status poll for a parked submission; settles it when confirmed.
    /// Holds the owner's in-flight slot throughout, and the entry stays parked
    /// until the settlement is booked.
    pub async fn reconcile(&self, digest: &str) -> Result<ExecutionReport, WorkflowError> {
        let not_parked = || {
            WorkflowError::at(
                SwapStage::Reconciling,
                SwapError::InvalidRequest(format!("no parked submission with digest {digest}")),
            )
        };
        let user_id = self.parked_user(digest).await.ok_or_else(not_parked)?;
        let _slot = self.claim_slot(user_id).map_err(|e| WorkflowError::at(SwapStage::Reconciling, e))?;
        let parked = self.parked.lock().await.get(digest).cloned().ok_or_else(not_parked)?;

        let result = match self.submitter.status(&parked.receipt).await {
            Ok(result) => result,
            Err(SwapError::AmbiguousSubmission { .. }) => SubmissionResult::pending(None),
            Err(e) => return Err(WorkflowError::at(SwapStage::Reconciling, e)),
        };

        match result.status {
            SubmissionStatus::Pending => Err(WorkflowError::at(
                SwapStage::Reconciling,
                SwapError::Unreconciled { digest: digest.to_string(), attempts: 1 },
            )),
            SubmissionStatus::Failed => {
                self.parked.lock().await.remove(digest);
                warn!(digest, "[SWAP] Parked submission failed on-chain");
                Err(WorkflowError::at(
                    SwapStage::Reconciling,
                    SwapError::SubmissionRejected(result.error_detail.unwrap_or_else(|| "no detail".into())),
                ))
            }
            SubmissionStatus::Confirmed => {
                info!(digest, "✅ [SWAP] Parked submission confirmed");
                let outcome = self
                    .finish(parked.plan, parked.receipt, result, parked.quote, parked.stages, parked.attempts)
                    .await;
                let booked = match &outcome {
                    Ok(_) => true,
                    Err(e) => matches!(e.source_error(), SwapError::Ledger(LedgerError::DuplicateSettlement { .. })),
                };
                if booked {
                    self.parked.lock().await.remove(digest);
                }
                outcome
            }
        }
    }

    // ─── Internals ────────────────────────────────────────────────────────────

    fn claim_slot(&self, user_id: UserId) -> Result<InflightGuard<'_>, SwapError> {
        let mut set = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(user_id) {
            return Err(SwapError::WorkflowInProgress { user_id });
        }
        Ok(InflightGuard { set: &self.inflight, user_id })
    }

    /// In-flight slot for a new intent; refused while the user has a parked
    /// settlement.
    async fn claim(&self, user_id: UserId) -> Result<InflightGuard<'_>, SwapError> {
        let guard = self.claim_slot(user_id)?;
        if self.parked.lock().await.values().any(|p| p.plan.user_id == user_id) {
            return Err(SwapError::WorkflowInProgress { user_id });
        }
        Ok(guard)
    }

    fn resolve(&self, symbol: &str) -> Result<&str, SwapError> {
        self.assets
            .contract(symbol)
            .ok_or_else(|| SwapError::InvalidRequest(format!("unknown asset {symbol:?}")))
    }

    /// Ledger pre-checks and symbol resolution; no network.
    async fn prepare(&self, intent: &TradeIntent) -> Result<Prepared, SwapError> {
        let (asset, amount) = match intent.kind {
            IntentKind::Open { .. } => {
                if self.ledger.get(intent.user_id).await.is_some() {
                    return Err(LedgerError::PositionAlreadyOpen { user_id: intent.user_id }.into());
                }
                let asset = intent
                    .asset
                    .as_deref()
                    .map(str::to_uppercase)
                    .ok_or_else(|| SwapError::InvalidRequest("asset is required to open a position".into()))?;
                let amount = intent
                    .amount
                    .ok_or_else(|| SwapError::InvalidRequest("amount is required to open a position".into()))?;
                (asset, amount)
            }
            IntentKind::Close => {
                let position = self
                    .ledger
                    .get(intent.user_id)
                    .await
                    .ok_or(LedgerError::NoOpenPosition { user_id: intent.user_id })?;
                if let Some(asset) = intent.asset.as_deref() {
                    if !asset.eq_ignore_ascii_case(&position.asset) {
                        return Err(SwapError::InvalidRequest(format!(
                            "open position is in {}, not {asset}",
                            position.asset
                        )));
                    }
                }
                (position.asset, position.amount)
            }
        };

        let request = QuoteRequest {
            asset_in:     self.resolve(&asset)?.to_string(),
            asset_out:    self.resolve(&intent.quote_asset)?.to_string(),
            amount,
            slippage_bps: intent.slippage_bps.unwrap_or(self.config.default_slippage_bps),
        };
        request.validate()?;
        Ok(Prepared { asset, request })
    }

    /// Returns `Ok(())` when the caller should start another attempt.
    async fn retry_or_fail(
        &self,
        stage:    SwapStage,
        err:      SwapError,
        attempts: u32,
        cancel:   &CancelToken,
        intent:   &TradeIntent,
    ) -> Result<(), WorkflowError> {
        if !err.is_transient() {
            warn!(%stage, attempts, error = %err, "[SWAP] Non-retryable failure");
            return Err(WorkflowError::at(stage, err));
        }
        if attempts >= self.config.max_attempts {
            error!(%stage, attempts, error = %err, "❌ [SWAP] Retries exhausted");
            return Err(match stage {
                SwapStage::Building => WorkflowError::RetryableBuild { attempts, source: err },
                _ => WorkflowError::RetryableQuote { attempts, source: err },
            });
        }

        let delay = backoff(self.config.backoff_base, attempts);
        warn!(%stage, attempts, delay_ms = delay.as_millis() as u64, error = %err, "🔁 [SWAP] Retrying from a fresh quote");
        let sleep = async {
            tokio::time::sleep(delay).await;
            Ok(())
        };
        guarded(stage, cancel, intent.deadline, sleep).await.map_err(|e| WorkflowError::at(stage, e))
    }

    /// `Some` once the outcome is known; `None` when polls ran out.
    async fn poll_until_known(&self, receipt: &SubmissionReceipt) -> Option<Result<SubmissionResult, SwapError>> {
        for poll in 1..=self.config.reconcile_attempts {
            tokio::time::sleep(self.config.reconcile_interval).await;
            match self.submitter.status(receipt).await {
                Ok(result) => match result.status {
                    SubmissionStatus::Confirmed => return Some(Ok(result)),
                    SubmissionStatus::Failed => {
                        let detail = result.error_detail.unwrap_or_else(|| "no detail".into());
                        return Some(Err(SwapError::SubmissionRejected(detail)));
                    }
                    SubmissionStatus::Pending => debug!(digest = %receipt.digest, poll, "Submission still pending"),
                },
                Err(e) => debug!(digest = %receipt.digest, poll, error = %e, "Status poll inconclusive"),
            }
        }
        None
    }

    async fn park(&self, parked: Parked) -> WorkflowError {
        let digest = parked.receipt.digest.clone();
        warn!(
            digest  = %digest,
            user_id = parked.plan.user_id,
            polls   = self.config.reconcile_attempts,
            "⏸️ [SWAP] Submission unresolved, settlement parked"
        );
        self.parked.lock().await.insert(digest.clone(), parked);
        WorkflowError::at(
            SwapStage::Reconciling,
            SwapError::Unreconciled { digest, attempts: self.config.reconcile_attempts },
        )
    }

    async fn finish(
        &self,
        plan:     SettlementPlan,
        receipt:  SubmissionReceipt,
        result:   SubmissionResult,
        quote:    QuoteSummary,
        mut stages: Vec<SwapStage>,
        attempts: u32,
    ) -> Result<ExecutionReport, WorkflowError> {
        push_stage(&mut stages, SwapStage::Settling);
        let settlement = self.settle(&plan, &result).await.map_err(|e| {
            error!(execution_id = %plan.execution_id, error = %e, "❌ [SWAP] Settlement failed");
            WorkflowError::at(SwapStage::Settling, e)
        })?;

        let price_update = match &self.recorder {
            None => PriceUpdateOutcome::Skipped,
            Some(recorder) => {
                let micros = price_to_micros(plan.price);
                match recorder.record_price(&plan.asset, micros).await {
                    Ok(()) => PriceUpdateOutcome::Recorded { micros },
                    Err(e) => {
                        warn!(asset = %plan.asset, error = %e, "[SWAP] Price update failed after settlement");
                        PriceUpdateOutcome::Failed { detail: e.to_string() }
                    }
                }
            }
        };
        push_stage(&mut stages, SwapStage::Done);

        let tx_hash = result.tx_hash.unwrap_or_default();
        info!(
            execution_id = %plan.execution_id,
            user_id      = plan.user_id,
            tx_hash      = %tx_hash,
            price        = plan.price,
            "✅ [SWAP] Workflow complete"
        );

        Ok(ExecutionReport {
            execution_id: plan.execution_id,
            user_id: plan.user_id,
            stages,
            quote,
            digest: receipt.digest,
            tx_hash,
            settlement,
            price_update,
            attempts,
        })
    }
}

fn push_stage(stages: &mut Vec<SwapStage>, stage: SwapStage) {
    if stages.last() != Some(&stage) {
        stages.push(stage);
    }
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
}

/// Cancellation and deadline check between stages.
fn checkpoint(stage: SwapStage, intent: &TradeIntent, cancel: &CancelToken) -> Result<(), SwapError> {
    if cancel.is_cancelled() {
        return Err(SwapError::Cancelled);
    }
    if intent.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
        return Err(SwapError::DeadlineExceeded(stage));
    }
    Ok(())
}

/// Races `fut` against cancellation and the deadline.
async fn guarded<T>(
    stage:    SwapStage,
    cancel:   &CancelToken,
    deadline: Option<Instant>,
    fut:      impl Future<Output = Result<T, SwapError>>,
) -> Result<T, SwapError> {
    let expiry = async {
        match deadline {
            Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SwapError::Cancelled),
        _ = expiry => Err(SwapError::DeadlineExceeded(stage)),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::quote::{PriceQuote, RouteLeg};
    use crate::models::transaction::SignedTransaction;

    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ── Mock collaborators ────────────────────────────────────────────────────

    /// Every quote sells `amount` for `amount * rate`.
    struct MockQuotes {
        rate:     std::sync::Mutex<f64>,
        failures: std::sync::Mutex<VecDeque<SwapError>>,
        calls:    AtomicUsize,
        delay:    Duration,
    }

    impl MockQuotes {
        fn at(rate: f64) -> Arc<Self> {
            Arc::new(Self {
                rate: std::sync::Mutex::new(rate),
                failures: std::sync::Mutex::new(VecDeque::new()),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            })
        }

        fn fail_with(self: &Arc<Self>, errors: impl IntoIterator<Item = SwapError>) {
            self.failures.lock().unwrap().extend(errors);
        }

        fn set_rate(&self, rate: f64) {
            *self.rate.lock().unwrap() = rate;
        }
    }

    #[async_trait]
    impl QuoteClient for MockQuotes {
        async fn get_quote(&self, req: &QuoteRequest) -> Result<Quote, SwapError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(err) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            let rate = *self.rate.lock().unwrap();
            let out = Stroops((req.amount.0 as f64 * rate).round() as i128);
            Ok(Quote::new(
                req.asset_in.clone(),
                req.asset_out.clone(),
                req.amount,
                out,
                vec![RouteLeg { protocol: Some("soroswap".into()), path: vec![] }],
                Duration::from_secs(30),
                json!({}),
            ))
        }

        async fn get_price(&self, asset: &str) -> Result<PriceQuote, SwapError> {
            Ok(PriceQuote { asset: asset.into(), price: *self.rate.lock().unwrap(), fetched_at: chrono::Utc::now() })
        }
    }

    #[derive(Default)]
    struct MockBuilder {
        failures: std::sync::Mutex<VecDeque<SwapError>>,
        calls:    AtomicUsize,
    }

    #[async_trait]
    impl TransactionBuilder for MockBuilder {
        async fn build(&self, quote: &Quote, _from: &str, _to: &str) -> Result<SignedTransaction, SwapError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if quote.is_expired() {
                return Err(SwapError::QuoteExpired { quote_id: quote.id });
            }
            if let Some(err) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(SignedTransaction::new(format!("XDR-{}-{n}", quote.id), quote.id))
        }
    }

    #[derive(Default)]
    struct MockSubmitter {
        submits:  std::sync::Mutex<VecDeque<Result<SubmissionResult, SwapError>>>,
        statuses: std::sync::Mutex<VecDeque<Result<SubmissionResult, SwapError>>>,
        submit_calls: AtomicUsize,
        status_calls: AtomicUsize,
    }

    impl MockSubmitter {
        fn scripted(
            submits:  Vec<Result<SubmissionResult, SwapError>>,
            statuses: Vec<Result<SubmissionResult, SwapError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                submits: std::sync::Mutex::new(submits.into()),
                statuses: std::sync::Mutex::new(statuses.into()),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl Submitter for MockSubmitter {
        async fn submit(&self, tx: SignedTransaction) -> Result<SubmissionResult, SwapError> {
            let n = self.submit_calls.fetch_add(1, Ordering::SeqCst);
            self.submits
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(SubmissionResult::confirmed(format!("hash-{}-{n}", &tx.digest[..8]))))
        }

        async fn status(&self, _receipt: &SubmissionReceipt) -> Result<SubmissionResult, SwapError> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            self.statuses.lock().unwrap().pop_front().unwrap_or_else(|| Ok(SubmissionResult::pending(None)))
        }
    }

    #[derive(Default)]
    struct MockRecorder {
        calls: std::sync::Mutex<Vec<(String, i64)>>,
        fail:  bool,
        delay: Duration,
    }

    #[async_trait]
    impl PriceRecorder for MockRecorder {
        async fn record_price(&self, asset_symbol: &str, price_micros: i64) -> Result<(), SwapError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.calls.lock().unwrap().push((asset_symbol.to_string(), price_micros));
            if self.fail {
                return Err(SwapError::PriceUpdateFailed("contract trapped".into()));
            }
            Ok(())
        }
    }

    // ── Fixtures ──────────────────────────────────────────────────────────────

    fn workflow() -> WorkflowConfig {
        WorkflowConfig {
            trader_address:       "GTRADER".into(),
            max_attempts:         3,
            backoff_base:         Duration::from_millis(1),
            reconcile_attempts:   3,
            reconcile_interval:   Duration::from_millis(1),
            default_slippage_bps: 100,
        }
    }

    fn registry() -> AssetRegistry {
        AssetRegistry::parse("XLM=CXLM,USDC=CUSDC").unwrap()
    }

    struct Rig {
        quotes:    Arc<MockQuotes>,
        builder:   Arc<MockBuilder>,
        submitter: Arc<MockSubmitter>,
        ledger:    Arc<PositionLedger>,
        orch:      SwapOrchestrator,
    }

    fn rig_with(quotes: Arc<MockQuotes>, submitter: Arc<MockSubmitter>) -> Rig {
        let builder = Arc::new(MockBuilder::default());
        let ledger = Arc::new(PositionLedger::new());
        let orch = SwapOrchestrator::new(
            quotes.clone(),
            builder.clone(),
            submitter.clone(),
            ledger.clone(),
            registry(),
            workflow(),
        );
        Rig { quotes, builder, submitter, ledger, orch }
    }

    fn rig() -> Rig {
        rig_with(MockQuotes::at(0.15), MockSubmitter::scripted(vec![], vec![]))
    }

    fn open(user_id: UserId, units: f64) -> TradeIntent {
        TradeIntent {
            user_id,
            kind:         IntentKind::Open { side: Side::Long },
            asset:        Some("XLM".into()),
            quote_asset:  "USDC".into(),
            amount:       Some(Stroops::from_units(units)),
            slippage_bps: None,
            deadline:     None,
        }
    }

    fn close(user_id: UserId) -> TradeIntent {
        TradeIntent { kind: IntentKind::Close, asset: None, amount: None, ..open(user_id, 0.0) }
    }

    // ── Tests ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn open_then_close_settles_once_each() {
        let r = rig();
        let opened = r.orch.execute(open(1, 1000.0), &CancelToken::none()).await.unwrap();
        assert_eq!(
            opened.stages,
            vec![SwapStage::Quoting, SwapStage::Building, SwapStage::Submitting, SwapStage::Settling, SwapStage::Done]
        );
        assert_eq!(opened.attempts, 1);
        assert_eq!(opened.price_update, PriceUpdateOutcome::Skipped);
        let position = r.ledger.get(1).await.unwrap();
        assert_eq!(position.amount, Stroops::from_units(1000.0));
        assert!((position.entry_price - 0.15).abs() < 1e-12);
        assert_eq!(position.opened_by, Some(settlement_key(&opened.tx_hash)));

        r.quotes.set_rate(0.16);
        let closed = r.orch.execute(close(1), &CancelToken::none()).await.unwrap();
        match closed.settlement {
            Settlement::Closed(c) => assert!((c.pnl - 10.0).abs() < 1e-6),
            other => panic!("unexpected {other:?}"),
        }
        assert!(r.ledger.get(1).await.is_none());
        assert_eq!(r.ledger.audit(1).await.len(), 2);
        assert_eq!(r.submitter.submit_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn duplicate_confirmation_is_rejected() {
        let r = rig();
        let plan = SettlementPlan {
            execution_id: Uuid::new_v4(),
            user_id:      7,
            kind:         IntentKind::Open { side: Side::Short },
            asset:        "XLM".into(),
            amount:       Stroops::from_units(10.0),
            price:        0.2,
        };
        let result = SubmissionResult::confirmed("abc");
        r.orch.settle(&plan, &result).await.unwrap();
        let err = r.orch.settle(&plan, &result).await.unwrap_err();
        assert!(matches!(err, SwapError::Ledger(LedgerError::DuplicateSettlement { .. })));
        assert_eq!(r.ledger.audit(7).await.len(), 1);

        let pending = r.orch.settle(&plan, &SubmissionResult::pending(None)).await.unwrap_err();
        assert!(matches!(pending, SwapError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn open_while_open_and_close_while_flat_fail_before_quoting() {
        let r = rig();
        let err = r.orch.execute(close(3), &CancelToken::none()).await.unwrap_err();
        assert!(matches!(err.source_error(), SwapError::Ledger(LedgerError::NoOpenPosition { user_id: 3 })));

        r.orch.execute(open(3, 5.0), &CancelToken::none()).await.unwrap();
        let err = r.orch.execute(open(3, 5.0), &CancelToken::none()).await.unwrap_err();
        assert!(matches!(err.source_error(), SwapError::Ledger(LedgerError::PositionAlreadyOpen { .. })));
        assert_eq!(r.quotes.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_quote_failures_are_retried_then_reported() {
        let r = rig();
        r.quotes.fail_with([
            SwapError::QuoteUnavailable("HTTP 503".into()),
            SwapError::QuoteUnavailable("HTTP 503".into()),
        ]);
        let report = r.orch.execute(open(1, 1.0), &CancelToken::none()).await.unwrap();
        assert_eq!(report.attempts, 3);

        let r = rig();
        r.quotes.fail_with((0..5).map(|_| SwapError::QuoteUnavailable("down".into())));
        let err = r.orch.execute(open(1, 1.0), &CancelToken::none()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::RetryableQuote { attempts: 3, .. }));
        assert!(err.is_retryable());
        assert_eq!(r.quotes.calls.load(Ordering::SeqCst), 3);
        assert!(r.ledger.get(1).await.is_none());
    }

    #[tokio::test]
    async fn build_failures_exhaust_as_retryable_build() {
        let r = rig();
        r.builder
            .failures
            .lock()
            .unwrap()
            .extend((0..3).map(|_| SwapError::BuildFailed("HTTP 500".into())));
        let err = r.orch.execute(open(1, 1.0), &CancelToken::none()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::RetryableBuild { attempts: 3, .. }));
        assert_eq!(r.submitter.submit_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_retryable_errors_are_not_retried() {
        let r = rig();
        r.quotes.fail_with([SwapError::InvalidQuote("amountOut is 0".into())]);
        let err = r.orch.execute(open(1, 1.0), &CancelToken::none()).await.unwrap_err();
        assert_eq!(err.stage(), SwapStage::Quoting);
        assert!(!err.is_retryable());
        assert_eq!(r.quotes.calls.load(Ordering::SeqCst), 1);

        let r = rig();
        r.builder.failures.lock().unwrap().push_back(SwapError::MissingPayload);
        let err = r.orch.execute(open(1, 1.0), &CancelToken::none()).await.unwrap_err();
        assert_eq!(err.stage(), SwapStage::Building);
        assert_eq!(r.builder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_quote_never_reaches_the_submitter() {
        let r = rig();
        r.builder.failures.lock().unwrap().extend((0..3).map(|_| SwapError::QuoteExpired { quote_id: Uuid::nil() }));
        let err = r.orch.execute(open(1, 1.0), &CancelToken::none()).await.unwrap_err();
        assert!(matches!(err.source_error(), SwapError::QuoteExpired { .. }));
        assert_eq!(r.submitter.submit_calls.load(Ordering::SeqCst), 0);
        assert!(r.ledger.audit(1).await.is_empty());
    }

    #[tokio::test]
    async fn cancellation_before_submit_has_no_side_effects() {
        let quotes = Arc::new(MockQuotes {
            rate: std::sync::Mutex::new(0.15),
            failures: std::sync::Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(200),
        });
        let r = rig_with(quotes, MockSubmitter::scripted(vec![], vec![]));
        let handle = CancelHandle::new();
        let token = handle.token();

        let canceller = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        };
        let (result, _) = tokio::join!(r.orch.execute(open(1, 1.0), &token), canceller);

        let err = result.unwrap_err();
        assert!(matches!(err.source_error(), SwapError::Cancelled));
        assert_eq!(r.submitter.submit_calls.load(Ordering::SeqCst), 0);
        assert!(r.ledger.get(1).await.is_none());
    }

    #[tokio::test]
    async fn past_deadline_stops_before_quoting() {
        let r = rig();
        let mut intent = open(1, 1.0);
        intent.deadline = Some(Instant::now());
        let err = r.orch.execute(intent, &CancelToken::none()).await.unwrap_err();
        assert!(matches!(err.source_error(), SwapError::DeadlineExceeded(SwapStage::Quoting)));
        assert_eq!(r.quotes.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ambiguous_submission_is_reconciled_without_resending() {
        let submitter = MockSubmitter::scripted(
            vec![Err(SwapError::AmbiguousSubmission { digest: "d".into(), detail: "timeout".into() })],
            vec![Ok(SubmissionResult::pending(None)), Ok(SubmissionResult::confirmed("late-hash"))],
        );
        let r = rig_with(MockQuotes::at(0.15), submitter);
        let report = r.orch.execute(open(1, 1.0), &CancelToken::none()).await.unwrap();

        assert!(report.stages.contains(&SwapStage::Reconciling));
        assert_eq!(report.tx_hash, "late-hash");
        assert_eq!(r.submitter.submit_calls.load(Ordering::SeqCst), 1);
        assert_eq!(r.submitter.status_calls.load(Ordering::SeqCst), 2);
        assert!(r.ledger.has_applied(1, "tx:late-hash").await);
    }

    #[tokio::test]
    async fn unresolved_submission_is_parked_then_reconciled() {
        let submitter = MockSubmitter::scripted(vec![Ok(SubmissionResult::pending(None))], vec![]);
        let r = rig_with(MockQuotes::at(0.15), submitter);

        let err = r.orch.execute(open(1, 1.0), &CancelToken::none()).await.unwrap_err();
        let digest = match err.source_error() {
            SwapError::Unreconciled { digest, attempts: 3 } => digest.clone(),
            other => panic!("unexpected {other:?}"),
        };
        assert!(r.ledger.get(1).await.is_none());
        assert_eq!(r.orch.parked_digests().await, vec![digest.clone()]);
        assert_eq!(r.orch.parked_user(&digest).await, Some(1));

        // The user is blocked while a settlement is parked.
        let blocked = r.orch.execute(open(1, 1.0), &CancelToken::none()).await.unwrap_err();
        assert!(matches!(blocked.source_error(), SwapError::WorkflowInProgress { user_id: 1 }));

        r.submitter.statuses.lock().unwrap().push_back(Ok(SubmissionResult::confirmed("h")));
        let report = r.orch.reconcile(&digest).await.unwrap();
        assert!(matches!(report.settlement, Settlement::Opened(_)));
        assert!(r.orch.parked_digests().await.is_empty());
        assert_eq!(r.submitter.submit_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reconcile_holds_the_user_until_settlement_is_booked() {
        let submitter = MockSubmitter::scripted(
            vec![Ok(SubmissionResult::pending(None))],
            vec![Ok(SubmissionResult::pending(None)); 3],
        );
        let r = rig_with(MockQuotes::at(0.15), submitter);
        let recorder = Arc::new(MockRecorder { delay: Duration::from_millis(100), ..Default::default() });
        let orch = r.orch.with_price_recorder(recorder);

        let err = orch.execute(open(1, 1.0), &CancelToken::none()).await.unwrap_err();
        let SwapError::Unreconciled { digest, .. } = err.source_error().clone() else {
            panic!("unexpected {err:?}");
        };

        r.submitter.statuses.lock().unwrap().push_back(Ok(SubmissionResult::confirmed("h")));
        let cancel = CancelToken::none();
        let racing_close = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            orch.execute(close(1), &cancel).await
        };
        let (reconciled, raced) = tokio::join!(orch.reconcile(&digest), racing_close);

        assert!(matches!(reconciled.unwrap().settlement, Settlement::Opened(_)));
        assert!(matches!(raced.unwrap_err().source_error(), SwapError::WorkflowInProgress { user_id: 1 }));
        assert!(r.ledger.get(1).await.is_some());
        assert!(orch.parked_digests().await.is_empty());
    }

    #[tokio::test]
    async fn failed_settlement_keeps_the_submission_parked() {
        let submitter = MockSubmitter::scripted(
            vec![Ok(SubmissionResult::pending(None))],
            vec![Ok(SubmissionResult::pending(None)); 3],
        );
        let r = rig_with(MockQuotes::at(0.15), submitter);
        let err = r.orch.execute(open(1, 1.0), &CancelToken::none()).await.unwrap_err();
        let SwapError::Unreconciled { digest, .. } = err.source_error().clone() else {
            panic!("unexpected {err:?}");
        };

        r.ledger.open(1, "XLM", Stroops::from_units(1.0), Side::Long, 0.1).await.unwrap();
        r.submitter.statuses.lock().unwrap().push_back(Ok(SubmissionResult::confirmed("h")));

        let err = r.orch.reconcile(&digest).await.unwrap_err();
        assert_eq!(err.stage(), SwapStage::Settling);
        assert!(matches!(err.source_error(), SwapError::Ledger(LedgerError::PositionAlreadyOpen { .. })));
        assert_eq!(r.orch.parked_digests().await, vec![digest]);
    }

    #[tokio::test]
    async fn rejected_submission_leaves_ledger_untouched() {
        let submitter = MockSubmitter::scripted(vec![Ok(SubmissionResult::failed("tx_insufficient_balance"))], vec![]);
        let r = rig_with(MockQuotes::at(0.15), submitter);
        let err = r.orch.execute(open(1, 1.0), &CancelToken::none()).await.unwrap_err();
        assert_eq!(err.stage(), SwapStage::Submitting);
        assert!(matches!(err.source_error(), SwapError::SubmissionRejected(d) if d.contains("insufficient")));
        assert!(r.ledger.audit(1).await.is_empty());
    }

    #[tokio::test]
    async fn price_update_outcome_is_reported() {
        let recorder = Arc::new(MockRecorder::default());
        let r = rig();
        let orch = r.orch.with_price_recorder(recorder.clone());
        let report = orch.execute(open(1, 1.0), &CancelToken::none()).await.unwrap();
        assert_eq!(report.price_update, PriceUpdateOutcome::Recorded { micros: 150_000 });
        assert_eq!(recorder.calls.lock().unwrap().as_slice(), &[("XLM".to_string(), 150_000)]);

        let failing = Arc::new(MockRecorder { fail: true, ..Default::default() });
        let r = rig();
        let orch = r.orch.with_price_recorder(failing);
        let report = orch.execute(open(2, 1.0), &CancelToken::none()).await.unwrap();
        assert!(matches!(report.price_update, PriceUpdateOutcome::Failed { .. }));
        assert!(r.ledger.get(2).await.is_some());
    }

    #[tokio::test]
    async fn unknown_asset_is_an_invalid_request() {
        let r = rig();
        let mut intent = open(1, 1.0);
        intent.asset = Some("DOGE".into());
        let err = r.orch.execute(intent, &CancelToken::none()).await.unwrap_err();
        assert!(matches!(err.source_error(), SwapError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn concurrent_intents_for_one_user_are_serialized() {
        let quotes = Arc::new(MockQuotes {
            rate: std::sync::Mutex::new(0.15),
            failures: std::sync::Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(50),
        });
        let r = rig_with(quotes, MockSubmitter::scripted(vec![], vec![]));
        let (first, second) = (CancelToken::none(), CancelToken::none());
        let (a, b) = tokio::join!(r.orch.execute(open(9, 1.0), &first), r.orch.execute(open(9, 1.0), &second));
        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        assert_eq!(r.ledger.audit(9).await.len(), 1);
    }

    #[test]
    fn backoff_doubles() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff(base, 1), Duration::from_millis(500));
        assert_eq!(backoff(base, 2), Duration::from_millis(1000));
        assert_eq!(backoff(base, 3), Duration::from_millis(2000));
    }
}
