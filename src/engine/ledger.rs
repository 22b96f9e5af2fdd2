//! # engine::ledger
//!
//! **Position Ledger**: in-memory book of positions per user.
//!
//! ## Rules
//! ```text
//! open   → rejected while the user already holds an open position
//! close  → rejected when the user holds nothing
//! settle → rejected when the idempotency key was applied before
//! every mutation → exactly one AuditEntry, broadcast to subscribers
//! ```
//!
//! ## Locking
//! Each user has an own `tokio::sync::Mutex<UserBook>`; a mutation holds only
//! that user's lock for the whole check-then-write. The outer `RwLock` map is
//! touched just long enough to find or create a book, so users never wait on
//! each other.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::position::{AuditEntry, AuditKind, ClosedPosition, Position, Side, UserId};
use crate::units::Stroops;

/// Capacity of the audit broadcast channel.
const AUDIT_FEED_CAPACITY: usize = 256;

/// Idempotency key of a confirmed on-chain settlement.
pub fn settlement_key(tx_hash: &str) -> String {
    format!("tx:{tx_hash}")
}

// ─── UserBook ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct UserBook {
    open:    Option<Position>,
    closed:  Vec<ClosedPosition>,
    audit:   Vec<AuditEntry>,
    /// Idempotency keys already applied for this user.
    applied: HashSet<String>,
}

// ─── PositionLedger ───────────────────────────────────────────────────────────

pub struct PositionLedger {
    books: RwLock<HashMap<UserId, Arc<Mutex<UserBook>>>>,
    seq:   AtomicU64,
    feed:  broadcast::Sender<AuditEntry>,
}

impl Default for PositionLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionLedger {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(AUDIT_FEED_CAPACITY);
        Self {
            books: RwLock::new(HashMap::new()),
            seq:   AtomicU64::new(0),
            feed,
        }
    }

    /// Continues audit numbering after `last_seq`, e.g. the highest sequence
    /// already persisted by a previous run. Never moves the counter back.
    pub fn resume_after(&self, last_seq: u64) {
        self.seq.fetch_max(last_seq, Ordering::Relaxed);
    }

    /// Stream of audit entries as they are appended.
    pub fn subscribe(&self) -> broadcast::Receiver<AuditEntry> {
        self.feed.subscribe()
    }

    async fn book(&self, user_id: UserId) -> Arc<Mutex<UserBook>> {
        if let Some(book) = self.books.read().await.get(&user_id) {
            return Arc::clone(book);
        }
        let mut books = self.books.write().await;
        Arc::clone(books.entry(user_id).or_default())
    }

    /// Existing book only; reads never create one.
    async fn existing_book(&self, user_id: UserId) -> Option<Arc<Mutex<UserBook>>> {
        self.books.read().await.get(&user_id).cloned()
    }

    // ─── Mutations ────────────────────────────────────────────────────────────

    pub async fn open(
        &self,
        user_id:     UserId,
        asset:       &str,
        amount:      Stroops,
        side:        Side,
        entry_price: f64,
    ) -> Result<Position, LedgerError> {
        self.apply_open(None, user_id, asset, amount, side, entry_price).await
    }

    /// `open` guarded by a settlement idempotency key.
    pub async fn open_settled(
        &self,
        key:         &str,
        user_id:     UserId,
        asset:       &str,
        amount:      Stroops,
        side:        Side,
        entry_price: f64,
    ) -> Result<Position, LedgerError> {
        self.apply_open(Some(key), user_id, asset, amount, side, entry_price).await
    }

    pub async fn close(&self, user_id: UserId, exit_price: f64) -> Result<ClosedPosition, LedgerError> {
        self.apply_close(None, user_id, exit_price).await
    }

    /// `close` guarded by a settlement idempotency key.
    pub async fn close_settled(
        &self,
        key:        &str,
        user_id:    UserId,
        exit_price: f64,
    ) -> Result<ClosedPosition, LedgerError> {
        self.apply_close(Some(key), user_id, exit_price).await
    }

    async fn apply_open(
        &self,
        key:         Option<&str>,
        user_id:     UserId,
        asset:       &str,
        amount:      Stroops,
        side:        Side,
        entry_price: f64,
    ) -> Result<Position, LedgerError> {
        if asset.trim().is_empty() {
            return Err(LedgerError::InvalidInput("asset must not be empty".into()));
        }
        if !amount.is_positive() {
            return Err(LedgerError::InvalidInput(format!("amount must be > 0, got {amount}")));
        }
        check_price(entry_price)?;

        let book = self.book(user_id).await;
        let mut book = book.lock().await;

        if let Some(key) = key {
            if book.applied.contains(key) {
                return Err(LedgerError::DuplicateSettlement { key: key.to_string() });
            }
        }
        if book.open.is_some() {
            return Err(LedgerError::PositionAlreadyOpen { user_id });
        }

        let mut position = Position::new(user_id, asset, amount, side, entry_price);
        position.opened_by = key.map(str::to_string);

        let entry = self.audit_entry(
            user_id,
            AuditKind::Opened,
            position.position_id,
            asset,
            side,
            amount,
            entry_price,
            None,
            key,
        );
        if let Some(key) = key {
            book.applied.insert(key.to_string());
        }
        book.open = Some(position.clone());
        book.audit.push(entry.clone());
        drop(book);

        info!(
            user_id,
            asset,
            side = %side,
            amount = %amount,
            entry_price,
            "📈 [LEDGER] Position opened"
        );
        self.publish(entry);
        Ok(position)
    }

    async fn apply_close(
        &self,
        key:        Option<&str>,
        user_id:    UserId,
        exit_price: f64,
    ) -> Result<ClosedPosition, LedgerError> {
        check_price(exit_price)?;

        let book = self.book(user_id).await;
        let mut book = book.lock().await;

        if let Some(key) = key {
            if book.applied.contains(key) {
                return Err(LedgerError::DuplicateSettlement { key: key.to_string() });
            }
        }
        let Some(position) = book.open.take() else {
            return Err(LedgerError::NoOpenPosition { user_id });
        };

        let closed = ClosedPosition::settle(position, exit_price, key.map(str::to_string));
        let entry = self.audit_entry(
            user_id,
            AuditKind::Closed,
            closed.position.position_id,
            &closed.position.asset,
            closed.position.side,
            closed.position.amount,
            exit_price,
            Some(closed.pnl),
            key,
        );
        if let Some(key) = key {
            book.applied.insert(key.to_string());
        }
        book.closed.push(closed.clone());
        book.audit.push(entry.clone());
        drop(book);

        info!(
            user_id,
            asset = %closed.position.asset,
            entry_price = closed.position.entry_price,
            exit_price,
            pnl = closed.pnl,
            "📉 [LEDGER] Position closed"
        );
        self.publish(entry);
        Ok(closed)
    }

    #[allow(clippy::too_many_arguments)]
    fn audit_entry(
        &self,
        user_id:     UserId,
        kind:        AuditKind,
        position_id: Uuid,
        asset:       &str,
        side:        Side,
        amount:      Stroops,
        price:       f64,
        pnl:         Option<f64>,
        key:         Option<&str>,
    ) -> AuditEntry {
        AuditEntry {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            user_id,
            kind,
            position_id,
            asset: asset.to_string(),
            side,
            amount,
            price,
            pnl,
            idempotency_key: key.map(str::to_string),
            at: Utc::now(),
        }
    }

    fn publish(&self, entry: AuditEntry) {
        // Err only means nobody is subscribed.
        if self.feed.send(entry).is_err() {
            debug!("audit feed has no subscribers");
        }
    }

    // ─── Reads ────────────────────────────────────────────────────────────────

    pub async fn get(&self, user_id: UserId) -> Option<Position> {
        let book = self.existing_book(user_id).await?;
        let book = book.lock().await;
        book.open.clone()
    }

    pub async fn history(&self, user_id: UserId) -> Vec<ClosedPosition> {
        match self.existing_book(user_id).await {
            Some(book) => book.lock().await.closed.clone(),
            None => Vec::new(),
        }
    }

    pub async fn audit(&self, user_id: UserId) -> Vec<AuditEntry> {
        match self.existing_book(user_id).await {
            Some(book) => book.lock().await.audit.clone(),
            None => Vec::new(),
        }
    }

    pub async fn has_applied(&self, user_id: UserId, key: &str) -> bool {
        match self.existing_book(user_id).await {
            Some(book) => book.lock().await.applied.contains(key),
            None => false,
        }
    }

    /// Sum of PnL stored on closed positions.
    pub async fn realized_pnl(&self, user_id: UserId) -> f64 {
        self.history(user_id).await.iter().map(|c| c.pnl).sum()
    }

    /// Realized PnL recomputed from the audit trail alone (entry and exit
    /// prices), independent of the stored `pnl` values.
    pub async fn replay_realized_pnl(&self, user_id: UserId) -> f64 {
        replay(&self.audit(user_id).await)
    }
}

/// Folds audit entries (in `seq` order) into realized PnL.
pub fn replay(entries: &[AuditEntry]) -> f64 {
    let mut opened: HashMap<Uuid, (Side, f64, Stroops)> = HashMap::new();
    let mut total = 0.0;
    for entry in entries {
        match entry.kind {
            AuditKind::Opened => {
                opened.insert(entry.position_id, (entry.side, entry.price, entry.amount));
            }
            AuditKind::Closed => {
                if let Some((side, entry_price, amount)) = opened.remove(&entry.position_id) {
                    total += side.pnl(entry_price, entry.price, amount.to_units());
                }
            }
        }
    }
    total
}

fn check_price(price: f64) -> Result<(), LedgerError> {
    if price.is_finite() && price > 0.0 {
        Ok(())
    } else {
        Err(LedgerError::InvalidInput(format!("price must be a positive number, got {price}")))
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn units(n: f64) -> Stroops {
        Stroops::from_units(n)
    }

    #[tokio::test]
    async fn xlm_long_scenario_from_bot_simulation() {
        let ledger = PositionLedger::new();
        let opened = ledger.open(1, "XLM", units(1000.0), Side::Long, 0.15).await.unwrap();
        assert_eq!(ledger.get(1).await, Some(opened));

        let closed = ledger.close(1, 0.16).await.unwrap();
        // (0.16 - 0.15) * 1000
        assert!((closed.pnl - 10.0).abs() < 1e-6, "pnl = {}", closed.pnl);
        assert!(ledger.get(1).await.is_none());
    }

    #[tokio::test]
    async fn numbering_resumes_after_persisted_entries() {
        let ledger = PositionLedger::new();
        ledger.resume_after(41);
        ledger.open(1, "XLM", units(1.0), Side::Long, 0.15).await.unwrap();
        ledger.resume_after(7);
        ledger.close(1, 0.15).await.unwrap();

        let seqs: Vec<u64> = ledger.audit(1).await.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![42, 43]);
    }

    #[tokio::test]
    async fn second_open_is_rejected() {
        let ledger = PositionLedger::new();
        ledger.open(1, "XLM", units(10.0), Side::Long, 0.15).await.unwrap();
        let err = ledger.open(1, "XLM", units(5.0), Side::Short, 0.15).await.unwrap_err();
        assert_eq!(err, LedgerError::PositionAlreadyOpen { user_id: 1 });
        assert_eq!(ledger.audit(1).await.len(), 1);
    }

    #[tokio::test]
    async fn close_without_position_is_rejected() {
        let ledger = PositionLedger::new();
        let err = ledger.close(9, 0.15).await.unwrap_err();
        assert_eq!(err, LedgerError::NoOpenPosition { user_id: 9 });

        ledger.open(9, "XLM", units(1.0), Side::Long, 0.15).await.unwrap();
        ledger.close(9, 0.15).await.unwrap();
        let err = ledger.close(9, 0.15).await.unwrap_err();
        assert_eq!(err, LedgerError::NoOpenPosition { user_id: 9 });
    }

    #[tokio::test]
    async fn closing_at_entry_is_flat_for_both_sides() {
        let ledger = PositionLedger::new();
        for (user, side) in [(1, Side::Long), (2, Side::Short)] {
            ledger.open(user, "XLM", units(1000.0), side, 0.15).await.unwrap();
            let closed = ledger.close(user, 0.15).await.unwrap();
            assert!(closed.pnl.abs() < EPS);
        }
    }

    #[tokio::test]
    async fn duplicate_settlement_key_is_rejected() {
        let ledger = PositionLedger::new();
        let key = settlement_key("abc123");
        ledger.open_settled(&key, 3, "XLM", units(100.0), Side::Long, 0.1).await.unwrap();
        ledger.close(3, 0.2).await.unwrap();

        // Same confirmation delivered again after the position was closed.
        let err = ledger
            .open_settled(&key, 3, "XLM", units(100.0), Side::Long, 0.1)
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::DuplicateSettlement { key: key.clone() });
        assert!(ledger.get(3).await.is_none());
        assert!(ledger.has_applied(3, &key).await);

        let close_key = settlement_key("def456");
        ledger.open(3, "XLM", units(1.0), Side::Short, 1.0).await.unwrap();
        ledger.close_settled(&close_key, 3, 0.5).await.unwrap();
        ledger.open(3, "XLM", units(1.0), Side::Short, 1.0).await.unwrap();
        let err = ledger.close_settled(&close_key, 3, 0.5).await.unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateSettlement { .. }));
        assert!(ledger.get(3).await.is_some());
    }

    #[tokio::test]
    async fn replay_matches_stored_pnl() {
        let ledger = PositionLedger::new();
        let trades = [
            (Side::Long, 0.15, 0.16, 1000.0),
            (Side::Short, 0.20, 0.12, 250.0),
            (Side::Long, 3000.0, 2950.5, 0.75),
        ];
        for (side, entry, exit, amount) in trades {
            ledger.open(5, "XLM", units(amount), side, entry).await.unwrap();
            ledger.close(5, exit).await.unwrap();
        }

        let stored = ledger.realized_pnl(5).await;
        let replayed = ledger.replay_realized_pnl(5).await;
        assert!((stored - replayed).abs() < 1e-6);
        assert_eq!(ledger.audit(5).await.len(), 6);
        assert_eq!(ledger.history(5).await.len(), 3);
    }

    #[tokio::test]
    async fn invalid_inputs_do_not_mutate() {
        let ledger = PositionLedger::new();
        assert!(matches!(
            ledger.open(1, "XLM", Stroops::ZERO, Side::Long, 0.15).await,
            Err(LedgerError::InvalidInput(_))
        ));
        assert!(matches!(
            ledger.open(1, "XLM", units(1.0), Side::Long, f64::NAN).await,
            Err(LedgerError::InvalidInput(_))
        ));
        assert!(ledger.audit(1).await.is_empty());
    }

    #[tokio::test]
    async fn audit_feed_broadcasts_mutations() {
        let ledger = PositionLedger::new();
        let mut rx = ledger.subscribe();
        ledger.open(1, "XLM", units(1.0), Side::Long, 0.15).await.unwrap();
        ledger.close(1, 0.15).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.kind, AuditKind::Opened);
        assert_eq!(second.kind, AuditKind::Closed);
        assert!(second.seq > first.seq);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_opens_for_one_user_admit_exactly_one() {
        let ledger = Arc::new(PositionLedger::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                ledger.open(42, "XLM", Stroops::from_units(1.0), Side::Long, 0.15).await
            }));
        }

        let mut ok = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(ledger.audit(42).await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn users_are_independent() {
        let ledger = Arc::new(PositionLedger::new());
        let mut handles = Vec::new();
        for user in 0..16 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                ledger.open(user, "XLM", Stroops::from_units(10.0), Side::Short, 0.2).await?;
                ledger.close(user, 0.1).await
            }));
        }
        for handle in handles {
            let closed = handle.await.unwrap().unwrap();
            assert!((closed.pnl - 1.0).abs() < 1e-9);
        }
    }
}
