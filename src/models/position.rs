//! # models::position
//!
//! Structs for **open positions**, **closed positions** and the **audit
//! trail** kept by the position ledger.
//!
//! `Position`       = the one position a user currently holds
//! `ClosedPosition` = a settled position with its realized PnL
//! `AuditEntry`     = one line per ledger mutation, never deleted

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::units::Stroops;

pub type UserId = i64;

// ─── Side ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Realized PnL in quote units for `amount` whole units of the asset.
    pub fn pnl(self, entry_price: f64, exit_price: f64, amount: f64) -> f64 {
        match self {
            Side::Long  => (exit_price - entry_price) * amount,
            Side::Short => (entry_price - exit_price) * amount,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long  => f.write_str("long"),
            Side::Short => f.write_str("short"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

// ─── Position ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub position_id: Uuid,
    pub user_id:     UserId,
    /// Asset symbol, e.g. `"XLM"`.
    pub asset:       String,
    pub amount:      Stroops,
    pub entry_price: f64,
    pub side:        Side,
    pub opened_at:   DateTime<Utc>,
    pub status:      PositionStatus,
    /// Idempotency key of the settlement that opened it (None = manual open).
    pub opened_by:   Option<String>,
}

impl Position {
    pub fn new(user_id: UserId, asset: &str, amount: Stroops, side: Side, entry_price: f64) -> Self {
        Self {
            position_id: Uuid::new_v4(),
            user_id,
            asset: asset.to_string(),
            amount,
            entry_price,
            side,
            opened_at: Utc::now(),
            status: PositionStatus::Open,
            opened_by: None,
        }
    }
}

// ─── ClosedPosition ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedPosition {
    pub position:   Position,
    pub exit_price: f64,
    pub pnl:        f64,
    pub closed_at:  DateTime<Utc>,
    pub closed_by:  Option<String>,
}

impl ClosedPosition {
    pub fn settle(mut position: Position, exit_price: f64, closed_by: Option<String>) -> Self {
        let pnl = position.side.pnl(position.entry_price, exit_price, position.amount.to_units());
        position.status = PositionStatus::Closed;
        Self {
            position,
            exit_price,
            pnl,
            closed_at: Utc::now(),
            closed_by,
        }
    }
}

// ─── AuditEntry ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditKind {
    Opened,
    Closed,
}

/// One immutable record per ledger mutation. Replaying a user's entries in
/// `seq` order reproduces their realized PnL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq:             u64,
    pub user_id:         UserId,
    pub kind:            AuditKind,
    pub position_id:     Uuid,
    pub asset:           String,
    pub side:            Side,
    pub amount:          Stroops,
    /// Entry price for `Opened`, exit price for `Closed`.
    pub price:           f64,
    pub pnl:             Option<f64>,
    pub idempotency_key: Option<String>,
    pub at:              DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pnl_sign_follows_side() {
        assert!((Side::Long.pnl(0.15, 0.16, 1000.0) - 10.0).abs() < 1e-9);
        assert!((Side::Short.pnl(0.15, 0.16, 1000.0) + 10.0).abs() < 1e-9);
        assert_eq!(Side::Long.pnl(2.0, 2.0, 10.0), 0.0);
        assert_eq!(Side::Short.pnl(2.0, 2.0, 10.0), 0.0);
    }

    #[test]
    fn settle_marks_position_closed() {
        let p = Position::new(7, "XLM", Stroops::from_units(100.0), Side::Short, 0.20);
        let closed = ClosedPosition::settle(p, 0.10, Some("tx:abc".into()));
        assert_eq!(closed.position.status, PositionStatus::Closed);
        assert!((closed.pnl - 10.0).abs() < 1e-9);
        assert_eq!(closed.closed_by.as_deref(), Some("tx:abc"));
    }
}
