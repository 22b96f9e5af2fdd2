//! # db - PostgreSQL audit sink
//!
//! Optional (`--features postgres`). The ledger stays in memory; this module
//! appends every `AuditEntry` it publishes to `ledger_audit`.
//!
//! ## Setup
//! 1. Create a database and set `DATABASE_URL` in `.env`
//! 2. Start the service; `migrations/001_init.sql` is applied on connect

use anyhow::Context;
use sqlx::{postgres::PgPoolOptions, Executor, PgPool};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::models::position::{AuditEntry, AuditKind, Side};

// ─── Pool Init ────────────────────────────────────────────────────────────────

pub async fn init_pool(database_url: &str) -> anyhow::Result<PgPool> {
    info!("Connecting to PostgreSQL...");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(std::time::Duration::from_secs(5))
        .connect(database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    run_migrations(&pool).await?;

    info!("✅ PostgreSQL connected and migrations applied");
    Ok(pool)
}

async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    // Simple-query protocol: the file holds several statements.
    pool.execute(include_str!("../migrations/001_init.sql"))
        .await
        .context("Failed to run migration 001_init.sql")?;

    Ok(())
}

// ─── Audit Entries ────────────────────────────────────────────────────────────

fn kind_str(kind: AuditKind) -> &'static str {
    match kind {
        AuditKind::Opened => "opened",
        AuditKind::Closed => "closed",
    }
}

fn side_str(side: Side) -> &'static str {
    match side {
        Side::Long  => "long",
        Side::Short => "short",
    }
}

const INSERT_AUDIT_ENTRY: &str = r#"
    INSERT INTO ledger_audit
      (seq, user_id, kind, position_id, asset, side, amount_stroops,
       price, pnl, idempotency_key, at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
"#;

/// Highest `seq` already stored; 0 for an empty table. Feed it to
/// `PositionLedger::resume_after` before serving.
pub async fn last_audit_seq(pool: &PgPool) -> anyhow::Result<u64> {
    let max: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) FROM ledger_audit")
        .fetch_one(pool)
        .await
        .context("Failed to read last audit seq")?;

    u64::try_from(max).context("ledger_audit holds a negative seq")
}

/// A `seq` collision is an error, never skipped.
pub async fn insert_audit_entry(pool: &PgPool, entry: &AuditEntry) -> anyhow::Result<()> {
    sqlx::query(INSERT_AUDIT_ENTRY)
    .bind(i64::try_from(entry.seq).context("audit seq overflows BIGINT")?)
    .bind(entry.user_id)
    .bind(kind_str(entry.kind))
    .bind(entry.position_id)
    .bind(&entry.asset)
    .bind(side_str(entry.side))
    .bind(entry.amount.to_string())
    .bind(entry.price)
    .bind(entry.pnl)
    .bind(entry.idempotency_key.as_deref())
    .bind(entry.at)
    .execute(pool)
    .await
    .with_context(|| format!("insert_audit_entry failed for seq {}", entry.seq))?;

    Ok(())
}

/// Drains the ledger's audit feed into PostgreSQL until the feed closes.
pub fn spawn_audit_sink(pool: PgPool, mut rx: broadcast::Receiver<AuditEntry>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(entry) => {
                    if let Err(e) = insert_audit_entry(&pool, &entry).await {
                        error!(seq = entry.seq, error = %e, "❌ [DB] Failed to persist audit entry");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("audit sink lagged, {n} entries were not persisted");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_columns_match_the_migration_comments() {
        assert_eq!(kind_str(AuditKind::Opened), "opened");
        assert_eq!(kind_str(AuditKind::Closed), "closed");
        assert_eq!(side_str(Side::Short), "short");
        assert!(include_str!("../migrations/001_init.sql").contains("ledger_audit"));
    }

    #[test]
    fn audit_insert_does_not_swallow_conflicts() {
        assert!(INSERT_AUDIT_ENTRY.contains("INSERT INTO ledger_audit"));
        assert!(!INSERT_AUDIT_ENTRY.to_uppercase().contains("ON CONFLICT"));
    }
}
