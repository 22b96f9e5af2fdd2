//! # Meridian - Swap Settlement Service
//!
//! ```text
//!  ┌─────────────┐  POST /api/swap/execute   ┌──────────────────────────────┐
//!  │  Bot / UI   │ ────────────────────────▶ │ SwapOrchestrator             │
//!  └─────────────┘                           │ ├─ QuoteClient   → /quote    │
//!                                            │ ├─ Builder       → /build    │
//!                                            │ ├─ Submitter     → /send     │
//!                                            │ ├─ PositionLedger            │
//!                                            │ └─ PriceRecorder → contract  │
//!                                            └──────────────┬───────────────┘
//!  ┌─────────────┐  ws://host/ws/monitor  ◀─────────────────┘
//!  │  Dashboard  │  GET /api/positions/:user_id[/history|/audit]
//!  └─────────────┘
//! ```
//!
//! Configuration is read from the environment (see `config`).

use std::net::SocketAddr;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use meridian::config::Config;
use meridian::routes::router;
use meridian::state::build_state;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Load .env ──────────────────────────────────────────────────────────
    dotenvy::dotenv().ok();

    // ── 2. Structured logging ─────────────────────────────────────────────────
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("meridian=debug".parse()?)
                .add_directive("tower_http=info".parse()?),
        )
        .init();

    info!(r#"

  ╔═══════════════════════════════════════════════════════╗
  ║           MERIDIAN · Swap Settlement Backend          ║
  ║  Quote · Build · Submit · Reconcile · Settle          ║
  ╚═══════════════════════════════════════════════════════╝"#);

    // ── 3. Config + shared state ──────────────────────────────────────────────
    let config = Config::from_env().context("Failed to load config")?;
    info!(
        network   = %config.soroswap.network,
        api       = %config.soroswap.api_url,
        assets    = config.assets.iter().count(),
        auth      = config.service_key.is_some(),
        "Configuration loaded"
    );
    let state = build_state(&config)?;

    // ── 4. Event fan-out ──────────────────────────────────────────────────────
    state.forward_ledger_events();

    #[cfg(feature = "postgres")]
    {
        if let Some(url) = config.database_url.as_deref() {
            let pool = meridian::db::init_pool(url).await?;
            let last_seq = meridian::db::last_audit_seq(&pool).await?;
            state.ledger.resume_after(last_seq);
            info!(last_seq, "Audit numbering resumed");
            meridian::db::spawn_audit_sink(pool, state.ledger.subscribe());
        }
    }
    #[cfg(not(feature = "postgres"))]
    {
        if config.database_url.is_some() {
            tracing::warn!("DATABASE_URL is set but the binary was built without the `postgres` feature");
        }
    }

    // ── 5. Router ─────────────────────────────────────────────────────────────
    let app = router(state);

    // ── 6. Bind & Serve ───────────────────────────────────────────────────────
    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .with_context(|| format!("BIND_ADDR '{}' is not a socket address", config.bind_addr))?;

    info!(?addr, "🚀 Meridian server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}
