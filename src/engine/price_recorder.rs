//! # engine::price_recorder
//!
//! **PriceRecorder**: writes `(asset symbol, price in micro-units)` into the
//! deployed price contract through its `update_price_from_oracle` entry point.
//!
//! The Stellar CLI is invoked with an argument vector (never a shell string),
//! and the signing identity is referenced by name only; the key stays in the
//! CLI's keystore.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{error, info};

use crate::config::ContractConfig;
use crate::error::{snippet, SwapError};

/// Symbols the contract accepts: `Symbol` is at most 32 chars of `[A-Za-z0-9_]`.
const MAX_SYMBOL_LEN: usize = 32;

#[async_trait]
pub trait PriceRecorder: Send + Sync {
    async fn record_price(&self, asset_symbol: &str, price_micros: i64) -> Result<(), SwapError>;
}

fn validate(asset_symbol: &str, price_micros: i64) -> Result<(), SwapError> {
    let valid_symbol = !asset_symbol.is_empty()
        && asset_symbol.len() <= MAX_SYMBOL_LEN
        && asset_symbol.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_symbol {
        return Err(SwapError::InvalidRequest(format!("invalid contract symbol {asset_symbol:?}")));
    }
    if price_micros <= 0 {
        return Err(SwapError::InvalidRequest(format!("price must be positive, got {price_micros}")));
    }
    Ok(())
}

// ─── Stellar CLI ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StellarCliRecorder {
    config: ContractConfig,
}

impl StellarCliRecorder {
    pub fn new(config: ContractConfig) -> Self {
        Self { config }
    }

    /// Arguments after the program name.
    pub fn invoke_args(&self, asset_symbol: &str, price_micros: i64) -> Vec<String> {
        vec![
            "contract".into(),
            "invoke".into(),
            "--id".into(),
            self.config.contract_id.clone(),
            "--source".into(),
            self.config.source_identity.expose().to_string(),
            "--network".into(),
            self.config.network.as_str().into(),
            "--send=yes".into(),
            "--".into(),
            "update_price_from_oracle".into(),
            "--asset".into(),
            asset_symbol.to_string(),
            "--price".into(),
            price_micros.to_string(),
        ]
    }
}

#[async_trait]
impl PriceRecorder for StellarCliRecorder {
    async fn record_price(&self, asset_symbol: &str, price_micros: i64) -> Result<(), SwapError> {
        validate(asset_symbol, price_micros)?;

        let mut cmd = Command::new(&self.config.stellar_cli);
        cmd.args(self.invoke_args(asset_symbol, price_micros)).kill_on_drop(true);

        let output = tokio::time::timeout(self.config.invoke_timeout, cmd.output())
            .await
            .map_err(|_| {
                SwapError::PriceUpdateFailed(format!(
                    "contract invoke timed out after {}s",
                    self.config.invoke_timeout.as_secs()
                ))
            })?
            .map_err(|e| SwapError::PriceUpdateFailed(format!("failed to launch {}: {e}", self.config.stellar_cli)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(
                asset  = %asset_symbol,
                status = %output.status,
                stderr = %snippet(&stderr),
                "❌ [ORACLE] Price update failed"
            );
            return Err(SwapError::PriceUpdateFailed(format!(
                "{} exited with {}: {}",
                self.config.stellar_cli,
                output.status,
                snippet(&stderr)
            )));
        }

        info!(asset = %asset_symbol, price_micros, contract = %self.config.contract_id, "✅ [ORACLE] Price recorded");
        Ok(())
    }
}
