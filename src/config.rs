//! # config - read configuration from environment variables
//!
//! Every secret (aggregator API key, signing identity, service API key) comes
//! from the process environment, usually via `.env` + `dotenvy`. Nothing
//! sensitive has a default.
//!
//! | Variable                    | Default                          |
//! |-----------------------------|----------------------------------|
//! | `SOROSWAP_API_URL`          | `https://api.soroswap.finance`   |
//! | `SOROSWAP_API_KEY`          | **required**                     |
//! | `STELLAR_NETWORK`           | `testnet`                        |
//! | `SOROSWAP_PROTOCOLS`        | `sdex,soroswap,phoenix,aqua`     |
//! | `QUOTE_TIMEOUT_SECS`        | `10`                             |
//! | `BUILD_TIMEOUT_SECS`        | `30`                             |
//! | `SUBMIT_TIMEOUT_SECS`       | `30`                             |
//! | `QUOTE_TTL_SECS`            | `30`                             |
//! | `TRADER_ADDRESS`            | **required** (server)            |
//! | `ASSETS`                    | `SYM=CONTRACT,...`               |
//! | `WORKFLOW_MAX_ATTEMPTS`     | `3`                              |
//! | `WORKFLOW_BACKOFF_MS`       | `500`                            |
//! | `RECONCILE_ATTEMPTS`        | `10`                             |
//! | `RECONCILE_INTERVAL_MS`     | `2000`                           |
//! | `DEFAULT_SLIPPAGE_BPS`      | `100`                            |
//! | `PRICE_CONTRACT_ID`         | unset = price recording disabled |
//! | `PRICE_SOURCE_IDENTITY`     | required with `PRICE_CONTRACT_ID`|
//! | `STELLAR_CLI`               | `stellar`                        |
//! | `FEED_INTERVAL_SECS`        | `60`                             |
//! | `BIND_ADDR`                 | `0.0.0.0:3000`                   |
//! | `API_KEY`                   | unset = no `X-API-Key` check     |
//! | `DATABASE_URL`              | unset = audit trail not persisted|

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use anyhow::{bail, Context};

// ─── Secret ───────────────────────────────────────────────────────────────────

/// A credential that never appears in logs or `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

// ─── Network ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Testnet,
    Mainnet,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Testnet => "testnet",
            Network::Mainnet => "mainnet",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Network {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "testnet" => Ok(Network::Testnet),
            "mainnet" | "public" => Ok(Network::Mainnet),
            other => bail!("Unknown STELLAR_NETWORK: '{other}'. Use 'testnet' or 'mainnet'"),
        }
    }
}

// ─── Asset Registry ───────────────────────────────────────────────────────────

/// Maps asset symbols (`"XLM"`) to their Soroban contract addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetRegistry {
    by_symbol: BTreeMap<String, String>,
}

impl AssetRegistry {
    /// Parses `XLM=CDLZ...,USDC=CBIE...`. Symbols are upper-cased.
    pub fn parse(spec: &str) -> anyhow::Result<Self> {
        let mut by_symbol = BTreeMap::new();
        for pair in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (symbol, contract) = pair
                .split_once('=')
                .with_context(|| format!("ASSETS entry '{pair}' must look like SYMBOL=CONTRACT"))?;
            let (symbol, contract) = (symbol.trim(), contract.trim());
            if symbol.is_empty() || contract.is_empty() {
                bail!("ASSETS entry '{pair}' has an empty symbol or contract");
            }
            by_symbol.insert(symbol.to_uppercase(), contract.to_string());
        }
        Ok(Self { by_symbol })
    }

    /// Contract address for `symbol`.
    pub fn contract(&self, symbol: &str) -> Option<&str> {
        self.by_symbol.get(&symbol.to_uppercase()).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.by_symbol.iter().map(|(s, c)| (s.as_str(), c.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.by_symbol.is_empty()
    }
}

// ─── Soroswap ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SoroswapConfig {
    pub api_url:        String,
    pub api_key:        Secret,
    pub network:        Network,
    /// Liquidity sources the aggregator may route through.
    pub protocols:      Vec<String>,
    pub quote_timeout:  Duration,
    /// Build responses carry a full XDR envelope, hence the larger budget.
    pub build_timeout:  Duration,
    pub submit_timeout: Duration,
    /// Lifetime assumed for quotes whose response omits `expiresAt`.
    pub quote_ttl:      Duration,
}

impl SoroswapConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup(get: &dyn Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let api_key = get("SOROSWAP_API_KEY")
            .filter(|k| !k.trim().is_empty())
            .context("SOROSWAP_API_KEY environment variable is required")?;

        let network = get("STELLAR_NETWORK")
            .unwrap_or_else(|| "testnet".to_string())
            .parse()?;

        let protocols = get("SOROSWAP_PROTOCOLS")
            .unwrap_or_else(|| "sdex,soroswap,phoenix,aqua".to_string())
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();

        Ok(Self {
            api_url:        get("SOROSWAP_API_URL")
                .unwrap_or_else(|| "https://api.soroswap.finance".to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key:        Secret::new(api_key),
            network,
            protocols,
            quote_timeout:  Duration::from_secs(parse_or(get, "QUOTE_TIMEOUT_SECS", 10)?),
            build_timeout:  Duration::from_secs(parse_or(get, "BUILD_TIMEOUT_SECS", 30)?),
            submit_timeout: Duration::from_secs(parse_or(get, "SUBMIT_TIMEOUT_SECS", 30)?),
            quote_ttl:      Duration::from_secs(parse_or(get, "QUOTE_TTL_SECS", 30)?),
        })
    }
}

// ─── Workflow ─────────────────────────────────────────────────────────────────

/// Retry / reconciliation policy for the swap orchestrator.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Account that signs and receives swaps.
    pub trader_address:       String,
    /// Attempts for the side-effect-free Quoting + Building stages.
    pub max_attempts:         u32,
    /// First backoff delay; doubled after every failed attempt.
    pub backoff_base:         Duration,
    pub reconcile_attempts:   u32,
    pub reconcile_interval:   Duration,
    pub default_slippage_bps: u32,
}

impl WorkflowConfig {
    pub fn from_lookup(get: &dyn Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let trader_address = get("TRADER_ADDRESS")
            .filter(|a| !a.trim().is_empty())
            .context("TRADER_ADDRESS environment variable is required")?;

        let max_attempts: u32 = parse_or(get, "WORKFLOW_MAX_ATTEMPTS", 3)?;
        if max_attempts == 0 {
            bail!("WORKFLOW_MAX_ATTEMPTS must be at least 1");
        }

        let default_slippage_bps: u32 = parse_or(get, "DEFAULT_SLIPPAGE_BPS", 100)?;
        if default_slippage_bps > 10_000 {
            bail!("DEFAULT_SLIPPAGE_BPS must be within 0..=10000");
        }

        Ok(Self {
            trader_address,
            max_attempts,
            backoff_base:       Duration::from_millis(parse_or(get, "WORKFLOW_BACKOFF_MS", 500)?),
            reconcile_attempts: parse_or(get, "RECONCILE_ATTEMPTS", 10)?,
            reconcile_interval: Duration::from_millis(parse_or(get, "RECONCILE_INTERVAL_MS", 2000)?),
            default_slippage_bps,
        })
    }
}

// ─── Contract (price oracle) ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ContractConfig {
    pub contract_id:     String,
    /// Name of the `stellar keys` identity used as `--source`. The key
    /// itself stays in the CLI's keystore.
    pub source_identity: Secret,
    pub network:         Network,
    pub stellar_cli:     String,
    pub invoke_timeout:  Duration,
}

impl ContractConfig {
    pub fn from_env() -> anyhow::Result<Option<Self>> {
        Self::from_lookup(&env_lookup)
    }

    /// `Ok(None)` when `PRICE_CONTRACT_ID` is unset (recording disabled).
    pub fn from_lookup(get: &dyn Fn(&str) -> Option<String>) -> anyhow::Result<Option<Self>> {
        let Some(contract_id) = get("PRICE_CONTRACT_ID").filter(|c| !c.trim().is_empty()) else {
            return Ok(None);
        };

        let source_identity = get("PRICE_SOURCE_IDENTITY")
            .filter(|s| !s.trim().is_empty())
            .context("PRICE_SOURCE_IDENTITY is required when PRICE_CONTRACT_ID is set")?;

        Ok(Some(Self {
            contract_id,
            source_identity: Secret::new(source_identity),
            network:         get("STELLAR_NETWORK")
                .unwrap_or_else(|| "testnet".to_string())
                .parse()?,
            stellar_cli:     get("STELLAR_CLI").unwrap_or_else(|| "stellar".to_string()),
            invoke_timeout:  Duration::from_secs(parse_or(get, "CONTRACT_INVOKE_TIMEOUT_SECS", 60)?),
        }))
    }
}

// ─── Top-level ────────────────────────────────────────────────────────────────

/// Everything the HTTP service needs.
#[derive(Debug, Clone)]
pub struct Config {
    pub soroswap:      SoroswapConfig,
    pub workflow:      WorkflowConfig,
    pub contract:      Option<ContractConfig>,
    pub assets:        AssetRegistry,
    pub bind_addr:     String,
    pub database_url:  Option<String>,
    /// `X-API-Key` expected by the HTTP service; `None` = dev mode, no auth.
    pub service_key:   Option<Secret>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup(get: &dyn Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        Ok(Self {
            soroswap:     SoroswapConfig::from_lookup(get)?,
            workflow:     WorkflowConfig::from_lookup(get)?,
            contract:     ContractConfig::from_lookup(get)?,
            assets:       AssetRegistry::parse(&get("ASSETS").unwrap_or_default())?,
            bind_addr:    get("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            database_url: get("DATABASE_URL").filter(|u| !u.is_empty()),
            service_key:  get("API_KEY").filter(|k| !k.is_empty()).map(Secret::new),
        })
    }
}

/// Everything the `price-feeder` binary needs. Unlike the service, the oracle
/// contract is mandatory and no trader account is involved.
#[derive(Debug, Clone)]
pub struct FeederConfig {
    pub soroswap: SoroswapConfig,
    pub contract: ContractConfig,
    pub assets:   AssetRegistry,
    pub interval: Duration,
}

impl FeederConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup(get: &dyn Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let contract = ContractConfig::from_lookup(get)?
            .context("PRICE_CONTRACT_ID is required for the price feeder")?;
        let assets = AssetRegistry::parse(&get("ASSETS").unwrap_or_default())?;
        if assets.is_empty() {
            bail!("ASSETS must list at least one SYMBOL=CONTRACT pair");
        }
        let interval_secs: u64 = parse_or(get, "FEED_INTERVAL_SECS", 60)?;
        if interval_secs == 0 {
            bail!("FEED_INTERVAL_SECS must be at least 1");
        }

        Ok(Self {
            soroswap: SoroswapConfig::from_lookup(get)?,
            contract,
            assets,
            interval: Duration::from_secs(interval_secs),
        })
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn parse_or<T>(get: &dyn Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a number, got '{raw}'")),
        _ => Ok(default),
    }
}
