//! Configuration for the transfer engine

use crate::operation::OperationKind;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Transfer engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Ledger storage configuration
    #[serde(default)]
    pub ledger: ledger_core::Config,

    /// Supported assets and their fees
    #[serde(default)]
    pub assets: Vec<AssetConfig>,

    /// Owner credited with collected fees
    #[serde(default)]
    pub fee_collector: Option<String>,

    /// Relay step configuration
    #[serde(default)]
    pub relay: RelayConfig,

    /// Outbox dispatcher configuration
    #[serde(default)]
    pub outbox: OutboxConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "transfer-engine".to_string(),
            ledger: ledger_core::Config::default(),
            assets: Vec::new(),
            fee_collector: None,
            relay: RelayConfig::default(),
            outbox: OutboxConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// One supported asset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetConfig {
    /// Asset code, e.g. `BTC`
    pub code: String,

    /// Flat fee per operation kind (snake_case kind name); missing means zero
    #[serde(default)]
    pub fees: BTreeMap<String, Decimal>,

    /// Whether new operations may use the asset
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl AssetConfig {
    /// Enabled asset without fees
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            fees: BTreeMap::new(),
            enabled: true,
        }
    }

    /// Set the fee for one kind
    pub fn with_fee(mut self, kind: OperationKind, fee: Decimal) -> Self {
        self.fees.insert(kind.as_str().to_string(), fee);
        self
    }
}

fn default_true() -> bool {
    true
}

/// Relay step configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Timeout of one external submit/query call (milliseconds)
    pub submit_timeout_ms: u64,

    /// Relay attempts before the operation needs manual intervention
    pub max_attempts: u32,

    /// Sweep period (seconds)
    pub sweep_interval_secs: u64,

    /// A `relaying` operation older than this is presumed crashed (seconds)
    pub stale_after_secs: u64,

    /// Maximum operations handled per sweep
    pub batch_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            submit_timeout_ms: 10_000,
            max_attempts: 5,
            sweep_interval_secs: 30,
            stale_after_secs: 60,
            batch_size: 100,
        }
    }
}

impl RelayConfig {
    /// External call timeout
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    /// Sweep period
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Staleness threshold for `relaying`
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// Outbox dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Records published per drain
    pub max_batch_size: usize,

    /// Drain period (milliseconds)
    pub flush_interval_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            flush_interval_ms: 500,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable text
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();
        config.ledger.apply_env();

        if let Ok(timeout) = std::env::var("TRANSFER_RELAY_TIMEOUT_MS") {
            config.relay.submit_timeout_ms = timeout.parse().map_err(|e| {
                crate::Error::Config(format!("TRANSFER_RELAY_TIMEOUT_MS: {}", e))
            })?;
        }

        if let Ok(attempts) = std::env::var("TRANSFER_RELAY_MAX_ATTEMPTS") {
            config.relay.max_attempts = attempts.parse().map_err(|e| {
                crate::Error::Config(format!("TRANSFER_RELAY_MAX_ATTEMPTS: {}", e))
            })?;
        }

        if let Ok(collector) = std::env::var("TRANSFER_FEE_COLLECTOR") {
            config.fee_collector = Some(collector);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.relay.max_attempts == 0 {
            return Err(crate::Error::Config("relay.max_attempts must be at least 1".into()));
        }
        if self.relay.submit_timeout_ms == 0 {
            return Err(crate::Error::Config("relay.submit_timeout_ms must be positive".into()));
        }

        let known: Vec<&str> = OperationKind::ALL.iter().map(|k| k.as_str()).collect();
        let mut charges_fees = false;
        for asset in &self.assets {
            for (kind, fee) in &asset.fees {
                if !known.contains(&kind.as_str()) {
                    return Err(crate::Error::Config(format!(
                        "asset {}: unknown operation kind {}",
                        asset.code, kind
                    )));
                }
                if fee.is_sign_negative() {
                    return Err(crate::Error::Config(format!(
                        "asset {}: negative fee for {}",
                        asset.code, kind
                    )));
                }
                charges_fees |= !fee.is_zero();
            }
        }

        if charges_fees && self.fee_collector.as_deref().map_or(true, str::is_empty) {
            return Err(crate::Error::Config(
                "fees are configured but fee_collector is not set".into(),
            ));
        }
        Ok(())
    }
}
