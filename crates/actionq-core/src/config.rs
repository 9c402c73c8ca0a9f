use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::paths;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// PollConfig
// ---------------------------------------------------------------------------

/// Suggested re-check delays per effect kind, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_address_balance_ms")]
    pub address_balance_ms: u64,
    #[serde(default = "default_price_level_ms")]
    pub price_level_ms: u64,
    #[serde(default = "default_tx_confs_ms")]
    pub tx_confs_ms: u64,
    /// Used once a transaction is one confirmation short of its target.
    #[serde(default = "default_tx_confs_near_ms")]
    pub tx_confs_near_ms: u64,
    #[serde(default = "default_push_event_ms")]
    pub push_event_ms: u64,
}

fn default_address_balance_ms() -> u64 {
    15_000
}

fn default_price_level_ms() -> u64 {
    30_000
}

fn default_tx_confs_ms() -> u64 {
    15_000
}

fn default_tx_confs_near_ms() -> u64 {
    3_000
}

fn default_push_event_ms() -> u64 {
    10_000
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            address_balance_ms: default_address_balance_ms(),
            price_level_ms: default_price_level_ms(),
            tx_confs_ms: default_tx_confs_ms(),
            tx_confs_near_ms: default_tx_confs_near_ms(),
            push_event_ms: default_push_event_ms(),
        }
    }
}

impl PollConfig {
    /// All delays zero. Handy for driving programs tick by tick.
    pub fn immediate() -> Self {
        Self {
            address_balance_ms: 0,
            price_level_ms: 0,
            tx_confs_ms: 0,
            tx_confs_near_ms: 0,
            push_event_ms: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Back-off after a deferred dry-run or a transient failure.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub poll: PollConfig,
    /// Fraction of the quoted amount a swap may lose before the balance
    /// watch still counts it as delivered.
    #[serde(default = "default_swap_slippage")]
    pub swap_slippage: String,
    /// Confirmations to wait for on transactions this engine broadcasts.
    #[serde(default = "default_tx_confirmations")]
    pub tx_confirmations: u32,
}

/// Delays above a week are almost certainly a units mistake.
const MAX_SANE_DELAY_MS: u64 = 7 * 24 * 60 * 60 * 1000;

fn default_client_id() -> String {
    "local".to_string()
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

fn default_swap_slippage() -> String {
    "0.05".to_string()
}

fn default_tx_confirmations() -> u32 {
    1
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            tick_interval_ms: default_tick_interval_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            poll: PollConfig::default(),
            swap_slippage: default_swap_slippage(),
            tx_confirmations: default_tx_confirmations(),
        }
    }
}

impl EngineConfig {
    /// Load `<root>/.actionq/config.yaml`, falling back to defaults when absent.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let config: EngineConfig = serde_yaml::from_str(&data)?;
        Ok(config)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Slippage as a decimal in `[0, 1)`. Invalid values fall back to the default.
    pub fn slippage(&self) -> Decimal {
        Decimal::from_str(&self.swap_slippage)
            .ok()
            .filter(|d| *d >= Decimal::ZERO && *d < Decimal::ONE)
            .unwrap_or_else(|| Decimal::new(5, 2))
    }

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.client_id.trim().is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "client_id must not be empty".to_string(),
            });
        }

        if self.tick_interval_ms == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "tick_interval_ms is 0; the scheduler will spin".to_string(),
            });
        }

        match Decimal::from_str(&self.swap_slippage) {
            Ok(d) if d >= Decimal::ZERO && d < Decimal::ONE => {}
            Ok(_) => warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!(
                    "swap_slippage '{}' must be in [0, 1); using 0.05",
                    self.swap_slippage
                ),
            }),
            Err(_) => warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!(
                    "swap_slippage '{}' is not a decimal; using 0.05",
                    self.swap_slippage
                ),
            }),
        }

        let delays = [
            ("tick_interval_ms", self.tick_interval_ms),
            ("retry_delay_ms", self.retry_delay_ms),
            ("poll.address_balance_ms", self.poll.address_balance_ms),
            ("poll.price_level_ms", self.poll.price_level_ms),
            ("poll.tx_confs_ms", self.poll.tx_confs_ms),
            ("poll.tx_confs_near_ms", self.poll.tx_confs_near_ms),
            ("poll.push_event_ms", self.poll.push_event_ms),
        ];
        for (name, ms) in delays {
            if ms > MAX_SANE_DELAY_MS {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("{name} is {ms}ms, more than a week"),
                });
            }
        }

        if self.tx_confirmations == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "tx_confirmations is 0; broadcasts complete before confirming"
                    .to_string(),
            });
        }

        warnings
    }
}
