//! Configuration management for the delta-neutral bot.
//!
//! Loads settings from a `.env` file, an optional `config` file and
//! `DNB__`-prefixed environment variables.

use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::risk::RiskLimits;
use crate::strategy::{DetectorConfig, OrchestratorConfig, PositionConfig};

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Signal detection and polling
    #[serde(default)]
    pub strategy: StrategyConfig,
    /// Capital allocation settings
    #[serde(default)]
    pub capital: CapitalConfig,
    /// Portfolio risk limits
    #[serde(default)]
    pub risk: RiskConfig,
    /// Execution parameters
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Audit log location
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Pairs the orchestrator polls every tick
    #[serde(default = "default_enabled_pairs")]
    pub enabled_pairs: Vec<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Budget for a single snapshot fetch; must be well below the poll interval
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    /// Snapshots older than this are treated as stale
    #[serde(default = "default_max_snapshot_age")]
    pub max_snapshot_age_secs: i64,
    /// Minimum |funding rate| to consider an entry
    #[serde(default = "default_funding_threshold")]
    pub funding_threshold: Decimal,
    /// Open positions close once the collected rate falls below this
    #[serde(default = "default_funding_close_threshold")]
    pub funding_close_threshold: Decimal,
    /// History window in samples
    #[serde(default = "default_funding_ma_period")]
    pub funding_ma_period: usize,
    /// Z-score strictness
    #[serde(default = "default_funding_zscore_k")]
    pub funding_zscore_k: Decimal,
    #[serde(default = "default_funding_interval_hours")]
    pub funding_interval_hours: u32,
    /// Relative tick-over-tick funding drop that raises an alert (0.5 = 50%)
    #[serde(default = "default_funding_drop_alert_pct")]
    pub funding_drop_alert_pct: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapitalConfig {
    /// Starting equity for paper trading
    #[serde(default = "default_initial_capital")]
    pub initial_capital: Decimal,
    /// Per-pair allocation as a fraction of current equity (0.0-1.0)
    #[serde(default = "default_capital_per_pair_pct")]
    pub capital_per_pair_pct: Decimal,
    /// Cap on the sum of allocations as a fraction of current equity
    #[serde(default = "default_max_total_exposure_pct")]
    pub max_total_exposure_pct: Decimal,
    /// Triggered signals sized below this are skipped
    #[serde(default = "default_min_trade_size")]
    pub min_trade_size_usdt: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Maximum drawdown from the equity high-watermark (0.0-1.0)
    #[serde(default = "default_max_drawdown")]
    pub max_drawdown_pct: Decimal,
    /// Maximum loss within one UTC calendar day, relative to the day's starting equity
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss_pct: Decimal,
    #[serde(default = "default_circuit_breaker_enabled")]
    pub circuit_breaker_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Maximum tolerated entry slippage between leg notionals (0.0-1.0)
    #[serde(default = "default_slippage")]
    pub slippage_pct: Decimal,
    /// Taker fee per leg, used by the profitability filter
    #[serde(default = "default_taker_fee")]
    pub taker_fee_pct: Decimal,
    /// Hedge drift on an open position that forces a close
    #[serde(default = "default_hedge_drift_tolerance")]
    pub hedge_drift_tolerance_pct: Decimal,
    #[serde(default = "default_order_timeout")]
    pub order_timeout_secs: u64,
    #[serde(default = "default_close_retry_base")]
    pub close_retry_base_secs: u64,
    #[serde(default = "default_close_retry_max")]
    pub close_retry_max_secs: u64,
    /// Failed close attempts before a persistent-failure alert
    #[serde(default = "default_close_alert_after")]
    pub close_alert_after_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

// Default value functions
fn default_enabled_pairs() -> Vec<String> {
    vec!["BTC".to_string(), "ETH".to_string(), "SOL".to_string()]
}

fn default_poll_interval() -> u64 {
    20
}

fn default_fetch_timeout_ms() -> u64 {
    5_000 // a quarter of the poll interval
}

fn default_max_snapshot_age() -> i64 {
    60
}

fn default_funding_threshold() -> Decimal {
    Decimal::new(3, 4) // 0.0003 per interval
}

fn default_funding_close_threshold() -> Decimal {
    Decimal::new(5, 5) // 0.00005
}

fn default_funding_ma_period() -> usize {
    24 // one day of hourly samples
}

fn default_funding_zscore_k() -> Decimal {
    Decimal::new(15, 1) // 1.5
}

fn default_funding_interval_hours() -> u32 {
    1
}

fn default_funding_drop_alert_pct() -> Decimal {
    Decimal::new(50, 2) // 0.50
}

fn default_initial_capital() -> Decimal {
    Decimal::new(10_000, 0)
}

fn default_capital_per_pair_pct() -> Decimal {
    Decimal::new(40, 2) // 0.40
}

fn default_max_total_exposure_pct() -> Decimal {
    Decimal::ONE
}

fn default_min_trade_size() -> Decimal {
    Decimal::new(50, 0) // 50 USDT
}

fn default_max_drawdown() -> Decimal {
    Decimal::new(10, 2) // 0.10
}

fn default_max_daily_loss() -> Decimal {
    Decimal::new(3, 2) // 0.03
}

fn default_circuit_breaker_enabled() -> bool {
    true
}

fn default_slippage() -> Decimal {
    Decimal::new(1, 3) // 0.001 (0.1%)
}

fn default_taker_fee() -> Decimal {
    Decimal::new(6, 4) // 0.0006 (0.06%)
}

fn default_hedge_drift_tolerance() -> Decimal {
    Decimal::new(2, 2) // 0.02 (2%)
}

fn default_order_timeout() -> u64 {
    10
}

fn default_close_retry_base() -> u64 {
    2
}

fn default_close_retry_max() -> u64 {
    300
}

fn default_close_alert_after() -> u32 {
    5
}

fn default_db_path() -> String {
    "audit.db".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .prefix("DNB")
                    .list_separator(",")
                    .with_list_parse_key("strategy.enabled_pairs")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        let unit = |v: Decimal| v > Decimal::ZERO && v <= Decimal::ONE;

        anyhow::ensure!(
            !self.strategy.enabled_pairs.is_empty(),
            "enabled_pairs must list at least one pair"
        );
        anyhow::ensure!(
            self.strategy.funding_ma_period >= 3,
            "funding_ma_period must be at least 3 samples"
        );
        anyhow::ensure!(
            self.strategy.funding_threshold > Decimal::ZERO,
            "funding_threshold must be positive"
        );
        anyhow::ensure!(
            self.strategy.funding_close_threshold <= self.strategy.funding_threshold,
            "funding_close_threshold must not exceed funding_threshold"
        );
        anyhow::ensure!(
            self.strategy.funding_zscore_k >= Decimal::ZERO,
            "funding_zscore_k must be non-negative"
        );
        anyhow::ensure!(
            self.strategy.funding_interval_hours >= 1,
            "funding_interval_hours must be >= 1"
        );
        anyhow::ensure!(
            self.strategy.poll_interval_secs >= 1,
            "poll_interval_secs must be >= 1"
        );
        anyhow::ensure!(
            self.strategy.fetch_timeout_ms < self.strategy.poll_interval_secs * 1_000,
            "fetch_timeout_ms must be shorter than the poll interval"
        );

        anyhow::ensure!(
            self.capital.initial_capital > Decimal::ZERO,
            "initial_capital must be positive"
        );
        anyhow::ensure!(
            unit(self.capital.capital_per_pair_pct),
            "capital_per_pair_pct must be between 0 and 1"
        );
        anyhow::ensure!(
            unit(self.capital.max_total_exposure_pct),
            "max_total_exposure_pct must be between 0 and 1"
        );

        anyhow::ensure!(
            unit(self.risk.max_drawdown_pct),
            "max_drawdown_pct must be between 0 and 1"
        );
        anyhow::ensure!(
            unit(self.risk.max_daily_loss_pct),
            "max_daily_loss_pct must be between 0 and 1"
        );

        anyhow::ensure!(
            unit(self.execution.slippage_pct),
            "slippage_pct must be between 0 and 1"
        );
        anyhow::ensure!(
            unit(self.execution.hedge_drift_tolerance_pct),
            "hedge_drift_tolerance_pct must be between 0 and 1"
        );
        anyhow::ensure!(
            self.execution.order_timeout_secs >= 1,
            "order_timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            self.execution.close_retry_base_secs <= self.execution.close_retry_max_secs,
            "close_retry_base_secs must not exceed close_retry_max_secs"
        );

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.strategy.poll_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.strategy.fetch_timeout_ms)
    }

    pub fn order_timeout(&self) -> Duration {
        Duration::from_secs(self.execution.order_timeout_secs)
    }

    /// Parameters consumed by the funding signal detector.
    pub fn detector(&self) -> DetectorConfig {
        DetectorConfig {
            funding_threshold: self.strategy.funding_threshold,
            funding_ma_period: self.strategy.funding_ma_period,
            funding_zscore_k: self.strategy.funding_zscore_k,
            funding_interval_hours: self.strategy.funding_interval_hours,
        }
    }

    /// Limits enforced by the risk gate.
    pub fn risk_limits(&self) -> RiskLimits {
        RiskLimits {
            max_drawdown_pct: self.risk.max_drawdown_pct,
            max_daily_loss_pct: self.risk.max_daily_loss_pct,
            circuit_breaker_enabled: self.risk.circuit_breaker_enabled,
            capital_per_pair_pct: self.capital.capital_per_pair_pct,
            max_total_exposure_pct: self.capital.max_total_exposure_pct,
        }
    }

    /// Per-tick parameters of the orchestrator loop.
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            pairs: self.strategy.enabled_pairs.clone(),
            history_window: self.strategy.funding_ma_period,
            fetch_timeout: self.fetch_timeout(),
            order_timeout: self.order_timeout(),
            max_snapshot_age: chrono::Duration::seconds(self.strategy.max_snapshot_age_secs),
            capital_per_pair_pct: self.capital.capital_per_pair_pct,
            min_trade_size_usdt: self.capital.min_trade_size_usdt,
            taker_fee_pct: self.execution.taker_fee_pct,
            slippage_pct: self.execution.slippage_pct,
            funding_drop_alert_pct: self.strategy.funding_drop_alert_pct,
        }
    }

    /// Parameters for each position state machine.
    pub fn position(&self) -> PositionConfig {
        PositionConfig {
            close_threshold: self.strategy.funding_close_threshold,
            slippage_pct: self.execution.slippage_pct,
            hedge_drift_tolerance_pct: self.execution.hedge_drift_tolerance_pct,
            funding_interval: chrono::Duration::hours(i64::from(
                self.strategy.funding_interval_hours,
            )),
            order_timeout: chrono::Duration::seconds(self.execution.order_timeout_secs as i64),
            close_retry_base: chrono::Duration::seconds(
                self.execution.close_retry_base_secs as i64,
            ),
            close_retry_max: chrono::Duration::seconds(self.execution.close_retry_max_secs as i64),
            close_alert_after_attempts: self.execution.close_alert_after_attempts,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            strategy: StrategyConfig::default(),
            capital: CapitalConfig::default(),
            risk: RiskConfig::default(),
            execution: ExecutionConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            enabled_pairs: default_enabled_pairs(),
            poll_interval_secs: default_poll_interval(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            max_snapshot_age_secs: default_max_snapshot_age(),
            funding_threshold: default_funding_threshold(),
            funding_close_threshold: default_funding_close_threshold(),
            funding_ma_period: default_funding_ma_period(),
            funding_zscore_k: default_funding_zscore_k(),
            funding_interval_hours: default_funding_interval_hours(),
            funding_drop_alert_pct: default_funding_drop_alert_pct(),
        }
    }
}

impl Default for CapitalConfig {
    fn default() -> Self {
        Self {
            initial_capital: default_initial_capital(),
            capital_per_pair_pct: default_capital_per_pair_pct(),
            max_total_exposure_pct: default_max_total_exposure_pct(),
            min_trade_size_usdt: default_min_trade_size(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_drawdown_pct: default_max_drawdown(),
            max_daily_loss_pct: default_max_daily_loss(),
            circuit_breaker_enabled: default_circuit_breaker_enabled(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            slippage_pct: default_slippage(),
            taker_fee_pct: default_taker_fee(),
            hedge_drift_tolerance_pct: default_hedge_drift_tolerance(),
            order_timeout_secs: default_order_timeout(),
            close_retry_base_secs: default_close_retry_base(),
            close_retry_max_secs: default_close_retry_max(),
            close_alert_after_attempts: default_close_alert_after(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_short_history_window() {
        let mut config = Config::default();
        config.strategy.funding_ma_period = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_fetch_timeout_longer_than_poll() {
        let mut config = Config::default();
        config.strategy.fetch_timeout_ms = 20_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_close_threshold_above_entry() {
        let mut config = Config::default();
        config.strategy.funding_close_threshold = dec!(0.001);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_component_views_follow_sections() {
        let config = Config::default();

        let detector = config.detector();
        assert_eq!(detector.funding_threshold, dec!(0.0003));
        assert_eq!(detector.funding_ma_period, 24);

        let limits = config.risk_limits();
        assert_eq!(limits.max_drawdown_pct, dec!(0.10));
        assert!(limits.circuit_breaker_enabled);

        let position = config.position();
        assert_eq!(position.funding_interval, chrono::Duration::hours(1));
        assert_eq!(position.close_alert_after_attempts, 5);

        let orchestrator = config.orchestrator();
        assert_eq!(orchestrator.pairs, vec!["BTC", "ETH", "SOL"]);
        assert_eq!(orchestrator.fetch_timeout, Duration::from_millis(5000));
        assert_eq!(orchestrator.history_window, 24);
    }
}
