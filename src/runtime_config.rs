// =============================================================================
// Runtime Configuration — Hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Meridian trading engine. Every tunable
// parameter lives here so that the engine can be reconfigured at runtime
// without a restart.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::TradingMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_venues() -> Vec<String> {
    vec!["bitget".to_string(), "binance".to_string(), "okx".to_string()]
}

fn default_monitor_interval_secs() -> f64 {
    1.0
}

fn default_scan_interval_secs() -> f64 {
    2.0
}

fn default_position_size() -> f64 {
    100.0
}

fn default_spread_history_size() -> usize {
    100
}

fn default_min_spread_threshold() -> f64 {
    0.3
}

fn default_min_net_profit_threshold() -> f64 {
    1.0
}

fn default_min_profit_ratio() -> f64 {
    0.5
}

fn default_min_orderbook_depth_usd() -> f64 {
    5000.0
}

fn default_min_depth_multiplier() -> f64 {
    3.0
}

fn default_max_position_per_venue() -> f64 {
    500.0
}

fn default_max_total_exposure() -> f64 {
    1000.0
}

fn default_max_position_count_per_venue() -> u32 {
    3
}

fn default_max_arbitrage_per_hour() -> u32 {
    10
}

fn default_max_arbitrage_per_day() -> u32 {
    50
}

fn default_min_interval_secs() -> u64 {
    30
}

fn default_max_execution_time_per_leg_secs() -> u64 {
    10
}

fn default_max_total_execution_time_secs() -> u64 {
    30
}

fn default_max_slippage_tolerance() -> f64 {
    0.2
}

fn default_taker_fee() -> f64 {
    0.0006
}

fn default_fee_table() -> HashMap<String, FeeRates> {
    HashMap::from([
        ("bitget".to_string(), FeeRates { maker: 0.0002, taker: 0.0006 }),
        ("binance".to_string(), FeeRates { maker: 0.0002, taker: 0.0004 }),
        ("okx".to_string(), FeeRates { maker: 0.0002, taker: 0.0005 }),
    ])
}

fn default_initial_balance() -> f64 {
    1000.0
}

fn default_max_consecutive_losses() -> u32 {
    3
}

fn default_max_daily_loss_pct() -> f64 {
    0.05
}

fn default_min_account_balance_pct() -> f64 {
    0.70
}

fn default_consecutive_loss_pause_mins() -> u64 {
    30
}

fn default_daily_loss_pause_mins() -> u64 {
    60
}

fn default_account_loss_pause_mins() -> u64 {
    120
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_max_daily_calls() -> u32 {
    500
}

fn default_max_daily_cost() -> f64 {
    10.0
}

fn default_advisor_timeout_secs() -> u64 {
    10
}

fn default_failure_mode() -> AdvisorFailureMode {
    AdvisorFailureMode::Pass
}

fn default_max_spread_pct() -> f64 {
    0.1
}

fn default_min_volume_ratio() -> f64 {
    0.5
}

fn default_max_atr_spike_ratio() -> f64 {
    3.0
}

fn default_signal_cooldown_secs() -> u64 {
    300
}

fn default_base_position_pct() -> f64 {
    2.0
}

// =============================================================================
// Parameter groups
// =============================================================================

/// Arbitrage engine scheduling and sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageParams {
    /// Symbol monitored across all venues.
    #[serde(default = "default_symbol")]
    pub arbitrage_symbol: String,

    /// Venues polled by the spread monitor.
    #[serde(default = "default_venues")]
    pub arbitrage_exchanges: Vec<String>,

    /// Seconds between spread-monitor rounds.
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval: f64,

    /// Seconds between engine opportunity scans.
    #[serde(default = "default_scan_interval_secs")]
    pub opportunity_scan_interval: f64,

    /// Trade size per arbitrage in quote currency.
    #[serde(default = "default_position_size")]
    pub arbitrage_position_size: f64,

    /// Ring-buffer capacity for recent spreads.
    #[serde(default = "default_spread_history_size")]
    pub spread_history_size: usize,
}

impl Default for ArbitrageParams {
    fn default() -> Self {
        Self {
            arbitrage_symbol: default_symbol(),
            arbitrage_exchanges: default_venues(),
            monitor_interval: default_monitor_interval_secs(),
            opportunity_scan_interval: default_scan_interval_secs(),
            arbitrage_position_size: default_position_size(),
            spread_history_size: default_spread_history_size(),
        }
    }
}

/// Profitability and depth thresholds used by the detector and re-asserted
/// by the risk gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdParams {
    /// Minimum spread percentage worth modelling.
    #[serde(default = "default_min_spread_threshold")]
    pub min_spread_threshold: f64,

    /// Minimum net profit in quote currency.
    #[serde(default = "default_min_net_profit_threshold")]
    pub min_net_profit_threshold: f64,

    /// Minimum net/gross ratio.
    #[serde(default = "default_min_profit_ratio")]
    pub min_profit_ratio: f64,

    /// Absolute order-book depth floor in quote currency.
    #[serde(default = "default_min_orderbook_depth_usd")]
    pub min_orderbook_depth_usd: f64,

    /// Depth must also cover `amount ×` this multiplier.
    #[serde(default = "default_min_depth_multiplier")]
    pub min_depth_multiplier: f64,
}

impl Default for ThresholdParams {
    fn default() -> Self {
        Self {
            min_spread_threshold: default_min_spread_threshold(),
            min_net_profit_threshold: default_min_net_profit_threshold(),
            min_profit_ratio: default_min_profit_ratio(),
            min_orderbook_depth_usd: default_min_orderbook_depth_usd(),
            min_depth_multiplier: default_min_depth_multiplier(),
        }
    }
}

/// Position and frequency caps enforced by the risk gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapParams {
    #[serde(default = "default_max_position_per_venue")]
    pub max_position_per_venue: f64,

    #[serde(default = "default_max_total_exposure")]
    pub max_total_exposure: f64,

    #[serde(default = "default_max_position_count_per_venue")]
    pub max_position_count_per_venue: u32,

    #[serde(default = "default_max_arbitrage_per_hour")]
    pub max_arbitrage_per_hour: u32,

    #[serde(default = "default_max_arbitrage_per_day")]
    pub max_arbitrage_per_day: u32,

    /// Minimum seconds between consecutive arbitrage executions.
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_between_arbitrage: u64,
}

impl Default for CapParams {
    fn default() -> Self {
        Self {
            max_position_per_venue: default_max_position_per_venue(),
            max_total_exposure: default_max_total_exposure(),
            max_position_count_per_venue: default_max_position_count_per_venue(),
            max_arbitrage_per_hour: default_max_arbitrage_per_hour(),
            max_arbitrage_per_day: default_max_arbitrage_per_day(),
            min_interval_between_arbitrage: default_min_interval_secs(),
        }
    }
}

/// Two-leg executor limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionParams {
    #[serde(default = "default_max_execution_time_per_leg_secs")]
    pub max_execution_time_per_leg: u64,

    #[serde(default = "default_max_total_execution_time_secs")]
    pub max_total_execution_time: u64,

    #[serde(default = "default_max_slippage_tolerance")]
    pub max_slippage_tolerance: f64,

    /// When on, a successful buy leg is unwound if the sell leg fails.
    #[serde(default = "default_true")]
    pub atomic_execution_enabled: bool,
}

impl Default for ExecutionParams {
    fn default() -> Self {
        Self {
            max_execution_time_per_leg: default_max_execution_time_per_leg_secs(),
            max_total_execution_time: default_max_total_execution_time_secs(),
            max_slippage_tolerance: default_max_slippage_tolerance(),
            atomic_execution_enabled: true,
        }
    }
}

/// Per-venue maker/taker fee rates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeeRates {
    pub maker: f64,
    pub taker: f64,
}

impl Default for FeeRates {
    fn default() -> Self {
        Self {
            maker: 0.0002,
            taker: default_taker_fee(),
        }
    }
}

/// Emergency circuit-breaker thresholds and pause durations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerParams {
    /// Starting capital anchoring the equity-drawdown trigger.
    #[serde(default = "default_initial_balance")]
    pub initial_balance: f64,

    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,

    /// Daily loss fraction (0.05 = 5 %).
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,

    /// Pause when balance falls to this fraction of initial.
    #[serde(default = "default_min_account_balance_pct")]
    pub min_account_balance_pct: f64,

    #[serde(default = "default_consecutive_loss_pause_mins")]
    pub consecutive_loss_pause_minutes: u64,

    #[serde(default = "default_daily_loss_pause_mins")]
    pub daily_loss_pause_minutes: u64,

    #[serde(default = "default_account_loss_pause_mins")]
    pub account_loss_pause_minutes: u64,
}

impl Default for BreakerParams {
    fn default() -> Self {
        Self {
            initial_balance: default_initial_balance(),
            max_consecutive_losses: default_max_consecutive_losses(),
            max_daily_loss_pct: default_max_daily_loss_pct(),
            min_account_balance_pct: default_min_account_balance_pct(),
            consecutive_loss_pause_minutes: default_consecutive_loss_pause_mins(),
            daily_loss_pause_minutes: default_daily_loss_pause_mins(),
            account_loss_pause_minutes: default_account_loss_pause_mins(),
        }
    }
}

/// What the advisor guardrails return when the advisor is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdvisorFailureMode {
    /// Let the signal through at half confidence.
    Pass,
    /// Reject the signal outright.
    Reject,
}

/// Advisor guardrail budgets and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailParams {
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl: u64,

    #[serde(default = "default_max_daily_calls")]
    pub max_daily_calls: u32,

    /// Daily spend ceiling in dollars.
    #[serde(default = "default_max_daily_cost")]
    pub max_daily_cost: f64,

    /// Per-call wall-clock limit in seconds.
    #[serde(default = "default_advisor_timeout_secs")]
    pub timeout: u64,

    #[serde(default = "default_failure_mode")]
    pub failure_mode: AdvisorFailureMode,
}

impl Default for GuardrailParams {
    fn default() -> Self {
        Self {
            cache_ttl: default_cache_ttl_secs(),
            max_daily_calls: default_max_daily_calls(),
            max_daily_cost: default_max_daily_cost(),
            timeout: default_advisor_timeout_secs(),
            failure_mode: default_failure_mode(),
        }
    }
}

/// Signal-pipeline stage parameters (execution filter + shadow mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineParams {
    /// Record stage-by-stage would-execute outcomes for every signal.
    #[serde(default = "default_true")]
    pub enable_shadow_mode: bool,

    /// Execution filter: maximum tolerable bid/ask spread percentage.
    #[serde(default = "default_max_spread_pct")]
    pub max_spread_pct: f64,

    /// Execution filter: minimum volume vs. its rolling average.
    #[serde(default = "default_min_volume_ratio")]
    pub min_volume_ratio: f64,

    /// Execution filter: maximum ATR spike vs. its rolling average.
    #[serde(default = "default_max_atr_spike_ratio")]
    pub max_atr_spike_ratio: f64,

    /// Seconds that must elapse between accepted signals.
    #[serde(default = "default_signal_cooldown_secs")]
    pub signal_cooldown: u64,

    /// Base position size as a percentage of capital, recorded with every
    /// decision.
    #[serde(default = "default_base_position_pct")]
    pub base_position_pct: f64,
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            enable_shadow_mode: true,
            max_spread_pct: default_max_spread_pct(),
            min_volume_ratio: default_min_volume_ratio(),
            max_atr_spike_ratio: default_max_atr_spike_ratio(),
            signal_cooldown: default_signal_cooldown_secs(),
            base_position_pct: default_base_position_pct(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Meridian engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Current trading mode: Live, Paused, or Killed.
    #[serde(default)]
    pub trading_mode: TradingMode,

    #[serde(default)]
    pub arbitrage: ArbitrageParams,

    #[serde(default)]
    pub thresholds: ThresholdParams,

    #[serde(default)]
    pub caps: CapParams,

    #[serde(default)]
    pub execution: ExecutionParams,

    /// Per-venue fee rates; venues missing from the table fall back to a
    /// 6 bp taker fee.
    #[serde(default = "default_fee_table")]
    pub fees: HashMap<String, FeeRates>,

    #[serde(default)]
    pub breaker: BreakerParams,

    #[serde(default)]
    pub guardrails: GuardrailParams,

    #[serde(default)]
    pub pipeline: PipelineParams,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::default(),
            arbitrage: ArbitrageParams::default(),
            thresholds: ThresholdParams::default(),
            caps: CapParams::default(),
            execution: ExecutionParams::default(),
            fees: default_fee_table(),
            breaker: BreakerParams::default(),
            guardrails: GuardrailParams::default(),
            pipeline: PipelineParams::default(),
        }
    }
}

impl RuntimeConfig {
    /// Taker fee for `venue`, falling back to the 6 bp default.
    pub fn taker_fee(&self, venue: &str) -> f64 {
        self.fees
            .get(&venue.to_lowercase())
            .map(|f| f.taker)
            .unwrap_or_else(default_taker_fee)
    }

    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol = %config.arbitrage.arbitrage_symbol,
            venues = ?config.arbitrage.arbitrage_exchanges,
            trading_mode = %config.trading_mode,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    ///
    /// This prevents corruption if the process crashes mid-write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.arbitrage.arbitrage_symbol, "BTCUSDT");
        assert_eq!(cfg.arbitrage.arbitrage_exchanges.len(), 3);
        assert!((cfg.arbitrage.monitor_interval - 1.0).abs() < f64::EPSILON);
        assert!((cfg.arbitrage.opportunity_scan_interval - 2.0).abs() < f64::EPSILON);
        assert!((cfg.thresholds.min_spread_threshold - 0.3).abs() < f64::EPSILON);
        assert_eq!(cfg.caps.max_position_count_per_venue, 3);
        assert_eq!(cfg.caps.min_interval_between_arbitrage, 30);
        assert_eq!(cfg.execution.max_execution_time_per_leg, 10);
        assert_eq!(cfg.execution.max_total_execution_time, 30);
        assert!(cfg.execution.atomic_execution_enabled);
        assert_eq!(cfg.breaker.max_consecutive_losses, 3);
        assert!((cfg.breaker.max_daily_loss_pct - 0.05).abs() < f64::EPSILON);
        assert!((cfg.breaker.min_account_balance_pct - 0.70).abs() < f64::EPSILON);
        assert_eq!(cfg.guardrails.max_daily_calls, 500);
        assert_eq!(cfg.guardrails.failure_mode, AdvisorFailureMode::Pass);
        assert!(cfg.pipeline.enable_shadow_mode);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.caps.max_arbitrage_per_hour, 10);
        assert_eq!(cfg.caps.max_arbitrage_per_day, 50);
        assert_eq!(cfg.guardrails.cache_ttl, 300);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "trading_mode": "Live",
            "arbitrage": { "arbitrage_symbol": "ETHUSDT" },
            "guardrails": { "failure_mode": "reject" }
        }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Live);
        assert_eq!(cfg.arbitrage.arbitrage_symbol, "ETHUSDT");
        // Unspecified siblings keep their defaults.
        assert_eq!(cfg.arbitrage.arbitrage_exchanges.len(), 3);
        assert_eq!(cfg.guardrails.failure_mode, AdvisorFailureMode::Reject);
        assert_eq!(cfg.guardrails.timeout, 10);
    }

    #[test]
    fn taker_fee_falls_back_to_six_bps() {
        let cfg = RuntimeConfig::default();
        assert!((cfg.taker_fee("binance") - 0.0004).abs() < f64::EPSILON);
        assert!((cfg.taker_fee("OKX") - 0.0005).abs() < f64::EPSILON);
        assert!((cfg.taker_fee("unknown") - 0.0006).abs() < f64::EPSILON);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.arbitrage.arbitrage_symbol, cfg2.arbitrage.arbitrage_symbol);
        assert_eq!(cfg.caps.max_position_count_per_venue, cfg2.caps.max_position_count_per_venue);
        assert_eq!(cfg.trading_mode, cfg2.trading_mode);
    }
}
