// =============================================================================
// Signal pipeline — staged filters with shadow-mode counterfactual recording
// =============================================================================

pub mod filters;
pub mod runner;
pub mod shadow;

use serde::{Deserialize, Serialize};

use crate::advisor::IndicatorSnapshot;

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Direction of a strategy signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Buy,
    Sell,
    Neutral,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
            Self::Neutral => "neutral",
        }
    }
}

/// A signal produced by some strategy. The pipeline does not care how it
/// was generated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    pub strategy: String,
    pub kind: SignalKind,
    /// Signal strength in [0, 1].
    pub strength: f64,
    /// Strategy's own confidence in [0, 1].
    pub confidence: f64,
}

/// Higher-timeframe trend direction consumed by the trend filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Up,
    Down,
    Flat,
}

/// Market state accompanying one signal through the pipeline.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub price: f64,
    /// Market regime label ("trend" / "mean_revert" / "chop").
    pub regime: String,
    pub volatility: f64,
    pub higher_tf_trend: TrendDirection,
    /// Current bid/ask spread percentage.
    pub spread_pct: f64,
    /// Volume vs. its rolling average.
    pub volume_ratio: f64,
    /// ATR vs. its rolling average.
    pub atr_spike_ratio: f64,
    pub indicators: IndicatorSnapshot,
}

/// One stage's outcome.
#[derive(Debug, Clone, Serialize)]
pub struct StageVerdict {
    pub pass: bool,
    pub reason: String,
}

impl StageVerdict {
    pub fn pass(reason: impl Into<String>) -> Self {
        Self {
            pass: true,
            reason: reason.into(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            pass: false,
            reason: reason.into(),
        }
    }

    /// A stage skipped by live-mode short-circuiting.
    pub fn skipped() -> Self {
        Self {
            pass: false,
            reason: String::new(),
        }
    }
}

/// Final pipeline verdict returned to the caller.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub trade_id: String,
    pub accepted: bool,
    /// First failing stage, empty when accepted.
    pub rejection_stage: String,
    pub rejection_reason: String,
}

// ---------------------------------------------------------------------------
// Shadow decision row
// ---------------------------------------------------------------------------

/// One row of the shadow decision table: every stage's would-execute
/// outcome for one signal, appended regardless of the final verdict.
/// Outcome fields are patched in place when the trade closes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShadowDecisionRow {
    pub timestamp: String,
    pub trade_id: String,

    pub price: f64,
    pub market_regime: String,
    pub volatility: f64,

    pub strategy: String,
    pub signal: String,
    pub signal_strength: f64,
    pub signal_confidence: f64,

    pub would_execute_strategy: bool,
    pub would_execute_after_trend: bool,
    pub would_execute_after_advisor: bool,
    pub would_execute_after_exec: bool,
    pub final_would_execute: bool,

    pub rejection_stage: String,
    pub rejection_reason: String,

    pub trend_filter_pass: bool,
    pub trend_filter_reason: String,

    pub advisor_enabled: bool,
    pub advisor_pass: bool,
    pub advisor_confidence: f64,
    pub advisor_regime: String,
    pub advisor_signal_quality: f64,
    /// JSON-encoded list of advisor risk flags.
    pub advisor_risk_flags: String,

    pub exec_filter_pass: bool,
    pub exec_filter_reason: String,
    pub spread_pct: f64,
    pub volume_ratio: f64,
    pub atr_spike_ratio: f64,

    pub base_position_pct: f64,
    pub adjusted_position_pct: f64,
    pub position_adjustment_factor: f64,

    pub actually_executed: bool,
    pub actual_entry_price: f64,
    pub actual_exit_price: f64,
    pub actual_pnl: f64,
    pub actual_pnl_pct: f64,
}
