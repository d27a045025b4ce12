// =============================================================================
// Pipeline filters — trend confirmation and execution-layer checks
// =============================================================================

use crate::runtime_config::PipelineParams;

use super::{MarketSnapshot, SignalKind, StageVerdict, TradeSignal, TrendDirection};

/// Trend filter: the signal must agree with the higher-timeframe trend
/// unless the regime is explicitly mean-reverting.
pub fn trend_filter(signal: &TradeSignal, snapshot: &MarketSnapshot) -> StageVerdict {
    if snapshot.regime == "mean_revert" {
        return StageVerdict::pass("mean-revert regime, trend agreement waived");
    }

    let agrees = matches!(
        (signal.kind, snapshot.higher_tf_trend),
        (SignalKind::Buy, TrendDirection::Up) | (SignalKind::Sell, TrendDirection::Down)
    );

    if agrees {
        StageVerdict::pass(format!(
            "{} signal confirmed by {:?} higher-timeframe trend",
            signal.kind.as_str(),
            snapshot.higher_tf_trend
        ))
    } else {
        StageVerdict::fail(format!(
            "{} signal against {:?} higher-timeframe trend",
            signal.kind.as_str(),
            snapshot.higher_tf_trend
        ))
    }
}

/// Execution-layer filter: microstructure sanity plus the signal cooldown.
/// `seconds_since_last` is `None` when no signal has been accepted yet.
pub fn execution_filter(
    snapshot: &MarketSnapshot,
    params: &PipelineParams,
    seconds_since_last: Option<u64>,
) -> StageVerdict {
    if snapshot.spread_pct > params.max_spread_pct {
        return StageVerdict::fail(format!(
            "spread {:.3}% > {:.3}% max",
            snapshot.spread_pct, params.max_spread_pct
        ));
    }

    if snapshot.volume_ratio < params.min_volume_ratio {
        return StageVerdict::fail(format!(
            "volume ratio {:.2} < {:.2} min",
            snapshot.volume_ratio, params.min_volume_ratio
        ));
    }

    if snapshot.atr_spike_ratio > params.max_atr_spike_ratio {
        return StageVerdict::fail(format!(
            "ATR spike {:.2} > {:.2} max",
            snapshot.atr_spike_ratio, params.max_atr_spike_ratio
        ));
    }

    if let Some(elapsed) = seconds_since_last {
        if elapsed < params.signal_cooldown {
            return StageVerdict::fail(format!(
                "cooldown: {elapsed}s since last accepted signal (< {}s)",
                params.signal_cooldown
            ));
        }
    }

    StageVerdict::pass("execution checks passed")
}
