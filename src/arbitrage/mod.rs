// =============================================================================
// Arbitrage domain models — spreads, opportunities, trades
// =============================================================================

pub mod engine;
pub mod execution;
pub mod opportunity_detector;
pub mod position_ledger;
pub mod risk_gate;
pub mod spread_monitor;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::venue::OrderResult;

// ---------------------------------------------------------------------------
// Spread
// ---------------------------------------------------------------------------

/// A directional price gap: buy at `buy_venue`'s ask, sell at `sell_venue`'s
/// bid. Immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpreadData {
    pub buy_venue: String,
    pub sell_venue: String,
    pub symbol: String,
    /// Ask on the buy venue.
    pub buy_price: f64,
    /// Bid on the sell venue.
    pub sell_price: f64,
    /// (sell − buy) / buy × 100.
    pub spread_pct: f64,
    /// Monitor round timestamp in milliseconds; every spread of one round
    /// shares the same value.
    pub ts_ms: i64,
}

impl std::fmt::Display for SpreadData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Spread({}->{}: {:.3}%, buy={:.2}, sell={:.2})",
            self.buy_venue, self.sell_venue, self.spread_pct, self.buy_price, self.sell_price
        )
    }
}

// ---------------------------------------------------------------------------
// Opportunity
// ---------------------------------------------------------------------------

/// A spread enriched with the cost model. `net_profit` is the sole
/// acceptance criterion; `gross_profit >= net_profit` always holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageOpportunity {
    pub buy_venue: String,
    pub sell_venue: String,
    pub symbol: String,
    pub buy_price: f64,
    pub sell_price: f64,
    pub spread_pct: f64,
    /// (sell − buy) × amount / buy, before costs.
    pub gross_profit: f64,
    /// Gross minus fees, slippage, and the safety buffer.
    pub net_profit: f64,
    pub buy_fee_rate: f64,
    pub sell_fee_rate: f64,
    pub est_buy_slippage: f64,
    pub est_sell_slippage: f64,
    pub ts_ms: i64,
    /// min(bid depth, ask depth) in quote currency on the buy venue.
    pub buy_depth_usd: Option<f64>,
    /// min(bid depth, ask depth) in quote currency on the sell venue.
    pub sell_depth_usd: Option<f64>,
    /// 0 is safest, 1 is riskiest.
    pub risk_score: f64,
}

impl std::fmt::Display for ArbitrageOpportunity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Opportunity({}->{}: spread={:.3}%, net_profit={:.4})",
            self.buy_venue, self.sell_venue, self.spread_pct, self.net_profit
        )
    }
}

// ---------------------------------------------------------------------------
// Trade
// ---------------------------------------------------------------------------

/// Two-leg trade state machine. COMPLETED and FAILED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    Pending,
    ExecutingBuy,
    ExecutingSell,
    RollingBack,
    Completed,
    Failed,
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::ExecutingBuy => "EXECUTING_BUY",
            Self::ExecutingSell => "EXECUTING_SELL",
            Self::RollingBack => "ROLLING_BACK",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// Record of one two-leg arbitrage execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageTrade {
    pub id: String,
    pub opportunity: ArbitrageOpportunity,
    pub status: TradeStatus,
    /// Trade size in quote currency.
    pub amount: f64,

    pub buy_order: Option<OrderResult>,
    pub sell_order: Option<OrderResult>,

    pub expected_pnl: f64,
    pub actual_pnl: Option<f64>,
    pub failure_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub buy_executed_at: Option<DateTime<Utc>>,
    pub sell_executed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Leg and total durations in seconds, derived from the timestamps.
    pub buy_execution_time: Option<f64>,
    pub sell_execution_time: Option<f64>,
    pub total_execution_time: Option<f64>,
}

impl ArbitrageTrade {
    pub fn new(opportunity: ArbitrageOpportunity, amount: f64) -> Self {
        let expected_pnl = opportunity.net_profit;
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            opportunity,
            status: TradeStatus::Pending,
            amount,
            buy_order: None,
            sell_order: None,
            expected_pnl,
            actual_pnl: None,
            failure_reason: None,
            created_at: Utc::now(),
            buy_executed_at: None,
            sell_executed_at: None,
            completed_at: None,
            buy_execution_time: None,
            sell_execution_time: None,
            total_execution_time: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == TradeStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.status == TradeStatus::Failed
    }

    pub fn is_executing(&self) -> bool {
        matches!(
            self.status,
            TradeStatus::ExecutingBuy | TradeStatus::ExecutingSell | TradeStatus::RollingBack
        )
    }

    /// Derive the per-leg and total durations from the recorded timestamps.
    pub fn calculate_execution_time(&mut self) {
        if let Some(buy_at) = self.buy_executed_at {
            self.buy_execution_time =
                Some((buy_at - self.created_at).num_milliseconds() as f64 / 1000.0);
            if let Some(sell_at) = self.sell_executed_at {
                self.sell_execution_time =
                    Some((sell_at - buy_at).num_milliseconds() as f64 / 1000.0);
            }
        }
        if let Some(done_at) = self.completed_at {
            self.total_execution_time =
                Some((done_at - self.created_at).num_milliseconds() as f64 / 1000.0);
        }
    }
}

impl std::fmt::Display for ArbitrageTrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Trade({}->{}: status={}, amount={:.2}, pnl={:?})",
            self.opportunity.buy_venue,
            self.opportunity.sell_venue,
            self.status,
            self.amount,
            self.actual_pnl
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_opportunity() -> ArbitrageOpportunity {
        ArbitrageOpportunity {
            buy_venue: "bitget".into(),
            sell_venue: "okx".into(),
            symbol: "BTCUSDT".into(),
            buy_price: 100.0,
            sell_price: 100.5,
            spread_pct: 0.5,
            gross_profit: 2.5,
            net_profit: 1.1,
            buy_fee_rate: 0.0006,
            sell_fee_rate: 0.0006,
            est_buy_slippage: 0.0003,
            est_sell_slippage: 0.0003,
            ts_ms: 1,
            buy_depth_usd: Some(50_000.0),
            sell_depth_usd: Some(50_000.0),
            risk_score: 0.4,
        }
    }

    #[test]
    fn trade_status_lifecycle_predicates() {
        let mut trade = ArbitrageTrade::new(sample_opportunity(), 500.0);
        assert_eq!(trade.status, TradeStatus::Pending);
        assert!(!trade.is_executing());

        trade.status = TradeStatus::ExecutingSell;
        assert!(trade.is_executing());

        trade.status = TradeStatus::Completed;
        assert!(trade.is_completed());
        assert!(!trade.is_failed());
    }

    #[test]
    fn execution_time_derived_from_timestamps() {
        let mut trade = ArbitrageTrade::new(sample_opportunity(), 500.0);
        trade.buy_executed_at = Some(trade.created_at + Duration::milliseconds(1500));
        trade.sell_executed_at = Some(trade.created_at + Duration::milliseconds(2500));
        trade.completed_at = Some(trade.created_at + Duration::milliseconds(3000));
        trade.calculate_execution_time();

        assert_eq!(trade.buy_execution_time, Some(1.5));
        assert_eq!(trade.sell_execution_time, Some(1.0));
        assert_eq!(trade.total_execution_time, Some(3.0));
    }

    #[test]
    fn status_display_matches_store_format() {
        assert_eq!(TradeStatus::ExecutingBuy.to_string(), "EXECUTING_BUY");
        assert_eq!(TradeStatus::RollingBack.to_string(), "ROLLING_BACK");
        assert_eq!(TradeStatus::Completed.to_string(), "COMPLETED");
    }
}
