// =============================================================================
// Arbitrage Risk Gate — pre-trade checks and reservation accounting
// =============================================================================
//
// Checks run in a fixed order and the first failure wins:
//   1. Position caps (per-venue exposure, global exposure, open count)
//   2. Rate limits (min interval, hourly, daily)
//   3. Profitability floor (re-asserts the detector's thresholds)
//   4. Order-book depth floor
//   5. Venue health (both adapters connected)
//   6. Balance (free quote currency on both venues)
//
// `record_start` reserves exposure/count and stamps the rate-limit history;
// `record_complete` releases. Reservations survive executor failures — the
// engine releases them in the FAILED branch as well.
//
// The balance check deliberately verifies free quote currency on both legs;
// whether a venue needs base-currency inventory for the sell leg is
// venue-specific and not modelled here.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::runtime_config::{CapParams, RuntimeConfig, ThresholdParams};
use crate::venue::registry::VenueRegistry;

use super::ArbitrageOpportunity;

/// Rate-limit history entries retained (epoch seconds).
const HISTORY_CAPACITY: usize = 100;

struct Inner {
    /// Reserved exposure per venue, in quote currency.
    position_amounts: HashMap<String, f64>,
    /// Open reservation count per venue.
    position_counts: HashMap<String, u32>,
    /// Start timestamps of recent arbitrages (epoch seconds).
    history: VecDeque<i64>,
    last_arbitrage_ts: Option<i64>,
}

/// Snapshot of the gate's counters for operators.
#[derive(Debug, Clone, Serialize)]
pub struct RiskReport {
    pub position_amounts: HashMap<String, f64>,
    pub position_counts: HashMap<String, u32>,
    pub total_exposure: f64,
    pub arbitrage_count_hour: usize,
    pub arbitrage_count_day: usize,
    pub last_arbitrage_ts: Option<i64>,
}

pub struct ArbitrageRiskGate {
    registry: Arc<VenueRegistry>,
    caps: CapParams,
    thresholds: ThresholdParams,
    state: RwLock<Inner>,
}

impl ArbitrageRiskGate {
    pub fn new(registry: Arc<VenueRegistry>, config: &RuntimeConfig) -> Self {
        info!(
            max_position = config.caps.max_position_per_venue,
            max_exposure = config.caps.max_total_exposure,
            "arbitrage risk gate initialised"
        );
        Self {
            registry,
            caps: config.caps.clone(),
            thresholds: config.thresholds.clone(),
            state: RwLock::new(Inner {
                position_amounts: HashMap::new(),
                position_counts: HashMap::new(),
                history: VecDeque::with_capacity(HISTORY_CAPACITY),
                last_arbitrage_ts: None,
            }),
        }
    }

    // -------------------------------------------------------------------------
    // The gate
    // -------------------------------------------------------------------------

    /// Run every check in order. Returns `(true, "ok")` only when all pass.
    pub async fn can_execute_arbitrage(
        &self,
        opportunity: &ArbitrageOpportunity,
        amount: f64,
    ) -> (bool, String) {
        if let Err(reason) = self.check_position_limits(opportunity, amount) {
            return (false, format!("position caps: {reason}"));
        }
        if let Err(reason) = self.check_frequency_limits() {
            return (false, format!("rate limits: {reason}"));
        }
        if let Err(reason) = self.check_profitability(opportunity) {
            return (false, format!("profitability: {reason}"));
        }
        if let Err(reason) = self.check_orderbook_depth(opportunity, amount) {
            return (false, format!("depth: {reason}"));
        }
        if let Err(reason) = self.check_venue_health(opportunity).await {
            return (false, format!("venue health: {reason}"));
        }
        if let Err(reason) = self.check_balances(opportunity, amount).await {
            return (false, format!("balance: {reason}"));
        }

        (true, "all checks passed".to_string())
    }

    fn check_position_limits(
        &self,
        opportunity: &ArbitrageOpportunity,
        amount: f64,
    ) -> Result<(), String> {
        let s = self.state.read();

        for venue in [&opportunity.buy_venue, &opportunity.sell_venue] {
            let current = s.position_amounts.get(venue.as_str()).copied().unwrap_or(0.0);
            if current + amount > self.caps.max_position_per_venue {
                return Err(format!(
                    "{venue} exposure {:.2} would exceed {:.2}",
                    current + amount,
                    self.caps.max_position_per_venue
                ));
            }
        }

        let total: f64 = s.position_amounts.values().sum::<f64>() + amount * 2.0;
        if total > self.caps.max_total_exposure {
            return Err(format!(
                "total exposure {total:.2} would exceed {:.2}",
                self.caps.max_total_exposure
            ));
        }

        for venue in [&opportunity.buy_venue, &opportunity.sell_venue] {
            let count = s.position_counts.get(venue.as_str()).copied().unwrap_or(0);
            if count >= self.caps.max_position_count_per_venue {
                return Err(format!(
                    "{venue} open positions {count} >= {}",
                    self.caps.max_position_count_per_venue
                ));
            }
        }

        Ok(())
    }

    fn check_frequency_limits(&self) -> Result<(), String> {
        let s = self.state.read();
        let now = Utc::now().timestamp();

        if let Some(last) = s.last_arbitrage_ts {
            let elapsed = now - last;
            if elapsed < self.caps.min_interval_between_arbitrage as i64 {
                return Err(format!(
                    "interval {elapsed}s < {}s",
                    self.caps.min_interval_between_arbitrage
                ));
            }
        }

        let hour_count = s.history.iter().filter(|t| **t > now - 3600).count();
        if hour_count >= self.caps.max_arbitrage_per_hour as usize {
            return Err(format!(
                "hourly count {hour_count} >= {}",
                self.caps.max_arbitrage_per_hour
            ));
        }

        let day_count = s.history.iter().filter(|t| **t > now - 86_400).count();
        if day_count >= self.caps.max_arbitrage_per_day as usize {
            return Err(format!(
                "daily count {day_count} >= {}",
                self.caps.max_arbitrage_per_day
            ));
        }

        Ok(())
    }

    fn check_profitability(&self, opportunity: &ArbitrageOpportunity) -> Result<(), String> {
        if opportunity.spread_pct < self.thresholds.min_spread_threshold {
            return Err(format!(
                "spread {:.3}% < {:.3}%",
                opportunity.spread_pct, self.thresholds.min_spread_threshold
            ));
        }
        if opportunity.net_profit < self.thresholds.min_net_profit_threshold {
            return Err(format!(
                "net profit {:.2} < {:.2}",
                opportunity.net_profit, self.thresholds.min_net_profit_threshold
            ));
        }
        let profit_ratio = if opportunity.gross_profit > 0.0 {
            opportunity.net_profit / opportunity.gross_profit
        } else {
            0.0
        };
        if profit_ratio < self.thresholds.min_profit_ratio {
            return Err(format!(
                "profit ratio {profit_ratio:.2} < {:.2}",
                self.thresholds.min_profit_ratio
            ));
        }
        Ok(())
    }

    fn check_orderbook_depth(
        &self,
        opportunity: &ArbitrageOpportunity,
        amount: f64,
    ) -> Result<(), String> {
        let required = amount * self.thresholds.min_depth_multiplier;
        for (venue, depth) in [
            (&opportunity.buy_venue, opportunity.buy_depth_usd),
            (&opportunity.sell_venue, opportunity.sell_depth_usd),
        ] {
            if let Some(d) = depth {
                if d < self.thresholds.min_orderbook_depth_usd {
                    return Err(format!(
                        "{venue} depth {d:.0} < {:.0}",
                        self.thresholds.min_orderbook_depth_usd
                    ));
                }
                if d < required {
                    return Err(format!("{venue} depth {d:.0} < required {required:.0}"));
                }
            }
        }
        Ok(())
    }

    async fn check_venue_health(&self, opportunity: &ArbitrageOpportunity) -> Result<(), String> {
        for venue in [&opportunity.buy_venue, &opportunity.sell_venue] {
            let adapter = self
                .registry
                .get(venue)
                .await
                .map_err(|e| format!("{venue}: {e}"))?;
            if !adapter.is_connected() {
                return Err(format!("{venue} not connected"));
            }
        }
        Ok(())
    }

    async fn check_balances(
        &self,
        opportunity: &ArbitrageOpportunity,
        amount: f64,
    ) -> Result<(), String> {
        for venue in [&opportunity.buy_venue, &opportunity.sell_venue] {
            let adapter = self
                .registry
                .get(venue)
                .await
                .map_err(|e| format!("{venue}: {e}"))?;
            let balance = adapter
                .get_balance()
                .await
                .map_err(|e| format!("{venue} balance check failed: {e}"))?;
            if balance < amount {
                return Err(format!("{venue} balance {balance:.2} < {amount:.2}"));
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reservation accounting
    // -------------------------------------------------------------------------

    /// Reserve counters for a starting arbitrage and stamp the rate limit.
    pub fn record_arbitrage_start(&self, opportunity: &ArbitrageOpportunity, amount: f64) {
        let mut s = self.state.write();
        let now = Utc::now().timestamp();

        if s.history.len() == HISTORY_CAPACITY {
            s.history.pop_front();
        }
        s.history.push_back(now);
        s.last_arbitrage_ts = Some(now);

        for venue in [&opportunity.buy_venue, &opportunity.sell_venue] {
            *s.position_amounts.entry(venue.clone()).or_insert(0.0) += amount;
            *s.position_counts.entry(venue.clone()).or_insert(0) += 1;
        }

        info!(
            buy_venue = %opportunity.buy_venue,
            sell_venue = %opportunity.sell_venue,
            amount,
            "arbitrage reservation recorded"
        );
    }

    /// Release counters once the arbitrage reaches a terminal state.
    pub fn record_arbitrage_complete(&self, opportunity: &ArbitrageOpportunity, amount: f64) {
        let mut s = self.state.write();

        for venue in [&opportunity.buy_venue, &opportunity.sell_venue] {
            let amt = s.position_amounts.entry(venue.clone()).or_insert(0.0);
            *amt = (*amt - amount).max(0.0);
            let count = s.position_counts.entry(venue.clone()).or_insert(0);
            *count = count.saturating_sub(1);
        }

        debug!(
            buy_venue = %opportunity.buy_venue,
            sell_venue = %opportunity.sell_venue,
            amount,
            "arbitrage reservation released"
        );
    }

    pub fn risk_report(&self) -> RiskReport {
        let s = self.state.read();
        let now = Utc::now().timestamp();
        RiskReport {
            position_amounts: s.position_amounts.clone(),
            position_counts: s.position_counts.clone(),
            total_exposure: s.position_amounts.values().sum(),
            arbitrage_count_hour: s.history.iter().filter(|t| **t > now - 3600).count(),
            arbitrage_count_day: s.history.iter().filter(|t| **t > now - 86_400).count(),
            last_arbitrage_ts: s.last_arbitrage_ts,
        }
    }
}

impl std::fmt::Debug for ArbitrageRiskGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.read();
        f.debug_struct("ArbitrageRiskGate")
            .field("total_exposure", &s.position_amounts.values().sum::<f64>())
            .field("history_len", &s.history.len())
            .finish()
    }
}
