// =============================================================================
// Opportunity Detector — cost model, depth checks, risk scoring, ranking
// =============================================================================
//
// For each spread above the minimum threshold the detector computes
//
//   gross  = (sell − buy) × amount / buy
//   fees   = amount × (buy_taker + sell_taker)
//   slip   = amount × (est_buy_slip + est_sell_slip)
//   buffer = amount × 0.001
//   net    = gross − fees − slip − buffer
//
// and drops anything failing the net-profit floor, the profit ratio, or the
// order-book depth floors. Survivors are sorted by net profit descending.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::runtime_config::{FeeRates, RuntimeConfig, ThresholdParams};
use crate::venue::registry::VenueRegistry;

use super::{ArbitrageOpportunity, SpreadData};

/// Safety buffer applied to every opportunity (0.1 % of amount).
const SAFETY_BUFFER_RATE: f64 = 0.001;
/// Order-book levels considered for the depth model.
const DEPTH_LEVELS: usize = 20;
/// Taker fee assumed for venues missing from the fee table (6 bp).
const DEFAULT_TAKER_FEE: f64 = 0.0006;

pub struct OpportunityDetector {
    registry: Arc<VenueRegistry>,
    thresholds: ThresholdParams,
    fees: HashMap<String, FeeRates>,
}

impl OpportunityDetector {
    pub fn new(registry: Arc<VenueRegistry>, config: &RuntimeConfig) -> Self {
        Self {
            registry,
            thresholds: config.thresholds.clone(),
            fees: config.fees.clone(),
        }
    }

    // -------------------------------------------------------------------------
    // Detection
    // -------------------------------------------------------------------------

    /// Detect opportunities from a round of spreads, fetching order-book
    /// depth from each involved venue.
    pub async fn detect_opportunities(
        &self,
        spreads: &[SpreadData],
        amount: f64,
    ) -> Vec<ArbitrageOpportunity> {
        // One depth fetch per venue per round, not per spread.
        let mut depths: HashMap<String, Option<f64>> = HashMap::new();
        for spread in spreads {
            if spread.spread_pct < self.thresholds.min_spread_threshold {
                continue;
            }
            for venue in [&spread.buy_venue, &spread.sell_venue] {
                if !depths.contains_key(venue.as_str()) {
                    let depth = self.orderbook_depth(venue, &spread.symbol).await;
                    depths.insert(venue.clone(), depth);
                }
            }
        }

        self.evaluate(spreads, amount, &depths)
    }

    /// Pure evaluation over pre-fetched depths. Split out so the cost model
    /// can be exercised without venue I/O.
    pub fn evaluate(
        &self,
        spreads: &[SpreadData],
        amount: f64,
        depths: &HashMap<String, Option<f64>>,
    ) -> Vec<ArbitrageOpportunity> {
        let mut opportunities: Vec<ArbitrageOpportunity> = spreads
            .iter()
            .filter(|s| s.spread_pct >= self.thresholds.min_spread_threshold)
            .map(|s| {
                let buy_depth = depths.get(&s.buy_venue).copied().flatten();
                let sell_depth = depths.get(&s.sell_venue).copied().flatten();
                self.build_opportunity(s, amount, buy_depth, sell_depth)
            })
            .filter(|o| {
                if o.net_profit < self.thresholds.min_net_profit_threshold {
                    return false;
                }
                let profit_ratio = if o.gross_profit > 0.0 {
                    o.net_profit / o.gross_profit
                } else {
                    0.0
                };
                if profit_ratio < self.thresholds.min_profit_ratio {
                    return false;
                }
                self.depth_sufficient(o, amount)
            })
            .collect();

        opportunities.sort_by(|a, b| b.net_profit.total_cmp(&a.net_profit));

        debug!(
            opportunities = opportunities.len(),
            spreads = spreads.len(),
            "opportunity detection complete"
        );

        opportunities
    }

    /// Enrich one spread with the full cost model.
    pub fn build_opportunity(
        &self,
        spread: &SpreadData,
        amount: f64,
        buy_depth: Option<f64>,
        sell_depth: Option<f64>,
    ) -> ArbitrageOpportunity {
        let buy_fee_rate = self.taker_fee(&spread.buy_venue);
        let sell_fee_rate = self.taker_fee(&spread.sell_venue);
        let buy_slippage = Self::estimate_slippage(amount);
        let sell_slippage = Self::estimate_slippage(amount);

        let gross_profit = (spread.sell_price - spread.buy_price) * amount / spread.buy_price;
        let fees = amount * (buy_fee_rate + sell_fee_rate);
        let slippage = amount * (buy_slippage + sell_slippage);
        let buffer = amount * SAFETY_BUFFER_RATE;
        let net_profit = gross_profit - fees - slippage - buffer;

        let risk_score = Self::risk_score(
            spread.spread_pct,
            buy_depth,
            sell_depth,
            buy_slippage,
            sell_slippage,
        );

        ArbitrageOpportunity {
            buy_venue: spread.buy_venue.clone(),
            sell_venue: spread.sell_venue.clone(),
            symbol: spread.symbol.clone(),
            buy_price: spread.buy_price,
            sell_price: spread.sell_price,
            spread_pct: spread.spread_pct,
            gross_profit,
            net_profit,
            buy_fee_rate,
            sell_fee_rate,
            est_buy_slippage: buy_slippage,
            est_sell_slippage: sell_slippage,
            ts_ms: spread.ts_ms,
            buy_depth_usd: buy_depth,
            sell_depth_usd: sell_depth,
            risk_score,
        }
    }

    // -------------------------------------------------------------------------
    // Cost model pieces
    // -------------------------------------------------------------------------

    fn taker_fee(&self, venue: &str) -> f64 {
        self.fees
            .get(&venue.to_lowercase())
            .map(|f| f.taker)
            .unwrap_or(DEFAULT_TAKER_FEE)
    }

    /// Slippage bucketed by trade size.
    pub fn estimate_slippage(amount: f64) -> f64 {
        if amount < 100.0 {
            0.0001
        } else if amount < 500.0 {
            0.0002
        } else if amount < 1000.0 {
            0.0003
        } else {
            0.0005
        }
    }

    /// Additive risk score in [0, 1]: tight spreads, thin books, and high
    /// total slippage each push the score up.
    pub fn risk_score(
        spread_pct: f64,
        buy_depth: Option<f64>,
        sell_depth: Option<f64>,
        buy_slippage: f64,
        sell_slippage: f64,
    ) -> f64 {
        let mut score: f64 = 0.0;

        if spread_pct < 0.5 {
            score += 0.3;
        } else if spread_pct < 1.0 {
            score += 0.2;
        } else {
            score += 0.1;
        }

        if matches!(buy_depth, Some(d) if d < 10_000.0) {
            score += 0.2;
        }
        if matches!(sell_depth, Some(d) if d < 10_000.0) {
            score += 0.2;
        }

        let total_slippage = buy_slippage + sell_slippage;
        if total_slippage > 0.001 {
            score += 0.2;
        } else if total_slippage > 0.0005 {
            score += 0.1;
        }

        score.min(1.0)
    }

    /// Both sides must clear the absolute floor and `amount × multiplier`.
    /// Sides with unknown depth are not penalised (the gate re-checks).
    fn depth_sufficient(&self, opportunity: &ArbitrageOpportunity, amount: f64) -> bool {
        let required = amount * self.thresholds.min_depth_multiplier;
        for depth in [opportunity.buy_depth_usd, opportunity.sell_depth_usd] {
            if let Some(d) = depth {
                if d < self.thresholds.min_orderbook_depth_usd || d < required {
                    return false;
                }
            }
        }
        true
    }

    /// min(bid-side, ask-side) cumulative quote value over the top levels.
    async fn orderbook_depth(&self, venue: &str, symbol: &str) -> Option<f64> {
        let adapter = match self.registry.get(venue).await {
            Ok(a) => a,
            Err(e) => {
                warn!(venue, error = %e, "depth fetch skipped, venue unavailable");
                return None;
            }
        };

        match adapter.get_orderbook(symbol, DEPTH_LEVELS).await {
            Ok(book) => {
                let bid_depth = book.bid_depth();
                let ask_depth = book.ask_depth();
                if bid_depth > 0.0 && ask_depth > 0.0 {
                    Some(bid_depth.min(ask_depth))
                } else {
                    None
                }
            }
            Err(e) => {
                debug!(venue, error = %e, "orderbook fetch failed");
                None
            }
        }
    }
}

impl std::fmt::Debug for OpportunityDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpportunityDetector")
            .field("thresholds", &self.thresholds)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::registry::VenueRegistry;

    fn detector() -> OpportunityDetector {
        let registry = Arc::new(VenueRegistry::with_adapters(Vec::new(), "bitget"));
        OpportunityDetector::new(registry, &RuntimeConfig::default())
    }

    fn spread(buy: f64, sell: f64) -> SpreadData {
        SpreadData {
            buy_venue: "bitget".into(),
            sell_venue: "okx".into(),
            symbol: "BTCUSDT".into(),
            buy_price: buy,
            sell_price: sell,
            spread_pct: (sell - buy) / buy * 100.0,
            ts_ms: 1,
        }
    }

    #[test]
    fn slippage_buckets() {
        assert_eq!(OpportunityDetector::estimate_slippage(50.0), 0.0001);
        assert_eq!(OpportunityDetector::estimate_slippage(100.0), 0.0002);
        assert_eq!(OpportunityDetector::estimate_slippage(499.0), 0.0002);
        assert_eq!(OpportunityDetector::estimate_slippage(500.0), 0.0003);
        assert_eq!(OpportunityDetector::estimate_slippage(2000.0), 0.0005);
    }

    #[test]
    fn cost_model_happy_path() {
        // X ask = 100.00, Y bid = 100.50, amount = 500: bitget (6 bp) +
        // okx (5 bp) taker, 3 bp slippage each leg, 10 bp buffer.
        let d = detector();
        let o = d.build_opportunity(&spread(100.0, 100.5), 500.0, Some(50_000.0), Some(50_000.0));

        assert!((o.gross_profit - 2.5).abs() < 1e-9);
        let expected_net = 2.5
            - 500.0 * (0.0006 + 0.0005)
            - 500.0 * (0.0003 + 0.0003)
            - 500.0 * 0.001;
        assert!((o.net_profit - expected_net).abs() < 1e-9);
        assert!(o.net_profit > 0.0);
        assert!(o.net_profit <= o.gross_profit);
    }

    #[test]
    fn net_never_exceeds_gross_and_risk_bounded() {
        let d = detector();
        for (buy, sell, amount) in [
            (100.0, 100.1, 50.0),
            (100.0, 101.0, 500.0),
            (100.0, 105.0, 5000.0),
            (100.0, 100.0, 100.0),
        ] {
            let o = d.build_opportunity(&spread(buy, sell), amount, Some(5_000.0), None);
            assert!(o.net_profit <= o.gross_profit);
            assert!((0.0..=1.0).contains(&o.risk_score));
        }
    }

    #[test]
    fn risk_score_components() {
        // Tight spread, thin books, moderate slippage.
        let score = OpportunityDetector::risk_score(
            0.4,
            Some(5_000.0),
            Some(5_000.0),
            0.0003,
            0.0003,
        );
        // 0.3 (spread) + 0.2 + 0.2 (depth) + 0.1 (slippage 6 bp) = 0.8
        assert!((score - 0.8).abs() < 1e-9);

        // Wide spread, deep books, negligible slippage.
        let score = OpportunityDetector::risk_score(
            1.5,
            Some(100_000.0),
            Some(100_000.0),
            0.0001,
            0.0001,
        );
        assert!((score - 0.1).abs() < 1e-9);

        // Worst case is capped at 1.0.
        let score = OpportunityDetector::risk_score(0.1, Some(1.0), Some(1.0), 0.01, 0.01);
        assert!((score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn filters_thin_spreads_and_unprofitable() {
        let d = detector();
        let depths = HashMap::from([
            ("bitget".to_string(), Some(50_000.0)),
            ("okx".to_string(), Some(50_000.0)),
        ]);

        // Below min_spread_threshold (0.3 %).
        let out = d.evaluate(&[spread(100.0, 100.1)], 500.0, &depths);
        assert!(out.is_empty());

        // Above spread threshold but net profit below 1.0 USDT.
        let out = d.evaluate(&[spread(100.0, 100.35)], 500.0, &depths);
        assert!(out.is_empty());

        // 0.5 % spread nets 1.15 on 2.5 gross: ratio 0.46 < 0.5 floor.
        let out = d.evaluate(&[spread(100.0, 100.5)], 500.0, &depths);
        assert!(out.is_empty());

        // A healthy spread clears every filter.
        let out = d.evaluate(&[spread(100.0, 100.8)], 500.0, &depths);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn depth_floors_reject() {
        let d = detector();

        // Absolute floor: 4 000 < 5 000.
        let shallow = HashMap::from([
            ("bitget".to_string(), Some(4_000.0)),
            ("okx".to_string(), Some(50_000.0)),
        ]);
        assert!(d.evaluate(&[spread(100.0, 100.5)], 500.0, &shallow).is_empty());

        // Multiplier floor: 10 000 amount × 3 > 20 000 depth.
        let mid = HashMap::from([
            ("bitget".to_string(), Some(20_000.0)),
            ("okx".to_string(), Some(20_000.0)),
        ]);
        assert!(d.evaluate(&[spread(100.0, 101.0)], 10_000.0, &mid).is_empty());
    }

    #[test]
    fn survivors_sorted_by_net_profit_desc() {
        let d = detector();
        let depths = HashMap::from([
            ("bitget".to_string(), Some(500_000.0)),
            ("okx".to_string(), Some(500_000.0)),
        ]);
        let spreads = vec![spread(100.0, 100.6), spread(100.0, 101.0), spread(100.0, 100.8)];
        let out = d.evaluate(&spreads, 500.0, &depths);
        assert_eq!(out.len(), 3);
        assert!(out[0].net_profit >= out[1].net_profit);
        assert!(out[1].net_profit >= out[2].net_profit);
        assert!((out[0].sell_price - 101.0).abs() < 1e-9);
    }
}
