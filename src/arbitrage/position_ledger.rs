// =============================================================================
// Position Ledger — per-venue position tally with history and reconciliation
// =============================================================================
//
// Keeps `{venue -> {symbol -> qty}}` where buys add and sells subtract, plus
// an append-only trail of every mutation. Reconciliation compares the
// tracked quantity with what the venue reports and RETURNS the drift —
// corrections are a human decision, never automatic.
//
// Mutations serialise through the write lock; reads take snapshots.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::types::OrderSide;
use crate::venue::registry::VenueRegistry;

/// One ledger mutation, recorded in order.
#[derive(Debug, Clone, Serialize)]
pub struct PositionMutation {
    pub timestamp: DateTime<Utc>,
    pub venue: String,
    pub symbol: String,
    /// Signed change: positive for buys, negative for sells.
    pub quantity_change: f64,
    pub side: OrderSide,
    /// Position after applying this mutation.
    pub new_position: f64,
}

/// Tracked-vs-reported comparison for one venue entry.
#[derive(Debug, Clone, Serialize)]
pub struct DriftEntry {
    pub venue: String,
    pub symbol: String,
    pub tracked: f64,
    pub reported: f64,
    pub drift: f64,
}

pub struct PositionLedger {
    registry: Arc<VenueRegistry>,
    positions: RwLock<HashMap<String, HashMap<String, f64>>>,
    history: RwLock<Vec<PositionMutation>>,
}

impl PositionLedger {
    pub fn new(registry: Arc<VenueRegistry>) -> Self {
        Self {
            registry,
            positions: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Mutation
    // -------------------------------------------------------------------------

    /// Apply a fill: buys add `quantity`, sells subtract it.
    pub fn update(&self, venue: &str, symbol: &str, quantity: f64, side: OrderSide) {
        let signed = match side {
            OrderSide::Buy => quantity,
            OrderSide::Sell => -quantity,
        };

        let new_position = {
            let mut positions = self.positions.write();
            let entry = positions
                .entry(venue.to_string())
                .or_default()
                .entry(symbol.to_string())
                .or_insert(0.0);
            *entry += signed;
            *entry
        };

        self.history.write().push(PositionMutation {
            timestamp: Utc::now(),
            venue: venue.to_string(),
            symbol: symbol.to_string(),
            quantity_change: signed,
            side,
            new_position,
        });

        debug!(
            venue,
            symbol,
            side = %side,
            quantity,
            new_position,
            "ledger position updated"
        );
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get_position(&self, venue: &str, symbol: &str) -> f64 {
        self.positions
            .read()
            .get(venue)
            .and_then(|by_symbol| by_symbol.get(symbol))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn all_positions(&self) -> HashMap<String, HashMap<String, f64>> {
        self.positions.read().clone()
    }

    /// Net quantity per symbol summed across venues.
    pub fn net_exposure(&self, symbol: Option<&str>) -> HashMap<String, f64> {
        let positions = self.positions.read();
        let mut net: HashMap<String, f64> = HashMap::new();

        for by_symbol in positions.values() {
            for (sym, qty) in by_symbol {
                if symbol.map(|s| s == sym).unwrap_or(true) {
                    *net.entry(sym.clone()).or_insert(0.0) += qty;
                }
            }
        }

        net
    }

    /// Most recent `limit` mutations (all when `None`).
    pub fn mutation_history(&self, limit: Option<usize>) -> Vec<PositionMutation> {
        let history = self.history.read();
        match limit {
            Some(n) => history.iter().rev().take(n).rev().cloned().collect(),
            None => history.clone(),
        }
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    /// Compare tracked positions against venue-reported quote balances and
    /// report the drift per entry. Nothing is corrected here.
    pub async fn reconcile(&self) -> Vec<DriftEntry> {
        let snapshot = self.all_positions();
        let mut drifts = Vec::new();

        for (venue, by_symbol) in snapshot {
            let adapter = match self.registry.get(&venue).await {
                Ok(a) => a,
                Err(e) => {
                    error!(venue = %venue, error = %e, "reconciliation skipped, venue unavailable");
                    continue;
                }
            };
            let reported = match adapter.get_balance().await {
                Ok(b) => b,
                Err(e) => {
                    error!(venue = %venue, error = %e, "reconciliation balance fetch failed");
                    continue;
                }
            };

            for (symbol, tracked) in by_symbol {
                let drift = reported - tracked;
                if drift.abs() > f64::EPSILON {
                    info!(
                        venue = %venue,
                        symbol = %symbol,
                        tracked,
                        reported,
                        drift,
                        "ledger drift detected (not auto-corrected)"
                    );
                }
                drifts.push(DriftEntry {
                    venue: venue.clone(),
                    symbol,
                    tracked,
                    reported,
                    drift,
                });
            }
        }

        drifts
    }

    /// Drop every tracked position and the history trail.
    pub fn clear(&self) {
        self.positions.write().clear();
        self.history.write().clear();
        info!("position ledger cleared");
    }
}

impl std::fmt::Debug for PositionLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let positions = self.positions.read();
        f.debug_struct("PositionLedger")
            .field("venues", &positions.len())
            .field("mutations", &self.history.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> PositionLedger {
        let registry = Arc::new(VenueRegistry::with_adapters(Vec::new(), "bitget"));
        PositionLedger::new(registry)
    }

    #[test]
    fn buys_add_and_sells_subtract() {
        let ledger = ledger();
        ledger.update("bitget", "BTCUSDT", 5.0, OrderSide::Buy);
        ledger.update("okx", "BTCUSDT", 5.0, OrderSide::Sell);

        assert_eq!(ledger.get_position("bitget", "BTCUSDT"), 5.0);
        assert_eq!(ledger.get_position("okx", "BTCUSDT"), -5.0);
        assert_eq!(ledger.get_position("binance", "BTCUSDT"), 0.0);
    }

    #[test]
    fn net_exposure_sums_across_venues() {
        let ledger = ledger();
        ledger.update("bitget", "BTCUSDT", 5.0, OrderSide::Buy);
        ledger.update("okx", "BTCUSDT", 5.0, OrderSide::Sell);
        ledger.update("bitget", "ETHUSDT", 2.0, OrderSide::Buy);

        let net = ledger.net_exposure(None);
        assert!(net["BTCUSDT"].abs() < 1e-9);
        assert_eq!(net["ETHUSDT"], 2.0);

        let btc_only = ledger.net_exposure(Some("BTCUSDT"));
        assert_eq!(btc_only.len(), 1);
    }

    #[test]
    fn history_records_signed_changes_in_order() {
        let ledger = ledger();
        ledger.update("bitget", "BTCUSDT", 3.0, OrderSide::Buy);
        ledger.update("bitget", "BTCUSDT", 1.0, OrderSide::Sell);

        let history = ledger.mutation_history(None);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].quantity_change, 3.0);
        assert_eq!(history[0].new_position, 3.0);
        assert_eq!(history[1].quantity_change, -1.0);
        assert_eq!(history[1].new_position, 2.0);

        let last = ledger.mutation_history(Some(1));
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].new_position, 2.0);
    }

    #[test]
    fn clear_resets_everything() {
        let ledger = ledger();
        ledger.update("bitget", "BTCUSDT", 3.0, OrderSide::Buy);
        ledger.clear();
        assert_eq!(ledger.get_position("bitget", "BTCUSDT"), 0.0);
        assert!(ledger.mutation_history(None).is_empty());
    }
}
