// =============================================================================
// Execution Coordinator — atomic two-leg executor with rollback
// =============================================================================
//
// State machine:
//
//   PENDING -> EXECUTING_BUY -> EXECUTING_SELL -> COMPLETED
//                  |                  |
//                  v                  v
//               FAILED          ROLLING_BACK -> FAILED
//
// The buy leg fills first; only then is the sell leg submitted. If the sell
// leg fails while atomic mode is on, the actually-filled buy quantity is
// unwound with a market sell on the buy venue. The trade is marked FAILED
// regardless of the rollback outcome — rollback success is logged, never
// escalated.
//
// Per-leg fills are monitored by polling order status every 500 ms, bounded
// by the per-leg cap and the remaining share of the total cap. Cancelling
// the engine mid-leg does not cancel an in-flight order on the venue.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::runtime_config::ExecutionParams;
use crate::types::OrderSide;
use crate::venue::{registry::VenueRegistry, OrderResult, OrderStatus, OrderType, VenueAdapter};

use super::{ArbitrageOpportunity, ArbitrageTrade, TradeStatus};

/// Order-status poll cadence.
const MONITOR_INTERVAL: Duration = Duration::from_millis(500);
/// Fee estimate applied when the venue omits the fee (6 bp).
const FALLBACK_FEE_RATE: f64 = 0.0006;

pub struct ExecutionCoordinator {
    registry: Arc<VenueRegistry>,
    config: ExecutionParams,
}

impl ExecutionCoordinator {
    pub fn new(registry: Arc<VenueRegistry>, config: ExecutionParams) -> Self {
        info!(
            atomic = config.atomic_execution_enabled,
            max_time_per_leg_s = config.max_execution_time_per_leg,
            "execution coordinator initialised"
        );
        Self { registry, config }
    }

    // -------------------------------------------------------------------------
    // Entry point
    // -------------------------------------------------------------------------

    /// Execute one arbitrage: buy leg, then sell leg, with rollback on a
    /// sell-leg failure when atomic mode is enabled. Always returns a trade
    /// in a terminal state.
    pub async fn execute_arbitrage(
        &self,
        opportunity: &ArbitrageOpportunity,
        amount: f64,
    ) -> ArbitrageTrade {
        let mut trade = ArbitrageTrade::new(opportunity.clone(), amount);
        let deadline = Instant::now() + Duration::from_secs(self.config.max_total_execution_time);

        info!(
            buy_venue = %opportunity.buy_venue,
            sell_venue = %opportunity.sell_venue,
            amount,
            expected_pnl = opportunity.net_profit,
            "arbitrage execution started"
        );

        // ── Buy leg ──────────────────────────────────────────────────────
        trade.status = TradeStatus::ExecutingBuy;
        let buy_qty = amount / opportunity.buy_price;
        let (buy_ok, buy_order) = self
            .execute_leg(
                &opportunity.buy_venue,
                &opportunity.symbol,
                OrderSide::Buy,
                buy_qty,
                deadline,
            )
            .await;
        trade.buy_order = buy_order;
        trade.buy_executed_at = Some(Utc::now());

        if !buy_ok {
            let reason = Self::leg_error(&trade.buy_order);
            trade.status = TradeStatus::Failed;
            trade.failure_reason = Some(format!("buy leg failed: {reason}"));
            trade.completed_at = Some(Utc::now());
            trade.calculate_execution_time();
            error!(reason = %reason, "arbitrage failed on buy leg");
            return trade;
        }

        info!(
            venue = %opportunity.buy_venue,
            order_id = trade.buy_order.as_ref().and_then(|o| o.order_id.as_deref()),
            "buy leg filled"
        );

        // ── Sell leg ─────────────────────────────────────────────────────
        trade.status = TradeStatus::ExecutingSell;
        let sell_qty = amount / opportunity.sell_price;
        let (sell_ok, sell_order) = self
            .execute_leg(
                &opportunity.sell_venue,
                &opportunity.symbol,
                OrderSide::Sell,
                sell_qty,
                deadline,
            )
            .await;
        trade.sell_order = sell_order;
        trade.sell_executed_at = Some(Utc::now());

        if !sell_ok {
            let reason = Self::leg_error(&trade.sell_order);

            if self.config.atomic_execution_enabled {
                trade.status = TradeStatus::RollingBack;
                warn!(reason = %reason, "sell leg failed, rolling back buy position");
                self.rollback_buy_position(opportunity, trade.buy_order.as_ref(), amount)
                    .await;
            }

            trade.status = TradeStatus::Failed;
            trade.failure_reason = Some(format!("sell leg failed: {reason}"));
            trade.completed_at = Some(Utc::now());
            trade.calculate_execution_time();
            error!(reason = %reason, "arbitrage failed on sell leg");
            return trade;
        }

        info!(
            venue = %opportunity.sell_venue,
            order_id = trade.sell_order.as_ref().and_then(|o| o.order_id.as_deref()),
            "sell leg filled"
        );

        // ── Completed ────────────────────────────────────────────────────
        trade.status = TradeStatus::Completed;
        trade.actual_pnl = Some(Self::calculate_actual_pnl(
            trade.buy_order.as_ref().expect("buy leg succeeded"),
            trade.sell_order.as_ref().expect("sell leg succeeded"),
        ));
        trade.completed_at = Some(Utc::now());
        trade.calculate_execution_time();

        info!(
            actual_pnl = trade.actual_pnl,
            total_time_s = trade.total_execution_time,
            "arbitrage completed"
        );

        trade
    }

    // -------------------------------------------------------------------------
    // Legs
    // -------------------------------------------------------------------------

    /// Submit a market order and monitor it to a fill, failure, or timeout.
    async fn execute_leg(
        &self,
        venue: &str,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        deadline: Instant,
    ) -> (bool, Option<OrderResult>) {
        let adapter = match self.registry.get(venue).await {
            Ok(a) => a,
            Err(e) => return (false, Some(OrderResult::failed(e.to_string()))),
        };

        debug!(venue, symbol, side = %side, qty, "submitting market order");

        let placed = match adapter
            .place_order(symbol, side, qty, OrderType::Market, None)
            .await
        {
            Ok(result) => result,
            Err(e) => return (false, Some(OrderResult::failed(e.to_string()))),
        };

        if !placed.success {
            return (false, Some(placed));
        }

        // Some venues report the fill synchronously on placement.
        if placed.has_fill() {
            return (true, Some(placed));
        }

        let order_id = match placed.order_id.clone() {
            Some(id) => id,
            None => {
                return (
                    false,
                    Some(OrderResult::failed("venue returned no order id")),
                )
            }
        };

        match self
            .monitor_order(adapter.as_ref(), &order_id, symbol, deadline)
            .await
        {
            Some(result) if result.has_fill() => (true, Some(result)),
            Some(result) => (false, Some(result)),
            None => (
                false,
                Some(OrderResult::failed(format!(
                    "order {order_id} monitoring timed out"
                ))),
            ),
        }
    }

    /// Poll order status every 500 ms until a fill, a terminal failure, or
    /// the leg/total timeout.
    async fn monitor_order(
        &self,
        adapter: &dyn VenueAdapter,
        order_id: &str,
        symbol: &str,
        total_deadline: Instant,
    ) -> Option<OrderResult> {
        let leg_deadline =
            Instant::now() + Duration::from_secs(self.config.max_execution_time_per_leg);
        let deadline = leg_deadline.min(total_deadline);

        while Instant::now() < deadline {
            match adapter.get_order_status(order_id, symbol).await {
                Ok(status) => {
                    if status.has_fill() {
                        debug!(order_id, "order filled");
                        return Some(status);
                    }
                    if status.error.is_some() || status.status == Some(OrderStatus::Canceled) {
                        error!(order_id, error = ?status.error, "order reached failure state");
                        return Some(status);
                    }
                }
                Err(e) => {
                    // Status polls tolerate transient errors until timeout.
                    warn!(order_id, error = %e, "order status poll failed");
                }
            }
            tokio::time::sleep(MONITOR_INTERVAL).await;
        }

        error!(order_id, "order monitoring timed out");
        None
    }

    // -------------------------------------------------------------------------
    // Rollback
    // -------------------------------------------------------------------------

    /// Unwind a filled buy leg with a market sell of the actually-filled
    /// quantity. Failure is logged but never escalates.
    async fn rollback_buy_position(
        &self,
        opportunity: &ArbitrageOpportunity,
        buy_order: Option<&OrderResult>,
        amount: f64,
    ) {
        let Some(buy_order) = buy_order else {
            warn!("rollback skipped: no buy order recorded");
            return;
        };

        let qty = buy_order.filled_qty.unwrap_or_else(|| {
            amount / buy_order.avg_price.unwrap_or(opportunity.buy_price)
        });

        let adapter = match self.registry.get(&opportunity.buy_venue).await {
            Ok(a) => a,
            Err(e) => {
                error!(venue = %opportunity.buy_venue, error = %e, "rollback failed: venue unavailable");
                return;
            }
        };

        warn!(
            venue = %opportunity.buy_venue,
            symbol = %opportunity.symbol,
            qty,
            "rolling back buy position"
        );

        match adapter
            .place_order(
                &opportunity.symbol,
                OrderSide::Sell,
                qty,
                OrderType::Market,
                None,
            )
            .await
        {
            Ok(result) if result.success => {
                info!(order_id = result.order_id.as_deref(), "rollback order placed");
            }
            Ok(result) => {
                error!(error = ?result.error, "rollback order rejected");
            }
            Err(e) => {
                error!(error = %e, "rollback order failed");
            }
        }
    }

    // -------------------------------------------------------------------------
    // PnL
    // -------------------------------------------------------------------------

    /// Realised PnL from reported fills; missing fees are estimated at 6 bp.
    fn calculate_actual_pnl(buy_order: &OrderResult, sell_order: &OrderResult) -> f64 {
        let buy_cost =
            buy_order.avg_price.unwrap_or(0.0) * buy_order.filled_qty.unwrap_or(0.0);
        let sell_revenue =
            sell_order.avg_price.unwrap_or(0.0) * sell_order.filled_qty.unwrap_or(0.0);

        let buy_fee = buy_order.fee.unwrap_or(buy_cost * FALLBACK_FEE_RATE);
        let sell_fee = sell_order.fee.unwrap_or(sell_revenue * FALLBACK_FEE_RATE);

        let pnl = sell_revenue - buy_cost - buy_fee - sell_fee;

        debug!(buy_cost, sell_revenue, fees = buy_fee + sell_fee, pnl, "realised pnl computed");
        pnl
    }

    fn leg_error(order: &Option<OrderResult>) -> String {
        order
            .as_ref()
            .and_then(|o| o.error.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

impl std::fmt::Debug for ExecutionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionCoordinator")
            .field("config", &self.config)
            .finish()
    }
}
