// =============================================================================
// Test venue — scriptable in-memory adapter used across unit tests
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::types::OrderSide;

use super::{
    BookLevel, Kline, OrderBook, OrderResult, OrderStatus, OrderType, TickerData, VenueAdapter,
    VenueError, VenuePositionData,
};

/// Everything a test recorded about one placed order.
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub symbol: String,
    pub side: OrderSide,
    pub qty: f64,
    pub order_type: OrderType,
}

/// Scriptable venue: tests set prices, balances, and failure switches, then
/// inspect the orders the engine placed.
pub struct MockVenue {
    name: String,
    connected: AtomicBool,
    order_seq: AtomicU64,

    pub bid: Mutex<f64>,
    pub ask: Mutex<f64>,
    /// Quote value spread evenly over 20 book levels per side.
    pub depth_usd: Mutex<f64>,
    pub balance: Mutex<f64>,

    /// When set, `place_order` returns an unsuccessful result for this side.
    pub reject_side: Mutex<Option<OrderSide>>,
    /// When set, `place_order` returns this error for every order.
    pub order_error: Mutex<Option<String>>,
    /// When true, orders never fill and status polls report them open.
    pub never_fill: Mutex<bool>,
    /// Price improvement applied to fills: buys fill below the ask, sells
    /// above the bid. Lets tests realise a positive PnL.
    pub fill_improvement: Mutex<f64>,

    pub placed_orders: Mutex<Vec<PlacedOrder>>,
}

impl MockVenue {
    pub fn new(name: &str, bid: f64, ask: f64) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            connected: AtomicBool::new(true),
            order_seq: AtomicU64::new(0),
            bid: Mutex::new(bid),
            ask: Mutex::new(ask),
            depth_usd: Mutex::new(50_000.0),
            balance: Mutex::new(10_000.0),
            reject_side: Mutex::new(None),
            order_error: Mutex::new(None),
            never_fill: Mutex::new(false),
            fill_improvement: Mutex::new(0.0),
            placed_orders: Mutex::new(Vec::new()),
        })
    }

    pub fn orders(&self) -> Vec<PlacedOrder> {
        self.placed_orders.lock().clone()
    }

    fn fill_price(&self, side: OrderSide) -> f64 {
        let improvement = *self.fill_improvement.lock();
        match side {
            OrderSide::Buy => *self.ask.lock() - improvement,
            OrderSide::Sell => *self.bid.lock() + improvement,
        }
    }
}

#[async_trait]
impl VenueAdapter for MockVenue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), VenueError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get_ticker(&self, symbol: &str) -> Result<TickerData, VenueError> {
        let bid = *self.bid.lock();
        let ask = *self.ask.lock();
        Ok(TickerData {
            symbol: symbol.to_string(),
            last: (bid + ask) / 2.0,
            bid,
            ask,
            volume: 1_000.0,
            ts_ms: chrono::Utc::now().timestamp_millis(),
        })
    }

    async fn get_orderbook(&self, _symbol: &str, depth: usize) -> Result<OrderBook, VenueError> {
        let levels = depth.clamp(1, 20);
        let per_level = *self.depth_usd.lock() / levels as f64;
        let bid = *self.bid.lock();
        let ask = *self.ask.lock();

        let build = |price: f64| -> Vec<BookLevel> {
            (0..levels)
                .map(|_| BookLevel {
                    price,
                    qty: per_level / price,
                })
                .collect()
        };

        Ok(OrderBook {
            bids: build(bid),
            asks: build(ask),
        })
    }

    async fn get_klines(
        &self,
        _symbol: &str,
        _timeframe: &str,
        _limit: usize,
    ) -> Result<Vec<Kline>, VenueError> {
        Ok(Vec::new())
    }

    async fn get_balance(&self) -> Result<f64, VenueError> {
        Ok(*self.balance.lock())
    }

    async fn get_positions(
        &self,
        _symbol: Option<&str>,
    ) -> Result<Vec<VenuePositionData>, VenueError> {
        Ok(Vec::new())
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        order_type: OrderType,
        _price: Option<f64>,
    ) -> Result<OrderResult, VenueError> {
        self.placed_orders.lock().push(PlacedOrder {
            symbol: symbol.to_string(),
            side,
            qty,
            order_type,
        });

        if let Some(msg) = self.order_error.lock().clone() {
            return Err(VenueError::Order(msg));
        }
        if *self.reject_side.lock() == Some(side) {
            return Ok(OrderResult::failed(format!(
                "{}: {side} order rejected",
                self.name
            )));
        }

        let id = self.order_seq.fetch_add(1, Ordering::SeqCst);
        if *self.never_fill.lock() {
            return Ok(OrderResult {
                success: true,
                order_id: Some(format!("{}-{id}", self.name)),
                avg_price: None,
                filled_qty: None,
                fee: None,
                status: Some(OrderStatus::Open),
                error: None,
                raw: serde_json::Value::Null,
            });
        }

        let price = self.fill_price(side);
        Ok(OrderResult {
            success: true,
            order_id: Some(format!("{}-{id}", self.name)),
            avg_price: Some(price),
            filled_qty: Some(qty),
            fee: None,
            status: Some(OrderStatus::Closed),
            error: None,
            raw: serde_json::Value::Null,
        })
    }

    async fn get_order_status(
        &self,
        order_id: &str,
        _symbol: &str,
    ) -> Result<OrderResult, VenueError> {
        if *self.never_fill.lock() {
            return Ok(OrderResult {
                success: true,
                order_id: Some(order_id.to_string()),
                avg_price: None,
                filled_qty: None,
                fee: None,
                status: Some(OrderStatus::Open),
                error: None,
                raw: serde_json::Value::Null,
            });
        }
        Ok(OrderResult {
            success: true,
            order_id: Some(order_id.to_string()),
            avg_price: Some(*self.ask.lock()),
            filled_qty: Some(1.0),
            fee: None,
            status: Some(OrderStatus::Closed),
            error: None,
            raw: serde_json::Value::Null,
        })
    }

    async fn close_position(
        &self,
        symbol: &str,
        side: OrderSide,
    ) -> Result<OrderResult, VenueError> {
        self.place_order(symbol, side.opposite(), 1.0, OrderType::Market, None)
            .await
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<(), VenueError> {
        Ok(())
    }

    async fn set_margin_mode(&self, _symbol: &str, _mode: &str) -> Result<(), VenueError> {
        Ok(())
    }
}

impl std::fmt::Debug for MockVenue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockVenue").field("name", &self.name).finish()
    }
}
