// =============================================================================
// Venue abstraction — uniform contract over heterogeneous exchanges
// =============================================================================
//
// Every exchange the engine talks to is wrapped in a `VenueAdapter`. The
// adapter translates the uniform contract (ticker, orderbook, balance,
// orders) into venue-specific REST calls and quirks (product type tags,
// hedge-mode position sides, one-click-close endpoints).
//
// Error policy:
//   - Network / RateLimit errors retry with exponential backoff (1s base,
//     doubling, 3 attempts).
//   - Authentication errors are never retried and surface immediately.
//   - InsufficientBalance / Order errors fail the current leg; the caller
//     decides whether to roll back.
// =============================================================================

pub mod binance;
pub mod bitget;
pub mod okx;
pub mod registry;
#[cfg(test)]
pub mod testkit;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::types::OrderSide;

// ---------------------------------------------------------------------------
// Error kinds
// ---------------------------------------------------------------------------

/// Classified venue errors. The kind drives retry and rollback decisions at
/// call sites, so it must survive all the way up to the executor.
#[derive(Debug, Error)]
pub enum VenueError {
    #[error("network error: {0}")]
    Network(String),

    #[error("authentication error: {0}")]
    Authentication(String),

    #[error("rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("order error: {0}")]
    Order(String),

    #[error("exchange error: {0}")]
    Exchange(String),
}

impl VenueError {
    /// Whether this error class is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::RateLimit(_))
    }

    /// Map a reqwest transport failure into a venue error kind.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::Network(err.to_string())
        } else {
            Self::Exchange(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Best-bid/ask snapshot for one symbol on one venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerData {
    pub symbol: String,
    pub last: f64,
    pub bid: f64,
    pub ask: f64,
    #[serde(default)]
    pub volume: f64,
    /// Exchange timestamp in milliseconds.
    pub ts_ms: i64,
}

/// One price level of an order book.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub qty: f64,
}

/// Order book snapshot, best levels first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl OrderBook {
    /// Cumulative quote-currency value on the bid side.
    pub fn bid_depth(&self) -> f64 {
        self.bids.iter().map(|l| l.price * l.qty).sum()
    }

    /// Cumulative quote-currency value on the ask side.
    pub fn ask_depth(&self) -> f64 {
        self.asks.iter().map(|l| l.price * l.qty).sum()
    }
}

/// One OHLCV candle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Kline {
    pub ts_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Order lifecycle status as reported by the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Closed,
    Canceled,
}

/// Result of any venue call touching an order. Produced by both
/// `place_order` and `get_order_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub avg_price: Option<f64>,
    pub filled_qty: Option<f64>,
    pub fee: Option<f64>,
    pub status: Option<OrderStatus>,
    pub error: Option<String>,
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl OrderResult {
    /// A failed result carrying only an error message.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            avg_price: None,
            filled_qty: None,
            fee: None,
            status: None,
            error: Some(error.into()),
            raw: serde_json::Value::Null,
        }
    }

    /// Whether the venue reports any filled quantity.
    pub fn has_fill(&self) -> bool {
        self.filled_qty.map(|q| q > 0.0).unwrap_or(false)
    }
}

/// Position as reported by a venue (perpetual venues report side + leverage).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuePositionData {
    pub symbol: String,
    /// "long" or "short".
    pub side: String,
    pub qty: f64,
    pub entry_price: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub leverage: u32,
    #[serde(default)]
    pub margin_mode: String,
}

/// Order type accepted by `place_order`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "market"),
            Self::Limit => write!(f, "limit"),
        }
    }
}

// ---------------------------------------------------------------------------
// Adapter contract
// ---------------------------------------------------------------------------

/// Uniform operations against one exchange.
///
/// Implementations must be safe to share across tasks (`Send + Sync`); the
/// underlying HTTP clients are assumed thread-safe. Adapters holding
/// non-re-entrant connection state must serialise calls internally.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    /// Stable lowercase venue name ("bitget", "binance", "okx").
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<(), VenueError>;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    async fn get_ticker(&self, symbol: &str) -> Result<TickerData, VenueError>;

    async fn get_orderbook(&self, symbol: &str, depth: usize) -> Result<OrderBook, VenueError>;

    async fn get_klines(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Kline>, VenueError>;

    /// Free quote-currency (USDT) balance.
    async fn get_balance(&self) -> Result<f64, VenueError>;

    async fn get_positions(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<VenuePositionData>, VenueError>;

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        order_type: OrderType,
        price: Option<f64>,
    ) -> Result<OrderResult, VenueError>;

    async fn get_order_status(
        &self,
        order_id: &str,
        symbol: &str,
    ) -> Result<OrderResult, VenueError>;

    /// Open a long position sized in base units (market order).
    async fn open_long(&self, symbol: &str, qty: f64) -> Result<OrderResult, VenueError> {
        self.place_order(symbol, OrderSide::Buy, qty, OrderType::Market, None)
            .await
    }

    /// Open a short position sized in base units (market order).
    async fn open_short(&self, symbol: &str, qty: f64) -> Result<OrderResult, VenueError> {
        self.place_order(symbol, OrderSide::Sell, qty, OrderType::Market, None)
            .await
    }

    /// Close an open position on the given side.
    async fn close_position(&self, symbol: &str, side: OrderSide)
        -> Result<OrderResult, VenueError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), VenueError>;

    /// `mode` is venue-specific ("crossed" / "isolated" / "cross").
    async fn set_margin_mode(&self, symbol: &str, mode: &str) -> Result<(), VenueError>;
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Maximum attempts for retryable venue calls.
const MAX_ATTEMPTS: u32 = 3;
/// First backoff delay; doubles per attempt.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Run `op` up to three times with exponential backoff. Only errors whose
/// kind is retryable (network, rate limit) are retried; authentication and
/// order errors surface immediately.
pub async fn retry_with_backoff<T, F, Fut>(op_name: &str, mut op: F) -> Result<T, VenueError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, VenueError>>,
{
    let mut delay = BACKOFF_BASE;
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < MAX_ATTEMPTS && e.is_retryable() => {
                warn!(
                    op = op_name,
                    attempt,
                    max_attempts = MAX_ATTEMPTS,
                    delay_s = delay.as_secs_f64(),
                    error = %e,
                    "venue call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Parse a JSON value that may be either a string or a number into `f64`.
/// Venue REST APIs are inconsistent about numeric encoding.
pub(crate) fn parse_str_f64(val: &serde_json::Value) -> f64 {
    if let Some(s) = val.as_str() {
        s.parse::<f64>().unwrap_or(0.0)
    } else {
        val.as_f64().unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn error_retryability() {
        assert!(VenueError::Network("conn reset".into()).is_retryable());
        assert!(VenueError::RateLimit("429".into()).is_retryable());
        assert!(!VenueError::Authentication("bad key".into()).is_retryable());
        assert!(!VenueError::Order("rejected".into()).is_retryable());
        assert!(!VenueError::InsufficientBalance("0.0".into()).is_retryable());
    }

    #[test]
    fn orderbook_depth_sums_quote_value() {
        let book = OrderBook {
            bids: vec![
                BookLevel { price: 100.0, qty: 2.0 },
                BookLevel { price: 99.0, qty: 1.0 },
            ],
            asks: vec![BookLevel { price: 101.0, qty: 3.0 }],
        };
        assert!((book.bid_depth() - 299.0).abs() < 1e-9);
        assert!((book.ask_depth() - 303.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_retries_network_errors() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff("test_op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(VenueError::Network("flaky".into()))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_never_retries_authentication() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff("test_op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(VenueError::Authentication("bad key".into())) }
        })
        .await;
        assert!(matches!(result, Err(VenueError::Authentication(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_three_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff("test_op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(VenueError::Network("down".into())) }
        })
        .await;
        assert!(matches!(result, Err(VenueError::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn parse_str_f64_accepts_both_encodings() {
        assert_eq!(parse_str_f64(&serde_json::json!("1.5")), 1.5);
        assert_eq!(parse_str_f64(&serde_json::json!(2.5)), 2.5);
        assert_eq!(parse_str_f64(&serde_json::json!(null)), 0.0);
    }
}
