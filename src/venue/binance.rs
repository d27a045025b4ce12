// =============================================================================
// Binance venue adapter — HMAC-SHA256 signed REST
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the bot and Binance servers.
//
// Binance is the spot leg of the platform: get_positions reports no
// perpetual positions and leverage/margin-mode calls are accepted as no-ops.
// =============================================================================

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::types::OrderSide;

use super::{
    parse_str_f64, retry_with_backoff, Kline, OrderBook, OrderResult, OrderStatus, OrderType,
    TickerData, VenueAdapter, VenueError, VenuePositionData,
};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Binance REST adapter with HMAC-SHA256 request signing.
pub struct BinanceAdapter {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    connected: RwLock<bool>,
}

impl BinanceAdapter {
    /// Create a new adapter. Credentials may be empty for public-data use;
    /// signed endpoints will then fail with an authentication error.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key,
            secret,
            base_url: "https://api.binance.com".to_string(),
            client,
            connected: RwLock::new(false),
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Error classification
    // -------------------------------------------------------------------------

    /// Map an HTTP status + body into the uniform error kinds.
    fn classify_error(status: reqwest::StatusCode, body: &serde_json::Value) -> VenueError {
        let code = body.get("code").and_then(|v| v.as_i64()).unwrap_or(0);
        let msg = body
            .get("msg")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
            || code == -2014
            || code == -2015
        {
            VenueError::Authentication(format!("binance: {msg} (code {code})"))
        } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status.as_u16() == 418
            || code == -1003
        {
            VenueError::RateLimit(format!("binance: {msg} (code {code})"))
        } else if code == -2010 && msg.to_lowercase().contains("insufficient") {
            VenueError::InsufficientBalance(format!("binance: {msg}"))
        } else if code == -2010 || code == -2011 || code == -2013 {
            VenueError::Order(format!("binance: {msg} (code {code})"))
        } else {
            VenueError::Exchange(format!("binance: HTTP {status}: {msg} (code {code})"))
        }
    }

    /// Send a GET and parse the JSON body, classifying failures.
    async fn get_json(&self, url: &str) -> Result<serde_json::Value, VenueError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(VenueError::from_transport)?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| VenueError::Exchange(format!("binance: bad JSON: {e}")))?;
        if !status.is_success() {
            return Err(Self::classify_error(status, &body));
        }
        Ok(body)
    }

    fn map_status(raw: &str) -> OrderStatus {
        match raw {
            "FILLED" => OrderStatus::Closed,
            "CANCELED" | "REJECTED" | "EXPIRED" => OrderStatus::Canceled,
            _ => OrderStatus::Open,
        }
    }

    /// Build an `OrderResult` from an order placement / status response.
    fn order_result_from(body: serde_json::Value) -> OrderResult {
        let executed_qty = parse_str_f64(&body["executedQty"]);
        let quote_qty = parse_str_f64(&body["cummulativeQuoteQty"]);
        let avg_price = if executed_qty > 0.0 {
            Some(quote_qty / executed_qty)
        } else {
            None
        };
        let status = body["status"].as_str().map(Self::map_status);
        // Fills carry per-fill commission when returned with FULL response type.
        let fee = body["fills"].as_array().map(|fills| {
            fills
                .iter()
                .map(|f| parse_str_f64(&f["commission"]))
                .sum::<f64>()
        });

        OrderResult {
            success: true,
            order_id: body["orderId"].as_u64().map(|id| id.to_string()),
            avg_price,
            filled_qty: if executed_qty > 0.0 {
                Some(executed_qty)
            } else {
                None
            },
            fee: fee.filter(|f| *f > 0.0),
            status,
            error: None,
            raw: body,
        }
    }
}

#[async_trait]
impl VenueAdapter for BinanceAdapter {
    fn name(&self) -> &str {
        "binance"
    }

    async fn connect(&self) -> Result<(), VenueError> {
        let url = format!("{}/api/v3/ping", self.base_url);
        retry_with_backoff("binance::ping", || self.get_json(&url)).await?;
        *self.connected.write() = true;
        debug!("binance adapter connected");
        Ok(())
    }

    async fn disconnect(&self) {
        *self.connected.write() = false;
        debug!("binance adapter disconnected");
    }

    fn is_connected(&self) -> bool {
        *self.connected.read()
    }

    async fn get_ticker(&self, symbol: &str) -> Result<TickerData, VenueError> {
        let url = format!("{}/api/v3/ticker/24hr?symbol={}", self.base_url, symbol);
        let body = retry_with_backoff("binance::get_ticker", || self.get_json(&url)).await?;

        Ok(TickerData {
            symbol: symbol.to_string(),
            last: parse_str_f64(&body["lastPrice"]),
            bid: parse_str_f64(&body["bidPrice"]),
            ask: parse_str_f64(&body["askPrice"]),
            volume: parse_str_f64(&body["volume"]),
            ts_ms: body["closeTime"].as_i64().unwrap_or(0),
        })
    }

    async fn get_orderbook(&self, symbol: &str, depth: usize) -> Result<OrderBook, VenueError> {
        let url = format!(
            "{}/api/v3/depth?symbol={}&limit={}",
            self.base_url, symbol, depth
        );
        let body = retry_with_backoff("binance::get_orderbook", || self.get_json(&url)).await?;

        let parse_side = |side: &serde_json::Value| -> Vec<super::BookLevel> {
            side.as_array()
                .map(|levels| {
                    levels
                        .iter()
                        .filter_map(|l| l.as_array())
                        .filter(|l| l.len() >= 2)
                        .map(|l| super::BookLevel {
                            price: parse_str_f64(&l[0]),
                            qty: parse_str_f64(&l[1]),
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(OrderBook {
            bids: parse_side(&body["bids"]),
            asks: parse_side(&body["asks"]),
        })
    }

    async fn get_klines(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Kline>, VenueError> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, timeframe, limit
        );
        let body = retry_with_backoff("binance::get_klines", || self.get_json(&url)).await?;

        let raw = body
            .as_array()
            .ok_or_else(|| VenueError::Exchange("binance: klines response is not an array".into()))?;

        let mut klines = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = match entry.as_array() {
                Some(a) if a.len() >= 6 => a,
                _ => {
                    warn!("skipping malformed binance kline entry");
                    continue;
                }
            };
            klines.push(Kline {
                ts_ms: arr[0].as_i64().unwrap_or(0),
                open: parse_str_f64(&arr[1]),
                high: parse_str_f64(&arr[2]),
                low: parse_str_f64(&arr[3]),
                close: parse_str_f64(&arr[4]),
                volume: parse_str_f64(&arr[5]),
            });
        }
        Ok(klines)
    }

    async fn get_balance(&self) -> Result<f64, VenueError> {
        if self.api_key.is_empty() {
            return Err(VenueError::Authentication(
                "binance: no API credentials configured".into(),
            ));
        }

        let body = retry_with_backoff("binance::get_balance", || async {
            let qs = self.signed_query("");
            let url = format!("{}/api/v3/account?{}", self.base_url, qs);
            self.get_json(&url).await
        })
        .await?;

        let free = body["balances"]
            .as_array()
            .and_then(|balances| {
                balances
                    .iter()
                    .find(|b| b["asset"].as_str() == Some("USDT"))
            })
            .map(|b| parse_str_f64(&b["free"]))
            .unwrap_or(0.0);

        debug!(free, "binance USDT balance retrieved");
        Ok(free)
    }

    async fn get_positions(
        &self,
        _symbol: Option<&str>,
    ) -> Result<Vec<VenuePositionData>, VenueError> {
        // Spot venue: holdings are balances, not leveraged positions.
        Ok(Vec::new())
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        order_type: OrderType,
        price: Option<f64>,
    ) -> Result<OrderResult, VenueError> {
        let side_str = match side {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        };
        let type_str = match order_type {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
        };

        let mut params = format!("symbol={symbol}&side={side_str}&type={type_str}&quantity={qty}");
        if let Some(p) = price {
            params.push_str(&format!("&price={p}&timeInForce=GTC"));
        }
        // FULL response includes fills so the fee is available immediately.
        params.push_str("&newOrderRespType=FULL");

        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        debug!(symbol, side = %side, qty, order_type = %order_type, "binance placing order");

        // Order placement is not retried: a timeout may mean the order went
        // through, and a duplicate market order is worse than a failed one.
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(VenueError::from_transport)?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| VenueError::Exchange(format!("binance: bad JSON: {e}")))?;

        if !status.is_success() {
            return Err(Self::classify_error(status, &body));
        }

        Ok(Self::order_result_from(body))
    }

    async fn get_order_status(
        &self,
        order_id: &str,
        symbol: &str,
    ) -> Result<OrderResult, VenueError> {
        let body = retry_with_backoff("binance::get_order_status", || async {
            let params = format!("symbol={symbol}&orderId={order_id}");
            let qs = self.signed_query(&params);
            let url = format!("{}/api/v3/order?{}", self.base_url, qs);
            self.get_json(&url).await
        })
        .await?;

        Ok(Self::order_result_from(body))
    }

    async fn close_position(
        &self,
        symbol: &str,
        side: OrderSide,
    ) -> Result<OrderResult, VenueError> {
        // Spot close = market order on the opposite side for the held base
        // quantity; callers supply the quantity via place_order directly, so
        // this path reports the venue cannot close blind.
        Err(VenueError::Order(format!(
            "binance: spot venue cannot close {side} position on {symbol} without a quantity; use place_order"
        )))
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), VenueError> {
        debug!(symbol, leverage, "binance spot: leverage not applicable, ignored");
        Ok(())
    }

    async fn set_margin_mode(&self, symbol: &str, mode: &str) -> Result<(), VenueError> {
        debug!(symbol, mode, "binance spot: margin mode not applicable, ignored");
        Ok(())
    }
}

impl std::fmt::Debug for BinanceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceAdapter")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("connected", &*self.connected.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_hex() {
        let adapter = BinanceAdapter::new("key", "secret");
        let sig = adapter.sign("symbol=BTCUSDT&timestamp=1");
        assert_eq!(sig.len(), 64);
        assert_eq!(sig, adapter.sign("symbol=BTCUSDT&timestamp=1"));
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn order_result_derives_avg_price_from_quote_qty() {
        let body = serde_json::json!({
            "orderId": 123456u64,
            "status": "FILLED",
            "executedQty": "2.0",
            "cummulativeQuoteQty": "200.0",
            "fills": [
                {"commission": "0.06"},
                {"commission": "0.06"}
            ]
        });
        let result = BinanceAdapter::order_result_from(body);
        assert!(result.success);
        assert_eq!(result.order_id.as_deref(), Some("123456"));
        assert_eq!(result.filled_qty, Some(2.0));
        assert_eq!(result.avg_price, Some(100.0));
        assert_eq!(result.fee, Some(0.12));
        assert_eq!(result.status, Some(OrderStatus::Closed));
    }

    #[test]
    fn order_result_unfilled_has_no_price() {
        let body = serde_json::json!({
            "orderId": 7u64,
            "status": "NEW",
            "executedQty": "0.0",
            "cummulativeQuoteQty": "0.0"
        });
        let result = BinanceAdapter::order_result_from(body);
        assert!(result.avg_price.is_none());
        assert!(result.filled_qty.is_none());
        assert_eq!(result.status, Some(OrderStatus::Open));
        assert!(!result.has_fill());
    }

    #[test]
    fn classify_insufficient_balance() {
        let body = serde_json::json!({"code": -2010, "msg": "Account has insufficient balance"});
        let err = BinanceAdapter::classify_error(reqwest::StatusCode::BAD_REQUEST, &body);
        assert!(matches!(err, VenueError::InsufficientBalance(_)));
    }

    #[test]
    fn classify_auth_and_rate_limit() {
        let body = serde_json::json!({"code": -2014, "msg": "API-key format invalid"});
        let err = BinanceAdapter::classify_error(reqwest::StatusCode::UNAUTHORIZED, &body);
        assert!(matches!(err, VenueError::Authentication(_)));

        let body = serde_json::json!({"code": -1003, "msg": "Too many requests"});
        let err = BinanceAdapter::classify_error(reqwest::StatusCode::TOO_MANY_REQUESTS, &body);
        assert!(matches!(err, VenueError::RateLimit(_)));
    }
}
