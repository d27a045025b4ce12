// =============================================================================
// Bitget venue adapter — USDT-futures over signed REST (v2 mix API)
// =============================================================================
//
// Bitget quirks handled here:
//   - Every request carries a productType tag (USDT-FUTURES).
//   - Signing: base64(HMAC-SHA256(timestamp + method + path + body)) in the
//     ACCESS-SIGN header, plus an ACCESS-PASSPHRASE.
//   - Responses are HTTP 200 with an application-level code; "00000" is the
//     only success code.
//   - One-click close via /order/close-positions.
// =============================================================================

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::types::OrderSide;

use super::{
    parse_str_f64, retry_with_backoff, BookLevel, Kline, OrderBook, OrderResult, OrderStatus,
    OrderType, TickerData, VenueAdapter, VenueError, VenuePositionData,
};

type HmacSha256 = Hmac<Sha256>;

/// Product type tag required on every mix-API request.
const PRODUCT_TYPE: &str = "USDT-FUTURES";
/// Margin coin for USDT-margined contracts.
const MARGIN_COIN: &str = "USDT";

pub struct BitgetAdapter {
    api_key: String,
    secret: String,
    passphrase: String,
    base_url: String,
    margin_mode: RwLock<String>,
    client: reqwest::Client,
    connected: RwLock<bool>,
}

impl BitgetAdapter {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        passphrase: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            passphrase: passphrase.into(),
            base_url: "https://api.bitget.com".to_string(),
            margin_mode: RwLock::new("crossed".to_string()),
            client,
            connected: RwLock::new(false),
        }
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    /// base64(HMAC-SHA256(timestamp + method + request_path + body)).
    fn sign(&self, timestamp: &str, method: &str, request_path: &str, body: &str) -> String {
        let prehash = format!("{timestamp}{method}{request_path}{body}");
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(prehash.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> String {
        chrono::Utc::now().timestamp_millis().to_string()
    }

    /// Send a signed or public request and unwrap Bitget's envelope
    /// (`{code, msg, data}`).
    async fn request(
        &self,
        method: reqwest::Method,
        path_and_query: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, VenueError> {
        let url = format!("{}{}", self.base_url, path_and_query);
        let body_str = body
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_default();

        let ts = Self::timestamp_ms();
        let sig = self.sign(&ts, method.as_str(), path_and_query, &body_str);

        let mut req = self
            .client
            .request(method, &url)
            .header("ACCESS-KEY", &self.api_key)
            .header("ACCESS-SIGN", sig)
            .header("ACCESS-TIMESTAMP", ts)
            .header("ACCESS-PASSPHRASE", &self.passphrase)
            .header("Content-Type", "application/json");
        if !body_str.is_empty() {
            req = req.body(body_str);
        }

        let resp = req.send().await.map_err(VenueError::from_transport)?;
        let http_status = resp.status();
        let envelope: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| VenueError::Exchange(format!("bitget: bad JSON: {e}")))?;

        let code = envelope["code"].as_str().unwrap_or("");
        if code != "00000" {
            let msg = envelope["msg"].as_str().unwrap_or("unknown").to_string();
            return Err(Self::classify_error(http_status, code, &msg));
        }

        Ok(envelope["data"].clone())
    }

    /// Map Bitget's application code + HTTP status into the uniform kinds.
    fn classify_error(status: reqwest::StatusCode, code: &str, msg: &str) -> VenueError {
        let lower = msg.to_lowercase();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
            || matches!(code, "40001" | "40002" | "40003" | "40006" | "40012" | "40037")
        {
            VenueError::Authentication(format!("bitget: {msg} (code {code})"))
        } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS || code == "429" {
            VenueError::RateLimit(format!("bitget: {msg} (code {code})"))
        } else if lower.contains("insufficient") || code == "40754" {
            VenueError::InsufficientBalance(format!("bitget: {msg} (code {code})"))
        } else if code.starts_with("43") || lower.contains("order") {
            VenueError::Order(format!("bitget: {msg} (code {code})"))
        } else {
            VenueError::Exchange(format!("bitget: {msg} (code {code})"))
        }
    }

    fn map_status(raw: &str) -> OrderStatus {
        match raw {
            "filled" => OrderStatus::Closed,
            "canceled" | "cancelled" => OrderStatus::Canceled,
            _ => OrderStatus::Open,
        }
    }

    fn order_result_from(data: serde_json::Value) -> OrderResult {
        let filled = parse_str_f64(&data["baseVolume"]);
        let avg_price = parse_str_f64(&data["priceAvg"]);
        let status = data["state"].as_str().map(Self::map_status);
        // Bitget reports fee as a negative quote amount on filled orders.
        let fee = data["fee"].as_str().and_then(|s| s.parse::<f64>().ok());

        OrderResult {
            success: true,
            order_id: data["orderId"].as_str().map(|s| s.to_string()),
            avg_price: (avg_price > 0.0).then_some(avg_price),
            filled_qty: (filled > 0.0).then_some(filled),
            fee: fee.map(f64::abs).filter(|f| *f > 0.0),
            status,
            error: None,
            raw: data,
        }
    }
}

#[async_trait]
impl VenueAdapter for BitgetAdapter {
    fn name(&self) -> &str {
        "bitget"
    }

    async fn connect(&self) -> Result<(), VenueError> {
        // Public time endpoint doubles as a reachability probe.
        let path = "/api/v2/public/time";
        retry_with_backoff("bitget::time", || {
            self.request(reqwest::Method::GET, path, None)
        })
        .await?;
        *self.connected.write() = true;
        debug!("bitget adapter connected");
        Ok(())
    }

    async fn disconnect(&self) {
        *self.connected.write() = false;
        debug!("bitget adapter disconnected");
    }

    fn is_connected(&self) -> bool {
        *self.connected.read()
    }

    async fn get_ticker(&self, symbol: &str) -> Result<TickerData, VenueError> {
        let path = format!(
            "/api/v2/mix/market/ticker?symbol={symbol}&productType={PRODUCT_TYPE}"
        );
        let data = retry_with_backoff("bitget::get_ticker", || {
            self.request(reqwest::Method::GET, &path, None)
        })
        .await?;

        // Ticker comes back as a single-element array.
        let t = data
            .as_array()
            .and_then(|a| a.first())
            .cloned()
            .unwrap_or(data);

        Ok(TickerData {
            symbol: symbol.to_string(),
            last: parse_str_f64(&t["lastPr"]),
            bid: parse_str_f64(&t["bidPr"]),
            ask: parse_str_f64(&t["askPr"]),
            volume: parse_str_f64(&t["baseVolume"]),
            ts_ms: t["ts"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
        })
    }

    async fn get_orderbook(&self, symbol: &str, depth: usize) -> Result<OrderBook, VenueError> {
        let path = format!(
            "/api/v2/mix/market/merge-depth?symbol={symbol}&productType={PRODUCT_TYPE}&limit={depth}"
        );
        let data = retry_with_backoff("bitget::get_orderbook", || {
            self.request(reqwest::Method::GET, &path, None)
        })
        .await?;

        let parse_side = |side: &serde_json::Value| -> Vec<BookLevel> {
            side.as_array()
                .map(|levels| {
                    levels
                        .iter()
                        .filter_map(|l| l.as_array())
                        .filter(|l| l.len() >= 2)
                        .map(|l| BookLevel {
                            price: parse_str_f64(&l[0]),
                            qty: parse_str_f64(&l[1]),
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(OrderBook {
            bids: parse_side(&data["bids"]),
            asks: parse_side(&data["asks"]),
        })
    }

    async fn get_klines(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Kline>, VenueError> {
        let path = format!(
            "/api/v2/mix/market/candles?symbol={symbol}&productType={PRODUCT_TYPE}&granularity={timeframe}&limit={limit}"
        );
        let data = retry_with_backoff("bitget::get_klines", || {
            self.request(reqwest::Method::GET, &path, None)
        })
        .await?;

        let raw = data
            .as_array()
            .ok_or_else(|| VenueError::Exchange("bitget: candles response is not an array".into()))?;

        let mut klines = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = match entry.as_array() {
                Some(a) if a.len() >= 6 => a,
                _ => {
                    warn!("skipping malformed bitget candle entry");
                    continue;
                }
            };
            klines.push(Kline {
                ts_ms: arr[0].as_str().and_then(|s| s.parse().ok()).unwrap_or(0),
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
        let path = format!("/api/v2/mix/account/accounts?productType={PRODUCT_TYPE}");
        let data = retry_with_backoff("bitget::get_balance", || {
            self.request(reqwest::Method::GET, &path, None)
        })
        .await?;

        let free = data
            .as_array()
            .and_then(|accounts| {
                accounts
                    .iter()
                    .find(|a| a["marginCoin"].as_str() == Some(MARGIN_COIN))
            })
            .map(|a| parse_str_f64(&a["available"]))
            .unwrap_or(0.0);

        debug!(free, "bitget USDT balance retrieved");
        Ok(free)
    }

    async fn get_positions(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<VenuePositionData>, VenueError> {
        let path = format!(
            "/api/v2/mix/position/all-position?productType={PRODUCT_TYPE}&marginCoin={MARGIN_COIN}"
        );
        let data = retry_with_backoff("bitget::get_positions", || {
            self.request(reqwest::Method::GET, &path, None)
        })
        .await?;

        let positions = data
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter(|p| {
                        symbol
                            .map(|s| p["symbol"].as_str() == Some(s))
                            .unwrap_or(true)
                    })
                    .map(|p| VenuePositionData {
                        symbol: p["symbol"].as_str().unwrap_or_default().to_string(),
                        side: p["holdSide"].as_str().unwrap_or_default().to_string(),
                        qty: parse_str_f64(&p["total"]),
                        entry_price: parse_str_f64(&p["openPriceAvg"]),
                        unrealized_pnl: parse_str_f64(&p["unrealizedPL"]),
                        leverage: parse_str_f64(&p["leverage"]) as u32,
                        margin_mode: p["marginMode"].as_str().unwrap_or_default().to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(positions)
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        order_type: OrderType,
        price: Option<f64>,
    ) -> Result<OrderResult, VenueError> {
        let mut body = serde_json::json!({
            "symbol": symbol,
            "productType": PRODUCT_TYPE,
            "marginMode": self.margin_mode.read().clone(),
            "marginCoin": MARGIN_COIN,
            "size": qty.to_string(),
            "side": side.to_string(),
            "orderType": order_type.to_string(),
        });
        if let Some(p) = price {
            body["price"] = serde_json::json!(p.to_string());
        }

        debug!(symbol, side = %side, qty, order_type = %order_type, "bitget placing order");

        // Not retried: duplicating a market order is worse than failing one.
        let data = self
            .request(reqwest::Method::POST, "/api/v2/mix/order/place-order", Some(body))
            .await?;

        Ok(OrderResult {
            success: true,
            order_id: data["orderId"].as_str().map(|s| s.to_string()),
            avg_price: None,
            filled_qty: None,
            fee: None,
            status: Some(OrderStatus::Open),
            error: None,
            raw: data,
        })
    }

    async fn get_order_status(
        &self,
        order_id: &str,
        symbol: &str,
    ) -> Result<OrderResult, VenueError> {
        let path = format!(
            "/api/v2/mix/order/detail?symbol={symbol}&productType={PRODUCT_TYPE}&orderId={order_id}"
        );
        let data = retry_with_backoff("bitget::get_order_status", || {
            self.request(reqwest::Method::GET, &path, None)
        })
        .await?;

        Ok(Self::order_result_from(data))
    }

    async fn close_position(
        &self,
        symbol: &str,
        side: OrderSide,
    ) -> Result<OrderResult, VenueError> {
        // One-click close endpoint; holdSide names the position being closed.
        let hold_side = match side {
            OrderSide::Buy => "long",
            OrderSide::Sell => "short",
        };
        let body = serde_json::json!({
            "symbol": symbol,
            "productType": PRODUCT_TYPE,
            "holdSide": hold_side,
        });

        let data = self
            .request(
                reqwest::Method::POST,
                "/api/v2/mix/order/close-positions",
                Some(body),
            )
            .await?;

        let order_id = data["successList"]
            .as_array()
            .and_then(|a| a.first())
            .and_then(|o| o["orderId"].as_str())
            .map(|s| s.to_string());

        Ok(OrderResult {
            success: true,
            order_id,
            avg_price: None,
            filled_qty: None,
            fee: None,
            status: Some(OrderStatus::Open),
            error: None,
            raw: data,
        })
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), VenueError> {
        let body = serde_json::json!({
            "symbol": symbol,
            "productType": PRODUCT_TYPE,
            "marginCoin": MARGIN_COIN,
            "leverage": leverage.to_string(),
        });
        self.request(
            reqwest::Method::POST,
            "/api/v2/mix/account/set-leverage",
            Some(body),
        )
        .await?;
        debug!(symbol, leverage, "bitget leverage set");
        Ok(())
    }

    async fn set_margin_mode(&self, symbol: &str, mode: &str) -> Result<(), VenueError> {
        let body = serde_json::json!({
            "symbol": symbol,
            "productType": PRODUCT_TYPE,
            "marginCoin": MARGIN_COIN,
            "marginMode": mode,
        });
        self.request(
            reqwest::Method::POST,
            "/api/v2/mix/account/set-margin-mode",
            Some(body),
        )
        .await?;
        *self.margin_mode.write() = mode.to_string();
        debug!(symbol, mode, "bitget margin mode set");
        Ok(())
    }
}

impl std::fmt::Debug for BitgetAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitgetAdapter")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("connected", &*self.connected.read())
            .finish()
    }
}
