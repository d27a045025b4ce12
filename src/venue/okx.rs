// =============================================================================
// OKX venue adapter — perpetual swaps over signed REST (v5 API)
// =============================================================================
//
// OKX quirks handled here:
//   - Instruments are addressed by instId ("BTC-USDT-SWAP"); the engine's
//     compact symbols ("BTCUSDT") are translated on the way in.
//   - tdMode selects cross/isolated margin on every order.
//   - Hedge mode splits positions by posSide; leverage must be set for long
//     and short separately.
//   - Signing: base64(HMAC-SHA256(iso_timestamp + method + path + body)).
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

pub struct OkxAdapter {
    api_key: String,
    secret: String,
    passphrase: String,
    base_url: String,
    /// "cross" or "isolated"; sent as tdMode on every order.
    td_mode: RwLock<String>,
    client: reqwest::Client,
    connected: RwLock<bool>,
}

impl OkxAdapter {
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
            base_url: "https://www.okx.com".to_string(),
            td_mode: RwLock::new("cross".to_string()),
            client,
            connected: RwLock::new(false),
        }
    }

    /// Translate the engine's compact symbol ("BTCUSDT") into an OKX swap
    /// instId ("BTC-USDT-SWAP"). Already-dashed ids pass through untouched.
    fn to_inst_id(symbol: &str) -> String {
        if symbol.contains('-') {
            return symbol.to_string();
        }
        if let Some(base) = symbol.strip_suffix("USDT") {
            format!("{base}-USDT-SWAP")
        } else {
            symbol.to_string()
        }
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    /// base64(HMAC-SHA256(timestamp + method + request_path + body)) with an
    /// ISO-8601 millisecond timestamp.
    fn sign(&self, timestamp: &str, method: &str, request_path: &str, body: &str) -> String {
        let prehash = format!("{timestamp}{method}{request_path}{body}");
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(prehash.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }

    fn timestamp_iso() -> String {
        chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
    }

    /// Send a request and unwrap OKX's envelope (`{code, msg, data}`).
    async fn request(
        &self,
        method: reqwest::Method,
        path_and_query: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, VenueError> {
        let url = format!("{}{}", self.base_url, path_and_query);
        let body_str = body.as_ref().map(|b| b.to_string()).unwrap_or_default();

        let ts = Self::timestamp_iso();
        let sig = self.sign(&ts, method.as_str(), path_and_query, &body_str);

        let mut req = self
            .client
            .request(method, &url)
            .header("OK-ACCESS-KEY", &self.api_key)
            .header("OK-ACCESS-SIGN", sig)
            .header("OK-ACCESS-TIMESTAMP", ts)
            .header("OK-ACCESS-PASSPHRASE", &self.passphrase)
            .header("Content-Type", "application/json");
        if !body_str.is_empty() {
            req = req.body(body_str);
        }

        let resp = req.send().await.map_err(VenueError::from_transport)?;
        let http_status = resp.status();
        let envelope: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| VenueError::Exchange(format!("okx: bad JSON: {e}")))?;

        let code = envelope["code"].as_str().unwrap_or("");
        if code != "0" {
            let msg = envelope["msg"].as_str().unwrap_or("unknown").to_string();
            // Per-order errors are nested in data[].sMsg when the envelope
            // message is empty.
            let detail = envelope["data"]
                .as_array()
                .and_then(|a| a.first())
                .and_then(|d| d["sMsg"].as_str())
                .unwrap_or(&msg)
                .to_string();
            return Err(Self::classify_error(http_status, code, &detail));
        }

        Ok(envelope["data"].clone())
    }

    fn classify_error(status: reqwest::StatusCode, code: &str, msg: &str) -> VenueError {
        let lower = msg.to_lowercase();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
            || matches!(code, "50100" | "50101" | "50102" | "50103" | "50111" | "50113")
        {
            VenueError::Authentication(format!("okx: {msg} (code {code})"))
        } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS || code == "50011" {
            VenueError::RateLimit(format!("okx: {msg} (code {code})"))
        } else if lower.contains("insufficient") || code == "51008" {
            VenueError::InsufficientBalance(format!("okx: {msg} (code {code})"))
        } else if code.starts_with("51") {
            VenueError::Order(format!("okx: {msg} (code {code})"))
        } else {
            VenueError::Exchange(format!("okx: {msg} (code {code})"))
        }
    }

    fn map_status(raw: &str) -> OrderStatus {
        match raw {
            "filled" => OrderStatus::Closed,
            "canceled" | "mmp_canceled" => OrderStatus::Canceled,
            _ => OrderStatus::Open,
        }
    }

    fn order_result_from(data: serde_json::Value) -> OrderResult {
        let o = data
            .as_array()
            .and_then(|a| a.first())
            .cloned()
            .unwrap_or(data);

        let filled = parse_str_f64(&o["accFillSz"]);
        let avg_price = parse_str_f64(&o["avgPx"]);
        let status = o["state"].as_str().map(Self::map_status);
        // OKX reports fees as negative quote amounts.
        let fee = o["fee"].as_str().and_then(|s| s.parse::<f64>().ok());

        OrderResult {
            success: true,
            order_id: o["ordId"].as_str().map(|s| s.to_string()),
            avg_price: (avg_price > 0.0).then_some(avg_price),
            filled_qty: (filled > 0.0).then_some(filled),
            fee: fee.map(f64::abs).filter(|f| *f > 0.0),
            status,
            error: None,
            raw: o,
        }
    }
}

#[async_trait]
impl VenueAdapter for OkxAdapter {
    fn name(&self) -> &str {
        "okx"
    }

    async fn connect(&self) -> Result<(), VenueError> {
        let path = "/api/v5/public/time";
        retry_with_backoff("okx::time", || {
            self.request(reqwest::Method::GET, path, None)
        })
        .await?;
        *self.connected.write() = true;
        debug!("okx adapter connected");
        Ok(())
    }

    async fn disconnect(&self) {
        *self.connected.write() = false;
        debug!("okx adapter disconnected");
    }

    fn is_connected(&self) -> bool {
        *self.connected.read()
    }

    async fn get_ticker(&self, symbol: &str) -> Result<TickerData, VenueError> {
        let inst_id = Self::to_inst_id(symbol);
        let path = format!("/api/v5/market/ticker?instId={inst_id}");
        let data = retry_with_backoff("okx::get_ticker", || {
            self.request(reqwest::Method::GET, &path, None)
        })
        .await?;

        let t = data
            .as_array()
            .and_then(|a| a.first())
            .cloned()
            .unwrap_or(data);

        Ok(TickerData {
            symbol: symbol.to_string(),
            last: parse_str_f64(&t["last"]),
            bid: parse_str_f64(&t["bidPx"]),
            ask: parse_str_f64(&t["askPx"]),
            volume: parse_str_f64(&t["vol24h"]),
            ts_ms: t["ts"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
        })
    }

    async fn get_orderbook(&self, symbol: &str, depth: usize) -> Result<OrderBook, VenueError> {
        let inst_id = Self::to_inst_id(symbol);
        let path = format!("/api/v5/market/books?instId={inst_id}&sz={depth}");
        let data = retry_with_backoff("okx::get_orderbook", || {
            self.request(reqwest::Method::GET, &path, None)
        })
        .await?;

        let book = data
            .as_array()
            .and_then(|a| a.first())
            .cloned()
            .unwrap_or(data);

        // OKX levels are [price, qty, liquidated_orders, order_count].
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
            bids: parse_side(&book["bids"]),
            asks: parse_side(&book["asks"]),
        })
    }

    async fn get_klines(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Kline>, VenueError> {
        let inst_id = Self::to_inst_id(symbol);
        let path = format!("/api/v5/market/candles?instId={inst_id}&bar={timeframe}&limit={limit}");
        let data = retry_with_backoff("okx::get_klines", || {
            self.request(reqwest::Method::GET, &path, None)
        })
        .await?;

        let raw = data
            .as_array()
            .ok_or_else(|| VenueError::Exchange("okx: candles response is not an array".into()))?;

        let mut klines = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = match entry.as_array() {
                Some(a) if a.len() >= 6 => a,
                _ => {
                    warn!("skipping malformed okx candle entry");
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
        let path = "/api/v5/account/balance?ccy=USDT";
        let data = retry_with_backoff("okx::get_balance", || {
            self.request(reqwest::Method::GET, path, None)
        })
        .await?;

        let free = data
            .as_array()
            .and_then(|a| a.first())
            .and_then(|acct| acct["details"].as_array())
            .and_then(|details| {
                details
                    .iter()
                    .find(|d| d["ccy"].as_str() == Some("USDT"))
            })
            .map(|d| parse_str_f64(&d["availBal"]))
            .unwrap_or(0.0);

        debug!(free, "okx USDT balance retrieved");
        Ok(free)
    }

    async fn get_positions(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<VenuePositionData>, VenueError> {
        let path = match symbol {
            Some(s) => format!("/api/v5/account/positions?instId={}", Self::to_inst_id(s)),
            None => "/api/v5/account/positions".to_string(),
        };
        let data = retry_with_backoff("okx::get_positions", || {
            self.request(reqwest::Method::GET, &path, None)
        })
        .await?;

        let positions = data
            .as_array()
            .map(|arr| {
                arr.iter()
                    .map(|p| VenuePositionData {
                        symbol: p["instId"].as_str().unwrap_or_default().to_string(),
                        // posSide distinguishes long/short in hedge mode.
                        side: p["posSide"].as_str().unwrap_or_default().to_string(),
                        qty: parse_str_f64(&p["pos"]),
                        entry_price: parse_str_f64(&p["avgPx"]),
                        unrealized_pnl: parse_str_f64(&p["upl"]),
                        leverage: parse_str_f64(&p["lever"]) as u32,
                        margin_mode: p["mgnMode"].as_str().unwrap_or_default().to_string(),
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
        let inst_id = Self::to_inst_id(symbol);
        let mut body = serde_json::json!({
            "instId": inst_id,
            "tdMode": self.td_mode.read().clone(),
            "side": side.to_string(),
            "ordType": order_type.to_string(),
            "sz": qty.to_string(),
        });
        if let Some(p) = price {
            body["px"] = serde_json::json!(p.to_string());
        }

        debug!(symbol, side = %side, qty, order_type = %order_type, "okx placing order");

        // Not retried: duplicating a market order is worse than failing one.
        let data = self
            .request(reqwest::Method::POST, "/api/v5/trade/order", Some(body))
            .await?;

        let order_id = data
            .as_array()
            .and_then(|a| a.first())
            .and_then(|o| o["ordId"].as_str())
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

    async fn get_order_status(
        &self,
        order_id: &str,
        symbol: &str,
    ) -> Result<OrderResult, VenueError> {
        let inst_id = Self::to_inst_id(symbol);
        let path = format!("/api/v5/trade/order?instId={inst_id}&ordId={order_id}");
        let data = retry_with_backoff("okx::get_order_status", || {
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
        let pos_side = match side {
            OrderSide::Buy => "long",
            OrderSide::Sell => "short",
        };
        let body = serde_json::json!({
            "instId": Self::to_inst_id(symbol),
            "mgnMode": self.td_mode.read().clone(),
            "posSide": pos_side,
        });

        let data = self
            .request(reqwest::Method::POST, "/api/v5/trade/close-position", Some(body))
            .await?;

        Ok(OrderResult {
            success: true,
            order_id: None,
            avg_price: None,
            filled_qty: None,
            fee: None,
            status: Some(OrderStatus::Open),
            error: None,
            raw: data,
        })
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), VenueError> {
        let inst_id = Self::to_inst_id(symbol);
        // Hedge mode requires a separate call per position side.
        for pos_side in ["long", "short"] {
            let body = serde_json::json!({
                "instId": inst_id,
                "lever": leverage.to_string(),
                "mgnMode": self.td_mode.read().clone(),
                "posSide": pos_side,
            });
            self.request(
                reqwest::Method::POST,
                "/api/v5/account/set-leverage",
                Some(body),
            )
            .await?;
        }
        debug!(symbol, leverage, "okx leverage set for both position sides");
        Ok(())
    }

    async fn set_margin_mode(&self, symbol: &str, mode: &str) -> Result<(), VenueError> {
        // OKX selects margin mode per order via tdMode rather than a
        // per-symbol account setting.
        let normalized = if mode == "crossed" { "cross" } else { mode };
        *self.td_mode.write() = normalized.to_string();
        debug!(symbol, mode = normalized, "okx tdMode updated");
        Ok(())
    }
}

impl std::fmt::Debug for OkxAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OkxAdapter")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("connected", &*self.connected.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inst_id_translation() {
        assert_eq!(OkxAdapter::to_inst_id("BTCUSDT"), "BTC-USDT-SWAP");
        assert_eq!(OkxAdapter::to_inst_id("SOLUSDT"), "SOL-USDT-SWAP");
        assert_eq!(OkxAdapter::to_inst_id("BTC-USDT-SWAP"), "BTC-USDT-SWAP");
    }

    #[test]
    fn order_result_parses_first_array_element() {
        let data = serde_json::json!([{
            "ordId": "999",
            "state": "filled",
            "accFillSz": "1.5",
            "avgPx": "99.5",
            "fee": "-0.09"
        }]);
        let result = OkxAdapter::order_result_from(data);
        assert_eq!(result.order_id.as_deref(), Some("999"));
        assert_eq!(result.filled_qty, Some(1.5));
        assert_eq!(result.avg_price, Some(99.5));
        assert_eq!(result.fee, Some(0.09));
        assert_eq!(result.status, Some(OrderStatus::Closed));
    }

    #[test]
    fn classify_order_vs_balance_errors() {
        let err = OkxAdapter::classify_error(
            reqwest::StatusCode::OK,
            "51008",
            "Order failed. Insufficient USDT balance",
        );
        assert!(matches!(err, VenueError::InsufficientBalance(_)));

        let err = OkxAdapter::classify_error(
            reqwest::StatusCode::OK,
            "51121",
            "Order quantity must be a multiple of the lot size",
        );
        assert!(matches!(err, VenueError::Order(_)));
    }

    #[test]
    fn margin_mode_normalises_crossed() {
        let adapter = OkxAdapter::new("k", "s", "p");
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        rt.block_on(adapter.set_margin_mode("BTCUSDT", "crossed"))
            .unwrap();
        assert_eq!(*adapter.td_mode.read(), "cross");
    }
}
