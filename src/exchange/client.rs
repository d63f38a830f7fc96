//! REST binding for the exchange, shaped like Bybit v5. Structurally
//! grounded in `binance/client.rs` (HMAC signing, `#[instrument]`, redacted
//! `Debug`, `anyhow::Context` error propagation); operation set and
//! request-shaping re-grounded against `src/api/bybit_client.py` and the
//! normalizing variant covered by `tests/test_bybit_client_normalization.py`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::sync::Semaphore;
use tracing::{error, instrument, warn};

use crate::exchange::normalize::InstrumentSpec;
use crate::types::{Bar, Category, Side};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW_MS: u64 = 5000;
/// Bounded worker pool for blocking exchange I/O, per the concurrency model.
const MAX_CONCURRENT_REQUESTS: usize = 10;
/// Bybit returns this code on set-leverage when the leverage is already set;
/// treated as success.
const LEVERAGE_UNCHANGED_CODE: i64 = 110043;

pub struct ExchangeClient {
    api_key: String,
    api_secret: String,
    base_url: String,
    http: reqwest::Client,
    request_count: AtomicU64,
    error_count: AtomicU64,
    worker_permits: Arc<Semaphore>,
}

impl std::fmt::Debug for ExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeClient")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("request_count", &self.request_count.load(Ordering::Relaxed))
            .field("error_count", &self.error_count.load(Ordering::Relaxed))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Ticker {
    pub last_price: f64,
    pub high_price_24h: f64,
    pub low_price_24h: f64,
    pub volume_24h: f64,
}

pub type Kline = Bar;

#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub order_id: String,
}

#[derive(Debug, Clone)]
pub struct Position {
    pub symbol: String,
    pub size: f64,
    pub side: Side,
    pub entry_price: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderHistoryEntry {
    #[serde(rename = "orderId")]
    pub order_id: String,
    #[serde(rename = "orderStatus")]
    pub order_status: String,
    #[serde(rename = "avgPrice", deserialize_with = "parse_str_f64")]
    pub avg_price: f64,
}

#[derive(Debug, Clone)]
pub struct WalletBalance {
    pub total_equity: f64,
}

fn parse_str_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    match v {
        Value::String(s) => s.parse().map_err(serde::de::Error::custom),
        Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0)),
        _ => Ok(0.0),
    }
}

impl ExchangeClient {
    pub fn new(api_key: String, api_secret: String, testnet: bool) -> anyhow::Result<Self> {
        let base_url = if testnet {
            "https://api-testnet.bybit.com".to_string()
        } else {
            "https://api.bybit.com".to_string()
        };
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(ExchangeClient {
            api_key,
            api_secret,
            base_url,
            http,
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            worker_permits: Arc::new(Semaphore::new(MAX_CONCURRENT_REQUESTS)),
        })
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Signs `timestamp + apiKey + recvWindow + queryString`, the Bybit v5
    /// GET-signing scheme.
    fn signed_headers(&self, query_string: &str) -> Vec<(&'static str, String)> {
        let timestamp = Self::timestamp_ms().to_string();
        let payload = format!("{timestamp}{}{RECV_WINDOW_MS}{query_string}", self.api_key);
        let signature = self.sign(&payload);
        vec![
            ("X-BAPI-API-KEY", self.api_key.clone()),
            ("X-BAPI-TIMESTAMP", timestamp),
            ("X-BAPI-RECV-WINDOW", RECV_WINDOW_MS.to_string()),
            ("X-BAPI-SIGN", signature),
        ]
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> anyhow::Result<Value> {
        let _permit = self.worker_permits.acquire().await?;
        self.request_count.fetch_add(1, Ordering::Relaxed);

        let query_string = build_query_string(query);
        let url = format!("{}{}?{}", self.base_url, path, query_string);
        let headers = self.signed_headers(&query_string);

        let mut req = self.http.get(&url);
        for (k, v) in headers {
            req = req.header(k, v);
        }
        let resp = req.send().await;
        self.parse_bybit_response(resp, path).await
    }

    async fn post(&self, path: &str, body: &Value) -> anyhow::Result<Value> {
        let _permit = self.worker_permits.acquire().await?;
        self.request_count.fetch_add(1, Ordering::Relaxed);

        let body_string = body.to_string();
        let url = format!("{}{}", self.base_url, path);
        let headers = self.signed_headers(&body_string);

        let mut req = self.http.post(&url).body(body_string).header("Content-Type", "application/json");
        for (k, v) in headers {
            req = req.header(k, v);
        }
        let resp = req.send().await;
        self.parse_bybit_response(resp, path).await
    }

    async fn parse_bybit_response(
        &self,
        resp: Result<reqwest::Response, reqwest::Error>,
        path: &str,
    ) -> anyhow::Result<Value> {
        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                anyhow::bail!("request to {path} failed: {e}");
            }
        };
        if !resp.status().is_success() {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            anyhow::bail!("{path} returned HTTP {}", resp.status());
        }
        let body: Value = resp.json().await?;
        let ret_code = body.get("retCode").and_then(Value::as_i64).unwrap_or(-1);
        if ret_code != 0 && ret_code != LEVERAGE_UNCHANGED_CODE {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            let msg = body.get("retMsg").and_then(Value::as_str).unwrap_or("unknown");
            anyhow::bail!("{path} retCode={ret_code}: {msg}");
        }
        Ok(body)
    }

    /// Ordered ascending sequence of bars (oldest first). Never raises to
    /// callers: a transport failure logs and returns an empty sequence.
    #[instrument(skip(self), name = "exchange::get_klines")]
    pub async fn get_klines(
        &self,
        category: Category,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Vec<Kline> {
        let query = [
            ("category", category.to_string()),
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("limit", limit.to_string()),
        ];
        match self.get("/v5/market/kline", &query).await {
            Ok(body) => parse_klines(&body).unwrap_or_else(|e| {
                error!(%e, symbol, "failed to parse kline response");
                Vec::new()
            }),
            Err(e) => {
                error!(%e, symbol, "get_klines failed");
                Vec::new()
            }
        }
    }

    #[instrument(skip(self), name = "exchange::get_ticker")]
    pub async fn get_ticker(&self, category: Category, symbol: &str) -> Option<Ticker> {
        let query = [("category", category.to_string()), ("symbol", symbol.to_string())];
        match self.get("/v5/market/tickers", &query).await {
            Ok(body) => {
                let entry = body.pointer("/result/list/0")?;
                Some(Ticker {
                    last_price: entry.get("lastPrice").and_then(parse_numeric_field).unwrap_or(0.0),
                    high_price_24h: entry.get("highPrice24h").and_then(parse_numeric_field).unwrap_or(0.0),
                    low_price_24h: entry.get("lowPrice24h").and_then(parse_numeric_field).unwrap_or(0.0),
                    volume_24h: entry.get("volume24h").and_then(parse_numeric_field).unwrap_or(0.0),
                })
            }
            Err(e) => {
                warn!(%e, symbol, "get_ticker failed");
                None
            }
        }
    }

    /// Idempotent: Bybit's "leverage not modified" code is treated as success.
    #[instrument(skip(self), name = "exchange::set_leverage")]
    pub async fn set_leverage(&self, category: Category, symbol: &str, leverage: u32) -> bool {
        let body = json!({
            "category": category.to_string(),
            "symbol": symbol,
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });
        match self.post("/v5/position/set-leverage", &body).await {
            Ok(_) => true,
            Err(e) => {
                error!(%e, symbol, "set_leverage failed");
                false
            }
        }
    }

    /// Quantity and TP/SL must already be normalized strings.
    #[instrument(skip(self), name = "exchange::place_market_order")]
    pub async fn place_market_order(
        &self,
        category: Category,
        symbol: &str,
        side: Side,
        qty: &str,
        take_profit: &str,
        stop_loss: &str,
        position_idx: u32,
    ) -> Option<PlacedOrder> {
        let body = json!({
            "category": category.to_string(),
            "symbol": symbol,
            "side": side.to_string(),
            "orderType": "Market",
            "qty": qty,
            "takeProfit": take_profit,
            "stopLoss": stop_loss,
            "positionIdx": position_idx,
        });
        match self.post("/v5/order/create", &body).await {
            Ok(body) => {
                let order_id = body.pointer("/result/orderId")?.as_str()?.to_string();
                Some(PlacedOrder { order_id })
            }
            Err(e) => {
                error!(%e, symbol, "place_market_order failed");
                None
            }
        }
    }

    #[instrument(skip(self), name = "exchange::get_position")]
    pub async fn get_position(&self, category: Category, symbol: &str) -> Option<Position> {
        let query = [("category", category.to_string()), ("symbol", symbol.to_string())];
        match self.get("/v5/position/list", &query).await {
            Ok(body) => {
                let list = body.pointer("/result/list")?.as_array()?;
                list.iter().find_map(|p| {
                    let size = p.get("size").and_then(parse_numeric_field).unwrap_or(0.0);
                    if size <= 0.0 {
                        return None;
                    }
                    let side_str = p.get("side").and_then(Value::as_str).unwrap_or("Buy");
                    let side = if side_str == "Sell" { Side::Sell } else { Side::Buy };
                    Some(Position {
                        symbol: symbol.to_string(),
                        size,
                        side,
                        entry_price: p.get("avgPrice").and_then(parse_numeric_field).unwrap_or(0.0),
                    })
                })
            }
            Err(e) => {
                error!(%e, symbol, "get_position failed");
                None
            }
        }
    }

    #[instrument(skip(self), name = "exchange::get_order_history")]
    pub async fn get_order_history(
        &self,
        category: Category,
        symbol: Option<&str>,
        limit: u32,
    ) -> Vec<OrderHistoryEntry> {
        let mut query = vec![("category", category.to_string()), ("limit", limit.to_string())];
        if let Some(symbol) = symbol {
            query.push(("symbol", symbol.to_string()));
        }
        match self.get("/v5/order/history", &query).await {
            Ok(body) => {
                let list = body.pointer("/result/list").cloned().unwrap_or(Value::Array(vec![]));
                serde_json::from_value(list).unwrap_or_default()
            }
            Err(e) => {
                error!(%e, "get_order_history failed");
                Vec::new()
            }
        }
    }

    #[instrument(skip(self), name = "exchange::get_wallet_balance")]
    pub async fn get_wallet_balance(&self, account_type: &str) -> Option<WalletBalance> {
        let query = [("accountType", account_type.to_string())];
        match self.get("/v5/account/wallet-balance", &query).await {
            Ok(body) => {
                let equity = body
                    .pointer("/result/list/0/totalEquity")
                    .and_then(parse_numeric_field)
                    .unwrap_or(0.0);
                Some(WalletBalance { total_equity: equity })
            }
            Err(e) => {
                error!(%e, "get_wallet_balance failed");
                None
            }
        }
    }

    #[instrument(skip(self), name = "exchange::get_instruments_info")]
    pub async fn get_instruments_info(&self, category: Category, symbol: &str) -> Option<InstrumentSpec> {
        let query = [("category", category.to_string()), ("symbol", symbol.to_string())];
        match self.get("/v5/market/instruments-info", &query).await {
            Ok(body) => {
                let entry = body.pointer("/result/list/0")?;
                let qty_step = entry
                    .pointer("/lotSizeFilter/qtyStep")
                    .and_then(parse_numeric_field)
                    .unwrap_or(1.0);
                let min_qty = entry
                    .pointer("/lotSizeFilter/minOrderQty")
                    .and_then(parse_numeric_field)
                    .unwrap_or(qty_step);
                let tick_size = entry
                    .pointer("/priceFilter/tickSize")
                    .and_then(parse_numeric_field)
                    .unwrap_or(1e-4);
                let min_notional = entry
                    .pointer("/lotSizeFilter/minNotionalValue")
                    .and_then(parse_numeric_field)
                    .unwrap_or(5.0);
                Some(InstrumentSpec {
                    qty_step,
                    min_qty,
                    tick_size,
                    min_notional,
                })
            }
            Err(e) => {
                warn!(%e, symbol, "get_instruments_info failed");
                None
            }
        }
    }
}

/// Builds a Bybit-style query string. Trading symbols/categories never
/// contain characters that need percent-encoding, so this stays simple
/// rather than pulling in a URL-encoding dependency.
fn build_query_string(query: &[(&str, String)]) -> String {
    query
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn parse_numeric_field(v: &Value) -> Option<f64> {
    match v {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn parse_klines(body: &Value) -> anyhow::Result<Vec<Kline>> {
    let list = body
        .pointer("/result/list")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow::anyhow!("missing result.list"))?;
    // Bybit returns newest-first; the spec requires ascending (oldest first).
    let mut bars = Vec::with_capacity(list.len());
    for row in list.iter().rev() {
        let arr = row.as_array().ok_or_else(|| anyhow::anyhow!("kline row not an array"))?;
        let field = |i: usize| -> anyhow::Result<f64> {
            arr.get(i)
                .and_then(parse_numeric_field)
                .ok_or_else(|| anyhow::anyhow!("kline field {i} missing"))
        };
        bars.push(Bar {
            timestamp_ms: field(0)? as i64,
            open: field(1)?,
            high: field(2)?,
            low: field(3)?,
            close: field(4)?,
            volume: field(5)?,
            confirmed: true,
        });
    }
    Ok(bars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_klines_reverses_to_ascending_order() {
        let body = json!({
            "result": {
                "list": [
                    ["2000", "2", "2", "2", "2", "2"],
                    ["1000", "1", "1", "1", "1", "1"]
                ]
            }
        });
        let bars = parse_klines(&body).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].timestamp_ms, 1000);
        assert_eq!(bars[1].timestamp_ms, 2000);
    }
}
