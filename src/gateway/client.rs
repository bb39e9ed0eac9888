// =============================================================================
// Exchange gateway — signed REST client with priority dispatch,
// retry/backoff, and circuit breaking
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::gateway::circuit_breaker::CircuitBreaker;
use crate::gateway::error::ExchangeError;
use crate::gateway::priority::{Priority, PriorityGate};
use crate::gateway::rate_limit::RateLimitTracker;
use crate::market::{to_wire_symbol, Candle, Ticker, Timeframe};
use crate::types::{BalanceInfo, Side, SymbolMetadata};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW_MS: i64 = 5000;
const REST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub symbol: String,
    pub status: String,
    pub avg_price: f64,
    pub executed_qty: f64,
}

#[derive(Debug, Clone)]
pub struct PositionInfo {
    pub symbol: String,
    pub side: Side,
    pub amount: f64,
    pub entry_price: f64,
    pub leverage: u32,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
}

#[derive(Debug, Clone)]
pub struct OrderBookTop {
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarginMode {
    Cross,
    Isolated,
}

/// Single process-wide object owning all network access to the exchange.
/// Every public method is dispatched through the priority gate and the
/// endpoint-class circuit breaker before the HTTP call itself runs.
pub struct ExchangeGateway {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    gate: PriorityGate,
    trading_breaker: CircuitBreaker,
    data_breaker: CircuitBreaker,
    pub rate_limiter: RateLimitTracker,
    metadata_cache: RwLock<HashMap<String, SymbolMetadata>>,
}

impl ExchangeGateway {
    pub fn new(base_url: impl Into<String>, api_key: String, api_secret: String) -> Self {
        let http = Client::builder()
            .timeout(REST_TIMEOUT)
            .build()
            .expect("failed to build exchange HTTP client");

        Self {
            http,
            base_url: base_url.into(),
            api_key,
            api_secret,
            gate: PriorityGate::new(),
            trading_breaker: CircuitBreaker::new(),
            data_breaker: CircuitBreaker::new(),
            rate_limiter: RateLimitTracker::new(),
            metadata_cache: RwLock::new(HashMap::new()),
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes()).expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Build a signed query string: append `timestamp` + `recvWindow`, sign,
    /// and append the signature.
    fn signed_query(&self, mut params: Vec<(String, String)>, now_ms: i64) -> String {
        params.push(("timestamp".to_string(), now_ms.to_string()));
        params.push(("recvWindow".to_string(), RECV_WINDOW_MS.to_string()));
        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign(&query);
        format!("{query}&signature={signature}")
    }

    fn breaker_for(&self, priority: Priority) -> &CircuitBreaker {
        match priority {
            Priority::Critical | Priority::High => &self.trading_breaker,
            Priority::Normal | Priority::Low => &self.data_breaker,
        }
    }

    fn max_attempts(priority: Priority) -> u32 {
        match priority {
            Priority::Critical => 5,
            _ => 3,
        }
    }

    fn backoff_base(priority: Priority) -> Duration {
        match priority {
            Priority::Critical => Duration::from_millis(300),
            _ => Duration::from_secs(1),
        }
    }

    /// Run `op` under the priority gate and the appropriate circuit breaker,
    /// retrying transient failures with exponential backoff. CRITICAL calls
    /// always pass through the breaker (a position must always be closeable).
    async fn dispatch<T, F, Fut>(&self, priority: Priority, op: F) -> Result<T, ExchangeError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, ExchangeError>>,
    {
        let _guard = self.gate.acquire(priority).await;

        let breaker = self.breaker_for(priority);
        if priority != Priority::Critical && !breaker.allow_request() {
            return Err(ExchangeError::Transient("circuit breaker open".to_string()));
        }

        let attempts = Self::max_attempts(priority);
        let base = Self::backoff_base(priority);

        let mut last_err = ExchangeError::Fatal("no attempts made".to_string());
        for attempt in 0..attempts {
            match op().await {
                Ok(value) => {
                    breaker.record_success();
                    return Ok(value);
                }
                Err(err) => {
                    if !err.is_retryable() {
                        breaker.record_failure();
                        return Err(err);
                    }
                    breaker.record_failure();
                    last_err = err;
                    let delay = base * 2u32.pow(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying gateway call after transient error");
                    tokio::time::sleep(delay).await;
                }
            }
        }
        warn!(error = %last_err, attempts, "gateway call exhausted retries");
        Err(last_err)
    }

    fn current_symbol_metadata(&self, symbol: &str) -> SymbolMetadata {
        self.metadata_cache
            .read()
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| SymbolMetadata::fallback(symbol))
    }

    pub fn cache_symbol_metadata(&self, metadata: SymbolMetadata) {
        self.metadata_cache.write().insert(metadata.symbol.clone(), metadata);
    }

    // ── Data surface ──────────────────────────────────────────────────────

    pub async fn get_balance(&self) -> Result<BalanceInfo, ExchangeError> {
        self.dispatch(Priority::High, || async {
            let now = chrono::Utc::now().timestamp_millis();
            let query = self.signed_query(Vec::new(), now);
            let url = format!("{}/fapi/v2/balance?{query}", self.base_url);
            let resp = self
                .http
                .get(&url)
                .header("X-MBX-APIKEY", &self.api_key)
                .send()
                .await
                .map_err(|e| ExchangeError::Transient(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(ExchangeError::classify(None, &resp.text().await.unwrap_or_default()));
            }
            let body: serde_json::Value = resp.json().await.map_err(|e| ExchangeError::Transient(e.to_string()))?;
            let free = body.get("availableBalance").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0);
            let total = body.get("balance").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0);
            Ok(BalanceInfo { free, used: (total - free).max(0.0), total })
        })
        .await
    }

    pub async fn get_positions(&self) -> Result<Vec<PositionInfo>, ExchangeError> {
        self.dispatch(Priority::High, || async {
            let now = chrono::Utc::now().timestamp_millis();
            let query = self.signed_query(Vec::new(), now);
            let url = format!("{}/fapi/v2/positionRisk?{query}", self.base_url);
            let resp = self
                .http
                .get(&url)
                .header("X-MBX-APIKEY", &self.api_key)
                .send()
                .await
                .map_err(|e| ExchangeError::Transient(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(ExchangeError::classify(None, &resp.text().await.unwrap_or_default()));
            }
            let rows: Vec<serde_json::Value> = resp.json().await.map_err(|e| ExchangeError::Transient(e.to_string()))?;
            let mut positions = Vec::new();
            for row in rows {
                let amount: f64 = row.get("positionAmt").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0);
                if amount.abs() < f64::EPSILON {
                    continue;
                }
                positions.push(PositionInfo {
                    symbol: row.get("symbol").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                    side: if amount > 0.0 { Side::Long } else { Side::Short },
                    amount: amount.abs(),
                    entry_price: row.get("entryPrice").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0),
                    leverage: row.get("leverage").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(1),
                    mark_price: row.get("markPrice").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0),
                    unrealized_pnl: row.get("unRealizedProfit").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0),
                });
            }
            Ok(positions)
        })
        .await
    }

    pub async fn get_ticker(&self, symbol: &str, priority: Priority) -> Result<Ticker, ExchangeError> {
        let wire = to_wire_symbol(symbol);
        self.dispatch(priority, || async {
            let url = format!("{}/fapi/v1/ticker/bookTicker?symbol={wire}", self.base_url);
            let resp = self.http.get(&url).send().await.map_err(|e| ExchangeError::Transient(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(ExchangeError::classify(None, &resp.text().await.unwrap_or_default()));
            }
            let body: serde_json::Value = resp.json().await.map_err(|e| ExchangeError::Transient(e.to_string()))?;
            let bid = body.get("bidPrice").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0);
            let ask = body.get("askPrice").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0);
            Ok(Ticker { bid, ask, last: (bid + ask) / 2.0, timestamp: chrono::Utc::now().timestamp_millis() })
        })
        .await
    }

    pub async fn get_ohlcv(&self, symbol: &str, tf: Timeframe, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        let wire = to_wire_symbol(symbol);
        let interval = tf.as_wire();
        let limit = limit.min(500);
        self.dispatch(Priority::Normal, || async {
            let url = format!("{}/fapi/v1/klines?symbol={wire}&interval={interval}&limit={limit}", self.base_url);
            let resp = self.http.get(&url).send().await.map_err(|e| ExchangeError::Transient(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(ExchangeError::classify(None, &resp.text().await.unwrap_or_default()));
            }
            let rows: Vec<Vec<serde_json::Value>> = resp.json().await.map_err(|e| ExchangeError::Transient(e.to_string()))?;
            let candles = rows
                .into_iter()
                .filter_map(|row| {
                    let open_time = row.first()?.as_i64()?;
                    let open: f64 = row.get(1)?.as_str()?.parse().ok()?;
                    let high: f64 = row.get(2)?.as_str()?.parse().ok()?;
                    let low: f64 = row.get(3)?.as_str()?.parse().ok()?;
                    let close: f64 = row.get(4)?.as_str()?.parse().ok()?;
                    let volume: f64 = row.get(5)?.as_str()?.parse().ok()?;
                    let close_time = row.get(6)?.as_i64()?;
                    Some(Candle::new(open_time, open, high, low, close, volume, close_time))
                })
                .collect();
            Ok(candles)
        })
        .await
    }

    pub async fn get_orderbook(&self, symbol: &str, depth: usize) -> Result<OrderBookTop, ExchangeError> {
        let wire = to_wire_symbol(symbol);
        let depth = depth.clamp(5, 100);
        self.dispatch(Priority::Normal, || async {
            let url = format!("{}/fapi/v1/depth?symbol={wire}&limit={depth}", self.base_url);
            let resp = self.http.get(&url).send().await.map_err(|e| ExchangeError::Transient(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(ExchangeError::classify(None, &resp.text().await.unwrap_or_default()));
            }
            let body: serde_json::Value = resp.json().await.map_err(|e| ExchangeError::Transient(e.to_string()))?;
            let parse_levels = |key: &str| -> Vec<(f64, f64)> {
                body.get(key)
                    .and_then(|v| v.as_array())
                    .map(|levels| {
                        levels
                            .iter()
                            .filter_map(|lvl| {
                                let arr = lvl.as_array()?;
                                let price: f64 = arr.first()?.as_str()?.parse().ok()?;
                                let qty: f64 = arr.get(1)?.as_str()?.parse().ok()?;
                                Some((price, qty))
                            })
                            .collect()
                    })
                    .unwrap_or_default()
            };
            Ok(OrderBookTop { bids: parse_levels("bids"), asks: parse_levels("asks") })
        })
        .await
    }

    // ── Trading surface ───────────────────────────────────────────────────

    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let wire = to_wire_symbol(symbol);
        self.dispatch(Priority::High, || async {
            let now = chrono::Utc::now().timestamp_millis();
            let query = self.signed_query(
                vec![("symbol".to_string(), wire.clone()), ("leverage".to_string(), leverage.to_string())],
                now,
            );
            let url = format!("{}/fapi/v1/leverage?{query}", self.base_url);
            let resp = self
                .http
                .post(&url)
                .header("X-MBX-APIKEY", &self.api_key)
                .send()
                .await
                .map_err(|e| ExchangeError::Transient(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(ExchangeError::classify(None, &resp.text().await.unwrap_or_default()));
            }
            Ok(())
        })
        .await
    }

    pub async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> Result<(), ExchangeError> {
        let wire = to_wire_symbol(symbol);
        let mode_str = match mode {
            MarginMode::Cross => "CROSSED",
            MarginMode::Isolated => "ISOLATED",
        };
        self.dispatch(Priority::High, || async {
            let now = chrono::Utc::now().timestamp_millis();
            let query = self.signed_query(
                vec![("symbol".to_string(), wire.clone()), ("marginType".to_string(), mode_str.to_string())],
                now,
            );
            let url = format!("{}/fapi/v1/marginType?{query}", self.base_url);
            let resp = self
                .http
                .post(&url)
                .header("X-MBX-APIKEY", &self.api_key)
                .send()
                .await
                .map_err(|e| ExchangeError::Transient(e.to_string()))?;
            if resp.status().is_success() {
                return Ok(());
            }
            let text = resp.text().await.unwrap_or_default();
            let classified = ExchangeError::classify(None, &text);
            if matches!(classified, ExchangeError::ReduceOnlyLeverageConflict) {
                info!(symbol = %symbol, "margin mode already set, treating as success");
                return Ok(());
            }
            Err(classified)
        })
        .await
    }

    /// Create a market order. Reduce-only orders skip the `set_leverage` /
    /// `set_margin_mode` preflight entirely — closing never needs them, and
    /// those calls fail with a 330008-class conflict once all margin is tied
    /// up in the position being closed.
    pub async fn create_market_order(
        &self,
        symbol: &str,
        side: Side,
        amount: f64,
        leverage: u32,
        reduce_only: bool,
    ) -> Result<OrderAck, ExchangeError> {
        if !reduce_only {
            self.set_leverage(symbol, leverage).await?;
        }

        let metadata = self.current_symbol_metadata(symbol);
        let capped_amount = metadata.floor_to_lot(amount.min(metadata.max_amount));
        if capped_amount < metadata.min_amount {
            return Err(ExchangeError::QuantityViolation { requested: amount, cap: metadata.max_amount });
        }

        let wire = to_wire_symbol(symbol);
        let order_side = match side {
            Side::Long => "BUY",
            Side::Short => "SELL",
        };

        self.dispatch(Priority::Critical, || async {
            let now = chrono::Utc::now().timestamp_millis();
            let mut params = vec![
                ("symbol".to_string(), wire.clone()),
                ("side".to_string(), order_side.to_string()),
                ("type".to_string(), "MARKET".to_string()),
                ("quantity".to_string(), capped_amount.to_string()),
            ];
            if reduce_only {
                params.push(("reduceOnly".to_string(), "true".to_string()));
            }
            let query = self.signed_query(params, now);
            let url = format!("{}/fapi/v1/order?{query}", self.base_url);
            let resp = self
                .http
                .post(&url)
                .header("X-MBX-APIKEY", &self.api_key)
                .send()
                .await
                .map_err(|e| ExchangeError::Transient(e.to_string()))?;
            if !resp.status().is_success() {
                let text = resp.text().await.unwrap_or_default();
                let classified = ExchangeError::classify(None, &text);
                if reduce_only && matches!(classified, ExchangeError::NoPositionToClose) {
                    debug!(symbol = %symbol, "no position to close, treating as success-equivalent");
                    return Ok(OrderAck {
                        order_id: "noop".to_string(),
                        symbol: symbol.to_string(),
                        status: "FILLED".to_string(),
                        avg_price: 0.0,
                        executed_qty: 0.0,
                    });
                }
                return Err(classified);
            }
            let body: serde_json::Value = resp.json().await.map_err(|e| ExchangeError::Transient(e.to_string()))?;
            Ok(OrderAck {
                order_id: body.get("orderId").map(|v| v.to_string()).unwrap_or_default(),
                symbol: symbol.to_string(),
                status: body.get("status").and_then(|v| v.as_str()).unwrap_or("NEW").to_string(),
                avg_price: body.get("avgPrice").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0),
                executed_qty: body.get("executedQty").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(capped_amount),
            })
        })
        .await
    }

    pub async fn create_limit_order(
        &self,
        symbol: &str,
        side: Side,
        amount: f64,
        price: f64,
        post_only: bool,
        reduce_only: bool,
    ) -> Result<OrderAck, ExchangeError> {
        let metadata = self.current_symbol_metadata(symbol);
        let capped_amount = metadata.floor_to_lot(amount.min(metadata.max_amount));
        let wire = to_wire_symbol(symbol);
        let order_side = match side {
            Side::Long => "BUY",
            Side::Short => "SELL",
        };
        let tif = if post_only { "GTX" } else { "GTC" };

        self.dispatch(Priority::Critical, || async {
            let now = chrono::Utc::now().timestamp_millis();
            let mut params = vec![
                ("symbol".to_string(), wire.clone()),
                ("side".to_string(), order_side.to_string()),
                ("type".to_string(), "LIMIT".to_string()),
                ("timeInForce".to_string(), tif.to_string()),
                ("quantity".to_string(), capped_amount.to_string()),
                ("price".to_string(), price.to_string()),
            ];
            if reduce_only {
                params.push(("reduceOnly".to_string(), "true".to_string()));
            }
            let query = self.signed_query(params, now);
            let url = format!("{}/fapi/v1/order?{query}", self.base_url);
            let resp = self
                .http
                .post(&url)
                .header("X-MBX-APIKEY", &self.api_key)
                .send()
                .await
                .map_err(|e| ExchangeError::Transient(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(ExchangeError::classify(None, &resp.text().await.unwrap_or_default()));
            }
            let body: serde_json::Value = resp.json().await.map_err(|e| ExchangeError::Transient(e.to_string()))?;
            Ok(OrderAck {
                order_id: body.get("orderId").map(|v| v.to_string()).unwrap_or_default(),
                symbol: symbol.to_string(),
                status: body.get("status").and_then(|v| v.as_str()).unwrap_or("NEW").to_string(),
                avg_price: price,
                executed_qty: 0.0,
            })
        })
        .await
    }

    pub async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<bool, ExchangeError> {
        let wire = to_wire_symbol(symbol);
        let order_id = order_id.to_string();
        self.dispatch(Priority::Critical, || async {
            let now = chrono::Utc::now().timestamp_millis();
            let query = self.signed_query(
                vec![("symbol".to_string(), wire.clone()), ("orderId".to_string(), order_id.clone())],
                now,
            );
            let url = format!("{}/fapi/v1/order?{query}", self.base_url);
            let resp = self
                .http
                .delete(&url)
                .header("X-MBX-APIKEY", &self.api_key)
                .send()
                .await
                .map_err(|e| ExchangeError::Transient(e.to_string()))?;
            Ok(resp.status().is_success())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signing_is_deterministic() {
        let gw = ExchangeGateway::new("https://example.invalid", "key".to_string(), "secret".to_string());
        let sig1 = gw.sign("symbol=BTCUSDT&timestamp=1000");
        let sig2 = gw.sign("symbol=BTCUSDT&timestamp=1000");
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 64);
    }

    #[test]
    fn signed_query_appends_timestamp_window_and_signature() {
        let gw = ExchangeGateway::new("https://example.invalid", "key".to_string(), "secret".to_string());
        let query = gw.signed_query(vec![("symbol".to_string(), "BTCUSDT".to_string())], 1000);
        assert!(query.contains("symbol=BTCUSDT"));
        assert!(query.contains("timestamp=1000"));
        assert!(query.contains("recvWindow=5000"));
        assert!(query.contains("signature="));
    }
}
