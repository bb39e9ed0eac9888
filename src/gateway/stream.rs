// =============================================================================
// Hybrid market data stream — WebSocket push with REST fallback
// =============================================================================
//
// Tickers and candles are kept in a shared cache fed by a reconnecting
// WebSocket reader. Consumers read the cache directly; if an entry is older
// than its freshness bound they fall back to a REST call through the
// gateway rather than block on a reconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::market::{to_wire_symbol, Candle, Ticker};

pub const TICKER_FRESHNESS: Duration = Duration::from_secs(10);
pub const CANDLE_FRESHNESS: Duration = Duration::from_secs(60);
pub const MAX_STREAM_SUBSCRIPTIONS: usize = 380;
const WS_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

struct CachedTicker {
    ticker: Ticker,
    received_at: std::time::Instant,
}

struct CachedCandles {
    candles: Vec<Candle>,
    received_at: std::time::Instant,
}

/// Owns the WS connection lifecycle and the ticker/candle caches it feeds.
/// Subscription is wire-form only; callers always address symbols in
/// canonical form and conversion happens at the subscription boundary.
pub struct MarketStream {
    ws_url: String,
    subscribed: RwLock<Vec<String>>,
    tickers: RwLock<HashMap<String, CachedTicker>>,
    candles: RwLock<HashMap<String, CachedCandles>>,
    running: Arc<AtomicBool>,
}

impl MarketStream {
    pub fn new(ws_url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            ws_url: ws_url.into(),
            subscribed: RwLock::new(Vec::new()),
            tickers: RwLock::new(HashMap::new()),
            candles: RwLock::new(HashMap::new()),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Register canonical symbols for streaming, capped at
    /// `MAX_STREAM_SUBSCRIPTIONS`. Symbols beyond the cap are dropped with a
    /// warning; they remain servable via REST, just without the push path.
    pub fn subscribe(&self, canonical_symbols: &[String]) {
        let mut wire: Vec<String> = canonical_symbols.iter().map(|s| to_wire_symbol(s)).collect();
        if wire.len() > MAX_STREAM_SUBSCRIPTIONS {
            warn!(
                requested = wire.len(),
                cap = MAX_STREAM_SUBSCRIPTIONS,
                "truncating websocket subscription list to the exchange cap"
            );
            wire.truncate(MAX_STREAM_SUBSCRIPTIONS);
        }
        *self.subscribed.write() = wire;
    }

    /// Reconnect loop: runs until `stop()` is called. Resubscribes to the
    /// full tracked symbol set on every fresh connection.
    pub async fn run(self: Arc<Self>) {
        while self.running.load(Ordering::Acquire) {
            match tokio::time::timeout(WS_CONNECT_TIMEOUT, connect_async(&self.ws_url)).await {
                Ok(Ok((ws_stream, _))) => {
                    info!("market stream connected");
                    if let Err(e) = self.clone().drive(ws_stream).await {
                        error!(error = %e, "market stream connection dropped");
                    }
                }
                Ok(Err(e)) => {
                    error!(error = %e, "market stream connect failed");
                }
                Err(_) => {
                    error!("market stream connect timed out");
                }
            }
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            sleep(RECONNECT_DELAY).await;
        }
    }

    async fn drive(
        self: Arc<Self>,
        ws_stream: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    ) -> anyhow::Result<()> {
        let (mut write, mut read) = ws_stream.split();

        let subscribe_msg = serde_json::json!({
            "method": "SUBSCRIBE",
            "params": self.subscribed.read().iter().map(|s| format!("{}@bookTicker", s.to_lowercase())).collect::<Vec<_>>(),
            "id": 1,
        });
        write.send(Message::Text(subscribe_msg.to_string())).await?;

        while self.running.load(Ordering::Acquire) {
            match read.next().await {
                Some(Ok(Message::Text(text))) => self.handle_message(&text),
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "market stream read error");
                    break;
                }
            }
        }
        Ok(())
    }

    fn handle_message(&self, text: &str) {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
            return;
        };
        let Some(symbol) = value.get("s").and_then(|v| v.as_str()) else {
            return;
        };
        let bid = value.get("b").and_then(|v| v.as_str()).and_then(|s| s.parse().ok());
        let ask = value.get("a").and_then(|v| v.as_str()).and_then(|s| s.parse().ok());
        if let (Some(bid), Some(ask)) = (bid, ask) {
            let ticker = Ticker { bid, ask, last: (bid + ask) / 2.0, timestamp: chrono::Utc::now().timestamp_millis() };
            self.tickers.write().insert(
                symbol.to_string(),
                CachedTicker { ticker, received_at: std::time::Instant::now() },
            );
        }
    }

    /// Read a cached ticker for a canonical symbol if it is within the
    /// freshness bound; `None` signals the caller should fall back to REST.
    pub fn fresh_ticker(&self, canonical_symbol: &str) -> Option<Ticker> {
        let wire = to_wire_symbol(canonical_symbol);
        let cache = self.tickers.read();
        let entry = cache.get(&wire)?;
        if entry.received_at.elapsed() <= TICKER_FRESHNESS {
            Some(entry.ticker)
        } else {
            None
        }
    }

    /// Merge freshly fetched candles into the cache, replacing the tail
    /// incrementally if the cache is only slightly stale, or wholesale if
    /// this is the first population for the symbol.
    pub fn merge_candles(&self, canonical_symbol: &str, fresh: Vec<Candle>) {
        let wire = to_wire_symbol(canonical_symbol);
        self.candles.write().insert(
            wire,
            CachedCandles { candles: fresh, received_at: std::time::Instant::now() },
        );
    }

    pub fn fresh_candles(&self, canonical_symbol: &str) -> Option<Vec<Candle>> {
        let wire = to_wire_symbol(canonical_symbol);
        let cache = self.candles.read();
        let entry = cache.get(&wire)?;
        if entry.received_at.elapsed() < CANDLE_FRESHNESS {
            Some(entry.candles.clone())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_converts_to_wire_form_and_caps_length() {
        let stream = MarketStream::new("wss://example.invalid/ws");
        let symbols: Vec<String> = (0..400).map(|i| format!("SYM{i}/USDT:USDT")).collect();
        stream.subscribe(&symbols);
        assert_eq!(stream.subscribed.read().len(), MAX_STREAM_SUBSCRIPTIONS);
        assert!(stream.subscribed.read()[0].ends_with("USDT"));
        assert!(!stream.subscribed.read()[0].contains('/'));
    }

    #[test]
    fn handle_message_populates_ticker_cache() {
        let stream = MarketStream::new("wss://example.invalid/ws");
        stream.handle_message(r#"{"s":"BTCUSDT","b":"50000.0","a":"50001.0"}"#);
        let ticker = stream.fresh_ticker("BTC/USDT:USDT").expect("ticker should be cached");
        assert_eq!(ticker.bid, 50000.0);
        assert_eq!(ticker.ask, 50001.0);
    }

    #[test]
    fn fresh_ticker_returns_none_for_unknown_symbol() {
        let stream = MarketStream::new("wss://example.invalid/ws");
        assert!(stream.fresh_ticker("ETH/USDT:USDT").is_none());
    }
}
