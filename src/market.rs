// =============================================================================
// Market data primitives shared by the gateway, indicators, and scanner
// =============================================================================

use serde::{Deserialize, Serialize};

/// One OHLCV bar at a given timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

impl Candle {
    pub fn new(
        open_time: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        close_time: i64,
    ) -> Self {
        Self {
            open_time,
            open,
            high,
            low,
            close,
            volume,
            close_time,
        }
    }
}

/// A supported candle timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    H1,
    H4,
    D1,
}

impl Timeframe {
    pub fn as_wire(self) -> &'static str {
        match self {
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_wire())
    }
}

/// Top-of-book ticker quote.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Ticker {
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    /// UNIX milliseconds.
    pub timestamp: i64,
}

impl Ticker {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

/// Convert the canonical internal symbol form (`BASE/QUOTE:QUOTE`, e.g.
/// `BTC/USDT:USDT`) to the exchange wire form (`BASEQUOTE`, e.g. `BTCUSDT`).
///
/// Symbols that are already in wire form (no `/`) pass through unchanged, so
/// callers may use either representation during migration.
pub fn to_wire_symbol(canonical: &str) -> String {
    match canonical.split_once('/') {
        Some((base, rest)) => {
            let quote = rest.split(':').next().unwrap_or(rest);
            format!("{base}{quote}")
        }
        None => canonical.to_string(),
    }
}
