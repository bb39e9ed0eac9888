// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the core technical indicators used
// by the trading engine. Every public function returns `Option<T>` (or an
// empty `Vec` for series) so callers are forced to handle insufficient-data
// and numerical-edge-case scenarios. None of these functions perform I/O.

pub mod adx;
pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod roc;
pub mod rsi;
pub mod stochastic;
pub mod volume;

use crate::market::Candle;

/// Everything the signal fusion engine needs for one symbol/timeframe,
/// computed once per cycle and passed by reference to the fusion rules.
#[derive(Debug, Clone)]
pub struct IndicatorSnapshot {
    pub ema_fast: Option<f64>,
    pub ema_slow: Option<f64>,
    pub ema_fast_prev: Option<f64>,
    pub ema_slow_prev: Option<f64>,
    pub macd: Option<macd::MacdResult>,
    pub macd_prev: Option<macd::MacdResult>,
    pub rsi: Option<f64>,
    pub rsi_prev: Option<f64>,
    pub stochastic: Option<stochastic::StochasticResult>,
    pub bollinger: Option<bollinger::BollingerResult>,
    pub bollinger_prev: Option<bollinger::BollingerResult>,
    pub atr: Option<f64>,
    pub adx: Option<f64>,
    pub volume_ratio: Option<f64>,
    pub vwap: Option<f64>,
    pub momentum: Option<f64>,
    pub roc: Option<f64>,
    pub last_close: f64,
}

impl IndicatorSnapshot {
    /// Compute the full snapshot from a candle window. Returns `None` if
    /// there are fewer than 50 candles, per the spec's data-quality floor.
    pub fn compute(candles: &[Candle]) -> Option<Self> {
        if candles.len() < 50 {
            return None;
        }
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

        let ema9 = ema::calculate_ema(&closes, 9);
        let ema21 = ema::calculate_ema(&closes, 21);
        let macd_series = macd::calculate_macd_series(&closes, 12, 26, 9);
        let rsi_series = rsi::calculate_rsi(&closes, 14);
        let bb = bollinger::calculate_bollinger(&closes, 20, 2.0);
        let bb_prev = bollinger::calculate_bollinger(&closes[..closes.len() - 1], 20, 2.0);

        Some(Self {
            ema_fast: ema9.last().copied(),
            ema_slow: ema21.last().copied(),
            ema_fast_prev: nth_from_end(&ema9, 1),
            ema_slow_prev: nth_from_end(&ema21, 1),
            macd: macd_series.last().copied(),
            macd_prev: nth_from_end(&macd_series, 1),
            rsi: rsi_series.last().copied(),
            rsi_prev: nth_from_end(&rsi_series, 1),
            stochastic: stochastic::calculate_stochastic(candles, 14, 3, 3),
            bollinger: bb,
            bollinger_prev: bb_prev,
            atr: atr::calculate_atr(candles, 14),
            adx: adx::calculate_adx(candles, 14),
            volume_ratio: volume::calculate_volume_ratio(candles, 20),
            vwap: volume::calculate_vwap(candles),
            momentum: volume::calculate_momentum(&closes, 10),
            roc: roc::current_roc(&closes, 14),
            last_close: *closes.last().unwrap(),
        })
    }
}

fn nth_from_end<T: Copy>(series: &[T], n: usize) -> Option<T> {
    if series.len() > n {
        series.get(series.len() - 1 - n).copied()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + i as f64 * 0.5;
                Candle::new(i as i64 * 3_600_000, base, base + 1.0, base - 1.0, base + 0.2, 10.0 + i as f64, 0)
            })
            .collect()
    }

    #[test]
    fn snapshot_requires_fifty_candles() {
        assert!(IndicatorSnapshot::compute(&synthetic_candles(30)).is_none());
    }

    #[test]
    fn snapshot_computes_with_enough_candles() {
        let snap = IndicatorSnapshot::compute(&synthetic_candles(80)).unwrap();
        assert!(snap.ema_fast.is_some());
        assert!(snap.adx.is_some());
        assert!(snap.bollinger.is_some());
    }
}
