// =============================================================================
// Volume & momentum indicators — volume ratio, VWAP, momentum
// =============================================================================

use crate::market::Candle;

/// Ratio of the most recent bar's volume to the mean volume of the preceding
/// `period` bars (default 20). Values above 1.0 indicate above-average
/// participation.
pub fn calculate_volume_ratio(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }
    let window = &candles[candles.len() - period - 1..candles.len() - 1];
    let mean_volume = window.iter().map(|c| c.volume).sum::<f64>() / period as f64;
    if mean_volume <= 0.0 {
        return None;
    }
    let current = candles.last()?.volume;
    Some(current / mean_volume)
}

/// Volume-weighted average price over the whole candle slice.
pub fn calculate_vwap(candles: &[Candle]) -> Option<f64> {
    if candles.is_empty() {
        return None;
    }
    let mut pv_sum = 0.0;
    let mut v_sum = 0.0;
    for c in candles {
        let typical = (c.high + c.low + c.close) / 3.0;
        pv_sum += typical * c.volume;
        v_sum += c.volume;
    }
    if v_sum <= 0.0 {
        None
    } else {
        Some(pv_sum / v_sum)
    }
}

/// Raw price momentum over `period` bars: `close_now - close_{now-period}`.
pub fn calculate_momentum(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() <= period {
        return None;
    }
    let now = *closes.last()?;
    let then = closes[closes.len() - 1 - period];
    Some(now - then)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(volume: f64, close: f64) -> Candle {
        Candle::new(0, close, close, close, close, volume, 0)
    }

    #[test]
    fn volume_ratio_above_average() {
        let mut candles = vec![candle(100.0, 1.0); 20];
        candles.push(candle(300.0, 1.0));
        let ratio = calculate_volume_ratio(&candles, 20).unwrap();
        assert!((ratio - 3.0).abs() < 1e-9);
    }

    #[test]
    fn volume_ratio_insufficient_data() {
        let candles = vec![candle(100.0, 1.0); 5];
        assert!(calculate_volume_ratio(&candles, 20).is_none());
    }

    #[test]
    fn vwap_constant_price_equals_price() {
        let candles = vec![candle(10.0, 50.0); 5];
        let vwap = calculate_vwap(&candles).unwrap();
        assert!((vwap - 50.0).abs() < 1e-9);
    }

    #[test]
    fn momentum_positive_on_rising_series() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let mom = calculate_momentum(&closes, 5).unwrap();
        assert!((mom - 5.0).abs() < 1e-9);
    }
}
