// =============================================================================
// Stochastic Oscillator (%K / %D)
// =============================================================================
//
// %K = 100 * (close - lowest_low) / (highest_high - lowest_low), over `k_period`
// %D = SMA(%K, d_period)
//
// Standard periods: k=14, d=3, with a further 3-period smoothing of %K itself
// (the "slow stochastic") — this implementation computes the slow variant
// directly since that is what the signal table in the fusion engine expects.

use crate::market::Candle;

#[derive(Debug, Clone, Copy)]
pub struct StochasticResult {
    pub k: f64,
    pub d: f64,
}

fn raw_k_series(candles: &[Candle], k_period: usize) -> Vec<f64> {
    if k_period == 0 || candles.len() < k_period {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(candles.len() - k_period + 1);
    for i in k_period - 1..candles.len() {
        let window = &candles[i + 1 - k_period..=i];
        let highest = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let lowest = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
        let range = highest - lowest;
        let k = if range.abs() < f64::EPSILON {
            50.0
        } else {
            100.0 * (candles[i].close - lowest) / range
        };
        if k.is_finite() {
            out.push(k);
        }
    }
    out
}

/// Compute the most recent slow %K/%D pair, smoothing raw %K with a
/// `k_smooth`-period SMA before deriving %D from the smoothed series.
pub fn calculate_stochastic(
    candles: &[Candle],
    k_period: usize,
    k_smooth: usize,
    d_period: usize,
) -> Option<StochasticResult> {
    let raw_k = raw_k_series(candles, k_period);
    if raw_k.len() < k_smooth.max(1) {
        return None;
    }

    let smoothed_k = sma_series(&raw_k, k_smooth.max(1));
    if smoothed_k.len() < d_period.max(1) {
        return None;
    }

    let d_series = sma_series(&smoothed_k, d_period.max(1));
    let k = *smoothed_k.last()?;
    let d = *d_series.last()?;
    Some(StochasticResult { k, d })
}

fn sma_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }
    (period - 1..values.len())
        .map(|i| values[i + 1 - period..=i].iter().sum::<f64>() / period as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(h: f64, l: f64, c: f64) -> Candle {
        Candle::new(0, (h + l) / 2.0, h, l, c, 1.0, 0)
    }

    #[test]
    fn stochastic_insufficient_data() {
        let candles = vec![candle(10.0, 9.0, 9.5); 3];
        assert!(calculate_stochastic(&candles, 14, 3, 3).is_none());
    }

    #[test]
    fn stochastic_at_highs_is_near_100() {
        let mut candles = Vec::new();
        for i in 0..20 {
            let base = 100.0 + i as f64;
            candles.push(candle(base + 1.0, base - 1.0, base + 1.0));
        }
        let result = calculate_stochastic(&candles, 14, 3, 3).unwrap();
        assert!(result.k > 80.0, "expected %K near highs, got {}", result.k);
    }

    #[test]
    fn stochastic_flat_range_returns_midpoint() {
        let candles = vec![candle(100.0, 100.0, 100.0); 20];
        let result = calculate_stochastic(&candles, 14, 3, 3).unwrap();
        assert!((result.k - 50.0).abs() < 1e-9);
    }
}
