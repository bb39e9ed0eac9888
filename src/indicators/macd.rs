// =============================================================================
// MACD — Moving Average Convergence Divergence
// =============================================================================
//
// MACD line   = EMA(fast) - EMA(slow)
// Signal line = EMA(signal_period) of the MACD line
// Histogram   = MACD line - Signal line
//
// Standard periods: fast=12, slow=26, signal=9.

use super::ema::calculate_ema;

#[derive(Debug, Clone, Copy)]
pub struct MacdResult {
    pub line: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Compute the full MACD histogram series, aligned so the last element
/// corresponds to the most recent close.
///
/// Returns an empty vec when there is not enough data for the slow EMA plus
/// the signal smoothing.
pub fn calculate_macd_series(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Vec<MacdResult> {
    if fast == 0 || slow == 0 || signal == 0 || fast >= slow {
        return Vec::new();
    }

    let ema_fast = calculate_ema(closes, fast);
    let ema_slow = calculate_ema(closes, slow);
    if ema_fast.is_empty() || ema_slow.is_empty() {
        return Vec::new();
    }

    // ema_fast is longer (starts earlier) than ema_slow by (slow - fast)
    // elements; align both series to the tail shared by both.
    let offset = ema_fast.len() - ema_slow.len();
    let macd_line: Vec<f64> = ema_slow
        .iter()
        .enumerate()
        .map(|(i, slow_v)| ema_fast[i + offset] - slow_v)
        .collect();

    let signal_line = calculate_ema(&macd_line, signal);
    if signal_line.is_empty() {
        return Vec::new();
    }

    let sig_offset = macd_line.len() - signal_line.len();
    (0..signal_line.len())
        .map(|i| {
            let line = macd_line[i + sig_offset];
            let sig = signal_line[i];
            MacdResult {
                line,
                signal: sig,
                histogram: line - sig,
            }
        })
        .collect()
}

/// Most recent MACD reading.
pub fn calculate_macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Option<MacdResult> {
    calculate_macd_series(closes, fast, slow, signal).last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_insufficient_data() {
        let closes = vec![1.0, 2.0, 3.0];
        assert!(calculate_macd(&closes, 12, 26, 9).is_none());
    }

    #[test]
    fn macd_rising_trend_has_positive_histogram() {
        let closes: Vec<f64> = (1..=60).map(|x| x as f64).collect();
        let macd = calculate_macd(&closes, 12, 26, 9).expect("enough data");
        assert!(macd.line > 0.0);
    }

    #[test]
    fn macd_invalid_periods_returns_none() {
        let closes: Vec<f64> = (1..=60).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 26, 12, 9).is_none());
        assert!(calculate_macd(&closes, 0, 26, 9).is_none());
    }
}
