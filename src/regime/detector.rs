// =============================================================================
// Market Regime Detector
// =============================================================================
//
// Classifies the current market into one of three regimes from ADX and
// Bollinger Band Width alone:
//
//   1. TRENDING — ADX > 25 AND BBW > 3.0 (directional move with expansion)
//   2. RANGING  — ADX < 20 AND BBW < 2.0 (sideways compression)
//   3. NEUTRAL  — anything in between
//
// The detector caches the latest state behind a lock so repeated reads don't
// recompute, and tracks how long the current regime has persisted.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::indicators::adx::calculate_adx;
use crate::indicators::bollinger::calculate_bollinger;
use crate::market::Candle;
use crate::types::Regime;

/// Complete snapshot of the detected regime plus contributing metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeState {
    pub regime: Regime,
    pub adx: f64,
    pub bbw: f64,
    pub confidence: f64,
    pub regime_age_secs: f64,
}

impl Regime {
    /// Recommended max position sizing multiplier for this regime, used as
    /// an input to the leverage/sizing calculation in the risk engine.
    pub fn position_size_multiplier(self) -> f64 {
        match self {
            Regime::Trending => 1.0,
            Regime::Ranging => 0.6,
            Regime::Neutral => 0.8,
        }
    }
}

/// Thread-safe regime detector that caches the latest regime state.
pub struct RegimeDetector {
    state: RwLock<Option<RegimeState>>,
    last_change_time: RwLock<Instant>,
}

impl RegimeDetector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(None),
            last_change_time: RwLock::new(Instant::now()),
        })
    }

    /// Run regime detection on the provided candles.
    pub fn detect(&self, candles: &[Candle]) -> Option<RegimeState> {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let adx_value = calculate_adx(candles, 14).unwrap_or(0.0);
        let bb_result = calculate_bollinger(&closes, 20, 2.0)?;
        let bbw_value = bb_result.width;

        let (regime, confidence) = classify(adx_value, bbw_value);

        let now = Instant::now();
        let prev_regime = self.state.read().as_ref().map(|s| s.regime);
        if prev_regime != Some(regime) {
            *self.last_change_time.write() = now;
        }
        let regime_age_secs = now.duration_since(*self.last_change_time.read()).as_secs_f64();

        let new_state = RegimeState {
            regime,
            adx: adx_value,
            bbw: bbw_value,
            confidence,
            regime_age_secs,
        };

        debug!(
            regime = %regime,
            adx = format!("{:.2}", adx_value),
            bbw = format!("{:.2}", bbw_value),
            confidence = format!("{:.2}", confidence),
            age_secs = format!("{:.1}", regime_age_secs),
            "regime detected"
        );

        *self.state.write() = Some(new_state.clone());
        Some(new_state)
    }

    /// Return the most recently detected regime state without recomputing.
    pub fn current_regime(&self) -> Option<RegimeState> {
        self.state.read().clone()
    }
}

impl Default for RegimeDetector {
    fn default() -> Self {
        Self {
            state: RwLock::new(None),
            last_change_time: RwLock::new(Instant::now()),
        }
    }
}

/// Determine the regime and a confidence score from ADX and BB width.
fn classify(adx: f64, bbw: f64) -> (Regime, f64) {
    if adx > 25.0 && bbw > 3.0 {
        let adx_conf = remap(adx, 25.0, 50.0, 0.55, 1.0);
        let bbw_conf = remap(bbw, 3.0, 8.0, 0.55, 1.0);
        return (Regime::Trending, (adx_conf + bbw_conf) / 2.0);
    }

    if adx < 20.0 && bbw < 2.0 {
        let adx_conf = remap(adx, 20.0, 5.0, 0.55, 1.0);
        let bbw_conf = remap(bbw, 2.0, 0.5, 0.55, 1.0);
        return (Regime::Ranging, (adx_conf + bbw_conf) / 2.0);
    }

    (Regime::Neutral, 0.40)
}

fn remap(value: f64, in_lo: f64, in_hi: f64, out_lo: f64, out_hi: f64) -> f64 {
    let t = if (in_hi - in_lo).abs() < f64::EPSILON {
        0.5
    } else {
        (value - in_lo) / (in_hi - in_lo)
    };
    let clamped = t.clamp(0.0, 1.0);
    out_lo + clamped * (out_hi - out_lo)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_trending_on_strong_adx_and_wide_bands() {
        let (regime, conf) = classify(35.0, 5.0);
        assert_eq!(regime, Regime::Trending);
        assert!(conf > 0.0);
    }

    #[test]
    fn classify_ranging_on_weak_adx_and_tight_bands() {
        let (regime, _) = classify(12.0, 1.0);
        assert_eq!(regime, Regime::Ranging);
    }

    #[test]
    fn classify_neutral_when_ambiguous() {
        let (regime, conf) = classify(22.0, 2.5);
        assert_eq!(regime, Regime::Neutral);
        assert!((conf - 0.40).abs() < 1e-10);
    }

    #[test]
    fn remap_clamps_outside_range() {
        assert!((remap(2.0, 0.0, 1.0, 0.0, 10.0) - 10.0).abs() < 1e-10);
        assert!((remap(-1.0, 0.0, 1.0, 0.0, 10.0) - 0.0).abs() < 1e-10);
    }

    #[test]
    fn position_size_multiplier_favors_trending() {
        assert!(Regime::Trending.position_size_multiplier() > Regime::Ranging.position_size_multiplier());
    }
}
