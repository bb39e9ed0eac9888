// =============================================================================
// Signal Fusion — fixed-weight multi-indicator voting
// =============================================================================
//
// Six indicator families vote BUY/SELL/abstain with fixed weights. Net side
// is whichever total is larger; confidence is the normalized margin between
// the two totals. Absent indicators abstain silently rather than voting for
// the opposite side.

use crate::indicators::IndicatorSnapshot;
use crate::types::{Action, Regime};

pub const WEIGHT_TREND: f64 = 1.0;
pub const WEIGHT_MACD: f64 = 1.0;
pub const WEIGHT_RSI: f64 = 0.8;
pub const WEIGHT_STOCHASTIC: f64 = 0.6;
pub const WEIGHT_BOLLINGER: f64 = 0.6;
pub const WEIGHT_VOLUME: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Vote {
    Buy,
    Sell,
    Abstain,
}

#[derive(Debug, Clone)]
pub struct SignalContribution {
    pub family: &'static str,
    pub weight: f64,
    pub vote: &'static str,
}

#[derive(Debug, Clone)]
pub struct FusionResult {
    pub action: Action,
    pub confidence: f64,
    pub buy_score: f64,
    pub sell_score: f64,
    pub reason: String,
    pub contributions: Vec<SignalContribution>,
}

fn trend_vote(snap: &IndicatorSnapshot) -> Vote {
    match (snap.ema_fast, snap.ema_slow, snap.ema_fast_prev, snap.ema_slow_prev) {
        (Some(fast), Some(slow), Some(fast_prev), Some(slow_prev)) => {
            let fast_rising = fast > fast_prev;
            let slow_rising = slow > slow_prev;
            if fast > slow && fast_rising && slow_rising {
                Vote::Buy
            } else if fast < slow && !fast_rising && !slow_rising {
                Vote::Sell
            } else {
                Vote::Abstain
            }
        }
        _ => Vote::Abstain,
    }
}

fn macd_vote(snap: &IndicatorSnapshot) -> Vote {
    match (snap.macd, snap.macd_prev) {
        (Some(cur), Some(prev)) => {
            if cur.histogram > 0.0 && cur.histogram > prev.histogram {
                Vote::Buy
            } else if cur.histogram < 0.0 && cur.histogram < prev.histogram {
                Vote::Sell
            } else {
                Vote::Abstain
            }
        }
        _ => Vote::Abstain,
    }
}

fn rsi_vote(snap: &IndicatorSnapshot) -> Vote {
    match (snap.rsi, snap.rsi_prev) {
        (Some(rsi), Some(prev)) => {
            if prev < 30.0 && rsi >= 30.0 {
                Vote::Buy
            } else if prev > 70.0 && rsi <= 70.0 {
                Vote::Sell
            } else {
                Vote::Abstain
            }
        }
        _ => Vote::Abstain,
    }
}

fn stochastic_vote(snap: &IndicatorSnapshot) -> Vote {
    match snap.stochastic {
        Some(s) if s.k.is_nan() || s.d.is_nan() => Vote::Abstain,
        Some(s) => {
            if s.k < 20.0 && s.k > s.d {
                Vote::Buy
            } else if s.k > 80.0 && s.k < s.d {
                Vote::Sell
            } else {
                Vote::Abstain
            }
        }
        None => Vote::Abstain,
    }
}

fn bollinger_vote(snap: &IndicatorSnapshot) -> Vote {
    match (snap.bollinger.clone(), snap.bollinger_prev.clone()) {
        (Some(bb), Some(bb_prev)) => {
            let width_expanding = bb.width > bb_prev.width;
            let band_range = bb.upper - bb.lower;
            if band_range <= 0.0 {
                return Vote::Abstain;
            }
            let position = (snap.last_close - bb.lower) / band_range;
            if position < 0.25 && width_expanding {
                Vote::Buy
            } else if position > 0.75 {
                Vote::Sell
            } else {
                Vote::Abstain
            }
        }
        _ => Vote::Abstain,
    }
}

fn volume_vote(snap: &IndicatorSnapshot, trend: Vote) -> Vote {
    match snap.volume_ratio {
        Some(ratio) if ratio > 1.5 => trend,
        _ => Vote::Abstain,
    }
}

/// A trend label derived from EMA/MACD alignment on a higher timeframe,
/// used by the multi-timeframe adjustment.
pub fn higher_timeframe_label(snap: &IndicatorSnapshot) -> Vote {
    match trend_vote(snap) {
        Vote::Abstain => macd_vote(snap),
        v => v,
    }
}

/// Minimum fused confidence a regime requires before a signal is actionable.
/// Callers gate on this after any MTF adjustment; `fuse` itself only reports
/// the comparison in `reason`, it does not drop sub-threshold signals.
pub fn confidence_floor(regime: Regime) -> f64 {
    match regime {
        Regime::Trending => 0.65,
        Regime::Ranging => 0.72,
        Regime::Neutral => 0.70,
    }
}

/// Run the weighted-voting fusion over one symbol's indicator snapshot.
pub fn fuse(snap: &IndicatorSnapshot, regime: Regime) -> FusionResult {
    let trend = trend_vote(snap);
    let macd = macd_vote(snap);
    let rsi = rsi_vote(snap);
    let stochastic = stochastic_vote(snap);
    let bollinger = bollinger_vote(snap);
    let volume = volume_vote(snap, trend);

    let votes: [(Vote, f64, &'static str); 6] = [
        (trend, WEIGHT_TREND, "trend"),
        (macd, WEIGHT_MACD, "macd"),
        (rsi, WEIGHT_RSI, "rsi"),
        (stochastic, WEIGHT_STOCHASTIC, "stochastic"),
        (bollinger, WEIGHT_BOLLINGER, "bollinger"),
        (volume, WEIGHT_VOLUME, "volume"),
    ];

    let mut buy_score = 0.0;
    let mut sell_score = 0.0;
    let mut contributions = Vec::with_capacity(6);

    for (vote, weight, name) in votes {
        let label = match vote {
            Vote::Buy => {
                buy_score += weight;
                "buy"
            }
            Vote::Sell => {
                sell_score += weight;
                "sell"
            }
            Vote::Abstain => "abstain",
        };
        contributions.push(SignalContribution {
            family: name,
            weight,
            vote: label,
        });
    }

    let floor = confidence_floor(regime);

    if (buy_score - sell_score).abs() < f64::EPSILON {
        if buy_score == 0.0 && sell_score == 0.0 {
            return FusionResult {
                action: Action::Hold,
                confidence: 0.0,
                buy_score,
                sell_score,
                reason: "no_signals".to_string(),
                contributions,
            };
        }
        return FusionResult {
            action: Action::Hold,
            confidence: 0.0,
            buy_score,
            sell_score,
            reason: "equal_signals: balanced".to_string(),
            contributions,
        };
    }

    let total = buy_score + sell_score;
    let confidence = (buy_score - sell_score).abs() / total;
    let action = if buy_score > sell_score { Action::Buy } else { Action::Sell };

    let reason = if confidence >= floor {
        format!("{action} confidence {confidence:.2} clears {regime} floor {floor:.2}")
    } else {
        format!("{action} confidence {confidence:.2} below {regime} floor {floor:.2}")
    };

    FusionResult {
        action,
        confidence,
        buy_score,
        sell_score,
        reason,
        contributions,
    }
}

/// Apply the multi-timeframe confidence adjustment: alignment boosts
/// confidence up to 1.20x (capped at 1.0), conflict scales both the
/// confidence and the acting threshold by 0.7 so the penalty stays
/// internally consistent.
pub fn apply_mtf_adjustment(result: &mut FusionResult, min_confidence: &mut f64, htf_4h: Vote, htf_1d: Vote) {
    let action_vote = match result.action {
        Action::Buy => Vote::Buy,
        Action::Sell => Vote::Sell,
        Action::Hold => return,
    };

    let aligned = htf_4h == action_vote && htf_1d == action_vote;
    let conflicting = (htf_4h != Vote::Abstain && htf_4h != action_vote)
        || (htf_1d != Vote::Abstain && htf_1d != action_vote);

    if aligned {
        result.confidence = (result.confidence * 1.20).min(1.0);
    } else if conflicting {
        result.confidence *= 0.7;
        *min_confidence *= 0.7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::bollinger::BollingerResult;
    use crate::indicators::macd::MacdResult;
    use crate::indicators::stochastic::StochasticResult;

    fn base_snapshot() -> IndicatorSnapshot {
        IndicatorSnapshot {
            ema_fast: None,
            ema_slow: None,
            ema_fast_prev: None,
            ema_slow_prev: None,
            macd: None,
            macd_prev: None,
            rsi: None,
            rsi_prev: None,
            stochastic: None,
            bollinger: None,
            bollinger_prev: None,
            atr: None,
            adx: None,
            volume_ratio: None,
            vwap: None,
            momentum: None,
            roc: None,
            last_close: 100.0,
        }
    }

    #[test]
    fn no_signals_holds_with_zero_confidence() {
        let snap = base_snapshot();
        let result = fuse(&snap, Regime::Neutral);
        assert_eq!(result.action, Action::Hold);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.reason, "no_signals");
    }

    #[test]
    fn equal_buy_sell_holds_with_balanced_reason() {
        let mut snap = base_snapshot();
        // Trend votes buy (weight 1.0), RSI votes sell (weight 0.8)... use
        // two equal-weight families instead: trend buy vs macd sell.
        snap.ema_fast = Some(110.0);
        snap.ema_slow = Some(100.0);
        snap.ema_fast_prev = Some(108.0);
        snap.ema_slow_prev = Some(99.0);
        snap.macd = Some(MacdResult { line: -1.0, signal: -0.5, histogram: -0.6 });
        snap.macd_prev = Some(MacdResult { line: -0.9, signal: -0.4, histogram: -0.5 });

        let result = fuse(&snap, Regime::Neutral);
        assert_eq!(result.action, Action::Hold);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.reason, "equal_signals: balanced");
    }

    #[test]
    fn strong_buy_alignment_yields_buy_action() {
        let mut snap = base_snapshot();
        snap.ema_fast = Some(110.0);
        snap.ema_slow = Some(100.0);
        snap.ema_fast_prev = Some(108.0);
        snap.ema_slow_prev = Some(99.0);
        snap.macd = Some(MacdResult { line: 1.0, signal: 0.5, histogram: 0.6 });
        snap.macd_prev = Some(MacdResult { line: 0.8, signal: 0.4, histogram: 0.4 });
        snap.rsi = Some(31.0);
        snap.rsi_prev = Some(28.0);

        let result = fuse(&snap, Regime::Trending);
        assert_eq!(result.action, Action::Buy);
        assert!(result.confidence > 0.0);
    }

    #[test]
    fn stochastic_skips_on_nan() {
        let mut snap = base_snapshot();
        snap.stochastic = Some(StochasticResult { k: f64::NAN, d: 50.0 });
        assert_eq!(stochastic_vote(&snap), Vote::Abstain);
    }

    #[test]
    fn bollinger_near_lower_band_expanding_votes_buy() {
        let mut snap = base_snapshot();
        snap.bollinger = Some(BollingerResult { upper: 110.0, middle: 100.0, lower: 90.0, width: 20.0 });
        snap.bollinger_prev = Some(BollingerResult { upper: 108.0, middle: 100.0, lower: 92.0, width: 16.0 });
        snap.last_close = 91.0;
        assert_eq!(bollinger_vote(&snap), Vote::Buy);
    }

    #[test]
    fn mtf_alignment_boosts_confidence() {
        let mut result = FusionResult {
            action: Action::Buy,
            confidence: 0.5,
            buy_score: 1.0,
            sell_score: 0.0,
            reason: String::new(),
            contributions: Vec::new(),
        };
        let mut min_conf = 0.65;
        apply_mtf_adjustment(&mut result, &mut min_conf, Vote::Buy, Vote::Buy);
        assert!((result.confidence - 0.6).abs() < 1e-9);
        assert_eq!(min_conf, 0.65);
    }

    #[test]
    fn mtf_conflict_scales_confidence_and_threshold_together() {
        let mut result = FusionResult {
            action: Action::Buy,
            confidence: 0.8,
            buy_score: 1.0,
            sell_score: 0.0,
            reason: String::new(),
            contributions: Vec::new(),
        };
        let mut min_conf = 0.65;
        apply_mtf_adjustment(&mut result, &mut min_conf, Vote::Sell, Vote::Abstain);
        assert!((result.confidence - 0.56).abs() < 1e-9);
        assert!((min_conf - 0.455).abs() < 1e-9);
    }
}
