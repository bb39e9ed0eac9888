// =============================================================================
// Adaptive fractional Kelly — the only Kelly implementation in the engine
// =============================================================================

use std::collections::VecDeque;

const MIN_OUTCOMES: usize = 20;
const HISTORY_CAP: usize = 200;
const FRACTION_FLOOR: f64 = 0.4;
const FRACTION_CEIL: f64 = 0.65;
const LOSS_STREAK_PENALTY: f64 = 0.7;
const WIN_STREAK_BOOST: f64 = 1.1;
const FINAL_FLOOR: f64 = 0.005;
const FINAL_CEIL: f64 = 0.035;

#[derive(Debug, Clone, Copy)]
pub struct TradeOutcome {
    /// Realized PnL as a fraction of risked capital; positive is a win.
    pub pnl_fraction: f64,
}

/// Rolling trade history feeding the Kelly sizing override. Bounded so
/// ancient trades don't keep influencing current sizing forever.
#[derive(Debug, Default)]
pub struct KellyHistory {
    outcomes: VecDeque<TradeOutcome>,
}

impl KellyHistory {
    pub fn new() -> Self {
        Self { outcomes: VecDeque::new() }
    }

    pub fn record(&mut self, outcome: TradeOutcome) {
        self.outcomes.push_back(outcome);
        if self.outcomes.len() > HISTORY_CAP {
            self.outcomes.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    fn win_rate(&self) -> f64 {
        let wins = self.outcomes.iter().filter(|o| o.pnl_fraction > 0.0).count();
        wins as f64 / self.outcomes.len() as f64
    }

    fn avg_win(&self) -> f64 {
        let wins: Vec<f64> = self.outcomes.iter().map(|o| o.pnl_fraction).filter(|p| *p > 0.0).collect();
        if wins.is_empty() {
            return 0.0;
        }
        wins.iter().sum::<f64>() / wins.len() as f64
    }

    fn avg_loss(&self) -> f64 {
        let losses: Vec<f64> = self.outcomes.iter().map(|o| o.pnl_fraction.abs()).zip(self.outcomes.iter()).filter(|(_, o)| o.pnl_fraction < 0.0).map(|(l, _)| l).collect();
        if losses.is_empty() {
            return 0.0;
        }
        losses.iter().sum::<f64>() / losses.len() as f64
    }

    /// How consistent recent outcomes are, in [0, 1]. A tighter spread of
    /// outcomes around their mean scales the Kelly fraction toward the
    /// aggressive end of its allowed range.
    fn consistency_score(&self) -> f64 {
        let values: Vec<f64> = self.outcomes.iter().map(|o| o.pnl_fraction).collect();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
        let stddev = variance.sqrt();
        if mean.abs() < 1e-9 {
            return 0.5;
        }
        let coefficient_of_variation = stddev / mean.abs();
        (1.0 - coefficient_of_variation).clamp(0.0, 1.0)
    }

    pub fn current_loss_streak(&self) -> u32 {
        self.outcomes.iter().rev().take_while(|o| o.pnl_fraction < 0.0).count() as u32
    }

    pub fn current_win_streak(&self) -> u32 {
        self.outcomes.iter().rev().take_while(|o| o.pnl_fraction > 0.0).count() as u32
    }

    /// Win rate over the last `n` outcomes (fewer if history is shorter).
    /// Returns 0.5 with no history, matching a neutral leverage factor.
    pub fn recent_win_rate(&self, n: usize) -> f64 {
        if self.outcomes.is_empty() {
            return 0.5;
        }
        let window: Vec<&TradeOutcome> = self.outcomes.iter().rev().take(n).collect();
        let wins = window.iter().filter(|o| o.pnl_fraction > 0.0).count();
        wins as f64 / window.len() as f64
    }
}

/// Compute the Kelly-adjusted risk-per-trade fraction, or `None` if there
/// isn't enough history yet for the estimate to be trustworthy. The caller
/// falls back to the tiered `risk_per_trade` default in that case.
pub fn kelly_risk_fraction(history: &KellyHistory) -> Option<f64> {
    if history.len() < MIN_OUTCOMES {
        return None;
    }

    let p = history.win_rate();
    let w = history.avg_win();
    let l = history.avg_loss();
    if l <= 0.0 {
        return None;
    }

    let kelly_k = (p * w - (1.0 - p) * l) / l;
    if kelly_k <= 0.0 {
        return Some(FINAL_FLOOR);
    }

    let consistency = history.consistency_score();
    let fraction = FRACTION_FLOOR + (FRACTION_CEIL - FRACTION_FLOOR) * consistency;
    let mut scaled = kelly_k * fraction;

    if history.current_loss_streak() >= 3 {
        scaled *= LOSS_STREAK_PENALTY;
    }
    if history.current_win_streak() >= 5 {
        scaled = (scaled * WIN_STREAK_BOOST).min(scaled.abs() * WIN_STREAK_BOOST.max(1.0));
    }

    Some(scaled.clamp(FINAL_FLOOR, FINAL_CEIL))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history_of(outcomes: &[f64]) -> KellyHistory {
        let mut history = KellyHistory::new();
        for pnl in outcomes {
            history.record(TradeOutcome { pnl_fraction: *pnl });
        }
        history
    }

    #[test]
    fn insufficient_history_returns_none() {
        let history = history_of(&[0.02; 5]);
        assert!(kelly_risk_fraction(&history).is_none());
    }

    #[test]
    fn profitable_history_yields_fraction_in_final_bounds() {
        let mut outcomes = Vec::new();
        for _ in 0..15 {
            outcomes.push(0.03);
        }
        for _ in 0..10 {
            outcomes.push(-0.015);
        }
        let history = history_of(&outcomes);
        let fraction = kelly_risk_fraction(&history).expect("enough history");
        assert!((FINAL_FLOOR..=FINAL_CEIL).contains(&fraction));
    }

    #[test]
    fn loss_streak_penalizes_fraction() {
        let mut losing = vec![0.03; 17];
        losing.extend([-0.02, -0.02, -0.02]);
        let history = history_of(&losing);
        assert_eq!(history.current_loss_streak(), 3);
    }
}
