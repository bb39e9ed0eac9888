// =============================================================================
// Market scanner — bounded worker-pool fan-out over tradable symbols
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::gateway::Gateway;
use crate::indicators::IndicatorSnapshot;
use crate::market::Timeframe;
use crate::regime::{Regime, RegimeDetector};
use crate::signals::{apply_mtf_adjustment, confidence_floor, confirm, fuse, higher_timeframe_label, FusionResult, MlAdjustment, MlPredictor, Vote};
use crate::types::Action;

pub const DEFAULT_MAX_WORKERS: usize = 8;
pub const DEFAULT_CACHE_DURATION: Duration = Duration::from_secs(300);
const MIN_NOTIONAL_FOR_SCAN: f64 = 1_000_000.0;
const PER_SYMBOL_TIMEOUT: Duration = Duration::from_secs(30);
const BATCH_TIMEOUT: Duration = Duration::from_secs(120);
const TOP_N: usize = 5;
const HTF_LOOKBACK_CANDLES: usize = 200;
const HTF_MIN_CANDLES: usize = 50;

const WEIGHT_CONFIDENCE: f64 = 0.35;
const WEIGHT_VOLUME: f64 = 0.20;
const WEIGHT_MTF: f64 = 0.15;
const WEIGHT_PROXIMITY: f64 = 0.15;
const WEIGHT_RISK_REWARD: f64 = 0.15;
const WEIGHT_VOLATILITY_PENALTY: f64 = 0.20;

#[derive(Debug, Clone)]
pub struct Opportunity {
    pub symbol: String,
    pub action: Action,
    pub confidence: f64,
    pub score: f64,
    pub regime: Regime,
    pub computed_at: Instant,
    /// Percentage price momentum over the lookback window, signed.
    pub momentum_pct: f64,
    pub adx: Option<f64>,
    /// ATR as a percentage of price, used as the leverage volatility tier key.
    pub volatility_pct: Option<f64>,
}

impl Opportunity {
    pub fn is_stale(&self, ttl: Duration) -> bool {
        self.computed_at.elapsed() > ttl
    }
}

/// score = w1*confidence + w2*log(1+volume_ratio) + w3*mtf_alignment
///       + w4*proximity_to_sr + w5*risk_reward_estimate - w6*volatility_penalty
fn score_opportunity(fusion: &FusionResult, snap: &IndicatorSnapshot, risk_reward_estimate: f64, mtf_alignment: f64) -> f64 {
    let volume_ratio = snap.volume_ratio.unwrap_or(1.0).max(0.0);
    let bb_position = snap
        .bollinger
        .as_ref()
        .map(|bb| {
            let width = (bb.upper - bb.lower).max(1e-9);
            1.0 - (2.0 * ((snap.last_close - bb.lower) / width - 0.5)).abs()
        })
        .unwrap_or(0.5);
    let volatility_penalty = snap.atr.map(|atr| (atr / snap.last_close.max(1e-9)).min(1.0)).unwrap_or(0.0);

    WEIGHT_CONFIDENCE * fusion.confidence
        + WEIGHT_VOLUME * (1.0 + volume_ratio).ln()
        + WEIGHT_MTF * mtf_alignment
        + WEIGHT_PROXIMITY * bb_position
        + WEIGHT_RISK_REWARD * risk_reward_estimate.clamp(0.0, 3.0) / 3.0
        - WEIGHT_VOLATILITY_PENALTY * volatility_penalty
}

/// How well the two higher timeframes agree with the primary action: full
/// agreement scores 1.0, a single abstaining timeframe scores 0.65, and any
/// outright conflict drags the score down.
fn mtf_alignment_score(action: Action, htf_4h: Vote, htf_1d: Vote) -> f64 {
    let action_vote = match action {
        Action::Buy => Vote::Buy,
        Action::Sell => Vote::Sell,
        Action::Hold => return 0.5,
    };
    let votes = [htf_4h, htf_1d];
    let aligned = votes.iter().filter(|v| **v == action_vote).count();
    let conflicting = votes.iter().filter(|v| **v != Vote::Abstain && **v != action_vote).count();
    if conflicting > 0 {
        0.2
    } else {
        match aligned {
            2 => 1.0,
            1 => 0.65,
            _ => 0.5,
        }
    }
}

/// Best-effort higher-timeframe trend label. Fetch failure or thin history
/// abstains rather than failing the whole evaluation — MTF confirmation is
/// a confidence adjustment, not a hard requirement.
async fn higher_timeframe_vote(gateway: &Gateway, symbol: &str, tf: Timeframe) -> Vote {
    match gateway.get_ohlcv(symbol, tf, HTF_LOOKBACK_CANDLES).await {
        Ok(candles) if candles.len() >= HTF_MIN_CANDLES => {
            IndicatorSnapshot::compute(&candles).map(|snap| higher_timeframe_label(&snap)).unwrap_or(Vote::Abstain)
        }
        _ => Vote::Abstain,
    }
}

/// Feature vector handed to the optional ML confirmation layer.
fn ml_feature_vector(snap: &IndicatorSnapshot) -> Vec<f64> {
    vec![
        snap.rsi.unwrap_or(50.0),
        snap.macd.map(|m| m.histogram).unwrap_or(0.0),
        snap.adx.unwrap_or(20.0),
        snap.volume_ratio.unwrap_or(1.0),
        snap.momentum.unwrap_or(0.0),
        snap.roc.unwrap_or(0.0),
    ]
}

/// Evaluate a single symbol: fetch candles, compute indicators, fuse a
/// signal, apply MTF and ML confirmation, and score it. Returns `None` for
/// HOLD, insufficient data, sub-floor confidence, or an ML veto — none of
/// those enter the cache.
async fn evaluate_symbol(
    gateway: &Gateway,
    regime_detector: &Arc<RegimeDetector>,
    ml_predictor: &Arc<dyn MlPredictor>,
    symbol: &str,
) -> Option<Opportunity> {
    let candles = gateway.get_ohlcv(symbol, Timeframe::H1, 200).await.ok()?;
    if candles.len() < 50 {
        return None;
    }
    let snapshot = IndicatorSnapshot::compute(&candles)?;
    let regime_state = regime_detector.detect(&candles)?;

    let mut fusion = fuse(&snapshot, regime_state.regime);
    if fusion.action == Action::Hold {
        return None;
    }

    let mut min_confidence = confidence_floor(regime_state.regime);
    let (htf_4h, htf_1d) =
        tokio::join!(higher_timeframe_vote(gateway, symbol, Timeframe::H4), higher_timeframe_vote(gateway, symbol, Timeframe::D1));
    apply_mtf_adjustment(&mut fusion, &mut min_confidence, htf_4h, htf_1d);

    if fusion.confidence < min_confidence {
        return None;
    }

    let features = ml_feature_vector(&snapshot);
    match confirm(ml_predictor.as_ref(), fusion.action, fusion.confidence, &features) {
        MlAdjustment::NotConsulted => {}
        MlAdjustment::Agreed { boosted_confidence } => fusion.confidence = boosted_confidence,
        MlAdjustment::MildDisagreement { reduced_confidence } => fusion.confidence = reduced_confidence,
        MlAdjustment::StrongDisagreement => return None,
    }
    if fusion.confidence < min_confidence {
        return None;
    }

    let mtf_alignment = mtf_alignment_score(fusion.action, htf_4h, htf_1d);
    let risk_reward_estimate = snapshot.atr.map(|atr| (fusion.confidence * 3.0) / (atr / snapshot.last_close.max(1e-9)).max(1e-6)).unwrap_or(1.0).clamp(0.0, 3.0);
    let score = score_opportunity(&fusion, &snapshot, risk_reward_estimate, mtf_alignment);

    fusion.reason = format!("{} score={score:.3}", fusion.reason);

    let momentum_pct = snapshot.momentum.map(|m| m / snapshot.last_close.max(1e-9) * 100.0).unwrap_or(0.0);
    let volatility_pct = snapshot.atr.map(|atr| atr / snapshot.last_close.max(1e-9) * 100.0);

    Some(Opportunity {
        symbol: symbol.to_string(),
        action: fusion.action,
        confidence: fusion.confidence,
        score,
        regime: regime_state.regime,
        computed_at: Instant::now(),
        momentum_pct,
        adx: snapshot.adx,
        volatility_pct,
    })
}

/// TTL'd, single-writer/multi-reader snapshot of the current top
/// opportunities. A full scan cycle replaces the whole vector atomically.
pub struct ScannerCache {
    snapshot: RwLock<(Vec<Opportunity>, Instant)>,
    ttl: Duration,
}

impl ScannerCache {
    pub fn new(ttl: Duration) -> Self {
        Self { snapshot: RwLock::new((Vec::new(), Instant::now())), ttl }
    }

    pub fn replace(&self, opportunities: Vec<Opportunity>) {
        *self.snapshot.write() = (opportunities, Instant::now());
    }

    /// Current opportunities, excluding anything past its own per-entry TTL.
    /// The main task never blocks waiting for a fresher cache; a stale read
    /// just yields fewer (or zero) candidates this cycle.
    pub fn fresh_opportunities(&self) -> Vec<Opportunity> {
        let (opportunities, _) = &*self.snapshot.read();
        opportunities.iter().filter(|o| !o.is_stale(self.ttl)).cloned().collect()
    }

    pub fn is_snapshot_stale(&self) -> bool {
        self.snapshot.read().1.elapsed() > self.ttl
    }
}

pub struct Scanner {
    gateway: Arc<Gateway>,
    regime_detector: Arc<RegimeDetector>,
    ml_predictor: Arc<dyn MlPredictor>,
    pub cache: ScannerCache,
    max_workers: usize,
}

impl Scanner {
    pub fn new(
        gateway: Arc<Gateway>,
        regime_detector: Arc<RegimeDetector>,
        ml_predictor: Arc<dyn MlPredictor>,
        cache_duration: Duration,
        max_workers: usize,
    ) -> Self {
        Self { gateway, regime_detector, ml_predictor, cache: ScannerCache::new(cache_duration), max_workers: max_workers.max(1) }
    }

    /// One full scan cycle: filter tradable symbols by notional, fan out to
    /// a bounded worker pool, collect and rank results, and atomically
    /// replace the cache with the top N.
    pub async fn run_cycle(&self, candidate_symbols: &[String], notional_by_symbol: &HashMap<String, f64>) {
        let tradable: Vec<String> = candidate_symbols
            .iter()
            .filter(|s| notional_by_symbol.get(*s).copied().unwrap_or(0.0) >= MIN_NOTIONAL_FOR_SCAN)
            .cloned()
            .collect();

        if tradable.is_empty() {
            warn!("no symbols passed the notional filter this scan cycle");
            return;
        }

        let cycle = async {
            let mut in_flight = FuturesUnordered::new();
            let mut queued = tradable.into_iter();
            let mut results = Vec::new();

            for _ in 0..self.max_workers {
                if let Some(symbol) = queued.next() {
                    in_flight.push(self.evaluate_with_timeout(symbol));
                }
            }

            while let Some(outcome) = in_flight.next().await {
                if let Some(opportunity) = outcome {
                    results.push(opportunity);
                }
                if let Some(symbol) = queued.next() {
                    in_flight.push(self.evaluate_with_timeout(symbol));
                }
            }
            results
        };

        let mut results = match tokio::time::timeout(BATCH_TIMEOUT, cycle).await {
            Ok(results) => results,
            Err(_) => {
                warn!("scan cycle hit the batch timeout, using partial results");
                Vec::new()
            }
        };

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(TOP_N);
        info!(kept = results.len(), "scan cycle complete");
        self.cache.replace(results);
    }

    async fn evaluate_with_timeout(&self, symbol: String) -> Option<Opportunity> {
        match tokio::time::timeout(PER_SYMBOL_TIMEOUT, evaluate_symbol(&self.gateway, &self.regime_detector, &self.ml_predictor, &symbol)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(symbol = %symbol, "symbol evaluation timed out, skipping");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_fusion(confidence: f64) -> FusionResult {
        FusionResult {
            action: Action::Buy,
            confidence,
            buy_score: 1.0,
            sell_score: 0.0,
            reason: "test".to_string(),
            contributions: Vec::new(),
        }
    }

    fn sample_opportunity(confidence: f64, computed_at: Instant) -> Opportunity {
        Opportunity {
            symbol: "BTC/USDT:USDT".to_string(),
            action: Action::Buy,
            confidence,
            score: 1.0,
            regime: Regime::Trending,
            computed_at,
            momentum_pct: 0.0,
            adx: None,
            volatility_pct: None,
        }
    }

    #[test]
    fn cache_filters_stale_entries() {
        let cache = ScannerCache::new(Duration::from_millis(10));
        cache.replace(vec![sample_opportunity(0.8, Instant::now() - Duration::from_secs(1))]);
        assert!(cache.fresh_opportunities().is_empty());
    }

    #[test]
    fn cache_keeps_fresh_entries() {
        let cache = ScannerCache::new(Duration::from_secs(300));
        cache.replace(vec![sample_opportunity(0.8, Instant::now())]);
        assert_eq!(cache.fresh_opportunities().len(), 1);
    }

    #[test]
    fn score_rewards_higher_confidence() {
        let low = sample_fusion(0.5);
        let high = sample_fusion(0.9);
        let snap = IndicatorSnapshot {
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
        };
        assert!(score_opportunity(&high, &snap, 1.0, 0.5) > score_opportunity(&low, &snap, 1.0, 0.5));
    }

    #[test]
    fn mtf_alignment_score_rewards_full_agreement_over_conflict() {
        let aligned = mtf_alignment_score(Action::Buy, Vote::Buy, Vote::Buy);
        let conflicting = mtf_alignment_score(Action::Buy, Vote::Sell, Vote::Abstain);
        assert!(aligned > conflicting);
    }
}
