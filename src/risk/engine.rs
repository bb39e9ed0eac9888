// =============================================================================
// Risk engine — leverage, sizing, and the governance breakers that sit above
// every open decision
// =============================================================================

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::risk::kelly::{kelly_risk_fraction, KellyHistory, TradeOutcome};
use crate::types::{Regime, SymbolMetadata};

pub const MIN_LEVERAGE: u32 = 3;
pub const MAX_LEVERAGE: u32 = 20;
pub const DEFAULT_CONSECUTIVE_LOSS_BREAKER: u32 = 5;
pub const DEFAULT_DAILY_TRADE_BREAKER: u32 = 50;

/// Overall risk posture, derived from the governance breakers below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskMode {
    Normal,
    Cautious,
    BreakerTripped,
    Killed,
}

impl std::fmt::Display for RiskMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskMode::Normal => write!(f, "Normal"),
            RiskMode::Cautious => write!(f, "Cautious"),
            RiskMode::BreakerTripped => write!(f, "BreakerTripped"),
            RiskMode::Killed => write!(f, "Killed"),
        }
    }
}

/// Inputs to the 8-factor leverage calculation. Each factor nudges leverage
/// up or down from the baseline before the final clamp to [3, 20].
#[derive(Debug, Clone, Copy)]
pub struct LeverageFactors {
    pub confidence: f64,
    pub momentum: f64,
    pub trend_strength: f64,
    pub regime: Regime,
    pub win_streak: u32,
    pub loss_streak: u32,
    pub recent_win_rate: f64,
    pub drawdown_pct: f64,
}

/// Combine the eight governance factors into a final leverage, clamped to
/// [MIN_LEVERAGE, MAX_LEVERAGE]. Baseline is the midpoint of the allowed
/// range; each factor perturbs it by its documented cap.
pub fn compute_leverage(base: u32, factors: LeverageFactors) -> u32 {
    let mut adjustment = 0.0_f64;

    adjustment += (factors.confidence - 0.7) * 10.0; // up to +-3x
    adjustment += factors.momentum.clamp(-1.0, 1.0) * 2.0; // up to +-2x
    adjustment += factors.trend_strength.clamp(-1.0, 1.0) * 2.0; // up to +-2x
    adjustment += match factors.regime {
        Regime::Trending => 2.0,
        Regime::Ranging => -2.0,
        Regime::Neutral => 0.0,
    };
    adjustment += (factors.win_streak.min(5) as f64 / 5.0) * 3.0;
    adjustment -= (factors.loss_streak.min(5) as f64 / 5.0) * 3.0;
    adjustment += (factors.recent_win_rate - 0.5) * 4.0; // up to +-2x
    adjustment -= (factors.drawdown_pct / 0.20).min(1.0) * 10.0; // up to -10x

    let leveraged = base as f64 + adjustment;
    leveraged.round().clamp(MIN_LEVERAGE as f64, MAX_LEVERAGE as f64) as u32
}

/// Base leverage before the 8-factor adjustment, keyed off ATR-derived
/// volatility (as a percentage of price). Seven tiers spanning the
/// documented 1.5% -> >8% range, 16x down to 3x.
pub fn leverage_base_from_volatility(volatility_pct: f64) -> u32 {
    if volatility_pct <= 1.5 {
        16
    } else if volatility_pct <= 2.5 {
        13
    } else if volatility_pct <= 3.5 {
        11
    } else if volatility_pct <= 4.5 {
        9
    } else if volatility_pct <= 5.5 {
        7
    } else if volatility_pct <= 8.0 {
        5
    } else {
        3
    }
}

/// Normalize ADX into the [-1, 1] range `compute_leverage` expects for trend
/// strength: ADX 30 (strong trend) maps to +1, ADX 15 (weak/no trend) to -1.
pub fn normalize_trend_strength(adx: f64) -> f64 {
    ((adx - 22.5) / 7.5).clamp(-1.0, 1.0)
}

/// Normalize a percentage price-momentum reading into the [-1, 1] range
/// `compute_leverage` expects: +-3% momentum is full-strength, below 0.5%
/// is near neutral.
pub fn normalize_momentum(momentum_pct: f64) -> f64 {
    (momentum_pct / 3.0).clamp(-1.0, 1.0)
}

fn tiered_risk_per_trade(balance: f64) -> f64 {
    if balance < 100.0 {
        0.01
    } else if balance < 1_000.0 {
        0.015
    } else if balance < 10_000.0 {
        0.02
    } else if balance < 100_000.0 {
        0.025
    } else {
        0.03
    }
}

fn confidence_multiplier(confidence: f64) -> f64 {
    if confidence < 0.65 {
        0.5
    } else if confidence < 0.75 {
        0.75
    } else if confidence < 0.85 {
        0.9
    } else {
        1.0
    }
}

/// Compute position size (contracts, already floored to lot and clamped to
/// the symbol's tradable range). `drawdown_multiplier` folds in the
/// governance drawdown haircut on top of the tiered risk-per-trade budget.
pub fn compute_position_size(
    balance: f64,
    entry_price: f64,
    stop_price: f64,
    confidence: f64,
    max_position_notional: f64,
    drawdown_multiplier: f64,
    metadata: &SymbolMetadata,
    risk_per_trade_override: Option<f64>,
) -> f64 {
    if balance <= 0.0 || entry_price <= 0.0 {
        return 0.0;
    }

    let risk_per_trade = risk_per_trade_override.unwrap_or_else(|| tiered_risk_per_trade(balance));
    let risk_budget = balance * risk_per_trade * drawdown_multiplier;

    let price_distance = (entry_price - stop_price).abs();
    let notional = if price_distance > 0.0 {
        risk_budget / (price_distance / entry_price)
    } else {
        max_position_notional
    };

    let sized_notional = (notional * confidence_multiplier(confidence)).min(max_position_notional);
    let amount = sized_notional / entry_price;
    let floored = metadata.floor_to_lot(amount);
    floored.clamp(0.0, metadata.max_amount)
}

/// Drawdown-from-peak haircut applied to the risk budget before sizing.
pub fn drawdown_multiplier(drawdown_pct: f64) -> f64 {
    if drawdown_pct >= 0.20 {
        0.50
    } else if drawdown_pct >= 0.15 {
        0.75
    } else {
        1.0
    }
}

/// Known correlation groupings used by the diversification guard. Symbols
/// not found in any group fall into "others" and share the looser cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolGroup {
    Majors,
    Layer1,
    Layer2,
    DeFi,
    Meme,
    Exchange,
    Others,
}

pub fn symbol_group(canonical_symbol: &str) -> SymbolGroup {
    const MAJORS: &[&str] = &["BTC", "ETH"];
    const LAYER1: &[&str] = &["SOL", "AVAX", "ADA", "DOT", "NEAR", "ATOM", "SUI", "APT", "TON"];
    const LAYER2: &[&str] = &["ARB", "OP", "MATIC", "STRK", "IMX", "ZK"];
    const DEFI: &[&str] = &["UNI", "AAVE", "MKR", "CRV", "LDO", "COMP", "SNX"];
    const MEME: &[&str] = &["DOGE", "SHIB", "PEPE", "WIF", "BONK", "FLOKI"];
    const EXCHANGE: &[&str] = &["BNB", "OKB", "CRO", "KCS", "FTT"];

    let base = canonical_symbol.split('/').next().unwrap_or(canonical_symbol);
    if MAJORS.contains(&base) {
        SymbolGroup::Majors
    } else if LAYER1.contains(&base) {
        SymbolGroup::Layer1
    } else if LAYER2.contains(&base) {
        SymbolGroup::Layer2
    } else if DEFI.contains(&base) {
        SymbolGroup::DeFi
    } else if MEME.contains(&base) {
        SymbolGroup::Meme
    } else if EXCHANGE.contains(&base) {
        SymbolGroup::Exchange
    } else {
        SymbolGroup::Others
    }
}

fn group_cap(group: SymbolGroup) -> usize {
    match group {
        SymbolGroup::Majors => 2,
        SymbolGroup::Layer1 => 2,
        SymbolGroup::Layer2 => 2,
        SymbolGroup::DeFi => 2,
        SymbolGroup::Meme => 1,
        SymbolGroup::Exchange => 2,
        SymbolGroup::Others => 3,
    }
}

/// Whether opening a new position in `symbol` is allowed given the symbols
/// already held open. Duplicate symbols are always refused regardless of
/// group capacity.
pub fn diversification_allows(open_symbols: &[String], candidate_symbol: &str) -> bool {
    if open_symbols.iter().any(|s| s == candidate_symbol) {
        return false;
    }
    let group = symbol_group(candidate_symbol);
    let count_in_group = open_symbols.iter().filter(|s| symbol_group(s) == group).count();
    count_in_group < group_cap(group)
}

struct DailyLossState {
    date: NaiveDate,
    daily_start_balance: f64,
    accumulated_loss: f64,
}

/// Governance state: drawdown tracking, the daily loss accumulator, and the
/// consecutive-loss / trade-count breakers. All mutation happens under one
/// lock; reads of `risk_mode` never block on a network call.
pub struct RiskEngine {
    peak_balance: RwLock<f64>,
    daily_loss: RwLock<Option<DailyLossState>>,
    consecutive_losses: RwLock<u32>,
    trades_today: RwLock<u32>,
    kill_switch: RwLock<bool>,
    kelly_history: RwLock<KellyHistory>,
    consecutive_loss_breaker: u32,
    daily_trade_breaker: u32,
    daily_loss_limit_fraction: f64,
    max_drawdown_pct: f64,
}

impl RiskEngine {
    pub fn new(daily_loss_limit_fraction: f64, max_drawdown_pct: f64) -> Self {
        Self {
            peak_balance: RwLock::new(0.0),
            daily_loss: RwLock::new(None),
            consecutive_losses: RwLock::new(0),
            trades_today: RwLock::new(0),
            kill_switch: RwLock::new(false),
            kelly_history: RwLock::new(KellyHistory::new()),
            consecutive_loss_breaker: DEFAULT_CONSECUTIVE_LOSS_BREAKER,
            daily_trade_breaker: DEFAULT_DAILY_TRADE_BREAKER,
            daily_loss_limit_fraction,
            max_drawdown_pct,
        }
    }

    pub fn arm_kill_switch(&self) {
        warn!("kill switch armed");
        *self.kill_switch.write() = true;
    }

    pub fn kill_switch_armed(&self) -> bool {
        *self.kill_switch.read()
    }

    fn roll_daily_state(&self, now: DateTime<Utc>, current_balance: f64) {
        let mut guard = self.daily_loss.write();
        let today = now.date_naive();
        let needs_roll = match guard.as_ref() {
            Some(state) => state.date != today,
            None => true,
        };
        if needs_roll {
            *guard = Some(DailyLossState { date: today, daily_start_balance: current_balance, accumulated_loss: 0.0 });
        }
    }

    pub fn observe_balance(&self, balance: f64, now: DateTime<Utc>) {
        self.roll_daily_state(now, balance);
        let mut peak = self.peak_balance.write();
        if balance > *peak {
            *peak = balance;
        }
    }

    pub fn drawdown_pct(&self, current_balance: f64) -> f64 {
        let peak = *self.peak_balance.read();
        if peak <= 0.0 {
            return 0.0;
        }
        ((peak - current_balance) / peak).max(0.0)
    }

    /// Record a closed trade's realized PnL against every governance
    /// breaker and the Kelly history, in one place so none of them can
    /// drift out of sync.
    pub fn record_trade_close(&self, pnl_fraction: f64, pnl_absolute: f64, now: DateTime<Utc>) {
        self.kelly_history.write().record(TradeOutcome { pnl_fraction });

        *self.trades_today.write() += 1;

        let mut streak = self.consecutive_losses.write();
        if pnl_fraction < 0.0 {
            *streak += 1;
        } else {
            *streak = 0;
        }
        drop(streak);

        self.roll_daily_state(now, 0.0);
        if let Some(state) = self.daily_loss.write().as_mut() {
            state.accumulated_loss += (-pnl_absolute).max(0.0);
        }
    }

    fn daily_loss_tripped(&self) -> bool {
        match self.daily_loss.read().as_ref() {
            Some(state) if state.daily_start_balance > 0.0 => {
                state.accumulated_loss >= state.daily_start_balance * self.daily_loss_limit_fraction
            }
            _ => false,
        }
    }

    fn consecutive_loss_tripped(&self) -> bool {
        *self.consecutive_losses.read() >= self.consecutive_loss_breaker
    }

    fn trade_count_tripped(&self) -> bool {
        *self.trades_today.read() >= self.daily_trade_breaker
    }

    pub fn risk_mode(&self, current_balance: f64) -> RiskMode {
        if self.kill_switch_armed() {
            return RiskMode::Killed;
        }
        if self.daily_loss_tripped() || self.consecutive_loss_tripped() || self.trade_count_tripped() {
            return RiskMode::BreakerTripped;
        }
        if self.drawdown_pct(current_balance) >= 0.15 {
            return RiskMode::Cautious;
        }
        RiskMode::Normal
    }

    pub fn can_open_new_position(&self, current_balance: f64) -> bool {
        !matches!(self.risk_mode(current_balance), RiskMode::Killed | RiskMode::BreakerTripped)
    }

    pub fn drawdown_exceeds_max(&self, current_balance: f64) -> bool {
        self.drawdown_pct(current_balance) >= self.max_drawdown_pct
    }

    pub fn kelly_override_fraction(&self) -> Option<f64> {
        kelly_risk_fraction(&self.kelly_history.read())
    }

    pub fn win_streak(&self) -> u32 {
        self.kelly_history.read().current_win_streak()
    }

    pub fn loss_streak(&self) -> u32 {
        self.kelly_history.read().current_loss_streak()
    }

    /// Win rate over the last 10 closed trades, for the leverage factor.
    pub fn recent_win_rate(&self) -> f64 {
        self.kelly_history.read().recent_win_rate(10)
    }

    pub fn reset_daily_counters_for_test(&self) {
        *self.trades_today.write() = 0;
        *self.consecutive_losses.write() = 0;
        *self.daily_loss.write() = None;
    }
}

impl Default for RiskEngine {
    fn default() -> Self {
        Self::new(0.10, 0.20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn metadata() -> SymbolMetadata {
        SymbolMetadata::fallback("BTC/USDT:USDT")
    }

    #[test]
    fn leverage_clamped_to_bounds() {
        let aggressive = LeverageFactors {
            confidence: 1.0,
            momentum: 1.0,
            trend_strength: 1.0,
            regime: Regime::Trending,
            win_streak: 10,
            loss_streak: 0,
            recent_win_rate: 1.0,
            drawdown_pct: 0.0,
        };
        assert_eq!(compute_leverage(10, aggressive), MAX_LEVERAGE);

        let defensive = LeverageFactors {
            confidence: 0.0,
            momentum: -1.0,
            trend_strength: -1.0,
            regime: Regime::Ranging,
            win_streak: 0,
            loss_streak: 10,
            recent_win_rate: 0.0,
            drawdown_pct: 0.20,
        };
        assert_eq!(compute_leverage(10, defensive), MIN_LEVERAGE);
    }

    #[test]
    fn position_size_zero_when_balance_zero() {
        let size = compute_position_size(0.0, 100.0, 99.0, 0.8, 10_000.0, 1.0, &metadata(), None);
        assert_eq!(size, 0.0);
    }

    #[test]
    fn position_size_uses_max_notional_when_stop_equals_entry() {
        let size = compute_position_size(10_000.0, 100.0, 100.0, 0.9, 500.0, 1.0, &metadata(), None);
        assert!((size - 5.0).abs() < 1e-6);
    }

    #[test]
    fn diversification_rejects_duplicate_symbol() {
        let open = vec!["BTC/USDT:USDT".to_string()];
        assert!(!diversification_allows(&open, "BTC/USDT:USDT"));
    }

    #[test]
    fn diversification_caps_majors_at_two() {
        let open = vec!["BTC/USDT:USDT".to_string(), "ETH/USDT:USDT".to_string()];
        assert!(!diversification_allows(&open, "BTC/USDT:USDT"));
    }

    #[test]
    fn daily_loss_breaker_trips_at_ten_percent() {
        let engine = RiskEngine::new(0.10, 0.20);
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        engine.observe_balance(10_000.0, now);
        engine.record_trade_close(-0.05, -1_100.0, now);
        assert_eq!(engine.risk_mode(10_000.0), RiskMode::BreakerTripped);
    }

    #[test]
    fn consecutive_loss_breaker_trips_at_default_threshold() {
        let engine = RiskEngine::new(0.10, 0.20);
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        engine.observe_balance(10_000.0, now);
        for _ in 0..DEFAULT_CONSECUTIVE_LOSS_BREAKER {
            engine.record_trade_close(-0.01, -10.0, now);
        }
        assert_eq!(engine.risk_mode(10_000.0), RiskMode::BreakerTripped);
    }

    #[test]
    fn kill_switch_overrides_everything() {
        let engine = RiskEngine::default();
        engine.arm_kill_switch();
        assert_eq!(engine.risk_mode(10_000.0), RiskMode::Killed);
        assert!(!engine.can_open_new_position(10_000.0));
    }
}
