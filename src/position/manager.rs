// =============================================================================
// Position manager — open/update/close lifecycle and the exit-check cascade
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::gateway::{ExchangeError, Gateway, Priority};
use crate::position::{ExitReason, Position};
use crate::types::{Regime, Side, SymbolMetadata};

const BREAKEVEN_TRIGGER: f64 = 0.008;
const TRAILING_BASE_DISTANCE: f64 = 0.01;
const TRAILING_MIN_DISTANCE: f64 = 0.01;
const TRAILING_MAX_DISTANCE: f64 = 0.06;
const TP_EXTENSION_FREEZE_PROGRESS: f64 = 0.70;
const TP_TOLERANCE: f64 = 1e-5;
const TIME_EXIT_MIN_AGE_HOURS: i64 = 48;
const TIME_EXIT_HARD_CAP_HOURS: i64 = 72;
const TIME_EXIT_PNL_BAND: f64 = 0.02;

const PCT_PARTIAL_THRESHOLDS: [f64; 3] = [0.015, 0.03, 0.05];
const PCT_PARTIAL_FRACTIONS: [f64; 3] = [0.30, 0.30, 0.20];
const ATR_PARTIAL_MULTIPLES: [f64; 3] = [1.0, 2.0, 3.0];
const ATR_PARTIAL_FRACTIONS: [f64; 3] = [0.25, 0.25, 0.50];

/// Move the stop to breakeven once profit clears the trigger. Only ever
/// tightens the stop — never loosens it.
pub fn apply_breakeven(position: &mut Position, current_price: f64) {
    if position.breakeven_armed {
        return;
    }
    if position.pnl_fraction(current_price) > BREAKEVEN_TRIGGER {
        let breakeven_stop = position.entry_price;
        let tighter = match position.side {
            Side::Long => breakeven_stop > position.stop_loss,
            Side::Short => breakeven_stop < position.stop_loss,
        };
        if tighter {
            position.stop_loss = breakeven_stop;
        }
        position.breakeven_armed = true;
    }
}

/// Adaptive trailing-stop distance, widened in high realized volatility and
/// tightened once profit is large, clamped to [1%, 6%].
fn trailing_distance(pnl_fraction: f64, realized_vol: f64) -> f64 {
    let mut distance = TRAILING_BASE_DISTANCE;
    if realized_vol > 0.05 {
        distance *= 2.0;
    }
    if pnl_fraction > 0.20 {
        distance *= 0.8;
    }
    distance.clamp(TRAILING_MIN_DISTANCE, TRAILING_MAX_DISTANCE)
}

/// Advance the trailing stop. Monotone: a candidate that would loosen the
/// stop relative to its current value is rejected. Prefers the ATR
/// Chandelier level over the pct-distance level when both are tighter-or-
/// equal comparisons allow picking the tighter of the two.
pub fn apply_trailing_stop(position: &mut Position, current_price: f64, realized_vol: f64, atr: Option<f64>, chandelier_k: f64) {
    if current_price > position.highest_price {
        position.highest_price = current_price;
    }
    if current_price < position.lowest_price {
        position.lowest_price = current_price;
    }

    let pnl = position.pnl_fraction(current_price);
    if pnl <= 0.0 {
        return;
    }
    position.trailing_active = true;

    let pct_distance = trailing_distance(pnl, realized_vol);
    let pct_candidate = match position.side {
        Side::Long => position.highest_price * (1.0 - pct_distance),
        Side::Short => position.lowest_price * (1.0 + pct_distance),
    };

    let chandelier_candidate = atr.map(|atr_value| match position.side {
        Side::Long => position.highest_price - chandelier_k * atr_value,
        Side::Short => position.lowest_price + chandelier_k * atr_value,
    });

    let candidate = match (position.side, chandelier_candidate) {
        (Side::Long, Some(chandelier)) => pct_candidate.max(chandelier),
        (Side::Short, Some(chandelier)) => pct_candidate.min(chandelier),
        (_, None) => pct_candidate,
    };

    let tighter = match position.side {
        Side::Long => candidate > position.stop_loss,
        Side::Short => candidate < position.stop_loss,
    };
    if tighter {
        position.stop_loss = candidate;
    }
}

/// Extend take-profit toward a new candidate only while progress toward the
/// original target is below the freeze threshold, and only if the move
/// doesn't increase the remaining distance.
pub fn apply_tp_extension(position: &mut Position, current_price: f64, candidate_tp: f64) {
    if position.progress_to_initial_tp(current_price) >= TP_EXTENSION_FREEZE_PROGRESS {
        return;
    }
    let extends_further = match position.side {
        Side::Long => candidate_tp > position.take_profit,
        Side::Short => candidate_tp < position.take_profit,
    };
    if extends_further {
        position.take_profit = candidate_tp;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PartialExit {
    pub threshold_index: u32,
    pub fraction_of_remaining: f64,
    pub closes_remainder: bool,
}

/// Next partial scale-out this position has crossed but not yet taken, if
/// any. ATR-based thresholds are preferred when entry ATR is known; the
/// final ATR tranche distributes 100% of the original size and therefore
/// closes the position outright.
pub fn next_partial_exit(position: &Position, current_price: f64) -> Option<PartialExit> {
    let next_index = position.partial_exits_taken;
    if next_index >= 3 {
        return None;
    }
    let pnl = position.pnl_fraction(current_price);

    if let Some(atr) = position.atr_at_entry.filter(|a| *a > 0.0) {
        let distance = (current_price - position.entry_price).abs();
        let threshold_distance = ATR_PARTIAL_MULTIPLES[next_index as usize] * atr;
        if distance >= threshold_distance && pnl > 0.0 {
            return Some(PartialExit {
                threshold_index: next_index,
                fraction_of_remaining: ATR_PARTIAL_FRACTIONS[next_index as usize],
                closes_remainder: next_index == 2,
            });
        }
        return None;
    }

    if pnl >= PCT_PARTIAL_THRESHOLDS[next_index as usize] {
        return Some(PartialExit {
            threshold_index: next_index,
            fraction_of_remaining: PCT_PARTIAL_FRACTIONS[next_index as usize],
            closes_remainder: false,
        });
    }
    None
}

fn emergency_stop_threshold(regime: Regime) -> f64 {
    match regime {
        Regime::Trending => -0.40,
        Regime::Neutral => -0.25,
        Regime::Ranging => -0.15,
    }
}

/// Strict-priority exit check for a full close. Returns the first reason
/// that matches; callers never need to check more than one.
pub fn check_exit(position: &Position, current_price: f64, kill_switch_armed: bool, now: DateTime<Utc>) -> Option<ExitReason> {
    if kill_switch_armed {
        return Some(ExitReason::KillSwitch);
    }

    let leveraged_roi = position.leveraged_roi(current_price);
    if leveraged_roi <= emergency_stop_threshold(position.regime_at_entry) {
        return Some(ExitReason::EmergencyStop);
    }

    let age = now.signed_duration_since(position.opened_at);
    let pnl = position.pnl_fraction(current_price);
    if age.num_hours() >= TIME_EXIT_HARD_CAP_HOURS {
        return Some(ExitReason::TimeExitStagnant);
    }
    if age.num_hours() >= TIME_EXIT_MIN_AGE_HOURS && pnl.abs() < TIME_EXIT_PNL_BAND {
        return Some(ExitReason::TimeExitStagnant);
    }

    if let Some(partial) = next_partial_exit(position, current_price) {
        if partial.closes_remainder {
            return Some(ExitReason::AtrTarget);
        }
    }

    let stop_hit = match position.side {
        Side::Long => current_price <= position.stop_loss,
        Side::Short => current_price >= position.stop_loss,
    };
    if stop_hit {
        return Some(ExitReason::StopLoss);
    }

    let tp_target = position.take_profit * (1.0 - TP_TOLERANCE * position.side.direction());
    let tp_hit = match position.side {
        Side::Long => current_price >= tp_target,
        Side::Short => current_price <= tp_target,
    };
    if tp_hit {
        return Some(ExitReason::TakeProfit);
    }

    None
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ClosedPositionRecord {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub leveraged_roi: f64,
    pub reason: String,
    pub closed_at: DateTime<Utc>,
}

/// Owns every open position behind a per-symbol lock, so concurrent monitor
/// and main-task access never interleaves mutations to the same position.
pub struct PositionManager {
    gateway: Arc<Gateway>,
    positions: RwLock<HashMap<String, Mutex<Position>>>,
    closed: RwLock<std::collections::VecDeque<ClosedPositionRecord>>,
}

const CLOSED_HISTORY_CAP: usize = 1000;

impl PositionManager {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway, positions: RwLock::new(HashMap::new()), closed: RwLock::new(std::collections::VecDeque::new()) }
    }

    pub fn open_positions_snapshot(&self) -> Vec<Position> {
        self.positions.read().values().map(|p| p.lock().clone()).collect()
    }

    pub fn get_open_positions(&self) -> Vec<Position> {
        self.open_positions_snapshot()
    }

    pub fn get_closed_positions(&self, limit: usize) -> Vec<ClosedPositionRecord> {
        self.closed.read().iter().rev().take(limit).cloned().collect()
    }

    pub fn symbol_count(&self) -> usize {
        self.positions.read().len()
    }

    pub fn has_position(&self, symbol: &str) -> bool {
        self.positions.read().contains_key(symbol)
    }

    /// Open a new position. Validates a nonzero amount and a stop on the
    /// correct side of entry before ever touching the network.
    pub async fn open(
        &self,
        symbol: &str,
        side: Side,
        amount: f64,
        leverage: u32,
        stop_loss: f64,
        take_profit: f64,
        regime: Regime,
        atr: Option<f64>,
        _metadata: &SymbolMetadata,
    ) -> anyhow::Result<Position> {
        anyhow::ensure!(amount > 0.0, "position amount must be positive");
        let stop_on_correct_side = match side {
            Side::Long => stop_loss < 0.0 || stop_loss < take_profit,
            Side::Short => stop_loss > 0.0 && stop_loss > take_profit,
        };
        anyhow::ensure!(stop_on_correct_side, "stop_loss must sit on the losing side of take_profit");
        anyhow::ensure!(!self.has_position(symbol), "a position for {symbol} is already open");

        let ack = self.gateway.rest.create_market_order(symbol, side, amount, leverage, false).await?;
        let now = Utc::now();
        let entry_price = if ack.avg_price > 0.0 { ack.avg_price } else { self.gateway.get_ticker(symbol, Priority::Critical).await?.mid() };

        let position = Position::new(symbol.to_string(), side, ack.executed_qty.max(amount), entry_price, leverage, stop_loss, take_profit, regime, atr, now);
        self.positions.write().insert(symbol.to_string(), Mutex::new(position.clone()));
        info!(symbol, side = %side, entry_price, leverage, "position opened");
        Ok(position)
    }

    /// Run one update pass for a single symbol's position: refresh price,
    /// advance breakeven/trailing/TP-extension, check for a partial or full
    /// exit. Returns the exit reason if the position was fully closed.
    pub async fn update_cycle(&self, symbol: &str, chandelier_k: f64, realized_vol: f64, kill_switch_armed: bool) -> anyhow::Result<Option<ExitReason>> {
        let ticker = match self.gateway.get_ticker(symbol, Priority::High).await {
            Ok(ticker) => ticker,
            Err(e) => {
                // Never substitute a stale or fabricated price for a live
                // read failure; skip this cycle and retry on the next pass.
                warn!(symbol, error = %e, "ticker read failed during position update, skipping cycle");
                return Ok(None);
            }
        };
        let current_price = ticker.mid();
        let now = Utc::now();

        let (partial, exit_reason, side, leverage) = {
            let positions = self.positions.read();
            let Some(locked) = positions.get(symbol) else {
                return Ok(None);
            };
            let mut position = locked.lock();

            apply_breakeven(&mut position, current_price);
            let atr = position.atr_at_entry;
            apply_trailing_stop(&mut position, current_price, realized_vol, atr, chandelier_k);
            position.last_update = now;

            let partial = next_partial_exit(&position, current_price);
            let reason = check_exit(&position, current_price, kill_switch_armed, now);
            (partial, reason, position.side, position.leverage)
        };

        if let Some(partial) = partial {
            if !partial.closes_remainder {
                self.execute_partial_exit(symbol, side, leverage, partial).await;
            }
        }

        if let Some(reason) = exit_reason {
            self.close(symbol, reason).await?;
        }
        Ok(exit_reason)
    }

    /// Submit a reduce-only CRITICAL market order for one partial scale-out
    /// tranche, then shrink the locally tracked amount only once the
    /// exchange confirms the fill. Never holds the position lock across the
    /// network call.
    async fn execute_partial_exit(&self, symbol: &str, side: Side, leverage: u32, partial: PartialExit) {
        let close_side = match side {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        };

        let amount_to_close = {
            let positions = self.positions.read();
            let Some(locked) = positions.get(symbol) else { return };
            let position = locked.lock();
            if position.partial_exits_taken != partial.threshold_index {
                // Already taken by a concurrent cycle.
                return;
            }
            position.amount * partial.fraction_of_remaining
        };
        if amount_to_close <= 0.0 {
            return;
        }

        match self.gateway.rest.create_market_order(symbol, close_side, amount_to_close, leverage, true).await {
            Ok(_) => {
                let positions = self.positions.read();
                if let Some(locked) = positions.get(symbol) {
                    let mut position = locked.lock();
                    if position.partial_exits_taken == partial.threshold_index {
                        position.amount -= amount_to_close;
                        position.partial_exits_taken += 1;
                    }
                }
                info!(symbol, fraction = partial.fraction_of_remaining, amount = amount_to_close, "partial exit executed");
            }
            Err(ExchangeError::NoPositionToClose) => {
                warn!(symbol, "partial exit reported no position to close, leaving for reconciliation");
            }
            Err(e) => {
                warn!(symbol, error = %e, "partial exit order failed, will retry next cycle");
            }
        }
    }

    /// Reduce-only market close. "No position to close" is treated as a
    /// success so a desynced local/exchange state still converges.
    pub async fn close(&self, symbol: &str, reason: ExitReason) -> anyhow::Result<f64> {
        let Some(position) = self.positions.read().get(symbol).map(|p| p.lock().clone()) else {
            return Ok(0.0);
        };

        let close_side = match position.side {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        };

        let mut last_err: Option<ExchangeError> = None;
        for attempt in 0..3 {
            match self.gateway.rest.create_market_order(symbol, close_side, position.amount, position.leverage, true).await {
                Ok(ack) => {
                    let exit_price = if ack.avg_price > 0.0 { ack.avg_price } else { position.entry_price };
                    let roi = position.leveraged_roi(exit_price);
                    self.positions.write().remove(symbol);
                    self.record_closed(&position, exit_price, roi, reason);
                    info!(symbol, reason = %reason, roi, "position closed");
                    return Ok(roi);
                }
                Err(ExchangeError::NoPositionToClose) => {
                    self.positions.write().remove(symbol);
                    warn!(symbol, "exchange reports no position to close, purging local state");
                    return Ok(0.0);
                }
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    let _ = attempt;
                }
            }
        }
        Err(anyhow::anyhow!("failed to close {symbol}: {}", last_err.map(|e| e.to_string()).unwrap_or_default()))
    }

    fn record_closed(&self, position: &Position, exit_price: f64, roi: f64, reason: ExitReason) {
        let mut closed = self.closed.write();
        closed.push_back(ClosedPositionRecord {
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            leveraged_roi: roi,
            reason: reason.to_string(),
            closed_at: Utc::now(),
        });
        if closed.len() > CLOSED_HISTORY_CAP {
            closed.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn sample_long(entry: f64, stop: f64, tp: f64) -> Position {
        Position::new("BTC/USDT:USDT".to_string(), Side::Long, 1.0, entry, 5, stop, tp, Regime::Trending, Some(2.0), Utc::now())
    }

    #[test]
    fn breakeven_only_tightens() {
        let mut position = sample_long(100.0, 95.0, 110.0);
        apply_breakeven(&mut position, 100.9);
        assert!(position.breakeven_armed);
        assert_eq!(position.stop_loss, 100.0);

        let stop_after = position.stop_loss;
        apply_breakeven(&mut position, 99.0);
        assert_eq!(position.stop_loss, stop_after, "breakeven must not re-arm or loosen");
    }

    #[test]
    fn trailing_stop_is_monotone_for_longs() {
        let mut position = sample_long(100.0, 95.0, 110.0);
        apply_trailing_stop(&mut position, 105.0, 0.01, None, 2.0);
        let first_stop = position.stop_loss;
        apply_trailing_stop(&mut position, 103.0, 0.01, None, 2.0);
        assert_eq!(position.stop_loss, first_stop, "a pullback must never loosen the trailing stop");
    }

    #[test]
    fn tp_extension_frozen_past_seventy_percent_progress() {
        let mut position = sample_long(100.0, 95.0, 110.0);
        apply_tp_extension(&mut position, 107.5, 120.0);
        assert_eq!(position.take_profit, 110.0, "past 70% progress the target must not move");
    }

    #[test]
    fn tp_extension_allowed_before_freeze_threshold() {
        let mut position = sample_long(100.0, 95.0, 110.0);
        apply_tp_extension(&mut position, 102.0, 115.0);
        assert_eq!(position.take_profit, 115.0);
    }

    #[test]
    fn pct_partial_exits_fire_in_order() {
        let mut position = sample_long(100.0, 95.0, 200.0);
        position.atr_at_entry = None;
        let first = next_partial_exit(&position, 101.6).expect("1.5% threshold crossed");
        assert_eq!(first.threshold_index, 0);
        position.partial_exits_taken = 1;
        assert!(next_partial_exit(&position, 101.6).is_none(), "second threshold not yet crossed");
    }

    #[test]
    fn atr_final_tranche_closes_remainder() {
        let position = sample_long(100.0, 95.0, 200.0);
        let mut position = position;
        position.partial_exits_taken = 2;
        let partial = next_partial_exit(&position, 106.5).expect("3x ATR distance crossed");
        assert!(partial.closes_remainder);
    }

    #[test]
    fn exit_cascade_prioritizes_kill_switch() {
        let position = sample_long(100.0, 99.0, 101.0);
        let reason = check_exit(&position, 100.5, true, Utc::now());
        assert_eq!(reason, Some(ExitReason::KillSwitch));
    }

    #[test]
    fn exit_cascade_stop_loss_before_take_profit_check_order() {
        let position = sample_long(100.0, 99.0, 101.0);
        let reason = check_exit(&position, 98.5, false, Utc::now());
        assert_eq!(reason, Some(ExitReason::StopLoss));
    }

    #[test]
    fn time_exit_fires_after_stagnant_window() {
        let mut position = sample_long(100.0, 90.0, 200.0);
        position.opened_at = Utc::now() - ChronoDuration::hours(50);
        let reason = check_exit(&position, 100.5, false, Utc::now());
        assert_eq!(reason, Some(ExitReason::TimeExitStagnant));
    }

    #[test]
    fn take_profit_tolerance_boundary() {
        let position = sample_long(100.0, 90.0, 110.0);
        let just_under = 110.0 * (1.0 - 2e-5);
        assert_eq!(check_exit(&position, just_under, false, Utc::now()), None);
        let at_tolerance = 110.0 * (1.0 - 1e-5);
        assert_eq!(check_exit(&position, at_tolerance, false, Utc::now()), Some(ExitReason::TakeProfit));
    }
}
