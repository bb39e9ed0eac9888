pub mod manager;
pub mod reconcile;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Regime, Side};

/// A single open perpetual position. `initial_take_profit` is fixed at open
/// and never mutated again — it is the only thing `take_profit` is allowed
/// to extend toward, never past.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub amount: f64,
    pub entry_price: f64,
    pub leverage: u32,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub initial_take_profit: f64,
    pub highest_price: f64,
    pub lowest_price: f64,
    pub breakeven_armed: bool,
    pub trailing_active: bool,
    pub partial_exits_taken: u32,
    pub regime_at_entry: Regime,
    pub atr_at_entry: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl Position {
    pub fn new(
        symbol: String,
        side: Side,
        amount: f64,
        entry_price: f64,
        leverage: u32,
        stop_loss: f64,
        take_profit: f64,
        regime_at_entry: Regime,
        atr_at_entry: Option<f64>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol,
            side,
            amount,
            entry_price,
            leverage,
            stop_loss,
            take_profit,
            initial_take_profit: take_profit,
            highest_price: entry_price,
            lowest_price: entry_price,
            breakeven_armed: false,
            trailing_active: false,
            partial_exits_taken: 0,
            regime_at_entry,
            atr_at_entry,
            opened_at: now,
            last_update: now,
        }
    }

    /// Unleveraged PnL as a fraction of entry price; positive favors the
    /// position's side.
    pub fn pnl_fraction(&self, current_price: f64) -> f64 {
        self.side.direction() * (current_price - self.entry_price) / self.entry_price
    }

    /// PnL scaled by leverage. Reporting-only: never used as the basis for
    /// margin or sizing math, only for ROI thresholds and display.
    pub fn leveraged_roi(&self, current_price: f64) -> f64 {
        self.pnl_fraction(current_price) * self.leverage as f64
    }

    pub fn progress_to_initial_tp(&self, current_price: f64) -> f64 {
        let total_distance = (self.initial_take_profit - self.entry_price).abs();
        if total_distance <= 0.0 {
            return 1.0;
        }
        let covered = self.side.direction() * (current_price - self.entry_price);
        (covered / total_distance).clamp(0.0, 1.0)
    }
}

/// Why a position's exit-check cascade decided to close it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    KillSwitch,
    EmergencyStop,
    TimeExitStagnant,
    AtrTarget,
    StopLoss,
    TakeProfit,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::KillSwitch => write!(f, "kill_switch"),
            ExitReason::EmergencyStop => write!(f, "emergency_stop"),
            ExitReason::TimeExitStagnant => write!(f, "time_exit_stagnant"),
            ExitReason::AtrTarget => write!(f, "atr_target"),
            ExitReason::StopLoss => write!(f, "stop_loss"),
            ExitReason::TakeProfit => write!(f, "take_profit"),
        }
    }
}
