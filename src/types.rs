// =============================================================================
// Shared types used across the perpetual-futures engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Long or short side of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn direction(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "Long"),
            Side::Short => write!(f, "Short"),
        }
    }
}

/// A directional trading decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Buy => write!(f, "BUY"),
            Action::Sell => write!(f, "SELL"),
            Action::Hold => write!(f, "HOLD"),
        }
    }
}

impl Action {
    /// Side a filled order of this action would open, if not `Hold`.
    pub fn as_side(self) -> Option<Side> {
        match self {
            Action::Buy => Some(Side::Long),
            Action::Sell => Some(Side::Short),
            Action::Hold => None,
        }
    }
}

/// Balance snapshot for the account's collateral asset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct BalanceInfo {
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub used: f64,
    #[serde(default)]
    pub total: f64,
}

/// Whether the engine is actively trading, paused, or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// Whether we are running against real funds or simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Demo,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// Qualitative market-structure label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regime {
    Trending,
    Ranging,
    Neutral,
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Regime::Trending => write!(f, "Trending"),
            Regime::Ranging => write!(f, "Ranging"),
            Regime::Neutral => write!(f, "Neutral"),
        }
    }
}

/// Static exchange metadata for one perpetual symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolMetadata {
    pub symbol: String,
    pub tick_size: f64,
    pub lot_size: f64,
    pub contract_size: f64,
    pub min_amount: f64,
    pub max_amount: f64,
    pub min_notional: f64,
}

impl SymbolMetadata {
    /// Conservative fallback used when metadata has not been fetched yet.
    pub fn fallback(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            tick_size: 0.01,
            lot_size: 0.001,
            contract_size: 1.0,
            min_amount: 0.001,
            max_amount: 10_000.0,
            min_notional: 5.0,
        }
    }

    pub fn floor_to_lot(&self, amount: f64) -> f64 {
        if self.lot_size <= 0.0 {
            return amount;
        }
        (amount / self.lot_size).floor() * self.lot_size
    }
}
