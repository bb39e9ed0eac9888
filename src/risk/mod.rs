pub mod engine;
pub mod kelly;

pub use engine::{
    compute_leverage, compute_position_size, diversification_allows, drawdown_multiplier, leverage_base_from_volatility,
    normalize_momentum, normalize_trend_strength, symbol_group, LeverageFactors, RiskEngine, RiskMode, SymbolGroup,
    DEFAULT_CONSECUTIVE_LOSS_BREAKER, DEFAULT_DAILY_TRADE_BREAKER, MAX_LEVERAGE, MIN_LEVERAGE,
};
pub use kelly::{KellyHistory, TradeOutcome};
