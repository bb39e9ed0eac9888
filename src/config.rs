// =============================================================================
// Runtime configuration — the only state persisted across restarts
// =============================================================================
//
// Every field carries a `#[serde(default = ...)]` so an older config file
// missing newer fields still loads cleanly, and an empty `{}` document
// loads as an all-defaults config.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{AccountMode, TradingMode};

fn default_leverage() -> u32 {
    5
}
fn default_max_position_size_notional() -> f64 {
    2_000.0
}
fn default_risk_per_trade() -> f64 {
    0.02
}
fn default_min_profit_threshold() -> f64 {
    0.004
}
fn default_check_interval_sec() -> u64 {
    60
}
fn default_position_update_interval_sec() -> u64 {
    1
}
fn default_live_loop_interval_sec() -> f64 {
    0.05
}
fn default_max_workers() -> usize {
    8
}
fn default_cache_duration_sec() -> u64 {
    300
}
fn default_trailing_stop_pct() -> f64 {
    0.02
}
fn default_max_open_positions() -> usize {
    3
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_daily_loss_limit() -> f64 {
    0.10
}
fn default_min_ml_confidence() -> f64 {
    0.65
}
fn default_max_consecutive_losses() -> u32 {
    5
}
fn default_max_trades_per_day() -> u32 {
    50
}
fn default_max_drawdown_pct() -> f64 {
    0.20
}
fn default_symbols() -> Vec<String> {
    vec!["BTC/USDT:USDT".to_string(), "ETH/USDT:USDT".to_string()]
}
fn default_trading_mode() -> TradingMode {
    TradingMode::Paused
}
fn default_account_mode() -> AccountMode {
    AccountMode::Demo
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_trading_mode")]
    pub trading_mode: TradingMode,
    #[serde(default = "default_account_mode")]
    pub account_mode: AccountMode,
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default = "default_leverage")]
    pub leverage_default: u32,
    #[serde(default = "default_max_position_size_notional")]
    pub max_position_size_notional: f64,
    #[serde(default = "default_risk_per_trade")]
    pub risk_per_trade: f64,
    #[serde(default = "default_min_profit_threshold")]
    pub min_profit_threshold: f64,

    #[serde(default = "default_check_interval_sec")]
    pub check_interval_sec: u64,
    #[serde(default = "default_position_update_interval_sec")]
    pub position_update_interval_sec: u64,
    #[serde(default = "default_live_loop_interval_sec")]
    pub live_loop_interval_sec: f64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_cache_duration_sec")]
    pub cache_duration_sec: u64,

    #[serde(default = "default_trailing_stop_pct")]
    pub trailing_stop_pct: f64,
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,

    #[serde(default = "default_true")]
    pub enable_websocket: bool,
    #[serde(default = "default_false")]
    pub kill_switch: bool,
    #[serde(default = "default_daily_loss_limit")]
    pub daily_loss_limit: f64,
    #[serde(default = "default_false")]
    pub close_positions_on_shutdown: bool,
    #[serde(default = "default_false")]
    pub require_ml_model: bool,
    #[serde(default = "default_min_ml_confidence")]
    pub min_ml_confidence: f64,
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    #[serde(default = "default_max_trades_per_day")]
    pub max_trades_per_day: u32,
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trading_mode: default_trading_mode(),
            account_mode: default_account_mode(),
            symbols: default_symbols(),
            leverage_default: default_leverage(),
            max_position_size_notional: default_max_position_size_notional(),
            risk_per_trade: default_risk_per_trade(),
            min_profit_threshold: default_min_profit_threshold(),
            check_interval_sec: default_check_interval_sec(),
            position_update_interval_sec: default_position_update_interval_sec(),
            live_loop_interval_sec: default_live_loop_interval_sec(),
            max_workers: default_max_workers(),
            cache_duration_sec: default_cache_duration_sec(),
            trailing_stop_pct: default_trailing_stop_pct(),
            max_open_positions: default_max_open_positions(),
            enable_websocket: default_true(),
            kill_switch: default_false(),
            daily_loss_limit: default_daily_loss_limit(),
            close_positions_on_shutdown: default_false(),
            require_ml_model: default_false(),
            min_ml_confidence: default_min_ml_confidence(),
            max_consecutive_losses: default_max_consecutive_losses(),
            max_trades_per_day: default_max_trades_per_day(),
            max_drawdown_pct: default_max_drawdown_pct(),
        }
    }
}

impl RuntimeConfig {
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    info!(path = %path.display(), "loaded runtime config");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to parse runtime config, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                info!(path = %path.display(), "no runtime config found, using defaults");
                Self::default()
            }
        }
    }

    /// Atomic save: write to a temp file in the same directory, then rename
    /// over the target so a crash mid-write never leaves a truncated file.
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let tmp_path = path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp_path, contents)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_object_loads_as_defaults() {
        let config: RuntimeConfig = serde_json::from_str("{}").expect("empty object should deserialize");
        assert_eq!(config.leverage_default, default_leverage());
        assert_eq!(config.trading_mode, TradingMode::Paused);
    }

    #[test]
    fn round_trips_through_json() {
        let mut config = RuntimeConfig::default();
        config.leverage_default = 12;
        config.kill_switch = true;
        let json = serde_json::to_string(&config).unwrap();
        let reloaded: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(reloaded.leverage_default, 12);
        assert!(reloaded.kill_switch);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!("perpfolio-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("runtime_config.json");
        let mut config = RuntimeConfig::default();
        config.max_open_positions = 7;
        config.save(&path).unwrap();
        let reloaded = RuntimeConfig::load(&path);
        assert_eq!(reloaded.max_open_positions, 7);
        std::fs::remove_dir_all(&dir).ok();
    }
}
