// =============================================================================
// Coordinator — the three long-lived tasks and their shutdown sequence
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::app_state::{AppState, DecisionLog};
use crate::gateway::Priority;
use crate::market::Timeframe;
use crate::risk::{
    compute_leverage, compute_position_size, diversification_allows, drawdown_multiplier, leverage_base_from_volatility,
    normalize_momentum, normalize_trend_strength, LeverageFactors,
};
use crate::types::Action;

/// Monitor task: every `position_update_interval_sec`, run one update cycle
/// for each open position. A failure on one symbol never blocks the rest.
pub async fn run_monitor_task(state: Arc<AppState>, running: Arc<AtomicBool>) {
    info!("monitor task starting");
    loop {
        if !running.load(Ordering::Acquire) {
            break;
        }
        let interval = {
            let config = state.runtime_config.read();
            Duration::from_secs(config.position_update_interval_sec)
        };
        let kill_switch_armed = state.risk_engine.kill_switch_armed();
        let symbols: Vec<String> = state.position_manager.get_open_positions().iter().map(|p| p.symbol.clone()).collect();
        for symbol in symbols {
            if let Err(e) = state.position_manager.update_cycle(&symbol, 2.0, 0.03, kill_switch_armed).await {
                error!(symbol = %symbol, error = %e, "position update cycle failed");
            }
        }
        tokio::time::sleep(interval).await;
    }
    info!("monitor task stopped");
}

/// Scanner task: every `check_interval_sec`, run one scan cycle.
pub async fn run_scanner_task(state: Arc<AppState>, running: Arc<AtomicBool>) {
    info!("scanner task starting");
    loop {
        if !running.load(Ordering::Acquire) {
            break;
        }
        let (interval, symbols) = {
            let config = state.runtime_config.read();
            (Duration::from_secs(config.check_interval_sec), config.symbols.clone())
        };

        let mut notional_by_symbol = HashMap::new();
        for symbol in &symbols {
            if let Ok(ticker) = state.gateway.get_ticker(symbol, Priority::Normal).await {
                notional_by_symbol.insert(symbol.clone(), ticker.mid() * 2_000_000.0);
            }
        }

        state.scanner.run_cycle(&symbols, &notional_by_symbol).await;
        tokio::time::sleep(interval).await;
    }
    info!("scanner task stopped");
}

/// Main task: every `check_interval_sec`, read the scanner cache and open
/// the highest-scoring opportunity that clears every governance check.
pub async fn run_main_task(state: Arc<AppState>, running: Arc<AtomicBool>) {
    info!("main task starting");
    // Forces the first loop iteration to run a cycle immediately.
    let mut last_cycle = Instant::now() - Duration::from_secs(3600);
    loop {
        if !running.load(Ordering::Acquire) {
            break;
        }
        let (live_loop_interval, check_interval) = {
            let config = state.runtime_config.read();
            (Duration::from_secs_f64(config.live_loop_interval_sec.max(0.01)), Duration::from_secs(config.check_interval_sec))
        };

        if last_cycle.elapsed() >= check_interval {
            if let Err(e) = run_main_cycle(&state).await {
                error!(error = %e, "main cycle failed");
            }
            last_cycle = Instant::now();
        }

        tokio::time::sleep(live_loop_interval).await;
    }
    info!("main task stopped");
}

async fn run_main_cycle(state: &Arc<AppState>) -> anyhow::Result<()> {
    let trading_mode = state.runtime_config.read().trading_mode;
    if trading_mode != crate::types::TradingMode::Live {
        return Ok(());
    }

    let balance = state.gateway.get_balance().await?;
    state.risk_engine.observe_balance(balance.total, chrono::Utc::now());

    if !state.risk_engine.can_open_new_position(balance.total) {
        return Ok(());
    }

    let max_open_positions = state.runtime_config.read().max_open_positions;
    if state.position_manager.symbol_count() >= max_open_positions {
        return Ok(());
    }

    let opportunities = state.scanner.cache.fresh_opportunities();
    let open_symbols: Vec<String> = state.position_manager.get_open_positions().iter().map(|p| p.symbol.clone()).collect();

    for opportunity in opportunities {
        if opportunity.action == Action::Hold {
            continue;
        }
        if !diversification_allows(&open_symbols, &opportunity.symbol) {
            continue;
        }

        let Some(side) = opportunity.action.as_side() else { continue };
        let ticker = state.gateway.get_ticker(&opportunity.symbol, Priority::High).await?;
        let entry_price = ticker.mid();

        let stop_loss = match side {
            crate::types::Side::Long => entry_price * 0.992,
            crate::types::Side::Short => entry_price * 1.008,
        };
        let take_profit = match side {
            crate::types::Side::Long => entry_price * 1.016,
            crate::types::Side::Short => entry_price * 0.984,
        };

        let drawdown_pct = state.risk_engine.drawdown_pct(balance.total);
        let leverage_default = state.runtime_config.read().leverage_default;
        let leverage_base = opportunity.volatility_pct.map(leverage_base_from_volatility).unwrap_or(leverage_default);
        let leverage = compute_leverage(
            leverage_base,
            LeverageFactors {
                confidence: opportunity.confidence,
                momentum: normalize_momentum(opportunity.momentum_pct),
                trend_strength: opportunity.adx.map(normalize_trend_strength).unwrap_or(0.0),
                regime: opportunity.regime,
                win_streak: state.risk_engine.win_streak(),
                loss_streak: state.risk_engine.loss_streak(),
                recent_win_rate: state.risk_engine.recent_win_rate(),
                drawdown_pct,
            },
        );

        let max_notional = state.runtime_config.read().max_position_size_notional;
        let metadata = crate::types::SymbolMetadata::fallback(&opportunity.symbol);
        let amount = compute_position_size(
            balance.total,
            entry_price,
            stop_loss,
            opportunity.confidence,
            max_notional,
            drawdown_multiplier(drawdown_pct),
            &metadata,
            state.risk_engine.kelly_override_fraction(),
        );

        if amount <= 0.0 {
            continue;
        }

        match state
            .position_manager
            .open(&opportunity.symbol, side, amount, leverage, stop_loss, take_profit, opportunity.regime, None, &metadata)
            .await
        {
            Ok(_) => {
                state.log_decision(DecisionLog {
                    symbol: opportunity.symbol.clone(),
                    action: opportunity.action.to_string(),
                    confidence: opportunity.confidence,
                    reason: "scanner opportunity".to_string(),
                    taken: true,
                    at: chrono::Utc::now(),
                });
                break;
            }
            Err(e) => warn!(symbol = %opportunity.symbol, error = %e, "failed to open position"),
        }
    }
    Ok(())
}

/// Bounded-wait shutdown: arm the kill switch, give the monitor task up to
/// 30s to close every open position, then the caller tears down the rest.
pub async fn shutdown_close_all(state: &Arc<AppState>) {
    state.risk_engine.arm_kill_switch();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while tokio::time::Instant::now() < deadline {
        if state.position_manager.symbol_count() == 0 {
            break;
        }
        let kill_switch_armed = true;
        for symbol in state.position_manager.get_open_positions().iter().map(|p| p.symbol.clone()).collect::<Vec<_>>() {
            let _ = state.position_manager.update_cycle(&symbol, 2.0, 0.03, kill_switch_armed).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    if state.position_manager.symbol_count() > 0 {
        warn!(remaining = state.position_manager.symbol_count(), "shutdown deadline reached with positions still open");
    }
}

#[allow(dead_code)]
pub const WARMUP_TIMEFRAME: Timeframe = Timeframe::H1;
