// =============================================================================
// perpfolio-engine — main entry point
// =============================================================================
//
// Starts in Demo + Paused mode for safety. An operator must explicitly
// switch to Live mode via the dashboard or API before any order is placed.
// =============================================================================

mod api;
mod app_state;
mod config;
mod coordinator;
mod gateway;
mod indicators;
mod market;
mod position;
mod regime;
mod risk;
mod scanner;
mod signals;
mod types;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::RuntimeConfig;
use crate::gateway::Gateway;
use crate::types::{AccountMode, TradingMode};

const CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("perpfolio-engine starting up");

    let mut config = RuntimeConfig::load(CONFIG_PATH);

    // SAFETY: force Demo + Paused on every startup regardless of what was
    // persisted; an operator must explicitly arm live trading.
    config.trading_mode = TradingMode::Paused;
    config.account_mode = AccountMode::Demo;

    if let Ok(syms) = std::env::var("PERPFOLIO_SYMBOLS") {
        config.symbols = syms.split(',').map(|s| s.trim().to_uppercase()).filter(|s| !s.is_empty()).collect();
    }

    info!(symbols = ?config.symbols, trading_mode = %config.trading_mode, account_mode = %config.account_mode, "engine configured in safe mode");

    // ── 1. Gateway, one-way (hedge) mode ─────────────────────────────────
    let rest_base_url = std::env::var("PERPFOLIO_REST_URL").unwrap_or_else(|_| "https://fapi.binance.com".to_string());
    let ws_url = std::env::var("PERPFOLIO_WS_URL").unwrap_or_else(|_| "wss://fstream.binance.com/ws".to_string());
    let api_key = std::env::var("PERPFOLIO_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("PERPFOLIO_API_SECRET").unwrap_or_default();

    let gateway = Gateway::new(rest_base_url, ws_url, api_key, api_secret);
    gateway.subscribe(&config.symbols);
    gateway.spawn_stream();

    let state = AppState::new(config, gateway.clone());

    // ── 2. Reconcile positions against the exchange before anything opens ─
    match gateway.get_positions().await {
        Ok(remote_positions) => {
            let local = state.position_manager.get_open_positions();
            let actions = crate::position::reconcile::reconcile(&local, &remote_positions, |_| 0.001);
            info!(actions = actions.len(), "startup reconciliation complete");
        }
        Err(e) => warn!(error = %e, "startup reconciliation failed, proceeding with empty local position set"),
    }

    let running = Arc::new(AtomicBool::new(true));

    // ── 3. Monitor task, +500ms head start ───────────────────────────────
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    let monitor_state = state.clone();
    let monitor_running = running.clone();
    let monitor_handle = tokio::spawn(async move { coordinator::run_monitor_task(monitor_state, monitor_running).await });

    // ── 4. Scanner task, +1s delay ────────────────────────────────────────
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    let scanner_state = state.clone();
    let scanner_running = running.clone();
    let scanner_handle = tokio::spawn(async move { coordinator::run_scanner_task(scanner_state, scanner_running).await });

    // ── 5. Main task ──────────────────────────────────────────────────────
    let main_state = state.clone();
    let main_running = running.clone();
    let main_handle = tokio::spawn(async move { coordinator::run_main_task(main_state, main_running).await });

    // ── 6. Dashboard / control API ───────────────────────────────────────
    let api_state = state.clone();
    let bind_addr = std::env::var("PERPFOLIO_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".to_string());
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr).await.expect("failed to bind API server");
        info!(addr = %bind_addr, "API server listening");
        axum::serve(listener, app).await.expect("API server failed");
    });

    info!("all subsystems running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    running.store(false, Ordering::SeqCst);
    let close_on_shutdown = state.runtime_config.read().close_positions_on_shutdown;
    if close_on_shutdown {
        coordinator::shutdown_close_all(&state).await;
    } else {
        state.risk_engine.arm_kill_switch();
    }

    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), monitor_handle).await;
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), scanner_handle).await;
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), main_handle).await;

    gateway.shutdown();

    if let Err(e) = state.runtime_config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("perpfolio-engine shut down complete");
    Ok(())
}
