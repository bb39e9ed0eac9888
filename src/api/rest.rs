// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Public endpoints (health) require no
// authentication. All other endpoints require a valid Bearer token checked via
// the `AuthBearer` extractor.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::types::{AccountMode, TradingMode};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/regime", get(regime))
        .route("/api/v1/risk", get(risk))
        .route("/api/v1/scanner", get(scanner_opportunities))
        .route("/api/v1/decisions", get(decisions))
        .route("/api/v1/feature-flags", get(get_feature_flags))
        .route("/api/v1/feature-flags", post(set_feature_flags))
        .route("/api/v1/control/pause", post(control_pause))
        .route("/api/v1/control/resume", post(control_resume))
        .route("/api/v1/control/kill", post(control_kill))
        .route("/api/v1/control/account-mode", post(control_account_mode))
        .route("/api/v1/heartbeat", post(heartbeat))
        .route("/api/v1/trade-journal", get(trade_journal))
        .route("/api/v1/trade-journal/stats", get(trade_journal_stats))
        // ── WebSocket (handled separately in ws module but mounted here) ─
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

// =============================================================================
// Full state snapshot (authenticated)
// =============================================================================

async fn full_state(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let snapshot = state.build_snapshot();
    Json(snapshot)
}

// =============================================================================
// Positions (authenticated)
// =============================================================================

async fn positions(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let positions = state.position_manager.get_open_positions();
    Json(positions)
}

// =============================================================================
// Regime (authenticated)
// =============================================================================

async fn regime(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match state.regime_detector.current_regime() {
        Some(rs) => {
            let snapshot = serde_json::json!({
                "regime": rs.regime.to_string(),
                "adx": rs.adx,
                "bbw": rs.bbw,
                "confidence": rs.confidence,
                "regime_age_seconds": rs.regime_age_secs,
            });
            Json(snapshot).into_response()
        }
        None => {
            let body = serde_json::json!({ "regime": null, "message": "No regime data available yet" });
            Json(body).into_response()
        }
    }
}

// =============================================================================
// Risk (authenticated)
// =============================================================================

async fn risk(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let balance = match state.gateway.get_balance().await {
        Ok(b) => b.total,
        Err(_) => 0.0,
    };
    let snapshot = serde_json::json!({
        "risk_mode": state.risk_engine.risk_mode(balance).to_string(),
        "kill_switch_armed": state.risk_engine.kill_switch_armed(),
        "drawdown_pct": state.risk_engine.drawdown_pct(balance),
        "can_open_new_position": state.risk_engine.can_open_new_position(balance),
        "kelly_override_fraction": state.risk_engine.kelly_override_fraction(),
    });
    Json(snapshot)
}

// =============================================================================
// Scanner (authenticated)
// =============================================================================

async fn scanner_opportunities(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let opportunities: Vec<crate::app_state::OpportunityView> =
        state.scanner.cache.fresh_opportunities().iter().map(crate::app_state::OpportunityView::from).collect();
    Json(opportunities)
}

// =============================================================================
// Decisions (authenticated)
// =============================================================================

async fn decisions(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let decisions = state.recent_decisions.read().clone();
    Json(decisions)
}

// =============================================================================
// Feature Flags (authenticated)
// =============================================================================
//
// Flags toggle ambient engine behavior that operators may want to flip
// without a restart. These map directly onto `RuntimeConfig` fields that
// already exist for other reasons.

async fn get_feature_flags(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let config = state.runtime_config.read();
    let flags = serde_json::json!({
        "enable_websocket": config.enable_websocket,
        "kill_switch": config.kill_switch,
        "close_positions_on_shutdown": config.close_positions_on_shutdown,
        "require_ml_model": config.require_ml_model,
    });
    Json(flags)
}

#[derive(Deserialize)]
struct FeatureFlagUpdate {
    #[serde(default)]
    enable_websocket: Option<bool>,
    #[serde(default)]
    kill_switch: Option<bool>,
    #[serde(default)]
    close_positions_on_shutdown: Option<bool>,
    #[serde(default)]
    require_ml_model: Option<bool>,
}

async fn set_feature_flags(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(update): Json<FeatureFlagUpdate>,
) -> impl IntoResponse {
    let mut config = state.runtime_config.write();
    let mut changes = Vec::new();

    macro_rules! apply_flag {
        ($update_field:ident, $config_field:ident) => {
            if let Some(val) = update.$update_field {
                if config.$config_field != val {
                    changes.push(format!(
                        "{}: {} -> {}",
                        stringify!($update_field),
                        config.$config_field,
                        val
                    ));
                    config.$config_field = val;
                }
            }
        };
    }

    apply_flag!(enable_websocket, enable_websocket);
    apply_flag!(kill_switch, kill_switch);
    apply_flag!(close_positions_on_shutdown, close_positions_on_shutdown);
    apply_flag!(require_ml_model, require_ml_model);

    if config.kill_switch {
        state.risk_engine.arm_kill_switch();
    }

    let response_flags = serde_json::json!({
        "enable_websocket": config.enable_websocket,
        "kill_switch": config.kill_switch,
        "close_positions_on_shutdown": config.close_positions_on_shutdown,
        "require_ml_model": config.require_ml_model,
    });

    if !changes.is_empty() {
        info!(changes = ?changes, "Feature flags updated");
        let config_clone = config.clone();
        drop(config);

        if let Err(e) = config_clone.save("runtime_config.json") {
            warn!(error = %e, "Failed to save feature flags to disk");
        }
        state.increment_version();
    } else {
        drop(config);
    }

    let mut response = response_flags;
    if let Some(obj) = response.as_object_mut() {
        obj.insert("changes".to_string(), serde_json::to_value(&changes).unwrap_or_default());
    }
    Json(response)
}

// =============================================================================
// Control endpoints (authenticated)
// =============================================================================

#[derive(Serialize)]
struct ControlResponse {
    trading_mode: String,
    message: String,
}

async fn control_pause(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    {
        let mut config = state.runtime_config.write();
        config.trading_mode = TradingMode::Paused;
    }
    state.increment_version();
    info!("Trading PAUSED via API");

    Json(ControlResponse {
        trading_mode: "Paused".to_string(),
        message: "Trading paused".to_string(),
    })
}

async fn control_resume(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    {
        let mut config = state.runtime_config.write();
        config.trading_mode = TradingMode::Live;
    }
    state.increment_version();
    info!("Trading RESUMED via API");

    Json(ControlResponse {
        trading_mode: "Live".to_string(),
        message: "Trading resumed".to_string(),
    })
}

async fn control_kill(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    {
        let mut config = state.runtime_config.write();
        config.trading_mode = TradingMode::Killed;
    }
    state.risk_engine.arm_kill_switch();
    state.increment_version();
    warn!("Trading KILLED via API");

    Json(ControlResponse {
        trading_mode: "Killed".to_string(),
        message: "Trading killed — manual restart required".to_string(),
    })
}

#[derive(Deserialize)]
struct AccountModeRequest {
    account_mode: String,
    #[serde(default)]
    confirm_live: bool,
}

#[derive(Serialize)]
struct AccountModeResponse {
    account_mode: String,
}

async fn control_account_mode(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<AccountModeRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let mode = match req.account_mode.to_lowercase().as_str() {
        "demo" => AccountMode::Demo,
        "live" => {
            if !req.confirm_live {
                return Err((
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({
                        "error": "Switching to Live mode requires confirm_live: true",
                    })),
                ));
            }
            warn!("Switching to LIVE account mode via API");
            AccountMode::Live
        }
        _ => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": format!("Invalid account mode: '{}'. Use 'demo' or 'live'.", req.account_mode),
                })),
            ));
        }
    };

    {
        let mut config = state.runtime_config.write();
        config.account_mode = mode;
    }
    state.increment_version();
    info!(account_mode = %mode, "Account mode changed via API");

    Ok(Json(AccountModeResponse {
        account_mode: mode.to_string(),
    }))
}

// =============================================================================
// Heartbeat (authenticated)
// =============================================================================

async fn heartbeat(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    *state.last_ws_user_event.write() = std::time::Instant::now();
    state.increment_version();

    Json(serde_json::json!({
        "status": "ok",
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

// =============================================================================
// Trade Journal (authenticated)
// =============================================================================

async fn trade_journal(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let closed = state.get_closed_positions(500);
    Json(closed)
}

async fn trade_journal_stats(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let closed = state.get_closed_positions(500);
    let total_trades = closed.len();
    if total_trades == 0 {
        return Json(serde_json::json!({
            "total_trades": 0,
            "win_rate": 0.0,
            "avg_leveraged_roi": 0.0,
            "profit_factor": 0.0,
        }));
    }
    let wins = closed.iter().filter(|p| p.leveraged_roi > 0.0).count();
    let win_rate = wins as f64 / total_trades as f64;
    let avg_leveraged_roi: f64 = closed.iter().map(|p| p.leveraged_roi).sum::<f64>() / total_trades as f64;
    let gross_profit: f64 = closed.iter().filter(|p| p.leveraged_roi > 0.0).map(|p| p.leveraged_roi).sum();
    let gross_loss: f64 = closed.iter().filter(|p| p.leveraged_roi < 0.0).map(|p| p.leveraged_roi.abs()).sum();
    let profit_factor = if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };
    Json(serde_json::json!({
        "total_trades": total_trades,
        "win_rate": win_rate,
        "avg_leveraged_roi": avg_leveraged_roi,
        "profit_factor": profit_factor,
    }))
}
