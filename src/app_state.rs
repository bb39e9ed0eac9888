// =============================================================================
// Shared application state — the single Arc every task and API handler holds
// =============================================================================
//
// Lock order is fixed across the whole engine: positions before risk before
// scanner before gateway. Nothing here ever holds a lock across an `.await`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;

use crate::config::RuntimeConfig;
use crate::gateway::Gateway;
use crate::position::manager::{ClosedPositionRecord, PositionManager};
use crate::position::Position;
use crate::regime::{RegimeDetector, RegimeState};
use crate::risk::RiskEngine;
use crate::scanner::{Opportunity, Scanner};
use crate::signals::NullPredictor;

#[derive(Debug, Clone, Serialize)]
pub struct DecisionLog {
    pub symbol: String,
    pub action: String,
    pub confidence: f64,
    pub reason: String,
    pub taken: bool,
    pub at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub trading_mode: String,
    pub account_mode: String,
    pub open_positions: Vec<Position>,
    pub regime: Option<RegimeState>,
    pub opportunities: Vec<OpportunityView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpportunityView {
    pub symbol: String,
    pub action: String,
    pub confidence: f64,
    pub score: f64,
}

impl From<&Opportunity> for OpportunityView {
    fn from(o: &Opportunity) -> Self {
        Self { symbol: o.symbol.clone(), action: o.action.to_string(), confidence: o.confidence, score: o.score }
    }
}

pub struct AppState {
    pub runtime_config: RwLock<RuntimeConfig>,
    pub gateway: Arc<Gateway>,
    pub position_manager: PositionManager,
    pub risk_engine: RiskEngine,
    pub regime_detector: Arc<RegimeDetector>,
    pub scanner: Scanner,
    pub recent_decisions: RwLock<Vec<DecisionLog>>,
    pub ws_user_connected: RwLock<bool>,
    pub last_ws_user_event: RwLock<Instant>,
    state_version: AtomicU64,
}

const MAX_RECENT_DECISIONS: usize = 200;

impl AppState {
    pub fn new(config: RuntimeConfig, gateway: Arc<Gateway>) -> Arc<Self> {
        let regime_detector = RegimeDetector::new();
        let cache_duration = std::time::Duration::from_secs(config.cache_duration_sec);
        let max_workers = config.max_workers;
        let scanner = Scanner::new(gateway.clone(), regime_detector.clone(), Arc::new(NullPredictor), cache_duration, max_workers);

        Arc::new(Self {
            position_manager: PositionManager::new(gateway.clone()),
            risk_engine: RiskEngine::new(config.daily_loss_limit, config.max_drawdown_pct),
            regime_detector,
            scanner,
            gateway,
            runtime_config: RwLock::new(config),
            recent_decisions: RwLock::new(Vec::new()),
            ws_user_connected: RwLock::new(false),
            last_ws_user_event: RwLock::new(Instant::now()),
            state_version: AtomicU64::new(0),
        })
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::Acquire)
    }

    pub fn increment_version(&self) {
        self.state_version.fetch_add(1, Ordering::AcqRel);
    }

    pub fn log_decision(&self, decision: DecisionLog) {
        let mut log = self.recent_decisions.write();
        log.push(decision);
        if log.len() > MAX_RECENT_DECISIONS {
            log.remove(0);
        }
        drop(log);
        self.increment_version();
    }

    pub fn get_closed_positions(&self, limit: usize) -> Vec<ClosedPositionRecord> {
        self.position_manager.get_closed_positions(limit)
    }

    pub fn build_snapshot(&self) -> StateSnapshot {
        let config = self.runtime_config.read();
        StateSnapshot {
            state_version: self.current_state_version(),
            trading_mode: config.trading_mode.to_string(),
            account_mode: config.account_mode.to_string(),
            open_positions: self.position_manager.get_open_positions(),
            regime: self.regime_detector.current_regime(),
            opportunities: self.scanner.cache.fresh_opportunities().iter().map(OpportunityView::from).collect(),
        }
    }
}
