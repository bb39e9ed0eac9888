// =============================================================================
// Reconciliation — active adopt/purge against the exchange's own position list
// =============================================================================
//
// Runs under the same per-symbol locks the position manager uses elsewhere,
// mutating local state atomically rather than only logging a warning. The
// exchange is always the source of truth for what positions actually exist.

use chrono::Utc;
use tracing::{info, warn};

use crate::gateway::PositionInfo;
use crate::position::Position;
use crate::types::Regime;

const LOT_MISMATCH_TOLERANCE_MULTIPLE: f64 = 1.0;

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileAction {
    /// A position exists on the exchange with no local record; adopt it
    /// with best-effort side/entry/leverage and synthesized stop/target.
    Adopt(Position),
    /// A local position no longer exists on the exchange; purge it.
    Purge { symbol: String, reason: &'static str },
    /// Amount differs from the exchange by more than one lot; adopt the
    /// exchange's value as authoritative.
    AmountMismatch { symbol: String, local_amount: f64, exchange_amount: f64 },
    NoAction,
}

/// Compare the locally tracked positions against the exchange's own list and
/// produce the set of corrective actions. Does not mutate anything itself;
/// callers apply each action under the relevant per-symbol lock.
pub fn reconcile(local: &[Position], exchange: &[PositionInfo], lot_size_by_symbol: impl Fn(&str) -> f64) -> Vec<ReconcileAction> {
    let mut actions = Vec::new();

    for remote in exchange {
        match local.iter().find(|p| p.symbol == remote.symbol) {
            None => {
                let synthesized_stop = match remote.side {
                    crate::types::Side::Long => remote.entry_price * 0.99,
                    crate::types::Side::Short => remote.entry_price * 1.01,
                };
                let synthesized_tp = match remote.side {
                    crate::types::Side::Long => remote.entry_price * 1.02,
                    crate::types::Side::Short => remote.entry_price * 0.98,
                };
                let adopted = Position::new(
                    remote.symbol.clone(),
                    remote.side,
                    remote.amount,
                    remote.entry_price,
                    remote.leverage,
                    synthesized_stop,
                    synthesized_tp,
                    Regime::Neutral,
                    None,
                    Utc::now(),
                );
                warn!(symbol = %remote.symbol, "adopting untracked exchange position");
                actions.push(ReconcileAction::Adopt(adopted));
            }
            Some(local_position) => {
                let lot = lot_size_by_symbol(&remote.symbol).max(f64::EPSILON);
                let diff_in_lots = (local_position.amount - remote.amount).abs() / lot;
                if diff_in_lots > LOT_MISMATCH_TOLERANCE_MULTIPLE {
                    actions.push(ReconcileAction::AmountMismatch {
                        symbol: remote.symbol.clone(),
                        local_amount: local_position.amount,
                        exchange_amount: remote.amount,
                    });
                }
            }
        }
    }

    for local_position in local {
        if !exchange.iter().any(|r| r.symbol == local_position.symbol) {
            info!(symbol = %local_position.symbol, "local position missing on exchange, purging");
            actions.push(ReconcileAction::Purge { symbol: local_position.symbol.clone(), reason: "external_close" });
        }
    }

    if actions.is_empty() {
        actions.push(ReconcileAction::NoAction);
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn exchange_position(symbol: &str, amount: f64) -> PositionInfo {
        PositionInfo {
            symbol: symbol.to_string(),
            side: Side::Long,
            amount,
            entry_price: 100.0,
            leverage: 5,
            mark_price: 101.0,
            unrealized_pnl: 10.0,
        }
    }

    #[test]
    fn adopts_untracked_exchange_position() {
        let actions = reconcile(&[], &[exchange_position("BTC/USDT:USDT", 1.0)], |_| 0.001);
        assert!(matches!(actions[0], ReconcileAction::Adopt(_)));
    }

    #[test]
    fn purges_position_missing_on_exchange() {
        let local = vec![Position::new(
            "ETH/USDT:USDT".to_string(),
            Side::Long,
            1.0,
            100.0,
            5,
            95.0,
            110.0,
            Regime::Neutral,
            None,
            Utc::now(),
        )];
        let actions = reconcile(&local, &[], |_| 0.001);
        assert!(matches!(&actions[0], ReconcileAction::Purge { symbol, .. } if symbol == "ETH/USDT:USDT"));
    }

    #[test]
    fn flags_amount_mismatch_beyond_one_lot() {
        let local = vec![Position::new(
            "BTC/USDT:USDT".to_string(),
            Side::Long,
            1.0,
            100.0,
            5,
            95.0,
            110.0,
            Regime::Neutral,
            None,
            Utc::now(),
        )];
        let actions = reconcile(&local, &[exchange_position("BTC/USDT:USDT", 1.1)], |_| 0.001);
        assert!(matches!(actions[0], ReconcileAction::AmountMismatch { .. }));
    }

    #[test]
    fn no_action_when_in_sync() {
        let local = vec![Position::new(
            "BTC/USDT:USDT".to_string(),
            Side::Long,
            1.0,
            100.0,
            5,
            95.0,
            110.0,
            Regime::Neutral,
            None,
            Utc::now(),
        )];
        let actions = reconcile(&local, &[exchange_position("BTC/USDT:USDT", 1.0)], |_| 0.001);
        assert_eq!(actions, vec![ReconcileAction::NoAction]);
    }
}
