// =============================================================================
// Optional ML confirmation layer
// =============================================================================
//
// The core fusion engine runs entirely on rule-based voting. An ML predictor
// may be plugged in to confirm or veto a fused signal; it is never required.

use crate::types::Action;

/// An opaque classifier the fusion layer can consult for a second opinion.
/// Training and feature engineering live outside the trading engine.
pub trait MlPredictor: Send + Sync {
    fn predict(&self, features: &[f64]) -> (Action, f64);
    fn is_ready(&self) -> bool;
}

/// Default predictor used when no model is configured. Always reports
/// not-ready so callers skip the ML-confirmation step entirely.
#[derive(Debug, Default)]
pub struct NullPredictor;

impl MlPredictor for NullPredictor {
    fn predict(&self, _features: &[f64]) -> (Action, f64) {
        (Action::Hold, 0.0)
    }

    fn is_ready(&self) -> bool {
        false
    }
}

/// Outcome of consulting an `MlPredictor` against a fused action/confidence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MlAdjustment {
    /// ML was not consulted (not ready, or action was already Hold).
    NotConsulted,
    /// ML agreed; confidence boosted by the given multiplier.
    Agreed { boosted_confidence: f64 },
    /// ML mildly disagreed; confidence reduced by the given multiplier.
    MildDisagreement { reduced_confidence: f64 },
    /// ML strongly disagreed; the trade must be rejected.
    StrongDisagreement,
}

const STRONG_DISAGREEMENT_THRESHOLD: f64 = 0.75;
const MILD_DISAGREEMENT_FACTOR: f64 = 0.8;
const AGREEMENT_BOOST_FACTOR: f64 = 1.10;

/// Apply the optional ML-confirmation rule to a fused action/confidence pair.
pub fn confirm(predictor: &dyn MlPredictor, action: Action, confidence: f64, features: &[f64]) -> MlAdjustment {
    if action == Action::Hold || !predictor.is_ready() {
        return MlAdjustment::NotConsulted;
    }

    let (ml_action, ml_prob) = predictor.predict(features);

    if ml_action == action {
        return MlAdjustment::Agreed {
            boosted_confidence: (confidence * AGREEMENT_BOOST_FACTOR).min(1.0),
        };
    }

    if ml_action != Action::Hold && ml_prob >= STRONG_DISAGREEMENT_THRESHOLD {
        return MlAdjustment::StrongDisagreement;
    }

    MlAdjustment::MildDisagreement {
        reduced_confidence: confidence * MILD_DISAGREEMENT_FACTOR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedPredictor {
        action: Action,
        prob: f64,
        ready: bool,
    }

    impl MlPredictor for FixedPredictor {
        fn predict(&self, _features: &[f64]) -> (Action, f64) {
            (self.action, self.prob)
        }

        fn is_ready(&self) -> bool {
            self.ready
        }
    }

    #[test]
    fn null_predictor_is_never_ready() {
        let predictor = NullPredictor;
        assert!(!predictor.is_ready());
        assert_eq!(confirm(&predictor, Action::Buy, 0.7, &[]), MlAdjustment::NotConsulted);
    }

    #[test]
    fn strong_disagreement_rejects() {
        let predictor = FixedPredictor { action: Action::Sell, prob: 0.9, ready: true };
        let adj = confirm(&predictor, Action::Buy, 0.7, &[]);
        assert_eq!(adj, MlAdjustment::StrongDisagreement);
    }

    #[test]
    fn mild_disagreement_reduces_confidence() {
        let predictor = FixedPredictor { action: Action::Sell, prob: 0.5, ready: true };
        let adj = confirm(&predictor, Action::Buy, 0.7, &[]);
        assert_eq!(adj, MlAdjustment::MildDisagreement { reduced_confidence: 0.56 });
    }

    #[test]
    fn agreement_boosts_confidence_capped_at_one() {
        let predictor = FixedPredictor { action: Action::Buy, prob: 0.9, ready: true };
        let adj = confirm(&predictor, Action::Buy, 0.95, &[]);
        assert_eq!(adj, MlAdjustment::Agreed { boosted_confidence: 1.0 });
    }

    #[test]
    fn hold_action_is_never_consulted() {
        let predictor = FixedPredictor { action: Action::Buy, prob: 0.9, ready: true };
        assert_eq!(confirm(&predictor, Action::Hold, 0.0, &[]), MlAdjustment::NotConsulted);
    }
}
