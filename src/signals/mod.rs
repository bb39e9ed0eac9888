// =============================================================================
// Signals Module
// =============================================================================
//
// Signal processing pipeline for the trading engine: fixed-weight indicator
// voting (`fusion`) with an optional ML confirmation layer (`ml`).

pub mod fusion;
pub mod ml;

pub use fusion::{apply_mtf_adjustment, confidence_floor, fuse, higher_timeframe_label, FusionResult, Vote};
pub use ml::{confirm, MlAdjustment, MlPredictor, NullPredictor};
