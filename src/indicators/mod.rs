// =============================================================================
// Indicator Pipeline — per-bar technical state for the signal engine
// =============================================================================

pub mod atr;
pub mod pipeline;
pub mod regime;
pub mod rsi;
pub mod vwap;

pub use pipeline::{IndicatorPipeline, IndicatorSnapshot};
pub use regime::RegimeThresholds;
