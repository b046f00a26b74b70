// =============================================================================
// Signal Engine — entry candidates, feature vectors, confidence scoring
// =============================================================================

pub mod engine;
pub mod features;
pub mod scorer;

pub use engine::{SignalCandidate, SignalEngine};
pub use features::FeatureVector;
pub use scorer::{ConfidenceScorer, HeuristicScorer, ScoreResult};
