// =============================================================================
// Confidence Scorer — the pluggable entry-quality seam
// =============================================================================
//
// The learning model lives outside the engine. The contract here:
//   - `score` is deterministic for identical input when the result is not an
//     exploration decision;
//   - exploration decisions are sized to one contract by the caller;
//   - a scorer failure rejects the candidate with SCORER_UNAVAILABLE but the
//     ghost experience is still recorded.
//
// HeuristicScorer is the built-in fallback: a deterministic logistic blend of
// the features that historically separate winners from losers on this setup.
// Exploration is paced by a candidate counter so a given exploration_rate
// produces the same exploration schedule on every identical replay.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::features::FeatureVector;

/// Outcome of scoring one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    /// Entry quality in [0, 1].
    pub confidence: f64,
    /// When true the engine still acts but sizes to one contract.
    pub is_exploration: bool,
}

/// The only polymorphic seam between the engine and the learning stack.
pub trait ConfidenceScorer: Send + Sync {
    fn score(&self, features: &FeatureVector) -> Result<ScoreResult>;
}

/// Deterministic built-in scorer.
pub struct HeuristicScorer {
    exploration_every: u64,
    seen: AtomicU64,
}

impl HeuristicScorer {
    /// `exploration_rate` in [0, 1]; zero disables exploration entirely.
    pub fn new(exploration_rate: f64) -> Self {
        let exploration_every = if exploration_rate > 0.0 {
            (1.0 / exploration_rate.clamp(0.001, 1.0)).round() as u64
        } else {
            0
        };
        Self {
            exploration_every,
            seen: AtomicU64::new(0),
        }
    }
}

impl ConfidenceScorer for HeuristicScorer {
    fn score(&self, features: &FeatureVector) -> Result<ScoreResult> {
        // RSI extremity: 0 at 50, 1 at 0/100 — rewards stretched tape for
        // reversals and is roughly neutral for continuations.
        let rsi_extremity = ((features.rsi - 50.0).abs() / 50.0).clamp(0.0, 1.0);

        // Distance from VWAP in sigma, saturating at 3σ.
        let sigma_stretch = (features.vwap_distance_sigma.abs() / 3.0).clamp(0.0, 1.0);

        // Participation: volume_ratio 1.0 is average; 2.0+ is conviction.
        let participation = ((features.volume_ratio - 0.8) / 1.2).clamp(0.0, 1.0);

        // Trendiness helps continuations, hurts fading moves; the blend is
        // symmetric because trade_type already shaped the candidate.
        let trend = (features.trend_strength / 0.005).clamp(0.0, 1.0);

        // Risk/reward above the configured floor adds a little.
        let rr_bonus = ((features.risk_reward - 1.5) / 2.0).clamp(0.0, 0.5);

        let raw = 0.30 * rsi_extremity
            + 0.25 * sigma_stretch
            + 0.20 * participation
            + 0.15 * trend
            + 0.10 * rr_bonus;

        // Logistic squash keeps the output well inside (0, 1).
        let confidence = 1.0 / (1.0 + (-4.0 * (raw - 0.45)).exp());

        let n = self.seen.fetch_add(1, Ordering::Relaxed) + 1;
        let is_exploration = self.exploration_every > 0 && n % self.exploration_every == 0;

        Ok(ScoreResult {
            confidence,
            is_exploration,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn features(rsi: f64, sigma: f64, volume_ratio: f64) -> FeatureVector {
        FeatureVector {
            rsi,
            vwap_distance_sigma: sigma,
            volume_ratio,
            trend_strength: 0.002,
            risk_reward: 2.0,
            ..Default::default()
        }
    }

    #[test]
    fn confidence_stays_in_unit_interval() {
        let scorer = HeuristicScorer::new(0.0);
        for rsi in [0.0, 25.0, 50.0, 75.0, 100.0] {
            for sigma in [-3.0, 0.0, 3.0] {
                let r = scorer.score(&features(rsi, sigma, 1.0)).unwrap();
                assert!((0.0..=1.0).contains(&r.confidence));
            }
        }
    }

    #[test]
    fn stretched_tape_scores_higher() {
        let scorer = HeuristicScorer::new(0.0);
        let weak = scorer.score(&features(50.0, 0.0, 0.8)).unwrap();
        let strong = scorer.score(&features(20.0, -2.5, 2.0)).unwrap();
        assert!(strong.confidence > weak.confidence);
    }

    #[test]
    fn deterministic_for_identical_input() {
        let a = HeuristicScorer::new(0.0);
        let b = HeuristicScorer::new(0.0);
        let f = features(30.0, -2.0, 1.5);
        assert_eq!(a.score(&f).unwrap(), b.score(&f).unwrap());
    }

    #[test]
    fn exploration_schedule_is_paced_and_reproducible() {
        let scorer = HeuristicScorer::new(0.25); // every 4th candidate
        let f = features(40.0, -1.0, 1.0);
        let flags: Vec<bool> = (0..8)
            .map(|_| scorer.score(&f).unwrap().is_exploration)
            .collect();
        assert_eq!(
            flags,
            vec![false, false, false, true, false, false, false, true]
        );

        // Zero rate never explores.
        let never = HeuristicScorer::new(0.0);
        assert!(!(0..20).any(|_| never.score(&f).unwrap().is_exploration));
    }
}
