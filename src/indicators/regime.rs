// =============================================================================
// Market Regime Classification — ATR percentile × trend strength
// =============================================================================
//
// The regime tag is a coarse two-axis classification:
//   volatility axis — percentile rank of the current ATR within a trailing
//                     window of ATR values;
//   trend axis      — |close − SMA20| / SMA20.
//
// Thresholds are parameterized so they can be recalibrated against recorded
// experience files without touching code.
// =============================================================================

use crate::types::MarketRegime;

/// Number of trailing ATR values ranked for the percentile.
pub const ATR_PERCENTILE_WINDOW: usize = 120;

/// Classification thresholds.
#[derive(Debug, Clone, Copy)]
pub struct RegimeThresholds {
    /// ATR percentile at or above which volatility is "high".
    pub high_vol_percentile: f64,
    /// ATR percentile at or below which volatility is "low".
    pub low_vol_percentile: f64,
    /// Trend strength at or above which the tape is "trending".
    pub trending_min: f64,
    /// Trend strength below which a normal-vol tape is "choppy".
    pub choppy_max: f64,
}

impl Default for RegimeThresholds {
    fn default() -> Self {
        Self {
            high_vol_percentile: 0.80,
            low_vol_percentile: 0.20,
            trending_min: 0.003,
            choppy_max: 0.0015,
        }
    }
}

impl RegimeThresholds {
    /// Classify the current bar.
    pub fn classify(&self, atr_percentile: f64, trend_strength: f64) -> MarketRegime {
        let trending = trend_strength >= self.trending_min;

        if atr_percentile >= self.high_vol_percentile {
            if trending {
                MarketRegime::HighVolTrending
            } else {
                MarketRegime::HighVolChoppy
            }
        } else if atr_percentile <= self.low_vol_percentile {
            if trending {
                MarketRegime::LowVolTrending
            } else {
                MarketRegime::LowVolRanging
            }
        } else if trending {
            MarketRegime::NormalTrending
        } else if trend_strength < self.choppy_max {
            MarketRegime::NormalChoppy
        } else {
            MarketRegime::Normal
        }
    }
}

/// Percentile rank of `value` within `history` (fraction of entries <= value).
///
/// Returns 0.5 when the history is empty (no evidence either way).
pub fn percentile_rank(history: &[f64], value: f64) -> f64 {
    if history.is_empty() {
        return 0.5;
    }
    let below = history.iter().filter(|&&v| v <= value).count();
    below as f64 / history.len() as f64
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_vol_split() {
        let t = RegimeThresholds::default();
        assert_eq!(t.classify(0.9, 0.005), MarketRegime::HighVolTrending);
        assert_eq!(t.classify(0.9, 0.001), MarketRegime::HighVolChoppy);
    }

    #[test]
    fn low_vol_split() {
        let t = RegimeThresholds::default();
        assert_eq!(t.classify(0.1, 0.004), MarketRegime::LowVolTrending);
        assert_eq!(t.classify(0.1, 0.001), MarketRegime::LowVolRanging);
    }

    #[test]
    fn normal_band_split() {
        let t = RegimeThresholds::default();
        assert_eq!(t.classify(0.5, 0.004), MarketRegime::NormalTrending);
        assert_eq!(t.classify(0.5, 0.001), MarketRegime::NormalChoppy);
        // Between choppy_max and trending_min: plain NORMAL.
        assert_eq!(t.classify(0.5, 0.002), MarketRegime::Normal);
    }

    #[test]
    fn percentile_rank_basics() {
        let hist = vec![1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile_rank(&hist, 0.5), 0.0);
        assert_eq!(percentile_rank(&hist, 2.0), 0.5);
        assert_eq!(percentile_rank(&hist, 10.0), 1.0);
        assert_eq!(percentile_rank(&[], 1.0), 0.5);
    }
}
