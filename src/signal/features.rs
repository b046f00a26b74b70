// =============================================================================
// Feature Vector — the closed per-decision schema
// =============================================================================
//
// Every entry decision (taken, rejected, or ghost) is described by this
// fixed, named schema. Downstream trainers consume it from the experience
// log, so fields are only ever added, never renamed; unknown fields in older
// records are ignored on load.
// =============================================================================

use serde::{Deserialize, Serialize};

/// Canonical features captured at decision time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FeatureVector {
    // --- Indicator state -----------------------------------------------------
    #[serde(default)]
    pub rsi: f64,
    #[serde(default)]
    pub atr: f64,
    #[serde(default)]
    pub atr_pct: f64,
    #[serde(default)]
    pub vwap: f64,
    #[serde(default)]
    pub vwap_stddev: f64,
    #[serde(default)]
    pub vwap_distance_sigma: f64,
    #[serde(default)]
    pub volume_ratio: f64,
    #[serde(default)]
    pub synthetic_vix: f64,
    #[serde(default)]
    pub trend_strength: f64,
    #[serde(default)]
    pub sr_proximity_ticks: f64,
    #[serde(default)]
    pub market_regime: String,

    // --- Bar geometry --------------------------------------------------------
    #[serde(default)]
    pub bar_body_ticks: f64,
    #[serde(default)]
    pub bar_range_ticks: f64,
    #[serde(default)]
    pub upper_wick_ticks: f64,
    #[serde(default)]
    pub lower_wick_ticks: f64,
    #[serde(default)]
    pub bar_return_pct: f64,
    #[serde(default)]
    pub prev_bar_return_pct: f64,
    #[serde(default)]
    pub three_bar_momentum_pct: f64,
    #[serde(default)]
    pub gap_from_prev_close_ticks: f64,

    // --- Book state ----------------------------------------------------------
    #[serde(default)]
    pub spread_ticks: f64,
    #[serde(default)]
    pub avg_spread_ticks: f64,
    #[serde(default)]
    pub imbalance_ratio: f64,
    #[serde(default)]
    pub imbalance_signal: String,
    #[serde(default)]
    pub bid_size: f64,
    #[serde(default)]
    pub ask_size: f64,
    #[serde(default)]
    pub expected_slippage_ticks: f64,

    // --- Session clock -------------------------------------------------------
    #[serde(default)]
    pub minutes_since_session_open: f64,
    #[serde(default)]
    pub minutes_to_maintenance: f64,
    #[serde(default)]
    pub et_hour: f64,
    #[serde(default)]
    pub day_of_week: f64,

    // --- Session performance -------------------------------------------------
    #[serde(default)]
    pub daily_pnl: f64,
    #[serde(default)]
    pub daily_trades: f64,
    #[serde(default)]
    pub consecutive_wins: f64,
    #[serde(default)]
    pub consecutive_losses: f64,

    // --- Candidate geometry --------------------------------------------------
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub trade_type: String,
    #[serde(default)]
    pub entry_ref_price: f64,
    #[serde(default)]
    pub initial_stop_ticks: f64,
    #[serde(default)]
    pub initial_target_ticks: f64,
    #[serde(default)]
    pub risk_reward: f64,
}

impl FeatureVector {
    /// Number of named fields in the schema. Kept in sync by the test below;
    /// the experience contract requires at least 32.
    pub const FIELD_COUNT: usize = 40;
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_has_at_least_32_fields() {
        let fv = FeatureVector::default();
        let value = serde_json::to_value(&fv).unwrap();
        let obj = value.as_object().unwrap();
        assert!(
            obj.len() >= 32,
            "feature schema shrank to {} fields",
            obj.len()
        );
        assert_eq!(obj.len(), FeatureVector::FIELD_COUNT);
    }

    #[test]
    fn unknown_fields_are_ignored_on_load() {
        let json = r#"{ "rsi": 55.0, "some_future_field": 1.0 }"#;
        let fv: FeatureVector = serde_json::from_str(json).unwrap();
        assert_eq!(fv.rsi, 55.0);
        assert_eq!(fv.atr, 0.0);
    }

    #[test]
    fn roundtrip() {
        let mut fv = FeatureVector::default();
        fv.rsi = 28.5;
        fv.side = "LONG".to_string();
        fv.market_regime = "NORMAL_TRENDING".to_string();

        let json = serde_json::to_string(&fv).unwrap();
        let back: FeatureVector = serde_json::from_str(&json).unwrap();
        assert_eq!(fv, back);
    }
}
