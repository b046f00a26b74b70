// =============================================================================
// Exit Parameters — the >=120-field bundle from the exit-params provider
// =============================================================================
//
// Every numeric knob of the exit ladder is supplied per-bar by a pluggable
// provider (externally a learned model). The bundle is a flat map keyed by
// well-known names; each base parameter also exists in a per-regime variant
// ("trailing_distance_ticks.high_vol_trending") that takes precedence when
// present.
//
// Contract: provider values are used verbatim — the manager never overrides
// a supplied field. Documented defaults apply only per-missing-field, or for
// the whole bundle when the provider fails (logged as
// EXIT_PROVIDER_FALLBACK by the engine).
// =============================================================================

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::types::MarketRegime;

/// Base parameter names with their documented defaults.
///
/// Units: `_ticks` are instrument ticks, `_r` are multiples of the initial
/// risk, `_pct` are fractions in [0, 1], `_minutes` are wall minutes,
/// `_bars` are 1-minute bars, `_mult` are dimensionless multipliers.
pub const BASE_DEFAULTS: &[(&str, f64)] = &[
    ("breakeven_threshold_ticks", 8.0),
    ("breakeven_offset_ticks", 1.0),
    ("trailing_min_profit_ticks", 12.0),
    ("trailing_distance_ticks", 8.0),
    ("partial_1_r", 1.0),
    ("partial_1_pct", 0.33),
    ("partial_2_r", 2.0),
    ("partial_2_pct", 0.33),
    ("partial_3_r", 3.0),
    ("partial_3_pct", 0.34),
    ("underwater_timeout_minutes", 7.0),
    ("sideways_timeout_minutes", 20.0),
    ("sideways_range_pct", 0.25),
    ("vol_spike_mult", 2.0),
    ("profit_drawdown_pct", 0.50),
    ("adverse_momentum_bars", 3.0),
    ("volume_exhaustion_threshold", 1.5),
    ("max_hold_duration_minutes", 90.0),
];

/// Per-regime scale factors applied to the base defaults when building the
/// default bundle: (suffix, time_scale, distance_scale).
///
/// High-volatility regimes get wider distances and shorter clocks; quiet
/// regimes the reverse.
const REGIME_SCALES: &[(&str, f64, f64)] = &[
    ("high_vol_choppy", 0.70, 1.40),
    ("high_vol_trending", 0.85, 1.50),
    ("normal_choppy", 0.90, 1.00),
    ("normal_trending", 1.10, 1.10),
    ("normal", 1.00, 1.00),
    ("low_vol_ranging", 1.20, 0.80),
    ("low_vol_trending", 1.30, 0.90),
];

/// Which axis a base parameter scales on when deriving regime variants.
fn scale_axis(name: &str) -> Axis {
    if name.ends_with("_minutes") || name.ends_with("_bars") {
        Axis::Time
    } else if name.ends_with("_ticks") {
        Axis::Distance
    } else {
        Axis::None
    }
}

enum Axis {
    Time,
    Distance,
    None,
}

/// The flat parameter bundle used by the exit manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitParams {
    values: BTreeMap<String, f64>,
}

impl ExitParams {
    pub fn from_map(values: BTreeMap<String, f64>) -> Self {
        Self { values }
    }

    /// The fully populated documented-default bundle: every base field plus
    /// every per-regime variant.
    pub fn defaults() -> Self {
        let mut values = BTreeMap::new();
        for &(name, base) in BASE_DEFAULTS {
            values.insert(name.to_string(), base);
            for &(suffix, time_scale, distance_scale) in REGIME_SCALES {
                let scaled = match scale_axis(name) {
                    Axis::Time => base * time_scale,
                    Axis::Distance => base * distance_scale,
                    Axis::None => base,
                };
                values.insert(format!("{name}.{suffix}"), scaled);
            }
        }
        Self { values }
    }

    /// Look up a parameter for the current regime: the regime-specific key
    /// wins, then the base key, then the documented default.
    pub fn get(&self, name: &str, regime: MarketRegime) -> f64 {
        let regime_key = format!("{}.{}", name, regime.param_suffix());
        if let Some(v) = self.values.get(&regime_key) {
            return *v;
        }
        if let Some(v) = self.values.get(name) {
            return *v;
        }
        BASE_DEFAULTS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
            .unwrap_or(0.0)
    }

    /// Set a field (tests and the ghost simulator's cloned bundles).
    pub fn set(&mut self, name: impl Into<String>, value: f64) {
        self.values.insert(name.into(), value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Default for ExitParams {
    fn default() -> Self {
        Self::defaults()
    }
}

// ---------------------------------------------------------------------------
// Provider seam
// ---------------------------------------------------------------------------

/// Feature context handed to the provider each bar.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExitFeatureVector {
    pub side: String,
    pub unrealized_r: f64,
    pub bars_held: f64,
    pub atr: f64,
    pub entry_atr: f64,
    pub synthetic_vix: f64,
    pub volume_ratio: f64,
    pub vwap_distance_sigma: f64,
    pub market_regime: String,
    pub peak_unrealized_r: f64,
    pub remaining_fraction: f64,
}

/// The second (and last) polymorphic seam: supplies the per-bar bundle.
pub trait ExitParamsProvider: Send + Sync {
    fn predict(&self, features: &ExitFeatureVector) -> Result<ExitParams>;
}

/// Built-in provider: always returns the documented defaults.
pub struct ConstantExitParams;

impl ExitParamsProvider for ConstantExitParams {
    fn predict(&self, _features: &ExitFeatureVector) -> Result<ExitParams> {
        Ok(ExitParams::defaults())
    }
}
