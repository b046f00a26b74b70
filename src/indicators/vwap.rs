// =============================================================================
// VWAP Bands — session VWAP ± k·σ of close deviations
// =============================================================================
//
// The session VWAP itself is accumulated by the bar builder and stamped on
// every finalized bar. This module derives the band geometry: a rolling
// standard deviation of (close − vwap) over the last DEVIATION_WINDOW bars,
// band levels at ±1.5σ, ±2.0σ, ±2.5σ, ±3.0σ, and the signed distance of the
// current close in σ units.
// =============================================================================

/// Bars of (close − vwap) history used for the rolling deviation.
pub const DEVIATION_WINDOW: usize = 30;

/// Band multiples published to the signal layer.
pub const BAND_SIGMAS: [f64; 4] = [1.5, 2.0, 2.5, 3.0];

/// Geometry of the VWAP bands on one bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VwapBands {
    pub vwap: f64,
    /// Rolling std of (close − vwap); zero during warmup or a flat tape.
    pub stddev: f64,
    /// Signed distance of the close from VWAP in σ units (0 when σ == 0).
    pub distance_sigma: f64,
}

impl VwapBands {
    /// Compute band state from the deviation history (oldest first) and the
    /// current bar's close and VWAP snapshot.
    pub fn compute(deviations: &[f64], close: f64, vwap: f64) -> Self {
        let stddev = rolling_std(deviations);
        let distance_sigma = if stddev > 0.0 {
            (close - vwap) / stddev
        } else {
            0.0
        };
        Self {
            vwap,
            stddev,
            distance_sigma,
        }
    }

    /// Upper band level at `k` sigmas.
    pub fn upper(&self, k: f64) -> f64 {
        self.vwap + k * self.stddev
    }

    /// Lower band level at `k` sigmas.
    pub fn lower(&self, k: f64) -> f64 {
        self.vwap - k * self.stddev
    }

    /// Whether a bar with the given high touched or exceeded the upper band.
    pub fn touched_upper(&self, high: f64, k: f64) -> bool {
        self.stddev > 0.0 && high >= self.upper(k)
    }

    /// Whether a bar with the given low touched or exceeded the lower band.
    pub fn touched_lower(&self, low: f64, k: f64) -> bool {
        self.stddev > 0.0 && low <= self.lower(k)
    }
}

/// Population standard deviation over the trailing window.
pub fn rolling_std(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let start = n.saturating_sub(DEVIATION_WINDOW);
    let slice = &values[start..];
    let len = slice.len() as f64;

    let mean = slice.iter().sum::<f64>() / len;
    let var = slice.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / len;
    var.sqrt()
}
