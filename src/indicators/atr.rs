// =============================================================================
// Average True Range (ATR) — Wilder's Smoothing Method
// =============================================================================
//
// True Range for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR is the smoothed average of TR:
//   ATR_0 = SMA of first `period` TR values
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
//
// The exit pipeline runs ATR with period 14.
// =============================================================================

use crate::market_data::Bar;

/// Compute the most recent ATR value from `bars` (oldest first).
///
/// Returns `None` when `period` is zero, fewer than `period + 1` bars are
/// available, or any intermediate value is non-finite.
pub fn latest_atr(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let mut tr_values: Vec<f64> = Vec::with_capacity(bars.len() - 1);
    for i in 1..bars.len() {
        let high = bars[i].high;
        let low = bars[i].low;
        let prev_close = bars[i - 1].close;

        let hl = high - low;
        let hc = (high - prev_close).abs();
        let lc = (low - prev_close).abs();
        tr_values.push(hl.max(hc).max(lc));
    }

    let period_f = period as f64;
    let mut atr = tr_values[..period].iter().sum::<f64>() / period_f;

    for &tr in &tr_values[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
    }

    atr.is_finite().then_some(atr)
}

/// ATR as a percentage of the most recent close. Used by the synthetic VIX.
pub fn latest_atr_pct(bars: &[Bar], period: usize) -> Option<f64> {
    let atr = latest_atr(bars, period)?;
    let last_close = bars.last()?.close;
    if last_close <= 0.0 {
        return None;
    }
    Some((atr / last_close) * 100.0)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            start_ts: Utc.timestamp_opt(0, 0).single().unwrap(),
            open,
            high,
            low,
            close,
            volume: 100,
            vwap_snapshot: close,
            synthetic: false,
        }
    }

    #[test]
    fn insufficient_data_returns_none() {
        let bars = vec![bar(100.0, 105.0, 95.0, 102.0); 10];
        assert!(latest_atr(&bars, 14).is_none());
        assert!(latest_atr(&bars, 0).is_none());
    }

    #[test]
    fn constant_range_converges() {
        let mut bars = Vec::new();
        for i in 0..30 {
            let base = 100.0 + i as f64 * 0.1;
            bars.push(bar(base, base + 5.0, base - 5.0, base));
        }
        let atr = latest_atr(&bars, 14).unwrap();
        assert!((atr - 10.0).abs() < 1.0, "expected ATR near 10.0, got {atr}");
    }

    #[test]
    fn gap_shows_in_true_range() {
        // |H - prevClose| dominates on a gap up.
        let bars = vec![
            bar(100.0, 105.0, 95.0, 95.0),
            bar(110.0, 115.0, 108.0, 112.0), // |115-95|=20 > 115-108=7
            bar(112.0, 118.0, 110.0, 115.0),
            bar(115.0, 120.0, 113.0, 118.0),
        ];
        let atr = latest_atr(&bars, 3).unwrap();
        assert!(atr > 7.0, "ATR should reflect the gap, got {atr}");
    }

    #[test]
    fn atr_pct_scales_by_close() {
        let bars: Vec<Bar> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64;
                bar(base, base + 3.0, base - 3.0, base + 1.0)
            })
            .collect();
        let pct = latest_atr_pct(&bars, 14).unwrap();
        assert!(pct > 0.0 && pct.is_finite());
    }

    #[test]
    fn nan_input_returns_none() {
        let mut bars = vec![bar(100.0, 105.0, 95.0, 100.0); 5];
        bars[1].high = f64::NAN;
        assert!(latest_atr(&bars, 3).is_none());
    }
}
