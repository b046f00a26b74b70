// =============================================================================
// Relative Strength Index (RSI) — Wilder's Smoothing
// =============================================================================
//
// Step 1 — Price deltas from consecutive closes.
// Step 2 — Seed average gain / loss with the SMA of the first `period`
//          gains / losses.
// Step 3 — Wilder's exponential smoothing:
//            avg_gain = (prev_avg_gain * (period - 1) + gain) / period
// Step 4 — RS  = avg_gain / avg_loss,  RSI = 100 - 100 / (1 + RS)
//
// The entry pipeline runs RSI with period 10.
// =============================================================================

/// Compute the most recent RSI value over `closes` with the given `period`.
///
/// Returns `None` when:
/// - `period == 0`
/// - fewer than `period + 1` closes are available
/// - the calculation produces a non-finite value
pub fn latest_rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let period_f = period as f64;

    // Seed with the SMA of the first `period` deltas.
    let (sum_gain, sum_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l + d.abs())
            }
        });

    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    for &delta in &deltas[period..] {
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { delta.abs() } else { 0.0 };
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
    }

    let rsi = if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0 // No movement at all.
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };

    rsi.is_finite().then_some(rsi)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_data_returns_none() {
        assert!(latest_rsi(&[], 10).is_none());
        assert!(latest_rsi(&[1.0; 10], 10).is_none());
        assert!(latest_rsi(&[1.0, 2.0], 0).is_none());
    }

    #[test]
    fn all_gains_is_100() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        let rsi = latest_rsi(&closes, 10).unwrap();
        assert!((rsi - 100.0).abs() < 1e-10, "got {rsi}");
    }

    #[test]
    fn all_losses_is_0() {
        let closes: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        let rsi = latest_rsi(&closes, 10).unwrap();
        assert!(rsi.abs() < 1e-10, "got {rsi}");
    }

    #[test]
    fn flat_market_is_neutral() {
        let rsi = latest_rsi(&[100.0; 30], 10).unwrap();
        assert!((rsi - 50.0).abs() < 1e-10, "got {rsi}");
    }

    #[test]
    fn stays_in_range() {
        let closes = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08,
            45.89, 46.03, 44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
        ];
        let rsi = latest_rsi(&closes, 10).unwrap();
        assert!((0.0..=100.0).contains(&rsi), "RSI {rsi} out of range");
    }
}
