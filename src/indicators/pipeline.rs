// =============================================================================
// Indicator Pipeline — one IndicatorSnapshot per finalized bar
// =============================================================================
//
// Pure function of the finalized bar stream plus the session VWAP stamped on
// each bar by the builder. Holds the trailing bar history it needs and
// nothing else; the engine feeds it bars and reads back snapshots.
//
// The synthetic VIX is a deterministic, monotone scalar:
//   synthetic_vix = atr_pct * (0.5 + 0.5 * min(volume_ratio, 3.0)) * 16.0
// scaled so normal index-futures conditions land in the mid/high teens.
// =============================================================================

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::market_data::Bar;
use crate::types::MarketRegime;

use super::atr::{latest_atr, latest_atr_pct};
use super::regime::{percentile_rank, RegimeThresholds, ATR_PERCENTILE_WINDOW};
use super::rsi::latest_rsi;
use super::vwap::VwapBands;

/// RSI look-back used by the entry pipeline.
pub const RSI_PERIOD: usize = 10;

/// ATR look-back used by the exit pipeline and the synthetic VIX.
pub const ATR_PERIOD: usize = 14;

/// SMA window used for trend strength and the volume baseline.
pub const SMA_PERIOD: usize = 20;

/// Bars retained for history-based calculations.
const HISTORY_CAP: usize = 400;

/// Bars scanned for swing highs/lows (support/resistance proximity).
const SR_LOOKBACK: usize = 60;

/// Per-bar indicator vector consumed by the signal and exit layers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub rsi: f64,
    pub atr: f64,
    pub vwap: f64,
    pub vwap_stddev: f64,
    pub vwap_distance_sigma: f64,
    pub volume_ratio: f64,
    pub synthetic_vix: f64,
    pub trend_strength: f64,
    pub sr_proximity_ticks: f64,
    pub market_regime: MarketRegime,
}

/// Stateful per-symbol indicator computation.
pub struct IndicatorPipeline {
    bars: VecDeque<Bar>,
    atr_history: VecDeque<f64>,
    /// (close − vwap) per bar, for the band deviation.
    deviations: VecDeque<f64>,
    thresholds: RegimeThresholds,
    tick_size: f64,
    last_snapshot: Option<IndicatorSnapshot>,
}

impl IndicatorPipeline {
    pub fn new(tick_size: f64, thresholds: RegimeThresholds) -> Self {
        Self {
            bars: VecDeque::with_capacity(HISTORY_CAP + 1),
            atr_history: VecDeque::with_capacity(ATR_PERCENTILE_WINDOW + 1),
            deviations: VecDeque::with_capacity(HISTORY_CAP + 1),
            thresholds,
            tick_size,
            last_snapshot: None,
        }
    }

    /// Ingest one finalized bar and compute its snapshot.
    ///
    /// Returns `None` while warming up (fewer than SMA_PERIOD + 1 bars or not
    /// enough data for RSI/ATR). Synthetic bars still advance the history so
    /// time-based state stays aligned with the tape.
    pub fn on_bar(&mut self, bar: &Bar) -> Option<IndicatorSnapshot> {
        self.bars.push_back(*bar);
        while self.bars.len() > HISTORY_CAP {
            self.bars.pop_front();
        }
        self.deviations.push_back(bar.close - bar.vwap_snapshot);
        while self.deviations.len() > HISTORY_CAP {
            self.deviations.pop_front();
        }

        let bars: Vec<Bar> = self.bars.iter().copied().collect();
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

        let rsi = latest_rsi(&closes, RSI_PERIOD)?;
        let atr = latest_atr(&bars, ATR_PERIOD)?;
        let atr_pct = latest_atr_pct(&bars, ATR_PERIOD)?;

        // ATR percentile ranks against history *before* this bar.
        let atr_hist: Vec<f64> = self.atr_history.iter().copied().collect();
        let atr_percentile = percentile_rank(&atr_hist, atr);
        self.atr_history.push_back(atr);
        while self.atr_history.len() > ATR_PERCENTILE_WINDOW {
            self.atr_history.pop_front();
        }

        if closes.len() < SMA_PERIOD + 1 {
            return None;
        }

        let sma20 = closes[closes.len() - SMA_PERIOD..].iter().sum::<f64>() / SMA_PERIOD as f64;
        let trend_strength = if sma20 > 0.0 {
            (bar.close - sma20).abs() / sma20
        } else {
            0.0
        };

        let volume_ratio = self.volume_ratio(bar);

        let deviations: Vec<f64> = self.deviations.iter().copied().collect();
        let bands = VwapBands::compute(&deviations, bar.close, bar.vwap_snapshot);

        let synthetic_vix = atr_pct * (0.5 + 0.5 * volume_ratio.min(3.0)) * 16.0;

        let market_regime = self.thresholds.classify(atr_percentile, trend_strength);

        let snapshot = IndicatorSnapshot {
            rsi,
            atr,
            vwap: bands.vwap,
            vwap_stddev: bands.stddev,
            vwap_distance_sigma: bands.distance_sigma,
            volume_ratio,
            synthetic_vix,
            trend_strength,
            sr_proximity_ticks: self.sr_proximity_ticks(bar.close),
            market_regime,
        };

        debug!(
            rsi = format!("{:.1}", rsi),
            atr = format!("{:.2}", atr),
            vwap_sigma = format!("{:.2}", snapshot.vwap_distance_sigma),
            regime = %market_regime,
            "indicator snapshot"
        );

        self.last_snapshot = Some(snapshot);
        Some(snapshot)
    }

    /// The snapshot of the most recent finalized bar.
    pub fn last(&self) -> Option<&IndicatorSnapshot> {
        self.last_snapshot.as_ref()
    }

    /// Band geometry of the most recent bar (for reversal/continuation tags).
    pub fn bands(&self) -> Option<VwapBands> {
        let bar = self.bars.back()?;
        let deviations: Vec<f64> = self.deviations.iter().copied().collect();
        Some(VwapBands::compute(
            &deviations,
            bar.close,
            bar.vwap_snapshot,
        ))
    }

    /// The finalized bar before the most recent one.
    pub fn prev_bar(&self) -> Option<&Bar> {
        let n = self.bars.len();
        if n >= 2 {
            self.bars.get(n - 2)
        } else {
            None
        }
    }

    /// Reset session-scoped state (VWAP deviations) at the session boundary.
    pub fn reset_session(&mut self) {
        self.deviations.clear();
    }

    fn volume_ratio(&self, bar: &Bar) -> f64 {
        let n = self.bars.len();
        if n < SMA_PERIOD + 1 {
            return 1.0;
        }
        // Baseline excludes the current bar (last element of history).
        let window: Vec<u64> = self
            .bars
            .iter()
            .rev()
            .skip(1)
            .take(SMA_PERIOD)
            .map(|b| b.volume)
            .collect();
        let mean = window.iter().sum::<u64>() as f64 / window.len() as f64;
        if mean > 0.0 {
            bar.volume as f64 / mean
        } else {
            1.0
        }
    }

    /// Distance in ticks from `close` to the nearest swing high or swing low
    /// over the SR look-back. A swing point is a local extremum with a
    /// two-bar fringe on both sides.
    fn sr_proximity_ticks(&self, close: f64) -> f64 {
        let n = self.bars.len();
        if n < 5 || self.tick_size <= 0.0 {
            return 1e9;
        }
        let start = n.saturating_sub(SR_LOOKBACK);
        let bars: Vec<&Bar> = self.bars.iter().skip(start).collect();

        let mut best: Option<f64> = None;
        for i in 2..bars.len().saturating_sub(2) {
            let h = bars[i].high;
            let is_swing_high = (i - 2..i).all(|j| bars[j].high <= h)
                && (i + 1..=i + 2).all(|j| bars[j].high <= h);
            let l = bars[i].low;
            let is_swing_low = (i - 2..i).all(|j| bars[j].low >= l)
                && (i + 1..=i + 2).all(|j| bars[j].low >= l);

            if is_swing_high {
                let d = (close - h).abs();
                best = Some(best.map_or(d, |b: f64| b.min(d)));
            }
            if is_swing_low {
                let d = (close - l).abs();
                best = Some(best.map_or(d, |b: f64| b.min(d)));
            }
        }

        match best {
            Some(d) => d / self.tick_size,
            None => 1e9,
        }
    }
}
