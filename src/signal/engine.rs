// =============================================================================
// Signal Engine — one candidate per finalized bar, at most
// =============================================================================
//
// Evaluated on every finalized bar while the risk gate permits new entries.
// The entry predicate is a VWAP-band setup in two flavours:
//
//   Fade (band rejection):  the bar stretches through the 2.0σ band and
//     closes back inside with an RSI extreme and above-average volume.
//   Join (VWAP reclaim):    on a trending tape, the close crosses the VWAP
//     with RSI in the healthy band.
//
// Whatever fired, the trade_type tag follows price action alone: REVERSAL if
// the previous bar touched the configured band on the side opposite the
// signal, CONTINUATION otherwise.
//
// Initial stop and target are ATR-derived and rounded to the tick grid; the
// risk/reward gate is applied by the caller against config.min_risk_reward.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::indicators::vwap::VwapBands;
use crate::indicators::IndicatorSnapshot;
use crate::market_data::Bar;
use crate::types::{Side, TradeType};

use super::features::FeatureVector;

/// Band multiple used by both the entry predicate and the trade_type tag.
const ENTRY_BAND_SIGMA: f64 = 2.0;

/// RSI extremes for the fade setup.
const RSI_OVERSOLD: f64 = 35.0;
const RSI_OVERBOUGHT: f64 = 65.0;

/// Minimum participation for the fade setup.
const FADE_MIN_VOLUME_RATIO: f64 = 1.2;

/// Stop and target distances in ATR multiples.
const STOP_ATR_MULT: f64 = 1.25;
const TARGET_ATR_MULT: f64 = 2.5;

/// Floor on the stop distance in ticks.
const MIN_STOP_TICKS: f64 = 4.0;

/// One would-be entry, with everything needed to size, route, and record it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalCandidate {
    pub id: String,
    pub side: Side,
    pub entry_ref_price: f64,
    pub initial_stop: f64,
    pub initial_target: f64,
    /// Which predicate produced the candidate.
    pub reason: String,
    pub trade_type: TradeType,
    /// Filled in by the scorer; 0.0 until scored.
    pub confidence: f64,
    pub feature_vector: FeatureVector,
    /// true when the candidate was rejected but is still recorded for
    /// counterfactual learning.
    pub ghost_flag: bool,
}

impl SignalCandidate {
    /// Stop distance in price units.
    pub fn initial_risk(&self) -> f64 {
        (self.entry_ref_price - self.initial_stop).abs()
    }

    pub fn risk_reward(&self) -> f64 {
        let risk = self.initial_risk();
        if risk > 0.0 {
            (self.initial_target - self.entry_ref_price).abs() / risk
        } else {
            0.0
        }
    }
}

/// Stateless evaluation over the finalized bar stream.
pub struct SignalEngine {
    tick_size: f64,
}

impl SignalEngine {
    pub fn new(tick_size: f64) -> Self {
        Self { tick_size }
    }

    /// Evaluate the just-closed bar. Returns at most one candidate, with
    /// `confidence` unset and `ghost_flag` false; the caller scores and
    /// gates it.
    ///
    /// `features` carries the decision-time context the caller already
    /// assembled (indicators, book, session clock); side-specific fields are
    /// filled in here.
    pub fn evaluate(
        &self,
        bar: &Bar,
        snapshot: &IndicatorSnapshot,
        bands: &VwapBands,
        prev_bar: Option<&Bar>,
        mut features: FeatureVector,
    ) -> Option<SignalCandidate> {
        // Synthetic bars carry no information; never trade them.
        if bar.synthetic {
            return None;
        }

        let (side, reason) = self.entry_predicate(bar, snapshot, bands)?;

        let trade_type = self.classify_trade_type(side, prev_bar, bands);

        let atr = snapshot.atr;
        let stop_distance = (atr * STOP_ATR_MULT).max(MIN_STOP_TICKS * self.tick_size);
        let target_distance = atr * TARGET_ATR_MULT;

        let entry_ref_price = bar.close;
        let dir = side.direction();
        let initial_stop = self.round_to_tick(entry_ref_price - dir * stop_distance);
        let initial_target = self.round_to_tick(entry_ref_price + dir * target_distance);

        features.side = side.to_string();
        features.trade_type = trade_type.to_string();
        features.entry_ref_price = entry_ref_price;
        features.initial_stop_ticks = (entry_ref_price - initial_stop).abs() / self.tick_size;
        features.initial_target_ticks = (initial_target - entry_ref_price).abs() / self.tick_size;
        features.risk_reward = if features.initial_stop_ticks > 0.0 {
            features.initial_target_ticks / features.initial_stop_ticks
        } else {
            0.0
        };

        debug!(
            side = %side,
            reason = %reason,
            trade_type = %trade_type,
            entry = entry_ref_price,
            stop = initial_stop,
            target = initial_target,
            "signal candidate"
        );

        Some(SignalCandidate {
            id: Uuid::new_v4().to_string(),
            side,
            entry_ref_price,
            initial_stop,
            initial_target,
            reason,
            trade_type,
            confidence: 0.0,
            feature_vector: features,
            ghost_flag: false,
        })
    }

    fn entry_predicate(
        &self,
        bar: &Bar,
        snapshot: &IndicatorSnapshot,
        bands: &VwapBands,
    ) -> Option<(Side, String)> {
        // Band geometry is meaningless until the deviation window warms up.
        if bands.stddev <= 0.0 {
            return None;
        }

        let lower = bands.lower(ENTRY_BAND_SIGMA);
        let upper = bands.upper(ENTRY_BAND_SIGMA);

        // Fade long: stretched below the band, closed back inside, with an
        // oversold RSI and real participation.
        if bar.low <= lower
            && bar.close > lower
            && snapshot.rsi <= RSI_OVERSOLD
            && snapshot.volume_ratio >= FADE_MIN_VOLUME_RATIO
        {
            return Some((Side::Long, format!("band_fade_long@{ENTRY_BAND_SIGMA}sigma")));
        }

        // Fade short: mirror image.
        if bar.high >= upper
            && bar.close < upper
            && snapshot.rsi >= RSI_OVERBOUGHT
            && snapshot.volume_ratio >= FADE_MIN_VOLUME_RATIO
        {
            return Some((Side::Short, format!("band_fade_short@{ENTRY_BAND_SIGMA}sigma")));
        }

        // Join long: trending tape reclaiming VWAP from below.
        if snapshot.market_regime.is_trending()
            && bar.open <= bands.vwap
            && bar.close > bands.vwap
            && (45.0..=RSI_OVERBOUGHT).contains(&snapshot.rsi)
        {
            return Some((Side::Long, "vwap_reclaim_long".to_string()));
        }

        // Join short: losing VWAP from above.
        if snapshot.market_regime.is_trending()
            && bar.open >= bands.vwap
            && bar.close < bands.vwap
            && (RSI_OVERSOLD..=55.0).contains(&snapshot.rsi)
        {
            return Some((Side::Short, "vwap_loss_short".to_string()));
        }

        None
    }

    /// REVERSAL iff the previous bar touched the band opposite the signal
    /// direction; CONTINUATION otherwise.
    fn classify_trade_type(
        &self,
        side: Side,
        prev_bar: Option<&Bar>,
        bands: &VwapBands,
    ) -> TradeType {
        let prev = match prev_bar {
            Some(b) => b,
            None => return TradeType::Continuation,
        };
        let touched_opposite = match side {
            // A long fading a downside stretch: the opposite-direction band
            // is the lower one.
            Side::Long => bands.touched_lower(prev.low, ENTRY_BAND_SIGMA),
            Side::Short => bands.touched_upper(prev.high, ENTRY_BAND_SIGMA),
        };
        if touched_opposite {
            TradeType::Reversal
        } else {
            TradeType::Continuation
        }
    }

    fn round_to_tick(&self, price: f64) -> f64 {
        if self.tick_size > 0.0 {
            (price / self.tick_size).round() * self.tick_size
        } else {
            price
        }
    }
}
