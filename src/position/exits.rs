// =============================================================================
// Exit Ladder — strict-priority rule evaluation per bar
// =============================================================================
//
// Evaluated on every finalized bar (and on stop-trigger ticks), in this
// order; the first firing rule acts and everything below it waits for the
// next bar:
//
//    1. Hard stop / target crossed        (STOP beats TARGET on a gap bar)
//    2. Session/event/license forced flatten
//    3. Breakeven arming                  (stop mutation, once)
//    4. Trailing arm + ratchet            (arming blocks; ratchets don't)
//    5. Scaled partials 1..3              (each at most once per position)
//    6. Underwater timeout
//    7. Sideways timeout
//    8. Volatility spike
//    9. Profit drawdown
//   10. Adverse momentum
//   11. Max hold duration
//
// Every numeric parameter comes from the ExitParams bundle verbatim; the
// regime-specific variant of a key wins when the provider supplied one.
//
// Stop ownership decides the exit label when the stop is hit: the initial
// stop reports STOP, a breakeven stop BREAKEVEN, a trailing stop TRAILING.
// =============================================================================

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::indicators::IndicatorSnapshot;
use crate::market_data::Bar;
use crate::types::{ExitDecision, ExitReason, OrderStrategy, Side};

use super::manager::{PositionManager, StopOwner};
use super::params::ExitParams;

pub struct ExitEvaluator {
    tick_size: f64,
}

impl ExitEvaluator {
    pub fn new(tick_size: f64) -> Self {
        Self { tick_size }
    }

    // -------------------------------------------------------------------------
    // Tick-level trigger (rule 1 only)
    // -------------------------------------------------------------------------

    /// Stop/target crossing on a trade print between bars. STOP beats TARGET.
    pub fn check_stop_tick(&self, manager: &PositionManager, price: f64) -> Option<ExitDecision> {
        let p = manager.active()?;
        let remaining = p.remaining_contracts;
        if remaining == 0 {
            return None;
        }

        let stop_hit = match p.side {
            Side::Long => price <= p.current_stop,
            Side::Short => price >= p.current_stop,
        };
        if stop_hit {
            return Some(ExitDecision {
                reason: Self::stop_reason(p.stop_owner),
                size: remaining,
                target_price: p.current_stop,
                order_strategy: OrderStrategy::Aggressive,
            });
        }

        let target_hit = match p.side {
            Side::Long => price >= p.initial_target,
            Side::Short => price <= p.initial_target,
        };
        if target_hit {
            return Some(ExitDecision {
                reason: ExitReason::Target,
                size: remaining,
                target_price: p.initial_target,
                order_strategy: OrderStrategy::Passive,
            });
        }

        None
    }

    // -------------------------------------------------------------------------
    // Bar-level evaluation
    // -------------------------------------------------------------------------

    /// Full ladder on a finalized bar. `forced` carries the session gate's
    /// flatten demand (rule 2). Mutates counters and possibly the stop.
    pub fn evaluate_bar(
        &self,
        manager: &mut PositionManager,
        bar: &Bar,
        snapshot: &IndicatorSnapshot,
        params: &ExitParams,
        forced: Option<ExitReason>,
        now: DateTime<Utc>,
    ) -> Option<ExitDecision> {
        manager.observe_price(bar.high);
        manager.observe_price(bar.low);
        self.update_bar_counters(manager, bar, snapshot, params);

        let regime = snapshot.market_regime;
        let p = manager.active()?;
        let remaining = p.remaining_contracts;
        if remaining == 0 {
            return None;
        }

        let side = p.side;
        let dir = side.direction();
        let entry = p.entry_price_avg;
        let risk = p.initial_risk();
        let fav_close = p.favorable_excursion(bar.close);
        let fav_ticks = fav_close / self.tick_size;

        // ── 1. Hard stop / target ───────────────────────────────────────
        let stop_hit = match side {
            Side::Long => bar.low <= p.current_stop,
            Side::Short => bar.high >= p.current_stop,
        };
        let target_hit = match side {
            Side::Long => bar.high >= p.initial_target,
            Side::Short => bar.low <= p.initial_target,
        };
        if stop_hit {
            // A gap bar can cross both levels; the stop wins.
            return Some(ExitDecision {
                reason: Self::stop_reason(p.stop_owner),
                size: remaining,
                target_price: p.current_stop,
                order_strategy: OrderStrategy::Aggressive,
            });
        }
        if target_hit {
            return Some(ExitDecision {
                reason: ExitReason::Target,
                size: remaining,
                target_price: p.initial_target,
                order_strategy: OrderStrategy::Passive,
            });
        }

        // ── 2. Forced flatten from the session layer ────────────────────
        if let Some(reason) = forced {
            return Some(ExitDecision {
                reason,
                size: remaining,
                target_price: bar.close,
                order_strategy: OrderStrategy::Aggressive,
            });
        }

        // ── 3. Breakeven arming ─────────────────────────────────────────
        if !p.breakeven_armed {
            let threshold = params.get("breakeven_threshold_ticks", regime);
            if fav_ticks >= threshold {
                let offset = params.get("breakeven_offset_ticks", regime) * self.tick_size;
                let new_stop = entry + dir * offset;
                if let Some(p) = manager.active_mut() {
                    p.breakeven_armed = true;
                }
                if manager.adjust_stop(new_stop, StopOwner::Breakeven, "breakeven_armed", now) {
                    info!(stop = new_stop, "breakeven armed");
                    return None; // rule fired; lower rules wait a bar
                }
            }
        }

        // ── 4. Trailing ─────────────────────────────────────────────────
        let p = manager.active()?;
        let trailing_min = params.get("trailing_min_profit_ticks", regime);
        if fav_ticks >= trailing_min {
            let distance = params.get("trailing_distance_ticks", regime) * self.tick_size;
            let peak_price = entry + dir * p.max_favorable_excursion;
            let candidate = peak_price - dir * distance;
            let arming = !p.trailing_armed;
            if arming {
                if let Some(p) = manager.active_mut() {
                    p.trailing_armed = true;
                }
            }
            let moved = manager.adjust_stop(candidate, StopOwner::Trailing, "trailing", now);
            if moved {
                debug!(stop = candidate, "trailing stop ratcheted");
            }
            if arming && moved {
                return None; // arming blocks lower rules this bar
            }
        }

        // ── 5. Scaled partials ──────────────────────────────────────────
        let p = manager.active()?;
        if risk > 0.0 {
            let fav_r = fav_close / risk;
            for level in 1..=3u8 {
                if p.partial_taken(level) {
                    continue;
                }
                let r_key = format!("partial_{level}_r");
                let pct_key = format!("partial_{level}_pct");
                let trigger_r = params.get(&r_key, regime);
                if trigger_r <= 0.0 || fav_r < trigger_r {
                    continue;
                }
                let pct = params.get(&pct_key, regime);
                let size =
                    ((p.contracts as f64 * pct).floor() as u32).clamp(1, p.remaining_contracts);
                let reason = match level {
                    1 => ExitReason::Partial1,
                    2 => ExitReason::Partial2,
                    _ => ExitReason::Partial3,
                };
                return Some(ExitDecision {
                    reason,
                    size,
                    target_price: bar.close,
                    order_strategy: OrderStrategy::Passive,
                });
            }
        }

        // ── 6. Underwater timeout ───────────────────────────────────────
        let underwater_limit = params.get("underwater_timeout_minutes", regime);
        if underwater_limit > 0.0 && p.underwater_bars as f64 >= underwater_limit {
            return Some(Self::market_out(ExitReason::UnderwaterTimeout, p.remaining_contracts, bar));
        }

        // ── 7. Sideways timeout ─────────────────────────────────────────
        let sideways_limit = params.get("sideways_timeout_minutes", regime);
        if sideways_limit > 0.0 && p.sideways_bars as f64 >= sideways_limit {
            return Some(Self::market_out(ExitReason::SidewaysTimeout, p.remaining_contracts, bar));
        }

        // ── 8. Volatility spike ─────────────────────────────────────────
        let vol_mult = params.get("vol_spike_mult", regime);
        if vol_mult > 0.0 && p.entry_atr > 0.0 && snapshot.atr >= vol_mult * p.entry_atr {
            return Some(Self::market_out(ExitReason::VolatilitySpike, p.remaining_contracts, bar));
        }

        // ── 9. Profit drawdown ──────────────────────────────────────────
        let dd_pct = params.get("profit_drawdown_pct", regime);
        let peak = p.max_favorable_excursion;
        if dd_pct > 0.0 && peak > 0.0 {
            let drawdown = peak - fav_close;
            if drawdown >= dd_pct * peak && fav_close < peak {
                return Some(Self::market_out(ExitReason::ProfitDrawdown, p.remaining_contracts, bar));
            }
        }

        // ── 10. Adverse momentum ────────────────────────────────────────
        let adverse_limit = params.get("adverse_momentum_bars", regime);
        if adverse_limit > 0.0 && p.adverse_bars as f64 >= adverse_limit {
            return Some(Self::market_out(ExitReason::AdverseMomentum, p.remaining_contracts, bar));
        }

        // ── 11. Max hold ────────────────────────────────────────────────
        let max_hold = params.get("max_hold_duration_minutes", regime);
        if max_hold > 0.0 && p.bars_held as f64 >= max_hold {
            return Some(Self::market_out(ExitReason::TimeMax, p.remaining_contracts, bar));
        }

        None
    }

    fn market_out(reason: ExitReason, size: u32, bar: &Bar) -> ExitDecision {
        ExitDecision {
            reason,
            size,
            target_price: bar.close,
            order_strategy: OrderStrategy::Aggressive,
        }
    }

    fn stop_reason(owner: StopOwner) -> ExitReason {
        match owner {
            StopOwner::Initial => ExitReason::Stop,
            StopOwner::Breakeven => ExitReason::Breakeven,
            StopOwner::Trailing => ExitReason::Trailing,
        }
    }

    /// Advance the per-bar counters feeding rules 6, 7, and 10.
    fn update_bar_counters(
        &self,
        manager: &mut PositionManager,
        bar: &Bar,
        snapshot: &IndicatorSnapshot,
        params: &ExitParams,
    ) {
        let regime = snapshot.market_regime;
        let Some(p) = manager.active_mut() else {
            return;
        };

        p.bars_held += 1;

        let fav = p.favorable_excursion(bar.close);
        if fav <= 0.0 {
            p.underwater_bars += 1;
        } else {
            p.underwater_bars = 0;
        }

        let risk = p.initial_risk();
        let range_pct = params.get("sideways_range_pct", regime);
        if risk > 0.0 && (bar.close - p.entry_price_avg).abs() <= range_pct * risk {
            p.sideways_bars += 1;
        } else {
            p.sideways_bars = 0;
        }

        let against = match p.side {
            Side::Long => bar.close < bar.open,
            Side::Short => bar.close > bar.open,
        };
        let heavy = snapshot.volume_ratio >= params.get("volume_exhaustion_threshold", regime);
        if against && heavy {
            p.adverse_bars += 1;
        } else {
            p.adverse_bars = 0;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarketRegime;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).single().unwrap()
    }

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            start_ts: ts(),
            open,
            high,
            low,
            close,
            volume: 500,
            vwap_snapshot: close,
            synthetic: false,
        }
    }

    fn snapshot() -> IndicatorSnapshot {
        IndicatorSnapshot {
            rsi: 50.0,
            atr: 2.0,
            vwap: 5000.0,
            vwap_stddev: 2.0,
            vwap_distance_sigma: 0.0,
            volume_ratio: 1.0,
            synthetic_vix: 15.0,
            trend_strength: 0.002,
            sr_proximity_ticks: 20.0,
            market_regime: MarketRegime::Normal,
        }
    }

    /// Params with regime variants stripped so base values apply everywhere.
    fn flat_params() -> ExitParams {
        let mut p = ExitParams::from_map(Default::default());
        for &(name, value) in crate::position::params::BASE_DEFAULTS {
            p.set(name, value);
        }
        p
    }

    /// Long 3 @ 5000, stop 4998 (8 ticks), target 5006.
    fn open_long(size: u32) -> (PositionManager, ExitEvaluator) {
        let mut m = PositionManager::new("MES");
        m.open(
            "sig-1", Side::Long, size, 5000.0, 4998.0, 5006.0, 2.0, 0.7, 0.0, ts(),
        )
        .unwrap();
        (m, ExitEvaluator::new(0.25))
    }

    #[test]
    fn stop_beats_target_on_gap_bar() {
        let (mut m, e) = open_long(3);
        // One bar spans both the stop and the target.
        let wild = bar(5000.0, 5007.0, 4997.0, 5001.0);
        let d = e
            .evaluate_bar(&mut m, &wild, &snapshot(), &flat_params(), None, ts())
            .unwrap();
        assert_eq!(d.reason, ExitReason::Stop);
        assert_eq!(d.size, 3);
        assert_eq!(d.order_strategy, OrderStrategy::Aggressive);
    }

    #[test]
    fn target_fires_when_stop_untouched() {
        let (mut m, e) = open_long(3);
        let d = e
            .evaluate_bar(
                &mut m,
                &bar(5004.0, 5006.25, 5003.0, 5005.0),
                &snapshot(),
                &flat_params(),
                None,
                ts(),
            )
            .unwrap();
        assert_eq!(d.reason, ExitReason::Target);
        assert_eq!(d.order_strategy, OrderStrategy::Passive);
        assert_eq!(d.target_price, 5006.0);
    }

    #[test]
    fn forced_flatten_outranks_everything_but_the_stop() {
        let (mut m, e) = open_long(3);
        let d = e
            .evaluate_bar(
                &mut m,
                &bar(5000.0, 5001.0, 4999.5, 5000.5),
                &snapshot(),
                &flat_params(),
                Some(ExitReason::SessionFlatten),
                ts(),
            )
            .unwrap();
        assert_eq!(d.reason, ExitReason::SessionFlatten);
        assert_eq!(d.size, 3);
    }

    #[test]
    fn breakeven_arms_once_and_blocks_the_bar() {
        let (mut m, e) = open_long(3);
        // +8 ticks = +2.0 points: breakeven threshold.
        let d = e.evaluate_bar(
            &mut m,
            &bar(5001.0, 5002.1, 5000.5, 5002.0),
            &snapshot(),
            &flat_params(),
            None,
            ts(),
        );
        assert!(d.is_none(), "arming bar must not exit");
        let p = m.active().unwrap();
        assert!(p.breakeven_armed);
        // Long breakeven stop: entry + 1 tick offset.
        assert_eq!(p.current_stop, 5000.25);
        assert_eq!(p.stop_owner, StopOwner::Breakeven);

        // A later adverse print through the armed stop exits as BREAKEVEN.
        let d = e
            .evaluate_bar(
                &mut m,
                &bar(5001.0, 5001.5, 5000.0, 5000.1),
                &snapshot(),
                &flat_params(),
                None,
                ts(),
            )
            .unwrap();
        assert_eq!(d.reason, ExitReason::Breakeven);
    }

    #[test]
    fn trailing_ratchets_monotonically() {
        let (mut m, e) = open_long(3);
        let mut params = flat_params();
        // Keep partials out of the way for this test.
        params.set("partial_1_r", 0.0);
        params.set("partial_2_r", 0.0);
        params.set("partial_3_r", 0.0);
        params.set("breakeven_threshold_ticks", 0.0);

        // Run to +12 ticks (trailing_min): arms and sets stop at peak - 8t.
        e.evaluate_bar(&mut m, &bar(5001.0, 5003.0, 5000.5, 5003.0), &snapshot(), &params, None, ts());
        {
            let p = m.active().unwrap();
            assert!(p.trailing_armed);
            // Peak 5003, distance 2.0 -> stop 5001.
            assert_eq!(p.current_stop, 5001.0);
        }

        // New peak 5005: stop follows to 5003.
        e.evaluate_bar(&mut m, &bar(5003.0, 5005.0, 5002.8, 5004.5), &snapshot(), &params, None, ts());
        assert_eq!(m.active().unwrap().current_stop, 5003.0);

        // Pullback bar that stays above the stop: stop must not retreat.
        e.evaluate_bar(&mut m, &bar(5004.0, 5004.2, 5003.2, 5003.5), &snapshot(), &params, None, ts());
        assert_eq!(m.active().unwrap().current_stop, 5003.0);

        // Retrace through the trailing stop: TRAILING exit.
        let d = e
            .evaluate_bar(&mut m, &bar(5003.5, 5003.6, 5002.5, 5002.8), &snapshot(), &params, None, ts())
            .unwrap();
        assert_eq!(d.reason, ExitReason::Trailing);
    }

    #[test]
    fn partials_fire_in_order_and_only_once() {
        let (mut m, e) = open_long(3);
        let mut params = flat_params();
        params.set("breakeven_threshold_ticks", 1000.0);
        params.set("trailing_min_profit_ticks", 1000.0);
        params.set("profit_drawdown_pct", 0.0);
        params.set("partial_1_r", 1.0);
        params.set("partial_1_pct", 0.34);
        params.set("partial_2_r", 2.0);

        // +1R = +2.0 points: partial 1 for floor(3*0.34)=1 contract.
        let d = e
            .evaluate_bar(&mut m, &bar(5001.0, 5002.2, 5000.5, 5002.0), &snapshot(), &params, None, ts())
            .unwrap();
        assert_eq!(d.reason, ExitReason::Partial1);
        assert_eq!(d.size, 1);
        m.apply_exit_fill(ExitReason::Partial1, 1, 5002.0, 0.0, 0.25, 1.25, ts());

        // Same favourable level again: partial 1 must NOT re-fire.
        let d = e.evaluate_bar(
            &mut m,
            &bar(5002.0, 5002.5, 5001.5, 5002.0),
            &snapshot(),
            &params,
            None,
            ts(),
        );
        assert!(d.is_none());

        // +2R: partial 2.
        let d = e
            .evaluate_bar(&mut m, &bar(5003.0, 5004.2, 5002.5, 5004.0), &snapshot(), &params, None, ts())
            .unwrap();
        assert_eq!(d.reason, ExitReason::Partial2);
    }

    #[test]
    fn underwater_timeout_counts_consecutive_bars() {
        let (mut m, e) = open_long(2);
        let mut params = flat_params();
        params.set("underwater_timeout_minutes", 3.0);
        params.set("sideways_timeout_minutes", 0.0);

        let under = bar(4999.5, 4999.8, 4999.0, 4999.5);
        assert!(e.evaluate_bar(&mut m, &under, &snapshot(), &params, None, ts()).is_none());
        assert!(e.evaluate_bar(&mut m, &under, &snapshot(), &params, None, ts()).is_none());
        let d = e
            .evaluate_bar(&mut m, &under, &snapshot(), &params, None, ts())
            .unwrap();
        assert_eq!(d.reason, ExitReason::UnderwaterTimeout);
    }

    #[test]
    fn underwater_counter_resets_on_profit() {
        let (mut m, e) = open_long(2);
        let mut params = flat_params();
        params.set("underwater_timeout_minutes", 2.0);
        params.set("sideways_timeout_minutes", 0.0);
        params.set("breakeven_threshold_ticks", 1000.0);

        let under = bar(4999.5, 4999.8, 4999.2, 4999.5);
        e.evaluate_bar(&mut m, &under, &snapshot(), &params, None, ts());
        // A profitable bar resets the clock (close above entry, stop/target
        // untouched, no other rule near firing).
        e.evaluate_bar(&mut m, &bar(5000.2, 5000.6, 5000.1, 5000.5), &snapshot(), &params, None, ts());
        assert_eq!(m.active().unwrap().underwater_bars, 0);
    }

    #[test]
    fn sideways_timeout() {
        let (mut m, e) = open_long(2);
        let mut params = flat_params();
        params.set("sideways_timeout_minutes", 2.0);
        params.set("underwater_timeout_minutes", 0.0);
        params.set("profit_drawdown_pct", 0.0);
        // Risk 2.0, range 0.25 -> +/- 0.5 around entry counts as sideways.
        let flat = bar(5000.1, 5000.4, 4999.9, 5000.2);
        assert!(e.evaluate_bar(&mut m, &flat, &snapshot(), &params, None, ts()).is_none());
        let d = e
            .evaluate_bar(&mut m, &flat, &snapshot(), &params, None, ts())
            .unwrap();
        assert_eq!(d.reason, ExitReason::SidewaysTimeout);
    }

    #[test]
    fn volatility_spike_exits() {
        let (mut m, e) = open_long(2);
        let mut snap = snapshot();
        snap.atr = 4.5; // entry ATR 2.0, mult 2.0 -> trigger at 4.0
        let d = e
            .evaluate_bar(
                &mut m,
                &bar(5000.2, 5000.8, 5000.1, 5000.6),
                &snap,
                &flat_params(),
                None,
                ts(),
            )
            .unwrap();
        assert_eq!(d.reason, ExitReason::VolatilitySpike);
    }

    #[test]
    fn profit_drawdown_gives_back_half() {
        let (mut m, e) = open_long(2);
        let mut params = flat_params();
        params.set("breakeven_threshold_ticks", 1000.0);
        params.set("trailing_min_profit_ticks", 1000.0);
        params.set("partial_1_r", 0.0);
        params.set("partial_2_r", 0.0);
        params.set("partial_3_r", 0.0);
        params.set("profit_drawdown_pct", 0.5);

        // Peak +4.0 points.
        e.evaluate_bar(&mut m, &bar(5001.0, 5004.0, 5000.8, 5003.8), &snapshot(), &params, None, ts());
        // Give back more than half the peak (close 5001.5: fav 1.5 < 2.0).
        let d = e
            .evaluate_bar(&mut m, &bar(5003.0, 5003.2, 5001.2, 5001.5), &snapshot(), &params, None, ts())
            .unwrap();
        assert_eq!(d.reason, ExitReason::ProfitDrawdown);
    }

    #[test]
    fn adverse_momentum_needs_volume() {
        let (mut m, e) = open_long(2);
        let mut params = flat_params();
        params.set("adverse_momentum_bars", 2.0);
        params.set("underwater_timeout_minutes", 0.0);
        params.set("sideways_timeout_minutes", 0.0);
        params.set("profit_drawdown_pct", 0.0);

        let mut heavy = snapshot();
        heavy.volume_ratio = 2.0;
        let down = bar(5000.5, 5000.6, 4999.9, 5000.1);

        assert!(e.evaluate_bar(&mut m, &down, &heavy, &params, None, ts()).is_none());
        let d = e
            .evaluate_bar(&mut m, &down, &heavy, &params, None, ts())
            .unwrap();
        assert_eq!(d.reason, ExitReason::AdverseMomentum);

        // Without volume the counter never builds.
        let (mut m2, e2) = open_long(2);
        let light = snapshot(); // volume_ratio 1.0 < 1.5
        assert!(e2.evaluate_bar(&mut m2, &down, &light, &params, None, ts()).is_none());
        assert!(e2.evaluate_bar(&mut m2, &down, &light, &params, None, ts()).is_none());
        assert_eq!(m2.active().unwrap().adverse_bars, 0);
    }

    #[test]
    fn max_hold_fires_last() {
        let (mut m, e) = open_long(2);
        let mut params = flat_params();
        params.set("max_hold_duration_minutes", 3.0);
        params.set("underwater_timeout_minutes", 0.0);
        params.set("sideways_timeout_minutes", 0.0);
        params.set("breakeven_threshold_ticks", 1000.0);

        let drifting = bar(5000.6, 5001.0, 5000.4, 5000.8);
        assert!(e.evaluate_bar(&mut m, &drifting, &snapshot(), &params, None, ts()).is_none());
        assert!(e.evaluate_bar(&mut m, &drifting, &snapshot(), &params, None, ts()).is_none());
        let d = e
            .evaluate_bar(&mut m, &drifting, &snapshot(), &params, None, ts())
            .unwrap();
        assert_eq!(d.reason, ExitReason::TimeMax);
    }

    #[test]
    fn tick_level_stop_trigger() {
        let (m, e) = open_long(2);
        assert!(e.check_stop_tick(&m, 4999.0).is_none());
        let d = e.check_stop_tick(&m, 4998.0).unwrap();
        assert_eq!(d.reason, ExitReason::Stop);
        assert_eq!(d.size, 2);

        let d = e.check_stop_tick(&m, 5006.0).unwrap();
        assert_eq!(d.reason, ExitReason::Target);
    }

    #[test]
    fn short_side_mirrors() {
        let mut m = PositionManager::new("MES");
        m.open("sig-2", Side::Short, 2, 5000.0, 5002.0, 4994.0, 2.0, 0.7, 0.0, ts())
            .unwrap();
        let e = ExitEvaluator::new(0.25);

        // Price falls 8 ticks: breakeven arms below entry.
        let d = e.evaluate_bar(
            &mut m,
            &bar(4999.0, 4999.2, 4997.9, 4998.0),
            &snapshot(),
            &flat_params(),
            None,
            ts(),
        );
        assert!(d.is_none());
        let p = m.active().unwrap();
        assert!(p.breakeven_armed);
        assert_eq!(p.current_stop, 4999.75); // entry - 1 tick
    }
}
