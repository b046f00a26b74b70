// Scenario: a short that never works gets timed out.
//
// Short @ 6820; unrealized stays at or below zero for seven consecutive
// minutes. Rule 6 (underwater timeout) closes it at market.

use chrono::{TimeZone, Utc};

use meridian_bot::indicators::IndicatorSnapshot;
use meridian_bot::market_data::Bar;
use meridian_bot::position::{params::BASE_DEFAULTS, ExitEvaluator, ExitParams, PositionManager};
use meridian_bot::types::{ExitReason, MarketRegime, OrderStrategy, Side};

const TICK: f64 = 0.25;

fn ts() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 2, 15, 0, 0).unwrap()
}

fn bar(open: f64, high: f64, low: f64, close: f64) -> Bar {
    Bar {
        start_ts: ts(),
        open,
        high,
        low,
        close,
        volume: 300,
        vwap_snapshot: close,
        synthetic: false,
    }
}

fn snapshot() -> IndicatorSnapshot {
    IndicatorSnapshot {
        rsi: 50.0,
        atr: 2.0,
        vwap: 6820.0,
        vwap_stddev: 2.0,
        vwap_distance_sigma: 0.0,
        volume_ratio: 1.0,
        synthetic_vix: 14.0,
        trend_strength: 0.001,
        sr_proximity_ticks: 30.0,
        market_regime: MarketRegime::NormalChoppy,
    }
}

fn params() -> ExitParams {
    let mut p = ExitParams::from_map(Default::default());
    for &(name, value) in BASE_DEFAULTS {
        p.set(name, value);
    }
    p.set("underwater_timeout_minutes", 7.0);
    p.set("sideways_timeout_minutes", 0.0);
    p.set("profit_drawdown_pct", 0.0);
    p.set("adverse_momentum_bars", 0.0);
    p
}

#[test]
fn seven_underwater_minutes_time_the_short_out() {
    let mut positions = PositionManager::new("MNQ");
    let evaluator = ExitEvaluator::new(TICK);
    let params = params();

    // Short 2 @ 6820, stop 6822, target 6814.
    positions
        .open("sig-3", Side::Short, 2, 6820.0, 6822.0, 6814.0, 2.0, 0.7, 0.0, ts())
        .unwrap();

    // Six bars drifting just above entry: underwater but inside the stop.
    for i in 0..6 {
        let d = evaluator.evaluate_bar(
            &mut positions,
            &bar(6820.4, 6820.9, 6820.1, 6820.5),
            &snapshot(),
            &params,
            None,
            ts(),
        );
        assert!(d.is_none(), "bar {i} should not exit yet");
    }
    assert_eq!(positions.active().unwrap().underwater_bars, 6);

    // Minute seven: the timeout fires, at market, full remaining size.
    let d = evaluator
        .evaluate_bar(
            &mut positions,
            &bar(6820.4, 6820.9, 6820.1, 6820.5),
            &snapshot(),
            &params,
            None,
            ts(),
        )
        .expect("underwater timeout fires on the 7th minute");
    assert_eq!(d.reason, ExitReason::UnderwaterTimeout);
    assert_eq!(d.size, 2);
    assert_eq!(d.order_strategy, OrderStrategy::Aggressive);

    let closed = positions
        .apply_exit_fill(d.reason, d.size, 6820.5, 0.0, TICK, 1.25, ts())
        .expect("position closes");
    // Two ticks against, two contracts: -$5 at $1.25/tick.
    assert!((closed.realized_pnl + 5.0).abs() < 1e-9);
}
