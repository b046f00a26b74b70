// Scenario: passive entry fill, then target hit.
//
// Strong bid, 1-tick spread: the router rests a limit at the bid and gets
// filled. A later bar trades through the target; the full position exits
// TARGET at the target price and both experience records land on disk.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tempfile::tempdir;

use meridian_bot::broker::SimBroker;
use meridian_bot::experience::ExperienceRecorder;
use meridian_bot::indicators::IndicatorSnapshot;
use meridian_bot::market_data::{Bar, Tick};
use meridian_bot::position::{ExitEvaluator, ExitParams, PositionManager};
use meridian_bot::router::{new_shared_quote, EntryContext, EntryOutcome, ExitOutcome, OrderRouter};
use meridian_bot::signal::{FeatureVector, SignalCandidate};
use meridian_bot::types::{ExitReason, MarketRegime, Side, TradeType};

const TICK: f64 = 0.25;
const TICK_VALUE: f64 = 12.50; // ES
const COMMISSION: f64 = 0.62;

fn ts() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 2, 14, 30, 0).unwrap()
}

fn quote(bid: f64, ask: f64, bid_size: u32, ask_size: u32) -> Tick {
    Tick {
        ts: ts(),
        bid,
        bid_size,
        ask,
        ask_size,
        last: (bid + ask) / 2.0,
        last_size: 1,
    }
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
        rsi: 40.0,
        atr: 2.0,
        vwap: 4500.0,
        vwap_stddev: 2.0,
        vwap_distance_sigma: 0.0,
        volume_ratio: 1.2,
        synthetic_vix: 14.0,
        trend_strength: 0.002,
        sr_proximity_ticks: 30.0,
        market_regime: MarketRegime::Normal,
    }
}

fn candidate() -> SignalCandidate {
    SignalCandidate {
        id: "sig-target".to_string(),
        side: Side::Long,
        entry_ref_price: 4500.0,
        initial_stop: 4498.0,
        initial_target: 4504.0,
        reason: "band_fade_long".to_string(),
        trade_type: TradeType::Reversal,
        confidence: 0.70,
        feature_vector: FeatureVector {
            atr: 2.0,
            ..Default::default()
        },
        ghost_flag: false,
    }
}

#[tokio::test(start_paused = true)]
async fn passive_fill_then_target_exit() {
    let dir = tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("experiences")).unwrap();

    let broker = Arc::new(SimBroker::new("SCEN-1", 50_000.0));
    let shared = new_shared_quote();
    let mut router = OrderRouter::new(broker.clone(), "ES", TICK, 10, 2.0, shared.clone());
    let mut positions = PositionManager::new("ES");
    let evaluator = ExitEvaluator::new(TICK);
    let mut recorder = ExperienceRecorder::new(dir.path(), TICK, TICK_VALUE, COMMISSION);

    // Strong bid (imbalance > 3), 1-tick spread: the router goes passive.
    let q = quote(4500.00, 4500.25, 40, 10);
    broker.set_quote(q);
    *shared.write() = Some(q);

    let ctx = EntryContext {
        imbalance_aligned: true,
        spread_at_or_below_mean: true,
        expected_slippage_ticks: 1.0,
    };

    // The offer comes down to our resting bid: passive fill at 4500.00.
    broker.set_quote(quote(4499.75, 4500.00, 20, 20));
    let outcome = router.enter(Side::Long, 3, 4500.0, ctx).await;

    let (avg_price, filled, passive) = match outcome {
        EntryOutcome::Filled {
            avg_price,
            size,
            passive,
            ..
        } => (avg_price, size, passive),
        other => panic!("expected a fill, got {other:?}"),
    };
    assert!(passive, "strong aligned book must route passively");
    assert_eq!(avg_price, 4500.00);
    assert_eq!(filled, 3);

    let c = candidate();
    positions
        .open(&c.id, c.side, filled, avg_price, c.initial_stop, c.initial_target, 2.0, c.confidence, 0.0, ts())
        .unwrap();
    let position_id = positions.active().unwrap().id.clone();
    recorder.record_taken(&c, &position_id, ts());

    // A later bar closes at 4504.25, through the 4504.00 target.
    let decision = evaluator
        .evaluate_bar(
            &mut positions,
            &bar(4503.0, 4504.25, 4502.5, 4504.25),
            &snapshot(),
            &ExitParams::defaults(),
            None,
            ts(),
        )
        .expect("target must fire");
    assert_eq!(decision.reason, ExitReason::Target);
    assert_eq!(decision.size, 3);
    assert_eq!(decision.target_price, 4504.00);

    // The market is through the target: the exit limit fills there.
    broker.set_quote(quote(4504.25, 4504.50, 20, 20));
    let exit = router
        .exit(Side::Long, decision.size, decision.reason, decision.target_price)
        .await;
    let (exit_price, exit_size) = match exit {
        ExitOutcome::Closed { avg_price, size } => (avg_price, size),
        other => panic!("expected a close, got {other:?}"),
    };
    assert_eq!(exit_price, 4504.00);
    assert_eq!(exit_size, 3);

    let closed = positions
        .apply_exit_fill(decision.reason, exit_size, exit_price, COMMISSION, TICK, TICK_VALUE, ts())
        .expect("position must close");

    // 16 ticks x $12.50 x 3 = $600, minus commissions.
    let expected = 600.0 - COMMISSION * 3.0;
    assert!((closed.realized_pnl - expected).abs() < 1e-9);

    recorder.record_close(&closed, &ExitParams::defaults(), false, ts());

    // Signal experience: took_trade with a TARGET outcome.
    let signals =
        std::fs::read_to_string(dir.path().join("experiences/signal_experiences_v2.jsonl")).unwrap();
    let last: serde_json::Value = serde_json::from_str(signals.lines().last().unwrap()).unwrap();
    assert_eq!(last["took_trade"], true);
    assert_eq!(last["outcome"]["exit_reason"], "TARGET");
    assert!((last["outcome"]["pnl"].as_f64().unwrap() - expected).abs() < 1e-9);

    // Exit experience exists and references the same position.
    let exits =
        std::fs::read_to_string(dir.path().join("experiences/exit_experiences_v2.jsonl")).unwrap();
    let exit_record: serde_json::Value = serde_json::from_str(exits.lines().last().unwrap()).unwrap();
    assert_eq!(exit_record["position_id"], position_id.as_str());
    assert_eq!(exit_record["outcome"]["final_reason"], "TARGET");
}
