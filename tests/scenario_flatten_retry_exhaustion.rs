// Scenario: emergency flatten retries exhaust, then recover.
//
// The broker rejects five consecutive emergency attempts: the router
// surfaces FLATTEN_FAILED (critical) and the caller persists position state
// and keeps retrying on its 30-second cadence. Once the venue heals, the
// retry closes the position.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tempfile::tempdir;

use meridian_bot::broker::{BrokerError, SimBroker};
use meridian_bot::market_data::Tick;
use meridian_bot::persistence::StateStore;
use meridian_bot::position::PositionManager;
use meridian_bot::router::{new_shared_quote, ExitOutcome, OrderRouter};
use meridian_bot::types::{ExitReason, Side};

fn ts() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 2, 15, 0, 0).unwrap()
}

fn quote(bid: f64, ask: f64) -> Tick {
    Tick {
        ts: ts(),
        bid,
        bid_size: 20,
        ask,
        ask_size: 20,
        last: (bid + ask) / 2.0,
        last_size: 1,
    }
}

#[tokio::test(start_paused = true)]
async fn flatten_failure_persists_state_and_later_retry_succeeds() {
    let dir = tempdir().unwrap();
    let store = StateStore::new(dir.path()).unwrap();

    let broker = Arc::new(SimBroker::new("SCEN-6", 50_000.0));
    broker.set_quote(quote(5000.00, 5000.25));
    let shared = new_shared_quote();
    *shared.write() = Some(quote(5000.00, 5000.25));
    let mut router = OrderRouter::new(broker.clone(), "MES", 0.25, 10, 2.0, shared);

    let mut positions = PositionManager::new("MES");
    positions
        .open("sig-6", Side::Long, 2, 5000.0, 4998.0, 5004.0, 2.0, 0.7, 0.0, ts())
        .unwrap();

    // The venue rejects all five emergency attempts.
    for _ in 0..5 {
        broker.script_error(BrokerError::Rejected("gateway busy".to_string()));
    }

    let outcome = router
        .exit(Side::Long, 2, ExitReason::Emergency, 0.0)
        .await;
    assert_eq!(outcome, ExitOutcome::FlattenFailed);

    // Position state persists across the failure (the 30s retry loop needs
    // the snapshot if the process dies in between).
    store.save_position(positions.active().unwrap()).unwrap();
    let reloaded = store.load_position("MES").unwrap().unwrap();
    assert_eq!(reloaded.remaining_contracts, 2);
    assert_eq!(reloaded.side, Side::Long);

    // The venue heals; the next retry closes the book.
    let outcome = router
        .exit(Side::Long, 2, ExitReason::Emergency, 0.0)
        .await;
    match outcome {
        ExitOutcome::Closed { size, avg_price } => {
            assert_eq!(size, 2);
            assert_eq!(avg_price, 5000.00); // sells hit the bid
        }
        other => panic!("expected close after recovery, got {other:?}"),
    }

    let closed = positions
        .apply_exit_fill(ExitReason::Emergency, 2, 5000.0, 0.0, 0.25, 1.25, ts())
        .expect("position closes");
    assert_eq!(closed.final_exit_reason, Some(ExitReason::Emergency));
    store.clear_position("MES").unwrap();
    assert!(store.load_position("MES").unwrap().is_none());
}
