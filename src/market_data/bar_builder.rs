// =============================================================================
// Bar Builder — 1-minute bucket aggregation with exactly-once finalization
// =============================================================================
//
// Ticks accumulate into minute buckets keyed by floor(timestamp / 60). When a
// tick arrives in a later bucket, every bucket between the working one and
// the new one is finalized exactly once:
//   - the working bucket closes with its accumulated OHLCV;
//   - empty gap minutes produce synthetic bars (o=h=l=c=previous close,
//     volume 0, synthetic=true).
//
// The builder also owns the intraday VWAP accumulators (Σ price×size, Σ size)
// so every finalized bar carries the session VWAP at its close. The engine
// resets them at the session boundary.
//
// A timer may force finalization when no ticks arrive; `flush_until` closes
// all buckets strictly before the given minute.
// =============================================================================

use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use super::{Bar, Tick};

/// Minute-bucket key: floor(epoch_seconds / 60).
fn minute_key(ts: DateTime<Utc>) -> i64 {
    ts.timestamp().div_euclid(60)
}

fn minute_start(key: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(key * 60, 0).single().unwrap_or_default()
}

struct WorkingBar {
    key: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: u64,
}

/// Builds finalized 1-minute bars from the accepted tick stream.
pub struct BarBuilder {
    working: Option<WorkingBar>,
    prev_close: Option<f64>,
    // Intraday VWAP accumulators; reset at the session boundary.
    vwap_price_volume: f64,
    vwap_volume: f64,
    finalized_count: u64,
}

impl BarBuilder {
    pub fn new() -> Self {
        Self {
            working: None,
            prev_close: None,
            vwap_price_volume: 0.0,
            vwap_volume: 0.0,
            finalized_count: 0,
        }
    }

    /// Ingest an accepted tick. Returns every bar finalized by this tick
    /// (oldest first): zero on an in-bucket update, one on a normal minute
    /// rollover, more when gap minutes have to be filled synthetically.
    pub fn ingest(&mut self, tick: &Tick) -> Vec<Bar> {
        let key = minute_key(tick.ts);
        let mut finalized = Vec::new();

        match self.working.as_ref().map(|w| w.key) {
            Some(k) if k == key => {
                if let Some(w) = &mut self.working {
                    w.high = w.high.max(tick.last);
                    w.low = w.low.min(tick.last);
                    w.close = tick.last;
                    w.volume += tick.last_size as u64;
                }
            }
            Some(k) if key > k => {
                if let Some(w) = self.working.take() {
                    finalized.push(self.finalize_bar(w));
                }
                // Fill any fully-empty minutes between the closed bucket and
                // the new tick's bucket.
                for gap in (k + 1)..key {
                    finalized.push(self.synthetic_bar(gap));
                }
                self.start_bucket(key, tick);
            }
            Some(_) => {
                // Bucket older than the working one. The feed already drops
                // out-of-order ticks, so this is unreachable in practice;
                // ignore rather than corrupt the working bar.
                return finalized;
            }
            None => {
                self.start_bucket(key, tick);
            }
        }

        // VWAP accumulates on trades only.
        if tick.last_size > 0 {
            self.vwap_price_volume += tick.last * tick.last_size as f64;
            self.vwap_volume += tick.last_size as f64;
        }

        finalized
    }

    /// Close every bucket strictly before `now`'s minute. Called from the
    /// minute-boundary timer so bars finalize even when ticks stop.
    pub fn flush_until(&mut self, now: DateTime<Utc>) -> Vec<Bar> {
        let boundary = minute_key(now);
        let mut finalized = Vec::new();

        if self.working.as_ref().map_or(false, |w| w.key < boundary) {
            if let Some(w) = self.working.take() {
                let closed_key = w.key;
                finalized.push(self.finalize_bar(w));
                for gap in (closed_key + 1)..boundary {
                    finalized.push(self.synthetic_bar(gap));
                }
            }
        }
        finalized
    }

    /// Reset intraday VWAP accumulators at the session boundary.
    pub fn reset_session(&mut self) {
        self.vwap_price_volume = 0.0;
        self.vwap_volume = 0.0;
        debug!("bar builder session VWAP accumulators reset");
    }

    /// Read-only view of the in-progress bar, if any. Exposed to indicator
    /// consumers only; the signal engine never sees partial bars.
    pub fn partial(&self) -> Option<Bar> {
        self.working.as_ref().map(|w| Bar {
            start_ts: minute_start(w.key),
            open: w.open,
            high: w.high,
            low: w.low,
            close: w.close,
            volume: w.volume,
            vwap_snapshot: self.session_vwap_or(w.close),
            synthetic: false,
        })
    }

    pub fn finalized_count(&self) -> u64 {
        self.finalized_count
    }

    /// Session VWAP so far, or `fallback` before the first trade.
    fn session_vwap_or(&self, fallback: f64) -> f64 {
        if self.vwap_volume > 0.0 {
            self.vwap_price_volume / self.vwap_volume
        } else {
            fallback
        }
    }

    fn start_bucket(&mut self, key: i64, tick: &Tick) {
        self.working = Some(WorkingBar {
            key,
            open: tick.last,
            high: tick.last,
            low: tick.last,
            close: tick.last,
            volume: tick.last_size as u64,
        });
    }

    fn finalize_bar(&mut self, w: WorkingBar) -> Bar {
        let bar = Bar {
            start_ts: minute_start(w.key),
            open: w.open,
            high: w.high,
            low: w.low,
            close: w.close,
            volume: w.volume,
            vwap_snapshot: self.session_vwap_or(w.close),
            synthetic: false,
        };
        self.prev_close = Some(w.close);
        self.finalized_count += 1;
        bar
    }

    fn synthetic_bar(&mut self, key: i64) -> Bar {
        let close = self.prev_close.unwrap_or(0.0);
        self.finalized_count += 1;
        debug!(minute = key, close, "synthetic bar emitted for empty minute");
        Bar {
            start_ts: minute_start(key),
            open: close,
            high: close,
            low: close,
            close,
            volume: 0,
            vwap_snapshot: self.session_vwap_or(close),
            synthetic: true,
        }
    }
}

impl Default for BarBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 - 1_700_000_000 % 60 + secs, 0)
            .single()
            .unwrap()
    }

    fn trade(secs: i64, price: f64, size: u32) -> Tick {
        Tick {
            ts: ts(secs),
            bid: price - 0.25,
            bid_size: 10,
            ask: price + 0.25,
            ask_size: 10,
            last: price,
            last_size: size,
        }
    }

    #[test]
    fn single_minute_aggregation() {
        let mut b = BarBuilder::new();
        assert!(b.ingest(&trade(0, 5000.0, 2)).is_empty());
        assert!(b.ingest(&trade(20, 5002.0, 1)).is_empty());
        assert!(b.ingest(&trade(40, 4999.0, 3)).is_empty());

        // Rollover into the next minute finalizes exactly one bar.
        let bars = b.ingest(&trade(65, 5001.0, 1));
        assert_eq!(bars.len(), 1);
        let bar = bars[0];
        assert_eq!(bar.open, 5000.0);
        assert_eq!(bar.high, 5002.0);
        assert_eq!(bar.low, 4999.0);
        assert_eq!(bar.close, 4999.0);
        assert_eq!(bar.volume, 6);
        assert!(!bar.synthetic);
    }

    #[test]
    fn gap_minutes_become_synthetic_bars() {
        let mut b = BarBuilder::new();
        b.ingest(&trade(0, 5000.0, 1));

        // Next tick lands three minutes later: one real bar + two synthetic.
        let bars = b.ingest(&trade(185, 5004.0, 1));
        assert_eq!(bars.len(), 3);
        assert!(!bars[0].synthetic);
        assert!(bars[1].synthetic);
        assert!(bars[2].synthetic);
        for sb in &bars[1..] {
            assert_eq!(sb.open, 5000.0);
            assert_eq!(sb.close, 5000.0);
            assert_eq!(sb.volume, 0);
        }
    }

    #[test]
    fn flush_until_closes_working_bar() {
        let mut b = BarBuilder::new();
        b.ingest(&trade(0, 5000.0, 1));

        let bars = b.flush_until(ts(60));
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, 5000.0);
        assert_eq!(b.finalized_count(), 1);

        // Flushing again is a no-op — exactly-once finalization.
        assert!(b.flush_until(ts(60)).is_empty());
        assert!(b.flush_until(ts(120)).is_empty());
    }

    #[test]
    fn vwap_snapshot_tracks_session() {
        let mut b = BarBuilder::new();
        b.ingest(&trade(0, 100.0, 1));
        b.ingest(&trade(10, 200.0, 1));
        let bars = b.ingest(&trade(65, 200.0, 0));
        // VWAP of 100×1 and 200×1 = 150.
        assert_eq!(bars[0].vwap_snapshot, 150.0);

        b.reset_session();
        let bars = b.flush_until(ts(120));
        // After reset with no trades, VWAP falls back to the bar close.
        assert_eq!(bars[0].vwap_snapshot, bars[0].close);
    }

    #[test]
    fn partial_bar_is_readable() {
        let mut b = BarBuilder::new();
        assert!(b.partial().is_none());
        b.ingest(&trade(0, 5000.0, 2));
        b.ingest(&trade(30, 5003.0, 1));

        let partial = b.partial().unwrap();
        assert_eq!(partial.open, 5000.0);
        assert_eq!(partial.close, 5003.0);
        assert_eq!(partial.volume, 3);
    }

    #[test]
    fn volume_sums_trade_sizes_only() {
        let mut b = BarBuilder::new();
        b.ingest(&trade(0, 5000.0, 5));
        // Quote-only update (no trade size).
        b.ingest(&trade(10, 5000.0, 0));
        let bars = b.ingest(&trade(65, 5001.0, 1));
        assert_eq!(bars[0].volume, 5);
    }
}
