// =============================================================================
// Clock — injected wall + monotonic time
// =============================================================================
//
// Every component reads time through this trait; nothing calls Utc::now()
// directly. Live trading uses SystemClock; backtests use SimClock, which is
// advanced by the replay driver so that identical inputs produce identical
// runs.
// =============================================================================

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::America::New_York;
use chrono_tz::Tz;
use parking_lot::Mutex;

/// Source of wall-clock and monotonic time for the engine.
pub trait Clock: Send + Sync {
    /// Current wall-clock time (UTC).
    fn now_utc(&self) -> DateTime<Utc>;

    /// Monotonic time since engine start. Used for intervals and timeouts,
    /// never for calendar decisions.
    fn monotonic(&self) -> Duration;

    /// Current wall-clock time in the exchange session timezone (ET).
    fn now_et(&self) -> DateTime<Tz> {
        self.now_utc().with_timezone(&New_York)
    }
}

// ---------------------------------------------------------------------------
// SystemClock
// ---------------------------------------------------------------------------

/// Real clocks for live trading.
pub struct SystemClock {
    started: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Duration {
        self.started.elapsed()
    }
}

// ---------------------------------------------------------------------------
// SimClock
// ---------------------------------------------------------------------------

/// Deterministic clock driven by the backtest replay loop.
///
/// Monotonic time is derived from the distance travelled since the first
/// `set` call, so timeout logic behaves the same way it does live.
pub struct SimClock {
    state: Mutex<SimClockState>,
}

struct SimClockState {
    now: DateTime<Utc>,
    epoch: DateTime<Utc>,
}

impl SimClock {
    /// Create a sim clock positioned at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(SimClockState {
                now: start,
                epoch: start,
            }),
        }
    }

    /// Create a sim clock at the Unix epoch (tests).
    pub fn at_epoch() -> Self {
        Self::new(Utc.timestamp_opt(0, 0).single().unwrap_or_default())
    }

    /// Move the clock forward to `now`. Moving backwards is ignored — the
    /// replay source is expected to deliver time monotonically.
    pub fn set(&self, now: DateTime<Utc>) {
        let mut s = self.state.lock();
        if now > s.now {
            s.now = now;
        }
    }

    /// Advance the clock by `delta`.
    pub fn advance(&self, delta: Duration) {
        let mut s = self.state.lock();
        s.now += chrono::Duration::from_std(delta).unwrap_or(chrono::Duration::zero());
    }
}

impl Clock for SimClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.state.lock().now
    }

    fn monotonic(&self) -> Duration {
        let s = self.state.lock();
        (s.now - s.epoch).to_std().unwrap_or(Duration::ZERO)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_clock_advances_monotonically() {
        let clock = SimClock::new(Utc.with_ymd_and_hms(2025, 6, 2, 14, 0, 0).unwrap());
        let t0 = clock.now_utc();

        clock.advance(Duration::from_secs(90));
        assert_eq!((clock.now_utc() - t0).num_seconds(), 90);
        assert_eq!(clock.monotonic(), Duration::from_secs(90));

        // Setting the clock backwards is a no-op.
        clock.set(t0);
        assert_eq!(clock.monotonic(), Duration::from_secs(90));
    }

    #[test]
    fn et_conversion_handles_offset() {
        // 2025-06-02 is in EDT (UTC-4): 14:00 UTC == 10:00 ET.
        let clock = SimClock::new(Utc.with_ymd_and_hms(2025, 6, 2, 14, 0, 0).unwrap());
        let et = clock.now_et();
        assert_eq!(et.format("%H:%M").to_string(), "10:00");

        // 2025-01-15 is in EST (UTC-5): 14:00 UTC == 09:00 ET.
        let winter = SimClock::new(Utc.with_ymd_and_hms(2025, 1, 15, 14, 0, 0).unwrap());
        assert_eq!(winter.now_et().format("%H:%M").to_string(), "09:00");
    }
}
