// =============================================================================
// Tick Feed — validation, rolling window, staleness detection
// =============================================================================
//
// Raw quotes from the broker gateway pass through here before anything else
// sees them. A tick is accepted only when:
//   - bid <= ask
//   - all prices are positive
//   - bid_size and ask_size are both > 0
//   - its timestamp is not older than the last accepted tick
//
// Rejected ticks are counted by reason and dropped. The feed keeps a rolling
// window of the last WINDOW_TICKS accepted ticks for spread/stress analytics
// and tracks the tick-gap staleness ladder:
//   > 2s   WARN (DATA_STALE)
//   > 30s  block new entries (risk gate consumes this level)
//   > 60s  forced flatten
// =============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use super::Tick;

/// Number of accepted ticks retained for analytics.
const WINDOW_TICKS: usize = 240;

/// Why a raw tick was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickRejection {
    /// bid > ask.
    CrossedQuote,
    /// A non-positive price on either side.
    NonPositivePrice,
    /// Zero size on either side of the book.
    ZeroSize,
    /// Timestamp older than the last accepted tick.
    OutOfOrder,
}

impl std::fmt::Display for TickRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CrossedQuote => "CROSSED_QUOTE",
            Self::NonPositivePrice => "NON_POSITIVE_PRICE",
            Self::ZeroSize => "ZERO_SIZE",
            Self::OutOfOrder => "OUT_OF_ORDER",
        };
        write!(f, "{s}")
    }
}

/// Escalation level of the tick-gap staleness ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StalenessLevel {
    Fresh,
    /// Gap > 2s — warn only.
    Stale,
    /// Gap > 30s — new entries blocked.
    EntryBlocking,
    /// Gap > 60s — open position must be flattened.
    FlattenRequired,
}

/// Validating tick ingestion for a single symbol.
pub struct TickFeed {
    symbol: String,
    window: VecDeque<Tick>,
    last_ts: Option<DateTime<Utc>>,
    accepted: u64,
    rejected: u64,
    rejected_out_of_order: u64,
    rejected_crossed: u64,
    stale_warned: bool,
}

impl TickFeed {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            window: VecDeque::with_capacity(WINDOW_TICKS + 1),
            last_ts: None,
            accepted: 0,
            rejected: 0,
            rejected_out_of_order: 0,
            rejected_crossed: 0,
            stale_warned: false,
        }
    }

    /// Validate and ingest one raw tick.
    ///
    /// Returns `Ok(())` when the tick was accepted into the window, or the
    /// rejection reason when it was dropped.
    pub fn ingest(&mut self, tick: Tick) -> Result<(), TickRejection> {
        if let Err(reason) = self.validate(&tick) {
            self.rejected += 1;
            match reason {
                TickRejection::OutOfOrder => self.rejected_out_of_order += 1,
                TickRejection::CrossedQuote => self.rejected_crossed += 1,
                _ => {}
            }
            debug!(
                symbol = %self.symbol,
                reason = %reason,
                bid = tick.bid,
                ask = tick.ask,
                "tick rejected"
            );
            return Err(reason);
        }

        self.last_ts = Some(tick.ts);
        self.accepted += 1;
        self.stale_warned = false;

        self.window.push_back(tick);
        while self.window.len() > WINDOW_TICKS {
            self.window.pop_front();
        }

        Ok(())
    }

    fn validate(&self, tick: &Tick) -> Result<(), TickRejection> {
        if tick.bid <= 0.0 || tick.ask <= 0.0 || tick.last <= 0.0 {
            return Err(TickRejection::NonPositivePrice);
        }
        // bid == ask is a legal locked market; only a crossed book is invalid.
        if tick.bid > tick.ask {
            return Err(TickRejection::CrossedQuote);
        }
        if tick.bid_size == 0 || tick.ask_size == 0 {
            return Err(TickRejection::ZeroSize);
        }
        if let Some(last) = self.last_ts {
            if tick.ts < last {
                return Err(TickRejection::OutOfOrder);
            }
        }
        Ok(())
    }

    /// Current staleness level given the wall clock.
    ///
    /// Emits the 2-second WARN once per gap; the caller maps the higher
    /// levels to risk-gate and flatten actions.
    pub fn staleness(&mut self, now: DateTime<Utc>) -> StalenessLevel {
        let last = match self.last_ts {
            Some(ts) => ts,
            None => return StalenessLevel::Fresh,
        };
        let gap = now - last;

        if gap > Duration::seconds(60) {
            StalenessLevel::FlattenRequired
        } else if gap > Duration::seconds(30) {
            StalenessLevel::EntryBlocking
        } else if gap > Duration::seconds(2) {
            if !self.stale_warned {
                warn!(
                    symbol = %self.symbol,
                    gap_ms = gap.num_milliseconds(),
                    "DATA_STALE: no tick for more than 2s"
                );
                self.stale_warned = true;
            }
            StalenessLevel::Stale
        } else {
            StalenessLevel::Fresh
        }
    }

    /// Most recently accepted tick.
    pub fn last(&self) -> Option<&Tick> {
        self.window.back()
    }

    /// Timestamp of the most recently accepted tick.
    pub fn last_ts(&self) -> Option<DateTime<Utc>> {
        self.last_ts
    }

    /// Rolling window of accepted ticks, oldest first.
    pub fn window(&self) -> &VecDeque<Tick> {
        &self.window
    }

    pub fn accepted_count(&self) -> u64 {
        self.accepted
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected
    }
}
