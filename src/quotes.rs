// =============================================================================
// Bid/Ask Manager — spread analytics, imbalance, slippage, entry gate
// =============================================================================
//
// Sits between the order router and the broker interface. Tracks the current
// quote plus rolling spread statistics (overall and per ET hour) and answers
// three questions:
//   - is the book acceptable for a new entry right now? (`entry_gate`)
//   - which way is the book leaning? (`imbalance_signal`)
//   - how much slippage should an aggressive order expect? (`expected_slippage_ticks`)
//
// It also carries the queue-monitor policy for resting passive orders: poll
// every 500ms, cancel when the mid moves adversely by the configured ticks,
// time out into an aggressive order.
// =============================================================================

use std::collections::VecDeque;

use chrono::NaiveTime;
use serde::Serialize;
use tracing::debug;

use crate::config::EngineConfig;
use crate::market_data::Tick;
use crate::types::Side;

/// Spreads retained for the rolling average.
const SPREAD_HISTORY: usize = 100;

/// Consecutive widening quotes that raise the spread-widening flag.
const WIDENING_RUN: usize = 5;

/// Hard ceiling on expected slippage in ticks.
const SLIPPAGE_CAP_TICKS: f64 = 3.0;

/// Book-lean classification from the size ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ImbalanceSignal {
    StrongBid,
    StrongAsk,
    Balanced,
}

impl std::fmt::Display for ImbalanceSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::StrongBid => "STRONG_BID",
            Self::StrongAsk => "STRONG_ASK",
            Self::Balanced => "BALANCED",
        };
        write!(f, "{s}")
    }
}

impl ImbalanceSignal {
    /// Whether the lean favours entering on the given side.
    pub fn aligns_with(&self, side: Side) -> bool {
        matches!(
            (self, side),
            (Self::StrongBid, Side::Long) | (Self::StrongAsk, Side::Short)
        )
    }
}

/// Why the entry gate rejected a candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EntryReject {
    /// No usable quote yet.
    InvalidQuote,
    /// Spread above `max_acceptable_spread` ticks.
    SpreadTooWide { spread_ticks: f64, max_ticks: f64 },
    /// Either side of the book below `min_bid_ask_size`.
    InsufficientDepth { bid_size: u32, ask_size: u32 },
    /// Each of the last 5 quotes wider than the previous.
    SpreadWidening,
    /// Spread more than twice the mean for this ET hour.
    SpreadAboveHourlyMean { spread_ticks: f64, hourly_mean: f64 },
}

impl std::fmt::Display for EntryReject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidQuote => write!(f, "INVALID_QUOTE"),
            Self::SpreadTooWide {
                spread_ticks,
                max_ticks,
            } => write!(f, "SPREAD_TOO_WIDE({spread_ticks:.1} > {max_ticks:.1})"),
            Self::InsufficientDepth { bid_size, ask_size } => {
                write!(f, "INSUFFICIENT_DEPTH(bid={bid_size}, ask={ask_size})")
            }
            Self::SpreadWidening => write!(f, "SPREAD_WIDENING"),
            Self::SpreadAboveHourlyMean {
                spread_ticks,
                hourly_mean,
            } => write!(
                f,
                "SPREAD_ABOVE_HOURLY_MEAN({spread_ticks:.1} > 2x{hourly_mean:.1})"
            ),
        }
    }
}

/// Outcome of one resting-passive-order watch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    Filled,
    /// Mid moved adversely by the cancel threshold — cancel and re-quote.
    PriceMovedAway,
    /// Passive timeout elapsed — cancel and go aggressive.
    Timeout,
}

struct HourStats {
    sum_ticks: f64,
    count: u64,
}

impl HourStats {
    fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum_ticks / self.count as f64)
    }
}

/// Per-symbol quote analytics.
pub struct BidAskManager {
    tick_size: f64,
    imbalance_threshold: f64,
    min_depth: u32,
    max_spread_ticks: f64,
    normal_slippage_ticks: f64,
    illiquid_slippage_ticks: f64,
    illiquid_start: NaiveTime,
    illiquid_end: NaiveTime,

    current: Option<Tick>,
    spread_history: VecDeque<f64>,
    hourly: [HourStats; 24],
}

impl BidAskManager {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            tick_size: config.tick_size,
            imbalance_threshold: config.imbalance_threshold,
            min_depth: config.min_bid_ask_size,
            max_spread_ticks: config.max_acceptable_spread,
            normal_slippage_ticks: config.normal_hours_slippage_ticks,
            illiquid_slippage_ticks: config.illiquid_hours_slippage_ticks,
            illiquid_start: config.illiquid_start(),
            illiquid_end: config.illiquid_end(),
            current: None,
            spread_history: VecDeque::with_capacity(SPREAD_HISTORY + 1),
            hourly: std::array::from_fn(|_| HourStats {
                sum_ticks: 0.0,
                count: 0,
            }),
        }
    }

    /// Ingest one accepted tick. `et_hour` is the ET hour-of-day [0, 24).
    pub fn update(&mut self, tick: &Tick, et_hour: u32) {
        let spread_ticks = self.to_ticks(tick.spread());

        self.spread_history.push_back(spread_ticks);
        while self.spread_history.len() > SPREAD_HISTORY {
            self.spread_history.pop_front();
        }

        if let Some(h) = self.hourly.get_mut(et_hour.min(23) as usize) {
            h.sum_ticks += spread_ticks;
            h.count += 1;
        }

        self.current = Some(*tick);
    }

    pub fn current(&self) -> Option<&Tick> {
        self.current.as_ref()
    }

    /// Current spread in ticks, if a quote exists.
    pub fn spread_ticks(&self) -> Option<f64> {
        self.current.as_ref().map(|t| self.to_ticks(t.spread()))
    }

    /// Rolling average spread in ticks.
    pub fn avg_spread_ticks(&self) -> Option<f64> {
        if self.spread_history.is_empty() {
            return None;
        }
        Some(self.spread_history.iter().sum::<f64>() / self.spread_history.len() as f64)
    }

    /// Mean spread for the given ET hour, if any quotes landed there.
    pub fn hourly_mean_spread(&self, et_hour: u32) -> Option<f64> {
        self.hourly.get(et_hour.min(23) as usize)?.mean()
    }

    /// True when each of the last 5 quotes was wider than the one before it.
    pub fn spread_widening(&self) -> bool {
        let n = self.spread_history.len();
        if n < WIDENING_RUN + 1 {
            return false;
        }
        self.spread_history
            .iter()
            .skip(n - (WIDENING_RUN + 1))
            .collect::<Vec<_>>()
            .windows(2)
            .all(|w| w[1] > w[0])
    }

    /// bid_size / ask_size ratio of the current quote.
    pub fn imbalance(&self) -> Option<f64> {
        let t = self.current.as_ref()?;
        if t.ask_size == 0 {
            return None;
        }
        Some(t.bid_size as f64 / t.ask_size as f64)
    }

    /// Classify the current book lean.
    pub fn imbalance_signal(&self) -> ImbalanceSignal {
        match self.imbalance() {
            Some(r) if r > self.imbalance_threshold => ImbalanceSignal::StrongBid,
            Some(r) if r < 1.0 / self.imbalance_threshold => ImbalanceSignal::StrongAsk,
            _ => ImbalanceSignal::Balanced,
        }
    }

    /// Expected slippage in ticks for an aggressive order placed now.
    ///
    /// Base is the liquid/illiquid figure for the time of day; +50% when the
    /// current spread runs more than 1.5x the expectation for this hour; the
    /// result is capped at 3.0 ticks.
    pub fn expected_slippage_ticks(&self, et_time: NaiveTime, et_hour: u32) -> f64 {
        let base = if self.in_illiquid_window(et_time) {
            self.illiquid_slippage_ticks
        } else {
            self.normal_slippage_ticks
        };

        let hourly_expected = self.hourly_mean_spread(et_hour).unwrap_or(base);
        let mut slippage = base;
        if let Some(spread) = self.spread_ticks() {
            if spread > 1.5 * hourly_expected {
                slippage *= 1.5;
            }
        }
        slippage.min(SLIPPAGE_CAP_TICKS)
    }

    /// Gate an entry on the given side against current book conditions.
    pub fn entry_gate(&self, side: Side, et_hour: u32) -> Result<(), EntryReject> {
        let tick = match self.current.as_ref() {
            Some(t) => t,
            None => return Err(EntryReject::InvalidQuote),
        };

        let spread_ticks = self.to_ticks(tick.spread());

        if spread_ticks > self.max_spread_ticks {
            return Err(EntryReject::SpreadTooWide {
                spread_ticks,
                max_ticks: self.max_spread_ticks,
            });
        }
        if tick.bid_size < self.min_depth || tick.ask_size < self.min_depth {
            return Err(EntryReject::InsufficientDepth {
                bid_size: tick.bid_size,
                ask_size: tick.ask_size,
            });
        }
        if self.spread_widening() {
            return Err(EntryReject::SpreadWidening);
        }
        if let Some(hourly_mean) = self.hourly_mean_spread(et_hour) {
            if hourly_mean > 0.0 && spread_ticks > 2.0 * hourly_mean {
                return Err(EntryReject::SpreadAboveHourlyMean {
                    spread_ticks,
                    hourly_mean,
                });
            }
        }

        debug!(side = %side, spread_ticks, "entry gate passed");
        Ok(())
    }

    /// Whether the mid has moved adversely by at least `cancel_ticks` from
    /// the reference mid for a resting order on `side`.
    pub fn mid_moved_adverse(&self, side: Side, reference_mid: f64, cancel_ticks: f64) -> bool {
        let mid = match self.current.as_ref() {
            Some(t) => t.mid(),
            None => return false,
        };
        // Adverse for a resting buy is the mid moving up, away from the bid.
        let adverse_move = (mid - reference_mid) * side.direction();
        self.to_ticks(adverse_move) >= cancel_ticks
    }

    fn in_illiquid_window(&self, t: NaiveTime) -> bool {
        if self.illiquid_start <= self.illiquid_end {
            t >= self.illiquid_start && t < self.illiquid_end
        } else {
            // Window wraps midnight.
            t >= self.illiquid_start || t < self.illiquid_end
        }
    }

    fn to_ticks(&self, price_distance: f64) -> f64 {
        if self.tick_size > 0.0 {
            price_distance / self.tick_size
        } else {
            0.0
        }
    }
}
