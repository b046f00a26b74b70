// =============================================================================
// Market Data — validated ticks and 1-minute bars
// =============================================================================

pub mod bar_builder;
pub mod feed;

pub use bar_builder::BarBuilder;
pub use feed::{StalenessLevel, TickFeed, TickRejection};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One quote/trade update from the market feed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub ts: DateTime<Utc>,
    pub bid: f64,
    pub bid_size: u32,
    pub ask: f64,
    pub ask_size: u32,
    pub last: f64,
    pub last_size: u32,
}

impl Tick {
    /// Midpoint of the current quote.
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    /// Quoted spread in price units.
    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }
}

/// A finalized (or in-progress) 1-minute OHLCV aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Start of the minute bucket (UTC, second == 0).
    pub start_ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Sum of trade sizes within the bucket.
    pub volume: u64,
    /// Intraday session VWAP at bar close.
    pub vwap_snapshot: f64,
    /// true when the bucket had no ticks and the bar was filled from the
    /// previous close.
    #[serde(default)]
    pub synthetic: bool,
}

impl Bar {
    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    pub fn is_up(&self) -> bool {
        self.close > self.open
    }
}
