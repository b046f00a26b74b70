// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of a trade or position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1.0 for longs, -1.0 for shorts. Multiply a price move by this to get
    /// the favourable-direction move.
    pub fn direction(&self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Whether the entry traded with or against the preceding move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeType {
    Reversal,
    Continuation,
}

impl std::fmt::Display for TradeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reversal => write!(f, "REVERSAL"),
            Self::Continuation => write!(f, "CONTINUATION"),
        }
    }
}

/// Coarse classification of current volatility / trendiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketRegime {
    HighVolChoppy,
    HighVolTrending,
    NormalChoppy,
    NormalTrending,
    Normal,
    LowVolRanging,
    LowVolTrending,
}

impl Default for MarketRegime {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::HighVolChoppy => "HIGH_VOL_CHOPPY",
            Self::HighVolTrending => "HIGH_VOL_TRENDING",
            Self::NormalChoppy => "NORMAL_CHOPPY",
            Self::NormalTrending => "NORMAL_TRENDING",
            Self::Normal => "NORMAL",
            Self::LowVolRanging => "LOW_VOL_RANGING",
            Self::LowVolTrending => "LOW_VOL_TRENDING",
        };
        write!(f, "{s}")
    }
}

impl MarketRegime {
    pub fn is_trending(&self) -> bool {
        matches!(
            self,
            Self::HighVolTrending | Self::NormalTrending | Self::LowVolTrending
        )
    }

    pub fn is_high_vol(&self) -> bool {
        matches!(self, Self::HighVolChoppy | Self::HighVolTrending)
    }

    /// Key suffix used to look up regime-specific exit parameters.
    pub fn param_suffix(&self) -> &'static str {
        match self {
            Self::HighVolChoppy => "high_vol_choppy",
            Self::HighVolTrending => "high_vol_trending",
            Self::NormalChoppy => "normal_choppy",
            Self::NormalTrending => "normal_trending",
            Self::Normal => "normal",
            Self::LowVolRanging => "low_vol_ranging",
            Self::LowVolTrending => "low_vol_trending",
        }
    }
}

/// Why a position (or part of it) was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    Target,
    Stop,
    Breakeven,
    Trailing,
    Partial1,
    Partial2,
    Partial3,
    TimeMax,
    SidewaysTimeout,
    UnderwaterTimeout,
    VolatilitySpike,
    ProfitDrawdown,
    AdverseMomentum,
    SessionFlatten,
    EventFlatten,
    LicenseFlatten,
    Emergency,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Target => "TARGET",
            Self::Stop => "STOP",
            Self::Breakeven => "BREAKEVEN",
            Self::Trailing => "TRAILING",
            Self::Partial1 => "PARTIAL_1",
            Self::Partial2 => "PARTIAL_2",
            Self::Partial3 => "PARTIAL_3",
            Self::TimeMax => "TIME_MAX",
            Self::SidewaysTimeout => "SIDEWAYS_TIMEOUT",
            Self::UnderwaterTimeout => "UNDERWATER_TIMEOUT",
            Self::VolatilitySpike => "VOLATILITY_SPIKE",
            Self::ProfitDrawdown => "PROFIT_DRAWDOWN",
            Self::AdverseMomentum => "ADVERSE_MOMENTUM",
            Self::SessionFlatten => "SESSION_FLATTEN",
            Self::EventFlatten => "EVENT_FLATTEN",
            Self::LicenseFlatten => "LICENSE_FLATTEN",
            Self::Emergency => "EMERGENCY",
        };
        write!(f, "{s}")
    }
}

impl ExitReason {
    /// Partial exits leave the position open with reduced size; everything
    /// else closes the remaining contracts.
    pub fn is_partial(&self) -> bool {
        matches!(self, Self::Partial1 | Self::Partial2 | Self::Partial3)
    }

    /// Exits forced by the session/risk layer rather than price action.
    pub fn is_forced(&self) -> bool {
        matches!(
            self,
            Self::SessionFlatten | Self::EventFlatten | Self::LicenseFlatten | Self::Emergency
        )
    }

    pub fn partial_level(&self) -> Option<u8> {
        match self {
            Self::Partial1 => Some(1),
            Self::Partial2 => Some(2),
            Self::Partial3 => Some(3),
            _ => None,
        }
    }
}

/// How an exit order should be worked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStrategy {
    /// Limit order at the target price.
    Passive,
    /// Marketable order crossing the spread.
    Aggressive,
}

impl std::fmt::Display for OrderStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passive => write!(f, "PASSIVE"),
            Self::Aggressive => write!(f, "AGGRESSIVE"),
        }
    }
}

/// A fully specified exit instruction produced by the exit manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitDecision {
    pub reason: ExitReason,
    /// Number of contracts to close.
    pub size: u32,
    /// Reference price for limit strategies.
    pub target_price: f64,
    pub order_strategy: OrderStrategy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_direction() {
        assert_eq!(Side::Long.direction(), 1.0);
        assert_eq!(Side::Short.direction(), -1.0);
        assert_eq!(Side::Long.opposite(), Side::Short);
    }

    #[test]
    fn exit_reason_partials() {
        assert!(ExitReason::Partial2.is_partial());
        assert_eq!(ExitReason::Partial2.partial_level(), Some(2));
        assert!(!ExitReason::Stop.is_partial());
        assert_eq!(ExitReason::Stop.partial_level(), None);
    }

    #[test]
    fn exit_reason_display_matches_wire_names() {
        assert_eq!(ExitReason::SidewaysTimeout.to_string(), "SIDEWAYS_TIMEOUT");
        assert_eq!(ExitReason::Partial1.to_string(), "PARTIAL_1");
        assert_eq!(ExitReason::LicenseFlatten.to_string(), "LICENSE_FLATTEN");
    }

    #[test]
    fn regime_classification_helpers() {
        assert!(MarketRegime::HighVolTrending.is_trending());
        assert!(MarketRegime::HighVolTrending.is_high_vol());
        assert!(!MarketRegime::LowVolRanging.is_trending());
        assert_eq!(MarketRegime::Normal.param_suffix(), "normal");
    }
}
