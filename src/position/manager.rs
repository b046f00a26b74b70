// =============================================================================
// Position Manager — single active position, full lifecycle accounting
// =============================================================================
//
// One engine instance manages at most one position on its symbol. The
// manager owns the position's lifecycle:
//
//   Init -> Open -> (Partial1 -> Partial2 -> Partial3)* -> Closing -> Closed
//        \-> StopHit -> Closed
//        \-> Closing (time/sideways/vol) -> Closed
//        \-> forced flatten -> Closed
//
// and every derived quantity the exit ladder needs: MFE/MAE, peak
// unrealized, underwater/sideways/adverse-bar counters, and the stop
// adjustment log.
//
// Invariant maintained throughout:
//   contracts == remaining_contracts + sum(partials_taken[].size)  (until
//   the final close zeroes remaining_contracts).
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::{ExitReason, Side};

/// Exit-machine substate of the live position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitSubstate {
    Init,
    Open,
    Partial1,
    Partial2,
    Partial3,
    Closing,
    StopHit,
    Closed,
}

impl std::fmt::Display for ExitSubstate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::Open => "OPEN",
            Self::Partial1 => "PARTIAL_1",
            Self::Partial2 => "PARTIAL_2",
            Self::Partial3 => "PARTIAL_3",
            Self::Closing => "CLOSING",
            Self::StopHit => "STOP_HIT",
            Self::Closed => "CLOSED",
        };
        write!(f, "{s}")
    }
}

/// Which mechanism owns the current stop level; decides the exit reason
/// label when the stop is hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopOwner {
    Initial,
    Breakeven,
    Trailing,
}

/// One partial exit that has already executed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PartialFill {
    pub level: u8,
    pub size: u32,
    pub price: f64,
    pub ts: DateTime<Utc>,
}

/// One stop adjustment, kept for the exit experience record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopAdjustment {
    pub ts: DateTime<Utc>,
    pub from: f64,
    pub to: f64,
    pub cause: String,
}

/// The live (or archived) position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    /// Original fill size.
    pub contracts: u32,
    pub entry_price_avg: f64,
    pub entry_ts: DateTime<Utc>,
    pub initial_stop: f64,
    pub current_stop: f64,
    pub initial_target: f64,
    pub remaining_contracts: u32,
    /// Dollars, net of commissions, accumulated across partial closes.
    #[serde(default)]
    pub realized_pnl: f64,
    /// Best favourable price distance seen, per contract (price units).
    #[serde(default)]
    pub max_favorable_excursion: f64,
    /// Worst adverse price distance seen, per contract (price units).
    #[serde(default)]
    pub max_adverse_excursion: f64,
    pub exit_substate: ExitSubstate,
    #[serde(default)]
    pub partials_taken: Vec<PartialFill>,
    #[serde(default)]
    pub breakeven_armed: bool,
    #[serde(default)]
    pub trailing_armed: bool,
    #[serde(default)]
    pub last_adjust_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stop_owner: StopOwner,
    #[serde(default)]
    pub stop_adjustments: Vec<StopAdjustment>,

    // --- Entry context carried for exits and experiences ----------------------
    #[serde(default)]
    pub entry_atr: f64,
    #[serde(default)]
    pub entry_confidence: f64,
    #[serde(default)]
    pub entry_slippage_ticks: f64,
    #[serde(default)]
    pub signal_id: String,

    // --- Bar-clock state driven by on_bar --------------------------------------
    #[serde(default)]
    pub bars_held: u32,
    /// Consecutive bars with unrealized <= 0.
    #[serde(default)]
    pub underwater_bars: u32,
    /// Consecutive bars with the close pinned near entry.
    #[serde(default)]
    pub sideways_bars: u32,
    /// Consecutive high-volume bars against the position.
    #[serde(default)]
    pub adverse_bars: u32,

    #[serde(default)]
    pub closed_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub final_exit_reason: Option<ExitReason>,
}

impl Default for StopOwner {
    fn default() -> Self {
        Self::Initial
    }
}

impl Position {
    /// Initial risk per contract in price units.
    pub fn initial_risk(&self) -> f64 {
        (self.entry_price_avg - self.initial_stop).abs()
    }

    /// Signed favourable price distance of `price` from entry.
    pub fn favorable_excursion(&self, price: f64) -> f64 {
        (price - self.entry_price_avg) * self.side.direction()
    }

    /// Unrealized dollars on the remaining contracts at `price`.
    pub fn unrealized_dollars(&self, price: f64, tick_size: f64, tick_value: f64) -> f64 {
        if tick_size <= 0.0 {
            return 0.0;
        }
        self.favorable_excursion(price) / tick_size
            * tick_value
            * self.remaining_contracts as f64
    }

    /// Unrealized R-multiple at `price`.
    pub fn unrealized_r(&self, price: f64) -> f64 {
        let risk = self.initial_risk();
        if risk > 0.0 {
            self.favorable_excursion(price) / risk
        } else {
            0.0
        }
    }

    /// Peak favourable R reached so far.
    pub fn peak_r(&self) -> f64 {
        let risk = self.initial_risk();
        if risk > 0.0 {
            self.max_favorable_excursion / risk
        } else {
            0.0
        }
    }

    /// Whether a partial level has already been taken.
    pub fn partial_taken(&self, level: u8) -> bool {
        self.partials_taken.iter().any(|p| p.level == level)
    }

    /// The structural invariant; checked after every mutation in debug and
    /// asserted by tests.
    pub fn size_invariant_holds(&self) -> bool {
        let partial_sum: u32 = self.partials_taken.iter().map(|p| p.size).sum();
        if self.exit_substate == ExitSubstate::Closed {
            self.remaining_contracts == 0
        } else {
            self.contracts == self.remaining_contracts + partial_sum
        }
    }
}

/// Owns the single active position and the closed archive.
pub struct PositionManager {
    symbol: String,
    active: Option<Position>,
    closed: Vec<Position>,
}

impl PositionManager {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            active: None,
            closed: Vec::new(),
        }
    }

    pub fn active(&self) -> Option<&Position> {
        self.active.as_ref()
    }

    pub fn active_mut(&mut self) -> Option<&mut Position> {
        self.active.as_mut()
    }

    pub fn has_position(&self) -> bool {
        self.active.is_some()
    }

    pub fn closed(&self) -> &[Position] {
        &self.closed
    }

    /// Number of contracts for a new entry:
    /// clamp(1, max, floor(max * (0.20 + 0.80 * confidence))), forced to 1
    /// for exploration decisions.
    pub fn size_for(confidence: f64, is_exploration: bool, max_contracts: u32) -> u32 {
        if max_contracts == 0 {
            return 0;
        }
        if is_exploration {
            return 1;
        }
        let multiplier = 0.20 + 0.80 * confidence.clamp(0.0, 1.0);
        ((max_contracts as f64 * multiplier).floor() as u32).clamp(1, max_contracts)
    }

    /// Create the position from a confirmed entry fill.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        &mut self,
        signal_id: &str,
        side: Side,
        size: u32,
        fill_price: f64,
        initial_stop: f64,
        initial_target: f64,
        entry_atr: f64,
        entry_confidence: f64,
        entry_slippage_ticks: f64,
        ts: DateTime<Utc>,
    ) -> Result<&Position, String> {
        if self.active.is_some() {
            return Err("position already open on this symbol".to_string());
        }

        let position = Position {
            id: Uuid::new_v4().to_string(),
            symbol: self.symbol.clone(),
            side,
            contracts: size,
            entry_price_avg: fill_price,
            entry_ts: ts,
            initial_stop,
            current_stop: initial_stop,
            initial_target,
            remaining_contracts: size,
            realized_pnl: 0.0,
            max_favorable_excursion: 0.0,
            max_adverse_excursion: 0.0,
            exit_substate: ExitSubstate::Open,
            partials_taken: Vec::new(),
            breakeven_armed: false,
            trailing_armed: false,
            last_adjust_ts: None,
            stop_owner: StopOwner::Initial,
            stop_adjustments: Vec::new(),
            entry_atr,
            entry_confidence,
            entry_slippage_ticks,
            signal_id: signal_id.to_string(),
            bars_held: 0,
            underwater_bars: 0,
            sideways_bars: 0,
            adverse_bars: 0,
            closed_ts: None,
            final_exit_reason: None,
        };

        info!(
            id = %position.id,
            side = %side,
            size,
            fill_price,
            initial_stop,
            initial_target,
            "position opened"
        );

        Ok(self.active.insert(position))
    }

    /// Restore a persisted position on startup (after broker verification).
    pub fn restore(&mut self, position: Position) {
        info!(
            id = %position.id,
            side = %position.side,
            remaining = position.remaining_contracts,
            "position restored from snapshot"
        );
        self.active = Some(position);
    }

    /// Track excursions on every price observation (tick or bar extreme).
    pub fn observe_price(&mut self, price: f64) {
        if let Some(p) = self.active.as_mut() {
            let fav = p.favorable_excursion(price);
            if fav > p.max_favorable_excursion {
                p.max_favorable_excursion = fav;
            }
            let adverse = -fav;
            if adverse > p.max_adverse_excursion {
                p.max_adverse_excursion = adverse;
            }
        }
    }

    /// Apply an executed exit fill. Returns the closed position when the
    /// fill flattened it; the caller records experiences and persists.
    pub fn apply_exit_fill(
        &mut self,
        reason: ExitReason,
        size: u32,
        price: f64,
        commission_per_contract: f64,
        tick_size: f64,
        tick_value: f64,
        ts: DateTime<Utc>,
    ) -> Option<Position> {
        let p = match self.active.as_mut() {
            Some(p) => p,
            None => {
                warn!(reason = %reason, "exit fill with no active position");
                return None;
            }
        };

        let size = size.min(p.remaining_contracts);
        if size == 0 {
            return None;
        }

        let pnl_ticks = p.favorable_excursion(price) / tick_size;
        let pnl = pnl_ticks * tick_value * size as f64 - commission_per_contract * size as f64;
        p.realized_pnl += pnl;
        p.remaining_contracts -= size;

        if let Some(level) = reason.partial_level() {
            p.partials_taken.push(PartialFill {
                level,
                size,
                price,
                ts,
            });
            p.exit_substate = match level {
                1 => ExitSubstate::Partial1,
                2 => ExitSubstate::Partial2,
                _ => ExitSubstate::Partial3,
            };
        }

        info!(
            id = %p.id,
            reason = %reason,
            size,
            price,
            pnl = format!("{:.2}", pnl),
            remaining = p.remaining_contracts,
            "exit fill applied"
        );

        if p.remaining_contracts == 0 {
            p.exit_substate = ExitSubstate::Closed;
            p.closed_ts = Some(ts);
            p.final_exit_reason = Some(reason);
            let closed = self.active.take();
            if let Some(ref c) = closed {
                self.closed.push(c.clone());
            }
            closed
        } else {
            if !reason.is_partial() {
                // A partial fill of a full-close order: still unwinding.
                p.exit_substate = match reason {
                    ExitReason::Stop | ExitReason::Breakeven | ExitReason::Trailing => {
                        ExitSubstate::StopHit
                    }
                    _ => ExitSubstate::Closing,
                };
            }
            None
        }
    }

    /// Move the stop, recording the adjustment. Enforces monotonicity: the
    /// stop never retreats against the trade.
    pub fn adjust_stop(
        &mut self,
        new_stop: f64,
        owner: StopOwner,
        cause: &str,
        ts: DateTime<Utc>,
    ) -> bool {
        let Some(p) = self.active.as_mut() else {
            return false;
        };
        let improves = match p.side {
            Side::Long => new_stop > p.current_stop,
            Side::Short => new_stop < p.current_stop,
        };
        if !improves {
            return false;
        }
        p.stop_adjustments.push(StopAdjustment {
            ts,
            from: p.current_stop,
            to: new_stop,
            cause: cause.to_string(),
        });
        p.current_stop = new_stop;
        p.stop_owner = owner;
        p.last_adjust_ts = Some(ts);
        true
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).single().unwrap()
    }

    fn open_long(manager: &mut PositionManager, size: u32) {
        manager
            .open(
                "sig-1",
                Side::Long,
                size,
                5000.0,
                4998.0,
                5004.0,
                2.0,
                0.70,
                0.0,
                ts(),
            )
            .unwrap();
    }

    #[test]
    fn sizing_formula() {
        // multiplier = 0.20 + 0.80 * confidence
        assert_eq!(PositionManager::size_for(0.0, false, 3), 1); // floor(0.6) = 0 -> clamp 1
        assert_eq!(PositionManager::size_for(0.5, false, 3), 1); // floor(1.8) = 1
        assert_eq!(PositionManager::size_for(0.70, false, 3), 2); // floor(2.28) = 2
        assert_eq!(PositionManager::size_for(1.0, false, 3), 3); // floor(3.0) = 3
        assert_eq!(PositionManager::size_for(1.0, false, 10), 10);
        // Exploration is always one contract.
        assert_eq!(PositionManager::size_for(0.99, true, 10), 1);
        assert_eq!(PositionManager::size_for(0.0, false, 0), 0);
    }

    #[test]
    fn only_one_position_per_symbol() {
        let mut m = PositionManager::new("MES");
        open_long(&mut m, 2);
        let err = m.open(
            "sig-2",
            Side::Short,
            1,
            5001.0,
            5003.0,
            4998.0,
            2.0,
            0.5,
            0.0,
            ts(),
        );
        assert!(err.is_err());
    }

    #[test]
    fn excursion_tracking() {
        let mut m = PositionManager::new("MES");
        open_long(&mut m, 2);
        m.observe_price(5002.0);
        m.observe_price(4999.0);
        m.observe_price(5001.0);

        let p = m.active().unwrap();
        assert_eq!(p.max_favorable_excursion, 2.0);
        assert_eq!(p.max_adverse_excursion, 1.0);
        assert!((p.peak_r() - 1.0).abs() < 1e-9); // risk = 2.0
    }

    #[test]
    fn partial_then_close_preserves_invariant() {
        let mut m = PositionManager::new("MES");
        open_long(&mut m, 3);

        // Partial 1: one contract at +2 points = 8 ticks * $1.25 = $10 - fee.
        let closed = m.apply_exit_fill(ExitReason::Partial1, 1, 5002.0, 0.62, 0.25, 1.25, ts());
        assert!(closed.is_none());
        let p = m.active().unwrap();
        assert_eq!(p.remaining_contracts, 2);
        assert_eq!(p.exit_substate, ExitSubstate::Partial1);
        assert!(p.size_invariant_holds());
        assert!((p.realized_pnl - (10.0 - 0.62)).abs() < 1e-9);

        // Full close of the remainder.
        let closed = m
            .apply_exit_fill(ExitReason::Trailing, 2, 5003.0, 0.62, 0.25, 1.25, ts())
            .expect("position should close");
        assert_eq!(closed.exit_substate, ExitSubstate::Closed);
        assert_eq!(closed.remaining_contracts, 0);
        assert_eq!(closed.final_exit_reason, Some(ExitReason::Trailing));
        assert!(closed.size_invariant_holds());
        assert!(!m.has_position());
        assert_eq!(m.closed().len(), 1);
    }

    #[test]
    fn short_pnl_signs() {
        let mut m = PositionManager::new("MES");
        m.open(
            "sig-1",
            Side::Short,
            2,
            5000.0,
            5002.0,
            4996.0,
            2.0,
            0.6,
            0.0,
            ts(),
        )
        .unwrap();

        // Price falls 1 point: favourable for the short.
        let closed = m
            .apply_exit_fill(ExitReason::Target, 2, 4999.0, 0.0, 0.25, 1.25, ts())
            .unwrap();
        // 4 ticks * $1.25 * 2 contracts = $10.
        assert!((closed.realized_pnl - 10.0).abs() < 1e-9);
    }

    #[test]
    fn stop_monotonicity() {
        let mut m = PositionManager::new("MES");
        open_long(&mut m, 2);

        assert!(m.adjust_stop(4999.0, StopOwner::Breakeven, "breakeven", ts()));
        // Retreating is refused.
        assert!(!m.adjust_stop(4998.5, StopOwner::Trailing, "trail", ts()));
        // Improving is allowed.
        assert!(m.adjust_stop(5000.5, StopOwner::Trailing, "trail", ts()));

        let p = m.active().unwrap();
        assert_eq!(p.current_stop, 5000.5);
        assert_eq!(p.stop_owner, StopOwner::Trailing);
        assert_eq!(p.stop_adjustments.len(), 2);
    }

    #[test]
    fn oversized_exit_fill_is_clamped() {
        let mut m = PositionManager::new("MES");
        open_long(&mut m, 2);
        let closed = m
            .apply_exit_fill(ExitReason::Stop, 5, 4998.0, 0.0, 0.25, 1.25, ts())
            .unwrap();
        assert_eq!(closed.remaining_contracts, 0);
        // Loss: 8 ticks * $1.25 * 2 = $20.
        assert!((closed.realized_pnl + 20.0).abs() < 1e-9);
    }

    #[test]
    fn position_serde_roundtrip() {
        let mut m = PositionManager::new("MES");
        open_long(&mut m, 3);
        m.apply_exit_fill(ExitReason::Partial1, 1, 5002.0, 0.62, 0.25, 1.25, ts());
        let p = m.active().unwrap().clone();

        let json = serde_json::to_string(&p).unwrap();
        let back: Position = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, p.id);
        assert_eq!(back.remaining_contracts, p.remaining_contracts);
        assert_eq!(back.partials_taken, p.partials_taken);
        assert_eq!(back.exit_substate, p.exit_substate);
        assert!(back.size_invariant_holds());
    }
}
