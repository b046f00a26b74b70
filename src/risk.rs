// =============================================================================
// Risk & Session Gate — blocks entries and forces exits
// =============================================================================
//
// One gate guards every entry and can demand a flatten. Checks, in order:
//
//   1. Manual/engine halt.
//   2. License state (grace rules — see below).
//   3. Data staleness (> 30s blocks entries; > 60s demands a flatten).
//   4. Daily loss limit.
//   5. Loss-limit approach at 80%:
//        stop_on_approach = true  -> entries blocked, open positions managed.
//        stop_on_approach = false -> recovery mode: required confidence is
//        raised and max contracts scaled by tier:
//          >= 80% of limit: confidence >= 0.75, size x0.75
//          >= 90% of limit: confidence >= 0.85, size x0.50
//          >= 95% of limit: confidence >= 0.90, size x0.33
//   6. Trade count cap.
//   7. Maintenance window (16:45-18:00 ET weekdays) and Friday cutoff.
//   8. Economic-event blackout (-30 min / +60 min).
//   9. Scorer confidence vs the (possibly raised) threshold.
//
// License grace: an expired or conflicted license with a position open lets
// the position run to its natural exit but blocks new entries; with no
// position, trading is disabled immediately.
//
// The session rolls at `session_start_et` (18:00 ET): new trading date,
// starting equity becomes current equity, counters clear, halt flags
// re-evaluate.
// =============================================================================

use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::license::LicenseState;
use crate::market_data::StalenessLevel;
use crate::types::ExitReason;

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// Per-session ledger, persisted after each completed trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    /// Trading date of the session (a session starting 18:00 ET belongs to
    /// the next calendar day).
    pub trading_date: String,
    pub starting_equity: f64,
    pub current_equity: f64,
    pub peak_equity: f64,
    #[serde(default)]
    pub daily_pnl: f64,
    #[serde(default)]
    pub daily_trades: u32,
    #[serde(default)]
    pub consecutive_wins: u32,
    #[serde(default)]
    pub consecutive_losses: u32,
    #[serde(default)]
    pub last_trade_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub halted: bool,
    #[serde(default)]
    pub halt_reason: Option<String>,
    /// Entry-slippage warnings accumulated this session.
    #[serde(default)]
    pub slippage_alerts: u32,
}

impl SessionState {
    pub fn fresh(trading_date: String, equity: f64) -> Self {
        Self {
            trading_date,
            starting_equity: equity,
            current_equity: equity,
            peak_equity: equity,
            daily_pnl: 0.0,
            daily_trades: 0,
            consecutive_wins: 0,
            consecutive_losses: 0,
            last_trade_ts: None,
            halted: false,
            halt_reason: None,
            slippage_alerts: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Gate verdicts
// ---------------------------------------------------------------------------

/// Why a new entry was blocked.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EntryBlock {
    Halted { reason: String },
    LicenseExpired,
    LicenseConflict,
    DataStale,
    DailyLossLimit { daily_pnl: f64, limit: f64 },
    ApproachThreshold { daily_pnl: f64, limit: f64 },
    MaxTradesReached { trades: u32, max: u32 },
    MaintenanceWindow,
    FridayCutoff,
    EventBlackout { event: String },
    ConfidenceBelowThreshold { confidence: f64, required: f64 },
    RecoveryTierSizeExhausted,
}

impl std::fmt::Display for EntryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Halted { reason } => write!(f, "HALTED({reason})"),
            Self::LicenseExpired => write!(f, "LICENSE_EXPIRED"),
            Self::LicenseConflict => write!(f, "LICENSE_CONFLICT"),
            Self::DataStale => write!(f, "DATA_STALE"),
            Self::DailyLossLimit { daily_pnl, limit } => {
                write!(f, "DAILY_LOSS_LIMIT({daily_pnl:.0}/{limit:.0})")
            }
            Self::ApproachThreshold { daily_pnl, limit } => {
                write!(f, "APPROACH_THRESHOLD({daily_pnl:.0}/{limit:.0})")
            }
            Self::MaxTradesReached { trades, max } => {
                write!(f, "MAX_TRADES({trades}/{max})")
            }
            Self::MaintenanceWindow => write!(f, "MAINTENANCE_WINDOW"),
            Self::FridayCutoff => write!(f, "FRIDAY_CUTOFF"),
            Self::EventBlackout { event } => write!(f, "EVENT_BLACKOUT({event})"),
            Self::ConfidenceBelowThreshold {
                confidence,
                required,
            } => write!(f, "CONFIDENCE({confidence:.2} < {required:.2})"),
            Self::RecoveryTierSizeExhausted => write!(f, "RECOVERY_SIZE_EXHAUSTED"),
        }
    }
}

/// A configured economic release with a no-trade window around it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EconomicEvent {
    pub name: String,
    pub ts: DateTime<Utc>,
}

/// Minutes before an event that the blackout begins.
const BLACKOUT_BEFORE_MIN: i64 = 30;
/// Minutes after an event that the blackout ends.
const BLACKOUT_AFTER_MIN: i64 = 60;

/// Fraction of the daily loss limit at which the approach rules engage.
const APPROACH_FRACTION: f64 = 0.80;

/// Recovery-mode tiers: (loss fraction of limit, required confidence,
/// contract multiplier).
const RECOVERY_TIERS: [(f64, f64, f64); 3] =
    [(0.95, 0.90, 0.33), (0.90, 0.85, 0.50), (0.80, 0.75, 0.75)];

// ---------------------------------------------------------------------------
// SessionGate
// ---------------------------------------------------------------------------

pub struct SessionGate {
    // Config-derived limits.
    daily_loss_limit: f64,
    max_trades_per_day: u32,
    max_contracts: u32,
    confidence_threshold: f64,
    stop_on_approach: bool,
    fomc_block_enabled: bool,
    session_start: NaiveTime,
    maintenance_start: NaiveTime,
    flatten_forced: NaiveTime,
    friday_cutoff: NaiveTime,

    pub session: SessionState,
    events: Vec<EconomicEvent>,

    // Externally updated conditions.
    license: LicenseState,
    staleness: StalenessLevel,
}

impl SessionGate {
    pub fn new(config: &EngineConfig, now_et: DateTime<Tz>) -> Self {
        let date = Self::session_date(now_et, config.session_start());
        Self {
            daily_loss_limit: config.daily_loss_limit,
            max_trades_per_day: config.max_trades_per_day,
            max_contracts: config.max_contracts,
            confidence_threshold: config.confidence_threshold,
            stop_on_approach: config.stop_on_approach,
            fomc_block_enabled: config.fomc_block_enabled,
            session_start: config.session_start(),
            maintenance_start: config.maintenance_start(),
            flatten_forced: config.flatten_forced(),
            friday_cutoff: config.friday_cutoff(),
            session: SessionState::fresh(date, config.account_size),
            events: Vec::new(),
            license: LicenseState::Unknown,
            staleness: StalenessLevel::Fresh,
        }
    }

    /// Adopt a previously persisted session (same trading date only; the
    /// caller rolls stale ledgers through `maybe_roll_session`).
    pub fn restore_session(&mut self, session: SessionState) {
        info!(
            trading_date = %session.trading_date,
            daily_pnl = session.daily_pnl,
            daily_trades = session.daily_trades,
            "session state restored"
        );
        self.session = session;
    }

    pub fn set_events(&mut self, events: Vec<EconomicEvent>) {
        self.events = events;
    }

    pub fn set_license(&mut self, license: LicenseState) {
        self.license = license;
    }

    pub fn license(&self) -> &LicenseState {
        &self.license
    }

    pub fn set_staleness(&mut self, staleness: StalenessLevel) {
        self.staleness = staleness;
    }

    pub fn halt(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(reason = %reason, "session halted");
        self.session.halted = true;
        self.session.halt_reason = Some(reason);
    }

    pub fn clear_halt(&mut self) {
        self.session.halted = false;
        self.session.halt_reason = None;
    }

    // -------------------------------------------------------------------------
    // Entry gating
    // -------------------------------------------------------------------------

    /// Full entry check for a scored candidate.
    ///
    /// `has_open_position` matters only for license grace wording; the
    /// one-position-per-instance rule is enforced by the position manager.
    pub fn can_enter(
        &self,
        now_et: DateTime<Tz>,
        confidence: f64,
        has_open_position: bool,
    ) -> Result<(), EntryBlock> {
        if self.session.halted {
            return Err(EntryBlock::Halted {
                reason: self
                    .session
                    .halt_reason
                    .clone()
                    .unwrap_or_else(|| "unspecified".to_string()),
            });
        }

        match self.license {
            LicenseState::Expired => return Err(EntryBlock::LicenseExpired),
            LicenseState::Conflict => return Err(EntryBlock::LicenseConflict),
            LicenseState::Valid { .. } | LicenseState::Unknown => {}
        }
        let _ = has_open_position;

        if self.staleness >= StalenessLevel::EntryBlocking {
            return Err(EntryBlock::DataStale);
        }

        let loss = (-self.session.daily_pnl).max(0.0);
        if loss >= self.daily_loss_limit {
            return Err(EntryBlock::DailyLossLimit {
                daily_pnl: self.session.daily_pnl,
                limit: self.daily_loss_limit,
            });
        }

        let mut required_confidence = self.confidence_threshold;
        if loss >= APPROACH_FRACTION * self.daily_loss_limit {
            if self.stop_on_approach {
                return Err(EntryBlock::ApproachThreshold {
                    daily_pnl: self.session.daily_pnl,
                    limit: self.daily_loss_limit,
                });
            }
            // Recovery mode: raise the bar instead of closing the door.
            if let Some((_, conf, mult)) = self.recovery_tier(loss) {
                required_confidence = required_confidence.max(conf);
                if (self.max_contracts as f64 * mult).floor() < 1.0 {
                    return Err(EntryBlock::RecoveryTierSizeExhausted);
                }
            }
        }

        if self.session.daily_trades >= self.max_trades_per_day {
            return Err(EntryBlock::MaxTradesReached {
                trades: self.session.daily_trades,
                max: self.max_trades_per_day,
            });
        }

        if self.in_maintenance_window(now_et) {
            return Err(EntryBlock::MaintenanceWindow);
        }

        if now_et.weekday() == Weekday::Fri && now_et.time() >= self.friday_cutoff {
            return Err(EntryBlock::FridayCutoff);
        }

        if let Some(event) = self.active_blackout(now_et.with_timezone(&Utc)) {
            return Err(EntryBlock::EventBlackout {
                event: event.name.clone(),
            });
        }

        if confidence < required_confidence {
            return Err(EntryBlock::ConfidenceBelowThreshold {
                confidence,
                required: required_confidence,
            });
        }

        Ok(())
    }

    /// Max contracts allowed right now, after recovery-tier scaling.
    pub fn max_contracts_now(&self) -> u32 {
        let loss = (-self.session.daily_pnl).max(0.0);
        if !self.stop_on_approach {
            if let Some((_, _, mult)) = self.recovery_tier(loss) {
                return (self.max_contracts as f64 * mult).floor() as u32;
            }
        }
        self.max_contracts
    }

    fn recovery_tier(&self, loss: f64) -> Option<(f64, f64, f64)> {
        if self.daily_loss_limit <= 0.0 {
            return None;
        }
        let frac = loss / self.daily_loss_limit;
        RECOVERY_TIERS
            .iter()
            .find(|(tier, _, _)| frac >= *tier)
            .copied()
    }

    // -------------------------------------------------------------------------
    // Forced flatten
    // -------------------------------------------------------------------------

    /// Whether the session layer demands the open position be closed now.
    ///
    /// Escalation inside the maintenance window: a normal SESSION_FLATTEN at
    /// `maintenance_start_et`, hardening to EMERGENCY at `flatten_forced_et`.
    pub fn forced_flatten(&self, now_et: DateTime<Tz>) -> Option<ExitReason> {
        if self.staleness >= StalenessLevel::FlattenRequired {
            return Some(ExitReason::Emergency);
        }

        let t = now_et.time();
        let weekday = now_et.weekday();
        let is_weekday = weekday != Weekday::Sat && weekday != Weekday::Sun;

        if is_weekday && t >= self.flatten_forced && t < self.session_start {
            return Some(ExitReason::Emergency);
        }
        if is_weekday && t >= self.maintenance_start && t < self.session_start {
            return Some(ExitReason::SessionFlatten);
        }

        if self.active_blackout(now_et.with_timezone(&Utc)).is_some() {
            return Some(ExitReason::EventFlatten);
        }

        None
    }

    fn in_maintenance_window(&self, now_et: DateTime<Tz>) -> bool {
        let weekday = now_et.weekday();
        if weekday == Weekday::Sat || weekday == Weekday::Sun {
            return false;
        }
        let t = now_et.time();
        t >= self.maintenance_start && t < self.session_start
    }

    fn active_blackout(&self, now: DateTime<Utc>) -> Option<&EconomicEvent> {
        if !self.fomc_block_enabled {
            return None;
        }
        self.events.iter().find(|e| {
            let from = e.ts - chrono::Duration::minutes(BLACKOUT_BEFORE_MIN);
            let until = e.ts + chrono::Duration::minutes(BLACKOUT_AFTER_MIN);
            now >= from && now < until
        })
    }

    // -------------------------------------------------------------------------
    // Trade accounting
    // -------------------------------------------------------------------------

    /// Record a filled entry (counts toward the daily cap).
    pub fn record_entry(&mut self, now: DateTime<Utc>) {
        self.session.daily_trades += 1;
        self.session.last_trade_ts = Some(now);
    }

    /// Record the realized PnL of a completed trade.
    pub fn on_trade_closed(&mut self, pnl: f64, now: DateTime<Utc>) {
        let s = &mut self.session;
        s.daily_pnl += pnl;
        s.current_equity += pnl;
        if s.current_equity > s.peak_equity {
            s.peak_equity = s.current_equity;
        }
        if pnl >= 0.0 {
            s.consecutive_wins += 1;
            s.consecutive_losses = 0;
        } else {
            s.consecutive_losses += 1;
            s.consecutive_wins = 0;
        }
        s.last_trade_ts = Some(now);

        info!(
            pnl = format!("{:.2}", pnl),
            daily_pnl = format!("{:.2}", s.daily_pnl),
            daily_trades = s.daily_trades,
            consecutive_losses = s.consecutive_losses,
            "trade result recorded"
        );
    }

    pub fn record_slippage_alert(&mut self) {
        self.session.slippage_alerts += 1;
    }

    // -------------------------------------------------------------------------
    // Session roll
    // -------------------------------------------------------------------------

    /// Roll the session ledger when the clock crosses `session_start_et`.
    /// Returns the closed-out session for persistence/stats when a roll
    /// happened.
    pub fn maybe_roll_session(&mut self, now_et: DateTime<Tz>) -> Option<SessionState> {
        let date = Self::session_date(now_et, self.session_start);
        if date == self.session.trading_date {
            return None;
        }

        let closed = self.session.clone();
        let equity = self.session.current_equity;
        info!(
            old_date = %closed.trading_date,
            new_date = %date,
            carried_equity = format!("{:.2}", equity),
            "session rolled"
        );

        self.session = SessionState::fresh(date, equity);
        Some(closed)
    }

    /// The trading date a given ET wall-clock time belongs to: times at or
    /// after the session start roll into the next calendar day.
    fn session_date(now_et: DateTime<Tz>, session_start: NaiveTime) -> String {
        let date = if now_et.time() >= session_start && session_start.hour() >= 12 {
            now_et.date_naive() + chrono::Duration::days(1)
        } else {
            now_et.date_naive()
        };
        date.format("%Y-%m-%d").to_string()
    }
}
