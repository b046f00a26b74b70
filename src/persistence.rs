// =============================================================================
// State Persistence — snapshots, session ledger, broker verification
// =============================================================================
//
// Two ledgers under `{data_dir}`:
//   positions/{symbol}.json         current position snapshot (+ .backup)
//   session_state.json              per-session counters and equity
//
// Snapshot writes are atomic: serialize to `{file}.new`, fsync, demote the
// prior snapshot to `.backup`, rename over. A crash at any point leaves
// either the old or the new file intact, never a torn one.
//
// On startup the loaded snapshot is verified against the broker:
//   broker flat, snapshot has a position  -> snapshot discarded (audited)
//   broker has a position, snapshot agrees -> restored as-is
//   broker has a position, snapshot absent or mismatched -> the broker is
//     authoritative: a minimal position is reconstructed around the broker's
//     average price with conservative ATR-derived stops, and managed from
//     there.
// =============================================================================

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::BrokerPosition;
use crate::position::{ExitSubstate, Position, StopOwner};
use crate::risk::SessionState;

pub struct StateStore {
    data_dir: PathBuf,
}

/// How the persisted position squared with the broker at startup.
#[derive(Debug)]
pub enum ReconcileOutcome {
    /// Flat on both sides.
    NoPosition,
    /// Snapshot and broker agree; resume managing it.
    Restored(Position),
    /// Snapshot claimed a position the broker does not have.
    SnapshotDiscarded { reason: String },
    /// Broker is authoritative; a minimal position was rebuilt from it.
    Reconstructed(Position),
}

impl StateStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(data_dir.join("positions"))
            .with_context(|| format!("failed to create {}", data_dir.display()))?;
        fs::create_dir_all(data_dir.join("experiences"))
            .with_context(|| format!("failed to create {}/experiences", data_dir.display()))?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn position_path(&self, symbol: &str) -> PathBuf {
        self.data_dir.join("positions").join(format!("{symbol}.json"))
    }

    fn session_path(&self) -> PathBuf {
        self.data_dir.join("session_state.json")
    }

    // -------------------------------------------------------------------------
    // Atomic write plumbing
    // -------------------------------------------------------------------------

    /// Write `content` to `path` atomically, demoting any prior file to
    /// `.backup`.
    fn write_atomic(path: &Path, content: &str) -> Result<()> {
        let new_path = path.with_extension("json.new");
        {
            let mut f = fs::File::create(&new_path)
                .with_context(|| format!("failed to create {}", new_path.display()))?;
            f.write_all(content.as_bytes())
                .with_context(|| format!("failed to write {}", new_path.display()))?;
            f.sync_all()
                .with_context(|| format!("failed to fsync {}", new_path.display()))?;
        }

        if path.exists() {
            let backup = path.with_extension("json.backup");
            fs::rename(path, &backup)
                .with_context(|| format!("failed to demote prior snapshot to {}", backup.display()))?;
        }

        fs::rename(&new_path, path)
            .with_context(|| format!("failed to rename {} into place", new_path.display()))?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Position snapshot
    // -------------------------------------------------------------------------

    /// Persist the live position. Called after every mutation; the snapshot
    /// on disk always reflects the state after the mutation that triggered
    /// the write.
    pub fn save_position(&self, position: &Position) -> Result<()> {
        let content = serde_json::to_string_pretty(position)
            .context("failed to serialise position snapshot")?;
        Self::write_atomic(&self.position_path(&position.symbol), &content)
    }

    /// Load the persisted snapshot, if any. A missing file means flat; a
    /// corrupt file is reported, not silently ignored.
    pub fn load_position(&self, symbol: &str) -> Result<Option<Position>> {
        let path = self.position_path(symbol);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let position: Position = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(position))
    }

    /// Remove the snapshot once the position is fully closed and recorded.
    /// The `.backup` of the final state is retained.
    pub fn clear_position(&self, symbol: &str) -> Result<()> {
        let path = self.position_path(symbol);
        if path.exists() {
            let backup = path.with_extension("json.backup");
            fs::rename(&path, &backup)
                .with_context(|| format!("failed to retire snapshot {}", path.display()))?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Session ledger
    // -------------------------------------------------------------------------

    pub fn save_session(&self, session: &SessionState) -> Result<()> {
        let content = serde_json::to_string_pretty(session)
            .context("failed to serialise session state")?;
        Self::write_atomic(&self.session_path(), &content)
    }

    pub fn load_session(&self) -> Result<Option<SessionState>> {
        let path = self.session_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let session: SessionState = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(session))
    }

    // -------------------------------------------------------------------------
    // Broker verification
    // -------------------------------------------------------------------------

    /// Square a loaded snapshot with the broker's view of the symbol.
    pub fn verify_against_broker(
        symbol: &str,
        snapshot: Option<Position>,
        broker_positions: &[BrokerPosition],
        current_atr: f64,
        now: DateTime<Utc>,
    ) -> ReconcileOutcome {
        let broker = broker_positions.first().copied();

        match (snapshot, broker) {
            (None, None) => ReconcileOutcome::NoPosition,

            (Some(snap), None) => {
                let reason = format!(
                    "snapshot shows {} {} x{} but broker reports flat",
                    snap.side, snap.symbol, snap.remaining_contracts
                );
                warn!(position_id = %snap.id, "{reason} — discarding snapshot");
                ReconcileOutcome::SnapshotDiscarded { reason }
            }

            (Some(snap), Some(live))
                if snap.side == live.side && snap.remaining_contracts == live.size =>
            {
                info!(
                    position_id = %snap.id,
                    side = %snap.side,
                    size = live.size,
                    "snapshot matches broker — restoring position"
                );
                ReconcileOutcome::Restored(snap)
            }

            (snap, Some(live)) => {
                if let Some(ref s) = snap {
                    warn!(
                        snapshot_side = %s.side,
                        snapshot_size = s.remaining_contracts,
                        broker_side = %live.side,
                        broker_size = live.size,
                        "snapshot disagrees with broker — broker is authoritative"
                    );
                }
                let rebuilt = Self::reconstruct(symbol, live, current_atr, now);
                ReconcileOutcome::Reconstructed(rebuilt)
            }
        }
    }

    /// Minimal position rebuilt from the broker's report: entry at the
    /// broker average, conservative stops two ATRs away.
    fn reconstruct(
        symbol: &str,
        live: BrokerPosition,
        current_atr: f64,
        now: DateTime<Utc>,
    ) -> Position {
        let dir = live.side.direction();
        let atr = if current_atr > 0.0 { current_atr } else { 1.0 };
        let stop = live.avg_price - dir * 2.0 * atr;
        let target = live.avg_price + dir * 2.0 * atr;

        Position {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side: live.side,
            contracts: live.size,
            entry_price_avg: live.avg_price,
            entry_ts: now,
            initial_stop: stop,
            current_stop: stop,
            initial_target: target,
            remaining_contracts: live.size,
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
            entry_atr: atr,
            entry_confidence: 0.0,
            entry_slippage_ticks: 0.0,
            signal_id: String::new(),
            bars_held: 0,
            underwater_bars: 0,
            sideways_bars: 0,
            adverse_bars: 0,
            closed_ts: None,
            final_exit_reason: None,
        }
    }
}
