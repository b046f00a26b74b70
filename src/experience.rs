// =============================================================================
// Experience Recorder — decision records for the learning stack
// =============================================================================
//
// Two append-only JSON-lines sinks under `{data_dir}/experiences/`:
//   signal_experiences_v2.jsonl   one record per evaluated candidate
//   exit_experiences_v2.jsonl     one record per closed position
//
// Signal records are written twice: once at decision time (outcome null —
// this is what guarantees a ghost record exists within one bar of the
// decision) and once at resolution with the outcome attached. Records share
// the signal_id; the last line for an id wins. Every line carries a
// schema_version tag and is written with flush + fsync so a crash can
// truncate at most the line being written.
//
// Ghost candidates are resolved by counterfactual simulation: a detached
// position is advanced through the same exit ladder with a cloned parameter
// bundle until a rule closes it (hard-capped at GHOST_MAX_BARS).
//
// Recorder IO failures are logged and never block trading.
// =============================================================================

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::indicators::IndicatorSnapshot;
use crate::market_data::Bar;
use crate::position::{
    ExitEvaluator, ExitParams, PartialFill, Position, PositionManager, StopAdjustment,
};
use crate::signal::{FeatureVector, SignalCandidate};

pub const SIGNAL_SCHEMA_VERSION: u32 = 2;
pub const EXIT_SCHEMA_VERSION: u32 = 2;

/// Bars after which an unresolved ghost is abandoned.
const GHOST_MAX_BARS: u32 = 600;

// ---------------------------------------------------------------------------
// Record shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalOutcome {
    pub pnl: f64,
    pub r_multiple: f64,
    pub exit_reason: String,
    pub duration_bars: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalExperience {
    pub schema_version: u32,
    pub signal_id: String,
    #[serde(default)]
    pub position_id: Option<String>,
    pub ts: DateTime<Utc>,
    pub features: FeatureVector,
    pub confidence: f64,
    pub took_trade: bool,
    pub is_ghost: bool,
    #[serde(default)]
    pub reject_reason: Option<String>,
    #[serde(default)]
    pub outcome: Option<SignalOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectorySummary {
    /// Max adverse excursion, price units per contract.
    pub mae: f64,
    /// Max favourable excursion, price units per contract.
    pub mfe: f64,
    pub peak_unrealized_r: f64,
    pub drawdown_from_peak_r: f64,
    pub max_r_achieved: f64,
    pub min_r_achieved: f64,
    pub stop_adjustments: Vec<StopAdjustment>,
    pub partial_exits: Vec<PartialFill>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitOutcomeRecord {
    pub final_reason: String,
    pub realized_pnl: f64,
    pub r_multiple: f64,
    pub duration_bars: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitExperience {
    pub schema_version: u32,
    pub position_id: String,
    pub signal_id: String,
    pub ts: DateTime<Utc>,
    pub entry_features: FeatureVector,
    /// The verbatim bundle the exit manager ran with.
    pub exit_params: ExitParams,
    pub trajectory: TrajectorySummary,
    pub outcome: ExitOutcomeRecord,
    /// true when the provider failed and documented defaults were used.
    pub provider_fallback: bool,
}

// ---------------------------------------------------------------------------
// Ghost simulation
// ---------------------------------------------------------------------------

struct GhostSim {
    experience: SignalExperience,
    manager: PositionManager,
    params: ExitParams,
    bars: u32,
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

pub struct ExperienceRecorder {
    signal_path: PathBuf,
    exit_path: PathBuf,
    tick_size: f64,
    tick_value: f64,
    commission_per_contract: f64,
    evaluator: ExitEvaluator,
    /// Taken trades awaiting an outcome, keyed by position id.
    pending: HashMap<String, SignalExperience>,
    ghosts: Vec<GhostSim>,
    write_errors: u64,
}

impl ExperienceRecorder {
    pub fn new(
        data_dir: &Path,
        tick_size: f64,
        tick_value: f64,
        commission_per_contract: f64,
    ) -> Self {
        let experiences = data_dir.join("experiences");
        Self {
            signal_path: experiences.join("signal_experiences_v2.jsonl"),
            exit_path: experiences.join("exit_experiences_v2.jsonl"),
            tick_size,
            tick_value,
            commission_per_contract,
            evaluator: ExitEvaluator::new(tick_size),
            pending: HashMap::new(),
            ghosts: Vec::new(),
            write_errors: 0,
        }
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors
    }

    // -------------------------------------------------------------------------
    // Decision-time recording
    // -------------------------------------------------------------------------

    /// Record a candidate the engine is taking. The outcome line follows
    /// when the position closes.
    pub fn record_taken(&mut self, candidate: &SignalCandidate, position_id: &str, now: DateTime<Utc>) {
        let record = SignalExperience {
            schema_version: SIGNAL_SCHEMA_VERSION,
            signal_id: candidate.id.clone(),
            position_id: Some(position_id.to_string()),
            ts: now,
            features: candidate.feature_vector.clone(),
            confidence: candidate.confidence,
            took_trade: true,
            is_ghost: false,
            reject_reason: None,
            outcome: None,
        };
        self.append_signal(&record);
        self.pending.insert(position_id.to_string(), record);
    }

    /// Record a rejected candidate as a ghost and start its counterfactual
    /// simulation under the same exit rules with a cloned parameter bundle.
    pub fn record_ghost(
        &mut self,
        candidate: &SignalCandidate,
        reject_reason: &str,
        params: &ExitParams,
        now: DateTime<Utc>,
    ) {
        let record = SignalExperience {
            schema_version: SIGNAL_SCHEMA_VERSION,
            signal_id: candidate.id.clone(),
            position_id: None,
            ts: now,
            features: candidate.feature_vector.clone(),
            confidence: candidate.confidence,
            took_trade: false,
            is_ghost: true,
            reject_reason: Some(reject_reason.to_string()),
            outcome: None,
        };
        self.append_signal(&record);

        let mut manager = PositionManager::new("GHOST");
        let opened = manager.open(
            &candidate.id,
            candidate.side,
            1,
            candidate.entry_ref_price,
            candidate.initial_stop,
            candidate.initial_target,
            candidate.feature_vector.atr,
            candidate.confidence,
            0.0,
            now,
        );
        if opened.is_err() {
            return;
        }

        debug!(signal_id = %candidate.id, reason = reject_reason, "ghost simulation started");
        self.ghosts.push(GhostSim {
            experience: record,
            manager,
            params: params.clone(),
            bars: 0,
        });
    }

    // -------------------------------------------------------------------------
    // Resolution
    // -------------------------------------------------------------------------

    /// Advance every unresolved ghost by one finalized bar.
    pub fn on_bar(&mut self, bar: &Bar, snapshot: &IndicatorSnapshot, now: DateTime<Utc>) {
        let tick_size = self.tick_size;
        let tick_value = self.tick_value;
        let commission = self.commission_per_contract;
        let evaluator = &self.evaluator;

        let mut resolved: Vec<SignalExperience> = Vec::new();

        self.ghosts.retain_mut(|ghost| {
            ghost.bars += 1;

            let decision =
                evaluator.evaluate_bar(&mut ghost.manager, bar, snapshot, &ghost.params, None, now);

            if let Some(d) = decision {
                let price = d.target_price;
                if let Some(closed) = ghost.manager.apply_exit_fill(
                    d.reason, d.size, price, commission, tick_size, tick_value, now,
                ) {
                    let mut record = ghost.experience.clone();
                    record.outcome = Some(SignalOutcome {
                        pnl: closed.realized_pnl,
                        r_multiple: r_multiple(&closed, tick_size, tick_value),
                        exit_reason: d.reason.to_string(),
                        duration_bars: ghost.bars,
                    });
                    resolved.push(record);
                    return false;
                }
            }

            if ghost.bars >= GHOST_MAX_BARS {
                warn!(signal_id = %ghost.experience.signal_id, "ghost abandoned after max bars");
                return false;
            }
            true
        });

        for record in resolved {
            info!(
                signal_id = %record.signal_id,
                pnl = record.outcome.as_ref().map(|o| o.pnl).unwrap_or(0.0),
                "ghost resolved"
            );
            self.append_signal(&record);
        }
    }

    /// Record the close of a taken position: the signal outcome line and the
    /// full exit experience.
    #[allow(clippy::too_many_arguments)]
    pub fn record_close(
        &mut self,
        position: &Position,
        params_used: &ExitParams,
        provider_fallback: bool,
        now: DateTime<Utc>,
    ) {
        let reason = position
            .final_exit_reason
            .map(|r| r.to_string())
            .unwrap_or_else(|| "UNKNOWN".to_string());
        let r = r_multiple(position, self.tick_size, self.tick_value);

        if let Some(mut signal_record) = self.pending.remove(&position.id) {
            signal_record.outcome = Some(SignalOutcome {
                pnl: position.realized_pnl,
                r_multiple: r,
                exit_reason: reason.clone(),
                duration_bars: position.bars_held,
            });
            self.append_signal(&signal_record);

            let risk = position.initial_risk();
            let peak_r = if risk > 0.0 {
                position.max_favorable_excursion / risk
            } else {
                0.0
            };
            let min_r = if risk > 0.0 {
                -position.max_adverse_excursion / risk
            } else {
                0.0
            };

            let exit_record = ExitExperience {
                schema_version: EXIT_SCHEMA_VERSION,
                position_id: position.id.clone(),
                signal_id: position.signal_id.clone(),
                ts: now,
                entry_features: signal_record.features.clone(),
                exit_params: params_used.clone(),
                trajectory: TrajectorySummary {
                    mae: position.max_adverse_excursion,
                    mfe: position.max_favorable_excursion,
                    peak_unrealized_r: peak_r,
                    drawdown_from_peak_r: peak_r - r,
                    max_r_achieved: peak_r,
                    min_r_achieved: min_r,
                    stop_adjustments: position.stop_adjustments.clone(),
                    partial_exits: position.partials_taken.clone(),
                },
                outcome: ExitOutcomeRecord {
                    final_reason: reason,
                    realized_pnl: position.realized_pnl,
                    r_multiple: r,
                    duration_bars: position.bars_held,
                },
                provider_fallback,
            };
            self.append_exit(&exit_record);
        } else {
            warn!(
                position_id = %position.id,
                "position closed with no pending signal record"
            );
        }
    }

    /// Unresolved ghost count (diagnostics).
    pub fn ghost_count(&self) -> usize {
        self.ghosts.len()
    }

    // -------------------------------------------------------------------------
    // Line-atomic JSONL writes
    // -------------------------------------------------------------------------

    fn append_signal(&mut self, record: &SignalExperience) {
        if let Err(e) = append_jsonl(&self.signal_path, record) {
            self.write_errors += 1;
            warn!(error = %e, "signal experience write failed (will not block trading)");
        }
    }

    fn append_exit(&mut self, record: &ExitExperience) {
        if let Err(e) = append_jsonl(&self.exit_path, record) {
            self.write_errors += 1;
            warn!(error = %e, "exit experience write failed (will not block trading)");
        }
    }
}

/// R-multiple of a closed (or closing) position.
fn r_multiple(position: &Position, tick_size: f64, tick_value: f64) -> f64 {
    let risk_ticks = position.initial_risk() / tick_size;
    let risk_dollars = risk_ticks * tick_value * position.contracts as f64;
    if risk_dollars > 0.0 {
        position.realized_pnl / risk_dollars
    } else {
        0.0
    }
}

/// Append one record as a JSON line with flush + fsync.
fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let line = serde_json::to_string(record).context("failed to serialise experience record")?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(line.as_bytes())
        .and_then(|_| file.write_all(b"\n"))
        .and_then(|_| file.flush())
        .and_then(|_| file.sync_data())
        .with_context(|| format!("failed to append to {}", path.display()))?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExitReason, MarketRegime, Side, TradeType};
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).single().unwrap()
    }

    fn candidate(side: Side) -> SignalCandidate {
        let dir = match side {
            Side::Long => 1.0,
            Side::Short => -1.0,
        };
        SignalCandidate {
            id: "sig-test".to_string(),
            side,
            entry_ref_price: 5000.0,
            initial_stop: 5000.0 - dir * 2.0,
            initial_target: 5000.0 + dir * 6.0,
            reason: "test".to_string(),
            trade_type: TradeType::Reversal,
            confidence: 0.7,
            feature_vector: FeatureVector {
                atr: 2.0,
                ..Default::default()
            },
            ghost_flag: false,
        }
    }

    fn snapshot() -> IndicatorSnapshot {
        IndicatorSnapshot {
            rsi: 50.0,
            atr: 2.0,
            vwap: 5000.0,
            vwap_stddev: 2.0,
            vwap_distance_sigma: 0.0,
            volume_ratio: 1.0,
            synthetic_vix: 15.0,
            trend_strength: 0.002,
            sr_proximity_ticks: 20.0,
            market_regime: MarketRegime::Normal,
        }
    }

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            start_ts: ts(),
            open,
            high,
            low,
            close,
            volume: 100,
            vwap_snapshot: close,
            synthetic: false,
        }
    }

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn recorder(dir: &Path) -> ExperienceRecorder {
        std::fs::create_dir_all(dir.join("experiences")).unwrap();
        ExperienceRecorder::new(dir, 0.25, 1.25, 0.0)
    }

    #[test]
    fn taken_trade_writes_decision_then_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = recorder(dir.path());
        let c = candidate(Side::Long);

        rec.record_taken(&c, "pos-1", ts());

        // Build a matching closed position.
        let mut m = PositionManager::new("MES");
        m.open("sig-test", Side::Long, 2, 5000.0, 4998.0, 5006.0, 2.0, 0.7, 0.0, ts())
            .unwrap();
        if let Some(p) = m.active_mut() {
            p.id = "pos-1".to_string();
            p.bars_held = 12;
        }
        m.observe_price(5006.0);
        let closed = m
            .apply_exit_fill(ExitReason::Target, 2, 5006.0, 0.0, 0.25, 1.25, ts())
            .unwrap();

        rec.record_close(&closed, &ExitParams::defaults(), false, ts());

        let signals = read_lines(&dir.path().join("experiences/signal_experiences_v2.jsonl"));
        assert_eq!(signals.len(), 2);
        assert!(signals[0]["outcome"].is_null());
        let outcome = &signals[1]["outcome"];
        // 24 ticks * $1.25 * 2 = $60; risk 8 ticks * $1.25 * 2 = $20 -> 3R.
        assert_eq!(outcome["pnl"], 60.0);
        assert_eq!(outcome["r_multiple"], 3.0);
        assert_eq!(outcome["exit_reason"], "TARGET");
        assert_eq!(signals[1]["schema_version"], 2);

        let exits = read_lines(&dir.path().join("experiences/exit_experiences_v2.jsonl"));
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0]["position_id"], "pos-1");
        assert_eq!(exits[0]["outcome"]["final_reason"], "TARGET");
        assert_eq!(exits[0]["schema_version"], 2);
        assert!(exits[0]["exit_params"].is_object());
    }

    #[test]
    fn ghost_written_immediately_and_resolved_by_simulation() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = recorder(dir.path());
        let c = candidate(Side::Long);

        rec.record_ghost(&c, "SCORER_CONFIDENCE", &ExitParams::defaults(), ts());
        assert_eq!(rec.ghost_count(), 1);

        // The decision line exists before any bar advances (within-one-bar
        // guarantee).
        let signals = read_lines(&dir.path().join("experiences/signal_experiences_v2.jsonl"));
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0]["is_ghost"], true);
        assert_eq!(signals[0]["took_trade"], false);
        assert_eq!(signals[0]["reject_reason"], "SCORER_CONFIDENCE");

        // Drive the tape to the ghost's target: stop 4998, target 5006.
        rec.on_bar(&bar(5001.0, 5002.0, 5000.5, 5001.5), &snapshot(), ts());
        rec.on_bar(&bar(5002.0, 5006.5, 5001.5, 5006.0), &snapshot(), ts());

        assert_eq!(rec.ghost_count(), 0);
        let signals = read_lines(&dir.path().join("experiences/signal_experiences_v2.jsonl"));
        assert_eq!(signals.len(), 2);
        let outcome = &signals[1]["outcome"];
        assert_eq!(outcome["exit_reason"], "TARGET");
        // 24 ticks * $1.25 * 1 contract = $30.
        assert_eq!(outcome["pnl"], 30.0);
    }

    #[test]
    fn losing_ghost_resolves_at_stop() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = recorder(dir.path());
        rec.record_ghost(
            &candidate(Side::Long),
            "RISK_GATE",
            &ExitParams::defaults(),
            ts(),
        );

        rec.on_bar(&bar(4999.0, 4999.5, 4997.5, 4998.0), &snapshot(), ts());

        assert_eq!(rec.ghost_count(), 0);
        let signals = read_lines(&dir.path().join("experiences/signal_experiences_v2.jsonl"));
        let outcome = &signals[1]["outcome"];
        assert_eq!(outcome["exit_reason"], "STOP");
        assert_eq!(outcome["r_multiple"], -1.0);
    }

    #[test]
    fn ghost_and_real_records_reference_same_schema() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = recorder(dir.path());
        rec.record_taken(&candidate(Side::Long), "pos-9", ts());
        rec.record_ghost(
            &candidate(Side::Short),
            "X",
            &ExitParams::defaults(),
            ts(),
        );

        let signals = read_lines(&dir.path().join("experiences/signal_experiences_v2.jsonl"));
        for s in &signals {
            assert_eq!(s["schema_version"], 2);
            assert!(s["features"].is_object());
        }
    }

    #[test]
    fn write_failure_does_not_panic() {
        // Point the recorder at a directory that does not exist.
        let mut rec = ExperienceRecorder::new(Path::new("/nonexistent-dir"), 0.25, 1.25, 0.0);
        rec.record_taken(&candidate(Side::Long), "pos-1", ts());
        assert_eq!(rec.write_errors(), 1);
    }
}
