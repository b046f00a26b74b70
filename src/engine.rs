// =============================================================================
// Engine — single-threaded event loop over all trading state
// =============================================================================
//
// The engine value owns every piece of mutable trading state: feed, bar
// builder, indicators, quote analytics, signal engine, session gate, router,
// position manager, persistence, and the experience recorder. I/O tasks
// (broker gateway, license client, timers) communicate with it exclusively
// through the event bus; handlers run one at a time on this task.
//
// Event priority and timer cadences follow the scheduler contract:
//   EMERGENCY > EXIT_TRIGGER > TICK > BAR_FINALIZED > TIMER > CLOUD_CHECK
//   20s heartbeat, 30s position flush, 60s session flush, 300s license
//   validation, ET-aligned minute boundary.
//
// Handlers are public so the backtest replay source can drive the identical
// code path synchronously under a SimClock: same inputs, same trades, same
// experience records.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Datelike, Timelike};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::audit::AuditLog;
use crate::broker::BrokerGateway;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::events::{CloudEvent, Event, EventBus, TimerKind};
use crate::experience::ExperienceRecorder;
use crate::indicators::{IndicatorPipeline, IndicatorSnapshot, RegimeThresholds};
use crate::license::{LicenseClient, LicenseState};
use crate::market_data::{Bar, BarBuilder, StalenessLevel, Tick, TickFeed};
use crate::notify::{Notifier, Severity};
use crate::persistence::{ReconcileOutcome, StateStore};
use crate::position::{
    ExitEvaluator, ExitFeatureVector, ExitParams, ExitParamsProvider, PositionManager,
};
use crate::quotes::BidAskManager;
use crate::risk::{SessionGate, SessionState};
use crate::router::{
    new_shared_quote, BreakerState, EntryContext, EntryOutcome, ExitOutcome, OrderRouter,
    SharedQuote,
};
use crate::signal::{ConfidenceScorer, FeatureVector, SignalCandidate, SignalEngine};
use crate::types::{ExitDecision, ExitReason};

/// External collaborators injected at construction.
pub struct EngineDeps {
    pub broker: Arc<dyn BrokerGateway>,
    pub scorer: Arc<dyn ConfidenceScorer>,
    pub exit_params: Arc<dyn ExitParamsProvider>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
    pub license: Option<LicenseClient>,
}

pub struct Engine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    bus: EventBus,

    feed: TickFeed,
    bars: BarBuilder,
    indicators: IndicatorPipeline,
    quotes: BidAskManager,
    shared_quote: SharedQuote,

    signal_engine: SignalEngine,
    scorer: Arc<dyn ConfidenceScorer>,
    exit_params_provider: Arc<dyn ExitParamsProvider>,
    evaluator: ExitEvaluator,

    gate: SessionGate,
    router: OrderRouter,
    positions: PositionManager,

    store: StateStore,
    recorder: ExperienceRecorder,
    audit: AuditLog,
    notifier: Arc<dyn Notifier>,
    license: Option<LicenseClient>,

    /// The bundle in force for the current bar (provider output or defaults).
    current_params: ExitParams,
    provider_fallback: bool,
    /// Set after FLATTEN_FAILED; retried on the 30s flush timer.
    flatten_pending: Option<ExitDecision>,
    running: bool,
}

impl Engine {
    pub fn new(config: EngineConfig, deps: EngineDeps) -> Result<Self> {
        let store = StateStore::new(&config.data_dir)?;
        let audit = AuditLog::new(store.data_dir());
        let recorder = ExperienceRecorder::new(
            store.data_dir(),
            config.tick_size,
            config.tick_value,
            config.commission_per_contract,
        );

        let shared_quote = new_shared_quote();
        let router = OrderRouter::new(
            deps.broker.clone(),
            config.instrument.clone(),
            config.tick_size,
            config.passive_order_timeout_s,
            config.queue_price_move_cancel_ticks,
            shared_quote.clone(),
        );

        let gate = SessionGate::new(&config, deps.clock.now_et());

        Ok(Self {
            feed: TickFeed::new(config.instrument.clone()),
            bars: BarBuilder::new(),
            indicators: IndicatorPipeline::new(config.tick_size, RegimeThresholds::default()),
            quotes: BidAskManager::new(&config),
            shared_quote,
            signal_engine: SignalEngine::new(config.tick_size),
            scorer: deps.scorer,
            exit_params_provider: deps.exit_params,
            evaluator: ExitEvaluator::new(config.tick_size),
            gate,
            router,
            positions: PositionManager::new(config.instrument.clone()),
            store,
            recorder,
            audit,
            notifier: deps.notifier,
            license: deps.license,
            clock: deps.clock,
            bus: EventBus::new(),
            current_params: ExitParams::defaults(),
            provider_fallback: false,
            flatten_pending: None,
            running: false,
            config,
        })
    }

    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    /// Live quote handle for the feed I/O task (the queue monitor watches it
    /// while the core blocks in a passive wait).
    pub fn shared_quote(&self) -> SharedQuote {
        self.shared_quote.clone()
    }

    pub fn gate(&self) -> &SessionGate {
        &self.gate
    }

    pub fn positions(&self) -> &PositionManager {
        &self.positions
    }

    pub fn recorder(&self) -> &ExperienceRecorder {
        &self.recorder
    }

    // -------------------------------------------------------------------------
    // Startup
    // -------------------------------------------------------------------------

    /// Restore session and position state, verifying the position against
    /// the broker (the broker is authoritative on any disagreement).
    pub async fn startup(&mut self) -> Result<()> {
        let now = self.clock.now_utc();

        // Session ledger: adopt only if it belongs to the current session.
        if let Some(session) = self.store.load_session()? {
            self.gate.restore_session(session);
            // A stale date rolls immediately.
            if let Some(closed) = self.gate.maybe_roll_session(self.clock.now_et()) {
                info!(closed_date = %closed.trading_date, "stale session ledger rolled at startup");
            }
        }

        let snapshot = self.store.load_position(&self.config.instrument)?;
        let broker_positions = self
            .positions_from_broker()
            .await
            .context("broker position query failed at startup")?;

        let current_atr = self.indicators.last().map(|s| s.atr).unwrap_or(0.0);
        match StateStore::verify_against_broker(
            &self.config.instrument,
            snapshot,
            &broker_positions,
            current_atr,
            now,
        ) {
            ReconcileOutcome::NoPosition => {}
            ReconcileOutcome::Restored(position) => {
                self.positions.restore(position);
            }
            ReconcileOutcome::SnapshotDiscarded { reason } => {
                self.audit.record(now, "SNAPSHOT_DISCARDED", &reason);
                self.store.clear_position(&self.config.instrument)?;
            }
            ReconcileOutcome::Reconstructed(position) => {
                self.audit.record_with(
                    now,
                    "POSITION_RECONSTRUCTED",
                    "broker-authoritative reconstruction",
                    Some(json!({
                        "side": position.side.to_string(),
                        "size": position.remaining_contracts,
                        "avg_price": position.entry_price_avg,
                    })),
                );
                self.store.save_position(&position)?;
                self.positions.restore(position);
            }
        }

        Ok(())
    }

    async fn positions_from_broker(&self) -> Result<Vec<crate::broker::BrokerPosition>> {
        self.router
            .broker()
            .get_positions(&self.config.instrument)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))
    }

    // -------------------------------------------------------------------------
    // Main loop
    // -------------------------------------------------------------------------

    /// Run until a Halt event drains the engine to quiescence.
    pub async fn run(&mut self) -> Result<()> {
        self.running = true;
        self.spawn_timers();
        info!(instrument = %self.config.instrument, "engine event loop running");

        let bus = self.bus.clone();
        while self.running {
            let clock = self.clock.clone();
            let event = bus.pop(move || clock.monotonic()).await;
            self.dispatch(event).await;
        }

        info!("engine event loop stopped");
        Ok(())
    }

    /// Dispatch one event. Public for the replay driver.
    pub async fn dispatch(&mut self, event: Event) {
        match event {
            Event::Emergency { reason } => self.handle_emergency(&reason).await,
            Event::Halt { reason } => self.handle_halt(&reason).await,
            Event::OrderUpdate { order_id, status } => {
                debug!(order_id = %order_id, state = ?status.state, "order update observed");
            }
            Event::Tick(tick) => self.handle_tick(tick).await,
            Event::BarFinalized(bar) => self.handle_bar(&bar).await,
            Event::Timer(kind) => self.handle_timer(kind).await,
            Event::Cloud(cloud) => self.handle_cloud(cloud).await,
        }
    }

    fn spawn_timers(&self) {
        let specs: [(TimerKind, Duration); 4] = [
            (TimerKind::Heartbeat, Duration::from_secs(20)),
            (TimerKind::PositionFlush, Duration::from_secs(30)),
            (TimerKind::SessionFlush, Duration::from_secs(60)),
            (TimerKind::LicenseCheck, Duration::from_secs(300)),
        ];
        for (kind, period) in specs {
            let bus = self.bus.clone();
            let clock = self.clock.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await; // immediate first tick consumed
                loop {
                    interval.tick().await;
                    bus.push(Event::Timer(kind), clock.monotonic());
                }
            });
        }

        // Minute boundary, wall-aligned.
        let bus = self.bus.clone();
        let clock = self.clock.clone();
        tokio::spawn(async move {
            loop {
                let now = clock.now_utc();
                let ms_into_minute =
                    (now.timestamp_millis().rem_euclid(60_000)) as u64;
                tokio::time::sleep(Duration::from_millis(60_050 - ms_into_minute)).await;
                bus.push(Event::Timer(TimerKind::MinuteBoundary), clock.monotonic());
            }
        });
    }

    // -------------------------------------------------------------------------
    // Tick path
    // -------------------------------------------------------------------------

    pub async fn handle_tick(&mut self, tick: Tick) {
        if self.feed.ingest(tick).is_err() {
            return;
        }

        let et = tick.ts.with_timezone(&chrono_tz::America::New_York);
        self.quotes.update(&tick, et.hour());
        *self.shared_quote.write() = Some(tick);
        self.positions.observe_price(tick.last);

        // Bar construction; a rollover feeds the full bar pipeline.
        let finalized = self.bars.ingest(&tick);
        for bar in finalized {
            self.handle_bar(&bar).await;
        }

        // Stop-trigger ticks act between bars.
        if let Some(decision) = self.evaluator.check_stop_tick(&self.positions, tick.last) {
            info!(reason = %decision.reason, price = tick.last, "stop trigger tick");
            self.execute_exit(decision).await;
        }
    }

    // -------------------------------------------------------------------------
    // Bar path
    // -------------------------------------------------------------------------

    pub async fn handle_bar(&mut self, bar: &Bar) {
        // Session roll first so the new bar lands in the right ledger.
        if let Some(closed) = self.gate.maybe_roll_session(self.clock.now_et()) {
            self.on_session_rolled(&closed);
        }

        let snapshot = match self.indicators.on_bar(bar) {
            Some(s) => s,
            None => return, // warming up
        };

        // Refresh the exit-params bundle for this bar.
        self.refresh_exit_params(&snapshot);

        // Advance ghost simulations under the same rules.
        let now = self.clock.now_utc();
        self.recorder.on_bar(bar, &snapshot, now);

        // Staleness feeds the gate at bar cadence.
        let staleness = self.feed.staleness(now);
        self.gate.set_staleness(staleness);

        if self.positions.has_position() {
            let forced = self.gate.forced_flatten(self.clock.now_et());
            if let Some(reason) = forced {
                self.audit.record(
                    now,
                    "FORCED_FLATTEN",
                    format!("session layer demanded {reason}"),
                );
            }
            let decision = self.evaluator.evaluate_bar(
                &mut self.positions,
                bar,
                &snapshot,
                &self.current_params,
                forced,
                now,
            );
            // Persist counter/stop mutations even without an exit.
            if let Some(p) = self.positions.active() {
                let _ = self.store.save_position(p);
            }
            if let Some(decision) = decision {
                self.execute_exit(decision).await;
            }
        } else {
            self.maybe_enter(bar, &snapshot).await;
        }
    }

    fn refresh_exit_params(&mut self, snapshot: &IndicatorSnapshot) {
        let features = self.exit_features(snapshot);
        match self.exit_params_provider.predict(&features) {
            Ok(params) => {
                self.current_params = params;
                self.provider_fallback = false;
            }
            Err(e) => {
                if !self.provider_fallback {
                    warn!(error = %e, "EXIT_PROVIDER_FALLBACK: using documented defaults");
                    self.audit.record(
                        self.clock.now_utc(),
                        "EXIT_PROVIDER_FALLBACK",
                        e.to_string(),
                    );
                }
                self.current_params = ExitParams::defaults();
                self.provider_fallback = true;
            }
        }
    }

    fn exit_features(&self, snapshot: &IndicatorSnapshot) -> ExitFeatureVector {
        let mut f = ExitFeatureVector {
            atr: snapshot.atr,
            synthetic_vix: snapshot.synthetic_vix,
            volume_ratio: snapshot.volume_ratio,
            vwap_distance_sigma: snapshot.vwap_distance_sigma,
            market_regime: snapshot.market_regime.to_string(),
            ..Default::default()
        };
        if let Some(p) = self.positions.active() {
            let price = self
                .quotes
                .current()
                .map(|t| t.last)
                .unwrap_or(p.entry_price_avg);
            f.side = p.side.to_string();
            f.unrealized_r = p.unrealized_r(price);
            f.bars_held = p.bars_held as f64;
            f.entry_atr = p.entry_atr;
            f.peak_unrealized_r = p.peak_r();
            f.remaining_fraction = if p.contracts > 0 {
                p.remaining_contracts as f64 / p.contracts as f64
            } else {
                0.0
            };
        }
        f
    }

    // -------------------------------------------------------------------------
    // Entry path
    // -------------------------------------------------------------------------

    async fn maybe_enter(&mut self, bar: &Bar, snapshot: &IndicatorSnapshot) {
        let bands = match self.indicators.bands() {
            Some(b) => b,
            None => return,
        };
        let prev_bar = self.indicators.prev_bar().copied();
        let features = self.build_features(bar, snapshot);

        let mut candidate = match self.signal_engine.evaluate(
            bar,
            snapshot,
            &bands,
            prev_bar.as_ref(),
            features,
        ) {
            Some(c) => c,
            None => return,
        };

        // Score through the pluggable seam.
        let score = match self.scorer.score(&candidate.feature_vector) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "scorer unavailable — candidate rejected");
                self.ghost(&candidate, "SCORER_UNAVAILABLE");
                return;
            }
        };
        candidate.confidence = score.confidence;

        if candidate.risk_reward() < self.config.min_risk_reward {
            self.ghost(&candidate, "MIN_RISK_REWARD");
            return;
        }

        let now_et = self.clock.now_et();
        if let Err(block) = self.gate.can_enter(now_et, candidate.confidence, false) {
            debug!(block = %block, "entry blocked by session gate");
            self.ghost(&candidate, &block.to_string());
            return;
        }

        if let Err(reject) = self.quotes.entry_gate(candidate.side, now_et.hour()) {
            debug!(reject = %reject, "entry blocked by book conditions");
            self.ghost(&candidate, &reject.to_string());
            return;
        }

        let size = PositionManager::size_for(
            candidate.confidence,
            score.is_exploration,
            self.gate.max_contracts_now(),
        );
        if size == 0 {
            self.ghost(&candidate, "SIZE_EXHAUSTED");
            return;
        }

        let ctx = EntryContext {
            imbalance_aligned: self.quotes.imbalance_signal().aligns_with(candidate.side),
            spread_at_or_below_mean: match (
                self.quotes.spread_ticks(),
                self.quotes.hourly_mean_spread(now_et.hour()),
            ) {
                (Some(s), Some(m)) => s <= m,
                _ => false,
            },
            expected_slippage_ticks: self
                .quotes
                .expected_slippage_ticks(now_et.time(), now_et.hour()),
        };

        info!(
            side = %candidate.side,
            size,
            confidence = format!("{:.2}", candidate.confidence),
            exploration = score.is_exploration,
            reason = %candidate.reason,
            "entry candidate accepted — routing"
        );

        let outcome = self
            .router
            .enter(candidate.side, size, candidate.entry_ref_price, ctx)
            .await;

        match outcome {
            EntryOutcome::Filled {
                avg_price,
                size: filled,
                slippage_ticks,
                passive,
                ..
            } => {
                self.on_entry_filled(&candidate, filled, avg_price, slippage_ticks, passive)
                    .await;
            }
            EntryOutcome::Aborted { reason } => {
                warn!(reason = %reason, "entry aborted");
                self.audit
                    .record(self.clock.now_utc(), "ENTRY_ABORTED", &reason);
                self.ghost(&candidate, &format!("ENTRY_ABORTED:{reason}"));
            }
        }
    }

    async fn on_entry_filled(
        &mut self,
        candidate: &SignalCandidate,
        filled: u32,
        avg_price: f64,
        slippage_ticks: f64,
        passive: bool,
    ) {
        let now = self.clock.now_utc();

        if slippage_ticks >= self.config.entry_slippage_alert_ticks {
            self.notifier.notify(
                Severity::Warning,
                "ENTRY_SLIPPAGE",
                &format!(
                    "entry slipped {slippage_ticks:.1} ticks vs reference {:.2}",
                    candidate.entry_ref_price
                ),
            );
            self.gate.record_slippage_alert();
        }

        // Stops travel with the actual fill, preserving the planned
        // distances from the reference price.
        let stop_offset = candidate.entry_ref_price - candidate.initial_stop;
        let target_offset = candidate.initial_target - candidate.entry_ref_price;
        let initial_stop = avg_price - stop_offset;
        let initial_target = avg_price + target_offset;

        let opened = self.positions.open(
            &candidate.id,
            candidate.side,
            filled,
            avg_price,
            initial_stop,
            initial_target,
            candidate.feature_vector.atr,
            candidate.confidence,
            slippage_ticks,
            now,
        );

        match opened {
            Ok(position) => {
                let position_id = position.id.clone();
                let snapshot = position.clone();
                debug!(passive, "entry filled");
                self.gate.record_entry(now);
                self.recorder.record_taken(candidate, &position_id, now);
                if let Err(e) = self.store.save_position(&snapshot) {
                    warn!(error = %e, "position snapshot write failed");
                }
            }
            Err(e) => {
                // Should be unreachable: the gate refuses entries while a
                // position exists. Surface loudly.
                error!(error = %e, "entry fill could not open a position");
                self.audit.record(now, "ORPHAN_FILL", e);
            }
        }
    }

    fn ghost(&mut self, candidate: &SignalCandidate, reject_reason: &str) {
        let now = self.clock.now_utc();
        self.audit.record_with(
            now,
            "SIGNAL_REJECTED",
            reject_reason,
            Some(json!({
                "signal_id": candidate.id,
                "side": candidate.side.to_string(),
                "confidence": candidate.confidence,
                "reason": candidate.reason,
            })),
        );

        let mut ghost = candidate.clone();
        ghost.ghost_flag = true;
        self.recorder
            .record_ghost(&ghost, reject_reason, &self.current_params, now);
    }

    fn build_features(&self, bar: &Bar, snapshot: &IndicatorSnapshot) -> FeatureVector {
        let now_et = self.clock.now_et();
        let tick_size = self.config.tick_size;
        let session = &self.gate.session;
        let prev = self.indicators.prev_bar();

        let ret_pct = |from: f64, to: f64| {
            if from > 0.0 {
                (to - from) / from * 100.0
            } else {
                0.0
            }
        };

        let upper_wick = bar.high - bar.open.max(bar.close);
        let lower_wick = bar.open.min(bar.close) - bar.low;

        let minutes_to_maintenance = {
            let maintenance = self.config.maintenance_start();
            let now_t = now_et.time();
            if now_t < maintenance {
                (maintenance - now_t).num_minutes() as f64
            } else {
                0.0
            }
        };

        FeatureVector {
            rsi: snapshot.rsi,
            atr: snapshot.atr,
            atr_pct: if bar.close > 0.0 {
                snapshot.atr / bar.close * 100.0
            } else {
                0.0
            },
            vwap: snapshot.vwap,
            vwap_stddev: snapshot.vwap_stddev,
            vwap_distance_sigma: snapshot.vwap_distance_sigma,
            volume_ratio: snapshot.volume_ratio,
            synthetic_vix: snapshot.synthetic_vix,
            trend_strength: snapshot.trend_strength,
            sr_proximity_ticks: snapshot.sr_proximity_ticks,
            market_regime: snapshot.market_regime.to_string(),

            bar_body_ticks: bar.body() / tick_size,
            bar_range_ticks: bar.range() / tick_size,
            upper_wick_ticks: upper_wick / tick_size,
            lower_wick_ticks: lower_wick / tick_size,
            bar_return_pct: ret_pct(bar.open, bar.close),
            prev_bar_return_pct: prev.map(|p| ret_pct(p.open, p.close)).unwrap_or(0.0),
            three_bar_momentum_pct: prev.map(|p| ret_pct(p.open, bar.close)).unwrap_or(0.0),
            gap_from_prev_close_ticks: prev
                .map(|p| (bar.open - p.close) / tick_size)
                .unwrap_or(0.0),

            spread_ticks: self.quotes.spread_ticks().unwrap_or(0.0),
            avg_spread_ticks: self.quotes.avg_spread_ticks().unwrap_or(0.0),
            imbalance_ratio: self.quotes.imbalance().unwrap_or(1.0),
            imbalance_signal: self.quotes.imbalance_signal().to_string(),
            bid_size: self
                .quotes
                .current()
                .map(|t| t.bid_size as f64)
                .unwrap_or(0.0),
            ask_size: self
                .quotes
                .current()
                .map(|t| t.ask_size as f64)
                .unwrap_or(0.0),
            expected_slippage_ticks: self
                .quotes
                .expected_slippage_ticks(now_et.time(), now_et.hour()),

            minutes_since_session_open: {
                let delta = now_et
                    .time()
                    .signed_duration_since(self.config.session_start())
                    .num_minutes();
                (if delta >= 0 { delta } else { delta + 24 * 60 }) as f64
            },
            minutes_to_maintenance,
            et_hour: now_et.hour() as f64,
            day_of_week: now_et.weekday().number_from_monday() as f64,

            daily_pnl: session.daily_pnl,
            daily_trades: session.daily_trades as f64,
            consecutive_wins: session.consecutive_wins as f64,
            consecutive_losses: session.consecutive_losses as f64,

            // Candidate geometry is filled by the signal engine.
            ..Default::default()
        }
    }

    // -------------------------------------------------------------------------
    // Exit path
    // -------------------------------------------------------------------------

    async fn execute_exit(&mut self, decision: ExitDecision) {
        let mut pending = decision;

        // A partial fill of the exit order loops on the remainder so the
        // whole unwind stays inside the current bar window.
        loop {
            let Some(position) = self.positions.active() else {
                return;
            };
            let side = position.side;
            let now = self.clock.now_utc();

            info!(
                reason = %pending.reason,
                size = pending.size,
                target = pending.target_price,
                "executing exit"
            );

            let outcome = self
                .router
                .exit(side, pending.size, pending.reason, pending.target_price)
                .await;

            match outcome {
                ExitOutcome::Closed { avg_price, size } => {
                    self.apply_exit_fill(pending.reason, size, avg_price).await;
                    return;
                }
                ExitOutcome::PartiallyClosed {
                    avg_price,
                    size,
                    remaining,
                } => {
                    self.apply_exit_fill(pending.reason, size, avg_price).await;
                    warn!(remaining, "exit partially filled — re-attempting remainder");
                    pending.size = remaining;
                }
                ExitOutcome::FlattenFailed => {
                    self.notifier.notify(
                        Severity::Critical,
                        "FLATTEN_FAILED",
                        &format!(
                            "emergency flatten failed after retries; will retry every 30s \
                             (reason {})",
                            pending.reason
                        ),
                    );
                    self.audit.record(now, "FLATTEN_FAILED", "retries exhausted");
                    if let Some(p) = self.positions.active() {
                        let _ = self.store.save_position(p);
                    }
                    self.flatten_pending = Some(pending);
                    return;
                }
            }
        }
    }

    async fn apply_exit_fill(&mut self, reason: ExitReason, size: u32, price: f64) {
        let now = self.clock.now_utc();
        let closed = self.positions.apply_exit_fill(
            reason,
            size,
            price,
            self.config.commission_per_contract,
            self.config.tick_size,
            self.config.tick_value,
            now,
        );

        match closed {
            Some(position) => {
                self.gate.on_trade_closed(position.realized_pnl, now);
                self.recorder.record_close(
                    &position,
                    &self.current_params,
                    self.provider_fallback,
                    now,
                );
                if let Err(e) = self.store.clear_position(&position.symbol) {
                    warn!(error = %e, "failed to retire position snapshot");
                }
                if let Err(e) = self.store.save_session(&self.gate.session) {
                    warn!(error = %e, "session snapshot write failed");
                }
                self.flatten_pending = None;

                // License grace completes on the natural exit.
                if matches!(
                    self.gate.license(),
                    LicenseState::Expired | LicenseState::Conflict
                ) {
                    self.notifier.notify(
                        Severity::Critical,
                        "LICENSE_TRADING_DISABLED",
                        "grace position closed — trading disabled until license is restored",
                    );
                    self.gate.halt("license invalid after grace exit");
                }
            }
            None => {
                if let Some(p) = self.positions.active() {
                    let _ = self.store.save_position(p);
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Timers, cloud, halt
    // -------------------------------------------------------------------------

    async fn handle_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Heartbeat => {
                if self.router.breaker_state() == BreakerState::Open {
                    self.router.health_probe().await;
                }
                if let Some(license) = &self.license {
                    if let Err(e) = license.heartbeat().await {
                        debug!(error = %e, "license heartbeat failed");
                        self.bus.push(
                            Event::Cloud(CloudEvent::HeartbeatFailed),
                            self.clock.monotonic(),
                        );
                    }
                }
            }
            TimerKind::PositionFlush => {
                if let Some(p) = self.positions.active() {
                    if let Err(e) = self.store.save_position(p) {
                        warn!(error = %e, "position flush failed");
                    }
                }
                // FLATTEN_FAILED retry cadence.
                if let Some(decision) = self.flatten_pending.take() {
                    warn!("retrying failed flatten");
                    self.execute_exit(decision).await;
                }
            }
            TimerKind::SessionFlush => {
                if let Err(e) = self.store.save_session(&self.gate.session) {
                    warn!(error = %e, "session flush failed");
                }
                info!(status = %self.status_snapshot(), "engine status");
            }
            TimerKind::LicenseCheck => {
                if let Some(license) = &self.license {
                    match license.validate().await {
                        Ok(response) => {
                            let state = response.to_state();
                            self.bus.push(
                                Event::Cloud(CloudEvent::LicenseResult(state)),
                                self.clock.monotonic(),
                            );
                        }
                        Err(e) => {
                            warn!(error = %e, "license validation unreachable");
                        }
                    }
                }
            }
            TimerKind::MinuteBoundary => {
                let now = self.clock.now_utc();

                // Finalize any bucket the tick stream left open.
                let finalized = self.bars.flush_until(now);
                for bar in finalized {
                    self.handle_bar(&bar).await;
                }

                // Staleness escalation even when no bars are flowing.
                let staleness = self.feed.staleness(now);
                self.gate.set_staleness(staleness);
                if staleness == StalenessLevel::FlattenRequired && self.positions.has_position() {
                    self.bus.push(
                        Event::Emergency {
                            reason: "market data stale beyond 60s".to_string(),
                        },
                        self.clock.monotonic(),
                    );
                }

                // Session roll and forced windows apply on the minute even if
                // the tape is silent.
                if let Some(closed) = self.gate.maybe_roll_session(self.clock.now_et()) {
                    self.on_session_rolled(&closed);
                }
                if self.positions.has_position() {
                    if let Some(reason) = self.gate.forced_flatten(self.clock.now_et()) {
                        let size = self
                            .positions
                            .active()
                            .map(|p| p.remaining_contracts)
                            .unwrap_or(0);
                        let price = self.quotes.current().map(|t| t.last).unwrap_or(0.0);
                        self.execute_exit(ExitDecision {
                            reason,
                            size,
                            target_price: price,
                            order_strategy: crate::types::OrderStrategy::Aggressive,
                        })
                        .await;
                    }
                }
            }
        }
    }

    async fn handle_cloud(&mut self, event: CloudEvent) {
        match event {
            CloudEvent::LicenseResult(state) => {
                let previous = *self.gate.license();
                self.gate.set_license(state);
                if state != previous {
                    self.audit.record(
                        self.clock.now_utc(),
                        "LICENSE_STATE",
                        format!("{previous} -> {state}"),
                    );
                }
                match state {
                    LicenseState::Conflict if self.positions.has_position() => {
                        self.notifier.notify(
                            Severity::Critical,
                            "LICENSE_CONFLICT",
                            "session conflict while holding a position — managing to natural exit",
                        );
                    }
                    LicenseState::Expired if !self.positions.has_position() => {
                        self.notifier.notify(
                            Severity::Warning,
                            "LICENSE_EXPIRED",
                            "license expired with no position — trading disabled",
                        );
                        self.gate.halt("license expired");
                    }
                    _ => {}
                }
            }
            CloudEvent::HeartbeatFailed => {
                debug!("license heartbeat failure observed");
            }
        }
    }

    async fn handle_emergency(&mut self, reason: &str) {
        warn!(reason, "EMERGENCY event");
        self.audit
            .record(self.clock.now_utc(), "EMERGENCY", reason);
        if let Some(p) = self.positions.active() {
            let size = p.remaining_contracts;
            let price = self.quotes.current().map(|t| t.last).unwrap_or(0.0);
            self.execute_exit(ExitDecision {
                reason: ExitReason::Emergency,
                size,
                target_price: price,
                order_strategy: crate::types::OrderStrategy::Aggressive,
            })
            .await;
        }
    }

    async fn handle_halt(&mut self, reason: &str) {
        warn!(reason, "session halt — draining to quiescence");
        self.gate.halt(reason);
        self.audit.record(self.clock.now_utc(), "SESSION_HALT", reason);

        // Persist final state before stopping.
        if let Some(p) = self.positions.active() {
            let _ = self.store.save_position(p);
        }
        let _ = self.store.save_session(&self.gate.session);

        if let Some(license) = &self.license {
            let _ = license.release().await;
        }
        self.running = false;
    }

    fn on_session_rolled(&mut self, closed: &SessionState) {
        let stats = self.journal_stats();
        info!(
            closed_date = %closed.trading_date,
            daily_pnl = format!("{:.2}", closed.daily_pnl),
            trades = closed.daily_trades,
            win_rate = format!("{:.2}", stats.1),
            "session closed"
        );

        // Intraday VWAP accumulators restart with the new session.
        self.bars.reset_session();
        self.indicators.reset_session();

        if let Err(e) = self.store.save_session(&self.gate.session) {
            warn!(error = %e, "post-roll session write failed");
        }
    }

    /// (total trades, win rate, profit factor) over the closed archive.
    fn journal_stats(&self) -> (usize, f64, f64) {
        let closed = self.positions.closed();
        if closed.is_empty() {
            return (0, 0.0, 0.0);
        }
        let total = closed.len();
        let wins = closed.iter().filter(|p| p.realized_pnl > 0.0).count();
        let gross_profit: f64 = closed
            .iter()
            .map(|p| p.realized_pnl)
            .filter(|&x| x > 0.0)
            .sum();
        let gross_loss: f64 = closed
            .iter()
            .map(|p| p.realized_pnl)
            .filter(|&x| x < 0.0)
            .map(f64::abs)
            .sum();
        let pf = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };
        (total, wins as f64 / total as f64, pf)
    }

    /// Serializable status snapshot for operators (logged periodically; the
    /// dashboard is an external consumer of the log stream).
    pub fn status_snapshot(&self) -> serde_json::Value {
        let (trades, win_rate, profit_factor) = self.journal_stats();
        json!({
            "instrument": self.config.instrument,
            "session": self.gate.session,
            "license": self.gate.license().to_string(),
            "breaker": format!("{:?}", self.router.breaker_state()),
            "position": self.positions.active(),
            "indicators": self.indicators.last(),
            "ghosts_unresolved": self.recorder.ghost_count(),
            "journal": {
                "trades": trades,
                "win_rate": win_rate,
                "profit_factor": if profit_factor.is_finite() { profit_factor } else { -1.0 },
            },
        })
    }
}
