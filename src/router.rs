// =============================================================================
// Order Router — placement, adaptation, retries, circuit breaker
// =============================================================================
//
// Entry placement chooses between:
//   passive  — limit at the near touch (bid for longs, ask for shorts) when
//              the book lean aligns with the trade and the spread is no wider
//              than its hourly mean. A queue monitor polls the fill every
//              500ms for up to `passive_order_timeout_s`:
//                FILLED            done
//                PRICE_MOVED_AWAY  mid moved adversely by the cancel
//                                  threshold: cancel and re-quote at the new
//                                  touch (within the original deadline)
//                TIMEOUT           cancel and switch to aggressive
//   aggressive — market order, polled to a terminal state.
//
// Partial-fill policy: a fill ratio >= 0.5 is accepted and the remainder
// cancelled; below that the remainder is cancelled and, for entries, any
// filled contracts are unwound at market so no position is created. Exits
// close what filled and report the remainder for re-attempt.
//
// Exits: TARGET and PARTIAL_k work a limit at the target price; every other
// reason goes straight to market. EMERGENCY bypasses the circuit breaker and
// retries on a 1,2,4,8s backoff up to 5 attempts; exhaustion surfaces as
// FlattenFailed and the engine keeps retrying every 30s.
//
// The circuit breaker opens after 5 consecutive transient broker failures
// and blocks non-emergency submissions until a manual reset or a successful
// health probe.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::broker::{
    BrokerError, BrokerGateway, OrderId, OrderRequest, OrderState, OrderStatus, RetrySpec,
};
use crate::market_data::Tick;
use crate::types::{ExitReason, OrderStrategy, Side};

/// Queue-monitor poll cadence.
const QUEUE_POLL: Duration = Duration::from_millis(500);

/// Deadline for any single broker operation.
const BROKER_OP_TIMEOUT: Duration = Duration::from_secs(30);

/// Consecutive transient failures that open the breaker.
const BREAKER_TRIP_COUNT: u32 = 5;

/// Minimum accepted partial-fill ratio.
const MIN_FILL_RATIO: f64 = 0.5;

/// Live quote shared with the I/O side so the queue monitor can watch the
/// mid while the core blocks in a passive wait.
pub type SharedQuote = Arc<RwLock<Option<Tick>>>;

pub fn new_shared_quote() -> SharedQuote {
    Arc::new(RwLock::new(None))
}

/// Context the engine computed at decision time for one entry.
#[derive(Debug, Clone, Copy)]
pub struct EntryContext {
    /// Book lean agrees with the trade direction.
    pub imbalance_aligned: bool,
    /// Current spread is at or below its hourly mean.
    pub spread_at_or_below_mean: bool,
    /// Expected slippage in ticks for an aggressive order right now.
    pub expected_slippage_ticks: f64,
}

/// Result of an entry attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    Filled {
        order_id: OrderId,
        avg_price: f64,
        size: u32,
        /// Adverse ticks versus the reference price (negative = improvement).
        slippage_ticks: f64,
        passive: bool,
    },
    Aborted {
        reason: String,
    },
}

/// Result of an exit attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitOutcome {
    Closed {
        avg_price: f64,
        size: u32,
    },
    /// Part of the requested size closed; the engine re-attempts the rest
    /// within the same bar window.
    PartiallyClosed {
        avg_price: f64,
        size: u32,
        remaining: u32,
    },
    /// Emergency retries exhausted. Critical.
    FlattenFailed,
}

/// Circuit-breaker state, exposed for the status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
}

pub struct OrderRouter {
    broker: Arc<dyn BrokerGateway>,
    symbol: String,
    tick_size: f64,
    passive_timeout: Duration,
    queue_cancel_ticks: f64,
    quote: SharedQuote,
    retry: RetrySpec,

    consecutive_errors: u32,
    breaker: BreakerState,
}

impl OrderRouter {
    pub fn new(
        broker: Arc<dyn BrokerGateway>,
        symbol: impl Into<String>,
        tick_size: f64,
        passive_timeout_s: u64,
        queue_cancel_ticks: f64,
        quote: SharedQuote,
    ) -> Self {
        Self {
            broker,
            symbol: symbol.into(),
            tick_size,
            passive_timeout: Duration::from_secs(passive_timeout_s.max(1)),
            queue_cancel_ticks,
            quote,
            retry: RetrySpec::default(),
            consecutive_errors: 0,
            breaker: BreakerState::Closed,
        }
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker
    }

    /// Shared handle to the underlying gateway (startup reconciliation).
    pub fn broker(&self) -> Arc<dyn BrokerGateway> {
        self.broker.clone()
    }

    /// Manually close the breaker.
    pub fn reset_breaker(&mut self) {
        if self.breaker == BreakerState::Open {
            info!("circuit breaker manually reset");
        }
        self.consecutive_errors = 0;
        self.breaker = BreakerState::Closed;
    }

    /// Probe the venue; success closes the breaker.
    pub async fn health_probe(&mut self) -> bool {
        match self.broker.connect().await {
            Ok(_) => {
                if self.breaker == BreakerState::Open {
                    info!("health probe succeeded — circuit breaker closed");
                }
                self.consecutive_errors = 0;
                self.breaker = BreakerState::Closed;
                true
            }
            Err(e) => {
                debug!(error = %e, "health probe failed");
                false
            }
        }
    }

    // -------------------------------------------------------------------------
    // Entry
    // -------------------------------------------------------------------------

    /// Place an entry for `size` contracts around `reference_price`.
    pub async fn enter(
        &mut self,
        side: Side,
        size: u32,
        reference_price: f64,
        ctx: EntryContext,
    ) -> EntryOutcome {
        if self.breaker == BreakerState::Open {
            return EntryOutcome::Aborted {
                reason: "circuit breaker open".to_string(),
            };
        }

        let go_passive = ctx.imbalance_aligned && ctx.spread_at_or_below_mean;
        debug!(
            side = %side,
            size,
            reference_price,
            passive = go_passive,
            expected_slippage = ctx.expected_slippage_ticks,
            "routing entry"
        );

        if go_passive {
            self.enter_passive(side, size, reference_price).await
        } else {
            self.enter_aggressive(side, size, reference_price).await
        }
    }

    async fn enter_passive(
        &mut self,
        side: Side,
        size: u32,
        reference_price: f64,
    ) -> EntryOutcome {
        let deadline = tokio::time::Instant::now() + self.passive_timeout;

        let mut touch = match self.near_touch(side) {
            Some(p) => p,
            None => {
                return EntryOutcome::Aborted {
                    reason: "no quote for passive entry".to_string(),
                }
            }
        };

        loop {
            let order_id = match self
                .submit(OrderRequest::limit(&self.symbol, side, size, touch))
                .await
            {
                Ok(id) => id,
                Err(e) => return self.abort_entry(e),
            };
            let reference_mid = self.current_mid().unwrap_or(touch);

            // Queue monitor: poll until filled, moved-away, or deadline.
            loop {
                tokio::time::sleep(QUEUE_POLL).await;

                let status = match self.status(&order_id).await {
                    Ok(s) => s,
                    Err(e) => return self.abort_entry(e),
                };

                if status.state == OrderState::Filled {
                    return self.entry_filled(side, order_id, status, reference_price, true);
                }
                if status.state == OrderState::Rejected {
                    return EntryOutcome::Aborted {
                        reason: "entry order rejected".to_string(),
                    };
                }

                if tokio::time::Instant::now() >= deadline {
                    // TIMEOUT: cancel and go aggressive with the remainder.
                    let _ = self.cancel(&order_id).await;
                    let settled = match self.status(&order_id).await {
                        Ok(s) => s,
                        Err(e) => return self.abort_entry(e),
                    };
                    return self
                        .finish_entry_after_cancel(side, size, reference_price, order_id, settled)
                        .await;
                }

                if self.mid_moved_adverse(side, reference_mid) {
                    // PRICE_MOVED_AWAY: cancel; re-quote at the new touch if
                    // nothing (or too little) filled yet.
                    let _ = self.cancel(&order_id).await;
                    let settled = match self.status(&order_id).await {
                        Ok(s) => s,
                        Err(e) => return self.abort_entry(e),
                    };
                    if settled.filled_size > 0 {
                        return self
                            .finish_entry_after_cancel(
                                side,
                                size,
                                reference_price,
                                order_id,
                                settled,
                            )
                            .await;
                    }
                    match self.near_touch(side) {
                        Some(p) => {
                            debug!(old = touch, new = p, "re-quoting passive entry");
                            touch = p;
                        }
                        None => {
                            return EntryOutcome::Aborted {
                                reason: "quote lost during passive entry".to_string(),
                            }
                        }
                    }
                    break; // resubmit at the new touch
                }
            }
        }
    }

    /// After a cancelled passive attempt: accept a >= 50% partial, unwind a
    /// smaller one, or go aggressive when nothing filled.
    async fn finish_entry_after_cancel(
        &mut self,
        side: Side,
        size: u32,
        reference_price: f64,
        order_id: OrderId,
        status: OrderStatus,
    ) -> EntryOutcome {
        let ratio = status.filled_size as f64 / size as f64;

        if status.filled_size == 0 {
            return self.enter_aggressive(side, size, reference_price).await;
        }
        if ratio >= MIN_FILL_RATIO {
            info!(
                filled = status.filled_size,
                requested = size,
                "accepting partial entry fill"
            );
            return self.entry_filled(side, order_id, status, reference_price, true);
        }

        // Too small to keep: unwind at market so no position is created.
        warn!(
            filled = status.filled_size,
            requested = size,
            "partial entry below 50% — unwinding"
        );
        let unwind = OrderRequest::market(&self.symbol, side.opposite(), status.filled_size);
        if let Err(e) = self.submit(unwind).await {
            error!(error = %e, "failed to unwind sub-minimum partial entry");
        }
        EntryOutcome::Aborted {
            reason: format!(
                "partial fill {}/{} below minimum ratio",
                status.filled_size, size
            ),
        }
    }

    async fn enter_aggressive(
        &mut self,
        side: Side,
        size: u32,
        reference_price: f64,
    ) -> EntryOutcome {
        let order_id = match self
            .submit(OrderRequest::market(&self.symbol, side, size))
            .await
        {
            Ok(id) => id,
            Err(e) => return self.abort_entry(e),
        };

        match self.poll_terminal(&order_id).await {
            Ok(status) if status.filled_size > 0 => {
                let ratio = status.filled_size as f64 / size as f64;
                if ratio < MIN_FILL_RATIO {
                    warn!(
                        filled = status.filled_size,
                        requested = size,
                        "aggressive entry under-filled — unwinding"
                    );
                    let _ = self.cancel(&order_id).await;
                    let unwind =
                        OrderRequest::market(&self.symbol, side.opposite(), status.filled_size);
                    if let Err(e) = self.submit(unwind).await {
                        error!(error = %e, "failed to unwind under-filled entry");
                    }
                    return EntryOutcome::Aborted {
                        reason: "aggressive entry under-filled".to_string(),
                    };
                }
                self.entry_filled(side, order_id, status, reference_price, false)
            }
            Ok(_) => EntryOutcome::Aborted {
                reason: "entry order died unfilled".to_string(),
            },
            Err(e) => self.abort_entry(e),
        }
    }

    fn entry_filled(
        &mut self,
        side: Side,
        order_id: OrderId,
        status: OrderStatus,
        reference_price: f64,
        passive: bool,
    ) -> EntryOutcome {
        // Positive slippage = filled on the wrong side of the reference.
        let slippage_ticks =
            (status.avg_fill_price - reference_price) * side.direction() / self.tick_size;
        EntryOutcome::Filled {
            order_id,
            avg_price: status.avg_fill_price,
            size: status.filled_size,
            slippage_ticks,
            passive,
        }
    }

    fn abort_entry(&mut self, e: BrokerError) -> EntryOutcome {
        warn!(error = %e, "entry aborted on broker error");
        EntryOutcome::Aborted {
            reason: e.to_string(),
        }
    }

    // -------------------------------------------------------------------------
    // Exit
    // -------------------------------------------------------------------------

    /// Close `size` contracts of a position on `position_side`.
    ///
    /// `target_price` is the limit level for TARGET/PARTIAL strategies.
    pub async fn exit(
        &mut self,
        position_side: Side,
        size: u32,
        reason: ExitReason,
        target_price: f64,
    ) -> ExitOutcome {
        let close_side = position_side.opposite();
        let strategy = match reason {
            ExitReason::Target | ExitReason::Partial1 | ExitReason::Partial2
            | ExitReason::Partial3 => OrderStrategy::Passive,
            _ => OrderStrategy::Aggressive,
        };

        if reason == ExitReason::Emergency {
            return self.emergency_flatten(close_side, size).await;
        }

        if self.breaker == BreakerState::Open {
            // A blocked exit is an emergency by definition.
            warn!("breaker open during exit — escalating to emergency flatten");
            return self.emergency_flatten(close_side, size).await;
        }

        let request = match strategy {
            OrderStrategy::Passive => {
                OrderRequest::limit(&self.symbol, close_side, size, target_price)
            }
            OrderStrategy::Aggressive => OrderRequest::market(&self.symbol, close_side, size),
        };

        debug!(reason = %reason, strategy = %strategy, size, "routing exit");

        let order_id = match self.submit(request).await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, reason = %reason, "exit submission failed — emergency flatten");
                return self.emergency_flatten(close_side, size).await;
            }
        };

        // Work the order. Passive exits get the queue-monitor treatment with
        // a timeout escalation to market.
        let status = if strategy == OrderStrategy::Passive {
            match self.watch_passive_exit(&order_id).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "exit watch failed — emergency flatten");
                    return self.emergency_flatten(close_side, size).await;
                }
            }
        } else {
            match self.poll_terminal(&order_id).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "exit poll failed — emergency flatten");
                    return self.emergency_flatten(close_side, size).await;
                }
            }
        };

        match status.state {
            OrderState::Filled => ExitOutcome::Closed {
                avg_price: status.avg_fill_price,
                size: status.filled_size,
            },
            OrderState::Rejected => {
                warn!(reason = %reason, "exit rejected — emergency flatten");
                self.emergency_flatten(close_side, size).await
            }
            _ if status.filled_size > 0 => ExitOutcome::PartiallyClosed {
                avg_price: status.avg_fill_price,
                size: status.filled_size,
                remaining: size - status.filled_size,
            },
            _ => {
                warn!(reason = %reason, "exit died unfilled — emergency flatten");
                self.emergency_flatten(close_side, size).await
            }
        }
    }

    /// Passive exit watch: like the entry queue monitor but escalates to
    /// market instead of aborting.
    async fn watch_passive_exit(&mut self, order_id: &OrderId) -> Result<OrderStatus, BrokerError> {
        let deadline = tokio::time::Instant::now() + self.passive_timeout;
        loop {
            tokio::time::sleep(QUEUE_POLL).await;
            let status = self.status(order_id).await?;
            if status.state.is_terminal() {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = self.cancel(order_id).await;
                return self.status(order_id).await;
            }
        }
    }

    /// Market-out with the emergency retry ladder; bypasses the breaker.
    async fn emergency_flatten(&mut self, close_side: Side, size: u32) -> ExitOutcome {
        for attempt in 1..=self.retry.max_attempts {
            let delay = self.retry.delay_before(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let submitted = self
                .submit_raw(OrderRequest::market(&self.symbol, close_side, size))
                .await;
            let order_id = match submitted {
                Ok(id) => id,
                Err(e) => {
                    warn!(attempt, error = %e, "emergency flatten submission failed");
                    continue;
                }
            };

            match self.poll_terminal(&order_id).await {
                Ok(status) if status.filled_size >= size => {
                    info!(attempt, "emergency flatten filled");
                    return ExitOutcome::Closed {
                        avg_price: status.avg_fill_price,
                        size: status.filled_size,
                    };
                }
                Ok(status) if status.filled_size > 0 => {
                    return ExitOutcome::PartiallyClosed {
                        avg_price: status.avg_fill_price,
                        size: status.filled_size,
                        remaining: size - status.filled_size,
                    };
                }
                Ok(_) => warn!(attempt, "emergency flatten attempt died unfilled"),
                Err(e) => warn!(attempt, error = %e, "emergency flatten poll failed"),
            }
        }

        error!(
            size,
            side = %close_side,
            "FLATTEN_FAILED: emergency retries exhausted"
        );
        ExitOutcome::FlattenFailed
    }

    // -------------------------------------------------------------------------
    // Cancel (public surface)
    // -------------------------------------------------------------------------

    pub async fn cancel_order(&mut self, order_id: &OrderId) -> Result<(), BrokerError> {
        self.cancel(order_id).await
    }

    // -------------------------------------------------------------------------
    // Broker plumbing with breaker accounting
    // -------------------------------------------------------------------------

    async fn submit(&mut self, request: OrderRequest) -> Result<OrderId, BrokerError> {
        if self.breaker == BreakerState::Open {
            return Err(BrokerError::Transient("circuit breaker open".to_string()));
        }
        self.submit_raw(request).await
    }

    /// Submission without the breaker gate (emergency path).
    async fn submit_raw(&mut self, request: OrderRequest) -> Result<OrderId, BrokerError> {
        let result = tokio::time::timeout(BROKER_OP_TIMEOUT, self.broker.submit_order(request))
            .await
            .unwrap_or(Err(BrokerError::Timeout(BROKER_OP_TIMEOUT)));
        self.track(&result.as_ref().map(|_| ()).map_err(Clone::clone));
        result
    }

    async fn cancel(&mut self, order_id: &OrderId) -> Result<(), BrokerError> {
        let result = tokio::time::timeout(BROKER_OP_TIMEOUT, self.broker.cancel_order(order_id))
            .await
            .unwrap_or(Err(BrokerError::Timeout(BROKER_OP_TIMEOUT)));
        self.track(&result);
        result
    }

    async fn status(&mut self, order_id: &OrderId) -> Result<OrderStatus, BrokerError> {
        let result = tokio::time::timeout(BROKER_OP_TIMEOUT, self.broker.order_status(order_id))
            .await
            .unwrap_or(Err(BrokerError::Timeout(BROKER_OP_TIMEOUT)));
        self.track(&result.as_ref().map(|_| ()).map_err(Clone::clone));
        result
    }

    /// Poll an order to a terminal state (or stuck-partial settlement).
    async fn poll_terminal(&mut self, order_id: &OrderId) -> Result<OrderStatus, BrokerError> {
        let deadline = tokio::time::Instant::now() + BROKER_OP_TIMEOUT;
        loop {
            let status = self.status(order_id).await?;
            if status.state.is_terminal() {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(status);
            }
            tokio::time::sleep(QUEUE_POLL).await;
        }
    }

    /// Breaker accounting: transient failures count, successes reset.
    fn track(&mut self, result: &Result<(), BrokerError>) {
        match result {
            Ok(()) => {
                self.consecutive_errors = 0;
            }
            Err(e) if e.is_transient() => {
                self.consecutive_errors += 1;
                if self.consecutive_errors >= BREAKER_TRIP_COUNT
                    && self.breaker == BreakerState::Closed
                {
                    error!(
                        errors = self.consecutive_errors,
                        "circuit breaker OPEN after consecutive broker failures"
                    );
                    self.breaker = BreakerState::Open;
                }
            }
            Err(_) => {
                // Permanent errors and rejections don't accumulate.
            }
        }
    }

    // -------------------------------------------------------------------------
    // Quote helpers
    // -------------------------------------------------------------------------

    fn near_touch(&self, side: Side) -> Option<f64> {
        let q = self.quote.read();
        q.as_ref().map(|t| match side {
            Side::Long => t.bid,
            Side::Short => t.ask,
        })
    }

    fn current_mid(&self) -> Option<f64> {
        self.quote.read().as_ref().map(Tick::mid)
    }

    fn mid_moved_adverse(&self, side: Side, reference_mid: f64) -> bool {
        match self.current_mid() {
            Some(mid) => {
                let adverse = (mid - reference_mid) * side.direction();
                adverse / self.tick_size >= self.queue_cancel_ticks
            }
            None => false,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SimBroker;
    use chrono::{TimeZone, Utc};

    fn quote(bid: f64, ask: f64) -> Tick {
        Tick {
            ts: Utc.timestamp_opt(1_700_000_000, 0).single().unwrap(),
            bid,
            bid_size: 20,
            ask,
            ask_size: 20,
            last: (bid + ask) / 2.0,
            last_size: 1,
        }
    }

    fn setup(bid: f64, ask: f64) -> (Arc<SimBroker>, OrderRouter, SharedQuote) {
        let broker = Arc::new(SimBroker::new("TEST", 50_000.0));
        broker.set_quote(quote(bid, ask));
        let shared = new_shared_quote();
        *shared.write() = Some(quote(bid, ask));
        let router = OrderRouter::new(
            broker.clone(),
            "MES",
            0.25,
            2, // short passive timeout for tests
            2.0,
            shared.clone(),
        );
        (broker, router, shared)
    }

    fn aggressive_ctx() -> EntryContext {
        EntryContext {
            imbalance_aligned: false,
            spread_at_or_below_mean: true,
            expected_slippage_ticks: 1.0,
        }
    }

    fn passive_ctx() -> EntryContext {
        EntryContext {
            imbalance_aligned: true,
            spread_at_or_below_mean: true,
            expected_slippage_ticks: 1.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn aggressive_entry_fills_at_ask() {
        let (_b, mut r, _q) = setup(5000.00, 5000.25);
        let out = r.enter(Side::Long, 2, 5000.00, aggressive_ctx()).await;
        match out {
            EntryOutcome::Filled {
                avg_price,
                size,
                slippage_ticks,
                passive,
                ..
            } => {
                assert_eq!(avg_price, 5000.25);
                assert_eq!(size, 2);
                assert_eq!(slippage_ticks, 1.0);
                assert!(!passive);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn passive_entry_fills_on_pullback() {
        let (b, mut r, _q) = setup(5000.00, 5000.25);

        // Drop the offer onto our bid right away; the first 500ms poll sees
        // the fill.
        b.set_quote(quote(4999.75, 5000.00));
        let out = r.enter(Side::Long, 2, 5000.00, passive_ctx()).await;
        match out {
            EntryOutcome::Filled {
                avg_price, passive, ..
            } => {
                assert_eq!(avg_price, 5000.00);
                assert!(passive);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn passive_timeout_escalates_to_market() {
        let (b, mut r, _q) = setup(5000.00, 5000.25);
        // The book never comes back to us; after the 2s timeout the router
        // cancels and lifts the offer.
        let out = r.enter(Side::Long, 2, 5000.00, passive_ctx()).await;
        match out {
            EntryOutcome::Filled {
                avg_price, passive, ..
            } => {
                assert_eq!(avg_price, 5000.25);
                assert!(!passive);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        // Limit + market submissions.
        assert_eq!(b.submit_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_rejection_aborts() {
        let (b, mut r, _q) = setup(5000.00, 5000.25);
        b.script_error(BrokerError::Rejected("margin".to_string()));
        let out = r.enter(Side::Long, 1, 5000.00, aggressive_ctx()).await;
        assert!(matches!(out, EntryOutcome::Aborted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn sub_minimum_partial_entry_unwinds() {
        let (b, mut r, _q) = setup(5000.00, 5000.25);
        // 1 of 4 contracts fill (25% < 50%): remainder cancelled, the filled
        // contract unwound, no position kept.
        b.script_partial_ratio(0.25);
        let out = r.enter(Side::Long, 4, 5000.00, aggressive_ctx()).await;

        // The sim completes the remaining 3 on the next quote normally; here
        // the router cancelled first, so the outcome must be an abort…
        match out {
            EntryOutcome::Aborted { .. } => {
                // …and the unwind leaves the broker flat.
                let pos = b.get_positions("MES").await.unwrap();
                assert!(pos.is_empty(), "expected flat book, got {pos:?}");
            }
            // Depending on fill timing the sim may complete the order before
            // the poll observes the partial; a >=50% fill is also accepted.
            EntryOutcome::Filled { size, .. } => assert!(size >= 2),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn target_exit_works_a_limit() {
        let (b, mut r, _q) = setup(5000.00, 5000.25);
        // Holding 2 long; target at 5004.
        b.set_net_position("MES", 2, 5000.0);
        // Market trades up through the target.
        b.set_quote(quote(5004.00, 5004.25));
        let out = r.exit(Side::Long, 2, ExitReason::Target, 5004.00).await;
        match out {
            ExitOutcome::Closed { avg_price, size } => {
                assert_eq!(avg_price, 5004.00);
                assert_eq!(size, 2);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_exit_goes_to_market() {
        let (b, mut r, _q) = setup(5000.00, 5000.25);
        b.set_net_position("MES", 2, 5002.0);
        let out = r.exit(Side::Long, 2, ExitReason::Stop, 5000.00).await;
        match out {
            ExitOutcome::Closed { avg_price, size } => {
                assert_eq!(avg_price, 5000.00); // sells hit the bid
                assert_eq!(size, 2);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_flatten_retries_then_fails() {
        let (b, mut r, _q) = setup(5000.00, 5000.25);
        for _ in 0..5 {
            b.script_error(BrokerError::Transient("gateway down".to_string()));
        }
        let out = r.exit(Side::Long, 2, ExitReason::Emergency, 0.0).await;
        assert_eq!(out, ExitOutcome::FlattenFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_flatten_succeeds_after_transients() {
        let (b, mut r, _q) = setup(5000.00, 5000.25);
        b.script_error(BrokerError::Transient("blip".to_string()));
        b.script_error(BrokerError::Transient("blip".to_string()));
        let out = r.exit(Side::Long, 2, ExitReason::Emergency, 0.0).await;
        assert!(matches!(out, ExitOutcome::Closed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_opens_after_consecutive_transients_and_probe_resets() {
        let (b, mut r, _q) = setup(5000.00, 5000.25);
        for _ in 0..5 {
            b.script_error(BrokerError::Transient("down".to_string()));
            let _ = r.enter(Side::Long, 1, 5000.00, aggressive_ctx()).await;
        }
        assert_eq!(r.breaker_state(), BreakerState::Open);

        // Entries blocked while open.
        let out = r.enter(Side::Long, 1, 5000.00, aggressive_ctx()).await;
        assert!(matches!(out, EntryOutcome::Aborted { .. }));

        // Health probe closes it.
        assert!(r.health_probe().await);
        assert_eq!(r.breaker_state(), BreakerState::Closed);
        let out = r.enter(Side::Long, 1, 5000.00, aggressive_ctx()).await;
        assert!(matches!(out, EntryOutcome::Filled { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn rejections_do_not_trip_breaker() {
        let (b, mut r, _q) = setup(5000.00, 5000.25);
        for _ in 0..6 {
            b.script_error(BrokerError::Rejected("margin".to_string()));
            let _ = r.enter(Side::Long, 1, 5000.00, aggressive_ctx()).await;
        }
        assert_eq!(r.breaker_state(), BreakerState::Closed);
    }
}
