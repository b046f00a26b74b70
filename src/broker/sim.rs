// =============================================================================
// Sim Broker — deterministic paper venue for dry-run and backtests
// =============================================================================
//
// Fill model:
//   - Market orders fill immediately at the touch (buy at ask, sell at bid).
//   - Limit orders fill immediately when marketable, otherwise rest and fill
//     when the touch crosses the limit price on a later quote.
//   - Stop orders arm at the stop price and fill at the touch once elapsed.
//
// Tests and the backtester can script behaviour:
//   - `script_error` queues an error returned by the next submission;
//   - `script_partial_ratio` makes the next fill partial;
//   - `set_quote` drives the fill engine.
//
// Everything is deterministic: no randomness, no wall-clock reads.
// =============================================================================

use std::collections::HashMap;
use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::market_data::Tick;
use crate::types::Side;

use super::{
    AccountInfo, BrokerError, BrokerGateway, BrokerPosition, OrderId, OrderRequest, OrderState,
    OrderStatus, OrderType,
};

#[derive(Debug, Clone)]
struct SimOrder {
    request: OrderRequest,
    state: OrderState,
    filled_size: u32,
    avg_fill_price: f64,
}

struct Inner {
    quote: Option<Tick>,
    orders: HashMap<OrderId, SimOrder>,
    /// Net position per symbol: positive = long contracts.
    net: HashMap<String, (i64, f64)>,
    next_id: u64,
    scripted_errors: VecDeque<BrokerError>,
    scripted_partial: VecDeque<f64>,
    fail_connect: bool,
    submit_count: u64,
}

/// Deterministic in-process venue.
pub struct SimBroker {
    state: Mutex<Inner>,
    account_id: String,
    balance: f64,
}

impl SimBroker {
    pub fn new(account_id: impl Into<String>, balance: f64) -> Self {
        Self {
            state: Mutex::new(Inner {
                quote: None,
                orders: HashMap::new(),
                net: HashMap::new(),
                next_id: 0,
                scripted_errors: VecDeque::new(),
                scripted_partial: VecDeque::new(),
                fail_connect: false,
                submit_count: 0,
            }),
            account_id: account_id.into(),
            balance,
        }
    }

    /// Push the latest quote and work any resting orders against it.
    pub fn set_quote(&self, tick: Tick) {
        let mut s = self.state.lock();
        s.quote = Some(tick);

        let ids: Vec<OrderId> = s
            .orders
            .iter()
            .filter(|(_, o)| !o.state.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            Self::try_fill_resting(&mut s, &id, &tick);
        }
    }

    /// Queue an error for the next `submit_order` call.
    pub fn script_error(&self, error: BrokerError) {
        self.state.lock().scripted_errors.push_back(error);
    }

    /// Make the next fill partial at the given ratio of the requested size.
    pub fn script_partial_ratio(&self, ratio: f64) {
        self.state.lock().scripted_partial.push_back(ratio);
    }

    /// Make `connect` fail with an auth error.
    pub fn fail_connect(&self) {
        self.state.lock().fail_connect = true;
    }

    /// Total orders accepted (diagnostics / idempotence assertions).
    pub fn submit_count(&self) -> u64 {
        self.state.lock().submit_count
    }

    /// Force-set the broker-side net position (restart-verification tests).
    pub fn set_net_position(&self, symbol: &str, contracts: i64, avg_price: f64) {
        self.state
            .lock()
            .net
            .insert(symbol.to_string(), (contracts, avg_price));
    }

    fn fill_price(quote: &Tick, side: Side) -> f64 {
        match side {
            Side::Long => quote.ask,
            Side::Short => quote.bid,
        }
    }

    /// Whether a resting limit order is now marketable.
    fn limit_marketable(quote: &Tick, side: Side, limit: f64) -> bool {
        match side {
            Side::Long => quote.ask <= limit,
            Side::Short => quote.bid >= limit,
        }
    }

    fn stop_triggered(quote: &Tick, side: Side, stop: f64) -> bool {
        match side {
            // A buy stop triggers when the market trades up through it.
            Side::Long => quote.last >= stop,
            Side::Short => quote.last <= stop,
        }
    }

    fn apply_fill(s: &mut Inner, id: &OrderId, price: f64, size: u32, requested: u32) {
        let Some(order) = s.orders.get_mut(id) else {
            return;
        };
        order.filled_size += size;
        order.avg_fill_price = price;
        order.state = if order.filled_size >= requested {
            OrderState::Filled
        } else {
            OrderState::PartiallyFilled
        };

        let signed = match order.request.side {
            Side::Long => size as i64,
            Side::Short => -(size as i64),
        };
        let entry = s
            .net
            .entry(order.request.symbol.clone())
            .or_insert((0, 0.0));
        entry.0 += signed;
        entry.1 = price;

        debug!(
            order_id = %id,
            price,
            size,
            state = ?s.orders[id].state,
            "sim fill"
        );
    }

    fn try_fill_resting(s: &mut Inner, id: &OrderId, quote: &Tick) {
        let Some(order) = s.orders.get(id).cloned() else {
            return;
        };
        if order.state.is_terminal() {
            return;
        }

        let fillable = match order.request.order_type {
            OrderType::Market => true,
            OrderType::Limit => order
                .request
                .limit_price
                .map(|p| Self::limit_marketable(quote, order.request.side, p))
                .unwrap_or(false),
            OrderType::Stop => order
                .request
                .stop_price
                .map(|p| Self::stop_triggered(quote, order.request.side, p))
                .unwrap_or(false),
        };
        if !fillable {
            return;
        }

        let price = match order.request.order_type {
            OrderType::Limit => order
                .request
                .limit_price
                .unwrap_or_else(|| Self::fill_price(quote, order.request.side)),
            _ => Self::fill_price(quote, order.request.side),
        };

        let remaining = order.request.size - order.filled_size;
        let size = match s.scripted_partial.pop_front() {
            Some(ratio) => ((remaining as f64 * ratio).floor() as u32).clamp(1, remaining),
            None => remaining,
        };
        Self::apply_fill(s, id, price, size, order.request.size);
    }
}

#[async_trait]
impl BrokerGateway for SimBroker {
    async fn connect(&self) -> Result<AccountInfo, BrokerError> {
        let s = self.state.lock();
        if s.fail_connect {
            return Err(BrokerError::Auth("sim credentials refused".to_string()));
        }
        Ok(AccountInfo {
            connected: true,
            account_id: self.account_id.clone(),
            balance: self.balance,
            account_type: "SIM".to_string(),
        })
    }

    async fn get_positions(&self, symbol: &str) -> Result<Vec<BrokerPosition>, BrokerError> {
        let s = self.state.lock();
        Ok(s.net
            .get(symbol)
            .filter(|(contracts, _)| *contracts != 0)
            .map(|&(contracts, avg_price)| BrokerPosition {
                side: if contracts > 0 { Side::Long } else { Side::Short },
                size: contracts.unsigned_abs() as u32,
                avg_price,
            })
            .into_iter()
            .collect())
    }

    async fn submit_order(&self, request: OrderRequest) -> Result<OrderId, BrokerError> {
        let mut s = self.state.lock();

        if let Some(err) = s.scripted_errors.pop_front() {
            return Err(err);
        }
        if request.size == 0 {
            return Err(BrokerError::Permanent("order size must be > 0".to_string()));
        }

        s.next_id += 1;
        s.submit_count += 1;
        let id: OrderId = format!("SIM-{}", s.next_id);

        s.orders.insert(
            id.clone(),
            SimOrder {
                request,
                state: OrderState::Acked,
                filled_size: 0,
                avg_fill_price: 0.0,
            },
        );

        // Work the new order against the current quote immediately.
        if let Some(quote) = s.quote {
            Self::try_fill_resting(&mut s, &id, &quote);
        }

        Ok(id)
    }

    async fn cancel_order(&self, order_id: &OrderId) -> Result<(), BrokerError> {
        let mut s = self.state.lock();
        match s.orders.get_mut(order_id) {
            Some(order) if !order.state.is_terminal() => {
                order.state = OrderState::Cancelled;
                Ok(())
            }
            Some(_) => Ok(()), // Already terminal; cancel is a no-op.
            None => Err(BrokerError::Permanent(format!(
                "unknown order id {order_id}"
            ))),
        }
    }

    async fn order_status(&self, order_id: &OrderId) -> Result<OrderStatus, BrokerError> {
        let s = self.state.lock();
        s.orders
            .get(order_id)
            .map(|o| OrderStatus {
                state: o.state,
                filled_size: o.filled_size,
                avg_fill_price: o.avg_fill_price,
            })
            .ok_or_else(|| BrokerError::Permanent(format!("unknown order id {order_id}")))
    }
}
