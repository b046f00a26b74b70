// =============================================================================
// Broker Gateway — the only seam between the engine and an execution venue
// =============================================================================
//
// The engine never speaks a wire protocol. It calls this trait; adapters own
// transport, authentication, and venue quirks. The sim adapter (`sim`) backs
// dry-run mode and backtests.
//
// Error taxonomy is explicit: transient failures are retried per RetrySpec
// and feed the router's circuit breaker; permanent failures abort the
// operation immediately.
// =============================================================================

pub mod sim;

pub use sim::SimBroker;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Side;

pub type OrderId = String;

/// Venue-facing order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
}

/// State of an order as last reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Submitted,
    Acked,
    Filled,
    PartiallyFilled,
    Rejected,
    Cancelled,
}

impl OrderState {
    /// No further fills can arrive in this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Rejected | Self::Cancelled)
    }
}

/// A fully specified order submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub size: u32,
    pub order_type: OrderType,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, side: Side, size: u32) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            size,
            order_type: OrderType::Market,
            limit_price: None,
            stop_price: None,
        }
    }

    pub fn limit(symbol: impl Into<String>, side: Side, size: u32, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            size,
            order_type: OrderType::Limit,
            limit_price: Some(price),
            stop_price: None,
        }
    }
}

/// Broker-reported status of one order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderStatus {
    pub state: OrderState,
    pub filled_size: u32,
    pub avg_fill_price: f64,
}

/// Result of `connect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub connected: bool,
    pub account_id: String,
    pub balance: f64,
    pub account_type: String,
}

/// A position as the broker sees it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub side: Side,
    pub size: u32,
    pub avg_price: f64,
}

/// Failure taxonomy for broker operations.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// Worth retrying: connection blips, throttling, gateway restarts.
    #[error("transient broker error: {0}")]
    Transient(String),
    /// Not worth retrying: malformed request, unknown order, closed market.
    #[error("permanent broker error: {0}")]
    Permanent(String),
    /// The operation did not complete within its deadline.
    #[error("broker operation timed out after {0:?}")]
    Timeout(Duration),
    /// The venue explicitly rejected the order.
    #[error("order rejected: {0}")]
    Rejected(String),
    /// Credentials were refused.
    #[error("broker authentication failed: {0}")]
    Auth(String),
}

impl BrokerError {
    /// Whether the retry policy applies.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// Retry policy encoded as data: exponential backoff with a cap.
#[derive(Debug, Clone, Copy)]
pub struct RetrySpec {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetrySpec {
    /// Backoff before attempt `n` (1-based): base * 2^(n-1), capped.
    /// Attempt 1 has no delay.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (attempt - 2).min(16);
        (self.base_delay * factor).min(self.max_delay)
    }
}

/// The outbound API the core calls. One instance per venue connection.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    async fn connect(&self) -> Result<AccountInfo, BrokerError>;

    async fn get_positions(&self, symbol: &str) -> Result<Vec<BrokerPosition>, BrokerError>;

    async fn submit_order(&self, request: OrderRequest) -> Result<OrderId, BrokerError>;

    async fn cancel_order(&self, order_id: &OrderId) -> Result<(), BrokerError>;

    async fn order_status(&self, order_id: &OrderId) -> Result<OrderStatus, BrokerError>;
}
