// =============================================================================
// Meridian — intraday futures execution engine
// =============================================================================
//
// Library surface for the `meridian` binary, the backtest runner, and the
// scenario test suite. The engine core is single-threaded; see `engine` for
// the event-loop contract.
// =============================================================================

pub mod audit;
pub mod backtest;
pub mod broker;
pub mod clock;
pub mod config;
pub mod engine;
pub mod events;
pub mod experience;
pub mod indicators;
pub mod license;
pub mod market_data;
pub mod notify;
pub mod persistence;
pub mod position;
pub mod quotes;
pub mod risk;
pub mod router;
pub mod signal;
pub mod types;
