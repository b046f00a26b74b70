// =============================================================================
// Position & Exit Management — state machine, rule ladder, parameter bundle
// =============================================================================

pub mod exits;
pub mod manager;
pub mod params;

pub use exits::ExitEvaluator;
pub use manager::{ExitSubstate, PartialFill, Position, PositionManager, StopAdjustment, StopOwner};
pub use params::{ConstantExitParams, ExitFeatureVector, ExitParams, ExitParamsProvider};
