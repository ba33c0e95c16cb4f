// =============================================================================
// Detector Suite — per-symbol signal generators
// =============================================================================
//
// Each detector is a pure function of the incoming event stream plus its own
// small state: the shard processor feeds trades and depth ticks in and turns
// whatever fires into alert candidates for the gate.  All timestamps come
// from the events, never the wall clock, so a replay of the same input
// stream produces identical output.
// =============================================================================

pub mod basis;
pub mod imbalance;
pub mod pump_dump;
pub mod slippage;
pub mod whale;

pub use basis::{BasisAlert, BasisConfig, BasisTracker};
pub use imbalance::{ImbalanceAnalyzer, ImbalanceConfig, ImbalanceSignal};
pub use pump_dump::{PriceMoveAlert, PumpDumpConfig, PumpDumpMonitor};
pub use slippage::{SlippageFilter, SlippageFilterConfig};
pub use whale::{StopHuntSignal, WhaleConfig, WhalePattern, WhaleTracker};
