// =============================================================================
// Orca Watch — real-time market-microstructure surveillance
// =============================================================================
//
// Streams order-book deltas, aggregate trades, and depth snapshots across
// many supervised WebSocket connections, runs a family of detectors per
// symbol, and fans deduplicated, severity-graded alerts out to independent
// sinks.  Shared by the `orca-watch` supervisor binary and the
// `orca-replay` CSV harness.
// =============================================================================

pub mod alerts;
pub mod api;
pub mod config;
pub mod detectors;
pub mod hot_config;
pub mod market_data;
pub mod metrics;
pub mod net;
pub mod processor;
pub mod replay;
pub mod rest;
pub mod stream;
pub mod supervisor;
pub mod symbols;
pub mod types;
pub mod venue;
