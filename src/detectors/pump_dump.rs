// =============================================================================
// Pump/Dump Monitor — fast price moves over a sliding window
// =============================================================================
//
// Tracks best-mid over a short window per symbol and fires when the move
// from the window extreme to the current price crosses a threshold:
//
//   pump = (current - window_min) / window_min
//   dump = (current - window_max) / window_max
//
// Each direction cools down independently.  `reset` clears the history on
// reconnect so a stale extreme cannot fire against the fresh snapshot.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::market_data::PriceHistory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveKind {
    Pump,
    Dump,
}

/// A detected fast move.
#[derive(Debug, Clone)]
pub struct PriceMoveAlert {
    pub kind: MoveKind,
    pub symbol: String,
    pub price_from: f64,
    pub price_to: f64,
    pub change_pct: f64,
    pub window_secs: f64,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PumpDumpConfig {
    /// Percent move up that fires (positive).
    pub pump_threshold_pct: f64,
    /// Percent move down that fires (negative).
    pub dump_threshold_pct: f64,
    pub window_secs: f64,
    pub cooldown_secs: f64,
}

impl Default for PumpDumpConfig {
    fn default() -> Self {
        Self {
            pump_threshold_pct: 10.0,
            dump_threshold_pct: -10.0,
            window_secs: 60.0,
            cooldown_secs: 300.0,
        }
    }
}

struct SymbolMonitor {
    history: PriceHistory,
    last_pump: Option<DateTime<Utc>>,
    last_dump: Option<DateTime<Utc>>,
}

impl SymbolMonitor {
    fn new(window_secs: f64) -> Self {
        // Retain twice the window so the extreme is always covered.
        Self {
            history: PriceHistory::new(
                Duration::milliseconds((window_secs * 2_000.0) as i64),
                1000,
            ),
            last_pump: None,
            last_dump: None,
        }
    }
}

/// Multi-symbol pump/dump detector.
pub struct PumpDumpMonitor {
    config: PumpDumpConfig,
    monitors: HashMap<String, SymbolMonitor>,
    pub total_alerts: u64,
}

impl PumpDumpMonitor {
    pub fn new(config: PumpDumpConfig) -> Self {
        Self {
            config,
            monitors: HashMap::new(),
            total_alerts: 0,
        }
    }

    /// Clear all histories and cooldowns (reconnect resync barrier).
    pub fn reset(&mut self) {
        self.monitors.clear();
    }

    /// Feed a mid-price update; returns an alert when a threshold crossing
    /// clears its cooldown.
    pub fn update(&mut self, symbol: &str, price: f64, now: DateTime<Utc>) -> Option<PriceMoveAlert> {
        if price <= 0.0 {
            return None;
        }
        let cfg = self.config.clone();
        let window = Duration::milliseconds((cfg.window_secs * 1000.0) as i64);
        let mon = self
            .monitors
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolMonitor::new(cfg.window_secs));

        mon.history.push(now, price, 0.0);
        if mon.history.len() < 2 {
            return None;
        }

        let min = mon.history.min_price(now, window)?;
        let max = mon.history.max_price(now, window)?;

        if min > 0.0 {
            let pump_pct = (price - min) / min * 100.0;
            if pump_pct >= cfg.pump_threshold_pct {
                let cooled = mon.last_pump.map_or(true, |last| {
                    (now - last).num_milliseconds() as f64 / 1000.0 >= cfg.cooldown_secs
                });
                if cooled {
                    mon.last_pump = Some(now);
                    self.total_alerts += 1;
                    return Some(PriceMoveAlert {
                        kind: MoveKind::Pump,
                        symbol: symbol.to_string(),
                        price_from: min,
                        price_to: price,
                        change_pct: pump_pct,
                        window_secs: cfg.window_secs,
                        ts: now,
                    });
                }
            }
        }

        if max > 0.0 {
            let dump_pct = (price - max) / max * 100.0;
            if dump_pct <= cfg.dump_threshold_pct {
                let cooled = mon.last_dump.map_or(true, |last| {
                    (now - last).num_milliseconds() as f64 / 1000.0 >= cfg.cooldown_secs
                });
                if cooled {
                    mon.last_dump = Some(now);
                    self.total_alerts += 1;
                    return Some(PriceMoveAlert {
                        kind: MoveKind::Dump,
                        symbol: symbol.to_string(),
                        price_from: max,
                        price_to: price,
                        change_pct: dump_pct,
                        window_secs: cfg.window_secs,
                        ts: now,
                    });
                }
            }
        }

        None
    }
}

impl Default for PumpDumpMonitor {
    fn default() -> Self {
        Self::new(PumpDumpConfig::default())
    }
}
