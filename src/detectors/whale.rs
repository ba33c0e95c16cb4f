// =============================================================================
// Whale Tracker — large-order patterns, price walls, stop hunts
// =============================================================================
//
// A trade is "large" when its notional clears a dynamic threshold derived
// from an EMA of the symbol's 24h quote volume:
//
//   threshold = max(volume_ema * threshold_ratio, floor)
//
// Patterns over the trailing window:
//   - Accumulation / Distribution: >= 80% of large orders on one side.
//   - Price wall: a resting level whose notional clears the threshold and
//     whose age exceeds the persistence minimum.  `first_seen` survives size
//     updates; a removal (size 0) followed by a re-add starts a new wall.
//   - Stop hunt: price pierces the prior 1h low, recovers above it within
//     the rebound window, and recent volume runs >= 3x the per-record
//     average.  Emitted at High severity by the pipeline.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::market_data::PriceHistory;
use crate::types::Side;

/// Large-order records kept per symbol.
const ORDER_CAP: usize = 100;

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Accumulation,
    Distribution,
    PriceWall,
}

/// One recorded large order.
#[derive(Debug, Clone)]
pub struct LargeOrderRecord {
    pub ts: DateTime<Utc>,
    pub side: Side,
    pub value: f64,
    pub slippage_pct: f64,
}

/// A detected institutional pattern.
#[derive(Debug, Clone)]
pub struct WhalePattern {
    pub kind: PatternKind,
    pub symbol: String,
    pub description: String,
    pub order_count: usize,
    pub total_value: f64,
    /// For walls, the wall's price level; 0 for flow patterns.
    pub price: f64,
    pub confidence: f64,
    pub ts: DateTime<Utc>,
}

/// A detected stop hunt.
#[derive(Debug, Clone)]
pub struct StopHuntSignal {
    pub symbol: String,
    pub support_price: f64,
    pub breakthrough_price: f64,
    pub rebound_price: f64,
    pub volume_spike_ratio: f64,
    pub ts: DateTime<Utc>,
}

/// Wall key: price rounded to 4 decimal places, scaled to an integer.
fn wall_key(price: f64) -> i64 {
    (price * 10_000.0).round() as i64
}

fn wall_price(key: i64) -> f64 {
    key as f64 / 10_000.0
}

/// Per-symbol tracking state.
struct SymbolTracker {
    volume_ema: f64,
    dynamic_threshold: f64,
    orders: VecDeque<LargeOrderRecord>,
    price_history: PriceHistory,
    /// price key -> (resting size, first seen).
    price_walls: HashMap<i64, (f64, DateTime<Utc>)>,
}

impl SymbolTracker {
    fn new(floor: f64) -> Self {
        Self {
            volume_ema: 0.0,
            dynamic_threshold: floor.max(50_000.0),
            orders: VecDeque::new(),
            price_history: PriceHistory::one_hour(),
            price_walls: HashMap::new(),
        }
    }
}

// =============================================================================
// Config
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhaleConfig {
    pub window_minutes: i64,
    pub min_orders_for_pattern: usize,
    pub accumulation_ratio: f64,
    /// Large order = this fraction of the 24h volume EMA.
    pub threshold_ratio: f64,
    pub threshold_floor: f64,
    pub volume_ema_alpha: f64,
    pub wall_persist_minutes: f64,
    pub stop_hunt_rebound_secs: f64,
    pub stop_hunt_volume_ratio: f64,
}

impl Default for WhaleConfig {
    fn default() -> Self {
        Self {
            window_minutes: 30,
            min_orders_for_pattern: 3,
            accumulation_ratio: 0.8,
            threshold_ratio: 0.01,
            threshold_floor: 10_000.0,
            volume_ema_alpha: 0.1,
            wall_persist_minutes: 5.0,
            stop_hunt_rebound_secs: 10.0,
            stop_hunt_volume_ratio: 3.0,
        }
    }
}

// =============================================================================
// Tracker
// =============================================================================

pub struct WhaleTracker {
    config: WhaleConfig,
    trackers: HashMap<String, SymbolTracker>,
}

impl WhaleTracker {
    pub fn new(config: WhaleConfig) -> Self {
        Self {
            config,
            trackers: HashMap::new(),
        }
    }

    fn entry(&mut self, symbol: &str) -> &mut SymbolTracker {
        let floor = self.config.threshold_floor;
        self.trackers
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolTracker::new(floor))
    }

    /// Drop all state (reconnect resync barrier).
    pub fn reset(&mut self) {
        self.trackers.clear();
    }

    // -------------------------------------------------------------------------
    // Inputs
    // -------------------------------------------------------------------------

    /// Fold a fresh 24h quote-volume reading into the EMA and refresh the
    /// dynamic threshold.  Called from the periodic symbol refresh.
    pub fn update_volume(&mut self, symbol: &str, volume_24h: f64) {
        let alpha = self.config.volume_ema_alpha;
        let ratio = self.config.threshold_ratio;
        let floor = self.config.threshold_floor;
        let tracker = self.entry(symbol);

        if tracker.volume_ema <= 0.0 {
            tracker.volume_ema = volume_24h;
        } else {
            tracker.volume_ema = alpha * volume_24h + (1.0 - alpha) * tracker.volume_ema;
        }
        tracker.dynamic_threshold = (tracker.volume_ema * ratio).max(floor);
    }

    pub fn dynamic_threshold(&mut self, symbol: &str) -> f64 {
        self.entry(symbol).dynamic_threshold
    }

    pub fn is_large_order(&mut self, symbol: &str, value: f64) -> bool {
        value >= self.dynamic_threshold(symbol)
    }

    /// Record a trade as a large order when it clears the threshold.
    /// Returns whether it was recorded.
    pub fn record_large_order(
        &mut self,
        symbol: &str,
        side: Side,
        value: f64,
        slippage_pct: f64,
        ts: DateTime<Utc>,
    ) -> bool {
        if !self.is_large_order(symbol, value) {
            return false;
        }
        let tracker = self.entry(symbol);
        tracker.orders.push_back(LargeOrderRecord {
            ts,
            side,
            value,
            slippage_pct,
        });
        while tracker.orders.len() > ORDER_CAP {
            tracker.orders.pop_front();
        }
        debug!(
            symbol,
            %side,
            value = format!("{value:.0}"),
            threshold = format!("{:.0}", tracker.dynamic_threshold),
            "large order recorded"
        );
        true
    }

    /// Track price and taker volume (feeds stop-hunt detection).
    pub fn update_price(&mut self, symbol: &str, price: f64, volume: f64, ts: DateTime<Utc>) {
        self.entry(symbol).price_history.push(ts, price, volume);
    }

    /// Track a resting level for wall persistence.  `size = 0` removes;
    /// an update keeps the original `first_seen`; re-adding after removal
    /// starts a fresh wall.
    pub fn update_price_wall(&mut self, symbol: &str, price: f64, size: f64, ts: DateTime<Utc>) {
        let tracker = self.entry(symbol);
        let key = wall_key(price);
        if size > 0.0 {
            let first_seen = tracker
                .price_walls
                .get(&key)
                .map(|&(_, seen)| seen)
                .unwrap_or(ts);
            tracker.price_walls.insert(key, (size, first_seen));
        } else {
            tracker.price_walls.remove(&key);
        }
    }

    /// Prices of currently tracked walls for one symbol.
    pub fn wall_prices(&mut self, symbol: &str) -> Vec<f64> {
        self.entry(symbol)
            .price_walls
            .keys()
            .map(|&k| wall_price(k))
            .collect()
    }

    /// Clear all walls for one symbol (reconnect resync barrier).
    pub fn clear_walls(&mut self, symbol: &str) {
        self.entry(symbol).price_walls.clear();
    }

    // -------------------------------------------------------------------------
    // Detection
    // -------------------------------------------------------------------------

    /// Flow patterns (accumulation/distribution) plus persistent walls.
    pub fn detect_patterns(&mut self, symbol: &str, now: DateTime<Utc>) -> Vec<WhalePattern> {
        let cfg = self.config.clone();
        let mut patterns = Vec::new();

        let threshold = self.entry(symbol).dynamic_threshold;
        let tracker = self.entry(symbol);
        let cutoff = now - Duration::minutes(cfg.window_minutes);
        let orders: Vec<&LargeOrderRecord> =
            tracker.orders.iter().filter(|o| o.ts >= cutoff).collect();

        if orders.len() >= cfg.min_orders_for_pattern {
            let buys: Vec<&&LargeOrderRecord> =
                orders.iter().filter(|o| o.side == Side::Buy).collect();
            let sells: Vec<&&LargeOrderRecord> =
                orders.iter().filter(|o| o.side == Side::Sell).collect();
            let total = orders.len() as f64;
            let buy_ratio = buys.len() as f64 / total;
            let sell_ratio = sells.len() as f64 / total;

            if buy_ratio >= cfg.accumulation_ratio {
                patterns.push(WhalePattern {
                    kind: PatternKind::Accumulation,
                    symbol: symbol.to_string(),
                    description: format!("{} consecutive large buys", buys.len()),
                    order_count: buys.len(),
                    total_value: buys.iter().map(|o| o.value).sum(),
                    price: 0.0,
                    confidence: buy_ratio,
                    ts: now,
                });
            } else if sell_ratio >= cfg.accumulation_ratio {
                patterns.push(WhalePattern {
                    kind: PatternKind::Distribution,
                    symbol: symbol.to_string(),
                    description: format!("{} consecutive large sells", sells.len()),
                    order_count: sells.len(),
                    total_value: sells.iter().map(|o| o.value).sum(),
                    price: 0.0,
                    confidence: sell_ratio,
                    ts: now,
                });
            }
        }

        // Persistent walls whose notional clears the dynamic threshold.
        let persist = Duration::milliseconds((cfg.wall_persist_minutes * 60_000.0) as i64);
        for (&key, &(size, first_seen)) in &tracker.price_walls {
            let age = now - first_seen;
            if age < persist {
                continue;
            }
            let price = wall_price(key);
            let value = price * size;
            if value < threshold {
                continue;
            }
            let age_secs = age.num_seconds() as f64;
            patterns.push(WhalePattern {
                kind: PatternKind::PriceWall,
                symbol: symbol.to_string(),
                description: format!(
                    "{value:.0} resting at {price} for {} min",
                    age.num_minutes()
                ),
                order_count: 0,
                total_value: value,
                price,
                confidence: (age_secs / 600.0).min(1.0),
                ts: now,
            });
        }

        patterns
    }

    /// Stop-hunt check: pierce of the prior 1h low, fast recovery, volume
    /// spike.  Returns `None` when any leg is missing.
    pub fn detect_stop_hunt(&mut self, symbol: &str, now: DateTime<Utc>) -> Option<StopHuntSignal> {
        let cfg = self.config.clone();
        let tracker = self.entry(symbol);
        let history = &tracker.price_history;

        if history.len() < 100 {
            return None;
        }

        let hour_ago = now - Duration::hours(1);
        let rebound_window = Duration::milliseconds((cfg.stop_hunt_rebound_secs * 1000.0) as i64);
        let recent_cutoff = now - rebound_window;

        // Support is the low of the hour PRIOR to the rebound window, so the
        // dip itself cannot drag the reference down.
        let mut support: Option<f64> = None;
        let mut long_count = 0usize;
        let mut long_volume = 0.0;
        for r in history.since(hour_ago) {
            long_count += 1;
            long_volume += r.volume;
            if r.ts < recent_cutoff {
                support = Some(support.map_or(r.price, |s: f64| s.min(r.price)));
            }
        }
        let support = support?;
        if long_count < 10 {
            return None;
        }

        let very_recent: Vec<_> = history.since(recent_cutoff).collect();
        if very_recent.len() < 3 {
            return None;
        }

        // Leg 1: a pierce below support inside the rebound window.
        let pierce_ts = very_recent
            .iter()
            .find(|r| r.price < support)
            .map(|r| r.ts)?;
        let breakthrough_price = very_recent
            .iter()
            .filter(|r| r.price < support)
            .map(|r| r.price)
            .fold(f64::INFINITY, f64::min);

        // Leg 2: recovery to or above support after the pierce.
        let rebound_price = very_recent
            .iter()
            .filter(|r| r.ts > pierce_ts && r.price >= support)
            .map(|r| r.price)
            .last()?;

        // Leg 3: recent volume at least N times the hourly per-record mean.
        let avg_volume = long_volume / long_count as f64;
        let recent_volume: f64 = very_recent.iter().map(|r| r.volume).sum();
        let volume_ratio = recent_volume / (avg_volume * very_recent.len() as f64 + 1e-9);
        if volume_ratio < cfg.stop_hunt_volume_ratio {
            return None;
        }

        Some(StopHuntSignal {
            symbol: symbol.to_string(),
            support_price: support,
            breakthrough_price,
            rebound_price,
            volume_spike_ratio: volume_ratio,
            ts: now,
        })
    }
}

impl Default for WhaleTracker {
    fn default() -> Self {
        Self::new(WhaleConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn t(base: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
        base + Duration::seconds(secs)
    }

    #[test]
    fn dynamic_threshold_tracks_volume_ema() {
        let mut w = WhaleTracker::default();
        assert!((w.dynamic_threshold("S") - 50_000.0).abs() < f64::EPSILON);

        w.update_volume("S", 10_000_000.0);
        // First reading seeds the EMA directly: 10M * 1% = 100k.
        assert!((w.dynamic_threshold("S") - 100_000.0).abs() < 1e-6);

        // Tiny volume floors at 10k.
        w.update_volume("T", 1_000.0);
        assert!((w.dynamic_threshold("T") - 10_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn small_orders_not_recorded() {
        let mut w = WhaleTracker::default();
        w.update_volume("S", 10_000_000.0);
        let now = Utc::now();
        assert!(!w.record_large_order("S", Side::Buy, 50_000.0, 0.1, now));
        assert!(w.record_large_order("S", Side::Buy, 150_000.0, 0.1, now));
    }

    #[test]
    fn accumulation_pattern() {
        let mut w = WhaleTracker::default();
        w.update_volume("S", 1_000_000.0);
        let base = Utc::now();
        for i in 0..4 {
            w.record_large_order("S", Side::Buy, 20_000.0, 0.1, t(base, i));
        }
        w.record_large_order("S", Side::Sell, 20_000.0, 0.1, t(base, 5));

        let patterns = w.detect_patterns("S", t(base, 10));
        assert_eq!(patterns.len(), 1);
        let p = &patterns[0];
        assert_eq!(p.kind, PatternKind::Accumulation);
        assert_eq!(p.order_count, 4);
        assert!((p.confidence - 0.8).abs() < f64::EPSILON);
        assert!((p.total_value - 80_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn distribution_pattern() {
        let mut w = WhaleTracker::default();
        w.update_volume("S", 1_000_000.0);
        let base = Utc::now();
        for i in 0..5 {
            w.record_large_order("S", Side::Sell, 15_000.0, 0.1, t(base, i));
        }
        let patterns = w.detect_patterns("S", t(base, 10));
        assert_eq!(patterns[0].kind, PatternKind::Distribution);
    }

    #[test]
    fn too_few_orders_no_pattern() {
        let mut w = WhaleTracker::default();
        w.update_volume("S", 1_000_000.0);
        let base = Utc::now();
        w.record_large_order("S", Side::Buy, 20_000.0, 0.1, base);
        w.record_large_order("S", Side::Buy, 20_000.0, 0.1, t(base, 1));
        assert!(w.detect_patterns("S", t(base, 2)).is_empty());
    }

    #[test]
    fn wall_persists_and_fires() {
        let mut w = WhaleTracker::default();
        w.update_volume("S", 1_000_000.0); // threshold 10k
        let base = Utc::now();
        w.update_price_wall("S", 100.0, 5_000.0, base); // $500k wall

        // Too young at 4 minutes.
        assert!(w.detect_patterns("S", base + Duration::minutes(4)).is_empty());

        // Old enough at 6 minutes.
        let patterns = w.detect_patterns("S", base + Duration::minutes(6));
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].kind, PatternKind::PriceWall);
        assert!((patterns[0].price - 100.0).abs() < 1e-9);
        // Confidence ramps to 1.0 over 10 minutes.
        assert!((patterns[0].confidence - 0.6).abs() < 0.01);
    }

    #[test]
    fn wall_size_update_keeps_first_seen() {
        let mut w = WhaleTracker::default();
        w.update_volume("S", 1_000_000.0);
        let base = Utc::now();
        w.update_price_wall("S", 100.0, 5_000.0, base);
        w.update_price_wall("S", 100.0, 6_000.0, base + Duration::minutes(3));

        // Age counts from the original placement.
        let patterns = w.detect_patterns("S", base + Duration::minutes(6));
        assert_eq!(patterns.len(), 1);
    }

    #[test]
    fn wall_removal_resets_first_seen() {
        let mut w = WhaleTracker::default();
        w.update_volume("S", 1_000_000.0);
        let base = Utc::now();
        w.update_price_wall("S", 100.0, 5_000.0, base);
        w.update_price_wall("S", 100.0, 0.0, base + Duration::minutes(2));
        let readd = base + Duration::minutes(3);
        w.update_price_wall("S", 100.0, 5_000.0, readd);

        // Only 4 minutes old relative to the re-add: no pattern yet.
        assert!(w.detect_patterns("S", base + Duration::minutes(7)).is_empty());
        // Ages past persistence relative to the re-add.
        let patterns = w.detect_patterns("S", readd + Duration::minutes(6));
        assert_eq!(patterns.len(), 1);
    }

    #[test]
    fn stop_hunt_detects_pierce_and_recovery_with_volume() {
        let mut w = WhaleTracker::default();
        let base = Utc::now();

        // An hour of quiet trade around 100 with baseline volume.
        for i in 0..120 {
            w.update_price("S", 100.0 + (i % 5) as f64 * 0.1, 1_000.0, t(base, i * 20));
        }
        let now = t(base, 120 * 20 + 9);

        // Inside the 10s rebound window: pierce below the 100.0 low on huge
        // volume, then recover above it.
        w.update_price("S", 99.0, 50_000.0, now - Duration::seconds(8));
        w.update_price("S", 99.5, 50_000.0, now - Duration::seconds(5));
        w.update_price("S", 100.2, 50_000.0, now - Duration::seconds(1));

        let sig = w.detect_stop_hunt("S", now).expect("stop hunt");
        assert!((sig.support_price - 100.0).abs() < 1e-9);
        assert!((sig.breakthrough_price - 99.0).abs() < 1e-9);
        assert!(sig.rebound_price >= sig.support_price);
        assert!(sig.volume_spike_ratio >= 3.0);
    }

    #[test]
    fn stop_hunt_requires_recovery() {
        let mut w = WhaleTracker::default();
        let base = Utc::now();
        for i in 0..120 {
            w.update_price("S", 100.0, 1_000.0, t(base, i * 20));
        }
        let now = t(base, 120 * 20 + 9);
        // Pierce with no recovery: still below support.
        w.update_price("S", 99.0, 50_000.0, now - Duration::seconds(8));
        w.update_price("S", 98.5, 50_000.0, now - Duration::seconds(4));
        w.update_price("S", 98.0, 50_000.0, now - Duration::seconds(1));
        assert!(w.detect_stop_hunt("S", now).is_none());
    }

    #[test]
    fn stop_hunt_requires_volume_spike() {
        let mut w = WhaleTracker::default();
        let base = Utc::now();
        for i in 0..120 {
            w.update_price("S", 100.0, 1_000.0, t(base, i * 20));
        }
        let now = t(base, 120 * 20 + 9);
        // Pierce and recover, but on baseline volume.
        w.update_price("S", 99.0, 1_000.0, now - Duration::seconds(8));
        w.update_price("S", 100.2, 1_000.0, now - Duration::seconds(1));
        assert!(w.detect_stop_hunt("S", now).is_none());
    }
}
