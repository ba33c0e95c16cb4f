// =============================================================================
// Metrics & Health — counters, gauges, histograms with text exposition
// =============================================================================
//
// A process-wide registry shared by every subsystem.  Labelled counters live
// in RwLock'd maps keyed by rendered label sets; hot scalar counters are
// plain atomics.  The `/metrics` endpoint renders Prometheus text format;
// `/health` reports liveness plus per-shard connection state.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;

use crate::types::Severity;

/// Slippage histogram bucket upper bounds, in percent.
const SLIPPAGE_BUCKETS: &[f64] = &[0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 25.0];

/// One labelled histogram: fixed buckets plus sum and count.
#[derive(Debug, Default)]
struct Histogram {
    bucket_counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    fn observe(&mut self, value: f64) {
        if self.bucket_counts.is_empty() {
            self.bucket_counts = vec![0; SLIPPAGE_BUCKETS.len()];
        }
        for (i, &bound) in SLIPPAGE_BUCKETS.iter().enumerate() {
            if value <= bound {
                self.bucket_counts[i] += 1;
            }
        }
        self.sum += value;
        self.count += 1;
    }
}

/// Process-wide metrics registry.
#[derive(Default)]
pub struct Metrics {
    // ── Counters ────────────────────────────────────────────────────────
    /// (severity, venue, kind) -> count.
    alerts_total: RwLock<HashMap<(String, String, String), u64>>,
    /// venue -> trades.
    trades_processed: RwLock<HashMap<String, u64>>,
    /// shard id -> reconnects.
    reconnects_total: RwLock<HashMap<String, u64>>,
    /// sink name -> dropped messages.
    sink_dropped_total: RwLock<HashMap<String, u64>>,
    /// Push messages dropped by channel rate limiting.
    pub push_rate_limited_total: AtomicU64,
    /// Malformed or unknown wire frames.
    pub protocol_errors_total: AtomicU64,
    /// Depth sequence gaps that forced a resync.
    pub depth_resyncs_total: AtomicU64,
    /// Cooldown-suppressed WBI confirmations (logged, never pushed).
    pub wbi_suppressed_total: AtomicU64,

    // ── Gauges ──────────────────────────────────────────────────────────
    /// venue -> open connections.
    active_connections: RwLock<HashMap<String, i64>>,
    /// (venue, side) -> book levels.
    book_levels: RwLock<HashMap<(String, String), i64>>,
    pub trades_per_sec: RwLock<f64>,

    // ── Histograms ──────────────────────────────────────────────────────
    /// venue -> slippage distribution.
    slippage: RwLock<HashMap<String, Histogram>>,

    // ── Health ──────────────────────────────────────────────────────────
    /// shard id -> connection state name.
    shard_states: RwLock<HashMap<String, String>>,
    start: Option<Instant>,
}

/// Liveness payload for `/health`.
#[derive(Debug, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub shards: HashMap<String, String>,
    pub active_connections: HashMap<String, i64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start: Some(Instant::now()),
            ..Self::default()
        }
    }

    // ── Counter updates ─────────────────────────────────────────────────

    pub fn inc_alert(&self, severity: Severity, venue: &str, kind: &str) {
        let key = (severity.as_str().to_string(), venue.to_string(), kind.to_string());
        *self.alerts_total.write().entry(key).or_insert(0) += 1;
    }

    pub fn inc_trades(&self, venue: &str, n: u64) {
        *self
            .trades_processed
            .write()
            .entry(venue.to_string())
            .or_insert(0) += n;
    }

    /// Total trades processed across all venues.
    pub fn trades_total(&self) -> u64 {
        self.trades_processed.read().values().sum()
    }

    pub fn inc_reconnect(&self, shard: &str) {
        *self
            .reconnects_total
            .write()
            .entry(shard.to_string())
            .or_insert(0) += 1;
    }

    pub fn inc_sink_dropped(&self, sink: &str) {
        *self
            .sink_dropped_total
            .write()
            .entry(sink.to_string())
            .or_insert(0) += 1;
    }

    pub fn sink_dropped(&self, sink: &str) -> u64 {
        self.sink_dropped_total.read().get(sink).copied().unwrap_or(0)
    }

    // ── Gauge updates ───────────────────────────────────────────────────

    pub fn add_connections(&self, venue: &str, delta: i64) {
        *self
            .active_connections
            .write()
            .entry(venue.to_string())
            .or_insert(0) += delta;
    }

    pub fn set_book_levels(&self, venue: &str, side: &str, levels: i64) {
        self.book_levels
            .write()
            .insert((venue.to_string(), side.to_string()), levels);
    }

    pub fn set_trades_per_sec(&self, rate: f64) {
        *self.trades_per_sec.write() = rate;
    }

    // ── Histogram updates ───────────────────────────────────────────────

    pub fn observe_slippage(&self, venue: &str, pct: f64) {
        self.slippage
            .write()
            .entry(venue.to_string())
            .or_default()
            .observe(pct);
    }

    // ── Health ──────────────────────────────────────────────────────────

    pub fn set_shard_state(&self, shard: &str, state: &str) {
        self.shard_states
            .write()
            .insert(shard.to_string(), state.to_string());
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: "ok",
            uptime_secs: self.start.map_or(0, |s| s.elapsed().as_secs()),
            shards: self.shard_states.read().clone(),
            active_connections: self.active_connections.read().clone(),
        }
    }

    // ── Exposition ──────────────────────────────────────────────────────

    /// Render the whole registry in Prometheus text format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::with_capacity(4096);

        out.push_str("# TYPE orca_alerts_total counter\n");
        for ((severity, venue, kind), count) in self.alerts_total.read().iter() {
            out.push_str(&format!(
                "orca_alerts_total{{severity=\"{severity}\",venue=\"{venue}\",kind=\"{kind}\"}} {count}\n"
            ));
        }

        out.push_str("# TYPE orca_trades_processed_total counter\n");
        for (venue, count) in self.trades_processed.read().iter() {
            out.push_str(&format!(
                "orca_trades_processed_total{{venue=\"{venue}\"}} {count}\n"
            ));
        }

        out.push_str("# TYPE orca_reconnects_total counter\n");
        for (shard, count) in self.reconnects_total.read().iter() {
            out.push_str(&format!(
                "orca_reconnects_total{{shard=\"{shard}\"}} {count}\n"
            ));
        }

        out.push_str("# TYPE orca_sink_dropped_total counter\n");
        for (sink, count) in self.sink_dropped_total.read().iter() {
            out.push_str(&format!(
                "orca_sink_dropped_total{{sink=\"{sink}\"}} {count}\n"
            ));
        }

        out.push_str("# TYPE orca_push_rate_limited_total counter\n");
        out.push_str(&format!(
            "orca_push_rate_limited_total {}\n",
            self.push_rate_limited_total.load(Ordering::Relaxed)
        ));

        out.push_str("# TYPE orca_protocol_errors_total counter\n");
        out.push_str(&format!(
            "orca_protocol_errors_total {}\n",
            self.protocol_errors_total.load(Ordering::Relaxed)
        ));

        out.push_str("# TYPE orca_depth_resyncs_total counter\n");
        out.push_str(&format!(
            "orca_depth_resyncs_total {}\n",
            self.depth_resyncs_total.load(Ordering::Relaxed)
        ));

        out.push_str("# TYPE orca_wbi_suppressed_total counter\n");
        out.push_str(&format!(
            "orca_wbi_suppressed_total {}\n",
            self.wbi_suppressed_total.load(Ordering::Relaxed)
        ));

        out.push_str("# TYPE orca_active_connections gauge\n");
        for (venue, count) in self.active_connections.read().iter() {
            out.push_str(&format!(
                "orca_active_connections{{venue=\"{venue}\"}} {count}\n"
            ));
        }

        out.push_str("# TYPE orca_book_levels gauge\n");
        for ((venue, side), levels) in self.book_levels.read().iter() {
            out.push_str(&format!(
                "orca_book_levels{{venue=\"{venue}\",side=\"{side}\"}} {levels}\n"
            ));
        }

        out.push_str("# TYPE orca_trades_per_sec gauge\n");
        out.push_str(&format!("orca_trades_per_sec {}\n", *self.trades_per_sec.read()));

        out.push_str("# TYPE orca_slippage_pct histogram\n");
        for (venue, hist) in self.slippage.read().iter() {
            for (i, &bound) in SLIPPAGE_BUCKETS.iter().enumerate() {
                let count = hist.bucket_counts.get(i).copied().unwrap_or(0);
                out.push_str(&format!(
                    "orca_slippage_pct_bucket{{venue=\"{venue}\",le=\"{bound}\"}} {count}\n"
                ));
            }
            out.push_str(&format!(
                "orca_slippage_pct_bucket{{venue=\"{venue}\",le=\"+Inf\"}} {}\n",
                hist.count
            ));
            out.push_str(&format!(
                "orca_slippage_pct_sum{{venue=\"{venue}\"}} {}\n",
                hist.sum
            ));
            out.push_str(&format!(
                "orca_slippage_pct_count{{venue=\"{venue}\"}} {}\n",
                hist.count
            ));
        }

        out
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = Metrics::new();
        m.inc_alert(Severity::High, "binance", "trade");
        m.inc_alert(Severity::High, "binance", "trade");
        m.inc_alert(Severity::Low, "binance", "basis");
        m.inc_trades("binance", 5);
        m.inc_reconnect("binance-spot-0");

        let text = m.render_prometheus();
        assert!(text.contains(
            "orca_alerts_total{severity=\"high\",venue=\"binance\",kind=\"trade\"} 2"
        ));
        assert!(text.contains("orca_trades_processed_total{venue=\"binance\"} 5"));
        assert!(text.contains("orca_reconnects_total{shard=\"binance-spot-0\"} 1"));
    }

    #[test]
    fn histogram_buckets_cumulative_within_bounds() {
        let m = Metrics::new();
        m.observe_slippage("binance", 0.3);
        m.observe_slippage("binance", 3.0);
        m.observe_slippage("binance", 50.0); // beyond all finite buckets

        let text = m.render_prometheus();
        // 0.3 lands in le=0.5 and above; 3.0 first lands in le=5.
        assert!(text.contains("orca_slippage_pct_bucket{venue=\"binance\",le=\"0.5\"} 1"));
        assert!(text.contains("orca_slippage_pct_bucket{venue=\"binance\",le=\"5\"} 2"));
        assert!(text.contains("orca_slippage_pct_bucket{venue=\"binance\",le=\"+Inf\"} 3"));
        assert!(text.contains("orca_slippage_pct_count{venue=\"binance\"} 3"));
    }

    #[test]
    fn gauges_and_health() {
        let m = Metrics::new();
        m.add_connections("binance", 3);
        m.add_connections("binance", -1);
        m.set_shard_state("binance-spot-0", "streaming");

        let health = m.health();
        assert_eq!(health.status, "ok");
        assert_eq!(health.active_connections.get("binance"), Some(&2));
        assert_eq!(
            health.shards.get("binance-spot-0").map(String::as_str),
            Some("streaming")
        );
    }

    #[test]
    fn sink_drop_counter() {
        let m = Metrics::new();
        assert_eq!(m.sink_dropped("push"), 0);
        m.inc_sink_dropped("push");
        m.inc_sink_dropped("push");
        assert_eq!(m.sink_dropped("push"), 2);
    }
}
