// =============================================================================
// VWAP-Slippage Filter — per-symbol adaptive P95 thresholds
// =============================================================================
//
// Each symbol keeps an ordered multiset of recent slippage observations with
// both a sample-count cap and a wall-time TTL.  The multiset is a Fenwick
// (binary-indexed) tree over fixed-resolution percentage bins: insert and
// remove are O(log B), the percentile is one descending walk of the tree.
// A parallel FIFO keyed by timestamp drives TTL eviction.
//
// Below `min_samples` the filter falls back to conservative static
// thresholds (tighter for majors); above it, threshold = max(P95, floor).
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Bin width in percentage points.
const BIN_RESOLUTION: f64 = 0.01;
/// Highest representable slippage; anything above lands in the last bin.
const MAX_SLIPPAGE_PCT: f64 = 50.0;
const BIN_COUNT: usize = (MAX_SLIPPAGE_PCT / BIN_RESOLUTION) as usize + 1;

// =============================================================================
// Order-statistics bins
// =============================================================================

/// Fenwick tree of observation counts over slippage bins.
#[derive(Debug, Clone)]
struct SampleBins {
    tree: Vec<u32>,
    len: usize,
}

impl SampleBins {
    fn new() -> Self {
        Self {
            tree: vec![0; BIN_COUNT + 1],
            len: 0,
        }
    }

    fn bin_of(value: f64) -> usize {
        let clamped = value.clamp(0.0, MAX_SLIPPAGE_PCT);
        ((clamped / BIN_RESOLUTION) as usize).min(BIN_COUNT - 1)
    }

    fn value_of(bin: usize) -> f64 {
        bin as f64 * BIN_RESOLUTION
    }

    fn add(&mut self, bin: usize, delta: i32) {
        let mut i = bin + 1;
        while i <= BIN_COUNT {
            let cur = self.tree[i] as i64 + delta as i64;
            self.tree[i] = cur.max(0) as u32;
            i += i & i.wrapping_neg();
        }
        if delta > 0 {
            self.len += delta as usize;
        } else {
            self.len = self.len.saturating_sub((-delta) as usize);
        }
    }

    /// Bin holding the sample of rank `k` (0-based), by descending walk of
    /// the tree: find the largest prefix whose count stays <= k.
    fn rank_bin(&self, k: usize) -> usize {
        let mut remaining = k as u64;
        let mut pos = 0usize;
        let mut bit = BIN_COUNT.next_power_of_two();
        if bit > BIN_COUNT {
            bit >>= 1;
        }
        while bit > 0 {
            let next = pos + bit;
            if next <= BIN_COUNT && (self.tree[next] as u64) <= remaining {
                remaining -= self.tree[next] as u64;
                pos = next;
            }
            bit >>= 1;
        }
        pos.min(BIN_COUNT - 1)
    }

    /// Value at `percentile` (0..100), or None when empty.
    fn percentile(&self, percentile: f64) -> Option<f64> {
        if self.len == 0 {
            return None;
        }
        let idx = ((self.len as f64 * percentile / 100.0) as usize).min(self.len - 1);
        Some(Self::value_of(self.rank_bin(idx)))
    }
}

// =============================================================================
// Per-symbol stats
// =============================================================================

/// Ordered multiset of one symbol's recent slippage samples.
#[derive(Debug)]
pub struct SlippageStats {
    bins: SampleBins,
    /// FIFO of (timestamp, bin) for TTL + count eviction.
    queue: VecDeque<(DateTime<Utc>, usize)>,
    max_size: usize,
    ttl: Duration,
    pub last_alert: Option<DateTime<Utc>>,
    pub alerts_in_window: u32,
}

impl SlippageStats {
    fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            bins: SampleBins::new(),
            queue: VecDeque::new(),
            max_size,
            ttl,
            last_alert: None,
            alerts_in_window: 0,
        }
    }

    pub fn add(&mut self, value: f64, now: DateTime<Utc>) {
        let bin = SampleBins::bin_of(value);
        self.bins.add(bin, 1);
        self.queue.push_back((now, bin));

        if self.queue.len() > self.max_size {
            if let Some((_, old_bin)) = self.queue.pop_front() {
                self.bins.add(old_bin, -1);
            }
        }
        self.evict_expired(now);
    }

    fn evict_expired(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.ttl;
        while let Some(&(ts, bin)) = self.queue.front() {
            if ts < cutoff {
                self.queue.pop_front();
                self.bins.add(bin, -1);
            } else {
                break;
            }
        }
    }

    pub fn percentile(&mut self, percentile: f64, now: DateTime<Utc>) -> Option<f64> {
        self.evict_expired(now);
        self.bins.percentile(percentile)
    }

    pub fn count(&self) -> usize {
        self.queue.len()
    }
}

// =============================================================================
// Filter
// =============================================================================

/// Tunables; defaults match the production smart-filter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlippageFilterConfig {
    pub window_size: usize,
    pub ttl_secs: i64,
    pub percentile: f64,
    pub min_samples: usize,
    pub cooldown_secs: f64,
    pub fallback_major: f64,
    pub fallback_default: f64,
    pub floor_major: f64,
    pub floor_default: f64,
}

impl Default for SlippageFilterConfig {
    fn default() -> Self {
        Self {
            window_size: 1000,
            ttl_secs: 3600,
            percentile: 95.0,
            min_samples: 100,
            cooldown_secs: 60.0,
            fallback_major: 1.5,
            fallback_default: 2.0,
            floor_major: 0.5,
            floor_default: 1.0,
        }
    }
}

/// Admission decision with its human-readable reasoning.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterDecision {
    pub should_alert: bool,
    pub threshold: f64,
    pub reason: String,
}

/// Per-symbol adaptive slippage filter.
pub struct SlippageFilter {
    config: SlippageFilterConfig,
    stats: HashMap<String, SlippageStats>,
}

impl SlippageFilter {
    pub fn new(config: SlippageFilterConfig) -> Self {
        Self {
            config,
            stats: HashMap::new(),
        }
    }

    fn entry(&mut self, symbol: &str) -> &mut SlippageStats {
        let max_size = self.config.window_size;
        let ttl = Duration::seconds(self.config.ttl_secs);
        self.stats
            .entry(symbol.to_string())
            .or_insert_with(|| SlippageStats::new(max_size, ttl))
    }

    /// Record one observation.
    pub fn record(&mut self, symbol: &str, slippage_pct: f64, now: DateTime<Utc>) {
        self.entry(symbol).add(slippage_pct, now);
    }

    pub fn sample_count(&self, symbol: &str) -> usize {
        self.stats.get(symbol).map_or(0, SlippageStats::count)
    }

    /// Current threshold and its source description.
    pub fn dynamic_threshold(
        &mut self,
        symbol: &str,
        is_major: bool,
        now: DateTime<Utc>,
    ) -> (f64, String) {
        let cfg = self.config.clone();
        let stats = self.entry(symbol);

        if stats.count() < cfg.min_samples {
            let fallback = if is_major {
                cfg.fallback_major
            } else {
                cfg.fallback_default
            };
            let tag = if is_major { "major" } else { "default" };
            return (fallback, format!("fallback({tag}, n={})", stats.count()));
        }

        match stats.percentile(cfg.percentile, now) {
            Some(p) => {
                let floor = if is_major { cfg.floor_major } else { cfg.floor_default };
                let threshold = p.max(floor);
                (threshold, format!("P{:.0}(n={})", cfg.percentile, stats.count()))
            }
            None => {
                let fallback = if is_major {
                    cfg.fallback_major
                } else {
                    cfg.fallback_default
                };
                (fallback, "fallback(no_data)".to_string())
            }
        }
    }

    /// Admission check: cooldown first, then the adaptive threshold.
    pub fn should_alert(
        &mut self,
        symbol: &str,
        slippage_pct: f64,
        is_major: bool,
        now: DateTime<Utc>,
    ) -> FilterDecision {
        let cooldown = self.config.cooldown_secs;
        {
            let stats = self.entry(symbol);
            if let Some(last) = stats.last_alert {
                let elapsed = (now - last).num_milliseconds() as f64 / 1000.0;
                if elapsed < cooldown {
                    return FilterDecision {
                        should_alert: false,
                        threshold: 0.0,
                        reason: format!("cooldown({:.0}s)", cooldown - elapsed),
                    };
                }
            }
        }

        let (threshold, source) = self.dynamic_threshold(symbol, is_major, now);

        if slippage_pct >= threshold {
            let stats = self.entry(symbol);
            stats.last_alert = Some(now);
            stats.alerts_in_window += 1;
            debug!(symbol, slippage_pct, threshold, source = %source, "slippage admitted");
            FilterDecision {
                should_alert: true,
                threshold,
                reason: format!("{slippage_pct:.2}% >= {threshold:.2}% [{source}]"),
            }
        } else {
            FilterDecision {
                should_alert: false,
                threshold,
                reason: format!("{slippage_pct:.2}% < {threshold:.2}% [{source}]"),
            }
        }
    }
}

impl Default for SlippageFilter {
    fn default() -> Self {
        Self::new(SlippageFilterConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bins_percentile_matches_sorted_order() {
        let mut bins = SampleBins::new();
        // 100 samples 0.01..=1.00.
        for i in 1..=100 {
            bins.add(SampleBins::bin_of(i as f64 * 0.01), 1);
        }
        // Rank 95 of 100 (0-based) is the 96th value = 0.96.
        let p95 = bins.percentile(95.0).unwrap();
        assert!((p95 - 0.96).abs() < BIN_RESOLUTION + 1e-9, "p95 {p95}");
        let p50 = bins.percentile(50.0).unwrap();
        assert!((p50 - 0.51).abs() < BIN_RESOLUTION + 1e-9, "p50 {p50}");
    }

    #[test]
    fn bins_remove_shifts_percentile() {
        let mut bins = SampleBins::new();
        bins.add(SampleBins::bin_of(1.0), 1);
        bins.add(SampleBins::bin_of(10.0), 1);
        assert!((bins.percentile(95.0).unwrap() - 10.0).abs() < BIN_RESOLUTION + 1e-9);
        bins.add(SampleBins::bin_of(10.0), -1);
        assert!((bins.percentile(95.0).unwrap() - 1.0).abs() < BIN_RESOLUTION + 1e-9);
    }

    #[test]
    fn cold_start_uses_fallback() {
        let mut f = SlippageFilter::default();
        let now = Utc::now();
        let (t, src) = f.dynamic_threshold("BTC-USDT", true, now);
        assert!((t - 1.5).abs() < f64::EPSILON);
        assert!(src.starts_with("fallback(major"));

        let (t, src) = f.dynamic_threshold("PEPE-USDT", false, now);
        assert!((t - 2.0).abs() < f64::EPSILON);
        assert!(src.starts_with("fallback(default"));
    }

    #[test]
    fn adaptive_threshold_after_min_samples() {
        let mut f = SlippageFilter::default();
        let now = Utc::now();
        for i in 0..200 {
            f.record("ETH-USDT", 0.1 + (i % 10) as f64 * 0.01, now);
        }
        let (t, src) = f.dynamic_threshold("ETH-USDT", true, now);
        // P95 of the tight cluster is ~0.19 but the major floor is 0.5.
        assert!((t - 0.5).abs() < f64::EPSILON, "threshold {t} ({src})");
        assert!(src.starts_with("P95"));
    }

    #[test]
    fn percentile_drives_threshold_above_floor() {
        let mut f = SlippageFilter::default();
        let now = Utc::now();
        for i in 0..200 {
            f.record("XYZ-USDT", 1.0 + (i % 100) as f64 * 0.05, now);
        }
        let (t, _) = f.dynamic_threshold("XYZ-USDT", false, now);
        assert!(t > 4.5 && t < 6.1, "threshold {t}");
    }

    #[test]
    fn ttl_eviction_returns_to_fallback() {
        let mut f = SlippageFilter::default();
        let t0 = Utc::now();
        for _ in 0..150 {
            f.record("ABC-USDT", 3.0, t0);
        }
        assert_eq!(f.sample_count("ABC-USDT"), 150);

        // Two hours later every sample is stale.
        let later = t0 + Duration::hours(2);
        let (t, src) = f.dynamic_threshold("ABC-USDT", false, later);
        assert!((t - 2.0).abs() < f64::EPSILON, "threshold {t}");
        assert!(src.starts_with("fallback"));
    }

    #[test]
    fn count_cap_evicts_oldest() {
        let mut cfg = SlippageFilterConfig::default();
        cfg.window_size = 10;
        let mut f = SlippageFilter::new(cfg);
        let now = Utc::now();
        for i in 0..25 {
            f.record("S", i as f64 * 0.1, now);
        }
        assert_eq!(f.sample_count("S"), 10);
    }

    #[test]
    fn cooldown_blocks_repeat_alert() {
        let mut f = SlippageFilter::default();
        let now = Utc::now();

        let d1 = f.should_alert("S", 5.0, false, now);
        assert!(d1.should_alert, "{}", d1.reason);

        let d2 = f.should_alert("S", 6.0, false, now + Duration::seconds(10));
        assert!(!d2.should_alert);
        assert!(d2.reason.starts_with("cooldown"));

        let d3 = f.should_alert("S", 6.0, false, now + Duration::seconds(61));
        assert!(d3.should_alert, "{}", d3.reason);
    }

    #[test]
    fn below_threshold_not_admitted() {
        let mut f = SlippageFilter::default();
        let d = f.should_alert("S", 0.3, false, Utc::now());
        assert!(!d.should_alert);
        assert!(d.reason.contains('<'));
    }
}
