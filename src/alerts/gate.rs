// =============================================================================
// Alert Gate — admission, deduplication, aggregation, escalation
// =============================================================================
//
// The single producer of finished alerts.  Candidates flow in from the
// detector pipeline and pass through:
//
//   1. Deduplication on (venue, market, symbol, kind, side, price bucket)
//      within a cooldown.  Trades bucket by floor(price); walls by the
//      price rounded to 4 decimals.
//   2. Aggregation: Low/Medium candidates join a windowed bucket per
//      (venue, market, symbol) and emit one summary on rotation or sweep.
//      High bypasses aggregation and emits immediately.
//   3. Escalation: a bucket whose members include a High emits as High
//      regardless of count (only reachable via flush ordering, but the
//      invariant is kept regardless).
//
// All timestamps come from the caller; the gate holds no clock.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::types::{Alert, AlertKind, Severity};

// =============================================================================
// AlertBucket
// =============================================================================

/// Aggregation bucket for one (venue, market, symbol).
#[derive(Debug, Clone)]
pub struct AlertBucket {
    first: Alert,
    pub first_ts: DateTime<Utc>,
    pub last_ts: DateTime<Utc>,
    pub count: usize,
    pub total_value: f64,
    pub max_slippage: f64,
    pub top_severity: Severity,
    top_kind: AlertKind,
}

impl AlertBucket {
    fn new(alert: Alert) -> Self {
        let mut bucket = Self {
            first_ts: alert.ts,
            last_ts: alert.ts,
            count: 0,
            total_value: 0.0,
            max_slippage: 0.0,
            top_severity: alert.severity,
            top_kind: alert.kind,
            first: alert.clone(),
        };
        bucket.add(alert);
        bucket
    }

    fn add(&mut self, alert: Alert) {
        self.count += 1;
        self.total_value += alert.value;
        self.max_slippage = self.max_slippage.max(alert.slippage_pct);
        if alert.ts < self.first_ts {
            self.first_ts = alert.ts;
        }
        if alert.ts > self.last_ts {
            self.last_ts = alert.ts;
        }
        if alert.severity > self.top_severity {
            self.top_severity = alert.severity;
            self.top_kind = alert.kind;
        }
    }

    fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.first_ts
    }

    /// Collapse the bucket into one summary alert.
    fn into_summary(self) -> Alert {
        if self.count == 1 {
            return self.first;
        }
        let mut summary = self.first;
        summary.ts = self.first_ts;
        summary.severity = self.top_severity;
        summary.kind = self.top_kind;
        summary.value = self.total_value;
        summary.slippage_pct = self.max_slippage;
        summary.message = format!(
            "{} | aggregated x{} | total ${:.0} | max slippage {:.2}%",
            summary.symbol, self.count, self.total_value, self.max_slippage
        );
        summary
    }
}

// =============================================================================
// AlertGate
// =============================================================================

pub struct AlertGate {
    window: Duration,
    dedup_cooldown: Duration,
    buckets: HashMap<String, AlertBucket>,
    dedup: HashMap<String, DateTime<Utc>>,
    /// Candidates dropped by deduplication.
    pub deduped_count: u64,
}

impl AlertGate {
    pub fn new(window_secs: f64, dedup_cooldown_secs: f64) -> Self {
        Self {
            window: Duration::milliseconds((window_secs * 1000.0) as i64),
            dedup_cooldown: Duration::milliseconds((dedup_cooldown_secs * 1000.0) as i64),
            buckets: HashMap::new(),
            dedup: HashMap::new(),
            deduped_count: 0,
        }
    }

    fn bucket_key(alert: &Alert) -> String {
        format!("{}:{}:{}", alert.venue, alert.market, alert.symbol)
    }

    fn dedup_key(alert: &Alert) -> String {
        // Price bucket: integral floor for trades, 4-decimal rounding for
        // walls, exact otherwise.
        let price_bucket = match alert.kind {
            AlertKind::Trade => format!("{}", alert.price.floor() as i64),
            AlertKind::PriceWall => format!("{:.4}", alert.price),
            _ => format!("{}", alert.price),
        };
        let side = alert.side.map(|s| s.to_string()).unwrap_or_default();
        format!(
            "{}:{}:{}:{}:{}:{}",
            alert.venue, alert.market, alert.symbol, alert.kind, side, price_bucket
        )
    }

    /// Submit one candidate.  Returns the alerts ready for dispatch (empty
    /// while a candidate is absorbed into a bucket).
    pub fn submit(&mut self, alert: Alert, now: DateTime<Utc>) -> Vec<Alert> {
        // Dedup within cooldown.
        let dkey = Self::dedup_key(&alert);
        if let Some(&last) = self.dedup.get(&dkey) {
            if now - last < self.dedup_cooldown {
                self.deduped_count += 1;
                debug!(key = %dkey, "alert deduplicated");
                return Vec::new();
            }
        }
        self.dedup.insert(dkey, now);
        self.prune_dedup(now);

        // High severity bypasses aggregation.
        if alert.severity == Severity::High {
            return vec![alert];
        }

        let key = Self::bucket_key(&alert);
        let window_closed = self
            .buckets
            .get(&key)
            .map_or(false, |bucket| bucket.age(now) >= self.window);

        if window_closed {
            // Window closed: emit the summary, start a new bucket.
            let closed = self.buckets.remove(&key).expect("bucket exists");
            self.buckets.insert(key, AlertBucket::new(alert));
            return vec![closed.into_summary()];
        }

        match self.buckets.get_mut(&key) {
            Some(bucket) => bucket.add(alert),
            None => {
                self.buckets.insert(key, AlertBucket::new(alert));
            }
        }
        Vec::new()
    }

    /// Close every bucket whose window elapsed.  Call periodically so quiet
    /// symbols still flush their summaries.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<Alert> {
        let expired: Vec<String> = self
            .buckets
            .iter()
            .filter(|(_, b)| b.age(now) >= self.window)
            .map(|(k, _)| k.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|k| self.buckets.remove(&k))
            .map(AlertBucket::into_summary)
            .collect()
    }

    /// Close all buckets unconditionally (shutdown path).
    pub fn flush(&mut self) -> Vec<Alert> {
        let buckets: Vec<AlertBucket> = self.buckets.drain().map(|(_, b)| b).collect();
        buckets.into_iter().map(AlertBucket::into_summary).collect()
    }

    /// Candidates currently absorbed into open buckets.
    pub fn pending_count(&self) -> usize {
        self.buckets.values().map(|b| b.count).sum()
    }

    fn prune_dedup(&mut self, now: DateTime<Utc>) {
        // Bound the dedup map: drop entries past the cooldown once it grows.
        if self.dedup.len() > 10_000 {
            let cooldown = self.dedup_cooldown;
            self.dedup.retain(|_, &mut ts| now - ts < cooldown);
        }
    }
}
