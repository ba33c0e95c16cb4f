// =============================================================================
// Price/Volume History — wall-time-bounded rolling series per symbol
// =============================================================================
//
// Backs the pump/dump, whale, and stop-hunt detectors.  Records are appended
// on every accepted trade or mid change and pruned by age; the retention
// window is sized to the longest detector lookback (one hour).
// =============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

/// A single observation: timestamp, price, and taker volume since the last
/// record (zero for pure mid updates).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceRecord {
    pub ts: DateTime<Utc>,
    pub price: f64,
    pub volume: f64,
}

/// Rolling price/volume series bounded by wall time and a hard count cap.
#[derive(Debug)]
pub struct PriceHistory {
    records: VecDeque<PriceRecord>,
    retention: Duration,
    max_records: usize,
}

impl PriceHistory {
    pub fn new(retention: Duration, max_records: usize) -> Self {
        Self {
            records: VecDeque::new(),
            retention,
            max_records: max_records.max(1),
        }
    }

    /// One hour retention with a generous count cap; the standard detector
    /// configuration.
    pub fn one_hour() -> Self {
        Self::new(Duration::hours(1), 3600)
    }

    pub fn push(&mut self, ts: DateTime<Utc>, price: f64, volume: f64) {
        if price <= 0.0 {
            return;
        }
        self.records.push_back(PriceRecord { ts, price, volume });
        self.prune(ts);
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.retention;
        while let Some(front) = self.records.front() {
            if front.ts < cutoff {
                self.records.pop_front();
            } else {
                break;
            }
        }
        while self.records.len() > self.max_records {
            self.records.pop_front();
        }
    }

    /// Clear everything (used by the reconnect resync barrier).
    pub fn reset(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&PriceRecord> {
        self.records.back()
    }

    /// All records at or after `since`, oldest first.
    pub fn since(&self, since: DateTime<Utc>) -> impl Iterator<Item = &PriceRecord> {
        self.records.iter().filter(move |r| r.ts >= since)
    }

    /// Lowest price within the trailing `window` ending at `now`.
    pub fn min_price(&self, now: DateTime<Utc>, window: Duration) -> Option<f64> {
        self.since(now - window)
            .map(|r| r.price)
            .fold(None, |acc, p| Some(acc.map_or(p, |a: f64| a.min(p))))
    }

    /// Highest price within the trailing `window` ending at `now`.
    pub fn max_price(&self, now: DateTime<Utc>, window: Duration) -> Option<f64> {
        self.since(now - window)
            .map(|r| r.price)
            .fold(None, |acc, p| Some(acc.map_or(p, |a: f64| a.max(p))))
    }

    /// Mean per-record volume within the trailing `window`.
    pub fn avg_volume(&self, now: DateTime<Utc>, window: Duration) -> f64 {
        let mut sum = 0.0;
        let mut count = 0usize;
        for r in self.since(now - window) {
            sum += r.volume;
            count += 1;
        }
        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(base: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
        base + Duration::seconds(secs)
    }

    #[test]
    fn window_min_max() {
        let base = Utc::now();
        let mut h = PriceHistory::one_hour();
        h.push(t(base, 0), 100.0, 1.0);
        h.push(t(base, 10), 95.0, 1.0);
        h.push(t(base, 20), 105.0, 1.0);

        let now = t(base, 30);
        assert_eq!(h.min_price(now, Duration::seconds(60)), Some(95.0));
        assert_eq!(h.max_price(now, Duration::seconds(60)), Some(105.0));
        // Narrow window only sees the last record.
        assert_eq!(h.min_price(now, Duration::seconds(15)), Some(105.0));
    }

    #[test]
    fn age_pruning() {
        let base = Utc::now();
        let mut h = PriceHistory::new(Duration::seconds(60), 1000);
        h.push(t(base, 0), 100.0, 1.0);
        h.push(t(base, 30), 101.0, 1.0);
        assert_eq!(h.len(), 2);
        // A push 90s in evicts the first record.
        h.push(t(base, 90), 102.0, 1.0);
        assert_eq!(h.len(), 2);
        assert_eq!(h.min_price(t(base, 90), Duration::seconds(120)), Some(101.0));
    }

    #[test]
    fn count_cap() {
        let base = Utc::now();
        let mut h = PriceHistory::new(Duration::hours(1), 3);
        for i in 0..10 {
            h.push(t(base, i), 100.0 + i as f64, 1.0);
        }
        assert_eq!(h.len(), 3);
        assert_eq!(h.last().unwrap().price, 109.0);
    }

    #[test]
    fn avg_volume_over_window() {
        let base = Utc::now();
        let mut h = PriceHistory::one_hour();
        h.push(t(base, 0), 100.0, 10.0);
        h.push(t(base, 1), 100.0, 20.0);
        h.push(t(base, 2), 100.0, 30.0);
        let avg = h.avg_volume(t(base, 3), Duration::seconds(60));
        assert!((avg - 20.0).abs() < 1e-9);
    }

    #[test]
    fn zero_price_ignored() {
        let mut h = PriceHistory::one_hour();
        h.push(Utc::now(), 0.0, 1.0);
        assert!(h.is_empty());
    }
}
