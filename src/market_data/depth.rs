// =============================================================================
// Depth Ladder — per-(venue, symbol) order book state
// =============================================================================
//
// Two ordered sides backed by BTreeMap; bids iterate in reverse for
// best-first order.  Supports wholesale snapshot replacement (small-depth
// streams) and incremental diffs (`size = 0` removes a level) with sequence
// tracking.  A detected gap flips the ladder into resync mode: diffs are
// buffered (bounded) until a REST snapshot arrives and the buffer replays
// on top of it.
//
// A crossed book (best bid >= best ask) is a transient state; queries that
// feed detectors report it so the caller can suppress until it clears.
// =============================================================================

use std::collections::BTreeMap;
use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::types::{DepthEvent, Side};

/// Diffs buffered during resync before the ladder declares the stream broken.
const RESYNC_BUFFER_CAP: usize = 512;

/// Price wrapper giving BTreeMap a total order over positive price levels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceKey(pub f64);

impl Eq for PriceKey {}

impl PartialOrd for PriceKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriceKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .partial_cmp(&other.0)
            .unwrap_or(std::cmp::Ordering::Equal)
    }
}

/// Errors surfaced by ladder updates and queries.
#[derive(Debug, Clone, PartialEq)]
pub enum DepthError {
    /// Incremental update skipped sequence numbers; a snapshot is required.
    SequenceGap { expected: u64, got: u64 },
    /// The resync diff buffer overflowed; the stream must reconnect.
    ResyncOverflow,
    /// Not enough levels beyond `skip_top` for a meaningful VWAP.
    InsufficientDepth,
    /// Both sides exist but best bid >= best ask.
    CrossedBook,
    /// The requested side is empty.
    EmptySide,
}

impl std::fmt::Display for DepthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SequenceGap { expected, got } => {
                write!(f, "sequence gap: expected <= {expected}, got {got}")
            }
            Self::ResyncOverflow => write!(f, "resync buffer overflow"),
            Self::InsufficientDepth => write!(f, "insufficient depth"),
            Self::CrossedBook => write!(f, "crossed book"),
            Self::EmptySide => write!(f, "empty side"),
        }
    }
}

impl std::error::Error for DepthError {}

/// Result of a hypothetical market-order sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VwapFill {
    pub vwap: f64,
    /// First level price after the skip; the slippage reference.
    pub reference_price: f64,
    pub filled_notional: f64,
}

/// One symbol's bid/ask ladder with sequence tracking.
#[derive(Debug)]
pub struct DepthLadder {
    bids: BTreeMap<PriceKey, f64>,
    asks: BTreeMap<PriceKey, f64>,
    /// Highest applied update id; 0 before the first message.
    seq: u64,
    /// Levels retained per side.
    depth_cap: usize,
    /// Buffered diffs while waiting for a REST snapshot.
    resync_buffer: Option<VecDeque<DepthEvent>>,
    pub last_update: DateTime<Utc>,
}

impl DepthLadder {
    pub fn new(depth_cap: usize) -> Self {
        Self {
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            seq: 0,
            depth_cap: depth_cap.max(1),
            resync_buffer: None,
            last_update: Utc::now(),
        }
    }

    // -------------------------------------------------------------------------
    // Updates
    // -------------------------------------------------------------------------

    /// Replace both sides wholesale with a received top-K snapshot.
    /// Idempotent: applying the same snapshot twice yields the same ladder.
    pub fn apply_snapshot(&mut self, bids: &[(f64, f64)], asks: &[(f64, f64)], seq: u64, ts: DateTime<Utc>) {
        self.bids.clear();
        self.asks.clear();
        for &(p, s) in bids {
            if p > 0.0 && s > 0.0 {
                self.bids.insert(PriceKey(p), s);
            }
        }
        for &(p, s) in asks {
            if p > 0.0 && s > 0.0 {
                self.asks.insert(PriceKey(p), s);
            }
        }
        self.trim();
        self.seq = seq;
        self.last_update = ts;
        self.resync_buffer = None;
    }

    /// Apply an incremental diff on top of the current state.
    ///
    /// Returns `SequenceGap` when updates were missed (caller should start a
    /// resync), silently ignores stale diffs entirely below the current seq.
    pub fn apply_diff(&mut self, event: &DepthEvent) -> Result<(), DepthError> {
        if self.resyncing() {
            return self.buffer_diff(event.clone());
        }

        let first = event.first_seq.unwrap_or(self.seq + 1);
        let last = event.last_seq.unwrap_or(first);

        if last <= self.seq {
            // Entirely stale; already reflected.
            return Ok(());
        }
        if self.seq > 0 && first > self.seq + 1 {
            return Err(DepthError::SequenceGap {
                expected: self.seq + 1,
                got: first,
            });
        }

        self.apply_levels(event);
        self.seq = last;
        self.last_update = event.ts;
        Ok(())
    }

    fn apply_levels(&mut self, event: &DepthEvent) {
        for &(p, s) in &event.bids {
            if p <= 0.0 {
                continue;
            }
            if s <= 0.0 {
                self.bids.remove(&PriceKey(p));
            } else {
                self.bids.insert(PriceKey(p), s);
            }
        }
        for &(p, s) in &event.asks {
            if p <= 0.0 {
                continue;
            }
            if s <= 0.0 {
                self.asks.remove(&PriceKey(p));
            } else {
                self.asks.insert(PriceKey(p), s);
            }
        }
        self.trim();
    }

    fn trim(&mut self) {
        // Bids: keep the highest `depth_cap` prices.
        while self.bids.len() > self.depth_cap {
            let lowest = *self.bids.keys().next().expect("non-empty");
            self.bids.remove(&lowest);
        }
        // Asks: keep the lowest `depth_cap` prices.
        while self.asks.len() > self.depth_cap {
            let highest = *self.asks.keys().next_back().expect("non-empty");
            self.asks.remove(&highest);
        }
    }

    // -------------------------------------------------------------------------
    // Resync protocol
    // -------------------------------------------------------------------------

    /// Begin buffering diffs until a snapshot arrives.
    pub fn begin_resync(&mut self) {
        if self.resync_buffer.is_none() {
            self.resync_buffer = Some(VecDeque::new());
        }
    }

    pub fn resyncing(&self) -> bool {
        self.resync_buffer.is_some()
    }

    fn buffer_diff(&mut self, event: DepthEvent) -> Result<(), DepthError> {
        let buf = self.resync_buffer.as_mut().expect("resyncing");
        if buf.len() >= RESYNC_BUFFER_CAP {
            self.resync_buffer = None;
            return Err(DepthError::ResyncOverflow);
        }
        buf.push_back(event);
        Ok(())
    }

    /// Install a REST snapshot and replay any buffered diffs newer than it.
    pub fn complete_resync(
        &mut self,
        snapshot_seq: u64,
        bids: &[(f64, f64)],
        asks: &[(f64, f64)],
        ts: DateTime<Utc>,
    ) {
        let buffered: Vec<DepthEvent> = self
            .resync_buffer
            .take()
            .map(|b| b.into_iter().collect())
            .unwrap_or_default();

        self.apply_snapshot(bids, asks, snapshot_seq, ts);

        for event in buffered {
            let last = event.last_seq.unwrap_or(0);
            if last <= snapshot_seq {
                continue;
            }
            self.apply_levels(&event);
            self.seq = last;
            self.last_update = event.ts;
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn best(&self, side: Side) -> Option<f64> {
        match side {
            Side::Buy => self.bids.keys().next_back().map(|k| k.0),
            Side::Sell => self.asks.keys().next().map(|k| k.0),
        }
    }

    /// Mid price; `None` when either side is empty or the book is crossed.
    pub fn mid(&self) -> Option<f64> {
        let (bid, ask) = (self.best(Side::Buy)?, self.best(Side::Sell)?);
        if bid >= ask {
            return None;
        }
        Some((bid + ask) / 2.0)
    }

    pub fn spread(&self) -> Option<f64> {
        let (bid, ask) = (self.best(Side::Buy)?, self.best(Side::Sell)?);
        if bid >= ask {
            return None;
        }
        Some(ask - bid)
    }

    /// Both sides populated but best bid >= best ask.
    pub fn is_crossed(&self) -> bool {
        matches!(
            (self.best(Side::Buy), self.best(Side::Sell)),
            (Some(bid), Some(ask)) if bid >= ask
        )
    }

    /// Top `n` levels best-first: descending bids or ascending asks.
    pub fn top_n(&self, side: Side, n: usize) -> Vec<(f64, f64)> {
        match side {
            Side::Buy => self
                .bids
                .iter()
                .rev()
                .take(n)
                .map(|(k, &s)| (k.0, s))
                .collect(),
            Side::Sell => self
                .asks
                .iter()
                .take(n)
                .map(|(k, &s)| (k.0, s))
                .collect(),
        }
    }

    pub fn level_count(&self, side: Side) -> usize {
        match side {
            Side::Buy => self.bids.len(),
            Side::Sell => self.asks.len(),
        }
    }

    /// VWAP of a hypothetical sweep of `notional` quote currency against the
    /// given side, skipping the first `skip_top` levels to blunt spoof-tip
    /// artifacts.  Requires at least `min_levels` levels past the skip.
    pub fn vwap_for_notional(
        &self,
        side: Side,
        notional: f64,
        skip_top: usize,
        min_levels: usize,
    ) -> Result<VwapFill, DepthError> {
        if self.is_crossed() {
            return Err(DepthError::CrossedBook);
        }
        // A buy sweeps asks, a sell sweeps bids.
        let levels = match side {
            Side::Buy => self.top_n(Side::Sell, usize::MAX),
            Side::Sell => self.top_n(Side::Buy, usize::MAX),
        };
        if levels.is_empty() {
            return Err(DepthError::EmptySide);
        }
        if levels.len() < min_levels + skip_top {
            return Err(DepthError::InsufficientDepth);
        }

        let walk = &levels[skip_top..];
        let reference_price = walk[0].0;

        let mut remaining = notional;
        let mut total_qty = 0.0;
        let mut total_value = 0.0;

        for &(price, size) in walk {
            let level_value = price * size;
            if level_value >= remaining {
                let use_qty = remaining / price;
                total_qty += use_qty;
                total_value += remaining;
                remaining = 0.0;
                break;
            }
            total_qty += size;
            total_value += level_value;
            remaining -= level_value;
        }

        if total_qty <= 0.0 {
            return Err(DepthError::InsufficientDepth);
        }

        Ok(VwapFill {
            vwap: total_value / total_qty,
            reference_price,
            filled_notional: total_value,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarketType;

    fn ladder_with(bids: &[(f64, f64)], asks: &[(f64, f64)]) -> DepthLadder {
        let mut l = DepthLadder::new(50);
        l.apply_snapshot(bids, asks, 1, Utc::now());
        l
    }

    fn diff_event(bids: Vec<(f64, f64)>, asks: Vec<(f64, f64)>, first: u64, last: u64) -> DepthEvent {
        DepthEvent {
            ts: Utc::now(),
            venue: "binance".into(),
            market: MarketType::Spot,
            symbol: "BTCUSDT".into(),
            bids,
            asks,
            first_seq: Some(first),
            last_seq: Some(last),
            is_snapshot: false,
        }
    }

    #[test]
    fn best_mid_spread() {
        let l = ladder_with(&[(99.0, 1.0), (98.0, 2.0)], &[(101.0, 1.0), (102.0, 2.0)]);
        assert_eq!(l.best(Side::Buy), Some(99.0));
        assert_eq!(l.best(Side::Sell), Some(101.0));
        assert_eq!(l.mid(), Some(100.0));
        assert_eq!(l.spread(), Some(2.0));
        assert!(!l.is_crossed());
    }

    #[test]
    fn snapshot_is_idempotent() {
        let bids = [(99.0, 1.0), (98.0, 2.0)];
        let asks = [(101.0, 1.0)];
        let mut l = DepthLadder::new(50);
        l.apply_snapshot(&bids, &asks, 7, Utc::now());
        let first_top = l.top_n(Side::Buy, 10);
        l.apply_snapshot(&bids, &asks, 7, Utc::now());
        assert_eq!(l.top_n(Side::Buy, 10), first_top);
        assert_eq!(l.seq(), 7);
    }

    #[test]
    fn diff_inserts_and_removes() {
        let mut l = ladder_with(&[(99.0, 1.0)], &[(101.0, 1.0)]);
        l.apply_diff(&diff_event(
            vec![(99.5, 2.0), (99.0, 0.0)],
            vec![],
            2,
            2,
        ))
        .unwrap();
        assert_eq!(l.best(Side::Buy), Some(99.5));
        assert_eq!(l.level_count(Side::Buy), 1);
        assert_eq!(l.seq(), 2);
    }

    #[test]
    fn stale_diff_ignored() {
        let mut l = ladder_with(&[(99.0, 1.0)], &[(101.0, 1.0)]);
        l.apply_diff(&diff_event(vec![(50.0, 9.0)], vec![], 1, 1)).unwrap();
        assert_eq!(l.best(Side::Buy), Some(99.0));
    }

    #[test]
    fn gap_detected() {
        let mut l = ladder_with(&[(99.0, 1.0)], &[(101.0, 1.0)]);
        let err = l
            .apply_diff(&diff_event(vec![(99.5, 1.0)], vec![], 5, 6))
            .unwrap_err();
        assert_eq!(err, DepthError::SequenceGap { expected: 2, got: 5 });
    }

    #[test]
    fn resync_replays_newer_buffered_diffs() {
        let mut l = ladder_with(&[(99.0, 1.0)], &[(101.0, 1.0)]);
        l.begin_resync();
        // Buffered while waiting for the snapshot.
        l.apply_diff(&diff_event(vec![(99.4, 1.0)], vec![], 9, 9)).unwrap();
        l.apply_diff(&diff_event(vec![(99.6, 1.0)], vec![], 10, 11)).unwrap();

        // Snapshot covers through seq 9; only the second diff replays.
        l.complete_resync(9, &[(99.0, 2.0)], &[(101.0, 2.0)], Utc::now());
        assert!(!l.resyncing());
        assert_eq!(l.best(Side::Buy), Some(99.6));
        assert_eq!(l.seq(), 11);
        // The diff fully covered by the snapshot did not replay.
        assert!(l.top_n(Side::Buy, 10).iter().all(|&(p, _)| (p - 99.4).abs() > 1e-9));
    }

    #[test]
    fn resync_buffer_overflow() {
        let mut l = ladder_with(&[(99.0, 1.0)], &[(101.0, 1.0)]);
        l.begin_resync();
        let mut seq = 10;
        for _ in 0..RESYNC_BUFFER_CAP {
            l.apply_diff(&diff_event(vec![(99.5, 1.0)], vec![], seq, seq))
                .unwrap();
            seq += 1;
        }
        let err = l
            .apply_diff(&diff_event(vec![(99.5, 1.0)], vec![], seq, seq))
            .unwrap_err();
        assert_eq!(err, DepthError::ResyncOverflow);
        assert!(!l.resyncing());
    }

    #[test]
    fn crossed_book_detected_and_blocks_vwap() {
        let l = ladder_with(&[(102.0, 1.0)], &[(101.0, 1.0)]);
        assert!(l.is_crossed());
        assert_eq!(l.mid(), None);
        assert_eq!(
            l.vwap_for_notional(Side::Buy, 1000.0, 0, 1),
            Err(DepthError::CrossedBook)
        );
    }

    #[test]
    fn vwap_matches_reference_sweep() {
        // Asks 100 @ 100.00, 100 @ 100.50, 1000 @ 101.00; $100k buy sweep.
        let l = ladder_with(
            &[(99.0, 1.0)],
            &[(100.0, 100.0), (100.5, 100.0), (101.0, 1000.0)],
        );
        let fill = l.vwap_for_notional(Side::Buy, 100_000.0, 0, 3).unwrap();
        assert!((fill.reference_price - 100.0).abs() < 1e-9);
        let slippage = (fill.vwap - fill.reference_price) / fill.reference_price * 100.0;
        assert!((slippage - 0.85).abs() < 0.01, "slippage {slippage}");
    }

    #[test]
    fn vwap_skip_top_changes_reference() {
        let l = ladder_with(
            &[(99.0, 1.0)],
            &[(100.0, 1.0), (100.5, 100.0), (101.0, 1000.0)],
        );
        let fill = l.vwap_for_notional(Side::Buy, 10_000.0, 1, 2).unwrap();
        assert!((fill.reference_price - 100.5).abs() < 1e-9);
    }

    #[test]
    fn vwap_insufficient_depth() {
        let l = ladder_with(&[(99.0, 1.0)], &[(100.0, 1.0), (100.5, 1.0)]);
        assert_eq!(
            l.vwap_for_notional(Side::Buy, 1000.0, 1, 10),
            Err(DepthError::InsufficientDepth)
        );
    }

    #[test]
    fn sell_sweeps_bids() {
        let l = ladder_with(
            &[(100.0, 100.0), (99.5, 100.0), (99.0, 1000.0)],
            &[(101.0, 1.0)],
        );
        let fill = l.vwap_for_notional(Side::Sell, 15_000.0, 0, 2).unwrap();
        assert!((fill.reference_price - 100.0).abs() < 1e-9);
        assert!(fill.vwap < 100.0);
    }

    #[test]
    fn trim_keeps_best_levels() {
        let mut l = DepthLadder::new(2);
        l.apply_snapshot(
            &[(99.0, 1.0), (98.0, 1.0), (97.0, 1.0)],
            &[(101.0, 1.0), (102.0, 1.0), (103.0, 1.0)],
            1,
            Utc::now(),
        );
        assert_eq!(l.top_n(Side::Buy, 10), vec![(99.0, 1.0), (98.0, 1.0)]);
        assert_eq!(l.top_n(Side::Sell, 10), vec![(101.0, 1.0), (102.0, 1.0)]);
    }
}
