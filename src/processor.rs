// =============================================================================
// Shard Processor — per-event pipeline from wire events to alert candidates
// =============================================================================
//
// Each stream shard owns exactly one processor.  The processor owns the
// depth ladders and per-symbol detector state for its symbols; only the
// basis tracker (fed by both spot and futures shards) and the alert gate
// are shared, behind mutexes.
//
// Event flow: ladder update -> detectors -> candidate alerts -> gate ->
// dispatch.  The processor never blocks on sinks; gate output is handed to
// the fan-out which drops on overflow.
//
// A reconnect triggers the resync barrier: ladders cleared, walls cleared,
// pump/dump histories reset, and a quiet period during which wall and
// pump/dump signals are suppressed so the initial snapshot is not misread
// as a burst of fresh orders.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::alerts::{AlertGate, DispatchFanout};
use crate::config::MonitorConfig;
use crate::detectors::whale::PatternKind;
use crate::detectors::{
    BasisTracker, ImbalanceAnalyzer, ImbalanceConfig, PumpDumpConfig, PumpDumpMonitor,
    SlippageFilter, WhaleTracker,
};
use crate::hot_config::HotConfig;
use crate::market_data::{DepthError, DepthLadder};
use crate::metrics::Metrics;
use crate::rest::VenueRestClient;
use crate::symbols::SymbolRegistry;
use crate::types::{Alert, AlertKind, DepthEvent, MarketType, Severity, Side, TradeEvent};

/// Quiet period after a reconnect during which "new" detections are muted.
pub const QUIET_PERIOD_SECS: i64 = 5;
/// Spacing between whale-pattern scans per symbol.
const PATTERN_CHECK_SECS: i64 = 5;
/// Spacing between stop-hunt scans per symbol.
const STOP_HUNT_CHECK_SECS: i64 = 1;
/// Spacing between 24h-volume EMA refreshes per symbol.
const VOLUME_PULL_SECS: i64 = 300;
/// Ladders idle past this are reaped.
const LADDER_IDLE_TTL_SECS: i64 = 3600;
/// Spacing between ladder reap passes.
const LADDER_REAP_SECS: i64 = 60;

/// Non-recoverable pipeline outcomes the shard must react to.
#[derive(Debug, PartialEq)]
pub enum ProcessorError {
    /// Depth state is unrecoverable in-stream; reconnect the shard.
    NeedsReconnect,
}

/// Shared handles every processor uses.
#[derive(Clone)]
pub struct SharedPipeline {
    pub gate: Arc<Mutex<AlertGate>>,
    pub dispatch: Arc<DispatchFanout>,
    pub basis: Arc<Mutex<BasisTracker>>,
    pub metrics: Arc<Metrics>,
    pub hot_config: Arc<HotConfig>,
    /// Latest 24h quote volume per wire symbol, refreshed by the supervisor;
    /// processors fold it into their whale-threshold EMAs.
    pub volumes: Arc<parking_lot::RwLock<HashMap<String, f64>>>,
}

/// Per-shard event pipeline.
pub struct ShardProcessor {
    venue: String,
    market: MarketType,
    config: Arc<MonitorConfig>,
    registry: SymbolRegistry,
    shared: SharedPipeline,
    rest: Option<Arc<VenueRestClient>>,

    ladders: HashMap<String, DepthLadder>,
    imbalance: ImbalanceAnalyzer,
    slippage: SlippageFilter,
    whale: WhaleTracker,
    pump_dump: PumpDumpMonitor,

    quiet_until: Option<DateTime<Utc>>,
    last_pattern_check: HashMap<String, DateTime<Utc>>,
    last_stop_hunt_check: HashMap<String, DateTime<Utc>>,
    last_volume_pull: HashMap<String, DateTime<Utc>>,
    last_ladder_reap: DateTime<Utc>,
}

impl ShardProcessor {
    pub fn new(
        venue: String,
        market: MarketType,
        config: Arc<MonitorConfig>,
        shared: SharedPipeline,
        rest: Option<Arc<VenueRestClient>>,
    ) -> Self {
        let registry = SymbolRegistry::new(config.auto_convert_stable);
        let pump_config = PumpDumpConfig {
            pump_threshold_pct: config.pump_threshold_pct,
            dump_threshold_pct: config.dump_threshold_pct,
            window_secs: config.price_window_secs,
            cooldown_secs: config.price_cooldown_secs,
        };
        Self {
            venue,
            market,
            config,
            registry,
            shared,
            rest,
            ladders: HashMap::new(),
            imbalance: ImbalanceAnalyzer::new(ImbalanceConfig::default()),
            slippage: SlippageFilter::default(),
            whale: WhaleTracker::default(),
            pump_dump: PumpDumpMonitor::new(pump_config),
            quiet_until: None,
            last_pattern_check: HashMap::new(),
            last_stop_hunt_check: HashMap::new(),
            last_volume_pull: HashMap::new(),
            last_ladder_reap: DateTime::<Utc>::MIN_UTC,
        }
    }

    /// Key under which detector state is tracked: `market:SYMBOL`.
    fn cache_key(&self, wire_symbol: &str) -> String {
        format!("{}:{}", self.market, wire_symbol)
    }

    fn display_symbol(&self, wire_symbol: &str) -> String {
        self.registry
            .from_wire(&self.venue, wire_symbol)
            .map(|c| c.display())
            .unwrap_or_else(|| wire_symbol.to_string())
    }

    fn is_major(&self, wire_symbol: &str) -> bool {
        self.registry
            .from_wire(&self.venue, wire_symbol)
            .map(|c| c.is_major())
            .unwrap_or(false)
    }

    // -------------------------------------------------------------------------
    // Resync barrier
    // -------------------------------------------------------------------------

    /// Reconnect barrier: wipe book-derived state and open the quiet period.
    pub fn resync_barrier(&mut self, now: DateTime<Utc>) {
        let symbols: Vec<String> = self.ladders.keys().cloned().collect();
        self.ladders.clear();
        self.pump_dump.reset();
        for wire in symbols {
            let key = self.cache_key(&wire);
            self.whale.clear_walls(&key);
        }
        self.quiet_until = Some(now + Duration::seconds(QUIET_PERIOD_SECS));
        debug!(venue = %self.venue, market = %self.market, "resync barrier applied");
    }

    pub fn in_quiet_period(&self, now: DateTime<Utc>) -> bool {
        self.quiet_until.map_or(false, |until| now < until)
    }

    /// Feed the whale tracker's 24h volume EMA (from symbol discovery).
    pub fn update_symbol_volume(&mut self, wire_symbol: &str, quote_volume_24h: f64) {
        let key = self.cache_key(wire_symbol);
        self.whale.update_volume(&key, quote_volume_24h);
    }

    // -------------------------------------------------------------------------
    // Severity mapping with hot-config overrides
    // -------------------------------------------------------------------------

    fn slippage_severity(&self, slippage_pct: f64) -> Option<Severity> {
        let snap = self.shared.hot_config.snapshot();
        let low = snap.get_f64("SLIPPAGE_THRESHOLD_LOW", self.config.slippage_threshold_low);
        let medium = snap.get_f64(
            "SLIPPAGE_THRESHOLD_MED",
            self.config.slippage_threshold_medium,
        );
        let high = snap.get_f64(
            "SLIPPAGE_THRESHOLD_HIGH",
            self.config.slippage_threshold_high,
        );

        if slippage_pct >= high {
            Some(Severity::High)
        } else if slippage_pct >= medium {
            Some(Severity::Medium)
        } else if slippage_pct >= low {
            Some(Severity::Low)
        } else {
            None
        }
    }

    fn min_notional(&self) -> f64 {
        let snap = self.shared.hot_config.snapshot();
        match self.market {
            MarketType::Spot => snap.get_f64("MIN_ORDER_VALUE_SPOT", self.config.min_notional_spot),
            MarketType::Futures => snap.get_f64(
                "MIN_ORDER_VALUE_FUTURES",
                self.config.min_notional_futures,
            ),
        }
    }

    // -------------------------------------------------------------------------
    // Emission
    // -------------------------------------------------------------------------

    fn emit(&self, alert: Alert, now: DateTime<Utc>) {
        let ready = self.shared.gate.lock().submit(alert, now);
        for alert in ready {
            self.shared.dispatch.dispatch(&alert);
        }
    }

    fn base_alert(&self, symbol: String, kind: AlertKind, severity: Severity, ts: DateTime<Utc>) -> Alert {
        Alert {
            ts,
            venue: self.venue.clone(),
            market: self.market,
            symbol,
            kind,
            severity,
            value: 0.0,
            price: 0.0,
            slippage_pct: 0.0,
            side: None,
            message: String::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Trade path
    // -------------------------------------------------------------------------

    pub fn on_trade(&mut self, trade: &TradeEvent) {
        self.shared.metrics.inc_trades(&self.venue, 1);

        let now = trade.ts;
        let key = self.cache_key(&trade.symbol);
        let display = self.display_symbol(&trade.symbol);
        let notional = trade.notional();
        let taker_side = trade.taker_side();

        // Every trade feeds the price/volume history.
        self.whale.update_price(&key, trade.price, notional, now);

        // Periodically fold the latest 24h volume reading into the whale
        // threshold EMA.
        if self.due(Check::VolumePull, &trade.symbol, now) {
            let reading = self.shared.volumes.read().get(&trade.symbol).copied();
            if let Some(volume_24h) = reading {
                self.whale.update_volume(&key, volume_24h);
            }
        }

        // Stop hunts fire on High regardless of notional; throttled scan.
        if !self.in_quiet_period(now) && self.due(Check::StopHunt, &key, now) {
            if let Some(hunt) = self.whale.detect_stop_hunt(&key, now) {
                let mut alert =
                    self.base_alert(display.clone(), AlertKind::StopHunt, Severity::High, now);
                alert.price = hunt.rebound_price;
                alert.value = 0.0;
                alert.message = format!(
                    "stop hunt: pierced {:.4} to {:.4}, rebound {:.4}, volume x{:.1}",
                    hunt.support_price,
                    hunt.breakthrough_price,
                    hunt.rebound_price,
                    hunt.volume_spike_ratio
                );
                self.emit(alert, now);
            }
        }

        if notional < self.min_notional() {
            return;
        }

        // Sweep VWAP against the side the taker would consume.
        let fill = match self.ladders.get(&trade.symbol) {
            Some(ladder) => match ladder.vwap_for_notional(
                taker_side,
                notional,
                self.config.skip_top_levels,
                self.config.min_depth_levels,
            ) {
                Ok(fill) => fill,
                Err(DepthError::CrossedBook) => {
                    // Trade counted for history; computation skipped.
                    return;
                }
                Err(_) => return,
            },
            None => return,
        };

        let slippage_pct =
            (fill.vwap - fill.reference_price).abs() / fill.reference_price * 100.0;

        self.slippage.record(&display, slippage_pct, now);
        self.shared.metrics.observe_slippage(&self.venue, slippage_pct);

        let is_major = self.is_major(&trade.symbol);
        let decision = self.slippage.should_alert(&display, slippage_pct, is_major, now);
        if !decision.should_alert {
            return;
        }

        let severity = match self.slippage_severity(slippage_pct) {
            Some(s) => s,
            None => return,
        };

        self.whale
            .record_large_order(&key, taker_side, notional, slippage_pct, now);

        let mut alert = self.base_alert(display.clone(), AlertKind::Trade, severity, now);
        alert.value = notional;
        alert.price = trade.price;
        alert.slippage_pct = slippage_pct;
        alert.side = Some(taker_side);
        alert.message = format!(
            "{display} {taker_side} ${notional:.0} at {:.4}, slippage {slippage_pct:.2}% ({})",
            trade.price, decision.reason
        );
        self.emit(alert, now);
    }

    // -------------------------------------------------------------------------
    // Depth path
    // -------------------------------------------------------------------------

    pub async fn on_depth(&mut self, event: &DepthEvent) -> Result<(), ProcessorError> {
        let now = event.ts;
        self.maybe_reap_ladders(now);

        let depth_cap = self.config.orderbook_depth;
        let ladder = self
            .ladders
            .entry(event.symbol.clone())
            .or_insert_with(|| DepthLadder::new(depth_cap));

        if event.is_snapshot {
            ladder.apply_snapshot(&event.bids, &event.asks, event.last_seq.unwrap_or(0), now);
        } else {
            match ladder.apply_diff(event) {
                Ok(()) => {}
                Err(DepthError::SequenceGap { expected, got }) => {
                    self.shared
                        .metrics
                        .depth_resyncs_total
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    warn!(
                        symbol = %event.symbol,
                        expected,
                        got,
                        "depth sequence gap, requesting snapshot"
                    );
                    return self.repair_gap(&event.symbol).await;
                }
                Err(DepthError::ResyncOverflow) => return Err(ProcessorError::NeedsReconnect),
                Err(_) => {}
            }
        }

        let ladder = self.ladders.get(&event.symbol).expect("just inserted");
        let top_bids = ladder.top_n(Side::Buy, 10);
        let top_asks = ladder.top_n(Side::Sell, 10);
        let bid_levels = ladder.level_count(Side::Buy) as i64;
        let ask_levels = ladder.level_count(Side::Sell) as i64;
        let crossed = ladder.is_crossed();
        let mid = ladder.mid();

        self.shared.metrics.set_book_levels(&self.venue, "bid", bid_levels);
        self.shared.metrics.set_book_levels(&self.venue, "ask", ask_levels);

        let key = self.cache_key(&event.symbol);
        let symbol_display = self.display_symbol(&event.symbol);

        // Weighted book imbalance runs on every tick; it handles crossed
        // books itself (CrossMarket state).
        let sig = self.imbalance.on_depth(&key, &top_bids, &top_asks, now);
        if sig.is_significant {
            let direction_side = match sig.direction {
                crate::detectors::imbalance::ImbalanceDirection::BuyPressure => Some(Side::Buy),
                crate::detectors::imbalance::ImbalanceDirection::SellPressure => Some(Side::Sell),
                _ => None,
            };
            let mut alert =
                self.base_alert(symbol_display.clone(), AlertKind::Imbalance, Severity::Medium, now);
            alert.price = mid.unwrap_or(0.0);
            alert.value = sig.buy_power.max(sig.sell_power);
            alert.side = direction_side;
            alert.message = format!(
                "book imbalance {:?} score {:.2} delta {:+.2} ({})",
                sig.direction, sig.score, sig.delta, sig.trigger_reason
            );
            self.emit(alert, now);
        } else if sig.cooldown_suppressed {
            // Logged and counted, never pushed; does not touch buckets.
            self.shared
                .metrics
                .wbi_suppressed_total
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            debug!(symbol = %symbol_display, reason = %sig.trigger_reason, "WBI confirmation suppressed by cooldown");
        }

        // Crossed books disable everything below until they clear.
        if crossed {
            return Ok(());
        }

        let quiet = self.in_quiet_period(now);

        if let Some(mid) = mid {
            // Basis pairing across market types via the equivalence key.
            if let Some(canonical) = self.registry.from_wire(&self.venue, &event.symbol) {
                let equiv = self.registry.equivalence_key(&canonical);
                let basis_alert = self.shared.basis.lock().update_price(
                    &equiv,
                    mid,
                    self.market == MarketType::Futures,
                    now,
                );
                if let Some(b) = basis_alert {
                    let mut alert =
                        self.base_alert(symbol_display.clone(), AlertKind::Basis, b.severity, now);
                    alert.price = b.futures_price;
                    alert.message = format!(
                        "basis {:+.2}% ({:?}): spot {:.2} vs perp {:.2}",
                        b.basis_pct, b.direction, b.spot_price, b.futures_price
                    );
                    self.emit(alert, now);
                }
            }

            // Pump/dump on mid; suppressed inside the quiet period.
            if !quiet {
                if let Some(mv) = self.pump_dump.update(&key, mid, now) {
                    let kind = match mv.kind {
                        crate::detectors::pump_dump::MoveKind::Pump => AlertKind::Pump,
                        crate::detectors::pump_dump::MoveKind::Dump => AlertKind::Dump,
                    };
                    let mut alert =
                        self.base_alert(symbol_display.clone(), kind, Severity::Medium, now);
                    alert.price = mv.price_to;
                    alert.message = format!(
                        "{} {:+.2}% in {:.0}s: {:.4} -> {:.4}",
                        alert.kind, mv.change_pct, mv.window_secs, mv.price_from, mv.price_to
                    );
                    self.emit(alert, now);
                }
            }
        }

        // Wall bookkeeping: every level in the event updates its wall entry;
        // snapshots additionally retire walls no longer present.
        for &(price, size) in event.bids.iter().chain(event.asks.iter()) {
            self.whale.update_price_wall(&key, price, size, now);
        }
        if event.is_snapshot {
            let ladder = self.ladders.get(&event.symbol).expect("present");
            let live: HashSet<i64> = ladder
                .top_n(Side::Buy, usize::MAX)
                .into_iter()
                .chain(ladder.top_n(Side::Sell, usize::MAX))
                .map(|(p, _)| (p * 10_000.0).round() as i64)
                .collect();
            for price in self.whale.wall_prices(&key) {
                if !live.contains(&((price * 10_000.0).round() as i64)) {
                    self.whale.update_price_wall(&key, price, 0.0, now);
                }
            }
        }

        // Whale patterns, throttled per symbol; muted in the quiet period.
        if !quiet && self.due(Check::Pattern, &key, now) {
            for pattern in self.whale.detect_patterns(&key, now) {
                let kind = match pattern.kind {
                    PatternKind::Accumulation => AlertKind::Accumulation,
                    PatternKind::Distribution => AlertKind::Distribution,
                    PatternKind::PriceWall => AlertKind::PriceWall,
                };
                let mut alert =
                    self.base_alert(symbol_display.clone(), kind, Severity::Medium, now);
                alert.value = pattern.total_value;
                alert.price = pattern.price;
                alert.message = format!(
                    "{} (confidence {:.2}): {}",
                    alert.kind, pattern.confidence, pattern.description
                );
                self.emit(alert, now);
            }
        }

        Ok(())
    }

    /// Fetch a REST snapshot and replay buffered diffs over it.
    async fn repair_gap(&mut self, wire_symbol: &str) -> Result<(), ProcessorError> {
        let ladder = match self.ladders.get_mut(wire_symbol) {
            Some(l) => l,
            None => return Ok(()),
        };
        ladder.begin_resync();

        let rest = match &self.rest {
            Some(rest) => rest.clone(),
            // No REST surface (replay harness): a fresh snapshot will arrive
            // from the stream itself; nothing more to do.
            None => return Ok(()),
        };

        let depth = self.config.orderbook_depth;
        match rest
            .depth_snapshot(self.market, wire_symbol, depth.clamp(5, 1000))
            .await
        {
            Ok((last_update_id, bids, asks)) => {
                let ladder = self.ladders.get_mut(wire_symbol).expect("present");
                ladder.complete_resync(last_update_id, &bids, &asks, Utc::now());
                Ok(())
            }
            Err(e) => {
                warn!(symbol = %wire_symbol, error = %e, "snapshot repair failed, reconnecting shard");
                Err(ProcessorError::NeedsReconnect)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Throttles & reaping
    // -------------------------------------------------------------------------

    fn due(&mut self, check: Check, key: &str, now: DateTime<Utc>) -> bool {
        let (map, spacing) = match check {
            Check::Pattern => (&mut self.last_pattern_check, PATTERN_CHECK_SECS),
            Check::StopHunt => (&mut self.last_stop_hunt_check, STOP_HUNT_CHECK_SECS),
            Check::VolumePull => (&mut self.last_volume_pull, VOLUME_PULL_SECS),
        };
        match map.get(key) {
            Some(&last) if (now - last).num_seconds() < spacing => false,
            _ => {
                map.insert(key.to_string(), now);
                true
            }
        }
    }

    fn maybe_reap_ladders(&mut self, now: DateTime<Utc>) {
        if (now - self.last_ladder_reap).num_seconds() < LADDER_REAP_SECS {
            return;
        }
        self.last_ladder_reap = now;
        let cutoff = now - Duration::seconds(LADDER_IDLE_TTL_SECS);
        let before = self.ladders.len();
        self.ladders.retain(|_, l| l.last_update >= cutoff);
        let removed = before - self.ladders.len();
        if removed > 0 {
            debug!(removed, "reaped idle depth ladders");
        }
    }

    /// Symbols with a live ladder (used by health reporting and tests).
    pub fn ladder_count(&self) -> usize {
        self.ladders.len()
    }
}

enum Check {
    Pattern,
    StopHunt,
    VolumePull,
}
