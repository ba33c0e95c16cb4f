// =============================================================================
// Weighted Book Imbalance — WBI-Lite v3.x
// =============================================================================
//
// Per-tick scalar summary of top-K liquidity skew with a trigger → confirm →
// alert state machine:
//
//   weight_i = 1 / (1 + |price_i - mid| / spread)
//   power    = Σ price_i · size_i · weight_i          (per side)
//   score    = 2·(σ(gain·log10(buy/sell)) − 0.5)      ∈ (−1, 1)
//   delta    = score − EMA(score)
//
// Triggers (OR): |delta| >= delta_trigger, |score| >= level_trigger.
// A trigger enters Pending; `confirm_ticks` same-direction ticks promote it
// to a significant alert (cooldown permitting).  An Active state flips back
// through Pending with the old direction parked in `pre_flip_direction` so a
// weak counter-signal restores the prior Active state instead of alerting.
//
// All timestamps come from the caller, which keeps replays deterministic.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

// =============================================================================
// Types
// =============================================================================

/// Direction of the detected liquidity skew.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImbalanceDirection {
    BuyPressure,
    SellPressure,
    Balanced,
}

impl ImbalanceDirection {
    fn opposite(self) -> Self {
        match self {
            Self::BuyPressure => Self::SellPressure,
            Self::SellPressure => Self::BuyPressure,
            Self::Balanced => Self::Balanced,
        }
    }
}

/// Alert state machine position for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Warmup,
    Inactive,
    Pending,
    Active,
    CrossMarket,
}

/// One tick's computed signal.
#[derive(Debug, Clone, Serialize)]
pub struct ImbalanceSignal {
    pub symbol: String,
    pub direction: ImbalanceDirection,
    pub score: f64,
    pub delta: f64,
    pub buy_power: f64,
    pub sell_power: f64,
    pub ratio: f64,
    pub state: AlertState,
    pub is_significant: bool,
    /// Set when a confirmation landed inside the cooldown window: the state
    /// advanced but no alert should be pushed.
    pub cooldown_suppressed: bool,
    pub trigger_reason: String,
    pub ts: DateTime<Utc>,
}

/// Per-symbol detector state.
#[derive(Debug, Clone)]
struct SymbolState {
    tick_count: u64,
    ema_score: Option<f64>,
    alert_state: AlertState,
    alert_direction: Option<ImbalanceDirection>,
    warmup_just_ended: bool,
    pending_direction: Option<ImbalanceDirection>,
    pending_ticks: u32,
    pending_trigger: String,
    pre_flip_direction: Option<ImbalanceDirection>,
    last_alert: Option<DateTime<Utc>>,
    last_update: DateTime<Utc>,
}

impl SymbolState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            tick_count: 0,
            ema_score: None,
            alert_state: AlertState::Warmup,
            alert_direction: None,
            warmup_just_ended: false,
            pending_direction: None,
            pending_ticks: 0,
            pending_trigger: String::new(),
            pre_flip_direction: None,
            last_alert: None,
            last_update: now,
        }
    }

    fn clear_pending(&mut self) {
        self.pending_direction = None;
        self.pending_ticks = 0;
        self.pending_trigger.clear();
    }
}

// =============================================================================
// Config
// =============================================================================

/// Tunable parameters; defaults match the production WBI-Lite v3 settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImbalanceConfig {
    pub max_depth: usize,
    pub ema_alpha: f64,
    pub delta_trigger: f64,
    pub delta_reset: f64,
    pub level_trigger: f64,
    pub direction_threshold: f64,
    pub warmup_ticks: u64,
    pub confirm_ticks: u32,
    pub cooldown_secs: f64,
    pub min_spread_bps: f64,
    pub max_spread_bps: f64,
    pub sigmoid_gain: f64,
    pub max_symbols: usize,
    pub symbol_ttl_secs: i64,
}

impl Default for ImbalanceConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            ema_alpha: 0.1,
            delta_trigger: 0.7,
            delta_reset: 0.2,
            level_trigger: 0.85,
            direction_threshold: 0.1,
            warmup_ticks: 10,
            confirm_ticks: 3,
            cooldown_secs: 60.0,
            min_spread_bps: 1.0,
            max_spread_bps: 500.0,
            sigmoid_gain: 2.0,
            max_symbols: 3000,
            symbol_ttl_secs: 3600,
        }
    }
}

// =============================================================================
// Analyzer
// =============================================================================

/// Minimum spacing between zombie-state sweeps.
const CLEANUP_COOLDOWN_SECS: i64 = 60;

/// Stateful weighted-book-imbalance analyzer over many symbols.
pub struct ImbalanceAnalyzer {
    config: ImbalanceConfig,
    states: HashMap<String, SymbolState>,
    last_cleanup: DateTime<Utc>,
}

impl ImbalanceAnalyzer {
    pub fn new(config: ImbalanceConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
            last_cleanup: DateTime::<Utc>::MIN_UTC,
        }
    }

    pub fn tracked_symbols(&self) -> usize {
        self.states.len()
    }

    /// Drop all per-symbol state (reconnect resync barrier).
    pub fn reset(&mut self) {
        self.states.clear();
    }

    /// Compute the signal for one depth tick.  `bids`/`asks` are best-first.
    pub fn on_depth(
        &mut self,
        symbol: &str,
        bids: &[(f64, f64)],
        asks: &[(f64, f64)],
        now: DateTime<Utc>,
    ) -> ImbalanceSignal {
        self.maybe_sweep(symbol, now);

        let state = self
            .states
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolState::new(now));
        state.tick_count += 1;
        state.last_update = now;

        if bids.is_empty() || asks.is_empty() {
            return Self::empty_signal(symbol, state.alert_state, "no_data", now);
        }

        let top_bids: Vec<(f64, f64)> = bids.iter().take(self.config.max_depth).copied().collect();
        let top_asks: Vec<(f64, f64)> = asks.iter().take(self.config.max_depth).copied().collect();

        let best_bid = top_bids[0].0;
        let best_ask = top_asks[0].0;

        // A crossed book disables the detector until it clears.
        if best_bid >= best_ask {
            state.alert_state = AlertState::CrossMarket;
            state.clear_pending();
            return Self::empty_signal(symbol, AlertState::CrossMarket, "cross_market", now);
        }

        let mid = (best_bid + best_ask) / 2.0;
        let raw_spread = best_ask - best_bid;
        let min_spread = mid * self.config.min_spread_bps / 10_000.0;
        let max_spread = mid * self.config.max_spread_bps / 10_000.0;
        let spread = raw_spread.clamp(min_spread, max_spread);

        let buy_power = weighted_power(&top_bids, mid, spread);
        let sell_power = weighted_power(&top_asks, mid, spread);

        let epsilon = 1e-8;
        let ratio = (buy_power + epsilon) / (sell_power + epsilon);
        let score = log_sigmoid(self.config.sigmoid_gain, ratio);

        // Warmup period: observe, never alert.
        if state.tick_count <= self.config.warmup_ticks {
            return ImbalanceSignal {
                symbol: symbol.to_string(),
                direction: ImbalanceDirection::Balanced,
                score,
                delta: 0.0,
                buy_power,
                sell_power,
                ratio,
                state: AlertState::Warmup,
                is_significant: false,
                cooldown_suppressed: false,
                trigger_reason: "warmup".to_string(),
                ts: now,
            };
        }

        if state.alert_state == AlertState::Warmup {
            state.alert_state = AlertState::Inactive;
            state.ema_score = Some(score);
            state.warmup_just_ended = true;
        }

        let mut cross_just_recovered = false;
        if state.alert_state == AlertState::CrossMarket {
            state.alert_state = AlertState::Inactive;
            state.ema_score = Some(score);
            cross_just_recovered = true;
        }

        // First tick after warmup or cross recovery uses delta = 0.
        let delta = if state.warmup_just_ended || cross_just_recovered {
            state.warmup_just_ended = false;
            0.0
        } else {
            score - state.ema_score.unwrap_or(score)
        };

        state.ema_score = Some(match state.ema_score {
            Some(ema) => self.config.ema_alpha * score + (1.0 - self.config.ema_alpha) * ema,
            None => score,
        });

        let (signal, new_state) =
            Self::step_state_machine(&self.config, state, symbol, score, delta, now);
        state.alert_state = new_state;

        ImbalanceSignal {
            buy_power,
            sell_power,
            ratio,
            ..signal
        }
    }

    // -------------------------------------------------------------------------
    // State machine
    // -------------------------------------------------------------------------

    fn step_state_machine(
        cfg: &ImbalanceConfig,
        state: &mut SymbolState,
        symbol: &str,
        score: f64,
        delta: f64,
        now: DateTime<Utc>,
    ) -> (ImbalanceSignal, AlertState) {
        let abs_delta = delta.abs();
        let abs_score = score.abs();

        let mut is_significant = false;
        let mut cooldown_suppressed = false;
        let mut trigger_reason = String::new();
        let mut direction = ImbalanceDirection::Balanced;
        let mut new_state = state.alert_state;

        match state.alert_state {
            AlertState::Inactive => {
                let triggered = if abs_delta >= cfg.delta_trigger {
                    direction = direction_of(delta);
                    Some(("delta", delta))
                } else if abs_score >= cfg.level_trigger {
                    direction = direction_of(score);
                    Some(("level", score))
                } else {
                    None
                };

                if let Some((kind, value)) = triggered {
                    new_state = AlertState::Pending;
                    state.pending_direction = Some(direction);
                    state.pending_ticks = 1;
                    state.pending_trigger = format_trigger(kind, value);
                }
            }

            AlertState::Pending => {
                let pending_dir = state.pending_direction.unwrap_or(ImbalanceDirection::Balanced);

                let current_dir = if abs_delta >= cfg.delta_trigger {
                    direction_of(delta)
                } else if abs_score >= cfg.level_trigger {
                    direction_of(score)
                } else {
                    direction_from_value(cfg.direction_threshold, score)
                };

                if current_dir == pending_dir {
                    state.pending_ticks += 1;

                    if state.pending_ticks >= cfg.confirm_ticks {
                        let in_cooldown = state.last_alert.map_or(false, |last| {
                            (now - last).num_milliseconds() as f64 / 1000.0 < cfg.cooldown_secs
                        });
                        direction = pending_dir;
                        new_state = AlertState::Active;
                        state.alert_direction = Some(pending_dir);
                        if in_cooldown {
                            cooldown_suppressed = true;
                            trigger_reason =
                                format!("{} (cooldown-suppressed)", state.pending_trigger);
                        } else {
                            is_significant = true;
                            trigger_reason = state.pending_trigger.clone();
                            state.last_alert = Some(now);
                        }
                        state.pre_flip_direction = None;
                    }
                } else if abs_delta >= cfg.delta_trigger || abs_score >= cfg.level_trigger {
                    // Strong opposite signal restarts confirmation.
                    let (kind, value) = if abs_delta >= cfg.delta_trigger {
                        ("delta", delta)
                    } else {
                        ("level", score)
                    };
                    new_state = AlertState::Pending;
                    state.pending_direction = Some(current_dir);
                    state.pending_ticks = 1;
                    state.pending_trigger = format_trigger(kind, value);
                } else if let Some(prior) = state.pre_flip_direction.take() {
                    // Weak counter-signal after a flip: restore the prior
                    // Active state instead of alerting.
                    new_state = AlertState::Active;
                    state.alert_direction = Some(prior);
                    direction = prior;
                } else {
                    new_state = AlertState::Inactive;
                    state.clear_pending();
                }
            }

            AlertState::Active => {
                let old_direction = state.alert_direction.unwrap_or(ImbalanceDirection::Balanced);

                let edge_flip = matches!(
                    (old_direction, delta),
                    (ImbalanceDirection::BuyPressure, d) if d < -cfg.delta_trigger
                ) || matches!(
                    (old_direction, delta),
                    (ImbalanceDirection::SellPressure, d) if d > cfg.delta_trigger
                );

                let level_flip = matches!(
                    (old_direction, score),
                    (ImbalanceDirection::BuyPressure, s) if s < -cfg.level_trigger
                ) || matches!(
                    (old_direction, score),
                    (ImbalanceDirection::SellPressure, s) if s > cfg.level_trigger
                );

                if edge_flip || level_flip {
                    new_state = AlertState::Pending;
                    state.pre_flip_direction = Some(old_direction);
                    state.pending_direction = Some(old_direction.opposite());
                    state.pending_ticks = 1;
                    state.pending_trigger =
                        format_trigger("flip", if edge_flip { delta } else { score });
                    // Keep reporting the old direction until confirmed.
                    direction = old_direction;
                } else if abs_delta < cfg.delta_reset && abs_score < cfg.level_trigger * 0.7 {
                    new_state = AlertState::Inactive;
                    state.alert_direction = None;
                    state.clear_pending();
                    state.pre_flip_direction = None;
                } else {
                    direction = old_direction;
                }
            }

            AlertState::Warmup | AlertState::CrossMarket => {}
        }

        if is_significant {
            debug!(
                symbol,
                ?direction,
                score = format!("{score:.3}"),
                delta = format!("{delta:.3}"),
                reason = %trigger_reason,
                "book imbalance confirmed"
            );
        }

        (
            ImbalanceSignal {
                symbol: symbol.to_string(),
                direction,
                score,
                delta,
                buy_power: 0.0,
                sell_power: 0.0,
                ratio: 1.0,
                state: new_state,
                is_significant,
                cooldown_suppressed,
                trigger_reason,
                ts: now,
            },
            new_state,
        )
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn empty_signal(
        symbol: &str,
        state: AlertState,
        reason: &str,
        ts: DateTime<Utc>,
    ) -> ImbalanceSignal {
        ImbalanceSignal {
            symbol: symbol.to_string(),
            direction: ImbalanceDirection::Balanced,
            score: 0.0,
            delta: 0.0,
            buy_power: 0.0,
            sell_power: 0.0,
            ratio: 1.0,
            state,
            is_significant: false,
            cooldown_suppressed: false,
            trigger_reason: reason.to_string(),
            ts,
        }
    }

    /// Evict symbols idle past the TTL once the soft cap is exceeded.
    /// Rate-limited to one sweep per minute.
    fn maybe_sweep(&mut self, keep_symbol: &str, now: DateTime<Utc>) {
        if self.states.len() <= self.config.max_symbols {
            return;
        }
        if (now - self.last_cleanup).num_seconds() < CLEANUP_COOLDOWN_SECS {
            return;
        }
        self.last_cleanup = now;

        let cutoff = now - Duration::seconds(self.config.symbol_ttl_secs);
        let before = self.states.len();
        self.states
            .retain(|sym, st| sym == keep_symbol || st.last_update >= cutoff);

        let removed = before - self.states.len();
        if removed > 0 {
            debug!(removed, remaining = self.states.len(), "swept zombie WBI symbols");
        }
    }
}

impl Default for ImbalanceAnalyzer {
    fn default() -> Self {
        Self::new(ImbalanceConfig::default())
    }
}

fn log_sigmoid(gain: f64, ratio: f64) -> f64 {
    let ratio = ratio.clamp(0.001, 1000.0);
    let x = gain * ratio.log10();
    let sigmoid = 1.0 / (1.0 + (-x).exp());
    2.0 * (sigmoid - 0.5)
}

fn direction_from_value(threshold: f64, value: f64) -> ImbalanceDirection {
    if value > threshold {
        ImbalanceDirection::BuyPressure
    } else if value < -threshold {
        ImbalanceDirection::SellPressure
    } else {
        ImbalanceDirection::Balanced
    }
}

fn weighted_power(levels: &[(f64, f64)], mid: f64, spread: f64) -> f64 {
    levels
        .iter()
        .filter(|&&(p, q)| p > 0.0 && q > 0.0)
        .map(|&(p, q)| {
            let weight = 1.0 / (1.0 + (p - mid).abs() / spread);
            p * q * weight
        })
        .sum()
}

fn direction_of(value: f64) -> ImbalanceDirection {
    if value > 0.0 {
        ImbalanceDirection::BuyPressure
    } else {
        ImbalanceDirection::SellPressure
    }
}

fn format_trigger(kind: &str, value: f64) -> String {
    let strength = match value.abs() {
        v if v >= 1.0 => "extreme",
        v if v >= 0.8 => "strong",
        v if v >= 0.6 => "moderate",
        _ => "weak",
    };
    match kind {
        "delta" => format!("shift: {strength}"),
        "level" => format!("imbalance: {strength}"),
        "flip" => format!("reversal: {strength}"),
        other => other.to_string(),
    }
}
