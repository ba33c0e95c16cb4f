// =============================================================================
// Basis Tracker — spot vs perpetual divergence per base asset
// =============================================================================
//
//   basis = (perp_mid - spot_mid) / spot_mid * 100
//
// Both legs must be fresh (within `stale_secs`); streams arrive on different
// shards so the freshness check doubles as the out-of-order tolerance.
// Severity is two-tier: |basis| >= high_threshold maps to High, else Medium.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BasisDirection {
    /// Perp above spot.
    Premium,
    /// Perp below spot.
    Discount,
}

/// A basis threshold crossing.
#[derive(Debug, Clone)]
pub struct BasisAlert {
    pub symbol: String,
    pub basis_pct: f64,
    pub spot_price: f64,
    pub futures_price: f64,
    pub direction: BasisDirection,
    pub severity: Severity,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasisConfig {
    /// Absolute basis percent that fires a Medium alert.
    pub alert_threshold_pct: f64,
    /// Absolute basis percent that escalates to High.
    pub high_threshold_pct: f64,
    pub cooldown_secs: f64,
    /// A leg older than this does not participate.
    pub stale_secs: f64,
}

impl Default for BasisConfig {
    fn default() -> Self {
        Self {
            alert_threshold_pct: 1.0,
            high_threshold_pct: 2.0,
            cooldown_secs: 300.0,
            stale_secs: 60.0,
        }
    }
}

#[derive(Debug, Default)]
struct SymbolBasisState {
    spot_price: Option<f64>,
    futures_price: Option<f64>,
    spot_ts: Option<DateTime<Utc>>,
    futures_ts: Option<DateTime<Utc>>,
    last_alert: Option<DateTime<Utc>>,
    last_basis_pct: f64,
}

/// Tracks both legs per equivalence key and emits threshold crossings.
pub struct BasisTracker {
    config: BasisConfig,
    states: HashMap<String, SymbolBasisState>,
}

impl BasisTracker {
    pub fn new(config: BasisConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
        }
    }

    pub fn reset(&mut self) {
        self.states.clear();
    }

    /// Update one leg; returns an alert when the pair is fresh, over
    /// threshold, and out of cooldown.
    pub fn update_price(
        &mut self,
        symbol: &str,
        price: f64,
        is_futures: bool,
        now: DateTime<Utc>,
    ) -> Option<BasisAlert> {
        if price <= 0.0 {
            return None;
        }

        let state = self.states.entry(symbol.to_string()).or_default();
        if is_futures {
            state.futures_price = Some(price);
            state.futures_ts = Some(now);
        } else {
            state.spot_price = Some(price);
            state.spot_ts = Some(now);
        }

        self.check_alert(symbol, now)
    }

    fn check_alert(&mut self, symbol: &str, now: DateTime<Utc>) -> Option<BasisAlert> {
        let cfg = self.config.clone();
        let state = self.states.get_mut(symbol)?;

        let spot = state.spot_price?;
        let perp = state.futures_price?;

        // Freshness on both legs.
        for leg_ts in [state.spot_ts, state.futures_ts] {
            let ts = leg_ts?;
            if (now - ts).num_milliseconds() as f64 / 1000.0 > cfg.stale_secs {
                return None;
            }
        }

        let basis_pct = (perp - spot) / spot * 100.0;
        state.last_basis_pct = basis_pct;

        if basis_pct.abs() < cfg.alert_threshold_pct {
            return None;
        }

        if let Some(last) = state.last_alert {
            if (now - last).num_milliseconds() as f64 / 1000.0 < cfg.cooldown_secs {
                return None;
            }
        }
        state.last_alert = Some(now);

        let direction = if basis_pct > 0.0 {
            BasisDirection::Premium
        } else {
            BasisDirection::Discount
        };
        let severity = if basis_pct.abs() >= cfg.high_threshold_pct {
            Severity::High
        } else {
            Severity::Medium
        };

        info!(
            symbol,
            basis_pct = format!("{basis_pct:+.2}"),
            spot = format!("{spot:.2}"),
            perp = format!("{perp:.2}"),
            ?direction,
            "basis threshold crossed"
        );

        Some(BasisAlert {
            symbol: symbol.to_string(),
            basis_pct,
            spot_price: spot,
            futures_price: perp,
            direction,
            severity,
            ts: now,
        })
    }

    /// Current basis for a symbol when both legs are known.
    pub fn basis(&self, symbol: &str) -> Option<f64> {
        let state = self.states.get(symbol)?;
        let spot = state.spot_price?;
        let perp = state.futures_price?;
        Some((perp - spot) / spot * 100.0)
    }

    pub fn tracked_pairs(&self) -> usize {
        self.states
            .values()
            .filter(|s| s.spot_price.is_some() && s.futures_price.is_some())
            .count()
    }
}

impl Default for BasisTracker {
    fn default() -> Self {
        Self::new(BasisConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn t(base: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
        base + Duration::seconds(secs)
    }

    #[test]
    fn fires_medium_between_one_and_two_percent() {
        let mut b = BasisTracker::default();
        let base = Utc::now();
        assert!(b.update_price("BTC-USD*", 95_000.0, false, t(base, 0)).is_none());
        let alert = b
            .update_price("BTC-USD*", 96_500.0, true, t(base, 1))
            .expect("basis alert");
        assert!((alert.basis_pct - 1.578).abs() < 0.01);
        assert_eq!(alert.direction, BasisDirection::Premium);
        assert_eq!(alert.severity, Severity::Medium);
    }

    #[test]
    fn escalates_to_high_at_two_percent() {
        let mut b = BasisTracker::default();
        let base = Utc::now();
        b.update_price("S", 100.0, false, t(base, 0));
        let alert = b.update_price("S", 102.5, true, t(base, 1)).unwrap();
        assert_eq!(alert.severity, Severity::High);
    }

    #[test]
    fn discount_direction() {
        let mut b = BasisTracker::default();
        let base = Utc::now();
        b.update_price("S", 100.0, false, t(base, 0));
        let alert = b.update_price("S", 98.5, true, t(base, 1)).unwrap();
        assert_eq!(alert.direction, BasisDirection::Discount);
        assert!(alert.basis_pct < 0.0);
    }

    #[test]
    fn below_threshold_silent() {
        let mut b = BasisTracker::default();
        let base = Utc::now();
        b.update_price("S", 100.0, false, t(base, 0));
        assert!(b.update_price("S", 100.5, true, t(base, 1)).is_none());
        assert!((b.basis("S").unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn stale_leg_blocks_alert() {
        let mut b = BasisTracker::default();
        let base = Utc::now();
        b.update_price("S", 100.0, false, t(base, 0));
        // Spot leg is 90 s old by the time the perp leg lands.
        assert!(b.update_price("S", 103.0, true, t(base, 90)).is_none());
    }

    #[test]
    fn cooldown_suppresses_repeat() {
        let mut b = BasisTracker::default();
        let base = Utc::now();
        b.update_price("S", 100.0, false, t(base, 0));
        assert!(b.update_price("S", 102.0, true, t(base, 1)).is_some());

        // Refresh both legs inside the cooldown: still over threshold, no alert.
        b.update_price("S", 100.0, false, t(base, 30));
        assert!(b.update_price("S", 102.0, true, t(base, 31)).is_none());

        // After the cooldown it fires again.
        b.update_price("S", 100.0, false, t(base, 302));
        assert!(b.update_price("S", 102.0, true, t(base, 303)).is_some());
    }

    #[test]
    fn missing_leg_never_fires() {
        let mut b = BasisTracker::default();
        let base = Utc::now();
        assert!(b.update_price("S", 102.0, true, base).is_none());
        assert_eq!(b.tracked_pairs(), 0);
        assert!(b.basis("S").is_none());
    }
}
