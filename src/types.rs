// =============================================================================
// Shared types used across the Orca Watch surveillance engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which market segment a stream or symbol belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    Spot,
    Futures,
}

impl Default for MarketType {
    fn default() -> Self {
        Self::Spot
    }
}

impl std::fmt::Display for MarketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spot => write!(f, "spot"),
            Self::Futures => write!(f, "futures"),
        }
    }
}

/// Taker side of a trade (the party removing liquidity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Alert severity tiers. Ordering matters: `High > Medium > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What kind of detection produced an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Trade,
    Imbalance,
    Accumulation,
    Distribution,
    PriceWall,
    StopHunt,
    Pump,
    Dump,
    Basis,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trade => "trade",
            Self::Imbalance => "imbalance",
            Self::Accumulation => "accumulation",
            Self::Distribution => "distribution",
            Self::PriceWall => "price_wall",
            Self::StopHunt => "stop_hunt",
            Self::Pump => "pump",
            Self::Dump => "dump",
            Self::Basis => "basis",
        }
    }
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A finished alert record, immutable once produced by the gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub ts: DateTime<Utc>,
    pub venue: String,
    pub market: MarketType,
    pub symbol: String,
    pub kind: AlertKind,
    pub severity: Severity,
    /// Quote-currency notional involved (trade value, wall value, ...).
    pub value: f64,
    pub price: f64,
    pub slippage_pct: f64,
    pub side: Option<Side>,
    /// Human-readable summary used by the log and push sinks.
    pub message: String,
}

/// An aggregated trade event from any venue, already normalised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    pub ts: DateTime<Utc>,
    pub venue: String,
    pub market: MarketType,
    pub symbol: String,
    pub price: f64,
    pub size: f64,
    /// True when the buyer was the resting order, i.e. the taker sold.
    pub is_buyer_maker: bool,
}

impl TradeEvent {
    /// Taker side of the trade.
    pub fn taker_side(&self) -> Side {
        if self.is_buyer_maker {
            Side::Sell
        } else {
            Side::Buy
        }
    }

    /// Quote-currency notional of the trade.
    pub fn notional(&self) -> f64 {
        self.price * self.size
    }
}

/// A depth update: either a full top-N snapshot or an incremental diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthEvent {
    pub ts: DateTime<Utc>,
    pub venue: String,
    pub market: MarketType,
    pub symbol: String,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
    /// Present only on incremental diff streams.
    pub first_seq: Option<u64>,
    pub last_seq: Option<u64>,
    pub is_snapshot: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert_eq!(Severity::parse("medium"), Some(Severity::Medium));
        assert_eq!(Severity::parse("bogus"), None);
    }

    #[test]
    fn taker_side_from_maker_flag() {
        let mut trade = TradeEvent {
            ts: Utc::now(),
            venue: "binance".into(),
            market: MarketType::Spot,
            symbol: "BTCUSDT".into(),
            price: 100.0,
            size: 2.0,
            is_buyer_maker: true,
        };
        assert_eq!(trade.taker_side(), Side::Sell);
        trade.is_buyer_maker = false;
        assert_eq!(trade.taker_side(), Side::Buy);
        assert!((trade.notional() - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn severity_serde_lowercase() {
        let json = serde_json::to_string(&Severity::High).unwrap();
        assert_eq!(json, "\"high\"");
    }
}
