// =============================================================================
// Venue Registry — streaming/REST endpoints and connection budgets
// =============================================================================
//
// A Venue is immutable after registration: endpoints plus the hints the
// stream pool needs to shard symbols (streams per connection, dials per
// egress identity per five-minute window).
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::MarketType;

/// A registered exchange endpoint set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Venue {
    pub id: String,
    pub spot_ws_url: String,
    pub futures_ws_url: String,
    pub spot_rest_url: String,
    pub futures_rest_url: String,
    /// Streams multiplexed on one spot connection.
    pub spot_streams_per_conn: usize,
    /// Streams multiplexed on one futures connection (heavier traffic).
    pub futures_streams_per_conn: usize,
    /// Dial budget per egress identity per five minutes.
    pub max_connections_per_egress: usize,
}

impl Venue {
    /// The standard Binance-shaped venue.
    pub fn binance() -> Self {
        Self {
            id: "binance".to_string(),
            spot_ws_url: "wss://stream.binance.com:9443/stream".to_string(),
            futures_ws_url: "wss://fstream.binance.com/stream".to_string(),
            spot_rest_url: "https://api.binance.com".to_string(),
            futures_rest_url: "https://fapi.binance.com".to_string(),
            spot_streams_per_conn: 60,
            futures_streams_per_conn: 25,
            max_connections_per_egress: 280,
        }
    }

    pub fn ws_url(&self, market: MarketType) -> &str {
        match market {
            MarketType::Spot => &self.spot_ws_url,
            MarketType::Futures => &self.futures_ws_url,
        }
    }

    pub fn rest_url(&self, market: MarketType) -> &str {
        match market {
            MarketType::Spot => &self.spot_rest_url,
            MarketType::Futures => &self.futures_rest_url,
        }
    }

    pub fn streams_per_conn(&self, market: MarketType) -> usize {
        match market {
            MarketType::Spot => self.spot_streams_per_conn,
            MarketType::Futures => self.futures_streams_per_conn,
        }
    }
}

/// Immutable set of registered venues, owned by the supervisor.
#[derive(Debug, Default)]
pub struct VenueRegistry {
    venues: HashMap<String, Venue>,
}

impl VenueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a venue. Returns false (and keeps the original) when the id
    /// is already taken; venues are immutable after registration.
    pub fn register(&mut self, venue: Venue) -> bool {
        if self.venues.contains_key(&venue.id) {
            return false;
        }
        self.venues.insert(venue.id.clone(), venue);
        true
    }

    pub fn get(&self, id: &str) -> Option<&Venue> {
        self.venues.get(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.venues.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.venues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.venues.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binance_endpoints_by_market() {
        let v = Venue::binance();
        assert!(v.ws_url(MarketType::Spot).contains("stream.binance.com"));
        assert!(v.ws_url(MarketType::Futures).contains("fstream"));
        assert!(v.rest_url(MarketType::Futures).contains("fapi"));
        assert!(v.streams_per_conn(MarketType::Futures) < v.streams_per_conn(MarketType::Spot));
    }

    #[test]
    fn registry_rejects_duplicate_registration() {
        let mut reg = VenueRegistry::new();
        assert!(reg.register(Venue::binance()));
        let mut changed = Venue::binance();
        changed.spot_streams_per_conn = 1;
        assert!(!reg.register(changed));
        // The original registration survives.
        assert_eq!(reg.get("binance").unwrap().spot_streams_per_conn, 60);
    }
}
