// =============================================================================
// Symbol Registry — canonical symbols and venue wire mapping
// =============================================================================
//
// Canonical form is a `(base, quote)` pair.  Venue wire forms differ:
// Binance-shaped venues concatenate (`BTCUSDT`), stream names lowercase.
// Wire symbols without a separator are split by greedy longest-suffix match
// against the known quote-asset set.
//
// When `auto_convert_stable` is enabled the registry treats the stablecoin
// quote set as interchangeable for cross-venue matching: BTCUSDT on one venue
// pairs with BTCUSDC on another through the same equivalence key.
// =============================================================================

use serde::{Deserialize, Serialize};

/// Quote assets treated as mutually substitutable dollar proxies.
/// Order matters for the greedy suffix split: longer suffixes first.
pub const STABLECOIN_QUOTES: &[&str] = &["FDUSD", "USDT", "USDC", "USDE", "BUSD", "TUSD", "USD1"];

/// Non-stable quotes recognised by the suffix splitter.
const OTHER_QUOTES: &[&str] = &["BTC", "ETH", "BNB", "EUR", "TRY", "DAI"];

/// Base assets considered "major" for threshold fallbacks.
pub const MAJOR_BASES: &[&str] = &[
    "BTC", "ETH", "SOL", "BNB", "XRP", "DOGE", "ADA", "AVAX", "DOT", "LINK",
];

/// A canonical `(base, quote)` pair. Uniqueness key for all per-symbol state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanonicalSymbol {
    pub base: String,
    pub quote: String,
}

impl CanonicalSymbol {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into().to_uppercase(),
            quote: quote.into().to_uppercase(),
        }
    }

    /// Display form: `BTC-USDT`.
    pub fn display(&self) -> String {
        format!("{}-{}", self.base, self.quote)
    }

    /// Whether the base asset is on the major list.
    pub fn is_major(&self) -> bool {
        MAJOR_BASES.contains(&self.base.as_str())
    }
}

impl std::fmt::Display for CanonicalSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.base, self.quote)
    }
}

/// Canonical symbol normalisation and venue wire mapping.
#[derive(Debug, Clone)]
pub struct SymbolRegistry {
    /// Substitute stablecoin quotes with a single equivalence class when
    /// matching across venues.
    pub auto_convert_stable: bool,
}

impl SymbolRegistry {
    pub fn new(auto_convert_stable: bool) -> Self {
        Self {
            auto_convert_stable,
        }
    }

    /// Normalise any input form to canonical: `btc-usdt`, `BTC/USDT`, and
    /// bare `BTCUSDT` all map to `(BTC, USDT)`.
    pub fn normalize(&self, s: &str) -> Option<CanonicalSymbol> {
        let s = s.trim().to_uppercase();
        if s.is_empty() {
            return None;
        }

        for sep in ['-', '/', ':'] {
            if let Some((base, quote)) = s.split_once(sep) {
                if base.is_empty() || quote.is_empty() {
                    return None;
                }
                return Some(CanonicalSymbol::new(base, quote));
            }
        }

        self.split_concatenated(&s)
    }

    /// Greedy longest-suffix split of a separator-free wire symbol.
    fn split_concatenated(&self, s: &str) -> Option<CanonicalSymbol> {
        let mut candidates: Vec<&str> = STABLECOIN_QUOTES
            .iter()
            .chain(OTHER_QUOTES.iter())
            .copied()
            .collect();
        candidates.sort_by_key(|q| std::cmp::Reverse(q.len()));

        for quote in candidates {
            if let Some(base) = s.strip_suffix(quote) {
                if !base.is_empty() {
                    return Some(CanonicalSymbol::new(base, quote));
                }
            }
        }
        None
    }

    /// Venue wire form (upper-case REST symbol). Stream names lower-case this.
    pub fn to_wire(&self, venue: &str, symbol: &CanonicalSymbol) -> String {
        match venue {
            // Binance-shaped venues concatenate with no separator.
            _ => format!("{}{}", symbol.base, symbol.quote),
        }
    }

    /// Parse a venue wire symbol back to canonical form.
    pub fn from_wire(&self, _venue: &str, wire: &str) -> Option<CanonicalSymbol> {
        self.normalize(wire)
    }

    /// Key under which cross-venue state (basis pairing) is bucketed.  With
    /// stable conversion on, all stable quotes collapse to one class.
    pub fn equivalence_key(&self, symbol: &CanonicalSymbol) -> String {
        if self.auto_convert_stable && STABLECOIN_QUOTES.contains(&symbol.quote.as_str()) {
            format!("{}-USD*", symbol.base)
        } else {
            symbol.display()
        }
    }
}

impl Default for SymbolRegistry {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg() -> SymbolRegistry {
        SymbolRegistry::default()
    }

    #[test]
    fn normalize_separator_forms() {
        let r = reg();
        let want = CanonicalSymbol::new("BTC", "USDT");
        assert_eq!(r.normalize("BTC-USDT"), Some(want.clone()));
        assert_eq!(r.normalize("btc/usdt"), Some(want.clone()));
        assert_eq!(r.normalize("BTCUSDT"), Some(want));
    }

    #[test]
    fn greedy_suffix_prefers_longest_match() {
        let r = reg();
        // FDUSD must win over a hypothetical USD-ish shorter suffix.
        assert_eq!(
            r.normalize("BTCFDUSD"),
            Some(CanonicalSymbol::new("BTC", "FDUSD"))
        );
        assert_eq!(
            r.normalize("ETHBTC"),
            Some(CanonicalSymbol::new("ETH", "BTC"))
        );
    }

    #[test]
    fn normalize_rejects_garbage() {
        let r = reg();
        assert_eq!(r.normalize(""), None);
        assert_eq!(r.normalize("USDT"), None); // suffix only, empty base
        assert_eq!(r.normalize("XYZABC"), None); // unknown quote
    }

    #[test]
    fn wire_round_trip_is_identity() {
        let r = reg();
        for raw in ["BTCUSDT", "ETHUSDC", "SOLFDUSD", "DOGEBTC"] {
            let canon = r.from_wire("binance", raw).unwrap();
            assert_eq!(r.to_wire("binance", &canon), raw);
        }
    }

    #[test]
    fn stable_equivalence_key() {
        let r = SymbolRegistry::new(true);
        let a = CanonicalSymbol::new("BTC", "USDT");
        let b = CanonicalSymbol::new("BTC", "USDC");
        assert_eq!(r.equivalence_key(&a), r.equivalence_key(&b));

        let strict = SymbolRegistry::new(false);
        assert_ne!(strict.equivalence_key(&a), strict.equivalence_key(&b));

        // Non-stable quotes never collapse.
        let c = CanonicalSymbol::new("ETH", "BTC");
        assert_eq!(r.equivalence_key(&c), "ETH-BTC");
    }

    #[test]
    fn major_flag() {
        assert!(CanonicalSymbol::new("BTC", "USDT").is_major());
        assert!(!CanonicalSymbol::new("PEPE", "USDT").is_major());
    }
}
