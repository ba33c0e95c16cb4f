// =============================================================================
// Venue REST Client — depth snapshots and symbol discovery
// =============================================================================
//
// Read-mostly client used for gap repair (depth snapshots) and 24h-volume
// symbol ranking.  Every request draws its documented weight from the shared
// token bucket before hitting the wire.  Credentials are optional: signed
// requests are only needed for account-scoped endpoints, which this engine
// does not use in read-only deployments.
//
// SECURITY: the secret key is used exclusively for HMAC signing and is never
// logged or serialised.
// =============================================================================

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::net::TokenBucket;
use crate::types::MarketType;
use crate::venue::Venue;

type HmacSha256 = Hmac<Sha256>;

/// Request weight of a depth snapshot at limit=100 on Binance-shaped venues.
const DEPTH_SNAPSHOT_WEIGHT: f64 = 5.0;
/// Request weight of the full 24h ticker array.
const TICKER_24H_WEIGHT: f64 = 80.0;

/// A ranked tradable symbol returned by [`VenueRestClient::list_symbols`].
#[derive(Debug, Clone)]
pub struct RankedSymbol {
    pub wire_symbol: String,
    pub quote_volume_24h: f64,
}

/// REST client for one venue, weight-budgeted through the token bucket.
#[derive(Clone)]
pub struct VenueRestClient {
    venue: Venue,
    api_key: String,
    secret: String,
    bucket: Arc<TokenBucket>,
    client: reqwest::Client,
}

impl VenueRestClient {
    pub fn new(
        venue: Venue,
        api_key: impl Into<String>,
        secret: impl Into<String>,
        bucket: Arc<TokenBucket>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build REST http client")?;

        Ok(Self {
            venue,
            api_key: api_key.into(),
            secret: secret.into(),
            bucket,
            client,
        })
    }

    // -------------------------------------------------------------------------
    // Signing helpers (only exercised when credentials are configured)
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `query`.
    pub fn sign(&self, query: &str) -> Result<String> {
        if self.secret.is_empty() {
            bail!("cannot sign request without an API secret");
        }
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Current UNIX timestamp in milliseconds.
    pub fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.secret.is_empty()
    }

    // -------------------------------------------------------------------------
    // Depth snapshot (gap repair)
    // -------------------------------------------------------------------------

    /// Fetch a top-N depth snapshot: `(last_update_id, bids, asks)`.
    pub async fn depth_snapshot(
        &self,
        market: MarketType,
        wire_symbol: &str,
        limit: usize,
    ) -> Result<(u64, Vec<(f64, f64)>, Vec<(f64, f64)>)> {
        self.bucket.acquire(DEPTH_SNAPSHOT_WEIGHT).await;

        let path = match market {
            MarketType::Spot => "/api/v3/depth",
            MarketType::Futures => "/fapi/v1/depth",
        };
        let url = format!(
            "{}{}?symbol={}&limit={}",
            self.venue.rest_url(market),
            path,
            wire_symbol.to_uppercase(),
            limit
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("depth snapshot request failed for {wire_symbol}"))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            let retry_after = resp
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(5);
            warn!(symbol = %wire_symbol, retry_after, "rate limited by venue, backing off");
            tokio::time::sleep(std::time::Duration::from_secs(retry_after)).await;
            bail!("venue rate limited (429), retry after {retry_after}s");
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse depth snapshot response")?;

        if !status.is_success() {
            bail!("depth snapshot for {wire_symbol} returned {status}: {body}");
        }

        let last_update_id = body["lastUpdateId"]
            .as_u64()
            .context("snapshot missing lastUpdateId")?;
        let bids = parse_levels(&body["bids"]).context("snapshot missing bids")?;
        let asks = parse_levels(&body["asks"]).context("snapshot missing asks")?;

        debug!(symbol = %wire_symbol, last_update_id, "depth snapshot fetched");
        Ok((last_update_id, bids, asks))
    }

    // -------------------------------------------------------------------------
    // Symbol discovery
    // -------------------------------------------------------------------------

    /// List wire symbols for a market, ranked by trailing 24h quote volume
    /// descending.  Only stable-quoted pairs are returned.
    pub async fn list_symbols(&self, market: MarketType) -> Result<Vec<RankedSymbol>> {
        self.bucket.acquire(TICKER_24H_WEIGHT).await;

        let path = match market {
            MarketType::Spot => "/api/v3/ticker/24hr",
            MarketType::Futures => "/fapi/v1/ticker/24hr",
        };
        let url = format!("{}{}", self.venue.rest_url(market), path);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("24h ticker request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse 24h ticker response")?;

        if !status.is_success() {
            bail!("24h ticker returned {status}: {body}");
        }

        let arr = body.as_array().context("24h ticker response not an array")?;

        let mut ranked: Vec<RankedSymbol> = arr
            .iter()
            .filter_map(|item| {
                let symbol = item["symbol"].as_str()?;
                if !crate::symbols::STABLECOIN_QUOTES
                    .iter()
                    .any(|q| symbol.ends_with(q))
                {
                    return None;
                }
                let volume: f64 = item["quoteVolume"].as_str()?.parse().ok()?;
                Some(RankedSymbol {
                    wire_symbol: symbol.to_string(),
                    quote_volume_24h: volume,
                })
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.quote_volume_24h
                .partial_cmp(&a.quote_volume_24h)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        debug!(market = %market, count = ranked.len(), "symbols listed");
        Ok(ranked)
    }
}

/// Parse a `[["price","size"], ...]` array of depth levels.
fn parse_levels(val: &serde_json::Value) -> Option<Vec<(f64, f64)>> {
    let arr = val.as_array()?;
    Some(
        arr.iter()
            .filter_map(|level| {
                let p: f64 = level.get(0)?.as_str()?.parse().ok()?;
                let s: f64 = level.get(1)?.as_str()?.parse().ok()?;
                Some((p, s))
            })
            .collect(),
    )
}
