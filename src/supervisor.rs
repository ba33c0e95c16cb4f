// =============================================================================
// Supervisor — subsystem wiring, lifecycle, and graceful shutdown
// =============================================================================
//
// Bring-up order: metrics -> hot config -> store/push/dispatch -> gate ->
// rate limits -> venues -> symbol discovery -> stream pool -> API server.
//
// Shutdown: the first termination signal cancels the root token, stops the
// stream shards, flushes aggregation buckets into the fan-out, and drains
// sinks under a bounded deadline.  A second signal forces exit.  A shard
// that exhausts its reconnect budget is either respawned (policy A) or
// takes the process down with exit code 2 (policy B).
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::alerts::{AlertGate, AlertStore, DispatchFanout, PushNotifier};
use crate::api::{self, ApiState};
use crate::config::{MonitorConfig, ShardFailPolicy};
use crate::detectors::BasisTracker;
use crate::hot_config::HotConfig;
use crate::metrics::Metrics;
use crate::net::{ConnectionGate, ProxyRotator, TokenBucket};
use crate::processor::SharedPipeline;
use crate::rest::VenueRestClient;
use crate::stream::{plan_shards, FatalShard, StreamPool};
use crate::types::MarketType;
use crate::venue::{Venue, VenueRegistry};

/// Process exit codes per the operational contract.
pub mod exit_code {
    pub const CLEAN: i32 = 0;
    pub const INIT_FAILURE: i32 = 1;
    pub const SHARD_EXHAUSTED: i32 = 2;
}

/// REST weight budget: 1200/min on the big venues, self-capped below.
const REST_WEIGHT_RATE: f64 = 18.0;
const REST_WEIGHT_CAPACITY: f64 = 1000.0;
/// Spacing of aggregation-bucket sweeps.
const GATE_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
/// Spacing of the trades/sec gauge updates.
const RATE_SAMPLE_INTERVAL: Duration = Duration::from_secs(10);
/// Spacing of 24h-volume refreshes.
const VOLUME_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// Run the full engine; returns the process exit code.
pub async fn run(config: MonitorConfig) -> i32 {
    match run_inner(config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "fatal initialisation failure");
            exit_code::INIT_FAILURE
        }
    }
}

async fn run_inner(config: MonitorConfig) -> Result<i32> {
    let config = Arc::new(config);
    let cancel = CancellationToken::new();

    // ── 1. Observability ─────────────────────────────────────────────────
    let metrics = Arc::new(Metrics::new());

    // ── 2. Hot config ────────────────────────────────────────────────────
    let hot_config = Arc::new(HotConfig::new(
        Some(PathBuf::from(".env")),
        Some(PathBuf::from("hot_config.json")),
    ));
    tokio::spawn(hot_config.clone().run_watcher(cancel.child_token()));

    // ── 3. Sinks ─────────────────────────────────────────────────────────
    let store_path = if config.alert_db_path.is_empty() {
        "data/alerts.db".to_string()
    } else {
        config.alert_db_path.clone()
    };
    let store = Arc::new(AlertStore::open(&store_path).context("alert store init failed")?);

    let push = if config.push_normal.is_configured() || config.push_urgent.is_configured() {
        Some(Arc::new(PushNotifier::new(
            config.push_normal.clone(),
            config.push_urgent.clone(),
            metrics.clone(),
        )))
    } else {
        info!("push credentials absent, notifier disabled");
        None
    };

    let dispatch = Arc::new(DispatchFanout::spawn(
        Some(store.clone()),
        push,
        metrics.clone(),
        cancel.child_token(),
    ));

    // ── 4. Gate & shared pipeline ────────────────────────────────────────
    let gate = Arc::new(Mutex::new(AlertGate::new(
        config.aggregation_window_secs,
        config.trade_cooldown_secs,
    )));
    let volumes = Arc::new(parking_lot::RwLock::new(HashMap::new()));
    let shared = SharedPipeline {
        gate: gate.clone(),
        dispatch: dispatch.clone(),
        basis: Arc::new(Mutex::new(BasisTracker::default())),
        metrics: metrics.clone(),
        hot_config: hot_config.clone(),
        volumes: volumes.clone(),
    };

    // ── 5. Rate limits & egress ──────────────────────────────────────────
    let bucket = Arc::new(TokenBucket::new(REST_WEIGHT_RATE, REST_WEIGHT_CAPACITY));
    let conn_gate = Arc::new(ConnectionGate::new(
        Duration::from_secs(300),
        config.max_connections_per_egress,
    ));
    let proxies = Arc::new(ProxyRotator::from_list(&config.proxy_list));

    // ── 6. Venues ────────────────────────────────────────────────────────
    let mut registry = VenueRegistry::new();
    for id in &config.venues {
        match id.as_str() {
            "binance" => {
                registry.register(Venue::binance());
            }
            other => warn!(venue = other, "unknown venue id, skipping"),
        }
    }
    if registry.is_empty() {
        anyhow::bail!("no usable venues after registration");
    }

    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    let mut rest_clients = Vec::new();
    for id in registry.ids() {
        let venue = registry.get(&id).expect("registered").clone();
        let client = Arc::new(VenueRestClient::new(
            venue,
            api_key.clone(),
            api_secret.clone(),
            bucket.clone(),
        )?);
        rest_clients.push((id, client));
    }

    // ── 7. Symbol discovery ──────────────────────────────────────────────
    let markets = enabled_markets(&config);
    let mut universes: Vec<(Venue, MarketType, Vec<String>)> = Vec::new();
    for (venue_id, client) in &rest_clients {
        let venue = registry.get(venue_id).expect("registered").clone();
        for market in &markets {
            let symbols =
                discover_symbols(&config, client, *market, &volumes).await?;
            info!(venue = %venue_id, market = %market, count = symbols.len(), "symbols selected");
            universes.push((venue.clone(), *market, symbols));
        }
    }

    // ── 8. Stream pool ───────────────────────────────────────────────────
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<FatalShard>(16);
    let pool = Arc::new(StreamPool::new(
        config.clone(),
        shared.clone(),
        conn_gate,
        proxies.clone(),
        metrics.clone(),
        rest_clients.clone(),
        cancel.child_token(),
        fatal_tx,
    ));
    let plans = plan_shards(&universes, &config, proxies.identity_count());
    info!(shards = plans.len(), "shard plan ready");
    pool.spawn_shards(plans);

    // ── 9. Observability API ─────────────────────────────────────────────
    let api_state = ApiState {
        metrics: metrics.clone(),
        store: Some(store.clone()),
    };
    let api_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = api::serve(api_state, api_port).await {
            error!(error = %e, "observability API terminated");
        }
    });

    // ── 10. Periodic work: gate sweep, trades/sec, volume refresh ────────
    {
        let gate = gate.clone();
        let dispatch = dispatch.clone();
        let sweep_cancel = cancel.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(GATE_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = sweep_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let ready = gate.lock().sweep(Utc::now());
                        for alert in ready {
                            dispatch.dispatch(&alert);
                        }
                    }
                }
            }
        });
    }
    {
        let metrics = metrics.clone();
        let rate_cancel = cancel.child_token();
        tokio::spawn(async move {
            let mut last_total = 0u64;
            let mut ticker = tokio::time::interval(RATE_SAMPLE_INTERVAL);
            loop {
                tokio::select! {
                    _ = rate_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let total = metrics.trades_total();
                        let rate = (total.saturating_sub(last_total)) as f64
                            / RATE_SAMPLE_INTERVAL.as_secs_f64();
                        metrics.set_trades_per_sec(rate);
                        last_total = total;
                    }
                }
            }
        });
    }
    {
        let clients = rest_clients.clone();
        let volumes = volumes.clone();
        let config = config.clone();
        let refresh_cancel = cancel.child_token();
        tokio::spawn(async move {
            let markets = enabled_markets(&config);
            let mut ticker = tokio::time::interval(VOLUME_REFRESH_INTERVAL);
            ticker.tick().await; // discovery already seeded the first round
            loop {
                tokio::select! {
                    _ = refresh_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for (venue_id, client) in &clients {
                            for market in &markets {
                                match client.list_symbols(*market).await {
                                    Ok(ranked) => {
                                        let mut map = volumes.write();
                                        for r in ranked {
                                            map.insert(r.wire_symbol, r.quote_volume_24h);
                                        }
                                    }
                                    Err(e) => warn!(venue = %venue_id, error = %e, "volume refresh failed"),
                                }
                            }
                        }
                    }
                }
            }
        });
    }

    info!("all subsystems running");

    // ── 11. Wait for a shutdown cause ────────────────────────────────────
    let mut exit = exit_code::CLEAN;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!(error = %e, "signal handler failed");
                }
                warn!("termination signal received, shutting down gracefully");
                break;
            }
            fatal = fatal_rx.recv() => {
                match fatal {
                    Some(report) => match config.shard_fail_policy {
                        ShardFailPolicy::Restart => {
                            warn!(shard = %report.shard_id, "restarting exhausted shard (policy A)");
                            pool.respawn(report.plan);
                        }
                        ShardFailPolicy::Shutdown => {
                            error!(shard = %report.shard_id, "shard exhausted, shutting down (policy B)");
                            exit = exit_code::SHARD_EXHAUSTED;
                            break;
                        }
                    },
                    None => break,
                }
            }
        }
    }

    // ── 12. Graceful shutdown ────────────────────────────────────────────
    // A second signal forces exit immediately.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            error!("second termination signal, forcing exit");
            std::process::exit(exit_code::INIT_FAILURE);
        }
    });

    pool.stop().await;

    let pending = gate.lock().flush();
    info!(count = pending.len(), "flushing aggregation buckets");
    for alert in pending {
        dispatch.dispatch(&alert);
    }

    cancel.cancel();
    match Arc::try_unwrap(dispatch) {
        Ok(fanout) => fanout.shutdown().await,
        Err(_) => {
            // Processors still hold clones; give sinks the drain window.
            tokio::time::sleep(crate::alerts::dispatch::DRAIN_DEADLINE).await;
        }
    }

    info!("shutdown complete");
    Ok(exit)
}

/// Markets enabled by the selector and feature flags.
pub fn enabled_markets(config: &MonitorConfig) -> Vec<MarketType> {
    let selector = config.markets.to_lowercase();
    let mut markets = Vec::new();
    let want_spot = config.monitor_spot && selector != "perp";
    let want_futures = config.monitor_futures && selector != "spot";
    if want_spot {
        markets.push(MarketType::Spot);
    }
    if want_futures {
        markets.push(MarketType::Futures);
    }
    markets
}

/// Resolve the symbol universe for one (venue, market), seeding the shared
/// volume map as a side effect.
async fn discover_symbols(
    config: &MonitorConfig,
    client: &Arc<VenueRestClient>,
    market: MarketType,
    volumes: &Arc<parking_lot::RwLock<HashMap<String, f64>>>,
) -> Result<Vec<String>> {
    let selector = config.markets.to_lowercase();

    // An explicit comma list short-circuits discovery entirely.
    if !matches!(selector.as_str(), "all" | "spot" | "perp") {
        let symbols: Vec<String> = selector
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        return Ok(symbols);
    }

    let ranked = client
        .list_symbols(market)
        .await
        .context("symbol discovery failed")?;

    {
        let mut map = volumes.write();
        for r in &ranked {
            map.insert(r.wire_symbol.clone(), r.quote_volume_24h);
        }
    }

    let mut symbols: Vec<String> = ranked.into_iter().map(|r| r.wire_symbol).collect();
    if config.max_symbols > 0 && symbols.len() > config.max_symbols {
        symbols.truncate(config.max_symbols);
    }
    Ok(symbols)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_selector_all() {
        let config = MonitorConfig::default();
        assert_eq!(
            enabled_markets(&config),
            vec![MarketType::Spot, MarketType::Futures]
        );
    }

    #[test]
    fn market_selector_spot_only() {
        let mut config = MonitorConfig::default();
        config.markets = "spot".into();
        assert_eq!(enabled_markets(&config), vec![MarketType::Spot]);
    }

    #[test]
    fn market_selector_perp_only() {
        let mut config = MonitorConfig::default();
        config.markets = "perp".into();
        assert_eq!(enabled_markets(&config), vec![MarketType::Futures]);
    }

    #[test]
    fn feature_flags_override_selector() {
        let mut config = MonitorConfig::default();
        config.monitor_futures = false;
        assert_eq!(enabled_markets(&config), vec![MarketType::Spot]);
    }

    #[tokio::test]
    async fn comma_list_skips_discovery() {
        let mut config = MonitorConfig::default();
        config.markets = "btcusdt, ethusdt".into();
        let bucket = Arc::new(TokenBucket::new(10.0, 100.0));
        let client = Arc::new(
            VenueRestClient::new(Venue::binance(), "", "", bucket).unwrap(),
        );
        let volumes = Arc::new(parking_lot::RwLock::new(HashMap::new()));
        let symbols = discover_symbols(&config, &client, MarketType::Spot, &volumes)
            .await
            .unwrap();
        assert_eq!(symbols, vec!["BTCUSDT", "ETHUSDT"]);
    }
}
