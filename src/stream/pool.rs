// =============================================================================
// Stream Client Pool — shards symbols across supervised connections
// =============================================================================
//
// The pool plans one shard per `symbols_per_connection` slice of each
// (venue, market) universe, scales the plan down to the egress dial budget
// when oversubscribed, and spawns one supervised shard task per slice.  A
// shard that exhausts its reconnect budget reports through the fatal
// channel; the supervisor decides between restart and shutdown.
// =============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::MonitorConfig;
use crate::metrics::Metrics;
use crate::net::{ConnectionGate, ProxyRotator};
use crate::processor::{ShardProcessor, SharedPipeline};
use crate::rest::VenueRestClient;
use crate::stream::shard::{run_shard, ShardConfig};
use crate::types::MarketType;
use crate::venue::Venue;

/// A planned (but not yet spawned) shard.
#[derive(Debug, Clone)]
pub struct ShardPlan {
    pub venue: Venue,
    pub market: MarketType,
    pub wire_symbols: Vec<String>,
}

/// Report sent to the supervisor when a shard gives up.
#[derive(Debug, Clone)]
pub struct FatalShard {
    pub shard_id: String,
    pub plan: ShardPlan,
}

/// Split `symbols` into at most `max_shards` chunks of up to `per_conn`,
/// expanding the per-shard symbol count when the budget binds.
pub fn plan_chunks(symbols: &[String], per_conn: usize, max_shards: usize) -> Vec<Vec<String>> {
    if symbols.is_empty() {
        return Vec::new();
    }
    let per_conn = per_conn.max(1);
    let mut shard_count = symbols.len().div_ceil(per_conn);
    if max_shards > 0 && shard_count > max_shards {
        shard_count = max_shards;
    }
    let chunk = symbols.len().div_ceil(shard_count);
    symbols.chunks(chunk).map(|c| c.to_vec()).collect()
}

/// Produce the full shard plan for every (venue, market) universe, scaled to
/// the egress dial budget.
pub fn plan_shards(
    universes: &[(Venue, MarketType, Vec<String>)],
    config: &MonitorConfig,
    egress_count: usize,
) -> Vec<ShardPlan> {
    // Theoretical shard demand per universe.
    let mut demands: Vec<usize> = universes
        .iter()
        .map(|(_, market, symbols)| {
            let per_conn = match market {
                MarketType::Spot => config.symbols_per_conn_spot,
                MarketType::Futures => config.symbols_per_conn_futures,
            };
            symbols.len().div_ceil(per_conn.max(1)).max(1)
        })
        .collect();

    let budget = egress_count.max(1) * config.max_connections_per_egress.max(1);
    let total: usize = demands.iter().sum();
    if total > budget {
        warn!(
            total,
            budget, "shard demand exceeds egress budget, scaling down proportionally"
        );
        for demand in demands.iter_mut() {
            *demand = ((*demand * budget) / total).max(1);
        }
    }

    let mut plans = Vec::new();
    for ((venue, market, symbols), allowed) in universes.iter().zip(demands) {
        if symbols.is_empty() {
            continue;
        }
        let per_conn = match market {
            MarketType::Spot => config.symbols_per_conn_spot,
            MarketType::Futures => config.symbols_per_conn_futures,
        };
        for chunk in plan_chunks(symbols, per_conn, allowed) {
            plans.push(ShardPlan {
                venue: venue.clone(),
                market: *market,
                wire_symbols: chunk,
            });
        }
    }
    plans
}

/// Owns the running shard tasks.
pub struct StreamPool {
    config: Arc<MonitorConfig>,
    shared: SharedPipeline,
    gate: Arc<ConnectionGate>,
    proxies: Arc<ProxyRotator>,
    metrics: Arc<Metrics>,
    rest_clients: Vec<(String, Arc<VenueRestClient>)>,
    cancel: CancellationToken,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    fatal_tx: mpsc::Sender<FatalShard>,
}

impl StreamPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<MonitorConfig>,
        shared: SharedPipeline,
        gate: Arc<ConnectionGate>,
        proxies: Arc<ProxyRotator>,
        metrics: Arc<Metrics>,
        rest_clients: Vec<(String, Arc<VenueRestClient>)>,
        cancel: CancellationToken,
        fatal_tx: mpsc::Sender<FatalShard>,
    ) -> Self {
        Self {
            config,
            shared,
            gate,
            proxies,
            metrics,
            rest_clients,
            cancel,
            handles: Mutex::new(Vec::new()),
            fatal_tx,
        }
    }

    fn rest_for(&self, venue_id: &str) -> Option<Arc<VenueRestClient>> {
        self.rest_clients
            .iter()
            .find(|(id, _)| id == venue_id)
            .map(|(_, client)| client.clone())
    }

    /// Spawn one supervised task per plan entry.
    pub fn spawn_shards(&self, plans: Vec<ShardPlan>) {
        let mut counters: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        for plan in plans {
            self.spawn_shard(plan, &mut counters);
        }
    }

    /// Spawn a single shard (also used by the supervisor's restart policy).
    pub fn respawn(&self, plan: ShardPlan) {
        let mut counters = std::collections::HashMap::new();
        self.spawn_shard(plan, &mut counters);
    }

    fn spawn_shard(
        &self,
        plan: ShardPlan,
        counters: &mut std::collections::HashMap<String, usize>,
    ) {
        let group = format!("{}-{}", plan.venue.id, plan.market);
        let index = counters.entry(group.clone()).or_insert(0);
        let shard_id = format!("{group}-{index}");
        *index += 1;

        let shard_config = ShardConfig {
            shard_id: shard_id.clone(),
            venue: plan.venue.clone(),
            market: plan.market,
            wire_symbols: plan.wire_symbols.clone(),
            max_reconnect_attempts: self.config.max_reconnect_attempts,
        };

        let processor = ShardProcessor::new(
            plan.venue.id.clone(),
            plan.market,
            self.config.clone(),
            self.shared.clone(),
            self.rest_for(&plan.venue.id),
        );

        let gate = self.gate.clone();
        let proxies = self.proxies.clone();
        let metrics = self.metrics.clone();
        let cancel = self.cancel.clone();
        let fatal_tx = self.fatal_tx.clone();

        info!(
            shard = %shard_id,
            symbols = plan.wire_symbols.len(),
            "spawning stream shard"
        );

        let handle = tokio::spawn(async move {
            if let Err(e) = run_shard(shard_config, processor, gate, proxies, metrics, cancel).await
            {
                warn!(shard = %shard_id, error = %e, "shard terminated fatally");
                let _ = fatal_tx.send(FatalShard { shard_id, plan }).await;
            }
        });
        self.handles.lock().push(handle);
    }

    /// Cancel every shard and wait for drain.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("stream pool stopped");
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn symbols(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("SYM{i}USDT")).collect()
    }

    #[test]
    fn chunking_respects_per_conn_cap() {
        let chunks = plan_chunks(&symbols(150), 60, 0);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= 60));
        let total: usize = chunks.iter().map(Vec::len).sum();
        assert_eq!(total, 150);
    }

    #[test]
    fn chunking_expands_per_shard_under_budget() {
        // 150 symbols want 3 shards of 60; budget of 2 forces 75 each.
        let chunks = plan_chunks(&symbols(150), 60, 2);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 75);
    }

    #[test]
    fn plan_uses_market_specific_caps() {
        let config = MonitorConfig::default();
        let universes = vec![
            (Venue::binance(), MarketType::Spot, symbols(120)),
            (Venue::binance(), MarketType::Futures, symbols(50)),
        ];
        let plans = plan_shards(&universes, &config, 1);

        let spot: Vec<_> = plans.iter().filter(|p| p.market == MarketType::Spot).collect();
        let futures: Vec<_> = plans
            .iter()
            .filter(|p| p.market == MarketType::Futures)
            .collect();
        // 120 spot / 60 per conn = 2 shards; 50 futures / 25 per conn = 2.
        assert_eq!(spot.len(), 2);
        assert_eq!(futures.len(), 2);
    }

    #[test]
    fn plan_scales_down_to_egress_budget() {
        let mut config = MonitorConfig::default();
        config.symbols_per_conn_spot = 1;
        config.max_connections_per_egress = 10;
        let universes = vec![(Venue::binance(), MarketType::Spot, symbols(100))];

        // 100 desired shards vs budget 10: scaled to 10 shards of 10.
        let plans = plan_shards(&universes, &config, 1);
        assert_eq!(plans.len(), 10);
        assert!(plans.iter().all(|p| p.wire_symbols.len() == 10));
    }

    #[test]
    fn empty_universe_produces_no_plans() {
        let config = MonitorConfig::default();
        let universes = vec![(Venue::binance(), MarketType::Spot, Vec::new())];
        assert!(plan_shards(&universes, &config, 1).is_empty());
    }
}
