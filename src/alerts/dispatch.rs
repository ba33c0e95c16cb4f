// =============================================================================
// Dispatch Fan-out — independent sinks over bounded drop-oldest queues
// =============================================================================
//
// Every finished alert is offered to each sink's own queue; a slow or dead
// sink fills its queue and sheds the oldest entries (counted), never
// blocking the gate or the other sinks.  Shutdown drains each queue under a
// deadline and drops the remainder with a counter.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::alerts::push::PushNotifier;
use crate::alerts::store::AlertStore;
use crate::metrics::Metrics;
use crate::types::{Alert, Severity};

/// Per-sink queue capacity.
const SINK_QUEUE_CAP: usize = 256;
/// How long shutdown waits for queues to drain.
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

// =============================================================================
// Bounded queue
// =============================================================================

/// Drop-oldest bounded queue shared between the gate side and a sink task.
struct SinkQueue {
    name: &'static str,
    items: Mutex<VecDeque<Alert>>,
    notify: Notify,
    cap: usize,
}

impl SinkQueue {
    fn new(name: &'static str, cap: usize) -> Self {
        Self {
            name,
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            cap,
        }
    }

    /// Push without blocking; sheds the oldest entry when full.
    fn push(&self, alert: Alert, metrics: &Metrics) {
        {
            let mut items = self.items.lock();
            if items.len() >= self.cap {
                items.pop_front();
                metrics.inc_sink_dropped(self.name);
            }
            items.push_back(alert);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Alert> {
        self.items.lock().pop_front()
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }
}

// =============================================================================
// Sinks
// =============================================================================

/// Concrete sink behaviours behind one dispatch loop.
enum SinkKind {
    Log,
    Store(Arc<AlertStore>),
    Push(Arc<PushNotifier>),
}

impl SinkKind {
    fn name(&self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Store(_) => "store",
            Self::Push(_) => "push",
        }
    }

    async fn handle(&self, alert: &Alert, metrics: &Metrics) {
        match self {
            Self::Log => {
                let severity = alert.severity.as_str().to_uppercase();
                info!(
                    severity = %severity,
                    venue = %alert.venue,
                    market = %alert.market,
                    symbol = %alert.symbol,
                    kind = %alert.kind,
                    value = format!("{:.0}", alert.value),
                    slippage = format!("{:.2}", alert.slippage_pct),
                    "{}",
                    alert.message
                );
            }
            Self::Store(store) => {
                if let Err(e) = store.save(alert) {
                    metrics.inc_sink_dropped("store");
                    warn!(error = %e, "alert store write failed, record dropped");
                }
            }
            Self::Push(notifier) => {
                let text = format_push_text(alert);
                notifier.send(&text, alert.severity).await;
            }
        }
    }
}

/// Render the push message body.
fn format_push_text(alert: &Alert) -> String {
    let icon = match alert.severity {
        Severity::High => "🚨",
        Severity::Medium => "🐋",
        Severity::Low => "📊",
    };
    let market_tag = match alert.market {
        crate::types::MarketType::Futures => "perp",
        crate::types::MarketType::Spot => "spot",
    };
    format!(
        "{icon} <b>{}</b> ({market_tag})\n{}\nvalue ${:.0} | slippage {:.2}%",
        alert.symbol, alert.message, alert.value, alert.slippage_pct
    )
}

// =============================================================================
// Fan-out
// =============================================================================

struct SinkHandle {
    queue: Arc<SinkQueue>,
    task: tokio::task::JoinHandle<()>,
}

/// Owns the sink tasks and fans finished alerts out to all of them.
pub struct DispatchFanout {
    sinks: Vec<SinkHandle>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
}

impl DispatchFanout {
    /// Spawn one task per sink.  The log sink is always present; store and
    /// push join when configured.
    pub fn spawn(
        store: Option<Arc<AlertStore>>,
        push: Option<Arc<PushNotifier>>,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> Self {
        let mut kinds = vec![SinkKind::Log];
        if let Some(store) = store {
            kinds.push(SinkKind::Store(store));
        }
        if let Some(push) = push {
            kinds.push(SinkKind::Push(push));
        }

        let sinks = kinds
            .into_iter()
            .map(|kind| {
                let queue = Arc::new(SinkQueue::new(kind.name(), SINK_QUEUE_CAP));
                let task_queue = queue.clone();
                let task_metrics = metrics.clone();
                let task_cancel = cancel.clone();
                let task = tokio::spawn(async move {
                    run_sink(kind, task_queue, task_metrics, task_cancel).await;
                });
                SinkHandle { queue, task }
            })
            .collect();

        Self {
            sinks,
            metrics,
            cancel,
        }
    }

    /// Offer an alert to every sink; never blocks.
    pub fn dispatch(&self, alert: &Alert) {
        self.metrics
            .inc_alert(alert.severity, &alert.venue, alert.kind.as_str());
        for sink in &self.sinks {
            sink.queue.push(alert.clone(), &self.metrics);
        }
    }

    /// Drain queues under the shutdown deadline, then stop the sink tasks.
    /// Remainder is dropped with counters.
    pub async fn shutdown(self) {
        let deadline = tokio::time::Instant::now() + DRAIN_DEADLINE;
        loop {
            let pending: usize = self.sinks.iter().map(|s| s.queue.len()).sum();
            if pending == 0 || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for sink in &self.sinks {
            let remaining = sink.queue.len();
            for _ in 0..remaining {
                if sink.queue.pop().is_some() {
                    self.metrics.inc_sink_dropped(sink.queue.name);
                }
            }
        }

        self.cancel.cancel();
        for sink in self.sinks {
            let _ = sink.task.await;
        }
        info!("dispatch fan-out stopped");
    }
}

async fn run_sink(
    kind: SinkKind,
    queue: Arc<SinkQueue>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) {
    loop {
        while let Some(alert) = queue.pop() {
            kind.handle(&alert, &metrics).await;
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                // Final drain after cancellation.
                while let Some(alert) = queue.pop() {
                    kind.handle(&alert, &metrics).await;
                }
                break;
            }
            _ = queue.notify.notified() => {}
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::store::sample_alert;

    #[test]
    fn queue_sheds_oldest_when_full() {
        let metrics = Metrics::new();
        let q = SinkQueue::new("test", 3);
        for i in 0..5 {
            let mut a = sample_alert("S", Severity::Low);
            a.value = i as f64;
            q.push(a, &metrics);
        }
        assert_eq!(q.len(), 3);
        assert_eq!(metrics.sink_dropped("test"), 2);
        // Oldest were shed; the queue holds 2, 3, 4.
        assert_eq!(q.pop().unwrap().value, 2.0);
    }

    #[tokio::test]
    async fn fanout_delivers_to_store_sink() {
        let metrics = Arc::new(Metrics::new());
        let store = Arc::new(AlertStore::open_in_memory().unwrap());
        let cancel = CancellationToken::new();
        let fanout = DispatchFanout::spawn(
            Some(store.clone()),
            None,
            metrics.clone(),
            cancel,
        );

        fanout.dispatch(&sample_alert("BTC-USDT", Severity::High));
        fanout.dispatch(&sample_alert("ETH-USDT", Severity::Low));

        // Give the sink tasks a moment, then shut down (which drains).
        tokio::time::sleep(Duration::from_millis(100)).await;
        fanout.shutdown().await;

        let rows = store.recent(10).unwrap();
        assert_eq!(rows.len(), 2);
        let text = metrics.render_prometheus();
        assert!(text.contains("orca_alerts_total{severity=\"high\",venue=\"binance\",kind=\"trade\"} 1"));
    }

    #[tokio::test]
    async fn dispatch_never_blocks_on_slow_sink() {
        let metrics = Arc::new(Metrics::new());
        let cancel = CancellationToken::new();
        let fanout = DispatchFanout::spawn(None, None, metrics.clone(), cancel);

        // Far more than the queue cap; dispatch must return promptly.
        let start = std::time::Instant::now();
        for _ in 0..1000 {
            fanout.dispatch(&sample_alert("S", Severity::Low));
        }
        assert!(start.elapsed() < Duration::from_secs(1));
        fanout.shutdown().await;
    }

    #[test]
    fn push_text_includes_severity_icon() {
        let a = sample_alert("BTC-USDT", Severity::High);
        let text = format_push_text(&a);
        assert!(text.contains("🚨"));
        assert!(text.contains("BTC-USDT"));
    }
}
