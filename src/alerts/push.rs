// =============================================================================
// Push Notifier — dual-channel HTTP notifications
// =============================================================================
//
// POSTs `{chat_id, text, parse_mode}` to the provider.  Two credential sets:
// High severity goes to the urgent channel, everything else to normal.  Each
// channel enforces a sliding-window rate limit (default 30/min); messages
// over the limit are dropped with a counter, never queued unbounded.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::PushChannelConfig;
use crate::metrics::Metrics;
use crate::types::Severity;

/// Per-channel message budget per window.
const DEFAULT_LIMIT_PER_MINUTE: usize = 30;
const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushChannel {
    Normal,
    Urgent,
}

impl PushChannel {
    fn name(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Urgent => "urgent",
        }
    }
}

#[derive(Serialize)]
struct PushPayload<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
}

struct ChannelState {
    config: PushChannelConfig,
    sent: Mutex<VecDeque<Instant>>,
    limit: usize,
}

impl ChannelState {
    fn new(config: PushChannelConfig, limit: usize) -> Self {
        Self {
            config,
            sent: Mutex::new(VecDeque::new()),
            limit,
        }
    }

    /// Reserve a slot in the rate window; false means drop.
    fn try_reserve(&self) -> bool {
        let mut sent = self.sent.lock();
        let now = Instant::now();
        while let Some(front) = sent.front() {
            if now.duration_since(*front) >= RATE_WINDOW {
                sent.pop_front();
            } else {
                break;
            }
        }
        if sent.len() >= self.limit {
            return false;
        }
        sent.push_back(now);
        true
    }
}

/// Dual-channel push notifier.
pub struct PushNotifier {
    normal: ChannelState,
    urgent: ChannelState,
    client: reqwest::Client,
    metrics: Arc<Metrics>,
}

impl PushNotifier {
    pub fn new(
        normal: PushChannelConfig,
        urgent: PushChannelConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self::with_limit(normal, urgent, metrics, DEFAULT_LIMIT_PER_MINUTE)
    }

    pub fn with_limit(
        normal: PushChannelConfig,
        urgent: PushChannelConfig,
        metrics: Arc<Metrics>,
        limit_per_minute: usize,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            normal: ChannelState::new(normal, limit_per_minute),
            urgent: ChannelState::new(urgent, limit_per_minute),
            client,
            metrics,
        }
    }

    fn channel_for(&self, severity: Severity) -> (PushChannel, &ChannelState) {
        match severity {
            Severity::High => (PushChannel::Urgent, &self.urgent),
            _ => (PushChannel::Normal, &self.normal),
        }
    }

    /// Whether the channel a severity maps to has credentials.
    pub fn channel_configured(&self, severity: Severity) -> bool {
        self.channel_for(severity).1.config.is_configured()
    }

    /// Send `text` on the channel for `severity`.  Returns true when the
    /// message was attempted (rate-limit drops and missing credentials
    /// return false).
    pub async fn send(&self, text: &str, severity: Severity) -> bool {
        let (channel, state) = self.channel_for(severity);

        if !state.config.is_configured() {
            debug!(channel = channel.name(), "push channel not configured, skipping");
            return false;
        }

        if !state.try_reserve() {
            self.metrics
                .push_rate_limited_total
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.metrics.inc_sink_dropped(&format!("push_{}", channel.name()));
            warn!(channel = channel.name(), "push rate limit exceeded, dropping message");
            return false;
        }

        let url = format!(
            "https://api.telegram.org/bot{}/sendMessage",
            state.config.bot_token
        );
        let payload = PushPayload {
            chat_id: &state.config.chat_id,
            text,
            parse_mode: "HTML",
        };

        match self.client.post(&url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(channel = channel.name(), "push delivered");
                true
            }
            Ok(resp) => {
                warn!(channel = channel.name(), status = %resp.status(), "push rejected by provider");
                true
            }
            Err(e) => {
                warn!(channel = channel.name(), error = %e, "push request failed");
                true
            }
        }
    }

    /// Rate-limit check without side effects beyond the reservation; used by
    /// tests to exercise the window behaviour without network calls.
    #[cfg(test)]
    fn reserve_for(&self, severity: Severity) -> bool {
        let (channel, state) = self.channel_for(severity);
        let ok = state.try_reserve();
        if !ok {
            self.metrics
                .push_rate_limited_total
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.metrics.inc_sink_dropped(&format!("push_{}", channel.name()));
        }
        ok
    }
}
