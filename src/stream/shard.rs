// =============================================================================
// Stream Shard — one supervised WebSocket connection
// =============================================================================
//
// A shard serves one subset of a (venue, market) symbol universe.  Its
// supervisor walks Disconnected -> Connecting -> Subscribing -> Streaming
// and, on any failure, Reconnecting with exponential backoff in [1s, 60s]
// and +/-25% jitter.  A shard-local retry budget decides when to roll to
// the next egress identity; the overall reconnect budget is consecutive:
// exhausting it surfaces a fatal error to the supervisor.
//
// Every reconnect applies the processor's resync barrier (ladders cleared,
// quiet period opened) before the first message of the new session.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::Engine;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::net::proxy::{ProxyEndpoint, DIRECT_IDENTITY};
use crate::net::{ConnectionGate, ProxyRotator};
use crate::metrics::Metrics;
use crate::processor::{ProcessorError, ShardProcessor};
use crate::stream::wire::{self, WireMessage};
use crate::types::MarketType;
use crate::venue::Venue;

const DIAL_TIMEOUT: Duration = Duration::from_secs(15);
/// No message for this long triggers a ping; a second idle period reconnects.
const RECEIVE_IDLE: Duration = Duration::from_secs(90);
const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);
/// Consecutive failures on one egress before rolling to the next.
const EGRESS_RETRY_BUDGET: u32 = 3;

/// Static description of one shard.
#[derive(Debug, Clone)]
pub struct ShardConfig {
    pub shard_id: String,
    pub venue: Venue,
    pub market: MarketType,
    pub wire_symbols: Vec<String>,
    pub max_reconnect_attempts: u32,
}

/// Connection state names reported to `/health`.
mod state {
    pub const CONNECTING: &str = "connecting";
    pub const SUBSCRIBING: &str = "subscribing";
    pub const STREAMING: &str = "streaming";
    pub const RECONNECTING: &str = "reconnecting";
    pub const STOPPED: &str = "stopped";
    pub const FAILED: &str = "failed";
}

/// Run one shard until cancellation (Ok) or reconnect-budget exhaustion (Err).
pub async fn run_shard(
    config: ShardConfig,
    mut processor: ShardProcessor,
    gate: Arc<ConnectionGate>,
    proxies: Arc<ProxyRotator>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> Result<()> {
    let streams: Vec<String> = config
        .wire_symbols
        .iter()
        .flat_map(|s| wire::streams_for_symbol(s))
        .collect();
    let url = config.venue.ws_url(config.market).to_string();
    let shard_id = config.shard_id.clone();

    let mut reconnect_count = 0u32;
    let mut backoff = BACKOFF_MIN;
    let mut egress: Option<&ProxyEndpoint> = None;
    let mut egress_failures = 0u32;

    loop {
        if cancel.is_cancelled() {
            metrics.set_shard_state(&shard_id, state::STOPPED);
            return Ok(());
        }
        if reconnect_count >= config.max_reconnect_attempts {
            metrics.set_shard_state(&shard_id, state::FAILED);
            error!(
                shard = %shard_id,
                attempts = reconnect_count,
                "reconnect budget exhausted, surfacing fatal error"
            );
            bail!("shard {shard_id} exhausted its reconnect budget");
        }

        // Roll egress after the local retry budget burns out.
        if egress.is_none() || egress_failures >= EGRESS_RETRY_BUDGET {
            egress = proxies.next();
            egress_failures = 0;
        }
        let identity = egress.map_or(DIRECT_IDENTITY, |e| e.display_name());

        metrics.set_shard_state(&shard_id, state::CONNECTING);
        tokio::select! {
            _ = cancel.cancelled() => {
                metrics.set_shard_state(&shard_id, state::STOPPED);
                return Ok(());
            }
            _ = gate.wait_for_slot(identity) => {}
        }

        let dial_fut = tokio::time::timeout(DIAL_TIMEOUT, dial(&url, egress));
        let ws = tokio::select! {
            _ = cancel.cancelled() => {
                metrics.set_shard_state(&shard_id, state::STOPPED);
                return Ok(());
            }
            result = dial_fut => match result {
                Ok(Ok(ws)) => ws,
                Ok(Err(e)) => {
                    warn!(shard = %shard_id, egress = identity, error = %e, "dial failed");
                    egress_failures += 1;
                    reconnect_count += 1;
                    metrics.inc_reconnect(&shard_id);
                    metrics.set_shard_state(&shard_id, state::RECONNECTING);
                    if sleep_backoff(&mut backoff, &cancel).await.is_err() {
                        return Ok(());
                    }
                    continue;
                }
                Err(_) => {
                    warn!(shard = %shard_id, egress = identity, "dial timed out");
                    egress_failures += 1;
                    reconnect_count += 1;
                    metrics.inc_reconnect(&shard_id);
                    metrics.set_shard_state(&shard_id, state::RECONNECTING);
                    if sleep_backoff(&mut backoff, &cancel).await.is_err() {
                        return Ok(());
                    }
                    continue;
                }
            }
        };

        gate.record_dial(identity).await;
        metrics.add_connections(&config.venue.id, 1);
        info!(
            shard = %shard_id,
            egress = identity,
            symbols = config.wire_symbols.len(),
            "connected"
        );

        // Subscribe to every stream for the shard in one frame.
        metrics.set_shard_state(&shard_id, state::SUBSCRIBING);
        let (mut write, mut read) = ws.split();
        let frame = wire::subscribe_frame(&streams, 1);
        if let Err(e) = write.send(Message::Text(frame)).await {
            warn!(shard = %shard_id, error = %e, "subscribe failed");
            metrics.add_connections(&config.venue.id, -1);
            egress_failures += 1;
            reconnect_count += 1;
            metrics.inc_reconnect(&shard_id);
            metrics.set_shard_state(&shard_id, state::RECONNECTING);
            if sleep_backoff(&mut backoff, &cancel).await.is_err() {
                return Ok(());
            }
            continue;
        }

        // Resync barrier: the new session's first snapshot must not read as
        // a burst of fresh orders.
        processor.resync_barrier(Utc::now());
        metrics.set_shard_state(&shard_id, state::STREAMING);

        // Successful session: reset the failure accounting.
        reconnect_count = 0;
        backoff = BACKOFF_MIN;
        egress_failures = 0;

        let mut idle_pinged = false;
        let session_result: Result<(), ()> = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    metrics.add_connections(&config.venue.id, -1);
                    metrics.set_shard_state(&shard_id, state::STOPPED);
                    return Ok(());
                }
                next = tokio::time::timeout(RECEIVE_IDLE, read.next()) => match next {
                    Err(_) => {
                        // Idle: ping once, reconnect on the second strike.
                        if idle_pinged {
                            warn!(shard = %shard_id, "receive deadline passed twice, reconnecting");
                            break Err(());
                        }
                        if write.send(Message::Ping(Vec::new())).await.is_err() {
                            break Err(());
                        }
                        idle_pinged = true;
                    }
                    Ok(None) => {
                        warn!(shard = %shard_id, "stream ended by peer");
                        break Err(());
                    }
                    Ok(Some(Err(e))) => {
                        warn!(shard = %shard_id, error = %e, "read error");
                        break Err(());
                    }
                    Ok(Some(Ok(msg))) => {
                        idle_pinged = false;
                        match msg {
                            Message::Text(text) => {
                                match wire::parse_message(&text, &config.venue.id, config.market, Utc::now()) {
                                    Ok(WireMessage::Trade(trade)) => processor.on_trade(&trade),
                                    Ok(WireMessage::Depth(depth)) => {
                                        if let Err(ProcessorError::NeedsReconnect) =
                                            processor.on_depth(&depth).await
                                        {
                                            warn!(shard = %shard_id, "depth state unrecoverable, reconnecting");
                                            break Err(());
                                        }
                                    }
                                    Ok(WireMessage::Ack { id }) => {
                                        debug!(shard = %shard_id, id, "subscription acknowledged");
                                    }
                                    Ok(WireMessage::Ignored) => {}
                                    Err(e) => {
                                        metrics
                                            .protocol_errors_total
                                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                                        warn!(shard = %shard_id, error = %e, "malformed frame skipped");
                                    }
                                }
                            }
                            // Peer pings must be answered with the same payload.
                            Message::Ping(payload) => {
                                if write.send(Message::Pong(payload)).await.is_err() {
                                    break Err(());
                                }
                            }
                            Message::Pong(_) => {}
                            Message::Close(frame) => {
                                warn!(shard = %shard_id, ?frame, "close frame received");
                                break Err(());
                            }
                            _ => {}
                        }
                    }
                }
            }
        };

        metrics.add_connections(&config.venue.id, -1);
        debug_assert!(session_result.is_err());
        let _ = session_result;

        reconnect_count += 1;
        egress_failures += 1;
        metrics.inc_reconnect(&shard_id);
        metrics.set_shard_state(&shard_id, state::RECONNECTING);
        info!(
            shard = %shard_id,
            attempt = reconnect_count,
            max = config.max_reconnect_attempts,
            "reconnecting"
        );
        if sleep_backoff(&mut backoff, &cancel).await.is_err() {
            return Ok(());
        }
    }
}

/// Exponential backoff with +/-25% jitter; Err means cancelled mid-sleep.
async fn sleep_backoff(backoff: &mut Duration, cancel: &CancellationToken) -> Result<(), ()> {
    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    let wait = backoff.mul_f64(jitter).clamp(BACKOFF_MIN, BACKOFF_MAX);
    *backoff = (*backoff * 2).min(BACKOFF_MAX);

    tokio::select! {
        _ = cancel.cancelled() => Err(()),
        _ = tokio::time::sleep(wait) => Ok(()),
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<TcpStream>,
>;

/// Dial directly or tunnel through an HTTP CONNECT proxy.
async fn dial(url: &str, proxy: Option<&ProxyEndpoint>) -> Result<WsStream> {
    match proxy {
        None => {
            let (ws, _resp) = tokio_tungstenite::connect_async(url)
                .await
                .context("direct dial failed")?;
            Ok(ws)
        }
        Some(proxy) => {
            let stream = connect_through_proxy(url, proxy).await?;
            let (ws, _resp) = tokio_tungstenite::client_async_tls(url, stream)
                .await
                .context("websocket handshake over proxy tunnel failed")?;
            Ok(ws)
        }
    }
}

/// Establish a raw TCP tunnel to the target host via HTTP CONNECT.
async fn connect_through_proxy(url: &str, proxy: &ProxyEndpoint) -> Result<TcpStream> {
    // Target host:port from the wss URL.
    let rest = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url);
    let host_part = rest.split('/').next().unwrap_or(rest);
    let target = if host_part.contains(':') {
        host_part.to_string()
    } else {
        format!("{host_part}:443")
    };

    let mut stream = TcpStream::connect(proxy.host_port())
        .await
        .with_context(|| format!("proxy dial failed ({})", proxy.display_name()))?;

    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(userinfo) = proxy.userinfo() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(userinfo);
        request.push_str(&format!("Proxy-Authorization: Basic {encoded}\r\n"));
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .context("failed to send CONNECT")?;

    // Read the status line plus headers (up to a small bound).
    let mut buf = [0u8; 1024];
    let mut response = Vec::new();
    loop {
        let n = stream
            .read(&mut buf)
            .await
            .context("failed to read CONNECT response")?;
        if n == 0 {
            bail!("proxy closed during CONNECT");
        }
        response.extend_from_slice(&buf[..n]);
        if response.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if response.len() > 8192 {
            bail!("oversized CONNECT response");
        }
    }

    let head = String::from_utf8_lossy(&response);
    let status_line = head.lines().next().unwrap_or_default();
    if !status_line.contains(" 200 ") && !status_line.ends_with(" 200") {
        bail!("proxy refused CONNECT: {status_line}");
    }

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        // Deterministic part of the backoff policy: doubling with the cap.
        let mut b = BACKOFF_MIN;
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(b);
            b = (b * 2).min(BACKOFF_MAX);
        }
        assert_eq!(seen[0], Duration::from_secs(1));
        assert_eq!(seen[5], Duration::from_secs(32));
        assert_eq!(seen[6], Duration::from_secs(60));
        assert_eq!(seen[7], Duration::from_secs(60));
    }

    #[tokio::test]
    async fn sleep_backoff_respects_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut b = Duration::from_secs(30);
        assert!(sleep_backoff(&mut b, &cancel).await.is_err());
    }

    #[test]
    fn connect_target_derivation() {
        // The host part of a wss URL without an explicit port maps to :443.
        let rest = "wss://stream.binance.com/stream"
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap();
        let host_part = rest.split('/').next().unwrap();
        assert_eq!(host_part, "stream.binance.com");

        let rest = "wss://stream.binance.com:9443/stream"
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap();
        let host_part = rest.split('/').next().unwrap();
        assert_eq!(host_part, "stream.binance.com:9443");
    }
}
