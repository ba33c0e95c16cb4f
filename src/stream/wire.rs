// =============================================================================
// Wire Codec — streaming frame decode and subscription frames
// =============================================================================
//
// The engine consumes two payload shapes, with or without the combined
// stream envelope `{"stream": "...", "data": {...}}`:
//
//   - aggregated trade: `{"e":"aggTrade","s","p","q","m","T"}`
//   - depth, full top-N: `{"lastUpdateId","bids","asks"}`
//   - depth, incremental: `{"e":"depthUpdate","s","U","u","b","a","E"}`
//
// Binance sends numeric values as JSON strings inside event payloads.
// Malformed frames are a protocol violation: log, count, skip.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};

use crate::types::{DepthEvent, MarketType, TradeEvent};

/// A decoded inbound frame.
#[derive(Debug, Clone)]
pub enum WireMessage {
    Trade(TradeEvent),
    Depth(DepthEvent),
    /// Subscription acknowledgement (`{"result":null,"id":n}`).
    Ack { id: u64 },
    /// Anything recognised but irrelevant.
    Ignored,
}

/// Build the SUBSCRIBE control frame for a set of stream names.
pub fn subscribe_frame(streams: &[String], id: u64) -> String {
    let params: Vec<serde_json::Value> = streams
        .iter()
        .map(|s| serde_json::Value::String(s.clone()))
        .collect();
    serde_json::json!({
        "method": "SUBSCRIBE",
        "params": params,
        "id": id,
    })
    .to_string()
}

/// Stream name for a symbol's aggregated trades.
pub fn trade_stream_name(wire_symbol: &str) -> String {
    format!("{}@aggTrade", wire_symbol.to_lowercase())
}

/// Stream name for a symbol's top-20 partial depth at 100ms cadence.
pub fn depth_stream_name(wire_symbol: &str) -> String {
    format!("{}@depth20@100ms", wire_symbol.to_lowercase())
}

/// Both streams the pool subscribes per symbol.
pub fn streams_for_symbol(wire_symbol: &str) -> [String; 2] {
    [trade_stream_name(wire_symbol), depth_stream_name(wire_symbol)]
}

/// Decode one text frame into a [`WireMessage`].
pub fn parse_message(
    text: &str,
    venue: &str,
    market: MarketType,
    received_at: DateTime<Utc>,
) -> Result<WireMessage> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("frame is not valid JSON")?;

    // Subscription ack.
    if let Some(id) = root.get("id").and_then(|v| v.as_u64()) {
        if root.get("result").is_some() {
            return Ok(WireMessage::Ack { id });
        }
    }

    // Combined-stream envelope carries the stream name; the payload of a
    // partial-depth stream has no symbol field of its own.
    let (data, stream_symbol) = match root.get("stream").and_then(|v| v.as_str()) {
        Some(stream) => {
            let symbol = stream
                .split('@')
                .next()
                .map(|s| s.to_uppercase())
                .unwrap_or_default();
            (&root["data"], Some(symbol))
        }
        None => (&root, None),
    };

    let event_type = data.get("e").and_then(|v| v.as_str());

    match event_type {
        Some("aggTrade") => parse_agg_trade(data, venue, market, received_at).map(WireMessage::Trade),
        Some("depthUpdate") => {
            parse_depth_diff(data, venue, market, received_at).map(WireMessage::Depth)
        }
        None if data.get("lastUpdateId").is_some() => {
            let symbol = stream_symbol.context("partial depth without stream envelope")?;
            parse_depth_partial(data, venue, market, &symbol, received_at).map(WireMessage::Depth)
        }
        _ => Ok(WireMessage::Ignored),
    }
}

fn event_ts(data: &serde_json::Value, field: &str, fallback: DateTime<Utc>) -> DateTime<Utc> {
    data.get(field)
        .and_then(|v| v.as_i64())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or(fallback)
}

fn string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

fn parse_level_array(val: &serde_json::Value, name: &str) -> Result<Vec<(f64, f64)>> {
    let arr = val
        .as_array()
        .with_context(|| format!("missing field {name}"))?;
    let mut out = Vec::with_capacity(arr.len());
    for level in arr {
        let price = string_f64(level.get(0).context("level missing price")?, "price")?;
        let size = string_f64(level.get(1).context("level missing size")?, "size")?;
        out.push((price, size));
    }
    Ok(out)
}

fn parse_agg_trade(
    data: &serde_json::Value,
    venue: &str,
    market: MarketType,
    received_at: DateTime<Utc>,
) -> Result<TradeEvent> {
    let symbol = data["s"]
        .as_str()
        .context("aggTrade missing field s")?
        .to_uppercase();
    let price = string_f64(&data["p"], "p")?;
    let size = string_f64(&data["q"], "q")?;
    let is_buyer_maker = data["m"].as_bool().context("aggTrade missing field m")?;

    Ok(TradeEvent {
        ts: event_ts(data, "T", received_at),
        venue: venue.to_string(),
        market,
        symbol,
        price,
        size,
        is_buyer_maker,
    })
}

fn parse_depth_diff(
    data: &serde_json::Value,
    venue: &str,
    market: MarketType,
    received_at: DateTime<Utc>,
) -> Result<DepthEvent> {
    let symbol = data["s"]
        .as_str()
        .context("depthUpdate missing field s")?
        .to_uppercase();
    let first_seq = data["U"].as_u64().context("depthUpdate missing field U")?;
    let last_seq = data["u"].as_u64().context("depthUpdate missing field u")?;
    let bids = parse_level_array(&data["b"], "b")?;
    let asks = parse_level_array(&data["a"], "a")?;

    Ok(DepthEvent {
        ts: event_ts(data, "E", received_at),
        venue: venue.to_string(),
        market,
        symbol,
        bids,
        asks,
        first_seq: Some(first_seq),
        last_seq: Some(last_seq),
        is_snapshot: false,
    })
}

fn parse_depth_partial(
    data: &serde_json::Value,
    venue: &str,
    market: MarketType,
    symbol: &str,
    received_at: DateTime<Utc>,
) -> Result<DepthEvent> {
    let last_update_id = data["lastUpdateId"]
        .as_u64()
        .context("depth missing lastUpdateId")?;
    let bids = parse_level_array(&data["bids"], "bids")?;
    let asks = parse_level_array(&data["asks"], "asks")?;

    Ok(DepthEvent {
        ts: received_at,
        venue: venue.to_string(),
        market,
        symbol: symbol.to_string(),
        bids,
        asks,
        first_seq: None,
        last_seq: Some(last_update_id),
        is_snapshot: true,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn subscribe_frame_shape() {
        let frame = subscribe_frame(
            &["btcusdt@aggTrade".to_string(), "btcusdt@depth20@100ms".to_string()],
            7,
        );
        let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["method"], "SUBSCRIBE");
        assert_eq!(v["id"], 7);
        assert_eq!(v["params"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn parse_agg_trade_direct() {
        let text = r#"{"e":"aggTrade","s":"BTCUSDT","p":"37000.50","q":"0.25","m":true,"T":1700000000000}"#;
        let msg = parse_message(text, "binance", MarketType::Spot, now()).unwrap();
        match msg {
            WireMessage::Trade(t) => {
                assert_eq!(t.symbol, "BTCUSDT");
                assert!((t.price - 37_000.5).abs() < 1e-9);
                assert!((t.size - 0.25).abs() < 1e-9);
                assert!(t.is_buyer_maker);
                assert_eq!(t.ts.timestamp_millis(), 1_700_000_000_000);
            }
            other => panic!("expected trade, got {other:?}"),
        }
    }

    #[test]
    fn parse_agg_trade_in_envelope() {
        let text = r#"{"stream":"ethusdt@aggTrade","data":{"e":"aggTrade","s":"ETHUSDT","p":"2000","q":"1","m":false,"T":1700000000000}}"#;
        let msg = parse_message(text, "binance", MarketType::Futures, now()).unwrap();
        match msg {
            WireMessage::Trade(t) => {
                assert_eq!(t.symbol, "ETHUSDT");
                assert_eq!(t.market, MarketType::Futures);
                assert_eq!(t.taker_side(), crate::types::Side::Buy);
            }
            other => panic!("expected trade, got {other:?}"),
        }
    }

    #[test]
    fn parse_partial_depth_from_envelope() {
        let text = r#"{"stream":"btcusdt@depth20@100ms","data":{"lastUpdateId":42,"bids":[["100.0","1.5"]],"asks":[["101.0","2.0"]]}}"#;
        let msg = parse_message(text, "binance", MarketType::Spot, now()).unwrap();
        match msg {
            WireMessage::Depth(d) => {
                assert_eq!(d.symbol, "BTCUSDT");
                assert!(d.is_snapshot);
                assert_eq!(d.last_seq, Some(42));
                assert_eq!(d.bids, vec![(100.0, 1.5)]);
            }
            other => panic!("expected depth, got {other:?}"),
        }
    }

    #[test]
    fn parse_depth_diff() {
        let text = r#"{"e":"depthUpdate","E":1700000000000,"s":"BTCUSDT","U":10,"u":12,"b":[["99.5","0"]],"a":[["100.5","3.0"]]}"#;
        let msg = parse_message(text, "binance", MarketType::Spot, now()).unwrap();
        match msg {
            WireMessage::Depth(d) => {
                assert!(!d.is_snapshot);
                assert_eq!(d.first_seq, Some(10));
                assert_eq!(d.last_seq, Some(12));
                // size 0 denotes removal; the codec passes it through.
                assert_eq!(d.bids, vec![(99.5, 0.0)]);
            }
            other => panic!("expected depth, got {other:?}"),
        }
    }

    #[test]
    fn subscription_ack() {
        let text = r#"{"result":null,"id":3}"#;
        let msg = parse_message(text, "binance", MarketType::Spot, now()).unwrap();
        assert!(matches!(msg, WireMessage::Ack { id: 3 }));
    }

    #[test]
    fn malformed_frame_is_error() {
        assert!(parse_message("{not json", "binance", MarketType::Spot, now()).is_err());
        // Valid JSON with a broken price is an error, not a panic.
        let text = r#"{"e":"aggTrade","s":"BTCUSDT","p":"abc","q":"1","m":true}"#;
        assert!(parse_message(text, "binance", MarketType::Spot, now()).is_err());
    }

    #[test]
    fn unknown_event_ignored() {
        let text = r#"{"e":"somethingElse","s":"BTCUSDT"}"#;
        let msg = parse_message(text, "binance", MarketType::Spot, now()).unwrap();
        assert!(matches!(msg, WireMessage::Ignored));
    }

    #[test]
    fn stream_names_lowercase() {
        assert_eq!(trade_stream_name("BTCUSDT"), "btcusdt@aggTrade");
        assert_eq!(depth_stream_name("BTCUSDT"), "btcusdt@depth20@100ms");
    }
}
