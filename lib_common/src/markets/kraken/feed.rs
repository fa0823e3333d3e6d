//! Kraken WebSocket v1 frames.
//!
//! Outbound control frames are JSON objects keyed by `event`. Inbound frames
//! are either such objects (acks, heartbeats, status) or channel data arrays
//! `[channelID, payload..., channelName, pair]`.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::core::event_bus::RawEvent;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("upstream frame is not JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

/// The `subscription` object of a subscribe/unsubscribe frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<u32>,
}

impl SubscriptionSpec {
    /// OHLC candles at `interval` minutes.
    pub fn ohlc(interval: u32) -> Self {
        Self {
            name: "ohlc".to_string(),
            interval: Some(interval),
        }
    }
}

pub fn subscribe_frame(wire_pairs: &[String], spec: &SubscriptionSpec) -> String {
    json!({ "event": "subscribe", "pair": wire_pairs, "subscription": spec }).to_string()
}

pub fn unsubscribe_frame(wire_pairs: &[String], spec: &SubscriptionSpec) -> String {
    json!({ "event": "unsubscribe", "pair": wire_pairs, "subscription": spec }).to_string()
}

pub fn ping_frame() -> String {
    json!({ "event": "ping" }).to_string()
}

/// Body of a `subscriptionStatus` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatus {
    #[serde(rename = "channelID")]
    pub channel_id: Option<u64>,
    pub channel_name: Option<String>,
    pub pair: Option<String>,
    pub status: String,
    pub error_message: Option<String>,
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamFrame {
    SubscriptionStatus(SubscriptionStatus),
    Heartbeat,
    SystemStatus { status: String },
    Pong,
    ChannelData {
        channel_id: u64,
        channel_name: Option<String>,
        pair: Option<String>,
        payload: Value,
    },
    Unrecognized(Value),
}

/// Parses and classifies one text frame.
pub fn classify(text: &str) -> Result<UpstreamFrame, FeedError> {
    let value: Value = serde_json::from_str(text)?;
    Ok(classify_value(value))
}

fn classify_value(value: Value) -> UpstreamFrame {
    match &value {
        Value::Object(map) => match map.get("event").and_then(Value::as_str) {
            Some("heartbeat") => UpstreamFrame::Heartbeat,
            Some("pong") => UpstreamFrame::Pong,
            Some("systemStatus") => UpstreamFrame::SystemStatus {
                status: map
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
            },
            Some("subscriptionStatus") => match serde_json::from_value(value.clone()) {
                Ok(status) => UpstreamFrame::SubscriptionStatus(status),
                Err(_) => UpstreamFrame::Unrecognized(value),
            },
            _ => UpstreamFrame::Unrecognized(value),
        },
        Value::Array(items) if items.len() >= 2 => {
            let Some(channel_id) = items[0].as_u64() else {
                return UpstreamFrame::Unrecognized(value);
            };
            // Trailing strings are channelName then pair.
            let mut tail = items.iter().rev().map_while(Value::as_str);
            let pair = tail.next().map(str::to_string);
            let channel_name = tail.next().map(str::to_string);
            UpstreamFrame::ChannelData {
                channel_id,
                channel_name,
                pair,
                payload: items[1].clone(),
            }
        }
        _ => UpstreamFrame::Unrecognized(value),
    }
}

fn num(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// `ohlc-5` -> 5
pub fn channel_interval(channel_name: &str) -> Option<u32> {
    channel_name.strip_prefix("ohlc-")?.parse().ok()
}

/// Builds a bus event from an OHLC channel payload
/// `[time, etime, open, high, low, close, vwap, volume, count]`.
///
/// Returns `None` when the channel is not OHLC or the payload is not the
/// expected array.
pub fn ohlc_event(channel_name: &str, wire_pair: &str, canonical: &str, payload: &Value) -> Option<RawEvent> {
    if !channel_name.starts_with("ohlc") {
        return None;
    }
    let fields = payload.as_array()?;
    if fields.len() < 8 {
        return None;
    }
    let time = num(fields.first())?;
    let timestamp_ms = (time * 1000.0) as i64;
    let body = json!({
        "timestamp": timestamp_ms,
        "time": time,
        "endTime": num(fields.get(1)),
        "open": num(fields.get(2)),
        "high": num(fields.get(3)),
        "low": num(fields.get(4)),
        "close": num(fields.get(5)),
        "vwap": num(fields.get(6)),
        "volume": num(fields.get(7)),
        "count": fields.get(8).and_then(Value::as_u64),
        "interval": channel_interval(channel_name),
    });
    Some(
        RawEvent::new("ohlc", wire_pair, body)
            .with_canonical(canonical)
            .with_source("ws")
            .with_created_at(timestamp_ms),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_frame_uses_wire_names() {
        let frame = subscribe_frame(&["XBT/USD".to_string()], &SubscriptionSpec::ohlc(5));
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            value,
            json!({"event": "subscribe", "pair": ["XBT/USD"], "subscription": {"name": "ohlc", "interval": 5}})
        );
        let frame = unsubscribe_frame(&["XRP/USD".to_string()], &SubscriptionSpec::ohlc(1));
        assert!(frame.contains(r#""event":"unsubscribe""#));
    }

    #[test]
    fn classifies_control_events() {
        assert_eq!(classify(r#"{"event":"heartbeat"}"#).unwrap(), UpstreamFrame::Heartbeat);
        assert_eq!(classify(r#"{"event":"pong","reqid":1}"#).unwrap(), UpstreamFrame::Pong);
        assert_eq!(
            classify(r#"{"connectionID":1,"event":"systemStatus","status":"online","version":"1.9.0"}"#).unwrap(),
            UpstreamFrame::SystemStatus { status: "online".to_string() }
        );
    }

    #[test]
    fn classifies_subscription_ack_and_error() {
        let ack = classify(
            r#"{"channelID":42,"channelName":"ohlc-1","event":"subscriptionStatus","pair":"XBT/USD","status":"subscribed","subscription":{"interval":1,"name":"ohlc"}}"#,
        )
        .unwrap();
        let UpstreamFrame::SubscriptionStatus(status) = ack else {
            panic!("expected ack, got {ack:?}");
        };
        assert_eq!(status.channel_id, Some(42));
        assert_eq!(status.pair.as_deref(), Some("XBT/USD"));
        assert_eq!(status.status, "subscribed");

        let err = classify(
            r#"{"errorMessage":"Currency pair not supported","event":"subscriptionStatus","pair":"FOO/BAR","status":"error"}"#,
        )
        .unwrap();
        let UpstreamFrame::SubscriptionStatus(status) = err else {
            panic!("expected ack");
        };
        assert_eq!(status.channel_id, None);
        assert_eq!(status.error_message.as_deref(), Some("Currency pair not supported"));
    }

    #[test]
    fn classifies_channel_data_with_trailing_names() {
        let frame = classify(
            r#"[42,["1542057314.748456","1542057360.435743","3586.70000","3586.70000","3586.60000","3586.60000","3586.68894","0.03373000",2],"ohlc-1","XBT/USD"]"#,
        )
        .unwrap();
        match frame {
            UpstreamFrame::ChannelData { channel_id, channel_name, pair, payload } => {
                assert_eq!(channel_id, 42);
                assert_eq!(channel_name.as_deref(), Some("ohlc-1"));
                assert_eq!(pair.as_deref(), Some("XBT/USD"));
                assert!(payload.is_array());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_shapes_and_bad_json() {
        assert!(matches!(classify(r#"{"hello":1}"#).unwrap(), UpstreamFrame::Unrecognized(_)));
        assert!(matches!(classify(r#"["a","b"]"#).unwrap(), UpstreamFrame::Unrecognized(_)));
        assert!(matches!(classify("42").unwrap(), UpstreamFrame::Unrecognized(_)));
        assert!(classify("not json").is_err());
    }

    #[test]
    fn ohlc_payload_becomes_raw_event() {
        let payload = json!(["1542057314.748456","1542057360.435743","3586.7","3586.9","3586.6","3586.8","3586.68894","0.03373",2]);
        let event = ohlc_event("ohlc-5", "XBT/USD", "XBTUSD", &payload).unwrap();
        assert_eq!(event.event_type.as_deref(), Some("ohlc"));
        assert_eq!(event.symbol.as_deref(), Some("XBT/USD"));
        assert_eq!(event.canonical_symbol.as_deref(), Some("XBTUSD"));
        assert_eq!(event.created_at, Some(1_542_057_314_748));

        let body = event.payload.unwrap();
        assert_eq!(body["timestamp"], 1_542_057_314_748i64);
        assert_eq!(body["close"], 3586.8);
        assert_eq!(body["count"], 2);
        assert_eq!(body["interval"], 5);

        assert!(ohlc_event("ticker", "XBT/USD", "XBTUSD", &payload).is_none());
        assert!(ohlc_event("ohlc-1", "XBT/USD", "XBTUSD", &json!({"a": 1})).is_none());
    }
}
