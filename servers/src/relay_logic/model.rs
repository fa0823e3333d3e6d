use lib_common::markets::Candle;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Control frame sent by a downstream consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe {
        pair: String,
        #[serde(default)]
        interval: Option<u32>,
    },
    Unsubscribe {
        pair: String,
    },
    Ping,
}

/// Reply to one control frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ack {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    pub action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pair: Option<String>,
    /// Candle interval the consumer actually receives for `pair`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Ack {
    pub fn subscribed(pair: impl Into<String>, interval: u32) -> Self {
        Self {
            ok: Some(true),
            action: "subscribed",
            pair: Some(pair.into()),
            interval: Some(interval),
            error: None,
        }
    }

    pub fn unsubscribed(pair: impl Into<String>) -> Self {
        Self {
            ok: Some(true),
            action: "unsubscribed",
            pair: Some(pair.into()),
            interval: None,
            error: None,
        }
    }

    pub fn pong() -> Self {
        Self {
            ok: None,
            action: "pong",
            pair: None,
            interval: None,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: Some(false),
            action: "error",
            pair: None,
            interval: None,
            error: Some(message.into()),
        }
    }

    /// Pushed unprompted when the provider refuses a pair the consumer held.
    pub fn rejected(pair: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            pair: Some(pair.into()),
            ..Self::error(reason)
        }
    }

    pub fn to_json(&self) -> String {
        // Only strings and bools inside; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"ok":false,"action":"error"}"#.to_string())
    }
}

/// `{event: "normalized", payload}` pushed to consumers of a pair.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedFrame<'a> {
    pub event: &'static str,
    pub payload: &'a Value,
}

/// Body of `POST /compute/indicators`. Either `candles` or `symbol` must be set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeRequest {
    pub symbol: Option<String>,
    pub candles: Option<Vec<Candle>>,
    pub interval: Option<u32>,
    pub count: Option<usize>,
    #[serde(default)]
    pub indicators: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NormalizeQuery {
    pub symbol: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NormalizeResponse {
    pub input: String,
    pub canonical: String,
}
