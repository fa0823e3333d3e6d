//! # Normalized Event Bus
//!
//! Converts provider-specific payloads into a single `NormalizedEvent`
//! envelope and republishes it:
//!
//! 1.  **Locally**, on a tokio broadcast channel. Publishing never waits for
//!     listeners; slow listeners lag and lose the oldest events.
//! 2.  **Across processes**, through an optional [`BroadcastTransport`]. The
//!     transport call runs on its own task and its failures are logged and
//!     swallowed, so the bus degrades to single-process mode on its own.
//!
//! Validation is advisory. Missing mandatory fields are filled with defaults
//! and reported as warnings; delivery still happens.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::broadcast;

/// Payload keys accepted as the event timestamp.
const TIMESTAMP_KEYS: [&str; 3] = ["timestamp", "time", "ts"];

/// How many of our own event ids are remembered for echo suppression.
const RECENT_ID_CAPACITY: usize = 4096;

/// The canonical envelope every market event is converted into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEvent {
    pub id: String,
    /// Source timestamp in Unix milliseconds.
    pub created_at: i64,
    /// Time this process observed the event, Unix milliseconds.
    pub observed_at: i64,
    pub latency_ms: i64,
    pub provider: String,
    pub source_kind: String,
    pub event_type: String,
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_symbol: Option<String>,
    pub payload: Value,
}

/// Partially filled event as produced by an ingestor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub id: Option<String>,
    pub created_at: Option<i64>,
    pub observed_at: Option<i64>,
    pub provider: Option<String>,
    pub source_kind: Option<String>,
    pub event_type: Option<String>,
    pub symbol: Option<String>,
    pub canonical_symbol: Option<String>,
    pub payload: Option<Value>,
}

impl RawEvent {
    pub fn new(event_type: impl Into<String>, symbol: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: Some(event_type.into()),
            symbol: Some(symbol.into()),
            payload: Some(payload),
            ..Self::default()
        }
    }

    pub fn with_canonical(mut self, canonical: impl Into<String>) -> Self {
        self.canonical_symbol = Some(canonical.into());
        self
    }

    pub fn with_source(mut self, source_kind: impl Into<String>) -> Self {
        self.source_kind = Some(source_kind.into());
        self
    }

    pub fn with_created_at(mut self, created_at_ms: i64) -> Self {
        self.created_at = Some(created_at_ms);
        self
    }
}

/// A mandatory field that was missing or malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationWarning {
    MissingEventType,
    MissingSymbol,
    MissingPayload,
    PayloadNotObject,
    MissingPayloadTimestamp,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Fills defaults for every missing envelope field.
///
/// `now_ms` is used for `observedAt` and, when absent, `createdAt`.
pub fn normalize(raw: RawEvent, default_provider: &str, now_ms: i64) -> (NormalizedEvent, Vec<ValidationWarning>) {
    let mut warnings = Vec::new();

    let event_type = non_empty(raw.event_type).unwrap_or_else(|| {
        warnings.push(ValidationWarning::MissingEventType);
        "unknown".to_string()
    });
    let symbol = non_empty(raw.symbol).unwrap_or_else(|| {
        warnings.push(ValidationWarning::MissingSymbol);
        "UNKNOWN".to_string()
    });

    let payload = match raw.payload {
        Some(Value::Object(map)) => map,
        Some(Value::Null) | None => {
            warnings.push(ValidationWarning::MissingPayload);
            Map::new()
        }
        Some(other) => {
            warnings.push(ValidationWarning::PayloadNotObject);
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };
    if !TIMESTAMP_KEYS.iter().any(|key| payload.contains_key(*key)) {
        warnings.push(ValidationWarning::MissingPayloadTimestamp);
    }

    let observed_at = raw.observed_at.unwrap_or(now_ms);
    let created_at = raw.created_at.unwrap_or(observed_at);

    let event = NormalizedEvent {
        id: non_empty(raw.id).unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        created_at,
        observed_at,
        latency_ms: (observed_at - created_at).max(0),
        provider: non_empty(raw.provider).unwrap_or_else(|| default_provider.to_string()),
        source_kind: non_empty(raw.source_kind).unwrap_or_else(|| "ws".to_string()),
        event_type,
        symbol,
        canonical_symbol: non_empty(raw.canonical_symbol),
        payload: Value::Object(payload),
    };
    (event, warnings)
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("redis transport error: {0}")]
    Redis(String),
    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Callback invoked with each raw message received from the transport.
pub type TransportHandler = Box<dyn Fn(String) + Send + Sync>;

/// Cross-process broadcast channel shared by relay instances.
#[async_trait]
pub trait BroadcastTransport: Send + Sync {
    /// Publishes one serialized event.
    async fn publish(&self, message: &str) -> Result<(), TransportError>;

    /// Starts delivering messages from other publishers to `handler`.
    async fn subscribe(&self, handler: TransportHandler) -> Result<(), TransportError>;
}

/// Bounded memory of ids this process published.
#[derive(Debug, Default)]
struct RecentIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl RecentIds {
    fn remember(&mut self, id: &str) {
        if self.ids.insert(id.to_string()) {
            self.order.push_back(id.to_string());
        }
        while self.order.len() > RECENT_ID_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }
}

/// Local + cross-process event bus.
pub struct EventBus {
    provider: String,
    local_tx: broadcast::Sender<Arc<NormalizedEvent>>,
    transport: Option<Arc<dyn BroadcastTransport>>,
    published: Arc<Mutex<RecentIds>>,
}

impl EventBus {
    /// Creates a single-process bus. `capacity` bounds how far a listener can
    /// lag before it starts losing events.
    pub fn new(provider: impl Into<String>, capacity: usize) -> Self {
        let (local_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            provider: provider.into(),
            local_tx,
            transport: None,
            published: Arc::new(Mutex::new(RecentIds::default())),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn BroadcastTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    /// New listener on the local stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<NormalizedEvent>> {
        self.local_tx.subscribe()
    }

    /// Normalizes and republishes `raw`, returning the canonical event.
    pub fn publish(&self, raw: RawEvent) -> NormalizedEvent {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let (event, warnings) = normalize(raw, &self.provider, now_ms);
        if !warnings.is_empty() {
            log::warn!(
                "Normalized event {} ({} {}) failed validation: {:?}",
                event.id,
                event.event_type,
                event.symbol,
                warnings
            );
        }

        // No listeners is not an error for a fire-and-forget bus.
        let _ = self.local_tx.send(Arc::new(event.clone()));

        if let Some(transport) = &self.transport {
            self.published
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remember(&event.id);
            self.forward_remote(Arc::clone(transport), &event);
        }
        event
    }

    fn forward_remote(&self, transport: Arc<dyn BroadcastTransport>, event: &NormalizedEvent) {
        let message = match serde_json::to_string(event) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Dropping cross-process publish of {}: {}", event.id, e);
                return;
            }
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            log::debug!("No runtime available, skipping cross-process publish");
            return;
        };
        handle.spawn(async move {
            if let Err(e) = transport.publish(&message).await {
                log::warn!("Cross-process publish failed: {}", e);
            }
        });
    }

    /// Starts receiving events published by other relay instances and feeds
    /// them to local listeners. Events this process published are skipped.
    pub async fn attach_remote(&self) -> Result<(), TransportError> {
        let Some(transport) = &self.transport else {
            return Ok(());
        };
        let local_tx = self.local_tx.clone();
        let published = Arc::clone(&self.published);

        let handler: TransportHandler = Box::new(move |message: String| {
            let event = match serde_json::from_str::<NormalizedEvent>(&message) {
                Ok(event) => event,
                Err(e) => {
                    log::warn!("Ignoring malformed cross-process event: {}", e);
                    return;
                }
            };
            let own = published
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&event.id);
            if !own {
                let _ = local_tx.send(Arc::new(event));
            }
        });
        transport.subscribe(handler).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn complete_event_passes_validation() {
        let raw = RawEvent::new("ohlc", "XBT/USD", json!({"timestamp": 1_000, "close": 1.0}))
            .with_canonical("XBTUSD")
            .with_created_at(1_000);
        let (event, warnings) = normalize(raw, "kraken", 1_250);

        assert!(warnings.is_empty());
        assert_eq!(event.provider, "kraken");
        assert_eq!(event.source_kind, "ws");
        assert_eq!(event.latency_ms, 250);
        assert_eq!(event.canonical_symbol.as_deref(), Some("XBTUSD"));
        assert!(!event.id.is_empty());
    }

    #[test]
    fn missing_fields_are_defaulted_and_reported() {
        let (event, warnings) = normalize(RawEvent::default(), "kraken", 5_000);

        assert_eq!(event.event_type, "unknown");
        assert_eq!(event.symbol, "UNKNOWN");
        assert_eq!(event.payload, json!({}));
        assert_eq!(event.created_at, 5_000);
        assert_eq!(event.latency_ms, 0);
        assert_eq!(
            warnings,
            vec![
                ValidationWarning::MissingEventType,
                ValidationWarning::MissingSymbol,
                ValidationWarning::MissingPayload,
                ValidationWarning::MissingPayloadTimestamp,
            ]
        );
    }

    #[test]
    fn scalar_payload_is_wrapped() {
        let raw = RawEvent::new("trade", "XBTUSD", json!(42.5));
        let (event, warnings) = normalize(raw, "kraken", 0);
        assert_eq!(event.payload, json!({"value": 42.5}));
        assert!(warnings.contains(&ValidationWarning::PayloadNotObject));
    }

    #[test]
    fn envelope_serializes_in_camel_case() {
        let raw = RawEvent::new("ohlc", "XBT/USD", json!({"ts": 1})).with_canonical("XBTUSD");
        let (event, _) = normalize(raw, "kraken", 10);
        let value = serde_json::to_value(&event).unwrap();
        for key in ["id", "createdAt", "observedAt", "latencyMs", "provider", "sourceKind", "eventType", "symbol", "canonicalSymbol", "payload"] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
    }

    #[tokio::test]
    async fn invalid_events_are_still_delivered_locally() {
        let bus = EventBus::new("kraken", 16);
        let mut rx = bus.subscribe();

        let published = bus.publish(RawEvent::default());
        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, published.id);
    }

    struct FailingTransport;

    #[async_trait]
    impl BroadcastTransport for FailingTransport {
        async fn publish(&self, _message: &str) -> Result<(), TransportError> {
            Err(TransportError::Unavailable("down".to_string()))
        }

        async fn subscribe(&self, _handler: TransportHandler) -> Result<(), TransportError> {
            Err(TransportError::Unavailable("down".to_string()))
        }
    }

    #[tokio::test]
    async fn transport_failures_do_not_block_local_delivery() {
        let bus = EventBus::new("kraken", 16).with_transport(Arc::new(FailingTransport));
        let mut rx = bus.subscribe();

        bus.publish(RawEvent::new("ohlc", "XBTUSD", json!({"timestamp": 1})));
        assert!(rx.recv().await.is_ok());
        assert!(bus.attach_remote().await.is_err());
    }

    /// In-memory transport that loops every published message back to the
    /// subscribed handler, as a shared broker would.
    #[derive(Default)]
    struct LoopbackTransport {
        handler: Mutex<Option<TransportHandler>>,
    }

    #[async_trait]
    impl BroadcastTransport for LoopbackTransport {
        async fn publish(&self, message: &str) -> Result<(), TransportError> {
            if let Some(handler) = self.handler.lock().unwrap().as_ref() {
                handler(message.to_string());
            }
            Ok(())
        }

        async fn subscribe(&self, handler: TransportHandler) -> Result<(), TransportError> {
            *self.handler.lock().unwrap() = Some(handler);
            Ok(())
        }
    }

    #[tokio::test]
    async fn own_events_are_not_echoed_but_foreign_ones_arrive() {
        let transport = Arc::new(LoopbackTransport::default());
        let bus = EventBus::new("kraken", 16).with_transport(transport.clone());
        bus.attach_remote().await.unwrap();
        let mut rx = bus.subscribe();

        let own = bus.publish(RawEvent::new("ohlc", "XBTUSD", json!({"timestamp": 1})));
        assert_eq!(rx.recv().await.unwrap().id, own.id);

        // Give the spawned publish a chance to loop back.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());

        let (foreign, _) = normalize(RawEvent::new("ohlc", "ETHUSD", json!({"timestamp": 2})), "kraken", 2);
        transport.publish(&serde_json::to_string(&foreign).unwrap()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().id, foreign.id);
    }
}
