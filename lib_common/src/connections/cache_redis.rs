//! # Redis Broadcast Transport
//!
//! Carries serialized normalized events between relay instances over a Redis
//! pub/sub channel. Publishing goes through a `ConnectionManager`, which
//! reconnects on its own. The subscriber runs on a dedicated pub/sub
//! connection in a background task that resubscribes with backoff whenever
//! that connection drops.

use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt, future};
use redis::{AsyncCommands, Client, RedisError, aio::ConnectionManager};

use crate::core::event_bus::{BroadcastTransport, TransportError, TransportHandler};
use crate::core::upstream_manager::{ReconnectDecision, ReconnectPolicy, UpstreamManager};

/// Default channel for normalized events.
pub const DEFAULT_CHANNEL: &str = "relay:normalized";

type MessageStream = Pin<Box<dyn Stream<Item = String> + Send>>;

fn redis_err(e: RedisError) -> TransportError {
    TransportError::Redis(e.to_string())
}

/// A `BroadcastTransport` backed by Redis pub/sub.
pub struct RedisTransport {
    client: Client,
    publisher: ConnectionManager,
    channel: String,
    resubscribe: ReconnectPolicy,
}

impl RedisTransport {
    /// Opens the publishing connection.
    ///
    /// # Arguments
    /// * `url` - The redis URL (e.g., "redis://127.0.0.1/").
    /// * `channel` - The pub/sub channel shared by all relay instances.
    pub async fn connect(url: &str, channel: impl Into<String>) -> Result<Self, TransportError> {
        let client = Client::open(url).map_err(redis_err)?;
        let publisher = ConnectionManager::new(client.clone()).await.map_err(redis_err)?;
        Ok(Self {
            client,
            publisher,
            channel: channel.into(),
            resubscribe: ReconnectPolicy::default(),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

/// Subscribes a fresh pub/sub connection and yields its text payloads.
async fn open_messages(client: Client, channel: String) -> Result<MessageStream, TransportError> {
    let mut pubsub = client.get_async_pubsub().await.map_err(redis_err)?;
    pubsub.subscribe(&channel).await.map_err(redis_err)?;
    log::info!("Subscribed to redis channel {}", channel);

    let messages = pubsub.into_on_message().filter_map(move |msg| {
        let payload = match msg.get_payload::<String>() {
            Ok(payload) => Some(payload),
            Err(e) => {
                log::warn!("Non-text payload on {}: {}", channel, e);
                None
            }
        };
        future::ready(payload)
    });
    Ok(Box::pin(messages))
}

/// Feeds `messages` to `handler`; when the stream ends, reopens it through
/// `open` under `policy` and carries on. Runs until the task is dropped.
async fn keep_subscribed<F, Fut>(
    channel: String,
    mut messages: MessageStream,
    mut open: F,
    policy: ReconnectPolicy,
    handler: TransportHandler,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<MessageStream, TransportError>>,
{
    let mut manager = UpstreamManager::new(policy);
    manager.on_connected();
    loop {
        while let Some(payload) = messages.next().await {
            handler(payload);
        }
        log::warn!("Redis subscription on {} ended, resubscribing", channel);
        manager.on_closed();

        messages = loop {
            let (wait, circuit_open) = match manager.schedule_reconnect(Instant::now()) {
                ReconnectDecision::Retry { delay, .. } => (delay, false),
                ReconnectDecision::CircuitOpen { cooldown } => {
                    log::warn!("Redis on {} keeps failing, pausing {:?}", channel, cooldown);
                    (cooldown, true)
                }
            };
            tokio::time::sleep(wait).await;
            if circuit_open {
                manager.close_circuit();
            }

            manager.begin_connect();
            match open().await {
                Ok(stream) => {
                    manager.on_connected();
                    break stream;
                }
                Err(e) => {
                    log::warn!("Redis resubscribe on {} failed: {}", channel, e);
                    manager.on_error(e.to_string());
                }
            }
        };
    }
}

#[async_trait]
impl BroadcastTransport for RedisTransport {
    async fn publish(&self, message: &str) -> Result<(), TransportError> {
        let mut conn = self.publisher.clone();
        let _receivers: i64 = conn.publish(&self.channel, message).await.map_err(redis_err)?;
        Ok(())
    }

    /// The first subscription happens inline so a bad server surfaces here;
    /// later drops are repaired in the background.
    async fn subscribe(&self, handler: TransportHandler) -> Result<(), TransportError> {
        let messages = open_messages(self.client.clone(), self.channel.clone()).await?;

        let client = self.client.clone();
        let channel = self.channel.clone();
        let open = move || open_messages(client.clone(), channel.clone());
        tokio::spawn(keep_subscribed(
            self.channel.clone(),
            messages,
            open,
            self.resubscribe.clone(),
            handler,
        ));
        Ok(())
    }
}
