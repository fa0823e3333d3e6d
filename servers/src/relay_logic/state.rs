use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use lib_common::core::dispatcher::{Dispatcher, RelayFrame};
use lib_common::core::event_bus::{EventBus, NormalizedEvent};
use lib_common::core::registry::{ConsumerId, Registry, RegistryError, SubscribeOutcome, UnsubscribeOutcome};
use lib_common::core::upstream_manager::{ReconnectPolicy, UpstreamManager, UpstreamStatus};
use lib_common::core::{RateLimiter, RelayMetrics, TtlCache};
use lib_common::markets::Candle;
use lib_common::markets::kraken::feed::{self, UpstreamFrame};
use lib_common::markets::kraken::symbols::normalize_alias;
use lib_common::markets::kraken::{CandleSource, SymbolResolver};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::relay_logic::config::Settings;
use crate::relay_logic::model::{Ack, ClientMessage, NormalizedFrame};

/// Work for the upstream connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamCommand {
    Subscribe { pair: String, interval: u32 },
    Unsubscribe { pair: String },
    /// The provider refused `pair`; it is no longer live on this connection.
    Rejected { pair: String },
}

/// Interest recorded by a successful subscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub pair: String,
    /// Interval of the shared upstream channel, which may differ from the
    /// one requested when another consumer subscribed first.
    pub interval: u32,
}

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub registry: Arc<Registry>,
    pub dispatcher: Arc<Dispatcher>,
    pub bus: Arc<EventBus>,
    pub resolver: Arc<SymbolResolver>,
    pub history: Arc<dyn CandleSource>,
    pub history_cache: Arc<TtlCache<Arc<Vec<Candle>>>>,
    pub compute_cache: Arc<TtlCache<Value>>,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics: Arc<RelayMetrics>,
    upstream: Arc<Mutex<UpstreamManager>>,
    upstream_tx: mpsc::UnboundedSender<UpstreamCommand>,
    last_upstream_frame: Arc<Mutex<Instant>>,
    next_consumer: Arc<AtomicU64>,
    /// Per consumer: normalized alias -> canonical pair it subscribed as.
    aliases: Arc<Mutex<HashMap<ConsumerId, HashMap<String, String>>>>,
}

impl AppState {
    /// Builds the shared state and returns the receiving end of the upstream
    /// command channel, which belongs to the upstream task.
    pub fn new(
        settings: Settings,
        resolver: Arc<SymbolResolver>,
        history: Arc<dyn CandleSource>,
        bus: Arc<EventBus>,
    ) -> (Self, mpsc::UnboundedReceiver<UpstreamCommand>) {
        Self::with_policy(settings, resolver, history, bus, ReconnectPolicy::default())
    }

    pub fn with_policy(
        settings: Settings,
        resolver: Arc<SymbolResolver>,
        history: Arc<dyn CandleSource>,
        bus: Arc<EventBus>,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<UpstreamCommand>) {
        let (upstream_tx, upstream_rx) = mpsc::unbounded_channel();
        let state = Self {
            history_cache: Arc::new(TtlCache::new(settings.history_cache_ttl)),
            compute_cache: Arc::new(TtlCache::new(settings.compute_cache_ttl)),
            rate_limiter: Arc::new(RateLimiter::per_minute(settings.rate_limit_per_minute)),
            settings: Arc::new(settings),
            registry: Arc::new(Registry::new()),
            dispatcher: Arc::new(Dispatcher::new()),
            bus,
            resolver,
            history,
            metrics: Arc::new(RelayMetrics::new()),
            upstream: Arc::new(Mutex::new(UpstreamManager::new(policy))),
            upstream_tx,
            last_upstream_frame: Arc::new(Mutex::new(Instant::now())),
            next_consumer: Arc::new(AtomicU64::new(1)),
            aliases: Arc::new(Mutex::new(HashMap::new())),
        };
        (state, upstream_rx)
    }

    // --- Consumers ---

    pub fn connect_consumer(&self) -> (ConsumerId, mpsc::UnboundedReceiver<RelayFrame>) {
        let id = self.next_consumer.fetch_add(1, Ordering::Relaxed);
        self.registry.add_consumer(id);
        let rx = self.dispatcher.add_client(id);
        self.metrics.consumer_connected();
        log::info!("Consumer {} connected", id);
        (id, rx)
    }

    fn with_aliases<R>(&self, f: impl FnOnce(&mut HashMap<ConsumerId, HashMap<String, String>>) -> R) -> R {
        let mut aliases = self.aliases.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut aliases)
    }

    /// Releases every interest of `consumer`. Safe to call more than once.
    pub fn disconnect_consumer(&self, consumer: ConsumerId) {
        self.dispatcher.remove_client(consumer);
        self.with_aliases(|aliases| aliases.remove(&consumer));
        let Some(emptied) = self.registry.release_all(consumer) else {
            return;
        };
        self.metrics.consumer_disconnected();
        for pair in emptied {
            self.send_upstream(UpstreamCommand::Unsubscribe { pair });
        }
        log::info!("Consumer {} disconnected", consumer);
    }

    /// Resolves `alias` and records the consumer's interest.
    ///
    /// A consumer that disconnected while the alias was being resolved gets
    /// `UnknownConsumer` and nothing is recorded.
    pub async fn subscribe(
        &self,
        consumer: ConsumerId,
        alias: &str,
        interval: Option<u32>,
    ) -> Result<Subscription, RegistryError> {
        let canonical = self.resolver.resolve(alias).await;
        let requested = interval.filter(|i| *i > 0).unwrap_or(self.settings.default_interval);

        match self.registry.subscribe(consumer, &canonical, requested)? {
            SubscribeOutcome::FirstInterest => {
                log::info!("First interest in {} (consumer {}), subscribing upstream", canonical, consumer);
                self.send_upstream(UpstreamCommand::Subscribe {
                    pair: canonical.clone(),
                    interval: requested,
                });
            }
            SubscribeOutcome::Joined => {
                log::debug!("Consumer {} joined {}", consumer, canonical);
            }
            SubscribeOutcome::AlreadySubscribed => {
                log::debug!("Consumer {} already subscribed to {}", consumer, canonical);
            }
        }

        let interval = self.registry.interval(&canonical).unwrap_or(requested);
        if interval != requested {
            log::info!(
                "Consumer {} asked for {} at {}m, sharing the existing {}m channel",
                consumer,
                canonical,
                requested,
                interval
            );
        }
        self.with_aliases(|aliases| {
            aliases
                .entry(consumer)
                .or_default()
                .insert(normalize_alias(alias), canonical.clone());
        });
        Ok(Subscription {
            pair: canonical,
            interval,
        })
    }

    /// Drops the consumer's interest in `alias`. An alias the consumer
    /// subscribed with maps to the pair it resolved to at that time, even if
    /// the catalog has been refreshed since.
    pub async fn unsubscribe(&self, consumer: ConsumerId, alias: &str) -> String {
        let remembered = self.with_aliases(|aliases| {
            aliases
                .get(&consumer)
                .and_then(|held| held.get(&normalize_alias(alias)).cloned())
        });
        let canonical = match remembered {
            Some(canonical) => canonical,
            None => self.resolver.resolve(alias).await,
        };
        self.with_aliases(|aliases| {
            if let Some(held) = aliases.get_mut(&consumer) {
                held.retain(|_, pair| *pair != canonical);
            }
        });
        match self.registry.unsubscribe(consumer, &canonical) {
            UnsubscribeOutcome::LastInterestReleased => {
                log::info!("Last interest in {} released, unsubscribing upstream", canonical);
                self.send_upstream(UpstreamCommand::Unsubscribe {
                    pair: canonical.clone(),
                });
            }
            UnsubscribeOutcome::Left | UnsubscribeOutcome::NotSubscribed => {}
        }
        canonical
    }

    /// Handles one control frame from a consumer and returns the reply.
    pub async fn handle_control(&self, consumer: ConsumerId, text: &str) -> Ack {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                log::debug!("Consumer {} sent invalid control frame: {}", consumer, e);
                return Ack::error(format!("invalid control message: {}", e));
            }
        };
        match message {
            ClientMessage::Subscribe { pair, interval } => {
                if pair.trim().is_empty() {
                    return Ack::error("pair is required");
                }
                match self.subscribe(consumer, &pair, interval).await {
                    Ok(subscription) => Ack::subscribed(subscription.pair, subscription.interval),
                    Err(e) => Ack::error(e.to_string()),
                }
            }
            ClientMessage::Unsubscribe { pair } => {
                if pair.trim().is_empty() {
                    return Ack::error("pair is required");
                }
                Ack::unsubscribed(self.unsubscribe(consumer, &pair).await)
            }
            ClientMessage::Ping => Ack::pong(),
        }
    }

    fn send_upstream(&self, command: UpstreamCommand) {
        if self.upstream_tx.send(command).is_err() {
            log::warn!("Upstream task is gone; command dropped");
        }
    }

    // --- Upstream ---

    pub fn with_upstream<R>(&self, f: impl FnOnce(&mut UpstreamManager) -> R) -> R {
        let mut manager = self.upstream.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut manager)
    }

    pub fn upstream_status(&self) -> UpstreamStatus {
        self.with_upstream(|m| m.status())
    }

    pub fn touch_upstream(&self) {
        *self.last_upstream_frame.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn last_upstream_frame(&self) -> Instant {
        *self.last_upstream_frame.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe frames for every pair with a non-zero refcount.
    pub fn resubscribe_frames(&self) -> Vec<(String, String)> {
        self.registry
            .active_pairs()
            .into_iter()
            .map(|(pair, interval)| {
                let frame = feed::subscribe_frame(
                    &[self.resolver.wire_name(&pair)],
                    &feed::SubscriptionSpec::ohlc(interval),
                );
                (pair, frame)
            })
            .collect()
    }

    /// Demultiplexes one inbound upstream text frame.
    pub fn route_upstream(&self, text: &str) {
        self.metrics.record_received();
        self.touch_upstream();

        let frame = match feed::classify(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Malformed upstream frame ({}), broadcasting as-is", e);
                self.broadcast_raw(text);
                return;
            }
        };

        match frame {
            UpstreamFrame::SubscriptionStatus(status) => self.apply_subscription_status(status),
            UpstreamFrame::Heartbeat | UpstreamFrame::Pong => {
                log::trace!("Upstream heartbeat");
            }
            UpstreamFrame::SystemStatus { status } => {
                log::info!("Upstream system status: {}", status);
            }
            UpstreamFrame::ChannelData {
                channel_id,
                channel_name,
                pair,
                payload,
            } => {
                let canonical = self
                    .registry
                    .pair_for_channel(channel_id)
                    .or_else(|| pair.as_deref().map(|p| self.resolver.canonical_for_wire(p)));
                let Some(canonical) = canonical else {
                    log::debug!("Dropping data for unbound channel {}", channel_id);
                    return;
                };

                let consumers = self.registry.consumers_for(&canonical);
                if !consumers.is_empty() {
                    let frame: RelayFrame = Arc::from(text);
                    let report = self.dispatcher.send_to(&consumers, &frame);
                    self.metrics.record_delivery(report.delivered, report.failed);
                }

                if let (Some(name), Some(wire)) = (channel_name.as_deref(), pair.as_deref()) {
                    if let Some(raw) = feed::ohlc_event(name, wire, &canonical, &payload) {
                        self.bus.publish(raw);
                        self.metrics.record_normalized();
                    }
                }
            }
            UpstreamFrame::Unrecognized(_) => {
                log::debug!("Unrecognized upstream frame, broadcasting to all consumers");
                self.broadcast_raw(text);
            }
        }
    }

    /// Releases a refused pair, tells its consumers, and lets the upstream
    /// task forget it so a later subscribe is sent again.
    fn reject_pair(&self, pair: String, reason: &str) {
        let dropped = self.registry.reject_pair(&pair);
        if !dropped.is_empty() {
            self.with_aliases(|aliases| {
                for consumer in &dropped {
                    if let Some(held) = aliases.get_mut(consumer) {
                        held.retain(|_, held_pair| *held_pair != pair);
                    }
                }
            });
            let notice = Ack::rejected(pair.clone(), format!("upstream rejected {}: {}", pair, reason));
            let frame: RelayFrame = Arc::from(notice.to_json());
            let report = self.dispatcher.send_to(&dropped, &frame);
            self.metrics.record_delivery(report.delivered, report.failed);
        }
        self.send_upstream(UpstreamCommand::Rejected { pair });
    }

    fn broadcast_raw(&self, text: &str) {
        let frame: RelayFrame = Arc::from(text);
        let report = self.dispatcher.broadcast(&frame);
        self.metrics.record_delivery(report.delivered, report.failed);
    }

    fn apply_subscription_status(&self, status: feed::SubscriptionStatus) {
        let canonical = status.pair.as_deref().map(|p| self.resolver.canonical_for_wire(p));
        match (status.status.as_str(), status.channel_id, canonical) {
            ("subscribed", Some(channel), Some(pair)) => {
                if self.registry.bind_channel(channel, &pair) {
                    log::info!("Upstream channel {} bound to {}", channel, pair);
                } else {
                    log::info!("Ack for {} arrived after last consumer left, unsubscribing", pair);
                    self.send_upstream(UpstreamCommand::Unsubscribe { pair });
                }
            }
            ("unsubscribed", _, Some(pair)) => {
                self.registry.unbind_pair(&pair);
                log::info!("Upstream unsubscribed {}", pair);
            }
            ("error", _, pair) => {
                let reason = status.error_message.as_deref().unwrap_or("no reason given");
                log::warn!("Upstream rejected subscription for {}: {}", pair.as_deref().unwrap_or("?"), reason);
                if let Some(pair) = pair {
                    self.reject_pair(pair, reason);
                }
            }
            (other, _, pair) => {
                log::debug!("Ignoring subscription status {:?} for {:?}", other, pair);
            }
        }
    }

    // --- Normalized events ---

    fn forward_normalized(&self, event: &NormalizedEvent) {
        let canonical = event
            .canonical_symbol
            .clone()
            .unwrap_or_else(|| self.resolver.resolve_cached(&event.symbol));
        let consumers = self.registry.consumers_for(&canonical);
        if consumers.is_empty() {
            return;
        }
        let payload = match serde_json::to_value(event) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("Could not serialize normalized event {}: {}", event.id, e);
                return;
            }
        };
        let text = match serde_json::to_string(&NormalizedFrame {
            event: "normalized",
            payload: &payload,
        }) {
            Ok(text) => text,
            Err(e) => {
                log::warn!("Could not serialize normalized frame {}: {}", event.id, e);
                return;
            }
        };
        let frame: RelayFrame = Arc::from(text);
        let report = self.dispatcher.send_to(&consumers, &frame);
        self.metrics.record_delivery(report.delivered, report.failed);
    }

    /// Forwards bus events (local and remote) to consumers of their pair.
    pub fn spawn_normalized_forwarder(&self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let state = self.clone();
        let mut events = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    received = events.recv() => match received {
                        Ok(event) => state.forward_normalized(&event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            log::warn!("Normalized forwarder lagged, {} events skipped", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            log::info!("Normalized forwarder stopped");
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use lib_common::markets::kraken::{CatalogError, CatalogSource, HistoryError, PairInfo};
    use std::sync::atomic::AtomicUsize;

    use crate::relay_logic::config::Config;

    pub struct StubCatalog;

    #[async_trait]
    impl CatalogSource for StubCatalog {
        async fn fetch_pairs(&self) -> Result<Vec<PairInfo>, CatalogError> {
            Ok([("XBTUSD", "XBT/USD"), ("XRPUSD", "XRP/USD"), ("ETHUSD", "ETH/USD")]
                .into_iter()
                .map(|(canonical, wsname)| {
                    let (base, quote) = wsname.split_once('/').unwrap();
                    PairInfo {
                        canonical: canonical.to_string(),
                        wsname: wsname.to_string(),
                        base: base.to_string(),
                        quote: quote.to_string(),
                    }
                })
                .collect())
        }
    }

    #[derive(Default)]
    pub struct StubCandles {
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl CandleSource for StubCandles {
        async fn fetch_candles(&self, pair: &str, _interval: u32, count: usize) -> Result<Vec<Candle>, HistoryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if pair == "DOWN" {
                return Err(HistoryError::Timeout(std::time::Duration::from_millis(10)));
            }
            Ok((0..count as i64)
                .map(|i| Candle {
                    time: 1_700_000_000 + i * 60,
                    open: 100.0 + i as f64,
                    high: 101.0 + i as f64,
                    low: 99.0 + i as f64,
                    close: 100.5 + i as f64,
                    vwap: None,
                    volume: 1.0,
                    count: Some(3),
                })
                .collect())
        }
    }

    pub fn settings() -> Settings {
        Config::default().resolve().unwrap()
    }

    pub fn build(
        settings: Settings,
        policy: ReconnectPolicy,
    ) -> (AppState, mpsc::UnboundedReceiver<UpstreamCommand>, Arc<StubCandles>) {
        let resolver = Arc::new(SymbolResolver::new(Arc::new(StubCatalog), None));
        let candles = Arc::new(StubCandles::default());
        let bus = Arc::new(EventBus::new("kraken", 256));
        let (state, rx) = AppState::with_policy(settings, resolver, candles.clone(), bus, policy);
        (state, rx, candles)
    }

    pub fn state() -> (AppState, mpsc::UnboundedReceiver<UpstreamCommand>) {
        let (state, rx, _) = build(settings(), ReconnectPolicy::default());
        (state, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{StubCandles, settings, state};
    use super::*;
    use async_trait::async_trait;
    use lib_common::markets::kraken::{CatalogError, CatalogSource, PairInfo};
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    const XRP_ACK: &str = r#"{"channelID":7,"channelName":"ohlc-1","event":"subscriptionStatus","pair":"XRP/USD","status":"subscribed","subscription":{"interval":1,"name":"ohlc"}}"#;
    const XRP_TICK: &str = r#"[7,["1700000000.1","1700000060.0","0.61","0.62","0.60","0.615","0.612","1500.0",12],"ohlc-1","XRP/USD"]"#;
    const XBT_ACK: &str = r#"{"channelID":42,"channelName":"ohlc-1","event":"subscriptionStatus","pair":"XBT/USD","status":"subscribed","subscription":{"interval":1,"name":"ohlc"}}"#;
    const XRP_REFUSED: &str = r#"{"errorMessage":"Currency pair not supported XRP/USD","event":"subscriptionStatus","pair":"XRP/USD","status":"error","subscription":{"interval":1,"name":"ohlc"}}"#;
    const XBT_TICK: &str = r#"[42,["1700000000.5","1700000060.0","37000.0","37010.0","36990.0","37005.0","37001.2","0.5",4],"ohlc-1","XBT/USD"]"#;

    fn drain(rx: &mut mpsc::UnboundedReceiver<RelayFrame>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(frame.to_string());
        }
        out
    }

    fn commands(rx: &mut mpsc::UnboundedReceiver<UpstreamCommand>) -> Vec<UpstreamCommand> {
        let mut out = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            out.push(cmd);
        }
        out
    }

    #[tokio::test]
    async fn lowercase_alias_is_acked_canonical_and_receives_ticks() {
        let (state, mut upstream) = state();
        let (consumer, mut frames) = state.connect_consumer();

        let ack = state
            .handle_control(consumer, r#"{"action":"subscribe","pair":"xrpusd"}"#)
            .await;
        assert_eq!(ack, Ack::subscribed("XRPUSD", 1));
        assert_eq!(
            commands(&mut upstream),
            vec![UpstreamCommand::Subscribe { pair: "XRPUSD".to_string(), interval: 1 }]
        );

        state.route_upstream(XRP_ACK);
        assert_eq!(state.registry.pair_for_channel(7).as_deref(), Some("XRPUSD"));

        state.route_upstream(XRP_TICK);
        assert_eq!(drain(&mut frames), vec![XRP_TICK.to_string()]);
    }

    #[tokio::test]
    async fn two_spellings_share_one_upstream_subscription() {
        let (state, mut upstream) = state();
        let (a, mut frames_a) = state.connect_consumer();
        let (b, mut frames_b) = state.connect_consumer();

        let ack_a = state.handle_control(a, r#"{"action":"subscribe","pair":"BTC/USD"}"#).await;
        let ack_b = state.handle_control(b, r#"{"action":"subscribe","pair":"btcusd"}"#).await;
        assert_eq!(ack_a, Ack::subscribed("XBTUSD", 1));
        assert_eq!(ack_b, Ack::subscribed("XBTUSD", 1));
        assert_eq!(commands(&mut upstream).len(), 1);
        assert_eq!(state.registry.refcount("XBTUSD"), 2);

        state.route_upstream(XBT_ACK);
        state.route_upstream(XBT_TICK);
        assert_eq!(drain(&mut frames_a), vec![XBT_TICK.to_string()]);
        assert_eq!(drain(&mut frames_b), vec![XBT_TICK.to_string()]);
    }

    #[tokio::test]
    async fn late_joiner_is_told_the_shared_interval() {
        let (state, mut upstream) = state();
        let (a, _fa) = state.connect_consumer();
        let (b, _fb) = state.connect_consumer();

        let ack_a = state.handle_control(a, r#"{"action":"subscribe","pair":"ethusd","interval":5}"#).await;
        let ack_b = state.handle_control(b, r#"{"action":"subscribe","pair":"ethusd","interval":15}"#).await;
        assert_eq!(ack_a, Ack::subscribed("ETHUSD", 5));
        assert_eq!(ack_b, Ack::subscribed("ETHUSD", 5));
        assert_eq!(
            commands(&mut upstream),
            vec![UpstreamCommand::Subscribe { pair: "ETHUSD".to_string(), interval: 5 }]
        );
    }

    #[tokio::test]
    async fn refused_pair_is_released_and_can_be_retried() {
        let (state, mut upstream) = state();
        let (a, mut fa) = state.connect_consumer();
        let (b, mut fb) = state.connect_consumer();
        state.subscribe(a, "xrpusd", None).await.unwrap();
        state.subscribe(b, "xrp", None).await.unwrap();
        commands(&mut upstream);

        state.route_upstream(XRP_REFUSED);
        assert_eq!(state.registry.refcount("XRPUSD"), 0);
        assert_eq!(
            commands(&mut upstream),
            vec![UpstreamCommand::Rejected { pair: "XRPUSD".to_string() }]
        );
        let notice: Value = serde_json::from_str(&drain(&mut fa)[0]).unwrap();
        assert_eq!(notice["ok"], false);
        assert_eq!(notice["pair"], "XRPUSD");
        assert!(notice["error"].as_str().unwrap().contains("not supported"));
        assert_eq!(drain(&mut fb).len(), 1);

        let ack = state.handle_control(a, r#"{"action":"subscribe","pair":"xrpusd"}"#).await;
        assert_eq!(ack, Ack::subscribed("XRPUSD", 1));
        assert_eq!(
            commands(&mut upstream),
            vec![UpstreamCommand::Subscribe { pair: "XRPUSD".to_string(), interval: 1 }]
        );
    }

    /// Lists only ADA/EUR until refreshed, then ADA/USD as well.
    #[derive(Default)]
    struct ShiftingCatalog {
        refreshed: AtomicBool,
    }

    #[async_trait]
    impl CatalogSource for ShiftingCatalog {
        async fn fetch_pairs(&self) -> Result<Vec<PairInfo>, CatalogError> {
            let mut listed = vec![("ADAEUR", "ADA/EUR")];
            if self.refreshed.swap(true, Ordering::SeqCst) {
                listed.push(("ADAUSD", "ADA/USD"));
            }
            Ok(listed
                .into_iter()
                .map(|(canonical, wsname)| {
                    let (base, quote) = wsname.split_once('/').unwrap();
                    PairInfo {
                        canonical: canonical.to_string(),
                        wsname: wsname.to_string(),
                        base: base.to_string(),
                        quote: quote.to_string(),
                    }
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn unsubscribe_survives_a_catalog_refresh() {
        let resolver = Arc::new(SymbolResolver::new(Arc::new(ShiftingCatalog::default()), None));
        let bus = Arc::new(EventBus::new("kraken", 16));
        let (state, mut upstream) = AppState::new(settings(), resolver, Arc::new(StubCandles::default()), bus);
        let (consumer, _frames) = state.connect_consumer();

        assert_eq!(state.subscribe(consumer, "ada", None).await.unwrap().pair, "ADAEUR");
        state.resolver.refresh().await.unwrap();
        assert_eq!(state.resolver.resolve("ada").await, "ADAUSD");

        let ack = state.handle_control(consumer, r#"{"action":"unsubscribe","pair":"ada"}"#).await;
        assert_eq!(ack, Ack::unsubscribed("ADAEUR"));
        assert_eq!(state.registry.refcount("ADAEUR"), 0);
        assert_eq!(
            commands(&mut upstream),
            vec![
                UpstreamCommand::Subscribe { pair: "ADAEUR".to_string(), interval: 1 },
                UpstreamCommand::Unsubscribe { pair: "ADAEUR".to_string() },
            ]
        );
    }

    #[tokio::test]
    async fn repeated_subscribe_is_idempotent() {
        let (state, mut upstream) = state();
        let (consumer, _frames) = state.connect_consumer();
        for _ in 0..3 {
            let ack = state.handle_control(consumer, r#"{"action":"subscribe","pair":"XRP"}"#).await;
            assert_eq!(ack, Ack::subscribed("XRPUSD", 1));
        }
        assert_eq!(state.registry.refcount("XRPUSD"), 1);
        assert_eq!(commands(&mut upstream).len(), 1);
    }

    #[tokio::test]
    async fn last_unsubscribe_releases_upstream_subscription() {
        let (state, mut upstream) = state();
        let (a, _fa) = state.connect_consumer();
        let (b, _fb) = state.connect_consumer();
        state.subscribe(a, "xbtusd", None).await.unwrap();
        state.subscribe(b, "xbtusd", None).await.unwrap();
        state.route_upstream(XBT_ACK);
        commands(&mut upstream);

        assert_eq!(state.unsubscribe(a, "btc/usd").await, "XBTUSD");
        assert!(commands(&mut upstream).is_empty());
        assert_eq!(state.registry.refcount("XBTUSD"), 1);

        let ack = state.handle_control(b, r#"{"action":"unsubscribe","pair":"XBTUSD"}"#).await;
        assert_eq!(ack, Ack::unsubscribed("XBTUSD"));
        assert_eq!(
            commands(&mut upstream),
            vec![UpstreamCommand::Unsubscribe { pair: "XBTUSD".to_string() }]
        );
        assert_eq!(state.registry.refcount("XBTUSD"), 0);
        assert_eq!(state.registry.pair_for_channel(42), None);
    }

    #[tokio::test]
    async fn disconnect_releases_every_interest_exactly_once() {
        let (state, mut upstream) = state();
        let (a, _fa) = state.connect_consumer();
        let (b, _fb) = state.connect_consumer();
        state.subscribe(a, "xbtusd", None).await.unwrap();
        state.subscribe(a, "xrpusd", None).await.unwrap();
        state.subscribe(a, "ethusd", None).await.unwrap();
        state.subscribe(b, "ethusd", None).await.unwrap();
        commands(&mut upstream);
        assert_eq!(state.metrics.connected_consumers(), 2);

        state.disconnect_consumer(a);
        state.disconnect_consumer(a);

        assert_eq!(
            commands(&mut upstream),
            vec![
                UpstreamCommand::Unsubscribe { pair: "XBTUSD".to_string() },
                UpstreamCommand::Unsubscribe { pair: "XRPUSD".to_string() },
            ]
        );
        assert_eq!(state.registry.refcount("ETHUSD"), 1);
        assert_eq!(state.metrics.connected_consumers(), 1);
    }

    #[tokio::test]
    async fn subscribe_after_disconnect_is_discarded() {
        let (state, mut upstream) = state();
        let (consumer, _frames) = state.connect_consumer();
        state.disconnect_consumer(consumer);

        let result = state.subscribe(consumer, "xrpusd", None).await;
        assert_eq!(result, Err(RegistryError::UnknownConsumer(consumer)));
        assert_eq!(state.registry.refcount("XRPUSD"), 0);
        assert!(commands(&mut upstream).is_empty());
    }

    #[tokio::test]
    async fn malformed_control_frames_get_error_acks() {
        let (state, _upstream) = state();
        let (consumer, _frames) = state.connect_consumer();

        let ack = state.handle_control(consumer, "not json").await;
        assert_eq!(ack.ok, Some(false));
        assert!(ack.error.unwrap().starts_with("invalid control message"));

        let ack = state.handle_control(consumer, r#"{"action":"subscribe","pair":"  "}"#).await;
        assert_eq!(ack, Ack::error("pair is required"));

        let ack = state.handle_control(consumer, r#"{"action":"ping"}"#).await;
        assert_eq!(ack, Ack::pong());
    }

    #[tokio::test]
    async fn unknown_shapes_fan_out_to_everyone_but_heartbeats_do_not() {
        let (state, _upstream) = state();
        let (_a, mut fa) = state.connect_consumer();
        let (_b, mut fb) = state.connect_consumer();

        state.route_upstream(r#"{"event":"heartbeat"}"#);
        state.route_upstream(r#"{"event":"systemStatus","status":"online"}"#);
        assert!(drain(&mut fa).is_empty());

        state.route_upstream(r#"{"surprise":true}"#);
        state.route_upstream("garbage");
        assert_eq!(drain(&mut fa), vec![r#"{"surprise":true}"#.to_string(), "garbage".to_string()]);
        assert_eq!(drain(&mut fb).len(), 2);
        assert_eq!(state.metrics.events_received.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn data_without_binding_routes_by_trailing_pair() {
        let (state, _upstream) = state();
        let (consumer, mut frames) = state.connect_consumer();
        state.subscribe(consumer, "xrpusd", None).await.unwrap();

        // No ack seen yet.
        state.route_upstream(XRP_TICK);
        assert_eq!(drain(&mut frames), vec![XRP_TICK.to_string()]);
    }

    #[tokio::test]
    async fn late_ack_for_abandoned_pair_unsubscribes() {
        let (state, mut upstream) = state();
        state.resolver.ensure_loaded().await.unwrap();

        state.route_upstream(XBT_ACK);
        assert_eq!(state.registry.pair_for_channel(42), None);
        assert_eq!(
            commands(&mut upstream),
            vec![UpstreamCommand::Unsubscribe { pair: "XBTUSD".to_string() }]
        );
    }

    #[tokio::test]
    async fn reconnect_resubscribes_exactly_the_active_pairs() {
        let (state, _upstream) = state();
        let (a, _fa) = state.connect_consumer();
        let (b, _fb) = state.connect_consumer();
        for alias in ["xbtusd", "xrpusd", "ethusd"] {
            state.subscribe(a, alias, None).await.unwrap();
        }
        state.subscribe(b, "xrpusd", Some(5)).await.unwrap();
        state.route_upstream(XBT_ACK);

        // Connection drops: bindings go, interest stays.
        state.registry.clear_channels();

        let frames = state.resubscribe_frames();
        let pairs: Vec<&str> = frames.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(pairs, vec!["ETHUSD", "XBTUSD", "XRPUSD"]);
        let first: Value = serde_json::from_str(&frames[1].1).unwrap();
        assert_eq!(
            first,
            json!({"event": "subscribe", "pair": ["XBT/USD"], "subscription": {"name": "ohlc", "interval": 1}})
        );

        state.unsubscribe(a, "ethusd").await;
        assert_eq!(state.resubscribe_frames().len(), 2);
    }

    #[tokio::test]
    async fn ohlc_ticks_reach_consumers_as_normalized_frames() {
        let (state, _upstream) = state();
        let (shutdown_tx, _) = broadcast::channel(1);
        let forwarder = state.spawn_normalized_forwarder(shutdown_tx.subscribe());

        let (consumer, mut frames) = state.connect_consumer();
        state.subscribe(consumer, "xrpusd", None).await.unwrap();
        state.route_upstream(XRP_ACK);
        state.route_upstream(XRP_TICK);

        let raw = frames.recv().await.unwrap();
        assert_eq!(&*raw, XRP_TICK);
        let normalized = frames.recv().await.unwrap();
        let value: Value = serde_json::from_str(&normalized).unwrap();
        assert_eq!(value["event"], "normalized");
        assert_eq!(value["payload"]["eventType"], "ohlc");
        assert_eq!(value["payload"]["canonicalSymbol"], "XRPUSD");
        assert_eq!(value["payload"]["payload"]["close"], 0.615);

        let _ = shutdown_tx.send(());
        forwarder.await.unwrap();
    }
}
