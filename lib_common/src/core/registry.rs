//! # Subscription Registry
//!
//! Refcounted bookkeeping between downstream consumers and canonical pairs, and
//! between canonical pairs and the channel ids the upstream provider assigns.
//!
//! The registry never performs I/O. Every mutating call returns an outcome that
//! tells the caller whether the upstream connection must be told to subscribe
//! (refcount 0 -> 1) or unsubscribe (refcount 1 -> 0). All state sits behind a
//! single mutex and each call finishes its read-modify-write before returning,
//! so concurrent subscribe/unsubscribe calls for the same pair serialize.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use thiserror::Error;

/// Identifier of a downstream consumer connection.
pub type ConsumerId = u64;

/// Identifier the upstream provider assigns to an active subscription.
pub type ChannelId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The consumer disconnected (or never registered) before the call landed.
    #[error("consumer {0} is not connected")]
    UnknownConsumer(ConsumerId),
}

/// Result of registering interest in a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// First consumer for this pair; the upstream must subscribe.
    FirstInterest,
    /// Another consumer joined an already active pair.
    Joined,
    /// The consumer was already interested; nothing changed.
    AlreadySubscribed,
}

/// Result of dropping interest in a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    /// Last consumer left; the upstream should unsubscribe.
    LastInterestReleased,
    /// Other consumers remain interested.
    Left,
    /// The consumer held no interest in this pair.
    NotSubscribed,
}

#[derive(Debug)]
struct PairInterest {
    consumers: HashSet<ConsumerId>,
    interval: u32,
    channel: Option<ChannelId>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    consumers: HashMap<ConsumerId, HashSet<String>>,
    pairs: HashMap<String, PairInterest>,
    channels: HashMap<ChannelId, String>,
}

impl RegistryInner {
    /// Removes one consumer from a pair. Returns true when the pair emptied.
    fn release(&mut self, consumer: ConsumerId, pair: &str) -> bool {
        let Some(interest) = self.pairs.get_mut(pair) else {
            return false;
        };
        interest.consumers.remove(&consumer);
        if !interest.consumers.is_empty() {
            return false;
        }
        if let Some(interest) = self.pairs.remove(pair) {
            if let Some(channel) = interest.channel {
                self.channels.remove(&channel);
            }
        }
        true
    }
}

/// Point-in-time view of one pair, used by the debug endpoint.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PairSnapshot {
    pub refcount: usize,
    pub interval: u32,
    pub channel_id: Option<ChannelId>,
    pub consumers: Vec<ConsumerId>,
}

/// Point-in-time view of the whole registry.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    pub consumers: usize,
    pub pairs: BTreeMap<String, PairSnapshot>,
}

/// Subscription registry shared by the gateway and the upstream task.
#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        // A panic while holding the lock cannot leave a half-applied mutation
        // behind, so the poisoned state is still consistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a freshly accepted consumer with no interests.
    pub fn add_consumer(&self, consumer: ConsumerId) {
        self.lock().consumers.entry(consumer).or_default();
    }

    /// True while the consumer is connected and not yet released.
    pub fn is_live(&self, consumer: ConsumerId) -> bool {
        self.lock().consumers.contains_key(&consumer)
    }

    /// Records `consumer`'s interest in `pair`.
    ///
    /// `interval` is only used when this call creates the pair entry; later
    /// subscribers share the upstream channel that already exists.
    pub fn subscribe(
        &self,
        consumer: ConsumerId,
        pair: &str,
        interval: u32,
    ) -> Result<SubscribeOutcome, RegistryError> {
        let mut inner = self.lock();
        let held = inner
            .consumers
            .get_mut(&consumer)
            .ok_or(RegistryError::UnknownConsumer(consumer))?;
        if !held.insert(pair.to_string()) {
            return Ok(SubscribeOutcome::AlreadySubscribed);
        }

        let interest = inner
            .pairs
            .entry(pair.to_string())
            .or_insert_with(|| PairInterest {
                consumers: HashSet::new(),
                interval,
                channel: None,
            });
        interest.consumers.insert(consumer);

        if interest.consumers.len() == 1 {
            Ok(SubscribeOutcome::FirstInterest)
        } else {
            Ok(SubscribeOutcome::Joined)
        }
    }

    /// Drops `consumer`'s interest in `pair`.
    pub fn unsubscribe(&self, consumer: ConsumerId, pair: &str) -> UnsubscribeOutcome {
        let mut inner = self.lock();
        let removed = inner
            .consumers
            .get_mut(&consumer)
            .is_some_and(|held| held.remove(pair));
        if !removed {
            return UnsubscribeOutcome::NotSubscribed;
        }

        if inner.release(consumer, pair) {
            UnsubscribeOutcome::LastInterestReleased
        } else {
            UnsubscribeOutcome::Left
        }
    }

    /// Releases every interest held by `consumer` and forgets it.
    ///
    /// Returns the pairs whose refcount reached zero, or `None` when the
    /// consumer was already released. A second call is therefore a no-op.
    pub fn release_all(&self, consumer: ConsumerId) -> Option<Vec<String>> {
        let mut inner = self.lock();
        let held = inner.consumers.remove(&consumer)?;

        let mut emptied: Vec<String> = held
            .into_iter()
            .filter(|pair| inner.release(consumer, pair))
            .collect();
        emptied.sort();
        Some(emptied)
    }

    /// Number of distinct consumers interested in `pair`.
    pub fn refcount(&self, pair: &str) -> usize {
        self.lock()
            .pairs
            .get(pair)
            .map_or(0, |interest| interest.consumers.len())
    }

    /// Interval requested when the pair was first subscribed.
    pub fn interval(&self, pair: &str) -> Option<u32> {
        self.lock().pairs.get(pair).map(|interest| interest.interval)
    }

    /// Every pair with a non-zero refcount, sorted, with its interval.
    pub fn active_pairs(&self) -> Vec<(String, u32)> {
        let inner = self.lock();
        let mut pairs: Vec<(String, u32)> = inner
            .pairs
            .iter()
            .map(|(pair, interest)| (pair.clone(), interest.interval))
            .collect();
        pairs.sort();
        pairs
    }

    /// Consumers currently interested in `pair`, sorted for stable fan-out.
    pub fn consumers_for(&self, pair: &str) -> Vec<ConsumerId> {
        let inner = self.lock();
        let mut ids: Vec<ConsumerId> = inner
            .pairs
            .get(pair)
            .map(|interest| interest.consumers.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Number of connected consumers.
    pub fn consumer_count(&self) -> usize {
        self.lock().consumers.len()
    }

    /// Binds an acknowledged upstream channel to `pair`.
    ///
    /// Returns false when nobody is interested in the pair anymore (the ack
    /// raced an unsubscribe); no binding is stored in that case.
    pub fn bind_channel(&self, channel: ChannelId, pair: &str) -> bool {
        let mut inner = self.lock();
        let previous = match inner.pairs.get_mut(pair) {
            Some(interest) => interest.channel.replace(channel),
            None => return false,
        };
        if let Some(previous) = previous {
            inner.channels.remove(&previous);
        }
        inner.channels.insert(channel, pair.to_string());
        true
    }

    /// Clears the channel binding of `pair`, if any.
    pub fn unbind_pair(&self, pair: &str) {
        let mut inner = self.lock();
        let channel = inner
            .pairs
            .get_mut(pair)
            .and_then(|interest| interest.channel.take());
        if let Some(channel) = channel {
            inner.channels.remove(&channel);
        }
    }

    /// Forgets a pair the provider refused to subscribe, releasing every
    /// consumer's interest in it. Returns the consumers that lost it, sorted.
    ///
    /// A pair already bound to a channel is live upstream, so an error for it
    /// refers to some other request and nothing is dropped.
    pub fn reject_pair(&self, pair: &str) -> Vec<ConsumerId> {
        let mut inner = self.lock();
        if inner.pairs.get(pair).is_none_or(|interest| interest.channel.is_some()) {
            return Vec::new();
        }
        let Some(interest) = inner.pairs.remove(pair) else {
            return Vec::new();
        };
        let mut dropped: Vec<ConsumerId> = interest.consumers.into_iter().collect();
        dropped.sort_unstable();
        for consumer in &dropped {
            if let Some(held) = inner.consumers.get_mut(consumer) {
                held.remove(pair);
            }
        }
        dropped
    }

    /// Drops every channel binding. Called when the upstream connection ends;
    /// the bindings are rebuilt from fresh acks after reconnecting.
    pub fn clear_channels(&self) {
        let mut inner = self.lock();
        inner.channels.clear();
        for interest in inner.pairs.values_mut() {
            interest.channel = None;
        }
    }

    /// Canonical pair bound to `channel`.
    pub fn pair_for_channel(&self, channel: ChannelId) -> Option<String> {
        self.lock().channels.get(&channel).cloned()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.lock();
        let pairs = inner
            .pairs
            .iter()
            .map(|(pair, interest)| {
                let mut consumers: Vec<ConsumerId> = interest.consumers.iter().copied().collect();
                consumers.sort_unstable();
                (
                    pair.clone(),
                    PairSnapshot {
                        refcount: consumers.len(),
                        interval: interest.interval,
                        channel_id: interest.channel,
                        consumers,
                    },
                )
            })
            .collect();
        RegistrySnapshot {
            consumers: inner.consumers.len(),
            pairs,
        }
    }
}
