//! # Fan-out Dispatcher
//!
//! Holds one outbound queue per connected consumer. A frame that must reach
//! many consumers is wrapped in an `Arc<str>` once and each queue receives a
//! pointer to the same allocation.
//!
//! Queues are unbounded: a push only fails when the consumer's writer task has
//! already gone away. Such a failure is reported back to the caller and the
//! consumer is *not* removed here; its own close/error path deregisters it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::core::registry::ConsumerId;

/// A serialized text frame ready to be written to a consumer socket.
pub type RelayFrame = Arc<str>;

/// Outcome of pushing one frame to a set of consumers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: u64,
    pub failed: u64,
}

impl DeliveryReport {
    fn record(&mut self, ok: bool) {
        if ok {
            self.delivered += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// Registry of consumer outbound queues.
#[derive(Debug, Default)]
pub struct Dispatcher {
    clients: Mutex<HashMap<ConsumerId, mpsc::UnboundedSender<RelayFrame>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConsumerId, mpsc::UnboundedSender<RelayFrame>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates the outbound queue for `id` and returns its receiving half,
    /// which the consumer's writer task drains.
    pub fn add_client(&self, id: ConsumerId) -> mpsc::UnboundedReceiver<RelayFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(id, tx);
        log::debug!("Consumer {} registered with dispatcher", id);
        rx
    }

    pub fn remove_client(&self, id: ConsumerId) {
        if self.lock().remove(&id).is_some() {
            log::debug!("Consumer {} removed from dispatcher", id);
        }
    }

    /// Pushes `frame` to each listed consumer, in order.
    pub fn send_to(&self, ids: &[ConsumerId], frame: &RelayFrame) -> DeliveryReport {
        let clients = self.lock();
        let mut report = DeliveryReport::default();
        for id in ids {
            let ok = clients
                .get(id)
                .is_some_and(|tx| tx.send(Arc::clone(frame)).is_ok());
            if !ok {
                log::debug!("Delivery to consumer {} failed", id);
            }
            report.record(ok);
        }
        report
    }

    /// Pushes `frame` to every registered consumer.
    pub fn broadcast(&self, frame: &RelayFrame) -> DeliveryReport {
        let clients = self.lock();
        let mut report = DeliveryReport::default();
        for tx in clients.values() {
            report.record(tx.send(Arc::clone(frame)).is_ok());
        }
        report
    }

    pub fn client_count(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_reach_only_listed_consumers() {
        let dispatcher = Dispatcher::new();
        let mut rx1 = dispatcher.add_client(1);
        let mut rx2 = dispatcher.add_client(2);

        let frame: RelayFrame = Arc::from("[42,{}]");
        let report = dispatcher.send_to(&[1], &frame);
        assert_eq!(report, DeliveryReport { delivered: 1, failed: 0 });

        assert_eq!(rx1.try_recv().unwrap().as_ref(), "[42,{}]");
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn closed_queue_counts_as_failure_but_stays_registered() {
        let dispatcher = Dispatcher::new();
        let rx = dispatcher.add_client(1);
        let _rx2 = dispatcher.add_client(2);
        drop(rx);

        let frame: RelayFrame = Arc::from("tick");
        let report = dispatcher.broadcast(&frame);
        assert_eq!(report, DeliveryReport { delivered: 1, failed: 1 });
        assert_eq!(dispatcher.client_count(), 2);

        dispatcher.remove_client(1);
        assert_eq!(dispatcher.client_count(), 1);
    }

    #[test]
    fn unknown_consumer_is_a_failed_delivery() {
        let dispatcher = Dispatcher::new();
        let frame: RelayFrame = Arc::from("tick");
        let report = dispatcher.send_to(&[99], &frame);
        assert_eq!(report.failed, 1);
    }
}
