//! Relay counters and gauges, rendered in the Prometheus text exposition
//! format by [`RelayMetrics::render_prometheus`].

use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Frames received from the upstream connection.
    pub events_received: AtomicU64,
    /// Successful pushes to a consumer queue.
    pub events_forwarded: AtomicU64,
    /// Pushes or socket writes that failed for one consumer.
    pub forward_failures: AtomicU64,
    /// Events published on the normalized bus.
    pub normalized_published: AtomicU64,
    /// Reconnect attempts scheduled for the upstream connection.
    pub upstream_reconnects: AtomicU64,
    /// Times the circuit breaker opened.
    pub circuit_breaker_trips: AtomicU64,
    /// REST requests rejected by the rate limiter.
    pub rate_limited: AtomicU64,
    /// Compute requests answered from cache.
    pub compute_cache_hits: AtomicU64,
    connected_consumers: AtomicI64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery(&self, delivered: u64, failed: u64) {
        if delivered > 0 {
            self.events_forwarded.fetch_add(delivered, Ordering::Relaxed);
        }
        if failed > 0 {
            self.forward_failures.fetch_add(failed, Ordering::Relaxed);
        }
    }

    pub fn record_forward_failure(&self) {
        self.forward_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_normalized(&self) {
        self.normalized_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.upstream_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_trip(&self) {
        self.circuit_breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compute_cache_hit(&self) {
        self.compute_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn consumer_connected(&self) {
        self.connected_consumers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn consumer_disconnected(&self) {
        self.connected_consumers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connected_consumers(&self) -> i64 {
        self.connected_consumers.load(Ordering::Relaxed)
    }

    pub fn render_prometheus(&self) -> String {
        let counters: [(&str, &str, &AtomicU64); 8] = [
            ("relay_events_received_total", "Frames received from the upstream feed.", &self.events_received),
            ("relay_events_forwarded_total", "Frames pushed to downstream consumers.", &self.events_forwarded),
            ("relay_forward_failures_total", "Frames that could not be delivered to a consumer.", &self.forward_failures),
            ("relay_normalized_events_total", "Events published on the normalized bus.", &self.normalized_published),
            ("relay_upstream_reconnects_total", "Upstream reconnect attempts scheduled.", &self.upstream_reconnects),
            ("relay_circuit_breaker_trips_total", "Times the upstream circuit breaker opened.", &self.circuit_breaker_trips),
            ("relay_rate_limited_total", "REST requests rejected by the rate limiter.", &self.rate_limited),
            ("relay_compute_cache_hits_total", "Indicator requests served from cache.", &self.compute_cache_hits),
        ];

        let mut out = String::new();
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {}", value.load(Ordering::Relaxed));
        }
        let _ = writeln!(out, "# HELP relay_connected_consumers Downstream consumers currently connected.");
        let _ = writeln!(out, "# TYPE relay_connected_consumers gauge");
        let _ = writeln!(out, "relay_connected_consumers {}", self.connected_consumers());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_contains_counters_and_gauge() {
        let metrics = RelayMetrics::new();
        metrics.record_received();
        metrics.record_delivery(3, 1);
        metrics.consumer_connected();
        metrics.consumer_connected();
        metrics.consumer_disconnected();

        let text = metrics.render_prometheus();
        assert!(text.contains("# TYPE relay_events_received_total counter"));
        assert!(text.contains("relay_events_received_total 1\n"));
        assert!(text.contains("relay_events_forwarded_total 3\n"));
        assert!(text.contains("relay_forward_failures_total 1\n"));
        assert!(text.contains("# TYPE relay_connected_consumers gauge"));
        assert!(text.contains("relay_connected_consumers 1\n"));
    }
}
