//! # Core Relay Module
//!
//! This module forms the heart of the relay. It aggregates the components that
//! coordinate shared state between the single upstream connection and the many
//! downstream consumers.
//!
//! ## Core Components:
//!
//! - **`registry`**: The refcounted subscription manager. It maps consumers to
//!   canonical pairs and canonical pairs to upstream channel ids, and reports
//!   the 0->1 and 1->0 transitions that drive upstream (un)subscribes.
//!
//! - **`dispatcher`**: Per-consumer outbound queues. One inbound frame is
//!   wrapped in an `Arc` and pushed to every interested consumer.
//!
//! - **`event_bus`**: Normalizes provider payloads into `NormalizedEvent`s and
//!   republishes them locally and, optionally, across processes.
//!
//! - **`upstream_manager`**: The connection state machine with exponential
//!   backoff and a sliding-window circuit breaker.
//!
//! - **`metrics`**, **`ttl_cache`**, **`rate_limit`**: Guards and introspection
//!   for the request/response side of the gateway.

/// Refcounted consumer <-> pair <-> channel mapping.
pub mod registry;
/// Per-consumer outbound queues for fan-out.
pub mod dispatcher;
/// Normalized event envelope and the local/cross-process bus.
pub mod event_bus;
/// Upstream connection lifecycle, backoff and circuit breaker.
pub mod upstream_manager;
/// Relay counters and gauges with Prometheus rendering.
pub mod metrics;
/// Lazily expiring key/value cache.
pub mod ttl_cache;
/// Fixed-window per-identity rate limiter.
pub mod rate_limit;

// --- Public API Re-exports ---
pub use dispatcher::{DeliveryReport, Dispatcher, RelayFrame};
pub use event_bus::{BroadcastTransport, EventBus, NormalizedEvent, RawEvent, TransportError};
pub use metrics::RelayMetrics;
pub use rate_limit::{RateLimitExceeded, RateLimiter};
pub use registry::{ConsumerId, Registry, RegistryError, SubscribeOutcome, UnsubscribeOutcome};
pub use ttl_cache::TtlCache;
pub use upstream_manager::{ConnectionState, ReconnectDecision, ReconnectPolicy, UpstreamManager};
