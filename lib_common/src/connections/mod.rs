//! # Connections Module
//!
//! Persistent connections to external services.

/// Redis pub/sub transport for the cross-process event bus.
pub mod cache_redis;

pub use cache_redis::RedisTransport;
