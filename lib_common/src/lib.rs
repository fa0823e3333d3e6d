//! # lib_common
//!
//! Shared building blocks for the market-data relay. Each top-level folder is
//! gated behind a cargo feature of the same name so that small tools can pull
//! in only what they need; the relay server enables `full`.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Registry, dispatcher, event bus, upstream state machine and guards.
#[cfg(feature = "core")]
pub mod core;

/// Cross-process transports.
#[cfg(feature = "connections")]
pub mod connections;

/// Technical indicator functions over candle series.
#[cfg(feature = "indicators")]
pub mod indicators;

/// Provider-specific market data plumbing.
#[cfg(feature = "markets")]
pub mod markets;

/// Generic HTTP retrieval with retries.
#[cfg(feature = "retrieve")]
pub mod retrieve;
