//! # Financial Market APIs Module
//!
//! Provider-specific clients and data models. Everything above this module
//! (registry, bus, gateway) works in terms of canonical symbols and
//! [`candle::Candle`]s; the wire details of the exchange stay in here.
//!
//! ## Contained Modules:
//!
//! - **`candle`**: The OHLCV bar shared by the history client and the
//!   indicator functions.
//! - **`kraken`**: Symbol catalog and resolver, WebSocket feed codec and
//!   the historical OHLC REST client for the Kraken public API.

#![forbid(unsafe_code)]

/// Provider-neutral OHLCV candle.
pub mod candle;
/// Kraken public API: symbols, feed codec and history.
pub mod kraken;

pub use candle::Candle;
