//! # Kraken Public API
//!
//! - **`symbols`**: `AssetPairs` catalog, alias resolution and the on-disk
//!   catalog cache.
//! - **`feed`**: WebSocket v1 frames, outbound subscribe/unsubscribe and
//!   inbound classification.
//! - **`history`**: REST `OHLC` candles with a bounded timeout.

use serde::Deserialize;

/// Alias resolution against the provider pair catalog.
pub mod symbols;
/// WebSocket feed codec.
pub mod feed;
/// Historical candle client.
pub mod history;

pub use feed::{SubscriptionSpec, UpstreamFrame};
pub use history::{CandleSource, HistoryClient, HistoryError};
pub use symbols::{CatalogError, CatalogSource, KrakenCatalogSource, PairInfo, SymbolResolver};

/// Provider name stamped on normalized events.
pub const PROVIDER: &str = "kraken";

/// Public WebSocket endpoint.
pub const DEFAULT_WS_URL: &str = "wss://ws.kraken.com";

/// Public REST base.
pub const DEFAULT_REST_URL: &str = "https://api.kraken.com/0/public/";

/// Every REST response is wrapped in `{error: [...], result: {...}}`.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    #[serde(default)]
    pub error: Vec<String>,
    pub result: Option<T>,
}

impl<T> Envelope<T> {
    /// The result, or the provider's error list when it reported any.
    pub fn into_result(self) -> Result<T, Vec<String>> {
        if !self.error.is_empty() {
            return Err(self.error);
        }
        self.result.ok_or_else(|| vec!["missing result".to_string()])
    }
}
