//! Historical OHLC candles from the public REST `OHLC` endpoint.
//!
//! Every request is bounded by a timeout and fails with a typed
//! [`HistoryError`] instead of hanging the caller.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use super::Envelope;
use crate::markets::candle::Candle;
use crate::retrieve::ApiClient;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history request timed out after {0:?}")]
    Timeout(Duration),
    #[error("history request failed: {0}")]
    Http(String),
    #[error("history endpoint returned HTTP {status}")]
    Status { status: u16, body: Option<String> },
    #[error("provider rejected history request: {0}")]
    Provider(String),
    #[error("malformed history response: {0}")]
    Decode(String),
}

/// Anything that can supply recent candles for a canonical pair.
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// The most recent `count` candles, oldest first.
    async fn fetch_candles(&self, pair: &str, interval: u32, count: usize) -> Result<Vec<Candle>, HistoryError>;
}

pub struct HistoryClient {
    client: ApiClient,
    timeout: Duration,
}

impl HistoryClient {
    pub fn new(client: ApiClient, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn fetch_once(&self, pair: &str, interval: u32) -> Result<Map<String, Value>, HistoryError> {
        let query = [("pair", pair.to_string()), ("interval", interval.to_string())];
        let resp = self
            .client
            .get_json::<Envelope<Map<String, Value>>>("OHLC", &query)
            .await
            .map_err(|e| HistoryError::Http(e.to_string()))?;
        if !resp.success {
            return Err(HistoryError::Status {
                status: resp.status,
                body: resp.error_body,
            });
        }
        resp.data
            .ok_or_else(|| HistoryError::Decode("empty body".to_string()))?
            .into_result()
            .map_err(|errors| HistoryError::Provider(errors.join("; ")))
    }
}

#[async_trait]
impl CandleSource for HistoryClient {
    async fn fetch_candles(&self, pair: &str, interval: u32, count: usize) -> Result<Vec<Candle>, HistoryError> {
        let result = tokio::time::timeout(self.timeout, self.fetch_once(pair, interval))
            .await
            .map_err(|_| HistoryError::Timeout(self.timeout))??;

        // The result holds one entry keyed by the provider's pair id, plus `last`.
        let rows = result
            .iter()
            .filter(|(key, _)| key.as_str() != "last")
            .find_map(|(_, value)| value.as_array())
            .ok_or_else(|| HistoryError::Decode(format!("no candle rows for {}", pair)))?;

        let mut candles = rows
            .iter()
            .map(parse_row)
            .collect::<Result<Vec<_>, _>>()?;
        if candles.len() > count {
            candles.drain(..candles.len() - count);
        }
        log::debug!("Fetched {} candles for {} @ {}m", candles.len(), pair, interval);
        Ok(candles)
    }
}

fn field(row: &[Value], idx: usize) -> Result<f64, HistoryError> {
    let value = row
        .get(idx)
        .ok_or_else(|| HistoryError::Decode(format!("candle row too short ({} fields)", row.len())))?;
    match value {
        Value::String(s) => s
            .parse()
            .map_err(|_| HistoryError::Decode(format!("bad number {:?}", s))),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| HistoryError::Decode(format!("bad number {}", n))),
        other => Err(HistoryError::Decode(format!("unexpected field {}", other))),
    }
}

/// `[time, open, high, low, close, vwap, volume, count]`
fn parse_row(row: &Value) -> Result<Candle, HistoryError> {
    let row = row
        .as_array()
        .ok_or_else(|| HistoryError::Decode("candle row is not an array".to_string()))?;
    Ok(Candle {
        time: field(row, 0)? as i64,
        open: field(row, 1)?,
        high: field(row, 2)?,
        low: field(row, 3)?,
        close: field(row, 4)?,
        vwap: field(row, 5).ok(),
        volume: field(row, 6)?,
        count: row.get(7).and_then(Value::as_u64),
    })
}
