use serde::{Deserialize, Serialize};

/// One OHLCV bar. `time` is the bar open time in Unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub vwap: Option<f64>,
    pub volume: f64,
    #[serde(default)]
    pub count: Option<u64>,
}

impl Candle {
    /// Typical price `(high + low + close) / 3`.
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}
