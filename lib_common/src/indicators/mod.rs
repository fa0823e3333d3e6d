//! # Technical Indicators
//!
//! Pure, stateless transforms over candle series. Every series function
//! returns one slot per input bar; slots before the indicator has enough
//! history are `None`.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

use crate::markets::candle::Candle;

pub const SMA_PERIOD: usize = 20;
pub const EMA_PERIOD: usize = 20;
pub const RSI_PERIOD: usize = 14;
pub const ATR_PERIOD: usize = 14;
pub const MACD_FAST: usize = 12;
pub const MACD_SLOW: usize = 26;
pub const MACD_SIGNAL: usize = 9;
pub const BOLLINGER_PERIOD: usize = 20;
pub const BOLLINGER_WIDTH: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorKind {
    Sma,
    Ema,
    Rsi,
    Macd,
    Vwap,
    Atr,
    Bollinger,
}

impl IndicatorKind {
    /// Computed when a request names no indicators.
    pub const DEFAULT_SET: [IndicatorKind; 6] = [
        IndicatorKind::Sma,
        IndicatorKind::Ema,
        IndicatorKind::Rsi,
        IndicatorKind::Macd,
        IndicatorKind::Vwap,
        IndicatorKind::Atr,
    ];
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown indicator {0:?}")]
pub struct UnknownIndicator(pub String);

impl FromStr for IndicatorKind {
    type Err = UnknownIndicator;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sma" => Ok(IndicatorKind::Sma),
            "ema" => Ok(IndicatorKind::Ema),
            "rsi" => Ok(IndicatorKind::Rsi),
            "macd" => Ok(IndicatorKind::Macd),
            "vwap" => Ok(IndicatorKind::Vwap),
            "atr" => Ok(IndicatorKind::Atr),
            "bollinger" | "bb" | "bbands" => Ok(IndicatorKind::Bollinger),
            _ => Err(UnknownIndicator(s.to_string())),
        }
    }
}

pub type Series = Vec<Option<f64>>;

pub fn sma(values: &[f64], period: usize) -> Series {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }
    let mut sum: f64 = values[..period].iter().sum();
    out[period - 1] = Some(sum / period as f64);
    for i in period..values.len() {
        sum += values[i] - values[i - period];
        out[i] = Some(sum / period as f64);
    }
    out
}

/// Seeded with the SMA of the first `period` values.
pub fn ema(values: &[f64], period: usize) -> Series {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut prev = values[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = Some(prev);
    for i in period..values.len() {
        prev = (values[i] - prev) * k + prev;
        out[i] = Some(prev);
    }
    out
}

/// Wilder-smoothed relative strength index.
pub fn rsi(values: &[f64], period: usize) -> Series {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() <= period {
        return out;
    }
    let (mut gain, mut loss) = (0.0, 0.0);
    for i in 1..=period {
        let change = values[i] - values[i - 1];
        if change > 0.0 {
            gain += change;
        } else {
            loss -= change;
        }
    }
    let mut avg_gain = gain / period as f64;
    let mut avg_loss = loss / period as f64;
    out[period] = Some(rsi_value(avg_gain, avg_loss));

    for i in (period + 1)..values.len() {
        let change = values[i] - values[i - 1];
        let (g, l) = if change > 0.0 { (change, 0.0) } else { (0.0, -change) };
        avg_gain = (avg_gain * (period as f64 - 1.0) + g) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + l) / period as f64;
        out[i] = Some(rsi_value(avg_gain, avg_loss));
    }
    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return if avg_gain == 0.0 { 50.0 } else { 100.0 };
    }
    100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MacdSeries {
    pub macd: Series,
    pub signal: Series,
    pub histogram: Series,
}

pub fn macd(values: &[f64], fast: usize, slow: usize, signal: usize) -> MacdSeries {
    let fast_ema = ema(values, fast);
    let slow_ema = ema(values, slow);
    let line: Series = fast_ema
        .iter()
        .zip(&slow_ema)
        .map(|(f, s)| Some((*f)? - (*s)?))
        .collect();

    // Signal is an EMA over the defined part of the MACD line.
    let offset = line.iter().position(Option::is_some).unwrap_or(line.len());
    let defined: Vec<f64> = line[offset..].iter().flatten().copied().collect();
    let mut signal_line = vec![None; offset];
    signal_line.extend(ema(&defined, signal));

    let histogram = line
        .iter()
        .zip(&signal_line)
        .map(|(m, s)| Some((*m)? - (*s)?))
        .collect();
    MacdSeries {
        macd: line,
        signal: signal_line,
        histogram,
    }
}

/// Cumulative volume-weighted typical price.
pub fn vwap(candles: &[Candle]) -> Series {
    let mut pv = 0.0;
    let mut volume = 0.0;
    candles
        .iter()
        .map(|c| {
            pv += c.typical_price() * c.volume;
            volume += c.volume;
            (volume > 0.0).then(|| pv / volume)
        })
        .collect()
}

/// Wilder-smoothed average true range.
pub fn atr(candles: &[Candle], period: usize) -> Series {
    let mut out = vec![None; candles.len()];
    if period == 0 || candles.len() <= period {
        return out;
    }
    let true_range = |i: usize| {
        let c = &candles[i];
        let prev_close = candles[i - 1].close;
        (c.high - c.low)
            .max((c.high - prev_close).abs())
            .max((c.low - prev_close).abs())
    };
    let mut avg = (1..=period).map(true_range).sum::<f64>() / period as f64;
    out[period] = Some(avg);
    for i in (period + 1)..candles.len() {
        avg = (avg * (period as f64 - 1.0) + true_range(i)) / period as f64;
        out[i] = Some(avg);
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BollingerSeries {
    pub upper: Series,
    pub middle: Series,
    pub lower: Series,
}

/// SMA middle band with population standard deviation bands at `width`.
pub fn bollinger(values: &[f64], period: usize, width: f64) -> BollingerSeries {
    let middle = sma(values, period);
    let mut upper = vec![None; values.len()];
    let mut lower = vec![None; values.len()];
    for (i, mean) in middle.iter().enumerate() {
        let Some(mean) = *mean else { continue };
        let window = &values[i + 1 - period..=i];
        let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / period as f64;
        let band = variance.sqrt() * width;
        upper[i] = Some(mean + band);
        lower[i] = Some(mean - band);
    }
    BollingerSeries { upper, middle, lower }
}

/// Named series plus the latest value of each.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorReport {
    pub indicators: BTreeMap<String, Series>,
    pub last: BTreeMap<String, Option<f64>>,
}

/// Computes `kinds` over `candles`, keyed as `sma20`, `rsi14`, `macdSignal`, ...
pub fn compute(candles: &[Candle], kinds: &[IndicatorKind]) -> IndicatorReport {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let mut indicators = BTreeMap::new();

    for kind in kinds {
        match kind {
            IndicatorKind::Sma => {
                indicators.insert(format!("sma{}", SMA_PERIOD), sma(&closes, SMA_PERIOD));
            }
            IndicatorKind::Ema => {
                indicators.insert(format!("ema{}", EMA_PERIOD), ema(&closes, EMA_PERIOD));
            }
            IndicatorKind::Rsi => {
                indicators.insert(format!("rsi{}", RSI_PERIOD), rsi(&closes, RSI_PERIOD));
            }
            IndicatorKind::Macd => {
                let m = macd(&closes, MACD_FAST, MACD_SLOW, MACD_SIGNAL);
                indicators.insert("macd".to_string(), m.macd);
                indicators.insert("macdSignal".to_string(), m.signal);
                indicators.insert("macdHistogram".to_string(), m.histogram);
            }
            IndicatorKind::Vwap => {
                indicators.insert("vwap".to_string(), vwap(candles));
            }
            IndicatorKind::Atr => {
                indicators.insert(format!("atr{}", ATR_PERIOD), atr(candles, ATR_PERIOD));
            }
            IndicatorKind::Bollinger => {
                let b = bollinger(&closes, BOLLINGER_PERIOD, BOLLINGER_WIDTH);
                indicators.insert("bbUpper".to_string(), b.upper);
                indicators.insert("bbMiddle".to_string(), b.middle);
                indicators.insert("bbLower".to_string(), b.lower);
            }
        }
    }

    let last = indicators
        .iter()
        .map(|(name, series)| (name.clone(), series.last().copied().flatten()))
        .collect();
    IndicatorReport { indicators, last }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(x: Option<f64>, expected: f64) -> bool {
        x.map(|v| (v - expected).abs() < 1e-9).unwrap_or(false)
    }

    fn candle(time: i64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle {
            time,
            open: close,
            high,
            low,
            close,
            vwap: None,
            volume,
            count: None,
        }
    }

    #[test]
    fn sma_and_ema_warm_up() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        let s = sma(&values, 3);
        assert_eq!(&s[..2], &[None, None]);
        assert!(close(s[2], 2.0));
        assert!(close(s[4], 4.0));

        let e = ema(&values, 3);
        assert!(close(e[2], 2.0));
        // k = 0.5
        assert!(close(e[3], 3.0));
        assert!(close(e[4], 4.0));
    }

    #[test]
    fn rsi_extremes() {
        let rising: Vec<f64> = (0..20).map(f64::from).collect();
        assert!(close(rsi(&rising, 14)[19], 100.0));

        let flat = vec![5.0; 20];
        assert!(close(rsi(&flat, 14)[19], 50.0));
        assert_eq!(rsi(&flat, 14)[13], None);
    }

    #[test]
    fn macd_of_constant_series_is_zero() {
        let flat = vec![10.0; 40];
        let m = macd(&flat, 12, 26, 9);
        assert_eq!(m.macd[24], None);
        assert!(close(m.macd[25], 0.0));
        assert_eq!(m.signal[32], None);
        assert!(close(m.signal[33], 0.0));
        assert!(close(m.histogram[39], 0.0));
    }

    #[test]
    fn bollinger_collapses_on_flat_prices() {
        let b = bollinger(&[3.0; 5], 5, 2.0);
        assert!(close(b.upper[4], 3.0));
        assert!(close(b.lower[4], 3.0));
        assert_eq!(b.middle[3], None);
    }

    #[test]
    fn atr_and_vwap() {
        let candles: Vec<Candle> = (0..5).map(|i| candle(i, 11.0, 9.0, 10.0, 2.0)).collect();
        let a = atr(&candles, 3);
        assert_eq!(a[2], None);
        assert!(close(a[3], 2.0));
        assert!(close(a[4], 2.0));

        let v = vwap(&candles);
        assert!(close(v[4], 10.0));
        assert_eq!(vwap(&[candle(0, 1.0, 1.0, 1.0, 0.0)]), vec![None]);
    }

    #[test]
    fn parses_indicator_names() {
        assert_eq!("RSI".parse::<IndicatorKind>(), Ok(IndicatorKind::Rsi));
        assert_eq!("bb".parse::<IndicatorKind>(), Ok(IndicatorKind::Bollinger));
        assert_eq!(
            "stoch".parse::<IndicatorKind>(),
            Err(UnknownIndicator("stoch".to_string()))
        );
    }

    #[test]
    fn compute_names_series_and_last_values() {
        let candles: Vec<Candle> = (0..30)
            .map(|i| candle(i, 11.0 + i as f64, 9.0 + i as f64, 10.0 + i as f64, 1.0))
            .collect();
        let report = compute(&candles, &[IndicatorKind::Sma, IndicatorKind::Macd]);
        let keys: Vec<&str> = report.indicators.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["macd", "macdHistogram", "macdSignal", "sma20"]);
        assert!(report.indicators.values().all(|s| s.len() == 30));
        assert!(close(report.last["sma20"], 29.5));
        assert_eq!(report.last["macdSignal"], None);
    }
}
