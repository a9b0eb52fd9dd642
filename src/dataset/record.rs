//! Record Codec
//!
//! Every record type stored in a canonical file implements [`Record`]: a
//! fixed-size, byte-serializable value with an ordered numeric key, a fixed
//! feature vector and a validity flag. Records are written and read in native
//! byte order (single-host files).
//!
//! # CSV contract
//!
//! `from_csv` distinguishes three outcomes:
//! - `Ok(Some(record))`: the line parsed (the record may still be invalid)
//! - `Ok(None)`: the line is structurally unparsable (blank, comment, header,
//!   wrong field count) and is skipped
//! - `Err(RecordParseError)`: a numeric field inside an otherwise parseable
//!   line is malformed; the caller treats this as fatal

use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Capability contract for a fixed-layout record.
pub trait Record: Copy + Send + Sync + Debug + 'static {
    /// Short type name used in logs and CLI selection.
    const KIND: &'static str;
    /// Encoded size in bytes. Constant for the type.
    const SIZE: usize;
    /// Feature column names, in feature index order.
    const FEATURE_NAMES: &'static [&'static str];

    fn key_value(&self) -> f64;

    fn is_valid(&self) -> bool;

    /// Placeholder carrying only `key`, marked invalid.
    fn null_instance(key: f64) -> Self;

    fn from_csv(line: &str, delimiter: char, line_no: usize)
        -> Result<Option<Self>, RecordParseError>;

    fn to_csv(&self, delimiter: char) -> String;

    fn feature(&self, index: usize) -> f64;

    fn set_feature(&mut self, index: usize, value: f64);

    /// Write exactly `SIZE` bytes into `out[..SIZE]`.
    fn encode(&self, out: &mut [u8]);

    /// Read from `bytes[..SIZE]`.
    fn decode(bytes: &[u8]) -> Self;

    #[inline]
    fn feature_dim() -> usize {
        Self::FEATURE_NAMES.len()
    }
}

/// Malformed numeric field inside a parseable CSV line.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordParseError {
    pub line_no: usize,
    pub field: &'static str,
    pub value: String,
}

impl std::fmt::Display for RecordParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "line {}: malformed numeric field '{}': {:?}",
            self.line_no, self.field, self.value
        )
    }
}

impl std::error::Error for RecordParseError {}

/// Record types selectable at runtime (CLI).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Candle,
    Scalar,
}

impl std::str::FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "candle" => Ok(Self::Candle),
            "scalar" => Ok(Self::Scalar),
            other => Err(format!("unknown record kind: {}", other)),
        }
    }
}

// =============================================================================
// FIELD HELPERS
// =============================================================================

/// Split a line into exactly `N` trimmed fields, or `None` if the count differs.
fn split_fields<const N: usize>(line: &str, delimiter: char) -> Option<[&str; N]> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut out = [""; N];
    let mut parts = line.split(delimiter);
    for slot in out.iter_mut() {
        *slot = parts.next()?.trim();
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

#[inline]
fn parse_f64(value: &str, field: &'static str, line_no: usize) -> Result<f64, RecordParseError> {
    fast_float::parse(value).map_err(|_| RecordParseError {
        line_no,
        field,
        value: value.to_string(),
    })
}

/// Integer millisecond key; float notation accepted when integral.
fn parse_ms_key(value: &str) -> Option<i64> {
    if let Ok(v) = value.parse::<i64>() {
        return Some(v);
    }
    let v: f64 = fast_float::parse(value).ok()?;
    if v.is_finite() && v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
        Some(v as i64)
    } else {
        None
    }
}

#[inline]
fn put_f64(out: &mut [u8], at: usize, v: f64) {
    out[at..at + 8].copy_from_slice(&v.to_ne_bytes());
}

#[inline]
fn get_f64(bytes: &[u8], at: usize) -> f64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    f64::from_ne_bytes(buf)
}

// =============================================================================
// CANDLE
// =============================================================================

/// OHLCV bar keyed by open time in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candle {
    pub open_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub valid: bool,
}

impl Record for Candle {
    const KIND: &'static str = "candle";
    // i64 key + 5 x f64 + validity byte padded to 8
    const SIZE: usize = 56;
    const FEATURE_NAMES: &'static [&'static str] = &["open", "high", "low", "close", "volume"];

    fn key_value(&self) -> f64 {
        self.open_time_ms as f64
    }

    fn is_valid(&self) -> bool {
        self.valid
    }

    fn null_instance(key: f64) -> Self {
        Self {
            open_time_ms: key.round() as i64,
            open: 0.0,
            high: 0.0,
            low: 0.0,
            close: 0.0,
            volume: 0.0,
            valid: false,
        }
    }

    fn from_csv(
        line: &str,
        delimiter: char,
        line_no: usize,
    ) -> Result<Option<Self>, RecordParseError> {
        let Some([ts, open, high, low, close, volume]) = split_fields::<6>(line, delimiter) else {
            return Ok(None);
        };
        let Some(open_time_ms) = parse_ms_key(ts) else {
            return Ok(None);
        };
        let mut candle = Self {
            open_time_ms,
            open: parse_f64(open, "open", line_no)?,
            high: parse_f64(high, "high", line_no)?,
            low: parse_f64(low, "low", line_no)?,
            close: parse_f64(close, "close", line_no)?,
            volume: parse_f64(volume, "volume", line_no)?,
            valid: false,
        };
        // Validity is decided at parse time; normalized payloads need not satisfy high >= low.
        candle.valid = [candle.open, candle.high, candle.low, candle.close, candle.volume]
            .iter()
            .all(|v| v.is_finite())
            && candle.high >= candle.low
            && candle.volume >= 0.0;
        Ok(Some(candle))
    }

    fn to_csv(&self, delimiter: char) -> String {
        let d = delimiter;
        format!(
            "{}{d}{}{d}{}{d}{}{d}{}{d}{}",
            self.open_time_ms, self.open, self.high, self.low, self.close, self.volume
        )
    }

    fn feature(&self, index: usize) -> f64 {
        match index {
            0 => self.open,
            1 => self.high,
            2 => self.low,
            3 => self.close,
            4 => self.volume,
            _ => 0.0,
        }
    }

    fn set_feature(&mut self, index: usize, value: f64) {
        match index {
            0 => self.open = value,
            1 => self.high = value,
            2 => self.low = value,
            3 => self.close = value,
            4 => self.volume = value,
            _ => {}
        }
    }

    fn encode(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.open_time_ms.to_ne_bytes());
        put_f64(out, 8, self.open);
        put_f64(out, 16, self.high);
        put_f64(out, 24, self.low);
        put_f64(out, 32, self.close);
        put_f64(out, 40, self.volume);
        out[48..56].fill(0);
        out[48] = self.valid as u8;
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[0..8]);
        Self {
            open_time_ms: i64::from_ne_bytes(ts),
            open: get_f64(bytes, 8),
            high: get_f64(bytes, 16),
            low: get_f64(bytes, 24),
            close: get_f64(bytes, 32),
            volume: get_f64(bytes, 40),
            valid: bytes[48] != 0,
        }
    }
}

// =============================================================================
// SCALAR
// =============================================================================

/// Single-valued series with a real-valued key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scalar {
    pub key: f64,
    pub value: f64,
    pub valid: bool,
}

impl Scalar {
    pub fn new(key: f64, value: f64) -> Self {
        Self {
            key,
            value,
            valid: key.is_finite() && value.is_finite(),
        }
    }
}

impl Record for Scalar {
    const KIND: &'static str = "scalar";
    const SIZE: usize = 24;
    const FEATURE_NAMES: &'static [&'static str] = &["value"];

    fn key_value(&self) -> f64 {
        self.key
    }

    fn is_valid(&self) -> bool {
        self.valid
    }

    fn null_instance(key: f64) -> Self {
        Self {
            key,
            value: 0.0,
            valid: false,
        }
    }

    fn from_csv(
        line: &str,
        delimiter: char,
        line_no: usize,
    ) -> Result<Option<Self>, RecordParseError> {
        let Some([key, value]) = split_fields::<2>(line, delimiter) else {
            return Ok(None);
        };
        let Ok(key) = fast_float::parse::<f64, _>(key) else {
            return Ok(None);
        };
        let value = parse_f64(value, "value", line_no)?;
        Ok(Some(Self {
            key,
            value,
            valid: key.is_finite() && value.is_finite(),
        }))
    }

    fn to_csv(&self, delimiter: char) -> String {
        format!("{}{}{}", self.key, delimiter, self.value)
    }

    fn feature(&self, index: usize) -> f64 {
        if index == 0 {
            self.value
        } else {
            0.0
        }
    }

    fn set_feature(&mut self, index: usize, value: f64) {
        if index == 0 {
            self.value = value;
        }
    }

    fn encode(&self, out: &mut [u8]) {
        put_f64(out, 0, self.key);
        put_f64(out, 8, self.value);
        out[16..24].fill(0);
        out[16] = self.valid as u8;
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            key: get_f64(bytes, 0),
            value: get_f64(bytes, 8),
            valid: bytes[16] != 0,
        }
    }
}
