use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// One fixed-interval OHLC record ("kline").
///
/// `timestamp` is the exchange's bar time in Unix milliseconds. Within any
/// sequence produced for one (symbol, interval) consecutive timestamps differ
/// by exactly the interval length.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Bar {
    pub fn time(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.timestamp)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Identifies one live stream connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub symbol: String,
    pub interval: String,
}

impl SubscriptionKey {
    pub fn new(symbol: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            interval: interval.into(),
        }
    }
}

impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

/// Parameters forwarded to the historical-data collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KlineQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    pub limit: usize,
}

impl Default for KlineQuery {
    fn default() -> Self {
        Self {
            start_time: None,
            end_time: None,
            limit: 1,
        }
    }
}

impl KlineQuery {
    pub fn limit(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }
}

/// Positional kline record as returned by the REST endpoint:
/// `[openTime, open, high, low, close, ...]`. Only the first five fields are read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawKline(pub Vec<Value>);

impl RawKline {
    pub fn to_bar(&self) -> Result<Bar> {
        let field = |i: usize| {
            self.0
                .get(i)
                .ok_or_else(|| Error::InvalidKline(format!("record has no field {i}")))
        };

        Ok(Bar {
            timestamp: as_millis(field(0)?)?,
            open: as_price(field(1)?)?,
            high: as_price(field(2)?)?,
            low: as_price(field(3)?)?,
            close: as_price(field(4)?)?,
        })
    }
}

fn as_millis(v: &Value) -> Result<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| Error::InvalidKline(format!("bad timestamp: {v}")))
}

// Binance encodes prices as decimal strings.
fn as_price(v: &Value) -> Result<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| Error::InvalidKline(format!("bad price: {v}")))
}

// ─── Live kline envelope ─────────────────────────────────────────────────────

#[derive(Deserialize)]
struct KlineWrapper {
    k: KlineData,
}

#[derive(Deserialize)]
struct KlineData {
    #[serde(rename = "t")]
    time_ms: i64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "x")]
    is_closed: bool,
}

/// A decoded live kline update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KlineUpdate {
    pub bar: Bar,
    /// True once the bar has finalized.
    pub is_closed: bool,
}

/// Decode one JSON stream envelope (`{"k": {"t", "o", "h", "l", "c", "x", ...}}`).
pub fn parse_kline_update(text: &str) -> Result<KlineUpdate> {
    let KlineWrapper { k } = serde_json::from_str(text)?;
    let price = |s: &str| {
        s.parse::<f64>()
            .map_err(|_| Error::InvalidKline(format!("bad price: {s}")))
    };

    Ok(KlineUpdate {
        bar: Bar {
            timestamp: k.time_ms,
            open: price(&k.open)?,
            high: price(&k.high)?,
            low: price(&k.low)?,
            close: price(&k.close)?,
        },
        is_closed: k.is_closed,
    })
}
