//! Wire types for the exchange adapter

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Candle;

/// Latest price snapshot for a symbol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub price: f64,
}

/// Acknowledgement of an accepted order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub client_order_id: Option<String>,
}

/// Free/locked balance for one asset
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AssetBalance {
    pub free: f64,
    pub locked: f64,
}

impl AssetBalance {
    pub fn total(&self) -> f64 {
        self.free + self.locked
    }
}

/// Raw kline row as returned by the exchange REST API
///
/// The endpoint returns a JSON array per candle:
/// `[open_time, open, high, low, close, volume, close_time, ...]`
/// with numeric fields encoded as strings.
#[derive(Debug, Clone)]
pub struct RawKline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl RawKline {
    pub fn from_row(row: &[serde_json::Value]) -> Option<RawKline> {
        fn as_f64(v: &serde_json::Value) -> Option<f64> {
            v.as_str()
                .and_then(|s| s.parse().ok())
                .or_else(|| v.as_f64())
        }

        Some(RawKline {
            open_time: row.first()?.as_i64()?,
            open: as_f64(row.get(1)?)?,
            high: as_f64(row.get(2)?)?,
            low: as_f64(row.get(3)?)?,
            close: as_f64(row.get(4)?)?,
            volume: as_f64(row.get(5)?)?,
        })
    }
}

impl From<RawKline> for Candle {
    fn from(k: RawKline) -> Self {
        Candle {
            datetime: DateTime::from_timestamp_millis(k.open_time).unwrap_or_else(Utc::now),
            open: k.open,
            high: k.high,
            low: k.low,
            close: k.close,
            volume: k.volume,
        }
    }
}
