//! Exchange adapter layer
//!
//! [`Exchange`] is the abstract contract the trading loop and order manager
//! talk to; [`binance::BinanceClient`] is the concrete implementation.
//! Symbol filters (tick size, step size, minimum notional) are applied here
//! at the boundary; everything upstream works in raw floats.

mod auth;
pub mod binance;
pub mod types;

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

use crate::{Candle, Side};
pub use types::{AssetBalance, OrderAck, Ticker};

/// Errors at the exchange boundary
///
/// Transient failures (network, timeouts, 5xx) skip the affected symbol for
/// one tick; rejections are final for the order that caused them.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ExchangeError {
    /// Transient errors are retried next tick; the rest are final
    pub fn is_transient(&self) -> bool {
        match self {
            ExchangeError::Network(_) | ExchangeError::Timeout => true,
            ExchangeError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExchangeError::Timeout
        } else {
            ExchangeError::Network(err.to_string())
        }
    }
}

/// Exchange-imposed price/quantity/notional quanta for one symbol
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct SymbolFilters {
    pub tick_size: f64,
    pub step_size: f64,
    pub min_notional: f64,
}

impl Default for SymbolFilters {
    fn default() -> Self {
        // Reference exchange defaults for USDT spot pairs
        SymbolFilters {
            tick_size: 0.01,
            step_size: 0.0001,
            min_notional: 11.0,
        }
    }
}

impl SymbolFilters {
    /// Round a price to the nearest tick
    pub fn round_price(&self, price: f64) -> f64 {
        if self.tick_size > 0.0 {
            (price / self.tick_size).round() * self.tick_size
        } else {
            price
        }
    }

    /// Round a quantity down to the step size
    pub fn round_qty(&self, qty: f64) -> f64 {
        if self.step_size > 0.0 {
            (qty / self.step_size).floor() * self.step_size
        } else {
            qty
        }
    }

    /// Whether an order satisfies the minimum notional value
    pub fn meets_min_notional(&self, qty: f64, price: f64) -> bool {
        qty * price >= self.min_notional
    }
}

/// Abstract exchange contract
///
/// Implementations must tolerate concurrent calls (one in-flight request per
/// symbol is sufficient) and bound every call with a timeout.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Latest traded price for a symbol
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError>;

    /// Candles sorted ascending by open time
    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError>;

    /// Place a limit order; a successful ack always carries a usable order id
    async fn create_limit_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        price: f64,
    ) -> Result<OrderAck, ExchangeError>;

    /// Cancel an order by exchange id; Ok(false) when it was already gone
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<bool, ExchangeError>;

    /// Ids of orders still open on the exchange for this symbol
    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<String>, ExchangeError>;

    /// Account balances keyed by asset (used to seed initial capital)
    async fn get_account_balance(&self) -> Result<HashMap<String, AssetBalance>, ExchangeError>;

    /// Symbol metadata for rounding and minimum-notional checks
    fn filters(&self, symbol: &str) -> SymbolFilters;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_price_to_tick() {
        let filters = SymbolFilters {
            tick_size: 0.01,
            step_size: 0.0001,
            min_notional: 11.0,
        };
        assert!((filters.round_price(100.123) - 100.12).abs() < 1e-9);
        assert!((filters.round_price(100.126) - 100.13).abs() < 1e-9);
    }

    #[test]
    fn test_round_qty_floors_to_step() {
        let filters = SymbolFilters {
            tick_size: 0.01,
            step_size: 0.001,
            min_notional: 11.0,
        };
        assert!((filters.round_qty(0.12399) - 0.123).abs() < 1e-9);
        // Never rounds up into a larger order
        assert!((filters.round_qty(0.1239999) - 0.123).abs() < 1e-9);
    }

    #[test]
    fn test_min_notional() {
        let filters = SymbolFilters::default();
        assert!(!filters.meets_min_notional(0.1, 100.0));
        assert!(filters.meets_min_notional(0.2, 100.0));
    }

    #[test]
    fn test_transient_classification() {
        assert!(ExchangeError::Timeout.is_transient());
        assert!(ExchangeError::Network("reset".into()).is_transient());
        assert!(ExchangeError::Api {
            status: 503,
            body: "busy".into()
        }
        .is_transient());
        assert!(!ExchangeError::Api {
            status: 400,
            body: "bad".into()
        }
        .is_transient());
        assert!(!ExchangeError::Rejected("insufficient balance".into()).is_transient());
    }
}
