//! Core data types used across the trading system

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// OHLCV candlestick data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub datetime: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Trading pair symbol
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Symbol(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Position direction (spot longs plus a short representation for accounting)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

/// Where candles and fills come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    /// No network; candles fed from a file, OHLC-crossing fills
    Backtest,
    /// Live ticker, simulated fills at the latest price
    Paper,
    /// Real orders against the exchange testnet
    Testnet,
    /// Real orders, real money
    Mainnet,
}

impl TradingMode {
    /// True when orders are actually sent to the exchange
    pub fn is_live(&self) -> bool {
        matches!(self, TradingMode::Testnet | TradingMode::Mainnet)
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Backtest => write!(f, "backtest"),
            TradingMode::Paper => write!(f, "paper"),
            TradingMode::Testnet => write!(f, "testnet"),
            TradingMode::Mainnet => write!(f, "mainnet"),
        }
    }
}

impl std::str::FromStr for TradingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "backtest" => Ok(TradingMode::Backtest),
            "paper" => Ok(TradingMode::Paper),
            "testnet" => Ok(TradingMode::Testnet),
            "mainnet" => Ok(TradingMode::Mainnet),
            other => Err(format!(
                "Unknown trading mode: {}. Available: backtest, paper, testnet, mainnet",
                other
            )),
        }
    }
}

/// Completed (fully or partially closed) trade record, append-only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: Symbol,
    pub strategy: String,
    pub side: PositionSide,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub pnl_gross: f64,
    pub fee: f64,
    pub pnl_net: f64,
    pub tag: String,
}

impl TradeRecord {
    pub fn return_pct(&self) -> f64 {
        if self.entry_price > 0.0 {
            ((self.exit_price - self.entry_price) / self.entry_price) * 100.0
        } else {
            0.0
        }
    }
}
