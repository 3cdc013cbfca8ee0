//! Hybrid Grid Trading
//!
//! An automated crypto-spot trading system combining grid market-making
//! with conditional dollar-cost-averaging on the same instrument, governed
//! by a PnL gate state machine and a latched hard stop with auto-resume.
//! Supports backtest, paper, testnet, and mainnet modes.

pub mod backtest;
pub mod common;
pub mod config;
pub mod data;
pub mod exchange;
pub mod indicators;
pub mod oms;
pub mod portfolio;
pub mod session_log;
pub mod state_store;
pub mod strategy;
pub mod types;

pub use config::Config;
pub use exchange::{Exchange, ExchangeError};
pub use indicators::{IndicatorBundle, IndicatorConfig};
pub use portfolio::{Portfolio, Position};
pub use strategy::hybrid::{GateState, HybridEngine, HybridPolicy, Plan};
pub use types::*;
