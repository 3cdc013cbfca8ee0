//! Configuration management
//!
//! Handles loading and parsing of JSON configuration files with environment
//! variable support for API credentials. The hybrid policy lives under a
//! `default_policy` block; per-pair overrides are JSON objects merged over
//! it before deserialization.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::exchange::SymbolFilters;
use crate::strategy::hybrid::HybridPolicy;
use crate::TradingMode;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub exchange: ExchangeConfig,
    pub trading: TradingConfig,
    /// Hybrid policy knobs applied to every pair
    #[serde(default)]
    pub default_policy: serde_json::Value,
    /// Per-pair overrides merged over `default_policy`
    #[serde(default)]
    pub pairs: HashMap<String, serde_json::Value>,
    /// Per-symbol tick/step/min-notional table
    #[serde(default)]
    pub symbol_filters: HashMap<String, SymbolFilters>,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        // Credentials come from the environment, never the config file
        if let Ok(api_key) = std::env::var("BINANCE_API_KEY") {
            config.exchange.api_key = Some(api_key);
        }
        if let Ok(api_secret) = std::env::var("BINANCE_API_SECRET") {
            config.exchange.api_secret = Some(api_secret);
        }

        Ok(config)
    }

    /// Resolve the policy for a symbol: defaults <- default_policy <- pair override
    pub fn policy_for(&self, symbol: &str) -> Result<HybridPolicy> {
        let mut merged = serde_json::to_value(HybridPolicy::default())?;

        merge_object(&mut merged, &self.default_policy);
        if let Some(pair_override) = self.pairs.get(symbol) {
            merge_object(&mut merged, pair_override);
        }

        serde_json::from_value(merged)
            .context(format!("Invalid policy configuration for {}", symbol))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            exchange: ExchangeConfig::default(),
            trading: TradingConfig::default(),
            default_policy: serde_json::json!({}),
            pairs: HashMap::new(),
            symbol_filters: HashMap::new(),
        }
    }
}

/// Shallow merge of a JSON object's keys into a target object
fn merge_object(target: &mut serde_json::Value, overlay: &serde_json::Value) {
    if let (Some(target_map), Some(overlay_map)) = (target.as_object_mut(), overlay.as_object()) {
        for (key, value) in overlay_map {
            target_map.insert(key.clone(), value.clone());
        }
    }
}

/// Exchange configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    /// Fee as a fraction of fill notional
    pub fee_rate: f64,
    /// Requests per second budget for the REST client
    pub rate_limit: u32,
    pub request_timeout_secs: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            api_key: None,
            api_secret: None,
            fee_rate: 0.001, // 0.1%
            rate_limit: 10,
            request_timeout_secs: 10,
        }
    }
}

/// Trading configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    pub symbols: Vec<String>,
    pub initial_capital: f64,
    pub trading_interval_seconds: u64,
    pub mode: TradingMode,
    /// Fraction of equity committed per order
    pub order_size_pct: f64,
    /// Candle window fetched per tick
    pub candle_limit: u32,
    /// Quote asset used to seed live capital from the account balance
    pub quote_asset: String,
}

impl Default for TradingConfig {
    fn default() -> Self {
        TradingConfig {
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            initial_capital: 10_000.0,
            trading_interval_seconds: 60,
            mode: TradingMode::Paper,
            order_size_pct: 0.01,
            candle_limit: 200,
            quote_asset: "USDT".to_string(),
        }
    }
}

impl TradingConfig {
    pub fn symbols(&self) -> Vec<crate::Symbol> {
        self.symbols.iter().map(crate::Symbol::new).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_for_merges_default_block() {
        let mut config = Config::default();
        config.default_policy = serde_json::json!({
            "grid_levels_per_side": 5,
            "dca_rsi_threshold": 32.0
        });

        let policy = config.policy_for("BTCUSDT").unwrap();
        assert_eq!(policy.grid_levels_per_side, 5);
        assert!((policy.dca_rsi_threshold - 32.0).abs() < 1e-9);
        // Untouched knobs keep crate defaults
        assert!((policy.spread_far_pct - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_policy_for_pair_override_wins() {
        let mut config = Config::default();
        config.default_policy = serde_json::json!({ "grid_levels_per_side": 5 });
        config.pairs.insert(
            "ETHUSDT".to_string(),
            serde_json::json!({ "grid_levels_per_side": 2, "tp_rsi_threshold": 70.0 }),
        );

        let btc = config.policy_for("BTCUSDT").unwrap();
        assert_eq!(btc.grid_levels_per_side, 5);

        let eth = config.policy_for("ETHUSDT").unwrap();
        assert_eq!(eth.grid_levels_per_side, 2);
        assert!((eth.tp_rsi_threshold - 70.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_full_config_json() {
        let json = r#"{
            "exchange": { "fee_rate": 0.001, "rate_limit": 10, "request_timeout_secs": 10 },
            "trading": {
                "symbols": ["BTCUSDT"],
                "initial_capital": 25000.0,
                "trading_interval_seconds": 30,
                "mode": "paper",
                "order_size_pct": 0.02,
                "candle_limit": 200,
                "quote_asset": "USDT"
            },
            "default_policy": { "bar_timeframe": "1m", "grid_levels_per_side": 3 },
            "pairs": { "BTCUSDT": { "spread_mid_pct": 0.4 } },
            "symbol_filters": {
                "BTCUSDT": { "tick_size": 0.01, "step_size": 0.00001, "min_notional": 11.0 }
            }
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.trading.mode, TradingMode::Paper);
        assert!((config.trading.order_size_pct - 0.02).abs() < 1e-9);

        let policy = config.policy_for("BTCUSDT").unwrap();
        assert!((policy.spread_mid_pct - 0.4).abs() < 1e-9);
        assert_eq!(policy.grid_levels_per_side, 3);
    }
}
