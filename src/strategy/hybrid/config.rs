//! Hybrid strategy policy configuration
//!
//! One policy per symbol. All knobs deserialize from the `default_policy`
//! config block, optionally merged with a per-pair override object.

use serde::{Deserialize, Serialize};

/// Policy knobs for the hybrid grid + DCA engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridPolicy {
    // === Spread ===
    /// Derive the spread from ATR% bands; false uses `fixed_spread_pct`
    pub use_dynamic_spread: bool,
    pub fixed_spread_pct: f64,

    // === Volatility bands (ATR% thresholds) ===
    /// ATR% below this is the `near` band
    pub band_near_threshold: f64,
    /// ATR% below this (and above near) is the `mid` band; above is `far`
    pub band_mid_threshold: f64,
    pub spread_near_pct: f64,
    pub spread_mid_pct: f64,
    pub spread_far_pct: f64,

    // === RSI spread adjustment ===
    /// RSI < 30 tightens the spread, RSI > 70 widens it
    pub rsi_adjust_enabled: bool,
    pub rsi_adjust_factor: f64,

    // === Grid ===
    pub grid_enabled: bool,
    pub grid_levels_per_side: usize,
    /// Price drift (%) from the last grid center that forces a kill-replace
    pub grid_kill_replace_threshold_pct: f64,
    /// Minimum seconds between grid emissions (ignored on kill-replace)
    pub grid_min_seconds_between: i64,

    // === DCA ===
    pub dca_enabled: bool,
    /// DCA only fires below this RSI
    pub dca_rsi_threshold: f64,
    /// Require price below the fast EMA as well
    pub dca_use_ema_gate: bool,
    pub dca_cooldown_bars: f64,
    /// Minimum distance (%) from the last DCA fill price
    pub dca_min_distance_from_last_fill_pct: f64,
    /// Buy offset (%) below the reference price
    pub dca_price_offset_pct: f64,

    // === Take profit ===
    pub tp_enabled: bool,
    /// TP only fires at or above this RSI with price above the fast EMA
    pub tp_rsi_threshold: f64,
    pub tp_spread_near_pct: f64,
    pub tp_spread_mid_pct: f64,
    pub tp_spread_far_pct: f64,

    // === PnL gate ===
    pub gate_degraded_gap_pct: f64,
    pub gate_paused_gap_pct: f64,
    pub gate_degraded_daily_pnl_pct: f64,
    pub gate_paused_daily_pnl_pct: f64,

    // === Hard stop ===
    pub hard_stop_daily_pnl_pct: f64,
    pub hard_stop_gap_pct: f64,

    /// Bar timeframe, used for bar-denominated cooldowns ("1m", "5m", "1h", ...)
    pub bar_timeframe: String,

    // === Auto-resume after hard stop ===
    pub auto_resume_enabled: bool,
    pub resume_rsi_threshold: f64,
    pub resume_price_recovery_pct: f64,
    pub resume_cooldown_bars: f64,

    // === Pending-order lifecycle ===
    pub order_max_age_seconds: i64,
    pub order_price_drift_threshold_pct: f64,
    pub order_cancel_on_volatility_spike: bool,
    /// Cancel grid orders when ATR% exceeds previous tick's ATR% times this
    pub order_volatility_spike_threshold: f64,
    pub order_cancel_on_rsi_reversal: bool,
    /// Minimum RSI move required to count as a reversal
    pub order_rsi_reversal_threshold: f64,
}

impl Default for HybridPolicy {
    fn default() -> Self {
        HybridPolicy {
            use_dynamic_spread: true,
            fixed_spread_pct: 0.5,

            band_near_threshold: 1.0,
            band_mid_threshold: 2.0,
            spread_near_pct: 0.3,
            spread_mid_pct: 0.5,
            spread_far_pct: 0.8,

            rsi_adjust_enabled: true,
            rsi_adjust_factor: 0.1,

            grid_enabled: true,
            grid_levels_per_side: 3,
            grid_kill_replace_threshold_pct: 1.0,
            grid_min_seconds_between: 300,

            dca_enabled: true,
            dca_rsi_threshold: 35.0,
            dca_use_ema_gate: true,
            dca_cooldown_bars: 5.0,
            dca_min_distance_from_last_fill_pct: 1.0,
            dca_price_offset_pct: 0.1,

            tp_enabled: true,
            tp_rsi_threshold: 65.0,
            tp_spread_near_pct: 0.5,
            tp_spread_mid_pct: 0.8,
            tp_spread_far_pct: 1.2,

            gate_degraded_gap_pct: -3.0,
            gate_paused_gap_pct: -5.0,
            gate_degraded_daily_pnl_pct: -2.0,
            gate_paused_daily_pnl_pct: -4.0,

            hard_stop_daily_pnl_pct: -5.0,
            hard_stop_gap_pct: -8.0,

            bar_timeframe: "1m".to_string(),

            auto_resume_enabled: true,
            resume_rsi_threshold: 40.0,
            resume_price_recovery_pct: 2.0,
            resume_cooldown_bars: 60.0,

            order_max_age_seconds: 300,
            order_price_drift_threshold_pct: 2.0,
            order_cancel_on_volatility_spike: true,
            order_volatility_spike_threshold: 1.5,
            order_cancel_on_rsi_reversal: true,
            order_rsi_reversal_threshold: 20.0,
        }
    }
}

impl HybridPolicy {
    /// Seconds per bar for the configured timeframe
    ///
    /// Unrecognized suffixes fall back to one minute.
    pub fn bar_seconds(&self) -> i64 {
        parse_timeframe_seconds(&self.bar_timeframe)
    }
}

/// Parse a timeframe string ("1m", "15m", "4h", "1d") into seconds
pub fn parse_timeframe_seconds(timeframe: &str) -> i64 {
    let (digits, unit) = timeframe.split_at(timeframe.len().saturating_sub(1));
    let n: i64 = digits.parse().unwrap_or(1);
    match unit {
        "m" => n * 60,
        "h" => n * 3600,
        "d" => n * 86_400,
        _ => 60,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeframe_parsing() {
        assert_eq!(parse_timeframe_seconds("1m"), 60);
        assert_eq!(parse_timeframe_seconds("15m"), 900);
        assert_eq!(parse_timeframe_seconds("4h"), 14_400);
        assert_eq!(parse_timeframe_seconds("1d"), 86_400);
        assert_eq!(parse_timeframe_seconds("1w"), 60);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let policy: HybridPolicy =
            serde_json::from_str(r#"{"grid_levels_per_side": 5, "dca_rsi_threshold": 30}"#)
                .unwrap();

        assert_eq!(policy.grid_levels_per_side, 5);
        assert!((policy.dca_rsi_threshold - 30.0).abs() < 1e-9);
        // Untouched knobs keep their defaults
        assert!((policy.spread_mid_pct - 0.5).abs() < 1e-9);
        assert!(policy.grid_enabled);
    }
}
