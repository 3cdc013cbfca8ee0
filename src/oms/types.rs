//! Pending order bookkeeping types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{Side, Symbol};

/// Atomic counter for simulated order ids (paper and backtest modes)
static LOCAL_ORDER_ID: AtomicU64 = AtomicU64::new(1);

/// Generate the next local order id (thread-safe, lock-free)
pub fn next_local_order_id() -> u64 {
    LOCAL_ORDER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Role of a pending order within the strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Grid,
    Dca,
    Tp,
    Sl,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderKind::Grid => write!(f, "GRID"),
            OrderKind::Dca => write!(f, "DCA"),
            OrderKind::Tp => write!(f, "TP"),
            OrderKind::Sl => write!(f, "SL"),
        }
    }
}

/// A placed-but-unfilled limit order tracked by the order manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOrder {
    pub symbol: Symbol,
    pub side: Side,
    pub price: f64,
    pub qty: f64,
    pub tag: String,
    pub kind: OrderKind,
    pub order_id: String,
    pub timestamp: DateTime<Utc>,
    /// RSI at the order's first stale-sweep evaluation, for the reversal rule
    pub initial_rsi: Option<f64>,
}

/// Why a pending order was cancelled
#[derive(Debug, Clone, PartialEq)]
pub enum CancelReason {
    Age {
        age_seconds: i64,
        max_seconds: i64,
    },
    PriceDrift {
        drift_pct: f64,
        threshold_pct: f64,
    },
    VolatilitySpike {
        atr_pct: f64,
        limit_pct: f64,
    },
    RsiReversal {
        initial_rsi: f64,
        current_rsi: f64,
    },
    KillReplace,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Age {
                age_seconds,
                max_seconds,
            } => write!(f, "Order age {}s > {}s", age_seconds, max_seconds),
            CancelReason::PriceDrift {
                drift_pct,
                threshold_pct,
            } => write!(
                f,
                "Price drift {:.2}% > {:.1}%",
                drift_pct, threshold_pct
            ),
            CancelReason::VolatilitySpike { atr_pct, limit_pct } => {
                write!(f, "Volatility spike: ATR {:.2}% > {:.2}%", atr_pct, limit_pct)
            }
            CancelReason::RsiReversal {
                initial_rsi,
                current_rsi,
            } => write!(f, "RSI reversal {:.1} -> {:.1}", initial_rsi, current_rsi),
            CancelReason::KillReplace => write!(f, "Grid kill-replace"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_order_ids_increase() {
        let id1 = next_local_order_id();
        let id2 = next_local_order_id();
        assert!(id2 > id1);
    }

    #[test]
    fn test_cancel_reason_formats() {
        let reason = CancelReason::Age {
            age_seconds: 301,
            max_seconds: 300,
        };
        assert_eq!(reason.to_string(), "Order age 301s > 300s");

        let reason = CancelReason::RsiReversal {
            initial_rsi: 35.0,
            current_rsi: 62.5,
        };
        assert_eq!(reason.to_string(), "RSI reversal 35.0 -> 62.5");
    }
}
