//! Plan and state types for the hybrid engine
//!
//! A [`Plan`] is a pure value: the engine's entire output for one bar. The
//! order lifecycle manager consumes plans and reports fills back; no other
//! state is shared across that boundary.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::Side;

/// PnL gate state, recomputed every bar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateState {
    /// Full operation: grid + DCA + TP
    Run,
    /// Grid suppressed; DCA and TP continue
    Degraded,
    /// No new orders
    Paused,
}

impl std::fmt::Display for GateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateState::Run => write!(f, "RUN"),
            GateState::Degraded => write!(f, "DEGRADED"),
            GateState::Paused => write!(f, "PAUSED"),
        }
    }
}

/// Volatility band derived from ATR%, selects the base spread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Band {
    Near,
    Mid,
    Far,
}

impl std::fmt::Display for Band {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Band::Near => write!(f, "near"),
            Band::Mid => write!(f, "mid"),
            Band::Far => write!(f, "far"),
        }
    }
}

/// Stop-loss directive attached to every plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlAction {
    pub stop: bool,
    pub reason: Option<String>,
}

impl SlAction {
    pub fn stop(reason: impl Into<String>) -> Self {
        SlAction {
            stop: true,
            reason: Some(reason.into()),
        }
    }
}

/// A single planned limit order (price level + role tag, no quantity yet)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanOrder {
    pub side: Side,
    pub price: f64,
    pub tag: String,
    /// Sizing is the order manager's job; engines may pre-size in tests
    pub qty: Option<f64>,
}

impl PlanOrder {
    pub fn new(side: Side, price: f64, tag: impl Into<String>) -> Self {
        PlanOrder {
            side,
            price,
            tag: tag.into(),
            qty: None,
        }
    }
}

/// The engine's complete output for one bar
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub pnl_gate_state: GateState,
    pub sl_action: SlAction,
    pub grid_orders: Vec<PlanOrder>,
    pub dca_orders: Vec<PlanOrder>,
    pub tp_orders: Vec<PlanOrder>,
    pub band: Band,
    pub spread_pct: f64,
    pub ref_price: f64,
    /// Cancel the previous grid before placing this one
    pub kill_replace: bool,
}

impl Plan {
    /// Empty plan skeleton for the given reference price
    pub fn empty(ref_price: f64, band: Band, spread_pct: f64) -> Self {
        Plan {
            pnl_gate_state: GateState::Run,
            sl_action: SlAction::default(),
            grid_orders: Vec::new(),
            dca_orders: Vec::new(),
            tp_orders: Vec::new(),
            band,
            spread_pct,
            ref_price,
            kill_replace: false,
        }
    }

    pub fn total_orders(&self) -> usize {
        self.grid_orders.len() + self.dca_orders.len() + self.tp_orders.len()
    }
}

/// Per-symbol mutable engine state
///
/// Optional fields are genuinely absent until first set; no sentinel prices.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineState {
    pub last_grid_ref_price: Option<f64>,
    pub last_grid_timestamp: Option<DateTime<Utc>>,
    pub last_dca_timestamp: Option<DateTime<Utc>>,
    pub last_dca_fill_price: Option<f64>,

    // Daily anchors for the PnL gate, taken from the first bar of each date
    pub open_price_day: Option<f64>,
    pub equity_open_day: Option<f64>,
    pub last_date: Option<NaiveDate>,

    // Latched hard stop
    pub hard_stop_active: bool,
    pub hard_stop_timestamp: Option<DateTime<Utc>>,
    pub hard_stop_price: Option<f64>,
    pub hard_stop_reason: Option<String>,
}
