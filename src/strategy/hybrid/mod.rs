//! Hybrid Grid + DCA strategy engine
//!
//! Combines grid market-making with conditional dollar-cost-averaging on a
//! single symbol, governed by a PnL gate (RUN/DEGRADED/PAUSED) and a latched
//! hard stop with auto-resume.
//!
//! The engine plans, it never trades: each bar produces a [`Plan`] value and
//! the order lifecycle manager turns plans into placements and cancellations.

mod config;
mod engine;
mod gate;
mod plan;

pub use config::HybridPolicy;
pub use engine::HybridEngine;
pub use plan::{Band, EngineState, GateState, Plan, PlanOrder, SlAction};
