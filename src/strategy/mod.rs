//! Trading strategy module
//!
//! The hybrid grid + DCA engine is the sole planner. It consumes one bar and
//! an indicator bundle per tick and emits a [`hybrid::Plan`]; order handling
//! lives in the order lifecycle manager.

pub mod hybrid;

pub use hybrid::{Band, GateState, HybridEngine, HybridPolicy, Plan, PlanOrder, SlAction};
