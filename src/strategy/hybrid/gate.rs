//! PnL gate and hard-stop supervision
//!
//! A three-state regulator over daily PnL% and gap% plus a latched hard
//! stop. The gate states are memoryless (recomputed each bar); only the
//! daily anchors and the hard-stop latch persist in [`EngineState`].

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::config::HybridPolicy;
use super::plan::{EngineState, GateState, SlAction};

/// Evaluate the gate and hard stop for one bar, mutating the engine state
///
/// Ordering: day rollover, auto-resume check, hard-stop latching, then the
/// memoryless gate classification.
pub(super) fn evaluate(
    state: &mut EngineState,
    policy: &HybridPolicy,
    bar_seconds: i64,
    timestamp: DateTime<Utc>,
    ref_price: f64,
    equity: f64,
    rsi: f64,
) -> (GateState, SlAction) {
    let current_date = timestamp.date_naive();

    // Anchor the daily open on the first bar of a new calendar date
    if state.last_date != Some(current_date) {
        state.open_price_day = Some(ref_price);
        state.equity_open_day = Some(equity);
        state.last_date = Some(current_date);
        info!(
            date = %current_date,
            open_price = ref_price,
            equity,
            "New trading day"
        );
    }

    let gap_pct = match state.open_price_day {
        Some(open) if open > 0.0 => ((ref_price - open) / open) * 100.0,
        _ => 0.0,
    };
    let daily_pnl_pct = match state.equity_open_day {
        Some(open) if open > 0.0 => ((equity - open) / open) * 100.0,
        _ => 0.0,
    };

    if state.hard_stop_active {
        if policy.auto_resume_enabled && can_resume(state, policy, bar_seconds, timestamp, ref_price, rsi)
        {
            warn!("Auto-resume: recovery conditions met, resuming from hard stop");
            state.hard_stop_active = false;
            state.hard_stop_timestamp = None;
            state.hard_stop_price = None;
            state.hard_stop_reason = None;
            // fall through to normal gate classification
        } else {
            let reason = format!(
                "Hard stop active: {}",
                state.hard_stop_reason.as_deref().unwrap_or("unknown")
            );
            return (GateState::Paused, SlAction::stop(reason));
        }
    }

    if daily_pnl_pct <= policy.hard_stop_daily_pnl_pct {
        let reason = format!(
            "Daily PnL {:.2}% <= {:?}%",
            daily_pnl_pct, policy.hard_stop_daily_pnl_pct
        );
        activate_hard_stop(state, timestamp, ref_price, &reason);
        return (GateState::Paused, SlAction::stop(reason));
    }

    if gap_pct <= policy.hard_stop_gap_pct {
        let reason = format!("Gap {:.2}% <= {:?}%", gap_pct, policy.hard_stop_gap_pct);
        activate_hard_stop(state, timestamp, ref_price, &reason);
        return (GateState::Paused, SlAction::stop(reason));
    }

    let gate_state = if daily_pnl_pct <= policy.gate_paused_daily_pnl_pct
        || gap_pct <= policy.gate_paused_gap_pct
    {
        GateState::Paused
    } else if daily_pnl_pct <= policy.gate_degraded_daily_pnl_pct
        || gap_pct <= policy.gate_degraded_gap_pct
    {
        GateState::Degraded
    } else {
        GateState::Run
    };

    debug!(
        state = %gate_state,
        gap_pct = format!("{:.2}", gap_pct),
        daily_pnl_pct = format!("{:.2}", daily_pnl_pct),
        "Gate evaluated"
    );

    (gate_state, SlAction::default())
}

fn activate_hard_stop(
    state: &mut EngineState,
    timestamp: DateTime<Utc>,
    price: f64,
    reason: &str,
) {
    state.hard_stop_active = true;
    state.hard_stop_timestamp = Some(timestamp);
    state.hard_stop_price = Some(price);
    state.hard_stop_reason = Some(reason.to_string());

    warn!(price, reason, "Hard stop activated");
}

/// All three resume conditions must hold simultaneously:
/// cooldown elapsed, RSI recovered, and price recovered from the stop price.
fn can_resume(
    state: &EngineState,
    policy: &HybridPolicy,
    bar_seconds: i64,
    timestamp: DateTime<Utc>,
    current_price: f64,
    rsi: f64,
) -> bool {
    let stop_ts = match state.hard_stop_timestamp {
        Some(ts) => ts,
        None => return false,
    };

    let bars_since_stop = (timestamp - stop_ts).num_seconds() as f64 / bar_seconds as f64;
    if bars_since_stop < policy.resume_cooldown_bars {
        debug!(
            bars = format!("{:.0}", bars_since_stop),
            required = policy.resume_cooldown_bars,
            "Resume cooldown still running"
        );
        return false;
    }

    if rsi <= policy.resume_rsi_threshold {
        debug!(rsi, threshold = policy.resume_rsi_threshold, "Resume RSI not recovered");
        return false;
    }

    if let Some(stop_price) = state.hard_stop_price {
        if stop_price > 0.0 {
            let recovery_pct = ((current_price - stop_price) / stop_price) * 100.0;
            if recovery_pct < policy.resume_price_recovery_pct {
                debug!(
                    recovery = format!("{:+.2}", recovery_pct),
                    required = policy.resume_price_recovery_pct,
                    "Resume price not recovered"
                );
                return false;
            }
        }
    }

    info!(
        bars = format!("{:.0}", bars_since_stop),
        rsi, "Resume conditions met"
    );
    true
}
