//! The hybrid grid + DCA planning engine
//!
//! Deterministic given (state, bundle, bar, equity, policy): each bar maps
//! to exactly one [`Plan`]. Replaying the same bar stream on a fresh engine
//! reproduces the same plans, which the test suite leans on.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::indicators::IndicatorBundle;
use crate::{Candle, Side, Symbol};

use super::config::HybridPolicy;
use super::gate;
use super::plan::{Band, EngineState, GateState, Plan, PlanOrder};

pub struct HybridEngine {
    symbol: Symbol,
    policy: HybridPolicy,
    bar_seconds: i64,
    state: EngineState,
}

impl HybridEngine {
    pub fn new(symbol: Symbol, policy: HybridPolicy) -> Self {
        let bar_seconds = policy.bar_seconds();
        info!(symbol = %symbol, timeframe = %policy.bar_timeframe, "Hybrid engine initialized");
        HybridEngine {
            symbol,
            policy,
            bar_seconds,
            state: EngineState::default(),
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn policy(&self) -> &HybridPolicy {
        &self.policy
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// Process one bar and produce the trading plan
    pub fn on_bar(&mut self, bar: &Candle, bundle: &IndicatorBundle, equity: f64) -> Plan {
        let ref_price = bar.close;
        let (band, spread_pct) = self.compute_band_and_spread(bundle);

        let mut plan = Plan::empty(ref_price, band, spread_pct);

        let (gate_state, sl_action) = gate::evaluate(
            &mut self.state,
            &self.policy,
            self.bar_seconds,
            bar.datetime,
            ref_price,
            equity,
            bundle.rsi,
        );
        plan.pnl_gate_state = gate_state;
        plan.sl_action = sl_action;

        if plan.sl_action.stop {
            return plan;
        }

        match gate_state {
            GateState::Run => {
                if self.policy.grid_enabled {
                    let (grid_orders, kill_replace) =
                        self.plan_grid(ref_price, spread_pct, bar.datetime);
                    plan.grid_orders = grid_orders;
                    plan.kill_replace = kill_replace;
                }
                if self.policy.dca_enabled {
                    plan.dca_orders = self.plan_dca(ref_price, bundle, bar.datetime);
                }
                if self.policy.tp_enabled {
                    plan.tp_orders = self.plan_tp(ref_price, bundle, band);
                }
            }
            GateState::Degraded => {
                if self.policy.dca_enabled {
                    plan.dca_orders = self.plan_dca(ref_price, bundle, bar.datetime);
                }
                if self.policy.tp_enabled {
                    plan.tp_orders = self.plan_tp(ref_price, bundle, band);
                }
            }
            GateState::Paused => {}
        }

        plan
    }

    /// Record a DCA fill price for the minimum-distance rule
    pub fn notify_dca_fill(&mut self, fill_price: f64) {
        self.state.last_dca_fill_price = Some(fill_price);
        info!(symbol = %self.symbol, price = fill_price, "DCA fill recorded");
    }

    /// Classify the volatility band from ATR% and apply the RSI adjustment
    fn compute_band_and_spread(&self, bundle: &IndicatorBundle) -> (Band, f64) {
        if !self.policy.use_dynamic_spread {
            return (Band::Mid, self.policy.fixed_spread_pct);
        }

        let (band, base_spread) = if bundle.atr_pct < self.policy.band_near_threshold {
            (Band::Near, self.policy.spread_near_pct)
        } else if bundle.atr_pct < self.policy.band_mid_threshold {
            (Band::Mid, self.policy.spread_mid_pct)
        } else {
            (Band::Far, self.policy.spread_far_pct)
        };

        let spread_pct = if self.policy.rsi_adjust_enabled {
            let rsi_factor = if bundle.rsi < 30.0 {
                1.0 - self.policy.rsi_adjust_factor
            } else if bundle.rsi > 70.0 {
                1.0 + self.policy.rsi_adjust_factor
            } else {
                1.0
            };
            base_spread * rsi_factor
        } else {
            base_spread
        };

        (band, spread_pct.clamp(0.1, 2.0))
    }

    /// Plan symmetric grid levels around the reference price
    fn plan_grid(
        &mut self,
        ref_price: f64,
        spread_pct: f64,
        timestamp: DateTime<Utc>,
    ) -> (Vec<PlanOrder>, bool) {
        let mut kill_replace = false;

        if let Some(last_ref) = self.state.last_grid_ref_price {
            let drift_pct = ((ref_price - last_ref) / last_ref).abs() * 100.0;
            if drift_pct > self.policy.grid_kill_replace_threshold_pct {
                kill_replace = true;
                info!(
                    symbol = %self.symbol,
                    drift = format!("{:.2}", drift_pct),
                    threshold = self.policy.grid_kill_replace_threshold_pct,
                    "Grid kill-replace triggered"
                );
            }
        }

        if !kill_replace {
            if let Some(last_ts) = self.state.last_grid_timestamp {
                let elapsed = (timestamp - last_ts).num_seconds();
                if elapsed < self.policy.grid_min_seconds_between {
                    debug!(
                        symbol = %self.symbol,
                        elapsed,
                        min = self.policy.grid_min_seconds_between,
                        "Grid cooldown active"
                    );
                    return (Vec::new(), false);
                }
            }
        }

        let mut grid_orders = Vec::with_capacity(self.policy.grid_levels_per_side * 2);
        for i in 1..=self.policy.grid_levels_per_side {
            let step = (spread_pct / 100.0) * i as f64;
            grid_orders.push(PlanOrder::new(
                Side::Buy,
                ref_price * (1.0 - step),
                format!("grid_buy_{}", i),
            ));
            grid_orders.push(PlanOrder::new(
                Side::Sell,
                ref_price * (1.0 + step),
                format!("grid_sell_{}", i),
            ));
        }

        if !grid_orders.is_empty() || kill_replace {
            self.state.last_grid_ref_price = Some(ref_price);
            self.state.last_grid_timestamp = Some(timestamp);
        }

        debug!(
            symbol = %self.symbol,
            orders = grid_orders.len(),
            spread = format!("{:.3}", spread_pct),
            kill_replace,
            "Grid planned"
        );

        (grid_orders, kill_replace)
    }

    /// Plan a single DCA buy when oversold
    fn plan_dca(
        &mut self,
        ref_price: f64,
        bundle: &IndicatorBundle,
        timestamp: DateTime<Utc>,
    ) -> Vec<PlanOrder> {
        if bundle.rsi >= self.policy.dca_rsi_threshold {
            return Vec::new();
        }

        if self.policy.dca_use_ema_gate && ref_price >= bundle.ema_fast {
            return Vec::new();
        }

        if let Some(last_ts) = self.state.last_dca_timestamp {
            let bars_elapsed = (timestamp - last_ts).num_seconds() as f64 / self.bar_seconds as f64;
            if bars_elapsed < self.policy.dca_cooldown_bars {
                debug!(
                    symbol = %self.symbol,
                    bars = format!("{:.1}", bars_elapsed),
                    cooldown = self.policy.dca_cooldown_bars,
                    "DCA cooldown active"
                );
                return Vec::new();
            }
        }

        if let Some(last_fill) = self.state.last_dca_fill_price {
            let distance_pct = ((ref_price - last_fill) / last_fill).abs() * 100.0;
            if distance_pct < self.policy.dca_min_distance_from_last_fill_pct {
                debug!(
                    symbol = %self.symbol,
                    distance = format!("{:.2}", distance_pct),
                    min = self.policy.dca_min_distance_from_last_fill_pct,
                    "DCA too close to last fill"
                );
                return Vec::new();
            }
        }

        let dca_price = ref_price * (1.0 - self.policy.dca_price_offset_pct / 100.0);
        self.state.last_dca_timestamp = Some(timestamp);

        info!(
            symbol = %self.symbol,
            rsi = format!("{:.1}", bundle.rsi),
            price = dca_price,
            "DCA triggered"
        );

        vec![PlanOrder::new(
            Side::Buy,
            dca_price,
            format!("dca_rsi{:.0}", bundle.rsi),
        )]
    }

    /// Plan a single TP sell when overbought
    fn plan_tp(&self, ref_price: f64, bundle: &IndicatorBundle, band: Band) -> Vec<PlanOrder> {
        if bundle.rsi < self.policy.tp_rsi_threshold {
            return Vec::new();
        }

        if ref_price < bundle.ema_fast {
            return Vec::new();
        }

        let tp_spread = match band {
            Band::Near => self.policy.tp_spread_near_pct,
            Band::Mid => self.policy.tp_spread_mid_pct,
            Band::Far => self.policy.tp_spread_far_pct,
        };

        let tp_price = ref_price * (1.0 + tp_spread / 100.0);

        info!(
            symbol = %self.symbol,
            rsi = format!("{:.1}", bundle.rsi),
            band = %band,
            price = tp_price,
            "TP triggered"
        );

        vec![PlanOrder::new(
            Side::Sell,
            tp_price,
            format!("tp_rsi{:.0}_band{}", bundle.rsi, band),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap()
    }

    fn bar(ts: DateTime<Utc>, close: f64) -> Candle {
        Candle {
            datetime: ts,
            open: close,
            high: close * 1.001,
            low: close * 0.999,
            close,
            volume: 1_000.0,
        }
    }

    fn bundle(close: f64, rsi: f64, atr_pct: f64, ema_fast: f64) -> IndicatorBundle {
        IndicatorBundle {
            close,
            open: close,
            high: close * 1.001,
            low: close * 0.999,
            volume: 1_000.0,
            rsi,
            atr: close * atr_pct / 100.0,
            atr_pct,
            ema_fast,
            ema_mid: close,
            ema_slow: close,
            bb_upper: close * 1.02,
            bb_middle: close,
            bb_lower: close * 0.98,
        }
    }

    fn engine() -> HybridEngine {
        let mut policy = HybridPolicy::default();
        policy.grid_levels_per_side = 2;
        HybridEngine::new(Symbol::new("BTCUSDT"), policy)
    }

    #[test]
    fn test_grid_emission_mid_band() {
        let mut eng = engine();
        let b = bundle(100.0, 50.0, 1.5, 100.0);

        let plan = eng.on_bar(&bar(t0(), 100.0), &b, 10_000.0);

        assert_eq!(plan.pnl_gate_state, GateState::Run);
        assert_eq!(plan.band, Band::Mid);
        assert_relative_eq!(plan.spread_pct, 0.5);
        assert_eq!(plan.grid_orders.len(), 4);

        let expect = [
            (Side::Buy, 99.5, "grid_buy_1"),
            (Side::Sell, 100.5, "grid_sell_1"),
            (Side::Buy, 99.0, "grid_buy_2"),
            (Side::Sell, 101.0, "grid_sell_2"),
        ];
        for (order, (side, price, tag)) in plan.grid_orders.iter().zip(expect.iter()) {
            assert_eq!(order.side, *side);
            assert_relative_eq!(order.price, *price, epsilon = 1e-9);
            assert_eq!(order.tag, *tag);
        }
    }

    #[test]
    fn test_band_classification() {
        let mut eng = engine();

        let plan = eng.on_bar(&bar(t0(), 100.0), &bundle(100.0, 50.0, 0.5, 100.0), 10_000.0);
        assert_eq!(plan.band, Band::Near);
        assert_relative_eq!(plan.spread_pct, 0.3);

        let plan = eng.on_bar(
            &bar(t0() + Duration::minutes(10), 100.0),
            &bundle(100.0, 50.0, 3.0, 100.0),
            10_000.0,
        );
        assert_eq!(plan.band, Band::Far);
        assert_relative_eq!(plan.spread_pct, 0.8);
    }

    #[test]
    fn test_rsi_spread_adjustment() {
        let mut eng = engine();

        // Oversold tightens: 0.5 * 0.9
        let plan = eng.on_bar(&bar(t0(), 100.0), &bundle(100.0, 25.0, 1.5, 101.0), 10_000.0);
        assert_relative_eq!(plan.spread_pct, 0.45);

        // Overbought widens: 0.5 * 1.1
        let plan = eng.on_bar(
            &bar(t0() + Duration::minutes(10), 100.0),
            &bundle(100.0, 75.0, 1.5, 99.0),
            10_000.0,
        );
        assert_relative_eq!(plan.spread_pct, 0.55);
    }

    #[test]
    fn test_fixed_spread_when_dynamic_disabled() {
        let mut policy = HybridPolicy::default();
        policy.use_dynamic_spread = false;
        policy.fixed_spread_pct = 0.7;
        let mut eng = HybridEngine::new(Symbol::new("BTCUSDT"), policy);

        let plan = eng.on_bar(&bar(t0(), 100.0), &bundle(100.0, 25.0, 3.0, 100.0), 10_000.0);
        assert_eq!(plan.band, Band::Mid);
        assert_relative_eq!(plan.spread_pct, 0.7);
    }

    #[test]
    fn test_spread_clamped() {
        let mut policy = HybridPolicy::default();
        policy.spread_far_pct = 5.0;
        let mut eng = HybridEngine::new(Symbol::new("BTCUSDT"), policy);

        let plan = eng.on_bar(&bar(t0(), 100.0), &bundle(100.0, 50.0, 4.0, 100.0), 10_000.0);
        assert_relative_eq!(plan.spread_pct, 2.0);
    }

    #[test]
    fn test_kill_replace_on_drift() {
        let mut eng = engine();
        let b = bundle(100.0, 50.0, 1.5, 100.0);
        let plan = eng.on_bar(&bar(t0(), 100.0), &b, 10_000.0);
        assert!(!plan.kill_replace);

        // 1.2% drift > 1.0% threshold, inside the cooldown window
        let b2 = bundle(101.2, 50.0, 1.5, 101.2);
        let plan = eng.on_bar(&bar(t0() + Duration::minutes(1), 101.2), &b2, 10_000.0);

        assert!(plan.kill_replace);
        assert_eq!(plan.grid_orders.len(), 4);
        assert_relative_eq!(plan.ref_price, 101.2);
        assert_relative_eq!(plan.grid_orders[0].price, 101.2 * (1.0 - 0.005), epsilon = 1e-9);
    }

    #[test]
    fn test_grid_cooldown_suppresses_emission() {
        let mut eng = engine();
        let b = bundle(100.0, 50.0, 1.5, 100.0);
        let plan = eng.on_bar(&bar(t0(), 100.0), &b, 10_000.0);
        assert_eq!(plan.grid_orders.len(), 4);

        // Small drift within threshold, 60s < 300s cooldown
        let b2 = bundle(100.5, 50.0, 1.5, 100.5);
        let plan = eng.on_bar(&bar(t0() + Duration::minutes(1), 100.5), &b2, 10_000.0);
        assert!(plan.grid_orders.is_empty());
        assert!(!plan.kill_replace);

        // After the cooldown the grid re-emits
        let plan = eng.on_bar(&bar(t0() + Duration::minutes(6), 100.5), &b2, 10_000.0);
        assert_eq!(plan.grid_orders.len(), 4);
    }

    #[test]
    fn test_dca_fires_when_oversold_below_ema() {
        let mut eng = engine();
        let b = bundle(99.0, 30.0, 1.5, 100.0);

        let plan = eng.on_bar(&bar(t0(), 99.0), &b, 10_000.0);

        assert_eq!(plan.dca_orders.len(), 1);
        let dca = &plan.dca_orders[0];
        assert_eq!(dca.side, Side::Buy);
        assert_relative_eq!(dca.price, 99.0 * (1.0 - 0.001), epsilon = 1e-9);
        assert!(dca.tag.starts_with("dca_rsi30"));
    }

    #[test]
    fn test_dca_blocked_by_ema_gate() {
        let mut eng = engine();
        let b = bundle(101.0, 30.0, 1.5, 100.0);

        let plan = eng.on_bar(&bar(t0(), 101.0), &b, 10_000.0);
        assert!(plan.dca_orders.is_empty());
    }

    #[test]
    fn test_dca_cooldown_and_distance() {
        let mut eng = engine();
        let b = bundle(99.0, 30.0, 1.5, 100.0);

        let plan = eng.on_bar(&bar(t0(), 99.0), &b, 10_000.0);
        assert_eq!(plan.dca_orders.len(), 1);

        // 2 bars later: 5-bar cooldown blocks
        let plan = eng.on_bar(&bar(t0() + Duration::minutes(2), 99.0), &b, 10_000.0);
        assert!(plan.dca_orders.is_empty());

        // Past the cooldown, but a fill at 99.0 blocks re-entry within 1%
        eng.notify_dca_fill(99.0);
        let plan = eng.on_bar(&bar(t0() + Duration::minutes(6), 99.0), &b, 10_000.0);
        assert!(plan.dca_orders.is_empty());

        // Price 1.5% below the last fill clears the distance rule
        let b2 = bundle(97.5, 30.0, 1.5, 100.0);
        let plan = eng.on_bar(&bar(t0() + Duration::minutes(12), 97.5), &b2, 10_000.0);
        assert_eq!(plan.dca_orders.len(), 1);
    }

    #[test]
    fn test_tp_fires_when_overbought_above_ema() {
        let mut eng = engine();
        let b = bundle(100.0, 70.0, 1.5, 99.0);

        let plan = eng.on_bar(&bar(t0(), 100.0), &b, 10_000.0);

        assert_eq!(plan.tp_orders.len(), 1);
        let tp = &plan.tp_orders[0];
        assert_eq!(tp.side, Side::Sell);
        assert_relative_eq!(tp.price, 100.0 * 1.008, epsilon = 1e-9);
        assert_eq!(tp.tag, "tp_rsi70_bandmid");
    }

    #[test]
    fn test_tp_blocked_below_ema() {
        let mut eng = engine();
        let b = bundle(98.0, 70.0, 1.5, 100.0);

        let plan = eng.on_bar(&bar(t0(), 98.0), &b, 10_000.0);
        assert!(plan.tp_orders.is_empty());
    }

    #[test]
    fn test_degraded_suppresses_grid_keeps_dca_tp() {
        let mut eng = engine();
        // Anchor the day
        eng.on_bar(&bar(t0(), 100.0), &bundle(100.0, 50.0, 1.5, 100.0), 10_000.0);

        // -2.5% daily PnL: DEGRADED; oversold below EMA so DCA is eligible
        let b = bundle(99.0, 30.0, 1.5, 100.0);
        let plan = eng.on_bar(&bar(t0() + Duration::minutes(10), 99.0), &b, 9_750.0);

        assert_eq!(plan.pnl_gate_state, GateState::Degraded);
        assert!(plan.grid_orders.is_empty());
        assert_eq!(plan.dca_orders.len(), 1);
    }

    #[test]
    fn test_paused_emits_nothing() {
        let mut eng = engine();
        eng.on_bar(&bar(t0(), 100.0), &bundle(100.0, 50.0, 1.5, 100.0), 10_000.0);

        let b = bundle(99.0, 30.0, 1.5, 100.0);
        let plan = eng.on_bar(&bar(t0() + Duration::minutes(10), 99.0), &b, 9_550.0);

        assert_eq!(plan.pnl_gate_state, GateState::Paused);
        assert!(!plan.sl_action.stop);
        assert_eq!(plan.total_orders(), 0);
    }

    #[test]
    fn test_hard_stop_plan_is_empty_and_paused() {
        let mut eng = engine();
        eng.on_bar(&bar(t0(), 100.0), &bundle(100.0, 50.0, 1.5, 100.0), 10_000.0);

        let plan = eng.on_bar(
            &bar(t0() + Duration::minutes(10), 100.0),
            &bundle(100.0, 50.0, 1.5, 100.0),
            9_400.0,
        );

        assert_eq!(plan.pnl_gate_state, GateState::Paused);
        assert!(plan.sl_action.stop);
        assert_eq!(plan.total_orders(), 0);

        // Latch: the next bar is still stopped even with recovered equity
        let plan = eng.on_bar(
            &bar(t0() + Duration::minutes(11), 100.0),
            &bundle(100.0, 50.0, 1.5, 100.0),
            10_000.0,
        );
        assert!(plan.sl_action.stop);
        assert_eq!(plan.total_orders(), 0);
    }

    #[test]
    fn test_disabled_substrategies_emit_nothing() {
        let mut policy = HybridPolicy::default();
        policy.grid_enabled = false;
        policy.dca_enabled = false;
        policy.tp_enabled = false;
        let mut eng = HybridEngine::new(Symbol::new("BTCUSDT"), policy);

        let plan = eng.on_bar(&bar(t0(), 99.0), &bundle(99.0, 30.0, 1.5, 100.0), 10_000.0);
        assert_eq!(plan.total_orders(), 0);
    }

    #[test]
    fn test_replay_determinism() {
        let bars: Vec<(Candle, IndicatorBundle, f64)> = (0..30)
            .map(|i| {
                let price = 100.0 + (i % 7) as f64 * 0.4 - 1.0;
                let rsi = 30.0 + (i % 9) as f64 * 5.0;
                (
                    bar(t0() + Duration::minutes(i), price),
                    bundle(price, rsi, 1.5, price + 0.5),
                    10_000.0 - i as f64 * 3.0,
                )
            })
            .collect();

        let mut eng_a = engine();
        let mut eng_b = engine();

        for (candle, b, equity) in &bars {
            let plan_a = eng_a.on_bar(candle, b, *equity);
            let plan_b = eng_b.on_bar(candle, b, *equity);

            assert_eq!(plan_a.pnl_gate_state, plan_b.pnl_gate_state);
            assert_eq!(plan_a.grid_orders, plan_b.grid_orders);
            assert_eq!(plan_a.dca_orders, plan_b.dca_orders);
            assert_eq!(plan_a.tp_orders, plan_b.tp_orders);
            assert_eq!(plan_a.kill_replace, plan_b.kill_replace);
        }
    }
}
