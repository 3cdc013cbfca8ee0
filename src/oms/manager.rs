//! The order manager: placement, stale sweeps, and fill reconciliation
//!
//! Per tick and per symbol the driver calls, in order: `place_plan` (which
//! runs kill-replace cancellations before new grid placements), then
//! `sweep_stale`, then fill reconciliation. The sweep-before-reconcile
//! ordering guarantees a stale order can never fill after its age expired.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::exchange::{Exchange, ExchangeError, SymbolFilters};
use crate::portfolio::Portfolio;
use crate::session_log::{FillLogEntry, OrderLogEntry, SessionLog};
use crate::strategy::hybrid::{GateState, HybridEngine, HybridPolicy, Plan, PlanOrder};
use crate::{PositionSide, Side, Symbol, TradingMode};

use super::types::{next_local_order_id, CancelReason, OrderKind, PendingOrder};

/// Order manager configuration
#[derive(Debug, Clone)]
pub struct OrderManagerConfig {
    /// Strategy name stamped on positions and records
    pub strategy_name: String,
    /// Fraction of equity committed per order
    pub order_size_pct: f64,
    /// Fee rate applied to every fill notional
    pub fee_rate: f64,
    pub mode: TradingMode,
}

impl Default for OrderManagerConfig {
    fn default() -> Self {
        OrderManagerConfig {
            strategy_name: "Hybrid".to_string(),
            order_size_pct: 0.01,
            fee_rate: 0.001,
            mode: TradingMode::Paper,
        }
    }
}

/// Owns pending orders per symbol plus the previous-tick ATR% snapshots
pub struct OrderManager {
    config: OrderManagerConfig,
    pending: HashMap<Symbol, Vec<PendingOrder>>,
    prev_atr_pct: HashMap<Symbol, f64>,
    default_filters: SymbolFilters,
    log: SessionLog,
}

impl OrderManager {
    pub fn new(config: OrderManagerConfig, log: SessionLog) -> Self {
        OrderManager {
            config,
            pending: HashMap::new(),
            prev_atr_pct: HashMap::new(),
            default_filters: SymbolFilters::default(),
            log,
        }
    }

    pub fn pending_orders(&self, symbol: &Symbol) -> &[PendingOrder] {
        self.pending.get(symbol).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn pending_count(&self, symbol: &Symbol) -> usize {
        self.pending.get(symbol).map(Vec::len).unwrap_or(0)
    }

    pub fn session_log_mut(&mut self) -> &mut SessionLog {
        &mut self.log
    }

    /// Place the orders from a plan, honoring the gate state
    ///
    /// RUN places grid + DCA + TP (after a kill-replace grid cancellation if
    /// the plan demands one); DEGRADED places DCA + TP; PAUSED places
    /// nothing. Returns the number of orders that became pending.
    pub async fn place_plan(
        &mut self,
        symbol: &Symbol,
        plan: &Plan,
        equity: f64,
        exchange: Option<&dyn Exchange>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut placed = 0;

        match plan.pnl_gate_state {
            GateState::Run => {
                if plan.kill_replace {
                    self.cancel_grid(symbol, exchange, now).await;
                }
                placed += self
                    .place_orders(symbol, &plan.grid_orders, OrderKind::Grid, equity, exchange, now)
                    .await?;
                placed += self
                    .place_orders(symbol, &plan.dca_orders, OrderKind::Dca, equity, exchange, now)
                    .await?;
                placed += self
                    .place_orders(symbol, &plan.tp_orders, OrderKind::Tp, equity, exchange, now)
                    .await?;
            }
            GateState::Degraded => {
                placed += self
                    .place_orders(symbol, &plan.dca_orders, OrderKind::Dca, equity, exchange, now)
                    .await?;
                placed += self
                    .place_orders(symbol, &plan.tp_orders, OrderKind::Tp, equity, exchange, now)
                    .await?;
            }
            GateState::Paused => {}
        }

        Ok(placed)
    }

    async fn place_orders(
        &mut self,
        symbol: &Symbol,
        orders: &[PlanOrder],
        kind: OrderKind,
        equity: f64,
        exchange: Option<&dyn Exchange>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        if orders.is_empty() {
            return Ok(0);
        }

        let filters = exchange
            .map(|e| e.filters(symbol.as_str()))
            .unwrap_or(self.default_filters);

        let mut placed = 0;

        for order in orders {
            let price = filters.round_price(order.price);
            if price <= 0.0 {
                continue;
            }

            let raw_qty = order
                .qty
                .unwrap_or(equity * self.config.order_size_pct / price);
            let qty = filters.round_qty(raw_qty);

            if !filters.meets_min_notional(qty, price) {
                debug!(
                    symbol = %symbol,
                    qty,
                    price,
                    min_notional = filters.min_notional,
                    "Order below minimum notional, skipped"
                );
                self.log_order_event(symbol, order.side, price, qty, "", "REJECTED", &order.tag, "below min notional", now);
                continue;
            }

            let order_id = if self.config.mode.is_live() {
                let exchange = match exchange {
                    Some(e) => e,
                    None => anyhow::bail!("live mode requires an exchange adapter"),
                };
                match exchange
                    .create_limit_order(symbol.as_str(), order.side, qty, price)
                    .await
                {
                    Ok(ack) => ack.order_id,
                    Err(ExchangeError::Rejected(reason)) => {
                        warn!(symbol = %symbol, tag = %order.tag, %reason, "Order rejected");
                        self.log_order_event(symbol, order.side, price, qty, "", "REJECTED", &order.tag, &reason, now);
                        continue;
                    }
                    Err(e) => {
                        // Timed-out or failed placements are treated as
                        // rejections, never as possibly-open orders.
                        warn!(symbol = %symbol, tag = %order.tag, error = %e, "Order placement failed");
                        self.log_order_event(symbol, order.side, price, qty, "", "REJECTED", &order.tag, &e.to_string(), now);
                        continue;
                    }
                }
            } else {
                format!("sim-{}", next_local_order_id())
            };

            info!(
                symbol = %symbol,
                side = %order.side,
                qty,
                price,
                tag = %order.tag,
                order_id = %order_id,
                "Order placed"
            );
            self.log_order_event(symbol, order.side, price, qty, &order_id, "NEW", &order.tag, "", now);

            self.pending.entry(symbol.clone()).or_default().push(PendingOrder {
                symbol: symbol.clone(),
                side: order.side,
                price,
                qty,
                tag: order.tag.clone(),
                kind,
                order_id,
                timestamp: now,
                initial_rsi: None,
            });
            placed += 1;
        }

        Ok(placed)
    }

    /// Cancel every pending grid order for a symbol (kill-replace)
    pub async fn cancel_grid(
        &mut self,
        symbol: &Symbol,
        exchange: Option<&dyn Exchange>,
        now: DateTime<Utc>,
    ) -> usize {
        let mut orders = self.pending.remove(symbol).unwrap_or_default();
        let (grid, kept): (Vec<_>, Vec<_>) =
            orders.drain(..).partition(|o| o.tag.contains("grid"));
        self.pending.insert(symbol.clone(), kept);

        let cancelled = grid.len();
        for order in grid {
            self.cancel_order(&order, CancelReason::KillReplace, exchange, now)
                .await;
        }

        if cancelled > 0 {
            info!(symbol = %symbol, cancelled, "Grid orders cancelled for replacement");
        }
        cancelled
    }

    /// Cancel-stale sweep, run once per tick before fill reconciliation
    ///
    /// Criteria are evaluated in precedence order (age, price drift,
    /// volatility spike, RSI reversal) and the first match cancels. The
    /// ATR% snapshot is taken after the sweep regardless of outcomes so the
    /// spike criterion always compares against the previous tick.
    pub async fn sweep_stale(
        &mut self,
        symbol: &Symbol,
        policy: &HybridPolicy,
        current_price: f64,
        rsi: f64,
        atr_pct: f64,
        exchange: Option<&dyn Exchange>,
        now: DateTime<Utc>,
    ) -> usize {
        let prev_atr_pct = self.prev_atr_pct.get(symbol).copied();

        let mut orders = self.pending.remove(symbol).unwrap_or_default();
        let mut kept = Vec::with_capacity(orders.len());
        let mut cancelled = Vec::new();

        for mut order in orders.drain(..) {
            let reason = Self::stale_reason(
                &mut order,
                policy,
                current_price,
                rsi,
                atr_pct,
                prev_atr_pct,
                now,
            );
            match reason {
                Some(reason) => cancelled.push((order, reason)),
                None => kept.push(order),
            }
        }

        self.pending.insert(symbol.clone(), kept);

        let count = cancelled.len();
        for (order, reason) in cancelled {
            self.cancel_order(&order, reason, exchange, now).await;
        }

        // Snapshot for the next tick's spike comparison
        self.prev_atr_pct.insert(symbol.clone(), atr_pct);

        count
    }

    fn stale_reason(
        order: &mut PendingOrder,
        policy: &HybridPolicy,
        current_price: f64,
        rsi: f64,
        atr_pct: f64,
        prev_atr_pct: Option<f64>,
        now: DateTime<Utc>,
    ) -> Option<CancelReason> {
        // 1. Age
        let age_seconds = (now - order.timestamp).num_seconds();
        if age_seconds > policy.order_max_age_seconds {
            return Some(CancelReason::Age {
                age_seconds,
                max_seconds: policy.order_max_age_seconds,
            });
        }

        // 2. Price drift
        if order.price > 0.0 {
            let drift_pct = ((current_price - order.price) / order.price).abs() * 100.0;
            if drift_pct > policy.order_price_drift_threshold_pct {
                return Some(CancelReason::PriceDrift {
                    drift_pct,
                    threshold_pct: policy.order_price_drift_threshold_pct,
                });
            }
        }

        // 3. Volatility spike (grid orders only)
        if policy.order_cancel_on_volatility_spike && order.kind == OrderKind::Grid {
            if let Some(prev) = prev_atr_pct {
                let limit_pct = prev * policy.order_volatility_spike_threshold;
                if atr_pct > limit_pct {
                    return Some(CancelReason::VolatilitySpike { atr_pct, limit_pct });
                }
            }
        }

        // 4. RSI reversal; the first evaluation only records the baseline
        if policy.order_cancel_on_rsi_reversal {
            match order.initial_rsi {
                None => order.initial_rsi = Some(rsi),
                Some(initial_rsi) => {
                    let delta = (rsi - initial_rsi).abs();
                    let reversed = match order.side {
                        Side::Buy => initial_rsi < 40.0 && rsi > 60.0,
                        Side::Sell => initial_rsi > 60.0 && rsi < 40.0,
                    };
                    if reversed && delta > policy.order_rsi_reversal_threshold {
                        return Some(CancelReason::RsiReversal {
                            initial_rsi,
                            current_rsi: rsi,
                        });
                    }
                }
            }
        }

        None
    }

    async fn cancel_order(
        &mut self,
        order: &PendingOrder,
        reason: CancelReason,
        exchange: Option<&dyn Exchange>,
        now: DateTime<Utc>,
    ) {
        if self.config.mode.is_live() {
            if let Some(exchange) = exchange {
                if let Err(e) = exchange
                    .cancel_order(order.symbol.as_str(), &order.order_id)
                    .await
                {
                    warn!(
                        symbol = %order.symbol,
                        order_id = %order.order_id,
                        error = %e,
                        "Exchange cancel failed; order dropped from tracking"
                    );
                }
            }
        }

        info!(
            symbol = %order.symbol,
            order_id = %order.order_id,
            tag = %order.tag,
            reason = %reason,
            "Order cancelled"
        );
        let reason_str = reason.to_string();
        let symbol = order.symbol.clone();
        self.log_order_event(
            &symbol,
            order.side,
            order.price,
            order.qty,
            &order.order_id,
            "CANCELLED",
            &order.tag,
            &reason_str,
            now,
        );
    }

    /// Simulated fill reconciliation for paper and backtest modes
    ///
    /// A BUY fills when the probe low touches its price, a SELL when the
    /// probe high does; both fill at the order's limit price. Paper mode
    /// probes with the latest price on both sides, backtests with the bar's
    /// low/high.
    pub fn reconcile_fills_sim(
        &mut self,
        symbol: &Symbol,
        probe_low: f64,
        probe_high: f64,
        fill_time: DateTime<Utc>,
        portfolio: &mut Portfolio,
        engine: &mut HybridEngine,
    ) -> usize {
        let mut orders = self.pending.remove(symbol).unwrap_or_default();
        let (filled, kept): (Vec<_>, Vec<_>) = orders.drain(..).partition(|o| match o.side {
            Side::Buy => probe_low <= o.price,
            Side::Sell => probe_high >= o.price,
        });
        self.pending.insert(symbol.clone(), kept);

        let count = filled.len();
        for order in filled {
            self.apply_fill(&order, order.price, fill_time, portfolio, engine);
        }
        count
    }

    /// Live fill reconciliation: pending orders no longer open on the
    /// exchange are treated as filled at their limit price
    pub async fn reconcile_fills_live(
        &mut self,
        symbol: &Symbol,
        exchange: &dyn Exchange,
        fill_time: DateTime<Utc>,
        portfolio: &mut Portfolio,
        engine: &mut HybridEngine,
    ) -> Result<usize, ExchangeError> {
        let open_ids = exchange.get_open_orders(symbol.as_str()).await?;

        let mut orders = self.pending.remove(symbol).unwrap_or_default();
        let (filled, kept): (Vec<_>, Vec<_>) = orders
            .drain(..)
            .partition(|o| !open_ids.contains(&o.order_id));
        self.pending.insert(symbol.clone(), kept);

        let count = filled.len();
        for order in filled {
            self.apply_fill(&order, order.price, fill_time, portfolio, engine);
        }
        Ok(count)
    }

    // Fees for a round trip are settled on the closing fill (entry and exit
    // notional together), so realized net PnL carries the full cost and the
    // cash/trade-history accounting stays exact while a position is open.
    fn apply_fill(
        &mut self,
        order: &PendingOrder,
        fill_price: f64,
        fill_time: DateTime<Utc>,
        portfolio: &mut Portfolio,
        engine: &mut HybridEngine,
    ) {
        let strategy = self.config.strategy_name.clone();

        match order.side {
            Side::Buy => {
                if !portfolio.apply_buy_fill(&order.symbol, order.qty, fill_price, &strategy, fill_time) {
                    warn!(
                        symbol = %order.symbol,
                        tag = %order.tag,
                        "BUY fill could not be applied, dropping order"
                    );
                    let symbol = order.symbol.clone();
                    self.log_order_event(
                        &symbol,
                        order.side,
                        fill_price,
                        order.qty,
                        &order.order_id,
                        "REJECTED",
                        &order.tag,
                        "insufficient cash at fill",
                        fill_time,
                    );
                    return;
                }

                if order.tag.starts_with("dca") {
                    engine.notify_dca_fill(fill_price);
                }

                info!(
                    symbol = %order.symbol,
                    qty = order.qty,
                    price = fill_price,
                    tag = %order.tag,
                    "BUY filled"
                );
                self.log_fill_event(order, fill_price, 0.0, 0.0, 0.0, "OPEN", fill_time);
            }
            Side::Sell => {
                let (entry_price, held_qty) =
                    match portfolio.get_position(&order.symbol, &strategy) {
                        Some(p) => (p.entry_price, p.quantity),
                        None => {
                            debug!(
                                symbol = %order.symbol,
                                tag = %order.tag,
                                "SELL fill with no open position, dropped"
                            );
                            return;
                        }
                    };

                let closed_qty = order.qty.min(held_qty);
                let fee = self.config.fee_rate * closed_qty * (entry_price + fill_price);
                let pnl_gross = match portfolio.close_position(
                    &order.symbol,
                    &strategy,
                    fill_price,
                    Some(order.qty),
                    fee,
                    &order.tag,
                    fill_time,
                ) {
                    Some(pnl) => pnl,
                    None => return,
                };
                let pnl_net = pnl_gross - fee;
                let cost_basis = entry_price * closed_qty;
                let pnl_pct = if cost_basis > 0.0 {
                    pnl_net / cost_basis * 100.0
                } else {
                    0.0
                };

                info!(
                    symbol = %order.symbol,
                    qty = closed_qty,
                    price = fill_price,
                    pnl_net,
                    tag = %order.tag,
                    "SELL filled"
                );
                self.log_fill_event(order, fill_price, fee, pnl_net, pnl_pct, "CLOSE", fill_time);
            }
        }
    }

    /// Close every open position for a symbol at the given price
    ///
    /// Used when a hard stop fires and at shutdown. Returns realized net PnL.
    pub fn close_symbol_positions(
        &mut self,
        symbol: &Symbol,
        price: f64,
        tag: &str,
        portfolio: &mut Portfolio,
        now: DateTime<Utc>,
    ) -> f64 {
        let strategy = self.config.strategy_name.clone();
        let (entry_price, qty) = match portfolio.get_position(symbol, &strategy) {
            Some(p) => (p.entry_price, p.quantity),
            None => return 0.0,
        };

        let fee = self.config.fee_rate * qty * (entry_price + price);
        let pnl_gross = match portfolio.close_position(symbol, &strategy, price, None, fee, tag, now)
        {
            Some(pnl) => pnl,
            None => return 0.0,
        };
        let pnl_net = pnl_gross - fee;
        let cost_basis = entry_price * qty;
        let pnl_pct = if cost_basis > 0.0 {
            pnl_net / cost_basis * 100.0
        } else {
            0.0
        };

        let synthetic = PendingOrder {
            symbol: symbol.clone(),
            side: Side::Sell,
            price,
            qty,
            tag: tag.to_string(),
            kind: OrderKind::Sl,
            order_id: format!("sim-{}", next_local_order_id()),
            timestamp: now,
            initial_rsi: None,
        };
        self.log_fill_event(&synthetic, price, fee, pnl_net, pnl_pct, "CLOSE", now);

        pnl_net
    }

    #[allow(clippy::too_many_arguments)]
    fn log_order_event(
        &mut self,
        symbol: &Symbol,
        side: Side,
        price: f64,
        qty: f64,
        order_id: &str,
        status: &str,
        tag: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) {
        let action = match side {
            Side::Buy => "OPEN",
            Side::Sell => "CLOSE",
        };
        let strategy = self.config.strategy_name.clone();
        self.log.log_order(&OrderLogEntry {
            timestamp: now,
            symbol: symbol.as_str(),
            order_id,
            client_order_id: "",
            order_type: side,
            side: PositionSide::Long,
            action,
            price,
            quantity: qty,
            status,
            strategy: &strategy,
            tag,
            reason,
        });
    }

    fn log_fill_event(
        &mut self,
        order: &PendingOrder,
        fill_price: f64,
        fee: f64,
        pnl: f64,
        pnl_pct: f64,
        action: &str,
        now: DateTime<Utc>,
    ) {
        let strategy = self.config.strategy_name.clone();
        self.log.log_fill(&FillLogEntry {
            order: OrderLogEntry {
                timestamp: now,
                symbol: order.symbol.as_str(),
                order_id: &order.order_id,
                client_order_id: "",
                order_type: order.side,
                side: PositionSide::Long,
                action,
                price: fill_price,
                quantity: order.qty,
                status: "FILLED",
                strategy: &strategy,
                tag: &order.tag,
                reason: "",
            },
            fee,
            fee_asset: "USDT",
            pnl,
            pnl_pct,
        });
    }
}
