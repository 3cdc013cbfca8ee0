//! Portfolio accounting: cash, strategy-scoped positions, realized trades
//!
//! Positions are keyed by `(symbol, strategy)` and there is at most one
//! position per key. Closing appends to an append-only trade history and
//! feeds the daily/weekly PnL counters, which roll over on calendar date
//! and ISO week changes.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::{PositionSide, Symbol, TradeRecord};

/// Key for the position map: one position per (symbol, strategy) pair
pub type PositionKey = (Symbol, String);

/// An open position owned by the portfolio
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub strategy: String,
    pub entry_time: DateTime<Utc>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

impl Position {
    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        match self.side {
            PositionSide::Long => (current_price - self.entry_price) * self.quantity,
            PositionSide::Short => (self.entry_price - current_price) * self.quantity,
        }
    }

    pub fn cost(&self) -> f64 {
        self.entry_price * self.quantity
    }
}

/// Snapshot of portfolio-level statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortfolioStats {
    pub initial_capital: f64,
    pub cash: f64,
    pub total_pnl: f64,
    pub daily_pnl: f64,
    pub weekly_pnl: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub open_positions: usize,
}

/// Portfolio manager for tracking positions and capital
#[derive(Debug, Clone)]
pub struct Portfolio {
    pub initial_capital: f64,
    pub cash: f64,
    positions: HashMap<PositionKey, Position>,
    pub trade_history: Vec<TradeRecord>,
    pub daily_pnl: f64,
    pub weekly_pnl: f64,
    last_daily_reset: NaiveDate,
    last_weekly_reset: u32,
    total_trades: usize,
    winning_trades: usize,
    losing_trades: usize,
    total_pnl: f64,
}

impl Portfolio {
    /// Create a portfolio; `now` anchors the daily/weekly reset calendar
    pub fn new(initial_capital: f64, now: DateTime<Utc>) -> Self {
        Portfolio {
            initial_capital,
            cash: initial_capital,
            positions: HashMap::new(),
            trade_history: Vec::new(),
            daily_pnl: 0.0,
            weekly_pnl: 0.0,
            last_daily_reset: now.date_naive(),
            last_weekly_reset: now.iso_week().week(),
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            total_pnl: 0.0,
        }
    }

    /// Open a new position
    ///
    /// Fails (returns false) when the cost exceeds available cash or a
    /// position already exists for this (symbol, strategy) key.
    pub fn open_position(
        &mut self,
        symbol: &Symbol,
        side: PositionSide,
        quantity: f64,
        entry_price: f64,
        strategy: &str,
        entry_time: DateTime<Utc>,
    ) -> bool {
        let position_cost = entry_price * quantity;

        if position_cost > self.cash {
            warn!(
                symbol = %symbol,
                required = position_cost,
                available = self.cash,
                "Insufficient cash to open position"
            );
            return false;
        }

        let key = (symbol.clone(), strategy.to_string());
        if self.positions.contains_key(&key) {
            warn!(symbol = %symbol, strategy, "Position already exists for key");
            return false;
        }

        self.positions.insert(
            key,
            Position {
                symbol: symbol.clone(),
                side,
                quantity,
                entry_price,
                strategy: strategy.to_string(),
                entry_time,
                stop_loss: None,
                take_profit: None,
            },
        );
        self.cash -= position_cost;

        info!(
            symbol = %symbol,
            side = %side,
            quantity,
            price = entry_price,
            strategy,
            cost = position_cost,
            "Opened position"
        );
        true
    }

    /// Apply a BUY fill: open a new LONG or average up the existing one
    ///
    /// Averaging up keeps the single-position-per-key invariant; the entry
    /// price becomes the quantity-weighted average of all buys.
    pub fn apply_buy_fill(
        &mut self,
        symbol: &Symbol,
        quantity: f64,
        price: f64,
        strategy: &str,
        fill_time: DateTime<Utc>,
    ) -> bool {
        let key = (symbol.clone(), strategy.to_string());

        if let Some(position) = self.positions.get_mut(&key) {
            if position.side != PositionSide::Long {
                warn!(symbol = %symbol, strategy, "BUY fill against non-LONG position ignored");
                return false;
            }

            let cost = price * quantity;
            if cost > self.cash {
                warn!(
                    symbol = %symbol,
                    required = cost,
                    available = self.cash,
                    "Insufficient cash to average up"
                );
                return false;
            }

            let total_qty = position.quantity + quantity;
            position.entry_price =
                (position.quantity * position.entry_price + quantity * price) / total_qty;
            position.quantity = total_qty;
            self.cash -= cost;

            debug!(
                symbol = %symbol,
                quantity,
                price,
                avg_entry = position.entry_price,
                total_qty,
                "Averaged up position"
            );
            true
        } else {
            self.open_position(symbol, PositionSide::Long, quantity, price, strategy, fill_time)
        }
    }

    /// Close a position fully or partially
    ///
    /// `quantity = None` (or a quantity exceeding the position) closes fully.
    /// Cash is credited with the exit notional minus `fee`; a trade record
    /// with gross/net PnL is appended. Returns the gross PnL.
    #[allow(clippy::too_many_arguments)]
    pub fn close_position(
        &mut self,
        symbol: &Symbol,
        strategy: &str,
        exit_price: f64,
        quantity: Option<f64>,
        fee: f64,
        tag: &str,
        timestamp: DateTime<Utc>,
    ) -> Option<f64> {
        let key = (symbol.clone(), strategy.to_string());

        let position = match self.positions.get_mut(&key) {
            Some(p) => p,
            None => {
                warn!(symbol = %symbol, strategy, "Position not found for close");
                return None;
            }
        };

        let mut close_qty = quantity.unwrap_or(position.quantity);
        if close_qty > position.quantity {
            warn!(
                symbol = %symbol,
                requested = close_qty,
                held = position.quantity,
                "Close quantity exceeds position size, closing fully"
            );
            close_qty = position.quantity;
        }

        let pnl_gross = match position.side {
            PositionSide::Long => (exit_price - position.entry_price) * close_qty,
            PositionSide::Short => (position.entry_price - exit_price) * close_qty,
        };
        let pnl_net = pnl_gross - fee;

        let record = TradeRecord {
            timestamp,
            symbol: symbol.clone(),
            strategy: strategy.to_string(),
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            quantity: close_qty,
            pnl_gross,
            fee,
            pnl_net,
            tag: tag.to_string(),
        };

        self.cash += exit_price * close_qty - fee;

        if close_qty >= position.quantity {
            self.positions.remove(&key);
            info!(symbol = %symbol, strategy, "Fully closed position");
        } else {
            position.quantity -= close_qty;
            info!(
                symbol = %symbol,
                strategy,
                closed = close_qty,
                remaining = position.quantity,
                "Partially closed position"
            );
        }

        self.total_trades += 1;
        self.total_pnl += pnl_net;
        self.daily_pnl += pnl_net;
        self.weekly_pnl += pnl_net;
        if pnl_net > 0.0 {
            self.winning_trades += 1;
        } else {
            self.losing_trades += 1;
        }

        info!(
            symbol = %symbol,
            pnl_gross,
            fee,
            pnl_net,
            tag,
            "Trade closed"
        );
        self.trade_history.push(record);

        Some(pnl_gross)
    }

    /// Restore cash and open positions from a persisted checkpoint
    ///
    /// Positions re-enter the map as-is; cash is not debited again.
    pub fn restore(&mut self, cash: f64, positions: Vec<Position>) {
        self.cash = cash;
        for position in positions {
            let key = (position.symbol.clone(), position.strategy.clone());
            self.positions.insert(key, position);
        }
    }

    pub fn get_position(&self, symbol: &Symbol, strategy: &str) -> Option<&Position> {
        self.positions.get(&(symbol.clone(), strategy.to_string()))
    }

    pub fn get_position_mut(&mut self, symbol: &Symbol, strategy: &str) -> Option<&mut Position> {
        self.positions
            .get_mut(&(symbol.clone(), strategy.to_string()))
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn positions_for_symbol<'a>(
        &'a self,
        symbol: &'a Symbol,
    ) -> impl Iterator<Item = &'a Position> {
        self.positions.values().filter(move |p| &p.symbol == symbol)
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.len()
    }

    /// Mark-to-market equity
    ///
    /// cash + Σ long qty·price + Σ short qty·(2·entry − price). Positions
    /// without a quoted price are valued at entry.
    pub fn equity(&self, prices: &HashMap<Symbol, f64>) -> f64 {
        let mut equity = self.cash;

        for position in self.positions.values() {
            let price = prices
                .get(&position.symbol)
                .copied()
                .unwrap_or(position.entry_price);
            equity += match position.side {
                PositionSide::Long => position.quantity * price,
                PositionSide::Short => position.quantity * (2.0 * position.entry_price - price),
            };
        }

        equity
    }

    /// Reset the daily PnL counter when the calendar date advances
    pub fn reset_daily_stats(&mut self, now: DateTime<Utc>) {
        let current_date = now.date_naive();
        if current_date > self.last_daily_reset {
            self.daily_pnl = 0.0;
            self.last_daily_reset = current_date;
            info!(date = %current_date, "Daily statistics reset");
        }
    }

    /// Reset the weekly PnL counter when the ISO week changes
    pub fn reset_weekly_stats(&mut self, now: DateTime<Utc>) {
        let current_week = now.iso_week().week();
        if current_week != self.last_weekly_reset {
            self.weekly_pnl = 0.0;
            self.last_weekly_reset = current_week;
            info!(iso_week = current_week, "Weekly statistics reset");
        }
    }

    pub fn stats(&self) -> PortfolioStats {
        let win_rate = if self.total_trades > 0 {
            (self.winning_trades as f64 / self.total_trades as f64) * 100.0
        } else {
            0.0
        };

        let wins: Vec<f64> = self
            .trade_history
            .iter()
            .filter(|t| t.pnl_net > 0.0)
            .map(|t| t.pnl_net)
            .collect();
        let losses: Vec<f64> = self
            .trade_history
            .iter()
            .filter(|t| t.pnl_net < 0.0)
            .map(|t| t.pnl_net)
            .collect();

        let avg_win = if wins.is_empty() {
            0.0
        } else {
            wins.iter().sum::<f64>() / wins.len() as f64
        };
        let avg_loss = if losses.is_empty() {
            0.0
        } else {
            losses.iter().sum::<f64>() / losses.len() as f64
        };

        PortfolioStats {
            initial_capital: self.initial_capital,
            cash: self.cash,
            total_pnl: self.total_pnl,
            daily_pnl: self.daily_pnl,
            weekly_pnl: self.weekly_pnl,
            total_trades: self.total_trades,
            winning_trades: self.winning_trades,
            losing_trades: self.losing_trades,
            win_rate,
            avg_win,
            avg_loss,
            open_positions: self.positions.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sym() -> Symbol {
        Symbol::new("BTCUSDT")
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_open_close_round_trip_restores_cash() {
        let mut pf = Portfolio::new(10_000.0, t0());

        assert!(pf.open_position(&sym(), PositionSide::Long, 1.0, 100.0, "Hybrid", t0()));
        assert!((pf.cash - 9_900.0).abs() < 1e-9);

        let pnl = pf
            .close_position(&sym(), "Hybrid", 100.0, None, 0.0, "test", t0())
            .unwrap();

        assert!((pnl - 0.0).abs() < 1e-9);
        assert!((pf.cash - 10_000.0).abs() < 1e-9);
        assert_eq!(pf.trade_history.len(), 1);
        assert!((pf.trade_history[0].pnl_net - 0.0).abs() < 1e-9);
        assert!(pf.get_position(&sym(), "Hybrid").is_none());
    }

    #[test]
    fn test_insufficient_cash_rejected() {
        let mut pf = Portfolio::new(50.0, t0());
        assert!(!pf.open_position(&sym(), PositionSide::Long, 1.0, 100.0, "Hybrid", t0()));
        assert!((pf.cash - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_double_open_rejected() {
        let mut pf = Portfolio::new(10_000.0, t0());
        assert!(pf.open_position(&sym(), PositionSide::Long, 1.0, 100.0, "Hybrid", t0()));
        assert!(!pf.open_position(&sym(), PositionSide::Long, 1.0, 100.0, "Hybrid", t0()));
        assert_eq!(pf.open_position_count(), 1);
    }

    #[test]
    fn test_same_symbol_different_strategy_keys() {
        let mut pf = Portfolio::new(10_000.0, t0());
        assert!(pf.open_position(&sym(), PositionSide::Long, 1.0, 100.0, "Hybrid", t0()));
        assert!(pf.open_position(&sym(), PositionSide::Long, 1.0, 100.0, "Other", t0()));
        assert_eq!(pf.open_position_count(), 2);
    }

    #[test]
    fn test_buy_fill_averages_up() {
        let mut pf = Portfolio::new(10_000.0, t0());

        assert!(pf.apply_buy_fill(&sym(), 1.0, 100.0, "Hybrid", t0()));
        assert!(pf.apply_buy_fill(&sym(), 1.0, 110.0, "Hybrid", t0()));

        let pos = pf.get_position(&sym(), "Hybrid").unwrap();
        assert!((pos.quantity - 2.0).abs() < 1e-9);
        assert!((pos.entry_price - 105.0).abs() < 1e-9);
        assert!((pf.cash - 9_790.0).abs() < 1e-9);
    }

    #[test]
    fn test_partial_close() {
        let mut pf = Portfolio::new(10_000.0, t0());
        assert!(pf.open_position(&sym(), PositionSide::Long, 2.0, 100.0, "Hybrid", t0()));

        let pnl = pf
            .close_position(&sym(), "Hybrid", 110.0, Some(1.0), 0.0, "tp", t0())
            .unwrap();

        assert!((pnl - 10.0).abs() < 1e-9);
        let pos = pf.get_position(&sym(), "Hybrid").unwrap();
        assert!((pos.quantity - 1.0).abs() < 1e-9);
        // Entry price unchanged on partial close
        assert!((pos.entry_price - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_close_qty_clamped_to_position() {
        let mut pf = Portfolio::new(10_000.0, t0());
        assert!(pf.open_position(&sym(), PositionSide::Long, 1.0, 100.0, "Hybrid", t0()));

        let pnl = pf
            .close_position(&sym(), "Hybrid", 105.0, Some(5.0), 0.0, "tp", t0())
            .unwrap();

        assert!((pnl - 5.0).abs() < 1e-9);
        assert!(pf.get_position(&sym(), "Hybrid").is_none());
    }

    #[test]
    fn test_fee_reduces_net_pnl_and_cash() {
        let mut pf = Portfolio::new(10_000.0, t0());
        assert!(pf.open_position(&sym(), PositionSide::Long, 1.0, 100.0, "Hybrid", t0()));

        pf.close_position(&sym(), "Hybrid", 110.0, None, 0.11, "tp", t0());

        let trade = &pf.trade_history[0];
        assert!((trade.pnl_gross - 10.0).abs() < 1e-9);
        assert!((trade.pnl_net - 9.89).abs() < 1e-9);
        assert!((pf.cash - 10_009.89).abs() < 1e-9);
    }

    #[test]
    fn test_equity_formula() {
        let mut pf = Portfolio::new(10_000.0, t0());
        assert!(pf.open_position(&sym(), PositionSide::Long, 2.0, 100.0, "Hybrid", t0()));

        let mut prices = HashMap::new();
        prices.insert(sym(), 105.0);

        // 9800 cash + 2 * 105
        assert!((pf.equity(&prices) - 10_010.0).abs() < 1e-9);
    }

    #[test]
    fn test_equity_short_representation() {
        let mut pf = Portfolio::new(10_000.0, t0());
        assert!(pf.open_position(&sym(), PositionSide::Short, 1.0, 100.0, "Hybrid", t0()));

        let mut prices = HashMap::new();
        prices.insert(sym(), 90.0);

        // 9900 cash + 1 * (200 - 90): short gains as price falls
        assert!((pf.equity(&prices) - 10_010.0).abs() < 1e-9);
    }

    #[test]
    fn test_daily_rollover() {
        let mut pf = Portfolio::new(10_000.0, t0());
        pf.open_position(&sym(), PositionSide::Long, 1.0, 100.0, "Hybrid", t0());
        pf.close_position(&sym(), "Hybrid", 110.0, None, 0.0, "tp", t0());
        assert!((pf.daily_pnl - 10.0).abs() < 1e-9);

        // Same day: no reset
        pf.reset_daily_stats(t0());
        assert!((pf.daily_pnl - 10.0).abs() < 1e-9);

        // Next day: reset
        pf.reset_daily_stats(t0() + chrono::Duration::days(1));
        assert!((pf.daily_pnl - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_weekly_rollover() {
        let mut pf = Portfolio::new(10_000.0, t0());
        pf.open_position(&sym(), PositionSide::Long, 1.0, 100.0, "Hybrid", t0());
        pf.close_position(&sym(), "Hybrid", 110.0, None, 0.0, "tp", t0());

        pf.reset_weekly_stats(t0() + chrono::Duration::days(2));
        assert!((pf.weekly_pnl - 10.0).abs() < 1e-9);

        pf.reset_weekly_stats(t0() + chrono::Duration::days(7));
        assert!((pf.weekly_pnl - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_trade_history_reconciles_with_cash() {
        let mut pf = Portfolio::new(10_000.0, t0());
        pf.apply_buy_fill(&sym(), 1.0, 100.0, "Hybrid", t0());
        pf.apply_buy_fill(&sym(), 1.0, 90.0, "Hybrid", t0());
        pf.close_position(&sym(), "Hybrid", 105.0, Some(1.5), 0.0, "tp", t0());

        let net_sum: f64 = pf.trade_history.iter().map(|t| t.pnl_net).sum();
        let open_cost: f64 = pf.positions().map(|p| p.cost()).sum();

        // cash - initial + open-position cost == realized net PnL
        assert!((pf.cash - pf.initial_capital + open_cost - net_sum).abs() < 1e-6);
    }

    #[test]
    fn test_stats_counts() {
        let mut pf = Portfolio::new(10_000.0, t0());
        pf.open_position(&sym(), PositionSide::Long, 1.0, 100.0, "Hybrid", t0());
        pf.close_position(&sym(), "Hybrid", 110.0, None, 0.0, "tp", t0());
        pf.open_position(&sym(), PositionSide::Long, 1.0, 100.0, "Hybrid", t0());
        pf.close_position(&sym(), "Hybrid", 95.0, None, 0.0, "sl", t0());

        let stats = pf.stats();
        assert_eq!(stats.total_trades, 2);
        assert_eq!(stats.winning_trades, 1);
        assert_eq!(stats.losing_trades, 1);
        assert!((stats.win_rate - 50.0).abs() < 1e-9);
        assert!((stats.avg_win - 10.0).abs() < 1e-9);
        assert!((stats.avg_loss + 5.0).abs() < 1e-9);
    }
}
