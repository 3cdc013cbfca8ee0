//! Bar-driven backtester for the hybrid engine
//!
//! Replays a candle file through the engine + gate + order manager +
//! portfolio chain with OHLC-crossing fills: a BUY fills when the bar's low
//! touches its limit, a SELL when the bar's high does, both at the limit
//! price. Deterministic end to end for a given candle stream.

use anyhow::Result;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use statrs::statistics::Statistics;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

use crate::data;
use crate::indicators::{self, IndicatorBundle, IndicatorConfig};
use crate::oms::{OrderManager, OrderManagerConfig};
use crate::portfolio::Portfolio;
use crate::session_log::SessionLog;
use crate::strategy::hybrid::{Band, GateState, HybridEngine, HybridPolicy};
use crate::{Candle, Symbol, TradeRecord, TradingMode};

/// Indicator lookback window per bar; keeps the replay O(n·k) instead of O(n²)
const MAX_LOOKBACK: usize = 300;

/// Period for the report's ADX trend gauge
const ADX_PERIOD: usize = 14;

/// Per-bar gate/plan snapshot for the state-distribution report
#[derive(Debug, Clone)]
pub struct StateRecord {
    pub timestamp: DateTime<Utc>,
    pub gate_state: GateState,
    pub band: Band,
    pub spread_pct: f64,
    pub grid_orders: usize,
    pub dca_orders: usize,
    pub tp_orders: usize,
}

/// Summary statistics of a backtest run
#[derive(Debug, Clone, Default)]
pub struct BacktestMetrics {
    pub total_return_pct: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown_pct: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub total_fees: f64,
    pub hard_stops: usize,
    /// Average ADX over the replayed range (trend gauge)
    pub avg_adx: f64,
}

/// Full backtest output
#[derive(Debug, Default)]
pub struct BacktestResult {
    pub initial_capital: f64,
    pub final_equity: f64,
    pub trades: Vec<TradeRecord>,
    pub equity_curve: Vec<(DateTime<Utc>, f64)>,
    pub state_history: Vec<StateRecord>,
    pub metrics: BacktestMetrics,
}

impl BacktestResult {
    /// Gate-state distribution as (state, bar count), most frequent first
    pub fn state_distribution(&self) -> Vec<(String, usize)> {
        self.state_history
            .iter()
            .map(|r| r.gate_state.to_string())
            .counts()
            .into_iter()
            .sorted_by(|a, b| b.1.cmp(&a.1))
            .collect()
    }
}

/// Backtest engine for a single symbol
pub struct Backtester {
    symbol: Symbol,
    policy: HybridPolicy,
    indicator_config: IndicatorConfig,
    engine: HybridEngine,
    portfolio: Portfolio,
    order_manager: OrderManager,
    hard_stops: usize,
}

impl Backtester {
    pub fn new(
        symbol: Symbol,
        policy: HybridPolicy,
        initial_capital: f64,
        order_size_pct: f64,
        fee_rate: f64,
        start_time: DateTime<Utc>,
    ) -> Self {
        let engine = HybridEngine::new(symbol.clone(), policy.clone());
        let portfolio = Portfolio::new(initial_capital, start_time);
        let order_manager = OrderManager::new(
            OrderManagerConfig {
                strategy_name: "Hybrid".to_string(),
                order_size_pct,
                fee_rate,
                mode: TradingMode::Backtest,
            },
            SessionLog::sink(TradingMode::Backtest),
        );

        Backtester {
            symbol,
            policy,
            indicator_config: IndicatorConfig::default(),
            engine,
            portfolio,
            order_manager,
            hard_stops: 0,
        }
    }

    /// Replay the candle stream
    pub async fn run(&mut self, candles: &[Candle]) -> Result<BacktestResult> {
        let validation = data::validate_candles(candles);
        if !validation.is_valid() {
            anyhow::bail!("Invalid candle data: {}", validation.errors.join("; "));
        }
        for warning in &validation.warnings {
            warn!("{}", warning);
        }

        let warmup = self.indicator_config.warmup_bars;
        if candles.len() <= warmup {
            anyhow::bail!(
                "Not enough candles: {} provided, {} needed for warmup",
                candles.len(),
                warmup
            );
        }

        info!(
            symbol = %self.symbol,
            bars = candles.len(),
            capital = self.portfolio.initial_capital,
            "Starting backtest"
        );

        let mut equity_curve = Vec::with_capacity(candles.len() - warmup);
        let mut state_history = Vec::with_capacity(candles.len() - warmup);
        let mut prices = HashMap::new();

        for i in warmup..candles.len() {
            let start_idx = i.saturating_sub(MAX_LOOKBACK - 1);
            let window = &candles[start_idx..=i];
            let bar = &candles[i];

            let bundle = match IndicatorBundle::compute(window, &self.indicator_config) {
                Some(b) => b,
                None => continue,
            };

            // Calendar rollovers use the candle's own clock
            self.portfolio.reset_daily_stats(bar.datetime);
            self.portfolio.reset_weekly_stats(bar.datetime);

            prices.insert(self.symbol.clone(), bar.close);
            let equity = self.portfolio.equity(&prices);

            let plan = self.engine.on_bar(bar, &bundle, equity);

            if plan.sl_action.stop {
                let was_open = self.portfolio.get_position(&self.symbol, "Hybrid").is_some();
                self.order_manager.close_symbol_positions(
                    &self.symbol,
                    bar.close,
                    "hard_stop",
                    &mut self.portfolio,
                    bar.datetime,
                );
                if was_open {
                    self.hard_stops += 1;
                }
            } else {
                self.order_manager
                    .place_plan(&self.symbol, &plan, equity, None, bar.datetime)
                    .await?;
            }

            self.order_manager
                .sweep_stale(
                    &self.symbol,
                    &self.policy,
                    bar.close,
                    bundle.rsi,
                    bundle.atr_pct,
                    None,
                    bar.datetime,
                )
                .await;

            self.order_manager.reconcile_fills_sim(
                &self.symbol,
                bar.low,
                bar.high,
                bar.datetime,
                &mut self.portfolio,
                &mut self.engine,
            );

            let equity_after = self.portfolio.equity(&prices);
            equity_curve.push((bar.datetime, equity_after));
            state_history.push(StateRecord {
                timestamp: bar.datetime,
                gate_state: plan.pnl_gate_state,
                band: plan.band,
                spread_pct: plan.spread_pct,
                grid_orders: plan.grid_orders.len(),
                dca_orders: plan.dca_orders.len(),
                tp_orders: plan.tp_orders.len(),
            });

            if i % 1000 == 0 {
                info!(
                    bar = i,
                    total = candles.len(),
                    price = bar.close,
                    equity = format!("{:.2}", equity_after),
                    state = %plan.pnl_gate_state,
                    "Backtest progress"
                );
            }
        }

        let final_equity = equity_curve
            .last()
            .map(|(_, e)| *e)
            .unwrap_or(self.portfolio.initial_capital);

        // Trend gauge over the replayed range
        let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
        let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let adx_values = indicators::adx(&highs, &lows, &closes, ADX_PERIOD);
        let adx_samples: Vec<f64> = adx_values[warmup..].iter().filter_map(|v| *v).collect();
        let avg_adx = if adx_samples.is_empty() {
            0.0
        } else {
            adx_samples.iter().sum::<f64>() / adx_samples.len() as f64
        };

        let metrics = compute_metrics(
            self.portfolio.initial_capital,
            final_equity,
            &self.portfolio.trade_history,
            &equity_curve,
            self.hard_stops,
            avg_adx,
        );

        info!(
            symbol = %self.symbol,
            final_equity = format!("{:.2}", final_equity),
            total_return = format!("{:.2}%", metrics.total_return_pct),
            trades = metrics.total_trades,
            "Backtest completed"
        );

        Ok(BacktestResult {
            initial_capital: self.portfolio.initial_capital,
            final_equity,
            trades: self.portfolio.trade_history.clone(),
            equity_curve,
            state_history,
            metrics,
        })
    }
}

fn compute_metrics(
    initial_capital: f64,
    final_equity: f64,
    trades: &[TradeRecord],
    equity_curve: &[(DateTime<Utc>, f64)],
    hard_stops: usize,
    avg_adx: f64,
) -> BacktestMetrics {
    let total_return_pct = if initial_capital > 0.0 {
        (final_equity - initial_capital) / initial_capital * 100.0
    } else {
        0.0
    };

    let winning: Vec<&TradeRecord> = trades.iter().filter(|t| t.pnl_net > 0.0).collect();
    let losing: Vec<&TradeRecord> = trades.iter().filter(|t| t.pnl_net < 0.0).collect();

    let win_rate = if trades.is_empty() {
        0.0
    } else {
        winning.len() as f64 / trades.len() as f64 * 100.0
    };

    let gross_wins: f64 = winning.iter().map(|t| t.pnl_net).sum();
    let gross_losses: f64 = losing.iter().map(|t| t.pnl_net.abs()).sum();
    let profit_factor = if gross_losses > 0.0 {
        gross_wins / gross_losses
    } else {
        0.0
    };

    let avg_win = if winning.is_empty() {
        0.0
    } else {
        gross_wins / winning.len() as f64
    };
    let avg_loss = if losing.is_empty() {
        0.0
    } else {
        -gross_losses / losing.len() as f64
    };

    // Max drawdown over the equity curve
    let mut peak = initial_capital;
    let mut max_dd = 0.0_f64;
    for (_, equity) in equity_curve {
        if *equity > peak {
            peak = *equity;
        }
        let dd = (peak - equity) / peak;
        if dd > max_dd {
            max_dd = dd;
        }
    }

    // Sharpe on bar returns; volatility from active (non-flat) bars only,
    // since cash bars would understate the risk actually taken.
    const BARS_PER_YEAR: f64 = 365.0 * 24.0 * 60.0;
    let all_returns: Vec<f64> = equity_curve
        .windows(2)
        .map(|w| {
            if w[0].1 > 0.0 {
                (w[1].1 - w[0].1) / w[0].1
            } else {
                0.0
            }
        })
        .collect();
    let active_returns: Vec<f64> = all_returns.iter().filter(|r| **r != 0.0).copied().collect();

    let sharpe_ratio = if active_returns.len() > 1 && !all_returns.is_empty() {
        let mean_return = all_returns.iter().mean();
        let std_dev = active_returns.iter().std_dev();
        if std_dev > 0.0 {
            mean_return / std_dev * BARS_PER_YEAR.sqrt()
        } else {
            0.0
        }
    } else {
        0.0
    };

    BacktestMetrics {
        total_return_pct,
        sharpe_ratio,
        max_drawdown_pct: max_dd * 100.0,
        win_rate,
        profit_factor,
        total_trades: trades.len(),
        winning_trades: winning.len(),
        losing_trades: losing.len(),
        avg_win,
        avg_loss,
        total_fees: trades.iter().map(|t| t.fee).sum(),
        hard_stops,
        avg_adx,
    }
}

/// Write the equity curve, trades, and state history next to `output_dir`
pub fn export_result(result: &BacktestResult, output_dir: impl AsRef<Path>, stamp: &str) -> Result<()> {
    let output_dir = output_dir.as_ref();
    std::fs::create_dir_all(output_dir)?;

    let equity_path = output_dir.join(format!("backtest_equity_{}.csv", stamp));
    let mut writer = csv::Writer::from_path(&equity_path)?;
    writer.write_record(["timestamp", "equity"])?;
    for (ts, equity) in &result.equity_curve {
        writer.write_record([ts.to_rfc3339(), format!("{:.2}", equity)])?;
    }
    writer.flush()?;

    let trades_path = output_dir.join(format!("backtest_trades_{}.csv", stamp));
    let mut writer = csv::Writer::from_path(&trades_path)?;
    writer.write_record([
        "timestamp",
        "symbol",
        "strategy",
        "side",
        "entry_price",
        "exit_price",
        "quantity",
        "pnl_gross",
        "fee",
        "pnl_net",
        "tag",
    ])?;
    for trade in &result.trades {
        writer.write_record([
            trade.timestamp.to_rfc3339(),
            trade.symbol.to_string(),
            trade.strategy.clone(),
            trade.side.to_string(),
            format!("{:.8}", trade.entry_price),
            format!("{:.8}", trade.exit_price),
            format!("{:.8}", trade.quantity),
            format!("{:.8}", trade.pnl_gross),
            format!("{:.8}", trade.fee),
            format!("{:.8}", trade.pnl_net),
            trade.tag.clone(),
        ])?;
    }
    writer.flush()?;

    let states_path = output_dir.join(format!("backtest_states_{}.csv", stamp));
    let mut writer = csv::Writer::from_path(&states_path)?;
    writer.write_record([
        "timestamp",
        "state",
        "band",
        "spread_pct",
        "grid_orders",
        "dca_orders",
        "tp_orders",
    ])?;
    for record in &result.state_history {
        writer.write_record([
            record.timestamp.to_rfc3339(),
            record.gate_state.to_string(),
            record.band.to_string(),
            format!("{:.3}", record.spread_pct),
            record.grid_orders.to_string(),
            record.dca_orders.to_string(),
            record.tp_orders.to_string(),
        ])?;
    }
    writer.flush()?;

    info!(dir = %output_dir.display(), "Backtest results exported");
    Ok(())
}
