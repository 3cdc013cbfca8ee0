//! Live trading command
//!
//! Clock-driven loop over the configured symbols: paper mode simulates
//! fills against the live ticker, testnet/mainnet place real orders.
//! Crash recovery restores cash and open positions from the SQLite state
//! store; shutdown is cooperative (finish the tick, persist, export).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep};
use tracing::{debug, error, info, warn};

use hybrid_grid::config::Config;
use hybrid_grid::exchange::binance::{BinanceClient, ClientConfig};
use hybrid_grid::exchange::Exchange;
use hybrid_grid::indicators::{IndicatorBundle, IndicatorConfig};
use hybrid_grid::oms::{OrderManager, OrderManagerConfig};
use hybrid_grid::portfolio::Portfolio;
use hybrid_grid::session_log::SessionLog;
use hybrid_grid::state_store::{Checkpoint, StateStore};
use hybrid_grid::strategy::hybrid::{HybridEngine, HybridPolicy};
use hybrid_grid::{Candle, Symbol, TradingMode};

struct LiveTrader {
    config: Config,
    mode: TradingMode,
    exchange: BinanceClient,
    engines: HashMap<Symbol, HybridEngine>,
    policies: HashMap<Symbol, HybridPolicy>,
    indicator_config: IndicatorConfig,
    portfolio: Portfolio,
    order_manager: OrderManager,
    state_store: StateStore,
    cycle_count: i64,
}

impl LiveTrader {
    async fn new(config: Config, state_db: &str, mode: TradingMode) -> Result<Self> {
        let mut client_config = ClientConfig::default()
            .with_timeout(Duration::from_secs(config.exchange.request_timeout_secs))
            .with_max_retries(3);
        client_config.requests_per_second = config.exchange.rate_limit as usize;
        if mode == TradingMode::Testnet {
            client_config = client_config.testnet();
        }

        let api_key = config.exchange.api_key.clone().unwrap_or_default();
        let api_secret = config.exchange.api_secret.clone().unwrap_or_default();
        if mode.is_live() && (api_key.is_empty() || api_secret.is_empty()) {
            anyhow::bail!("Live mode requires BINANCE_API_KEY / BINANCE_API_SECRET");
        }

        let mut exchange = BinanceClient::with_config(api_key, api_secret, client_config);
        exchange.set_symbol_filters(config.symbol_filters.clone());

        // Live modes seed capital from the account's quote balance
        let initial_capital = if mode.is_live() {
            match exchange.get_account_balance().await {
                Ok(balances) => balances
                    .get(&config.trading.quote_asset)
                    .map(|b| b.total())
                    .unwrap_or(config.trading.initial_capital),
                Err(e) => {
                    warn!("Could not fetch account balance ({}), using configured capital", e);
                    config.trading.initial_capital
                }
            }
        } else {
            config.trading.initial_capital
        };

        let mut engines = HashMap::new();
        let mut policies = HashMap::new();
        for symbol_name in &config.trading.symbols {
            let symbol = Symbol::new(symbol_name);
            let policy = config.policy_for(symbol_name)?;
            engines.insert(symbol.clone(), HybridEngine::new(symbol.clone(), policy.clone()));
            policies.insert(symbol, policy);
        }

        let now = Utc::now();
        let session_log = SessionLog::create("data/outputs", mode, now)?;
        info!("Session id: {}", session_log.session_id());

        let order_manager = OrderManager::new(
            OrderManagerConfig {
                strategy_name: "Hybrid".to_string(),
                order_size_pct: config.trading.order_size_pct,
                fee_rate: config.exchange.fee_rate,
                mode,
            },
            session_log,
        );

        let state_store = StateStore::open(state_db).context("Failed to open state store")?;

        Ok(LiveTrader {
            portfolio: Portfolio::new(initial_capital, now),
            config,
            mode,
            exchange,
            engines,
            policies,
            indicator_config: IndicatorConfig::default(),
            order_manager,
            state_store,
            cycle_count: 0,
        })
    }

    fn config_hash(&self) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        serde_json::to_string(&self.config)
            .unwrap_or_default()
            .hash(&mut hasher);
        format!("{:x}", hasher.finish())
    }

    fn recover_state(&mut self) -> Result<()> {
        info!("Recovering state from previous session...");

        let checkpoint = match self.state_store.load_checkpoint()? {
            Some(cp) => cp,
            None => {
                info!("No previous checkpoint found, starting fresh");
                return Ok(());
            }
        };

        info!(
            "Found checkpoint: cycle={}, equity={:.2}, positions={}",
            checkpoint.cycle_count, checkpoint.equity, checkpoint.open_positions
        );

        if !checkpoint.config_hash.is_empty() && checkpoint.config_hash != self.config_hash() {
            warn!("Config has changed since the last run");
        }

        self.cycle_count = checkpoint.cycle_count;

        let positions = self.state_store.load_positions()?;
        for position in &positions {
            info!(
                "Recovered position: {} qty={:.6} @ {:.2}",
                position.symbol, position.quantity, position.entry_price
            );
        }
        self.portfolio.restore(checkpoint.cash, positions);

        info!(
            "State recovery complete: {} open positions, cash={:.2}",
            self.portfolio.open_position_count(),
            self.portfolio.cash
        );
        Ok(())
    }

    async fn run_cycle(&mut self) -> Result<()> {
        self.cycle_count += 1;
        let now = Utc::now();
        info!("--- Trading cycle {} ---", self.cycle_count);

        self.portfolio.reset_daily_stats(now);
        self.portfolio.reset_weekly_stats(now);

        // Tickers first; a symbol with no price is skipped this tick
        let mut prices: HashMap<Symbol, f64> = HashMap::new();
        for symbol_name in self.config.trading.symbols.clone() {
            let symbol = Symbol::new(&symbol_name);
            match self.exchange.get_ticker(&symbol_name).await {
                Ok(ticker) if ticker.price > 0.0 => {
                    prices.insert(symbol, ticker.price);
                }
                Ok(_) => warn!(symbol = %symbol, "Ticker returned non-positive price, skipping"),
                Err(e) => warn!(symbol = %symbol, error = %e, "Ticker fetch failed, skipping"),
            }
        }

        let equity = self.portfolio.equity(&prices);
        info!("Portfolio equity: {:.2}", equity);

        if equity < 0.0 {
            anyhow::bail!("Invariant violation: negative equity {:.2}", equity);
        }

        for (symbol, price) in prices.clone() {
            if let Err(e) = self.process_symbol(&symbol, price, equity).await {
                error!(symbol = %symbol, error = %e, "Error processing symbol");
            }
        }

        self.save_checkpoint(equity)?;

        info!(
            "Cycle {} complete: equity={:.2}, positions={}, daily_pnl={:.2}",
            self.cycle_count,
            equity,
            self.portfolio.open_position_count(),
            self.portfolio.daily_pnl
        );

        Ok(())
    }

    async fn process_symbol(&mut self, symbol: &Symbol, price: f64, equity: f64) -> Result<()> {
        let policy = self
            .policies
            .get(symbol)
            .context("No policy for symbol")?
            .clone();

        let candles = match self
            .exchange
            .get_klines(
                symbol.as_str(),
                &policy.bar_timeframe,
                self.config.trading.candle_limit,
            )
            .await
        {
            Ok(c) => c,
            Err(e) if e.is_transient() => {
                warn!(symbol = %symbol, error = %e, "Kline fetch failed, skipping this tick");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let bundle = match IndicatorBundle::compute(&candles, &self.indicator_config) {
            Some(b) => b,
            None => {
                debug!(symbol = %symbol, candles = candles.len(), "Insufficient candle history");
                return Ok(());
            }
        };

        // One time source per tick: system clock in live modes, candle
        // time in paper simulation.
        let tick_time: DateTime<Utc> = if self.mode.is_live() {
            Utc::now()
        } else {
            candles.last().map(|c| c.datetime).unwrap_or_else(Utc::now)
        };

        let last = candles.last().context("Empty candle window")?;
        let bar = Candle {
            datetime: tick_time,
            ..last.clone()
        };

        let engine = self.engines.get_mut(symbol).context("No engine for symbol")?;
        let plan = engine.on_bar(&bar, &bundle, equity);

        info!(
            symbol = %symbol,
            state = %plan.pnl_gate_state,
            band = %plan.band,
            spread = format!("{:.3}%", plan.spread_pct),
            grid = plan.grid_orders.len(),
            dca = plan.dca_orders.len(),
            tp = plan.tp_orders.len(),
            "Plan"
        );

        if plan.sl_action.stop {
            error!(
                symbol = %symbol,
                reason = plan.sl_action.reason.as_deref().unwrap_or(""),
                "Hard stop triggered, closing positions"
            );
            self.order_manager.close_symbol_positions(
                symbol,
                price,
                "hard_stop",
                &mut self.portfolio,
                tick_time,
            );
            return Ok(());
        }

        self.order_manager
            .place_plan(
                symbol,
                &plan,
                equity,
                Some(&self.exchange as &dyn Exchange),
                tick_time,
            )
            .await?;

        self.order_manager
            .sweep_stale(
                symbol,
                &policy,
                price,
                bundle.rsi,
                bundle.atr_pct,
                Some(&self.exchange as &dyn Exchange),
                tick_time,
            )
            .await;

        if self.mode.is_live() {
            if let Err(e) = self
                .order_manager
                .reconcile_fills_live(
                    symbol,
                    &self.exchange,
                    tick_time,
                    &mut self.portfolio,
                    self.engines.get_mut(symbol).context("No engine for symbol")?,
                )
                .await
            {
                warn!(symbol = %symbol, error = %e, "Fill reconciliation failed");
            }
        } else {
            self.order_manager.reconcile_fills_sim(
                symbol,
                price,
                price,
                tick_time,
                &mut self.portfolio,
                self.engines.get_mut(symbol).context("No engine for symbol")?,
            );
        }

        Ok(())
    }

    fn save_checkpoint(&mut self, equity: f64) -> Result<()> {
        let checkpoint = Checkpoint {
            timestamp: Utc::now(),
            cycle_count: self.cycle_count,
            equity,
            cash: self.portfolio.cash,
            open_positions: self.portfolio.open_position_count() as i64,
            config_hash: self.config_hash(),
        };
        self.state_store.save_checkpoint(&checkpoint)?;

        let positions: Vec<_> = self.portfolio.positions().cloned().collect();
        self.state_store.save_positions(positions.iter())?;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        info!("Initiating graceful shutdown...");

        let stats = self.portfolio.stats();
        info!("======================================================");
        info!("SESSION SUMMARY");
        info!("======================================================");
        info!("Total trades:   {}", stats.total_trades);
        info!("Win rate:       {:.2}%", stats.win_rate);
        info!("Total PnL:      {:.2}", stats.total_pnl);
        info!("Daily PnL:      {:.2}", stats.daily_pnl);
        info!("Weekly PnL:     {:.2}", stats.weekly_pnl);
        info!("Open positions: {}", stats.open_positions);
        info!("Cash:           {:.2}", stats.cash);
        info!("======================================================");

        // Open positions stay in the portfolio; the state store and session
        // log carry enough to reconcile on restart.
        self.save_checkpoint(self.portfolio.cash)?;
        info!("Shutdown complete");
        Ok(())
    }
}

pub fn run(config_path: String, mode: TradingMode, state_db: String) -> Result<()> {
    if mode == TradingMode::Backtest {
        anyhow::bail!("Use the backtest subcommand for backtest mode");
    }

    dotenv::dotenv().ok();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run_async(config_path, mode, state_db))
}

async fn run_async(config_path: String, mode: TradingMode, state_db: String) -> Result<()> {
    let config = Config::from_file(&config_path)
        .context(format!("Failed to load config from {}", config_path))?;

    let interval_secs = config.trading.trading_interval_seconds;

    info!("======================================================");
    info!("HYBRID GRID TRADING - {} MODE", mode.to_string().to_uppercase());
    info!("======================================================");
    info!("Symbols:  {}", config.trading.symbols.join(", "));
    info!("Capital:  {:.2}", config.trading.initial_capital);
    info!("Interval: {}s", interval_secs);
    info!("======================================================");

    if mode == TradingMode::Mainnet {
        warn!("LIVE TRADING MODE - REAL MONEY AT RISK!");
        warn!("Press Ctrl+C within 10 seconds to abort...");
        for i in (1..=10).rev() {
            info!("Starting in {} seconds...", i);
            sleep(Duration::from_secs(1)).await;
        }
    }

    let mut trader = LiveTrader::new(config, &state_db, mode).await?;
    trader.recover_state()?;

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, will stop after the current tick");
                shutdown_flag_clone.store(true, Ordering::SeqCst);
            }
            Err(e) => error!("Error setting up signal handler: {}", e),
        }
    });

    let mut cycle_interval = interval(Duration::from_secs(interval_secs.max(1)));

    info!("Starting trading loop...");

    loop {
        cycle_interval.tick().await;

        if shutdown_flag.load(Ordering::SeqCst) {
            break;
        }

        if let Err(e) = trader.run_cycle().await {
            // Invariant violations terminate; everything else is logged
            // and the loop continues on the next tick.
            if e.to_string().contains("Invariant violation") {
                error!("{}", e);
                break;
            }
            error!("Trading cycle error: {}", e);
        }

        if shutdown_flag.load(Ordering::SeqCst) {
            break;
        }
    }

    trader.shutdown()?;
    info!("Trading session ended");
    Ok(())
}
