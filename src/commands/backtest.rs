//! Backtest command
//!
//! Replays a candle CSV through the hybrid engine and prints the report.

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

use hybrid_grid::backtest::{export_result, Backtester};
use hybrid_grid::config::Config;
use hybrid_grid::{data, Symbol};

pub fn run(
    config_path: String,
    symbol: Option<String>,
    data_file: String,
    capital: Option<f64>,
    export: bool,
) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run_async(config_path, symbol, data_file, capital, export))
}

async fn run_async(
    config_path: String,
    symbol: Option<String>,
    data_file: String,
    capital: Option<f64>,
    export: bool,
) -> Result<()> {
    let config = Config::from_file(&config_path)
        .context(format!("Failed to load config from {}", config_path))?;

    let symbol_name = symbol
        .or_else(|| config.trading.symbols.first().cloned())
        .context("No symbol given and none configured")?;
    let symbol = Symbol::new(&symbol_name);

    info!("Loading candles from {}", data_file);
    let candles = data::load_csv(&data_file)
        .context(format!("Failed to load candle data from {}", data_file))?;
    info!(
        "Loaded {} candles ({} to {})",
        candles.len(),
        candles.first().map(|c| c.datetime.to_rfc3339()).unwrap_or_default(),
        candles.last().map(|c| c.datetime.to_rfc3339()).unwrap_or_default(),
    );

    let policy = config.policy_for(&symbol_name)?;
    let initial_capital = capital.unwrap_or(config.trading.initial_capital);
    let start_time = candles
        .first()
        .map(|c| c.datetime)
        .unwrap_or_else(Utc::now);

    let mut backtester = Backtester::new(
        symbol,
        policy,
        initial_capital,
        config.trading.order_size_pct,
        config.exchange.fee_rate,
        start_time,
    );

    let result = backtester.run(&candles).await?;

    info!("======================================================");
    info!("HYBRID STRATEGY BACKTEST REPORT");
    info!("======================================================");
    info!("Symbol:          {}", symbol_name);
    info!("Initial capital: {:.2}", result.initial_capital);
    info!("Final equity:    {:.2}", result.final_equity);
    info!("Total return:    {:.2}%", result.metrics.total_return_pct);
    info!("Max drawdown:    {:.2}%", result.metrics.max_drawdown_pct);
    info!("Sharpe ratio:    {:.2}", result.metrics.sharpe_ratio);
    info!("Trades:          {}", result.metrics.total_trades);
    info!("Win rate:        {:.2}%", result.metrics.win_rate);
    info!("Avg win:         {:.2}", result.metrics.avg_win);
    info!("Avg loss:        {:.2}", result.metrics.avg_loss);
    info!("Profit factor:   {:.2}", result.metrics.profit_factor);
    info!("Total fees:      {:.2}", result.metrics.total_fees);
    info!("Hard stops:      {}", result.metrics.hard_stops);
    info!("Avg ADX(14):     {:.1}", result.metrics.avg_adx);

    info!("State distribution:");
    let total_bars = result.state_history.len().max(1);
    for (state, count) in result.state_distribution() {
        info!(
            "  {}: {} bars ({:.1}%)",
            state,
            count,
            count as f64 / total_bars as f64 * 100.0
        );
    }
    info!("======================================================");

    if export {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        export_result(&result, "results", &stamp)?;
    }

    Ok(())
}
