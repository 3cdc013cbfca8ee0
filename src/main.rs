//! Hybrid grid trading - main entry point
//!
//! This binary provides two subcommands:
//! - backtest: Replay a candle CSV through the hybrid engine
//! - live: Run the trading loop (paper, testnet, or mainnet)

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hybrid_grid::TradingMode;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "hybrid-grid")]
#[command(about = "Hybrid grid + DCA spot trading bot with backtesting and live trading", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay a candle CSV through the hybrid engine
    Backtest {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/hybrid_default.json")]
        config: String,

        /// Symbol to backtest (defaults to the first configured symbol)
        #[arg(short, long)]
        symbol: Option<String>,

        /// Path to OHLCV CSV file
        #[arg(short, long)]
        data: String,

        /// Initial capital (overrides config)
        #[arg(long)]
        capital: Option<f64>,

        /// Export equity/trades/state CSVs to results/
        #[arg(long)]
        export: bool,
    },

    /// Run the trading loop
    Live {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/hybrid_default.json")]
        config: String,

        /// Trading mode: paper, testnet, or mainnet
        #[arg(short, long, default_value = "paper")]
        mode: TradingMode,

        /// State database path
        #[arg(long, default_value = "state.db")]
        state_db: String,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    // Filter out noisy external crates
    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Backtest { .. } => "backtest",
        Commands::Live { .. } => "live",
    };

    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Backtest {
            config,
            symbol,
            data,
            capital,
            export,
        } => commands::backtest::run(config, symbol, data, capital, export),

        Commands::Live {
            config,
            mode,
            state_db,
        } => commands::live::run(config, mode, state_db),
    }
}
