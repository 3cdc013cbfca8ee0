//! Append-only per-session order and fill records
//!
//! Two CSV files per session (`orders_<id>.csv`, `fills_<id>.csv`), flushed
//! row by row so an abnormal termination still leaves a usable record of
//! what reached the exchange.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::io::Write;
use std::path::Path;

use crate::{PositionSide, Side, TradingMode};

const ORDER_HEADERS: &[&str] = &[
    "timestamp",
    "session_id",
    "symbol",
    "order_id",
    "client_order_id",
    "type",
    "side",
    "action",
    "price",
    "quantity",
    "value",
    "status",
    "strategy",
    "tag",
    "reason",
    "mode",
];

const FILL_HEADERS: &[&str] = &[
    "timestamp",
    "session_id",
    "symbol",
    "order_id",
    "client_order_id",
    "type",
    "side",
    "action",
    "price",
    "quantity",
    "value",
    "status",
    "strategy",
    "tag",
    "reason",
    "mode",
    "fill_id",
    "fee",
    "fee_asset",
    "pnl",
    "pnl_pct",
];

/// One order event (placement, cancellation, rejection)
#[derive(Debug, Clone)]
pub struct OrderLogEntry<'a> {
    pub timestamp: DateTime<Utc>,
    pub symbol: &'a str,
    pub order_id: &'a str,
    pub client_order_id: &'a str,
    pub order_type: Side,
    pub side: PositionSide,
    pub action: &'a str,
    pub price: f64,
    pub quantity: f64,
    pub status: &'a str,
    pub strategy: &'a str,
    pub tag: &'a str,
    pub reason: &'a str,
}

/// One fill event
#[derive(Debug, Clone)]
pub struct FillLogEntry<'a> {
    pub order: OrderLogEntry<'a>,
    pub fee: f64,
    pub fee_asset: &'a str,
    pub pnl: f64,
    pub pnl_pct: f64,
}

/// Session-scoped CSV writers for orders and fills
pub struct SessionLog {
    session_id: String,
    mode: TradingMode,
    orders: csv::Writer<Box<dyn Write + Send>>,
    fills: csv::Writer<Box<dyn Write + Send>>,
    fill_counter: u64,
}

impl SessionLog {
    /// Create the session files under `output_dir`
    pub fn create(output_dir: impl AsRef<Path>, mode: TradingMode, now: DateTime<Utc>) -> Result<Self> {
        let output_dir = output_dir.as_ref();
        std::fs::create_dir_all(output_dir).context("Failed to create output directory")?;

        let session_id = now.format("%Y%m%d_%H%M%S").to_string();

        let orders_path = output_dir.join(format!("orders_{}.csv", session_id));
        let fills_path = output_dir.join(format!("fills_{}.csv", session_id));

        let orders_file: Box<dyn Write + Send> = Box::new(
            std::fs::File::create(&orders_path).context("Failed to create orders log")?,
        );
        let fills_file: Box<dyn Write + Send> = Box::new(
            std::fs::File::create(&fills_path).context("Failed to create fills log")?,
        );

        let mut log = SessionLog {
            session_id,
            mode,
            orders: csv::Writer::from_writer(orders_file),
            fills: csv::Writer::from_writer(fills_file),
            fill_counter: 0,
        };
        log.orders.write_record(ORDER_HEADERS)?;
        log.fills.write_record(FILL_HEADERS)?;
        log.orders.flush()?;
        log.fills.flush()?;

        Ok(log)
    }

    /// A log that discards everything (backtests that skip exports, tests)
    pub fn sink(mode: TradingMode) -> Self {
        SessionLog {
            session_id: "sink".to_string(),
            mode,
            orders: csv::Writer::from_writer(Box::new(std::io::sink())),
            fills: csv::Writer::from_writer(Box::new(std::io::sink())),
            fill_counter: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn log_order(&mut self, entry: &OrderLogEntry<'_>) {
        let value = entry.price * entry.quantity;
        let row = [
            entry.timestamp.to_rfc3339(),
            self.session_id.clone(),
            entry.symbol.to_string(),
            entry.order_id.to_string(),
            entry.client_order_id.to_string(),
            entry.order_type.to_string(),
            entry.side.to_string(),
            entry.action.to_string(),
            format!("{:.8}", entry.price),
            format!("{:.8}", entry.quantity),
            format!("{:.8}", value),
            entry.status.to_string(),
            entry.strategy.to_string(),
            entry.tag.to_string(),
            entry.reason.to_string(),
            self.mode.to_string(),
        ];

        if let Err(e) = self.orders.write_record(&row) {
            tracing::error!("Failed to write order log row: {}", e);
        }
        if let Err(e) = self.orders.flush() {
            tracing::error!("Failed to flush order log: {}", e);
        }
    }

    pub fn log_fill(&mut self, entry: &FillLogEntry<'_>) {
        self.fill_counter += 1;
        let fill_id = format!("{}-f{}", self.session_id, self.fill_counter);
        let order = &entry.order;
        let value = order.price * order.quantity;

        let row = [
            order.timestamp.to_rfc3339(),
            self.session_id.clone(),
            order.symbol.to_string(),
            order.order_id.to_string(),
            order.client_order_id.to_string(),
            order.order_type.to_string(),
            order.side.to_string(),
            order.action.to_string(),
            format!("{:.8}", order.price),
            format!("{:.8}", order.quantity),
            format!("{:.8}", value),
            order.status.to_string(),
            order.strategy.to_string(),
            order.tag.to_string(),
            order.reason.to_string(),
            self.mode.to_string(),
            fill_id,
            format!("{:.8}", entry.fee),
            entry.fee_asset.to_string(),
            format!("{:.8}", entry.pnl),
            format!("{:.4}", entry.pnl_pct),
        ];

        if let Err(e) = self.fills.write_record(&row) {
            tracing::error!("Failed to write fill log row: {}", e);
        }
        if let Err(e) = self.fills.flush() {
            tracing::error!("Failed to flush fill log: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(ts: DateTime<Utc>) -> OrderLogEntry<'static> {
        OrderLogEntry {
            timestamp: ts,
            symbol: "BTCUSDT",
            order_id: "42",
            client_order_id: "",
            order_type: Side::Buy,
            side: PositionSide::Long,
            action: "OPEN",
            price: 100.0,
            quantity: 0.5,
            status: "NEW",
            strategy: "Hybrid",
            tag: "grid_buy_1",
            reason: "",
        }
    }

    #[test]
    fn test_session_files_created_with_headers() {
        let dir = std::env::temp_dir().join(format!("hybrid_grid_log_{}", std::process::id()));
        let ts = Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap();

        let mut log = SessionLog::create(&dir, TradingMode::Paper, ts).unwrap();
        log.log_order(&entry(ts));
        log.log_fill(&FillLogEntry {
            order: entry(ts),
            fee: 0.05,
            fee_asset: "USDT",
            pnl: 0.0,
            pnl_pct: 0.0,
        });

        let orders_path = dir.join("orders_20240304_120000.csv");
        let contents = std::fs::read_to_string(&orders_path).unwrap();
        let mut lines = contents.lines();
        assert!(lines.next().unwrap().starts_with("timestamp,session_id,symbol"));
        let row = lines.next().unwrap();
        assert!(row.contains("BTCUSDT"));
        assert!(row.contains("grid_buy_1"));
        assert!(row.contains("paper"));

        let fills_path = dir.join("fills_20240304_120000.csv");
        let contents = std::fs::read_to_string(&fills_path).unwrap();
        assert!(contents.lines().next().unwrap().ends_with("fill_id,fee,fee_asset,pnl,pnl_pct"));
        assert!(contents.contains("20240304_120000-f1"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_sink_discards_quietly() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap();
        let mut log = SessionLog::sink(TradingMode::Backtest);
        log.log_order(&entry(ts));
        assert_eq!(log.session_id(), "sink");
    }
}
