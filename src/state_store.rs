//! SQLite-backed state persistence for live trading
//!
//! One checkpoint row (cycle count, equity, cash, config hash) plus the
//! open positions, rewritten every tick. On startup the live trader
//! reloads both so a crash or restart resumes where it left off.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::info;

use crate::portfolio::Position;
use crate::{PositionSide, Symbol};

/// Snapshot of the trading session saved once per cycle
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub timestamp: DateTime<Utc>,
    pub cycle_count: i64,
    pub equity: f64,
    pub cash: f64,
    pub open_positions: i64,
    pub config_hash: String,
}

/// SQLite state store
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    /// Open (or create) the state database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).context("Failed to open state database")?;
        Self::init(conn)
    }

    /// In-memory store for tests
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS checkpoint (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                timestamp TEXT NOT NULL,
                cycle_count INTEGER NOT NULL,
                equity REAL NOT NULL,
                cash REAL NOT NULL,
                open_positions INTEGER NOT NULL,
                config_hash TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS positions (
                symbol TEXT NOT NULL,
                strategy TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity REAL NOT NULL,
                entry_price REAL NOT NULL,
                entry_time TEXT NOT NULL,
                stop_loss REAL,
                take_profit REAL,
                PRIMARY KEY (symbol, strategy)
            );",
        )?;
        Ok(StateStore { conn })
    }

    pub fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.conn.execute(
            "INSERT INTO checkpoint (id, timestamp, cycle_count, equity, cash, open_positions, config_hash)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                timestamp = ?1, cycle_count = ?2, equity = ?3,
                cash = ?4, open_positions = ?5, config_hash = ?6",
            params![
                checkpoint.timestamp.to_rfc3339(),
                checkpoint.cycle_count,
                checkpoint.equity,
                checkpoint.cash,
                checkpoint.open_positions,
                checkpoint.config_hash,
            ],
        )?;
        Ok(())
    }

    pub fn load_checkpoint(&self) -> Result<Option<Checkpoint>> {
        let row = self
            .conn
            .query_row(
                "SELECT timestamp, cycle_count, equity, cash, open_positions, config_hash
                 FROM checkpoint WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.map(
            |(timestamp, cycle_count, equity, cash, open_positions, config_hash)| Checkpoint {
                timestamp: timestamp
                    .parse::<DateTime<Utc>>()
                    .unwrap_or_else(|_| Utc::now()),
                cycle_count,
                equity,
                cash,
                open_positions,
                config_hash,
            },
        ))
    }

    /// Replace the stored open positions with the current set
    pub fn save_positions<'a>(
        &mut self,
        positions: impl Iterator<Item = &'a Position>,
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM positions", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO positions
                 (symbol, strategy, side, quantity, entry_price, entry_time, stop_loss, take_profit)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for position in positions {
                stmt.execute(params![
                    position.symbol.as_str(),
                    position.strategy,
                    position.side.to_string(),
                    position.quantity,
                    position.entry_price,
                    position.entry_time.to_rfc3339(),
                    position.stop_loss,
                    position.take_profit,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_positions(&self) -> Result<Vec<Position>> {
        let mut stmt = self.conn.prepare(
            "SELECT symbol, strategy, side, quantity, entry_price, entry_time, stop_loss, take_profit
             FROM positions",
        )?;

        let rows = stmt.query_map([], |row| {
            let symbol: String = row.get(0)?;
            let strategy: String = row.get(1)?;
            let side: String = row.get(2)?;
            let quantity: f64 = row.get(3)?;
            let entry_price: f64 = row.get(4)?;
            let entry_time: String = row.get(5)?;
            let stop_loss: Option<f64> = row.get(6)?;
            let take_profit: Option<f64> = row.get(7)?;

            Ok(Position {
                symbol: Symbol::new(symbol),
                side: if side == "SHORT" {
                    PositionSide::Short
                } else {
                    PositionSide::Long
                },
                quantity,
                entry_price,
                strategy,
                entry_time: entry_time
                    .parse::<DateTime<Utc>>()
                    .unwrap_or_else(|_| Utc::now()),
                stop_loss,
                take_profit,
            })
        })?;

        let positions: Vec<Position> = rows.filter_map(|r| r.ok()).collect();
        if !positions.is_empty() {
            info!("Loaded {} persisted positions", positions.len());
        }
        Ok(positions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.load_checkpoint().unwrap().is_none());

        let checkpoint = Checkpoint {
            timestamp: t0(),
            cycle_count: 42,
            equity: 10_250.5,
            cash: 8_000.0,
            open_positions: 2,
            config_hash: "abc123".to_string(),
        };
        store.save_checkpoint(&checkpoint).unwrap();

        let loaded = store.load_checkpoint().unwrap().unwrap();
        assert_eq!(loaded.cycle_count, 42);
        assert!((loaded.equity - 10_250.5).abs() < 1e-9);
        assert_eq!(loaded.config_hash, "abc123");

        // Second save overwrites rather than duplicating
        store
            .save_checkpoint(&Checkpoint {
                cycle_count: 43,
                ..checkpoint
            })
            .unwrap();
        assert_eq!(store.load_checkpoint().unwrap().unwrap().cycle_count, 43);
    }

    #[test]
    fn test_positions_round_trip() {
        let mut store = StateStore::open_in_memory().unwrap();

        let position = Position {
            symbol: Symbol::new("BTCUSDT"),
            side: PositionSide::Long,
            quantity: 0.5,
            entry_price: 50_000.0,
            strategy: "Hybrid".to_string(),
            entry_time: t0(),
            stop_loss: None,
            take_profit: Some(52_000.0),
        };
        store.save_positions([&position].into_iter()).unwrap();

        let loaded = store.load_positions().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].symbol.as_str(), "BTCUSDT");
        assert!((loaded[0].quantity - 0.5).abs() < 1e-9);
        assert_eq!(loaded[0].stop_loss, None);
        assert_eq!(loaded[0].take_profit, Some(52_000.0));

        // Saving an empty set clears the table
        store.save_positions(std::iter::empty::<&Position>()).unwrap();
        assert!(store.load_positions().unwrap().is_empty());
    }
}
