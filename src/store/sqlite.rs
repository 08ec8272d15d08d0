use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::store::CandleStore;
use crate::types::Candle;

/// SQLite-backed candle store.
///
/// rusqlite is blocking, so every call hops onto tokio's blocking pool and
/// takes the connection lock there.
pub struct SqliteCandleStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCandleStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open candle database {}", db_path.display()))?;
        let conn = Self::init(conn)?;
        info!(path = %db_path.display(), "SQLite candle store ready");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        let conn = Self::init(conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init(conn: Connection) -> Result<Connection> {
        let _mode: Option<String> = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .optional()
            .context("failed to set journal mode")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS candles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                timestamp INTEGER NOT NULL
            )",
            [],
        )
        .context("failed to create candles table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_candles_symbol_timestamp ON candles(symbol, timestamp)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_candles_timestamp ON candles(timestamp)",
            [],
        )?;

        Ok(conn)
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            op(&guard)
        })
        .await
        .context("candle store task panicked")?
    }
}

/// Timestamps are stored as unix milliseconds.
fn row_to_candle(row: &rusqlite::Row<'_>) -> rusqlite::Result<Candle> {
    let millis: i64 = row.get(6)?;
    let timestamp = DateTime::from_timestamp_millis(millis)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(6, millis))?;
    Ok(Candle {
        symbol: row.get(0)?,
        open: row.get(1)?,
        high: row.get(2)?,
        low: row.get(3)?,
        close: row.get(4)?,
        volume: row.get(5)?,
        timestamp,
    })
}

#[async_trait]
impl CandleStore for SqliteCandleStore {
    async fn save(&self, candle: &Candle) -> Result<()> {
        let candle = candle.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO candles (symbol, open, high, low, close, volume, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    candle.symbol,
                    candle.open,
                    candle.high,
                    candle.low,
                    candle.close,
                    candle.volume,
                    candle.timestamp.timestamp_millis(),
                ],
            )
            .context("failed to insert candle")?;
            Ok(())
        })
        .await
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let cutoff_ms = cutoff.timestamp_millis();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM candles WHERE timestamp < ?1", params![cutoff_ms])
                .context("failed to delete expired candles")
        })
        .await
    }

    async fn candles(&self, symbol: Option<&str>) -> Result<Vec<Candle>> {
        let symbol = symbol.map(str::to_owned);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT symbol, open, high, low, close, volume, timestamp
                 FROM candles
                 WHERE ?1 IS NULL OR symbol = ?1
                 ORDER BY timestamp ASC, id ASC",
            )?;
            let candles = stmt
                .query_map(params![symbol], row_to_candle)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("failed to read candles")?;
            Ok(candles)
        })
        .await
    }

    fn backend_type(&self) -> &'static str {
        "sqlite"
    }
}
