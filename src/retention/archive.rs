use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;

use crate::core::error::{FusionError, FusionResult};
use crate::model::Tick;

/// Durable tier for ticks leaving the in-memory buffers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TickArchive: Send + Sync {
    /// Persist a batch, returning how many rows were written.
    async fn archive(&self, ticks: Vec<Tick>) -> FusionResult<u64>;

    /// Delete rows stamped before `cutoff`, returning how many were removed.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> FusionResult<u64>;

    fn name(&self) -> &'static str;
}

/// Archive that keeps nothing; used when no durable path is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullArchive;

#[async_trait]
impl TickArchive for NullArchive {
    async fn archive(&self, ticks: Vec<Tick>) -> FusionResult<u64> {
        Ok(ticks.len() as u64)
    }

    async fn purge_before(&self, _cutoff: DateTime<Utc>) -> FusionResult<u64> {
        Ok(0)
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

pub struct SqliteTickArchive {
    pool: SqlitePool,
}

impl SqliteTickArchive {
    pub async fn open(database_path: &str) -> FusionResult<Self> {
        if let Some(parent) = Path::new(database_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    FusionError::DurableIo(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
        }

        let connection_string = if database_path.starts_with("sqlite:") {
            database_path.to_string()
        } else {
            format!("sqlite://{}?mode=rwc", database_path)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&connection_string)
            .await?;

        let archive = Self { pool };
        archive.initialize_schema().await?;
        Ok(archive)
    }

    /// Private in-memory database; one connection so every query sees the same data.
    pub async fn in_memory() -> FusionResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let archive = Self { pool };
        archive.initialize_schema().await?;
        Ok(archive)
    }

    async fn initialize_schema(&self) -> FusionResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ticks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                source TEXT NOT NULL,
                ts DATETIME NOT NULL,
                bid REAL NOT NULL,
                ask REAL NOT NULL,
                volume REAL NOT NULL,
                applied_offset REAL NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_ticks_symbol_ts
            ON ticks(symbol, ts)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_ticks_ts ON ticks(ts)")
            .execute(&self.pool)
            .await?;

        tracing::info!("✅ Tick archive schema initialized");
        Ok(())
    }

    pub async fn count(&self, symbol: &str) -> FusionResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM ticks WHERE symbol = ?")
            .bind(symbol)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl TickArchive for SqliteTickArchive {
    async fn archive(&self, ticks: Vec<Tick>) -> FusionResult<u64> {
        if ticks.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for tick in &ticks {
            sqlx::query(
                r#"
                INSERT INTO ticks (symbol, source, ts, bid, ask, volume, applied_offset)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&tick.symbol)
            .bind(tick.source.as_str())
            .bind(tick.timestamp)
            .bind(tick.bid)
            .bind(tick.ask)
            .bind(tick.volume)
            .bind(tick.applied_offset)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(ticks.len() as u64)
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> FusionResult<u64> {
        let result = sqlx::query("DELETE FROM ticks WHERE ts < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}
