//! Store Bootstrap
//!
//! Durable state lives in an embedded SQLite database. WAL journalling and
//! foreign keys are switched on at connect time; the schema is applied
//! idempotently on startup.

mod schema;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn connect(path: &str, wal_mode: bool) -> Result<Self, sqlx::Error> {
        let journal_mode = if wal_mode {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))?
            .create_if_missing(true)
            .journal_mode(journal_mode)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        schema::init(&pool).await?;
        tracing::info!("Database ready at {} (wal={})", path, wal_mode);

        Ok(Self { pool })
    }

    /// In-memory database for tests. A single connection keeps every query
    /// on the same memory instance.
    pub async fn connect_in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        schema::init(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn schema_version(&self) -> Result<i64, sqlx::Error> {
        let version: Option<(String,)> =
            sqlx::query_as("SELECT value FROM system_state WHERE key = 'schema_version'")
                .fetch_optional(&self.pool)
                .await?;
        Ok(version
            .and_then(|(v,)| v.parse().ok())
            .unwrap_or_default())
    }
}
