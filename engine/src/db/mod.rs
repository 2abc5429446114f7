/// Database module for SQLite persistence
///
/// This module provides durable storage for conversation states, compaction
/// audit records, subject identity links and the modality register. It uses
/// sqlx with a pooled SQLite connection in WAL mode.
///
/// [`SqliteGateway`] adapts the repositories to the engine's
/// [`PersistenceGateway`](sdk::gateway::PersistenceGateway) contract;
/// [`InMemoryGateway`] offers the same contract without a database.
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use sdk::errors::StoreError;
use sdk::gateway::StoreResult;

use crate::config::Config;

pub mod conversations;
pub mod gateway;
pub mod in_memory;
pub mod modality;

// Re-export commonly used types
pub use conversations::ConversationRepository;
pub use gateway::SqliteGateway;
pub use in_memory::InMemoryGateway;
pub use modality::ModalityRepository;

/// Default pool size when none is configured
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    ///
    /// This will:
    /// 1. Create the database file if it doesn't exist
    /// 2. Enable WAL mode for better concurrency
    /// 3. Run migrations to set up the schema
    ///
    /// SQLite replays any leftover WAL on open, so an unclean shutdown needs
    /// no extra recovery step.
    pub async fn new(db_path: &Path) -> Result<Self> {
        Self::connect(db_path, DEFAULT_MAX_CONNECTIONS).await
    }

    /// Open the database described by the `[core]` and `[store]` sections
    pub async fn from_config(config: &Config) -> Result<Self> {
        Self::connect(&config.database_path(), config.store.max_connections).await
    }

    /// Create a new database connection with an explicit pool size
    pub async fn connect(db_path: &Path, max_connections: u32) -> Result<Self> {
        info!("Initializing database at: {}", db_path.display());

        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }

        // Configure SQLite connection with WAL mode
        let connection_string = format!("sqlite:{}", db_path.display());
        let options = SqliteConnectOptions::from_str(&connection_string)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        debug!("Database connection established");

        let db = Self { pool };

        db.run_migrations().await?;

        Ok(db)
    }

    /// Run database migrations
    ///
    /// Migrations only use `IF NOT EXISTS` DDL and can be run repeatedly.
    async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::raw_sql(include_str!("../../migrations/001_initial.sql"))
            .execute(&self.pool)
            .await
            .context("Failed to execute migration 001_initial.sql")?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Flush the WAL to disk
    ///
    /// This should be called during graceful shutdown to ensure all
    /// pending writes are persisted to the database file.
    pub async fn flush_wal(&self) -> Result<()> {
        info!("Flushing WAL to disk");

        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .context("Failed to flush WAL")?;

        debug!("WAL flushed successfully");
        Ok(())
    }

    /// Close the database connection
    ///
    /// This flushes the WAL and closes all connections in the pool.
    pub async fn close(self) -> Result<()> {
        info!("Closing database connection");

        self.flush_wal().await?;
        self.pool.close().await;

        info!("Database connection closed");
        Ok(())
    }

    /// Create a conversation repository
    pub fn conversations(&self) -> ConversationRepository {
        ConversationRepository::new(self.pool.clone())
    }

    /// Create a modality repository
    pub fn modality(&self) -> ModalityRepository {
        ModalityRepository::new(self.pool.clone())
    }

    /// Create a persistence gateway backed by this database
    pub fn gateway(&self) -> SqliteGateway {
        SqliteGateway::new(self.conversations(), self.modality())
    }
}

/// Run one gateway call under a deadline
///
/// A call that outlives `limit` is abandoned and reported as
/// [`StoreError::Timeout`] carrying the operation name.
pub(crate) async fn with_deadline<T, F>(
    limit: std::time::Duration,
    operation: &'static str,
    call: F,
) -> StoreResult<T>
where
    F: std::future::Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(operation)),
    }
}

/// Convert a timestamp to the stored millisecond representation
pub(crate) fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

/// Convert a stored millisecond value back to a timestamp
pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .with_context(|| format!("Timestamp out of range: {}", ms))
}
