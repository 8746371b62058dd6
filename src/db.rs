//! Database connection and schema management.
//!
//! This module provides SQLite database connectivity with:
//! - Connection pool management
//! - WAL mode for concurrent reads
//! - Automatic migration execution
//! - In-place upgrade of legacy `downloads` tables that predate newer columns
//!
//! # Example
//!
//! ```no_run
//! use mediaqueue_core::Database;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(Path::new("downloads.sqlite3")).await?;
//! // Use db for queries...
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{info, instrument};

/// Default maximum number of connections in the pool.
/// Kept low for SQLite since it uses file-level locking.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// SQLite busy timeout in milliseconds.
/// Connections will wait this long before returning SQLITE_BUSY.
const BUSY_TIMEOUT_MS: u32 = 5000;

/// Columns added after the first release of the `downloads` table.
/// Older databases get these via `ALTER TABLE ... ADD COLUMN`.
const LEGACY_COLUMNS: &[(&str, &str)] = &[
    ("position", "INTEGER DEFAULT 0"),
    ("thumb_path", "TEXT"),
    ("uploader", "TEXT"),
    ("duration", "INTEGER"),
];

/// Database-related errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connection(#[from] sqlx::Error),

    /// Failed to run migrations.
    #[error("failed to run migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Database connection wrapper with connection pool.
///
/// Handles SQLite connection pooling, WAL mode configuration,
/// and automatic migration execution.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Creates a new database connection to the specified path.
    ///
    /// This will:
    /// 1. Create the database file if it doesn't exist
    /// 2. Enable WAL mode for concurrent reads
    /// 3. Run any pending migrations
    /// 4. Add columns missing from legacy tables, then create indexes
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the connection fails,
    /// or `DbError::Migration` if migrations fail.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn new(db_path: &Path) -> Result<Self, DbError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(&db_url)
            .await?;

        // Enable WAL mode for concurrent reads
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await?;

        // Set busy timeout to avoid immediate lock errors
        sqlx::query(&format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS}"))
            .execute(&pool)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        upgrade_schema(&pool).await?;

        Ok(Self { pool })
    }

    /// Creates an in-memory database for testing.
    ///
    /// The pool is pinned to a single connection that never expires, since
    /// every SQLite in-memory connection is its own database.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the connection fails,
    /// or `DbError::Migration` if migrations fail.
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        upgrade_schema(&pool).await?;

        Ok(Self { pool })
    }

    /// Returns a reference to the underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Checks if WAL mode is enabled.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the query fails.
    #[instrument(skip(self))]
    pub async fn is_wal_enabled(&self) -> Result<bool, DbError> {
        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&self.pool)
            .await?;

        Ok(result.0.to_lowercase() == "wal")
    }

    /// Gracefully closes all connections in the pool.
    ///
    /// After calling this method, the Database instance should not be used.
    #[instrument(skip(self))]
    pub async fn close(self) {
        self.pool.close().await;
    }
}

/// Brings a `downloads` table written by an older release up to date.
///
/// Indexes are created here rather than in the migration because the
/// position index cannot exist before the position column does.
async fn upgrade_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let existing: Vec<String> = sqlx::query("PRAGMA table_info(downloads)")
        .fetch_all(pool)
        .await?
        .iter()
        .map(|row| row.get::<String, _>("name"))
        .collect();

    for (column, decl) in LEGACY_COLUMNS {
        if existing.iter().any(|name| name == column) {
            continue;
        }
        info!(column, "adding missing column to downloads table");
        sqlx::query(&format!("ALTER TABLE downloads ADD COLUMN {column} {decl}"))
            .execute(pool)
            .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_downloads_status ON downloads(status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_downloads_position ON downloads(position)")
        .execute(pool)
        .await?;

    sqlx::query("UPDATE downloads SET position = id WHERE position IS NULL OR position = 0")
        .execute(pool)
        .await?;

    Ok(())
}
