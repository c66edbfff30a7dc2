//! SQLite connection pool management.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

/// Database connection pool manager.
///
/// Manages the SQLite connection pool with WAL mode enabled for better
/// concurrency. Handles connection lifecycle, migrations, and configuration.
pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    /// Create a new connection pool with WAL mode enabled.
    ///
    /// `database_url` is a SQLite URL such as `sqlite:swarmguard.db` or
    /// `sqlite::memory:`.
    pub async fn new(database_url: &str) -> Result<Self> {
        let in_memory = database_url.contains(":memory:");
        let options = SqliteConnectOptions::from_str(database_url)
            .context("invalid database URL")?
            .journal_mode(if in_memory {
                SqliteJournalMode::Memory
            } else {
                SqliteJournalMode::Wal
            })
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        // An in-memory database exists per connection, so the pool must be
        // pinned to a single never-expiring connection to stay coherent.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(10)
                .idle_timeout(Duration::from_secs(30))
        };

        let pool = pool_options
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .context("failed to create connection pool")?;

        Ok(Self { pool })
    }

    /// Run pending migrations. Safe to call repeatedly.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the pool gracefully. Should be called during shutdown.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// In-memory pool with migrations applied, for tests.
#[cfg(any(test, feature = "test-util"))]
pub async fn migrated_test_pool() -> Result<SqlitePool> {
    let db = DatabaseConnection::new("sqlite::memory:").await?;
    db.migrate().await?;
    Ok(db.pool().clone())
}
