//! Pool setup and migrations. The `Store` capability itself lives in
//! `capability.rs`; row mapping helpers in `rows.rs`.

mod capability;
mod rows;

use std::str::FromStr;

use relay_core::error::RelayError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

/// Persistent store backed by SQLite.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect using an sqlx DSN (`sqlite:path/to.db`), creating the file
    /// and parent directory when missing, then run migrations.
    pub async fn connect(dsn: &str) -> Result<Self, RelayError> {
        let path = dsn.strip_prefix("sqlite:").unwrap_or(dsn);
        if path != ":memory:" {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        RelayError::Store(format!("failed to create data dir: {e}"))
                    })?;
                }
            }
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{path}"))
            .map_err(|e| RelayError::Store(format!("invalid dsn: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .map_err(|e| RelayError::Store(format!("failed to connect to sqlite: {e}")))?;

        Self::run_migrations(&pool).await?;
        info!("store initialized at {path}");
        Ok(Self { pool })
    }

    /// In-memory store for tests. Single connection so the database survives
    /// across queries.
    pub async fn connect_in_memory() -> Result<Self, RelayError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| RelayError::Store(format!("invalid dsn: {e}")))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .map_err(|e| RelayError::Store(format!("failed to connect: {e}")))?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply migrations, tracking applied names in `_migrations`.
    async fn run_migrations(pool: &SqlitePool) -> Result<(), RelayError> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS _migrations (
                name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )
        .execute(pool)
        .await
        .map_err(|e| RelayError::Store(format!("failed to create migrations table: {e}")))?;

        let migrations: &[(&str, &str)] =
            &[("001_init", include_str!("../../migrations/001_init.sql"))];

        for (name, sql) in migrations {
            let applied: Option<(String,)> =
                sqlx::query_as("SELECT name FROM _migrations WHERE name = ?")
                    .bind(name)
                    .fetch_optional(pool)
                    .await
                    .map_err(|e| RelayError::Store(format!("migration check failed: {e}")))?;
            if applied.is_some() {
                continue;
            }

            sqlx::raw_sql(sql)
                .execute(pool)
                .await
                .map_err(|e| RelayError::Store(format!("migration {name} failed: {e}")))?;
            sqlx::query("INSERT INTO _migrations (name) VALUES (?)")
                .bind(name)
                .execute(pool)
                .await
                .map_err(|e| RelayError::Store(format!("migration record failed: {e}")))?;
            info!("applied migration {name}");
        }

        Ok(())
    }
}
