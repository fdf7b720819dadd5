//! Pool construction and migrations.

use std::path::Path;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use tempo_domain::{Error, Result};

use crate::db_err;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Handle on the durable store. Cheap to clone; repositories borrow the pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) a SQLite database at `path` and run
    /// migrations.
    pub async fn from_path(path: impl AsRef<Path>, max_connections: u32) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::Internal(format!("db dir {parent:?}: {e}")))?;
            }
        }
        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(&url)
            .await
            .map_err(db_err)?;
        MIGRATOR.run(&pool).await.map_err(|e| Error::Internal(format!("migrate: {e}")))?;
        Ok(Self { pool })
    }

    /// A migrated in-memory database (tests). One connection, so every query
    /// sees the same memory store.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(db_err)?;
        MIGRATOR.run(&pool).await.map_err(|e| Error::Internal(format!("migrate: {e}")))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
