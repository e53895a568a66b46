//! SQLite metadata store and NZB blob cache
//!
//! The relational side tracks releases, their file roadmap, and the
//! persistent queue; raw NZB documents live as flat files in the blob
//! directory keyed by release id.

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use std::str::FromStr;

mod blob;
mod migrations;
mod queue_items;
mod releases;

pub use blob::BlobStore;

/// Handle to the SQLite metadata database
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database and run migrations.
    /// WAL journaling and foreign-key enforcement are always on.
    pub async fn new(config: &StoreConfig) -> Result<Self> {
        if let Some(parent) = config.sqlite_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::config(format!(
                    "failed to create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let options =
            SqliteConnectOptions::from_str(&format!("sqlite:{}", config.sqlite_path.display()))
                .map_err(|e| Error::config(format!("invalid database path: {e}")))?
                .create_if_missing(true)
                .foreign_keys(true)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePool::connect_with(options).await?;
        let store = Store { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the connection pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::path::Path;

    /// Open a throwaway store under a temp directory
    pub(crate) async fn open_store(dir: &Path) -> Store {
        let config = StoreConfig {
            sqlite_path: dir.join("test.db"),
            blob_dir: dir.join("blobs"),
        };
        Store::new(&config).await.unwrap()
    }
}
