//! Schema migrations, applied in order at startup

use crate::error::Result;
use sqlx::SqliteConnection;

use super::Store;

impl Store {
    pub(super) async fn run_migrations(&self) -> Result<()> {
        let mut conn = self.pool().acquire().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await?;

        let current: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
            .fetch_one(&mut *conn)
            .await?;
        let current = current.unwrap_or(0);

        if current < 1 {
            Self::migrate_v1(&mut conn).await?;
        }

        Ok(())
    }

    /// v1: base schema — releases, file roadmap, groups, queue
    async fn migrate_v1(conn: &mut SqliteConnection) -> Result<()> {
        tracing::info!("applying database migration v1");

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS posters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS releases (
                id TEXT PRIMARY KEY,
                file_hash TEXT NOT NULL DEFAULT '',
                poster_id INTEGER REFERENCES posters(id),
                title TEXT NOT NULL,
                size INTEGER NOT NULL DEFAULT 0,
                password TEXT,
                guid TEXT,
                source TEXT,
                publish_date INTEGER,
                category TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS groups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS release_files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                release_id TEXT NOT NULL REFERENCES releases(id) ON DELETE CASCADE,
                filename TEXT NOT NULL,
                size INTEGER NOT NULL DEFAULT 0,
                file_index INTEGER NOT NULL DEFAULT 0,
                is_pars INTEGER NOT NULL DEFAULT 0,
                subject TEXT,
                date INTEGER,
                UNIQUE (release_id, filename)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS release_file_groups (
                release_file_id INTEGER NOT NULL REFERENCES release_files(id) ON DELETE CASCADE,
                group_id INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
                PRIMARY KEY (release_file_id, group_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS queue_items (
                id TEXT PRIMARY KEY,
                release_id TEXT NOT NULL REFERENCES releases(id),
                status TEXT NOT NULL,
                error TEXT,
                bytes_written INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_queue_items_status ON queue_items(status)",
            "CREATE INDEX IF NOT EXISTS idx_release_files_release ON release_files(release_id)",
        ];

        for sql in statements {
            sqlx::query(sql).execute(&mut *conn).await?;
        }

        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (1, ?)")
            .bind(chrono::Utc::now().timestamp())
            .execute(&mut *conn)
            .await?;

        Ok(())
    }
}
