//! Release metadata and file-roadmap persistence

use crate::error::Result;
use crate::types::{DownloadTask, Release};
use chrono::{DateTime, Utc};
use sqlx::Row;
use std::sync::Arc;

use super::Store;

impl Store {
    /// Insert or update release rows. The poster is normalized into the
    /// `posters` table; `file_hash` only ever moves from empty to set
    /// (backfill on first hydration).
    pub async fn upsert_releases(&self, releases: &[&Release]) -> Result<()> {
        if releases.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool().begin().await?;

        for release in releases {
            let poster_id: Option<i64> = match release.poster.as_deref() {
                Some(name) if !name.is_empty() => {
                    let id = sqlx::query_scalar(
                        r#"
                        INSERT INTO posters (name) VALUES (?)
                        ON CONFLICT(name) DO UPDATE SET name = name
                        RETURNING id
                        "#,
                    )
                    .bind(name)
                    .fetch_one(&mut *tx)
                    .await?;
                    Some(id)
                }
                _ => None,
            };

            sqlx::query(
                r#"
                INSERT INTO releases
                    (id, file_hash, poster_id, title, size, password, guid,
                     source, publish_date, category, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    file_hash = CASE WHEN excluded.file_hash != '' THEN excluded.file_hash
                                     ELSE releases.file_hash END,
                    poster_id = COALESCE(excluded.poster_id, releases.poster_id),
                    title = excluded.title,
                    size = excluded.size,
                    password = COALESCE(excluded.password, releases.password),
                    category = COALESCE(excluded.category, releases.category)
                "#,
            )
            .bind(&release.id)
            .bind(&release.file_hash)
            .bind(poster_id)
            .bind(&release.title)
            .bind(release.size)
            .bind(&release.password)
            .bind(&release.guid)
            .bind(&release.source)
            .bind(release.publish_date.map(|d| d.timestamp()))
            .bind(&release.category)
            .bind(Utc::now().timestamp())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Fetch one release by id
    pub async fn get_release(&self, id: &str) -> Result<Option<Release>> {
        let row = sqlx::query(
            r#"
            SELECT r.id, r.file_hash, r.title, r.size, r.password, r.guid,
                   r.source, r.publish_date, r.category, p.name AS poster_name
            FROM releases r
            LEFT JOIN posters p ON r.poster_id = p.id
            WHERE r.id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(|row| release_from_row(&row)))
    }

    /// Persist the per-file roadmap for a release, including newsgroup
    /// associations through the junction table.
    pub async fn save_release_files(
        &self,
        release_id: &str,
        tasks: &[Arc<DownloadTask>],
    ) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        for task in tasks {
            let file_id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO release_files
                    (release_id, filename, size, file_index, is_pars, subject, date)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(release_id, filename) DO UPDATE SET size = excluded.size
                RETURNING id
                "#,
            )
            .bind(release_id)
            .bind(&task.file_name)
            .bind(task.size as i64)
            .bind(task.index as i64)
            .bind(task.is_pars)
            .bind(&task.subject)
            .bind(task.date)
            .fetch_one(&mut *tx)
            .await?;

            for group in &task.groups {
                let group_id: i64 = sqlx::query_scalar(
                    r#"
                    INSERT INTO groups (name) VALUES (?)
                    ON CONFLICT(name) DO UPDATE SET name = name
                    RETURNING id
                    "#,
                )
                .bind(group)
                .fetch_one(&mut *tx)
                .await?;

                sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO release_file_groups (release_file_id, group_id)
                    VALUES (?, ?)
                    "#,
                )
                .bind(file_id)
                .bind(group_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

pub(super) fn release_from_row(row: &sqlx::sqlite::SqliteRow) -> Release {
    let publish_date: Option<i64> = row.try_get("publish_date").ok().flatten();
    Release {
        id: row.try_get("id").unwrap_or_default(),
        file_hash: row.try_get("file_hash").unwrap_or_default(),
        title: row.try_get("title").unwrap_or_default(),
        password: row.try_get("password").ok().flatten(),
        guid: row
            .try_get::<Option<String>, _>("guid")
            .ok()
            .flatten()
            .unwrap_or_default(),
        source: row
            .try_get::<Option<String>, _>("source")
            .ok()
            .flatten()
            .unwrap_or_default(),
        size: row.try_get("size").unwrap_or_default(),
        publish_date: publish_date.and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0)),
        category: row.try_get("category").ok().flatten(),
        poster: row.try_get("poster_name").ok().flatten(),
    }
}
