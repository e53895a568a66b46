//! Persistent queue rows
//!
//! The full row is written on every status transition; `bytes_written`
//! is refreshed opportunistically from the progress ticker, not per
//! segment. Terminal rows are retained, never deleted by the engine.

use crate::error::Result;
use crate::types::{JobStatus, QueueItem, Release};
use chrono::{DateTime, Utc};
use sqlx::Row;
use std::sync::atomic::Ordering;

use super::Store;
use super::releases::release_from_row;

impl Store {
    /// Insert or update the row for one queue item
    pub async fn save_queue_item(&self, item: &QueueItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO queue_items (id, release_id, status, error, bytes_written, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                error = excluded.error,
                bytes_written = excluded.bytes_written
            "#,
        )
        .bind(&item.id)
        .bind(&item.release_id)
        .bind(item.status().as_str())
        .bind(item.error())
        .bind(item.bytes_written.load(Ordering::Relaxed) as i64)
        .bind(item.created_at.timestamp())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Refresh only the progress column
    pub async fn update_bytes_written(&self, id: &str, bytes: u64) -> Result<()> {
        sqlx::query("UPDATE queue_items SET bytes_written = ? WHERE id = ?")
            .bind(bytes as i64)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// All non-terminal items with their releases, FIFO by KSUID
    pub async fn get_active_queue_items(&self) -> Result<Vec<QueueItem>> {
        let rows = sqlx::query(
            r#"
            SELECT q.id AS queue_id, q.status, q.error, q.created_at AS queued_at,
                   r.id, r.file_hash, r.title, r.size, r.password, r.guid,
                   r.source, r.publish_date, r.category, p.name AS poster_name
            FROM queue_items q
            JOIN releases r ON q.release_id = r.id
            LEFT JOIN posters p ON r.poster_id = p.id
            WHERE q.status NOT IN ('completed', 'failed')
            ORDER BY q.id ASC
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        let items = rows
            .iter()
            .map(|row| {
                let release: Release = release_from_row(row);
                let created_at: i64 = row.try_get("queued_at").unwrap_or_default();
                QueueItem::from_row(
                    row.try_get("queue_id").unwrap_or_default(),
                    release,
                    JobStatus::from_str_lossy(
                        &row.try_get::<String, _>("status").unwrap_or_default(),
                    ),
                    row.try_get("error").ok().flatten(),
                    DateTime::<Utc>::from_timestamp(created_at, 0).unwrap_or_else(Utc::now),
                )
            })
            .collect();

        Ok(items)
    }

    /// Load one persisted item by id
    pub async fn get_queue_item(&self, id: &str) -> Result<Option<QueueItem>> {
        let row = sqlx::query(
            r#"
            SELECT q.id AS queue_id, q.status, q.error, q.created_at AS queued_at,
                   r.id, r.file_hash, r.title, r.size, r.password, r.guid,
                   r.source, r.publish_date, r.category, p.name AS poster_name
            FROM queue_items q
            JOIN releases r ON q.release_id = r.id
            LEFT JOIN posters p ON r.poster_id = p.id
            WHERE q.id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(|row| {
            let release = release_from_row(&row);
            let created_at: i64 = row.try_get("queued_at").unwrap_or_default();
            QueueItem::from_row(
                row.try_get("queue_id").unwrap_or_default(),
                release,
                JobStatus::from_str_lossy(&row.try_get::<String, _>("status").unwrap_or_default()),
                row.try_get("error").ok().flatten(),
                DateTime::<Utc>::from_timestamp(created_at, 0).unwrap_or_else(Utc::now),
            )
        }))
    }

    /// Reset rows stranded in a non-terminal state by an unclean exit,
    /// so they are retried on the next run.
    pub async fn reset_stuck_queue_items(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'pending', error = 'Unexpected shutdown'
            WHERE status IN ('pending', 'downloading', 'processing')
            "#,
        )
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}
