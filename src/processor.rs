//! Task preparation and finalization
//!
//! The boundary around the download engine: before a job runs, subjects
//! become sanitized filenames and `.part` files are pre-allocated; after
//! all segments land, `.part` files are truncated to their yEnc-declared
//! size and renamed into place. Heavy post-processing (PAR2, unpack) is
//! delegated to external tools and is not part of this crate.

use crate::config::DownloadConfig;
use crate::engine::FileWriter;
use crate::error::{Error, Result};
use crate::nzb::Nzb;
use crate::sanitize::{extract_password, sanitize_file_name};
use crate::types::{DownloadTask, Release, Segment};
use std::path::PathBuf;
use std::sync::Arc;

/// Prepares tasks for the engine and finalizes their output files
pub struct Processor {
    writer: Arc<FileWriter>,
    out_dir: PathBuf,
    cleanup_extensions: Vec<String>,
}

impl Processor {
    /// Build a processor bound to the configured output directory
    pub fn new(writer: Arc<FileWriter>, download: &DownloadConfig) -> Self {
        let cleanup_extensions = download
            .cleanup_extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .collect();
        Processor {
            writer,
            out_dir: download.out_dir.clone(),
            cleanup_extensions,
        }
    }

    /// Sanitize names, resolve passwords, and pre-allocate sparse
    /// `.part` files. Files whose final path already exists come back
    /// flagged complete and are neither pre-allocated nor dispatched.
    pub async fn prepare(&self, nzb: &Nzb, release: &Release) -> Result<Vec<Arc<DownloadTask>>> {
        tokio::fs::create_dir_all(&self.out_dir).await?;

        let nzb_password = nzb.password().map(str::to_string);
        let mut tasks = Vec::with_capacity(nzb.files.len());

        for (index, file) in nzb.files.iter().enumerate() {
            let clean_name = sanitize_file_name(&file.subject);
            let file_name = if clean_name.is_empty() {
                format!("file_{index:03}")
            } else {
                clean_name
            };

            let password = release
                .password
                .clone()
                .or_else(|| nzb_password.clone())
                .or_else(|| extract_password(&file_name))
                .or_else(|| extract_password(&file.subject));

            let segments = file
                .segments
                .iter()
                .map(|s| Arc::new(Segment::new(s.number, s.bytes, s.message_id.clone())))
                .collect();

            let task = DownloadTask::new(
                file_name,
                0,
                index,
                segments,
                &self.out_dir,
                password,
                file.subject.clone(),
                file.poster.clone(),
                file.date,
                file.groups.clone(),
            );

            if task.is_complete {
                tracing::info!(file = %task.file_name, "skipping, already completed");
                tasks.push(Arc::new(task));
                continue;
            }

            self.writer
                .pre_allocate(&task.part_path, task.size)
                .map_err(|e| {
                    Error::Io(std::io::Error::other(format!(
                        "failed to pre-allocate {}: {e}",
                        task.file_name
                    )))
                })?;

            tasks.push(Arc::new(task));
        }

        Ok(tasks)
    }

    /// Close handles, truncate each `.part` to the yEnc-declared size
    /// (removing pre-allocation padding), and rename into place.
    pub async fn finalize(&self, tasks: &[Arc<DownloadTask>]) -> Result<()> {
        for task in tasks {
            if task.is_complete {
                continue;
            }

            // Truncation target: the size the articles declared, when
            // any header carried one
            self.writer.close_file(&task.part_path, task.actual_size())?;

            if tokio::fs::metadata(&task.part_path).await.is_err() {
                tracing::warn!(file = %task.file_name, "part file missing, skipping finalize");
                continue;
            }

            tokio::fs::rename(&task.part_path, &task.final_path)
                .await
                .map_err(|e| {
                    Error::Io(std::io::Error::other(format!(
                        "failed to finalize {}: {e}",
                        task.file_name
                    )))
                })?;

            tracing::info!(file = %task.file_name, "completed");
        }
        Ok(())
    }

    /// Delete finalized files whose extension is on the cleanup list.
    /// Best-effort: runs only after a fully successful job.
    pub async fn cleanup(&self, tasks: &[Arc<DownloadTask>]) {
        for task in tasks {
            let Some(ext) = task
                .final_path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase())
            else {
                continue;
            };

            if self.cleanup_extensions.contains(&ext) {
                match tokio::fs::remove_file(&task.final_path).await {
                    Ok(()) => {
                        tracing::debug!(file = %task.file_name, "cleaned up");
                    }
                    Err(e) => {
                        tracing::warn!(file = %task.file_name, error = %e, "cleanup failed");
                    }
                }
            }
        }
    }
}
