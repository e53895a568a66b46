//! Persistent job queue and scheduler
//!
//! One scheduler loop per process drains the queue FIFO (KSUID order),
//! one item active at a time: hydrate from the blob store, download,
//! finalize, persist the outcome. Every status transition writes the
//! full row; progress bytes are persisted opportunistically from a
//! once-per-second ticker. On startup, rows stranded in a non-terminal
//! state are reset to Pending so an unclean shutdown only costs the
//! re-download of incomplete files (positional writes are idempotent).

use crate::engine::Downloader;
use crate::error::{Error, Result};
use crate::nzb;
use crate::processor::Processor;
use crate::store::{BlobStore, Store};
use crate::types::{JobStatus, QueueItem, release_id_from_bytes};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct QueueState {
    queue: Vec<Arc<QueueItem>>,
    active: Option<Arc<QueueItem>>,
}

/// Serializes whole-NZB jobs through the download pipeline
pub struct QueueManager {
    store: Arc<Store>,
    blobs: Arc<BlobStore>,
    downloader: Arc<Downloader>,
    processor: Arc<Processor>,
    state: std::sync::Mutex<QueueState>,
    wake_tx: mpsc::Sender<()>,
    wake_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl QueueManager {
    /// Assemble the manager from its collaborators
    pub fn new(
        store: Arc<Store>,
        blobs: Arc<BlobStore>,
        downloader: Arc<Downloader>,
        processor: Arc<Processor>,
    ) -> Self {
        // capacity-1 wake channel: concurrent enqueues coalesce into one
        // scheduler wakeup
        let (wake_tx, wake_rx) = mpsc::channel(1);
        QueueManager {
            store,
            blobs,
            downloader,
            processor,
            state: std::sync::Mutex::new(QueueState {
                queue: Vec::new(),
                active: None,
            }),
            wake_tx,
            wake_rx: tokio::sync::Mutex::new(wake_rx),
        }
    }

    /// Reset rows stranded by an unclean shutdown and reload the
    /// non-terminal queue. Returns the number of items loaded.
    pub async fn recover_on_startup(&self) -> Result<usize> {
        let reset = self.store.reset_stuck_queue_items().await?;
        if reset > 0 {
            tracing::warn!(count = reset, "reset stuck queue items to pending");
        }

        let items = self.store.get_active_queue_items().await?;
        let count = items.len();
        if let Ok(mut state) = self.state.lock() {
            state.queue = items.into_iter().map(Arc::new).collect();
        }
        if count > 0 {
            tracing::info!(count, "queue initialized from store");
            self.wake();
        }
        Ok(count)
    }

    /// Create a Pending item for a stored release and wake the scheduler
    pub async fn enqueue(&self, release_id: &str) -> Result<Arc<QueueItem>> {
        let release = self
            .store
            .get_release(release_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("release {release_id}")))?;

        let item = Arc::new(QueueItem::new(release));
        self.store.save_queue_item(&item).await?;

        if let Ok(mut state) = self.state.lock() {
            state.queue.push(item.clone());
        }
        self.wake();

        tracing::info!(id = %item.id, title = %item.release.title, "job enqueued");
        Ok(item)
    }

    fn wake(&self) {
        // a pending signal already guarantees a sweep
        let _ = self.wake_tx.try_send(());
    }

    /// Fire the cancellation handle of a queued or running item.
    /// Returns false when the item is unknown or already terminal.
    pub fn cancel(&self, id: &str) -> bool {
        let Ok(state) = self.state.lock() else {
            return false;
        };
        for item in &state.queue {
            if item.id == id {
                if item.status().is_terminal() {
                    return false;
                }
                item.cancel();
                return true;
            }
        }
        false
    }

    /// Snapshot of the live queue
    pub fn items(&self) -> Vec<Arc<QueueItem>> {
        self.state
            .lock()
            .map(|s| s.queue.clone())
            .unwrap_or_default()
    }

    /// The item currently being worked, if any
    pub fn active_item(&self) -> Option<Arc<QueueItem>> {
        self.state.lock().ok().and_then(|s| s.active.clone())
    }

    /// Scheduler loop: picks the oldest non-terminal item and drives it
    /// to a terminal state, until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            let next = {
                match self.state.lock() {
                    Ok(state) => state
                        .queue
                        .iter()
                        .find(|i| !i.status().is_terminal())
                        .cloned(),
                    Err(_) => None,
                }
            };

            let Some(item) = next else {
                let mut wake_rx = self.wake_rx.lock().await;
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    signal = wake_rx.recv() => {
                        if signal.is_none() {
                            return;
                        }
                        continue;
                    }
                }
            };

            if shutdown.is_cancelled() {
                return;
            }

            let job_token = shutdown.child_token();
            item.set_cancel_token(job_token.clone());
            if let Ok(mut state) = self.state.lock() {
                state.active = Some(item.clone());
            }

            let result = self.run_item(&item, &job_token).await;
            self.finalize_job(&item, result).await;

            if let Ok(mut state) = self.state.lock() {
                state.active = None;
                state.queue.retain(|i| i.id != item.id);
            }
        }
    }

    async fn run_item(&self, item: &Arc<QueueItem>, token: &CancellationToken) -> Result<()> {
        // HYDRATION
        if item.status() == JobStatus::Pending {
            if item.tasks().is_empty() {
                tracing::debug!(id = %item.id, title = %item.release.title, "hydrating job");
                self.hydrate(item).await?;
            }
            self.update_status(item, JobStatus::Downloading).await;
        }

        // DOWNLOAD
        if item.status() == JobStatus::Downloading {
            let tasks = item.tasks();
            if !tasks.is_empty() && tasks.iter().all(|t| t.is_complete) {
                tracing::info!(
                    title = %item.release.title,
                    "all files present on disk, skipping download"
                );
            } else {
                tracing::info!(
                    title = %item.release.title,
                    total_mb = item.total_bytes.load(Ordering::Relaxed) / 1024 / 1024,
                    "starting download"
                );
                let progress = self.spawn_progress_persister(item.clone(), token.clone());
                let result = self.downloader.download(item, token).await;
                progress.abort();
                result?;
            }

            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.update_status(item, JobStatus::Processing).await;
        }

        // POST-PROCESSING (finalize + cleanup; PAR2/unpack are external)
        if item.status() == JobStatus::Processing {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let tasks = item.tasks();
            self.processor.finalize(&tasks).await?;
            self.processor.cleanup(&tasks).await;
        }

        Ok(())
    }

    /// Resolve the NZB blob, parse it, build tasks, and persist the file
    /// roadmap plus the enriched release record.
    async fn hydrate(&self, item: &Arc<QueueItem>) -> Result<()> {
        let bytes = self.blobs.get(&item.release_id).await?;
        let nzb = nzb::parse(&bytes)?;
        let tasks = self.processor.prepare(&nzb, &item.release).await?;

        // backfill what ingestion could not know
        let mut release = item.release.clone();
        release.size = nzb.total_size() as i64;
        if release.file_hash.is_empty() {
            release.file_hash = release_id_from_bytes(&bytes);
        }
        if release.password.is_none() {
            release.password = nzb.password().map(str::to_string);
        }
        if release.poster.is_none() {
            release.poster = nzb.files.first().map(|f| f.poster.clone());
        }
        if let Err(e) = self.store.upsert_releases(&[&release]).await {
            tracing::warn!(error = %e, "failed to update release record");
        }
        if let Err(e) = self.store.save_release_files(&item.release_id, &tasks).await {
            tracing::warn!(error = %e, "failed to save file roadmap");
        }

        item.bytes_written.store(0, Ordering::Relaxed);
        item.set_tasks(tasks);
        Ok(())
    }

    async fn update_status(&self, item: &Arc<QueueItem>, status: JobStatus) {
        item.set_status(status);
        if let Err(e) = self.store.save_queue_item(item).await {
            tracing::warn!(id = %item.id, error = %e, "failed to persist status change");
        }
    }

    async fn finalize_job(&self, item: &Arc<QueueItem>, result: Result<()>) {
        match result {
            Ok(()) => {
                item.set_status(JobStatus::Completed);
                item.set_error(None);
                tracing::info!(title = %item.release.title, "job completed");
            }
            Err(e) => {
                item.set_status(JobStatus::Failed);
                let message = if e.is_cancelled() {
                    "Cancelled by user".to_string()
                } else {
                    e.to_string()
                };
                tracing::error!(title = %item.release.title, error = %message, "job failed");
                item.set_error(Some(message));
            }
        }

        if let Err(e) = self.store.save_queue_item(item).await {
            tracing::error!(id = %item.id, error = %e, "failed to persist terminal status");
        }
    }

    /// Persist `bytes_written` once per second while a download runs
    fn spawn_progress_persister(
        &self,
        item: Arc<QueueItem>,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = interval.tick() => {
                        let bytes = item.bytes_written.load(Ordering::Relaxed);
                        if let Err(e) = store.update_bytes_written(&item.id, bytes).await {
                            tracing::debug!(error = %e, "progress persist failed");
                        }
                    }
                }
            }
        })
    }
}
