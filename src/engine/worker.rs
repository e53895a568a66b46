//! Worker pool: segment dispatch, retry scheduling, result collection
//!
//! One pool serves one queue item. Workers drain a bounded `jobs`
//! channel, fetch through the provider manager, decode, verify, and
//! place bytes; results flow back to the collector which schedules
//! retries or books permanent failures. Permanent failures do not abort
//! the pool — every other segment still drains, so `.part` files hold
//! as much data as the providers could deliver.

use crate::error::{Error, Result};
use crate::nntp::Lease;
use crate::types::{DownloadTask, QueueItem, Segment};
use crate::yenc::YencDecoder;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::Downloader;

/// Retries per segment for data-path failures (busy is not counted)
const MAX_SEGMENT_RETRIES: u32 = 3;

/// Re-enqueue delay when every provider was at capacity
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(100);

/// One segment fetch assignment
#[derive(Clone)]
pub(crate) struct DownloadJob {
    pub(crate) segment: Arc<Segment>,
    pub(crate) task: Arc<DownloadTask>,
    /// Cumulative byte offset computed by the dispatcher; used when the
    /// article carries no `=ypart` header
    pub(crate) offset: u64,
    pub(crate) retry_count: u32,
}

/// Worker → collector result
struct SegmentResult {
    job: DownloadJob,
    error: Option<Error>,
}

impl Downloader {
    /// Run the pool until every counted segment completes or the scope
    /// is cancelled.
    pub(super) async fn run_worker_pool(
        &self,
        item: &Arc<QueueItem>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let tasks = item.tasks();
        let total_segments: usize = tasks
            .iter()
            .filter(|t| !t.is_complete)
            .map(|t| t.segments.len())
            .sum();

        if total_segments == 0 {
            return Ok(());
        }

        let capacity = self.manager.total_capacity();
        if capacity == 0 {
            return Err(Error::config(
                "no download capacity available: check server max_connections",
            ));
        }

        // Two extra workers keep someone parked at the semaphores so a
        // freed slot is picked up without a scheduling gap.
        let worker_count = capacity + 2;
        let buffer = worker_count * 2;

        let (jobs_tx, jobs_rx) = mpsc::channel::<DownloadJob>(buffer);
        let (results_tx, mut results_rx) = mpsc::channel::<SegmentResult>(buffer);
        let pool_token = cancel.child_token();

        tracing::debug!(
            total_segments,
            worker_count,
            buffer,
            "starting segment worker pool"
        );

        // Workers share the receiver behind a mutex; each locks only for
        // the dequeue itself.
        let jobs_rx = Arc::new(tokio::sync::Mutex::new(jobs_rx));
        let mut workers = JoinSet::new();
        for _ in 0..worker_count {
            let jobs_rx = jobs_rx.clone();
            let results_tx = results_tx.clone();
            let token = pool_token.clone();
            let item = item.clone();
            let engine = self.clone_parts();

            workers.spawn(async move {
                loop {
                    let job = tokio::select! {
                        _ = token.cancelled() => return,
                        job = async { jobs_rx.lock().await.recv().await } => job,
                    };
                    let Some(job) = job else { return };

                    let error = engine.process_segment(&item, &job, &token).await.err();
                    if results_tx.send(SegmentResult { job, error }).await.is_err() {
                        return;
                    }
                }
            });
        }
        drop(results_tx);

        // Dispatcher: NZB file order, then segment ordinal order
        let dispatch_tx = jobs_tx.clone();
        let dispatch_token = pool_token.clone();
        tokio::spawn(async move {
            for task in tasks {
                if task.is_complete {
                    tracing::debug!(file = %task.file_name, "skipping dispatch, already on disk");
                    continue;
                }
                let mut offset = 0u64;
                for segment in &task.segments {
                    let job = DownloadJob {
                        segment: segment.clone(),
                        task: task.clone(),
                        offset,
                        retry_count: 0,
                    };
                    tokio::select! {
                        _ = dispatch_token.cancelled() => return,
                        sent = dispatch_tx.send(job) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                    offset += segment.bytes;
                }
            }
        });

        // Collector: drive completion accounting and the retry policy
        let mut completed = 0usize;
        let mut failed_segments = 0usize;

        while completed < total_segments {
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    pool_token.cancel();
                    workers.shutdown().await;
                    return Err(Error::Cancelled);
                }
                result = results_rx.recv() => result,
            };
            let Some(result) = result else {
                // all workers gone; nothing more will arrive
                break;
            };

            let Some(error) = result.error else {
                completed += 1;
                continue;
            };

            if error.is_provider_busy() {
                // pool contention, not a data-path failure: quick retry
                // that does not touch the retry budget
                schedule_retry(
                    jobs_tx.clone(),
                    pool_token.clone(),
                    result.job,
                    BUSY_RETRY_DELAY,
                );
                continue;
            }

            if result.job.retry_count < MAX_SEGMENT_RETRIES {
                let mut job = result.job;
                job.retry_count += 1;
                let delay = Duration::from_secs(1u64 << job.retry_count);
                tracing::debug!(
                    message_id = %job.segment.message_id,
                    attempt = job.retry_count,
                    max = MAX_SEGMENT_RETRIES,
                    delay_secs = delay.as_secs(),
                    error = %error,
                    "segment retry scheduled"
                );
                schedule_retry(jobs_tx.clone(), pool_token.clone(), job, delay);
                continue;
            }

            tracing::error!(
                message_id = %result.job.segment.message_id,
                file = %result.job.task.file_name,
                error = %error,
                "segment permanently failed"
            );
            failed_segments += 1;
            completed += 1;
        }

        pool_token.cancel();
        drop(jobs_tx);
        workers.shutdown().await;

        if failed_segments > 0 {
            return Err(Error::SegmentsFailed {
                failed: failed_segments,
            });
        }
        Ok(())
    }

    /// Cheap handle for moving into worker tasks
    fn clone_parts(&self) -> WorkerEngine {
        WorkerEngine {
            manager: self.manager.clone(),
            writer: self.writer.clone(),
        }
    }
}

/// The slice of the engine a worker needs
struct WorkerEngine {
    manager: Arc<crate::nntp::ProviderManager>,
    writer: Arc<super::FileWriter>,
}

impl WorkerEngine {
    /// Fetch → decode → verify → place one segment
    async fn process_segment(
        &self,
        item: &QueueItem,
        job: &DownloadJob,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut lease = self
            .manager
            .fetch(&job.segment, &job.task.groups, cancel)
            .await?;

        // Whatever happens while decoding, the lease is closed so the
        // connection drains and the provider slot frees exactly once.
        let outcome = self.decode_and_write(item, job, &mut lease).await;
        lease.close().await;
        outcome
    }

    async fn decode_and_write(
        &self,
        item: &QueueItem,
        job: &DownloadJob,
        lease: &mut Lease,
    ) -> Result<()> {
        let mut decoder = YencDecoder::new(lease);
        decoder.discard_header().await?;

        if let Some(size) = decoder.file_size()
            && size > 0
        {
            job.task.set_actual_size(size);
        }

        // Prefer the article's own placement; fall back to the offset
        // the dispatcher computed from segment ordering.
        let write_offset = decoder.part_offset().unwrap_or(job.offset);

        // The buffer is bounded by the NZB-declared segment size; a
        // short read (truncated article) surfaces through CRC failure.
        let mut data = vec![0u8; job.segment.bytes as usize];
        let mut filled = 0;
        while filled < data.len() {
            let read = decoder.read(&mut data[filled..]).await?;
            if read == 0 {
                break;
            }
            filled += read;
        }

        decoder.verify()?;

        if filled > 0 {
            self.writer
                .write_at(&job.task.part_path, &data[..filled], write_offset)?;
            item.bytes_written.fetch_add(filled as u64, Ordering::Relaxed);
        }

        Ok(())
    }
}

/// Re-enqueue a job after `delay`, dropping it if the pool is cancelled
/// before the timer fires or the send completes.
fn schedule_retry(
    jobs_tx: mpsc::Sender<DownloadJob>,
    token: CancellationToken,
    job: DownloadJob,
    delay: Duration,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(delay) => {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = jobs_tx.send(job) => {}
                }
            }
        }
    });
}
