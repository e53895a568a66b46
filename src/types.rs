//! Core domain types for nzb-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use svix_ksuid::{Ksuid, KsuidLike};
use tokio_util::sync::CancellationToken;

/// Job status within the persistent queue
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Queued and waiting for the scheduler
    Pending,
    /// Segments are being fetched
    Downloading,
    /// Download finished; finalize/cleanup in progress
    Processing,
    /// Terminal: every file renamed into place
    Completed,
    /// Terminal: failed or cancelled
    Failed,
}

impl JobStatus {
    /// Stable string form used in the `queue_items.status` column
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Downloading => "downloading",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Parse the database string form; unknown values map to Failed so
    /// corrupted rows surface visibly instead of re-running
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "pending" => JobStatus::Pending,
            "downloading" => JobStatus::Downloading,
            "processing" => JobStatus::Processing,
            "completed" => JobStatus::Completed,
            _ => JobStatus::Failed,
        }
    }

    /// Completed and Failed are sticky within a job run
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata for one NZB, whether ingested from an indexer or uploaded
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Release {
    /// Content-derived or composite SHA-256 id (64 hex chars)
    pub id: String,
    /// SHA-256 of the NZB bytes, backfilled after first hydration
    pub file_hash: String,
    /// Display title
    pub title: String,
    /// Archive password from NZB metadata, if any
    pub password: Option<String>,
    /// Indexer GUID (empty for manual uploads)
    pub guid: String,
    /// Indexer source id (empty for manual uploads)
    pub source: String,
    /// Declared size in bytes
    pub size: i64,
    /// Original posting date
    pub publish_date: Option<DateTime<Utc>>,
    /// Indexer category
    pub category: Option<String>,
    /// Poster from the first NZB file entry
    pub poster: Option<String>,
}

impl Release {
    /// Build a release for a manually uploaded NZB: the id is the
    /// SHA-256 of the raw bytes, which doubles as the dedup key.
    pub fn from_upload(nzb_bytes: &[u8], title: impl Into<String>) -> Self {
        let hash = release_id_from_bytes(nzb_bytes);
        Release {
            id: hash.clone(),
            file_hash: hash,
            title: title.into(),
            size: 0,
            ..Default::default()
        }
    }
}

/// SHA-256 fingerprint of raw NZB bytes, hex encoded
pub fn release_id_from_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Composite id for indexer results: SHA-256 over `source|guid`, so all
/// primary keys are a consistent 64-character hex string.
pub fn composite_release_id(source: &str, guid: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{source}|{guid}").as_bytes());
    format!("{:x}", hasher.finalize())
}

/// One article to fetch — a single chunk of a file in an NZB
#[derive(Debug)]
pub struct Segment {
    /// 1-based ordinal; ordinal order equals byte-offset order
    pub number: u32,
    /// Declared decoded size in bytes
    pub bytes: u64,
    /// Usenet message-id, stored without angle brackets
    pub message_id: String,
    /// Provider ids that returned 430 for this article
    missing_from: Mutex<HashSet<String>>,
}

impl Segment {
    /// Create a segment from NZB-declared fields
    pub fn new(number: u32, bytes: u64, message_id: impl Into<String>) -> Self {
        Segment {
            number,
            bytes,
            message_id: message_id.into(),
            missing_from: Mutex::new(HashSet::new()),
        }
    }

    /// Record a 430 from the given provider
    pub fn mark_missing_from(&self, provider_id: &str) {
        if let Ok(mut set) = self.missing_from.lock() {
            set.insert(provider_id.to_string());
        }
    }

    /// Has this provider already reported the article missing?
    pub fn is_missing_from(&self, provider_id: &str) -> bool {
        self.missing_from
            .lock()
            .map(|set| set.contains(provider_id))
            .unwrap_or(false)
    }

    /// Number of providers that reported 430
    pub fn missing_count(&self) -> usize {
        self.missing_from.lock().map(|set| set.len()).unwrap_or(0)
    }
}

/// A live per-file download unit, rebuilt on each hydration
#[derive(Debug)]
pub struct DownloadTask {
    /// Sanitized filename derived from the subject
    pub file_name: String,
    /// Original position in the NZB
    pub index: usize,
    /// Expected total size: sum of segment bytes at construction
    pub size: u64,
    /// `<out_dir>/<file_name>.part` — positional-write target
    pub part_path: PathBuf,
    /// `<out_dir>/<file_name>` — created by rename after completion
    pub final_path: PathBuf,
    /// True when `final_path` already existed at preparation time
    pub is_complete: bool,
    /// Archive password resolved from NZB metadata or `{{...}}` pattern
    pub password: Option<String>,
    /// Original subject line
    pub subject: String,
    /// Poster of the article set
    pub poster: String,
    /// Posting date (unix seconds) from the NZB
    pub date: i64,
    /// Newsgroups this file was posted to (GROUP hint order)
    pub groups: Vec<String>,
    /// True for PAR2 volumes (by filename)
    pub is_pars: bool,
    /// Ordered segments
    pub segments: Vec<std::sync::Arc<Segment>>,
    /// Size declared by the first yEnc header seen, 0 until known
    actual_size: AtomicU64,
}

impl DownloadTask {
    /// Construct a task. A non-positive `size` is recomputed from the
    /// segment list.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        file_name: String,
        mut size: u64,
        index: usize,
        segments: Vec<std::sync::Arc<Segment>>,
        out_dir: &Path,
        password: Option<String>,
        subject: String,
        poster: String,
        date: i64,
        groups: Vec<String>,
    ) -> Self {
        if size == 0 {
            size = segments.iter().map(|s| s.bytes).sum();
        }

        let final_path = out_dir.join(&file_name);
        let mut part_name = final_path.as_os_str().to_owned();
        part_name.push(".part");
        let is_pars = file_name.to_lowercase().ends_with(".par2");
        let is_complete = final_path.exists();

        DownloadTask {
            file_name,
            index,
            size,
            part_path: PathBuf::from(part_name),
            final_path,
            is_complete,
            password,
            subject,
            poster,
            date,
            groups,
            is_pars,
            segments,
            actual_size: AtomicU64::new(0),
        }
    }

    /// Record the size declared by a yEnc header (written by workers,
    /// read at finalize)
    pub fn set_actual_size(&self, size: u64) {
        self.actual_size.store(size, Ordering::Relaxed);
    }

    /// yEnc-declared size, or 0 when no header has been seen yet
    pub fn actual_size(&self) -> u64 {
        self.actual_size.load(Ordering::Relaxed)
    }
}

/// Interior-mutable portion of a queue item
#[derive(Debug)]
struct ItemState {
    status: JobStatus,
    error: Option<String>,
}

/// A persistent job: one whole-NZB download
#[derive(Debug)]
pub struct QueueItem {
    /// KSUID — time-ordered when sorted lexically, giving FIFO scheduling
    pub id: String,
    /// Foreign key into the releases table
    pub release_id: String,
    /// Denormalized release metadata
    pub release: Release,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    state: Mutex<ItemState>,
    /// Total bytes placed on disk so far (written by workers, read by UI)
    pub bytes_written: AtomicU64,
    /// Sum of task sizes, set at hydration
    pub total_bytes: AtomicU64,
    tasks: Mutex<Vec<std::sync::Arc<DownloadTask>>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl QueueItem {
    /// Create a Pending item for a release
    pub fn new(release: Release) -> Self {
        QueueItem {
            id: Ksuid::new(None, None).to_string(),
            release_id: release.id.clone(),
            release,
            created_at: Utc::now(),
            state: Mutex::new(ItemState {
                status: JobStatus::Pending,
                error: None,
            }),
            bytes_written: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
            cancel: Mutex::new(None),
        }
    }

    /// Rebuild an item from its persisted row
    pub fn from_row(
        id: String,
        release: Release,
        status: JobStatus,
        error: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        QueueItem {
            id,
            release_id: release.id.clone(),
            release,
            created_at,
            state: Mutex::new(ItemState { status, error }),
            bytes_written: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
            cancel: Mutex::new(None),
        }
    }

    /// Current status
    pub fn status(&self) -> JobStatus {
        self.state
            .lock()
            .map(|s| s.status)
            .unwrap_or(JobStatus::Failed)
    }

    /// Transition to a new status
    pub fn set_status(&self, status: JobStatus) {
        if let Ok(mut s) = self.state.lock() {
            s.status = status;
        }
    }

    /// Terminal error string, if any
    pub fn error(&self) -> Option<String> {
        self.state.lock().ok().and_then(|s| s.error.clone())
    }

    /// Record an error string (does not change status by itself)
    pub fn set_error(&self, error: Option<String>) {
        if let Ok(mut s) = self.state.lock() {
            s.error = error;
        }
    }

    /// Hydrated tasks (empty until hydration)
    pub fn tasks(&self) -> Vec<std::sync::Arc<DownloadTask>> {
        self.tasks.lock().map(|t| t.clone()).unwrap_or_default()
    }

    /// Install the hydrated task list and derived total size
    pub fn set_tasks(&self, tasks: Vec<std::sync::Arc<DownloadTask>>) {
        let total: u64 = tasks.iter().filter(|t| !t.is_complete).map(|t| t.size).sum();
        self.total_bytes.store(total, Ordering::Relaxed);
        if let Ok(mut t) = self.tasks.lock() {
            *t = tasks;
        }
    }

    /// Install the cancellation handle for the current run
    pub fn set_cancel_token(&self, token: CancellationToken) {
        if let Ok(mut c) = self.cancel.lock() {
            *c = Some(token);
        }
    }

    /// Fire the cancellation handle, if a run is active
    pub fn cancel(&self) {
        if let Ok(guard) = self.cancel.lock()
            && let Some(token) = guard.as_ref()
        {
            token.cancel();
        }
    }
}
