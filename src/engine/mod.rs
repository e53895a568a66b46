//! Download engine: worker pool and file placement
//!
//! - [`worker`] — segment dispatch, retries, result collection
//! - [`writer`] — concurrent positional writes into sparse `.part` files

pub mod worker;
pub mod writer;

pub use writer::FileWriter;

use crate::error::Result;
use crate::nntp::ProviderManager;
use crate::types::QueueItem;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Drives all segments of a hydrated queue item to completion
pub struct Downloader {
    manager: Arc<ProviderManager>,
    writer: Arc<FileWriter>,
}

impl Downloader {
    /// Assemble the engine from its collaborators
    pub fn new(manager: Arc<ProviderManager>, writer: Arc<FileWriter>) -> Self {
        Downloader { manager, writer }
    }

    /// The file writer shared with the processor for finalization
    pub fn writer(&self) -> &Arc<FileWriter> {
        &self.writer
    }

    /// Download every remaining segment of the item's tasks.
    ///
    /// Tasks must already be hydrated and pre-allocated. On error the
    /// file handles are flushed and closed so `.part` files are in a
    /// resumable state; on success the processor closes them with the
    /// final truncation during finalize.
    pub async fn download(&self, item: &Arc<QueueItem>, cancel: &CancellationToken) -> Result<()> {
        let result = self.run_worker_pool(item, cancel).await;
        if result.is_err() {
            self.writer.close_all();
        }
        result
    }
}
