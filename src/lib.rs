//! # nzb-dl
//!
//! Headless Usenet download engine: given an NZB manifest, reconstruct
//! the original files on disk with integrity guarantees, tolerating
//! per-article failures and exploiting every configured provider
//! connection.
//!
//! ## Architecture
//!
//! A persistent [`queue::QueueManager`] drains jobs one at a time. Each
//! job hydrates into per-file tasks, whose segments flow through a
//! bounded worker pool: fetch via the [`nntp::ProviderManager`]
//! (priority failover, per-server connection budgets), decode and
//! CRC-verify with the streaming [`yenc::YencDecoder`], then land at
//! their absolute offsets through the [`engine::FileWriter`]. Completed
//! `.part` files are truncated to their declared size and renamed into
//! place.
//!
//! ## Quick start
//!
//! ```no_run
//! use nzb_dl::config::Config;
//! use nzb_dl::engine::{Downloader, FileWriter};
//! use nzb_dl::nntp::ProviderManager;
//! use nzb_dl::processor::Processor;
//! use nzb_dl::queue::QueueManager;
//! use nzb_dl::store::{BlobStore, Store};
//! use std::sync::Arc;
//!
//! # async fn run() -> nzb_dl::Result<()> {
//! let config = Config::load("config.yaml")?;
//!
//! let store = Arc::new(Store::new(&config.store).await?);
//! let blobs = Arc::new(BlobStore::new(&config.store.blob_dir).await?);
//! let providers = Arc::new(ProviderManager::new(&config.servers).await?);
//! let writer = Arc::new(FileWriter::new());
//! let downloader = Arc::new(Downloader::new(providers, writer.clone()));
//! let processor = Arc::new(Processor::new(writer, &config.download));
//! let queue = QueueManager::new(store, blobs, downloader, processor);
//!
//! queue.recover_on_startup().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types and YAML loading
pub mod config;
/// Download engine: worker pool and file writer
pub mod engine;
/// Error types
pub mod error;
/// Structured logging setup
pub mod logging;
/// NNTP transport, provider pool, and failover routing
pub mod nntp;
/// NZB document model and parser
pub mod nzb;
/// Task preparation and finalization
pub mod processor;
/// Persistent job queue and scheduler
pub mod queue;
/// Subject sanitization and password extraction
pub mod sanitize;
/// SQLite metadata store and NZB blob cache
pub mod store;
/// Core domain types
pub mod types;
/// Streaming yEnc decoder
pub mod yenc;

pub use error::{Error, Result};

/// Wait for a termination signal.
///
/// - **Unix:** SIGTERM or SIGINT, with fallbacks if registration fails.
/// - **Elsewhere:** Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn wait_for_shutdown_signal() {
    imp::wait_for_signal().await;
}

#[cfg(unix)]
mod imp {
    pub(super) async fn wait_for_signal() {
        use tokio::signal::unix::{SignalKind, signal};

        // Registration can fail in restricted environments; degrade to
        // whatever handler is available.
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                    _ = sigint.recv() => tracing::info!("received SIGINT"),
                }
            }
            (Ok(mut sigterm), Err(e)) => {
                tracing::warn!(error = %e, "no SIGINT handler, waiting for SIGTERM only");
                sigterm.recv().await;
            }
            (Err(e), Ok(mut sigint)) => {
                tracing::warn!(error = %e, "no SIGTERM handler, waiting for SIGINT only");
                sigint.recv().await;
            }
            (Err(_), Err(_)) => {
                tracing::error!("could not register signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    pub(super) async fn wait_for_signal() {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
        }
    }
}
