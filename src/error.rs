//! Error types for nzb-dl
//!
//! One crate-wide error enum covering the whole fetch-decode-write
//! pipeline. The worker pool's retry collector keys off the variant:
//! [`Error::ProviderBusy`] re-enqueues without consuming the retry
//! budget, everything else counts toward it.

use thiserror::Error;

/// Result type alias for nzb-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nzb-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "servers[0].host")
        key: Option<String>,
    },

    /// TCP/TLS/NNTP protocol failure; retriable at the segment level
    #[error("transport error: {0}")]
    Transport(String),

    /// NNTP 430 — the article does not exist on the provider(s) asked
    #[error("article not found")]
    ArticleNotFound,

    /// Every provider is at its connection cap; retry shortly
    #[error("all providers busy")]
    ProviderBusy,

    /// Decoded bytes do not match the yEnc-declared CRC32
    #[error("checksum mismatch: expected {expected:08X}, got {actual:08X}")]
    ChecksumMismatch {
        /// CRC32 parsed from the yEnc trailer (0 when the trailer is absent)
        expected: u32,
        /// CRC32 accumulated over the decoded bytes
        actual: u32,
    },

    /// The article body contained no `=ybegin` line
    #[error("yenc header not found")]
    HeaderNotFound,

    /// Local file I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite store failure
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Malformed or structurally invalid NZB document
    #[error("invalid NZB: {0}")]
    InvalidNzb(String),

    /// Cooperative cancellation fired
    #[error("operation cancelled")]
    Cancelled,

    /// One or more segments exhausted their retries; the job ends Failed
    /// but every other segment was still driven to completion
    #[error("{failed} segment(s) failed permanently")]
    SegmentsFailed {
        /// Number of segments that ran out of retries
        failed: usize,
    },

    /// Referenced entity (release, queue item, blob) does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// A queue job ended in the Failed state; carries the persisted
    /// error string
    #[error("job failed: {0}")]
    JobFailed(String),
}

impl Error {
    /// Shorthand for a config error without a key
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: None,
        }
    }

    /// True for [`Error::ProviderBusy`] — the only error that re-enqueues
    /// without incrementing the retry counter
    pub fn is_provider_busy(&self) -> bool {
        matches!(self, Error::ProviderBusy)
    }

    /// True when the error is (or wraps) a cooperative cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
