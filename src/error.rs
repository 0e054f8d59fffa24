use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CellStoreError {
    #[error("invalid dataset prefix: {0}")]
    InvalidDataset(String),

    #[error("invalid domain: {0} (expected gex or pert)")]
    InvalidDomain(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupt fragment {locator}: {message}")]
    CorruptFragment { locator: String, message: String },

    #[error("{locator}: missing key columns {}", missing.join(", "))]
    MissingKeyColumns {
        locator: String,
        missing: Vec<String>,
    },

    #[error("storage backend unavailable: {0}")]
    #[diagnostic(help("check object-store credentials and network, then retry"))]
    BackendUnavailable(String),

    #[error("remote storage requested but S3_BUCKET_URI is not set")]
    MissingBucket,

    #[error("invalid row filter: {0}")]
    InvalidFilter(String),

    #[error("query execution failed: {0}")]
    Execution(String),

    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    #[error("background worker queue is full")]
    QueueFull,

    #[error("backfill failed: {0}")]
    Backfill(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl CellStoreError {
    pub fn corrupt(locator: impl ToString, message: impl ToString) -> Self {
        Self::CorruptFragment {
            locator: locator.to_string(),
            message: message.to_string(),
        }
    }

    /// Errors a caller may reasonably retry without changing the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable(_) | Self::Timeout(_) | Self::QueueFull
        )
    }
}
