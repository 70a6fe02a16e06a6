//! Errors that end a crawl

use metasync_source::SourceError;
use metasync_store::StoreError;

/// Why a crawl stopped before finishing
///
/// Per-object faults never surface here; they are logged, counted as
/// skipped and the crawl moves on.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("Schema worker failed: {0}")]
    Worker(String),

    #[error("Run cancelled")]
    Cancelled,
}
