use std::time::Duration;

use roster_core::{Cursor, KernelError};

/// Failure reported by a [`crate::ListingSource`].
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("transient source error: {0}")]
    Transient(String),
    #[error("source rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("fatal source error: {0}")]
    Fatal(String),
}

impl SourceError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }
}

/// Why an ingestion run stopped early. Every variant leaves committed state intact; rerunning
/// resumes from the last checkpoint.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("invalid ingest configuration: {0}")]
    Config(#[source] KernelError),
    #[error(
        "source for {target_id} still failing at page {page_index} (cursor {}) after {attempts} attempts: {message}",
        describe(.cursor.as_ref())
    )]
    TransientSource {
        target_id: String,
        cursor: Option<Cursor>,
        page_index: u64,
        attempts: u32,
        message: String,
    },
    #[error(
        "source for {target_id} failed at page {page_index} (cursor {}): {message}",
        describe(.cursor.as_ref())
    )]
    FatalSource {
        target_id: String,
        cursor: Option<Cursor>,
        page_index: u64,
        message: String,
    },
    #[error(
        "page {page_index} of {target_id} (cursor {}) rejected: {rejected} of {total} records invalid",
        describe(.cursor.as_ref())
    )]
    PageRejected {
        target_id: String,
        cursor: Option<Cursor>,
        page_index: u64,
        rejected: usize,
        total: usize,
    },
    #[error(
        "failed to commit page {page_index} of {target_id} (cursor {})",
        describe(.cursor.as_ref())
    )]
    StorageCommit {
        target_id: String,
        cursor: Option<Cursor>,
        page_index: u64,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to read checkpoint for {target_id}")]
    Checkpoint {
        target_id: String,
        #[source]
        source: anyhow::Error,
    },
}

impl IngestError {
    #[must_use]
    pub fn target_id(&self) -> Option<&str> {
        match self {
            Self::Config(_) => None,
            Self::TransientSource { target_id, .. }
            | Self::FatalSource { target_id, .. }
            | Self::PageRejected { target_id, .. }
            | Self::StorageCommit { target_id, .. }
            | Self::Checkpoint { target_id, .. } => Some(target_id),
        }
    }
}

fn describe(cursor: Option<&Cursor>) -> &str {
    cursor.map_or("start", Cursor::as_str)
}
