use async_trait::async_trait;
use roster_core::{Cursor, RawMember};

use crate::SourceError;

mod ndjson;

pub use ndjson::NdjsonFileSource;

/// One page returned by a listing source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub records: Vec<RawMember>,
    /// Position of the following page; `None` when the listing is exhausted.
    pub next_cursor: Option<Cursor>,
}

/// Paginated external listing of members.
///
/// `cursor` is `None` for the first page. Implementations must return the same page for the same
/// cursor so a retried or resumed fetch never skips records.
#[async_trait]
pub trait ListingSource: Send {
    /// # Errors
    /// Returns [`SourceError::Transient`] or [`SourceError::RateLimited`] for conditions worth
    /// retrying and [`SourceError::Fatal`] otherwise.
    async fn fetch_page(&mut self, cursor: Option<&Cursor>, page_size: u32) -> Result<Page, SourceError>;
}
