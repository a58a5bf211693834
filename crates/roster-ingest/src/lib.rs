//! Resumable ingestion of paginated member listings into the roster store.
//!
//! [`IngestEngine`] pulls one page at a time from a [`ListingSource`], normalizes it, and commits
//! the page together with its checkpoint so an interrupted run resumes at the first page that was
//! not durably written.

mod cancel;
mod engine;
mod error;
pub mod source;

pub use cancel::CancellationToken;
pub use engine::{IngestEngine, ProgressReport};
pub use error::{IngestError, SourceError};
pub use source::{ListingSource, NdjsonFileSource, Page};
