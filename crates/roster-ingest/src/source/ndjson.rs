use std::path::{Path, PathBuf};

use async_trait::async_trait;
use roster_core::{Cursor, RawMember};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use super::{ListingSource, Page};
use crate::SourceError;

/// Listing read from a newline-delimited JSON export, one [`RawMember`] per line.
///
/// The cursor is the zero-based line offset of the next page. Lines that are not UTF-8 or do not
/// parse are handed on as identity-less records so the engine counts them as rejected instead of
/// silently skipping. Only I/O failures surface as source errors.
pub struct NdjsonFileSource {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    line: u64,
}

impl NdjsonFileSource {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            reader: None,
            line: 0,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn seek_to_line(&mut self, target: u64) -> Result<(), SourceError> {
        if self.reader.is_some() && self.line == target {
            return Ok(());
        }
        let file = File::open(&self.path).await.map_err(|err| {
            SourceError::Fatal(format!("failed to open {}: {err}", self.path.display()))
        })?;
        let mut reader = BufReader::new(file);
        let mut skipped = 0;
        let mut scratch = Vec::new();
        while skipped < target {
            scratch.clear();
            let read = reader
                .read_until(b'\n', &mut scratch)
                .await
                .map_err(|err| read_error(&self.path, &err))?;
            if read == 0 {
                break;
            }
            skipped += 1;
        }
        self.reader = Some(reader);
        self.line = skipped;
        Ok(())
    }
}

fn read_error(path: &Path, err: &std::io::Error) -> SourceError {
    SourceError::Transient(format!("failed to read {}: {err}", path.display()))
}

#[async_trait]
impl ListingSource for NdjsonFileSource {
    async fn fetch_page(&mut self, cursor: Option<&Cursor>, page_size: u32) -> Result<Page, SourceError> {
        let start = match cursor {
            None => 0,
            Some(cursor) => cursor.as_str().parse::<u64>().map_err(|err| {
                SourceError::Fatal(format!("invalid line cursor {cursor}: {err}"))
            })?,
        };
        self.seek_to_line(start).await?;

        let mut records = Vec::new();
        let mut buf = Vec::new();
        let mut consumed = 0_u32;
        let mut exhausted = false;
        while consumed < page_size {
            buf.clear();
            let read = match self.reader.as_mut() {
                Some(reader) => reader.read_until(b'\n', &mut buf).await,
                None => Ok(0),
            };
            let read = match read {
                Ok(read) => read,
                Err(err) => {
                    // Position is unknown after a failed read; reopen on the next attempt.
                    self.reader = None;
                    return Err(read_error(&self.path, &err));
                }
            };
            if read == 0 {
                exhausted = true;
                break;
            }
            self.line += 1;
            consumed += 1;

            let Ok(text) = std::str::from_utf8(&buf) else {
                warn!(path = %self.path.display(), line = self.line, "listing line is not valid UTF-8");
                records.push(RawMember::default());
                continue;
            };
            let line = text.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<RawMember>(line) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(path = %self.path.display(), line = self.line, error = %err, "unparseable listing line");
                    records.push(RawMember::default());
                }
            }
        }

        if !exhausted {
            exhausted = match self.reader.as_mut() {
                Some(reader) => reader
                    .fill_buf()
                    .await
                    .map_err(|err| read_error(&self.path, &err))?
                    .is_empty(),
                None => true,
            };
        }

        Ok(Page {
            records,
            next_cursor: (!exhausted).then(|| Cursor::new(self.line.to_string())),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn fixture(label: &str, body: impl AsRef<[u8]>) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "roster-ndjson-{label}-{}-{}.ndjson",
            std::process::id(),
            time::OffsetDateTime::now_utc().unix_timestamp_nanos()
        ));
        fs::write(&path, body).unwrap_or_else(|err| panic!("failed to write fixture: {err}"));
        path
    }

    #[tokio::test]
    async fn pages_follow_line_offsets() -> Result<(), SourceError> {
        let path = fixture(
            "pages",
            "{\"id\": 1}\n{\"id\": 2}\n\n{\"id\": 3}\nnot json\n",
        );
        let mut source = NdjsonFileSource::new(&path);

        let first = source.fetch_page(None, 2).await?;
        assert_eq!(first.records.len(), 2);
        assert_eq!(first.next_cursor, Some(Cursor::new("2")));

        let second = source.fetch_page(first.next_cursor.as_ref(), 2).await?;
        assert_eq!(second.records.iter().map(|r| r.id).collect::<Vec<_>>(), vec![Some(3)]);
        assert_eq!(second.next_cursor, Some(Cursor::new("4")));

        let third = source.fetch_page(second.next_cursor.as_ref(), 2).await?;
        assert_eq!(third.records, vec![RawMember::default()]);
        assert_eq!(third.next_cursor, None);

        // A fresh source resumes from a stored cursor.
        let mut resumed = NdjsonFileSource::new(&path);
        let again = resumed.fetch_page(Some(&Cursor::new("2")), 2).await?;
        assert_eq!(again, second);

        fs::remove_file(&path).unwrap_or_else(|err| panic!("failed to remove fixture: {err}"));
        Ok(())
    }

    #[tokio::test]
    async fn non_utf8_line_is_handed_on_as_rejectable_record() -> Result<(), SourceError> {
        let path = fixture("utf8", b"{\"id\": 1}\n\xff\xfe\n{\"id\": 3}\n");
        let mut source = NdjsonFileSource::new(&path);

        let first = source.fetch_page(None, 2).await?;
        let ids: Vec<Option<i64>> = first.records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![Some(1), None]);
        assert_eq!(first.records[1], RawMember::default());
        assert_eq!(first.next_cursor, Some(Cursor::new("2")));

        let second = source.fetch_page(first.next_cursor.as_ref(), 2).await?;
        assert_eq!(second.records.iter().map(|r| r.id).collect::<Vec<_>>(), vec![Some(3)]);
        assert_eq!(second.next_cursor, None);

        fs::remove_file(&path).unwrap_or_else(|err| panic!("failed to remove fixture: {err}"));
        Ok(())
    }

    #[tokio::test]
    async fn exact_multiple_of_page_size_ends_without_empty_page() -> Result<(), SourceError> {
        let path = fixture("exact", "{\"id\": 1}\n{\"id\": 2}\n");
        let mut source = NdjsonFileSource::new(&path);
        let page = source.fetch_page(None, 2).await?;
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.next_cursor, None);
        fs::remove_file(&path).unwrap_or_else(|err| panic!("failed to remove fixture: {err}"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_file_and_bad_cursor_are_fatal() {
        let mut missing = NdjsonFileSource::new("/nonexistent/roster/listing.ndjson");
        assert!(matches!(missing.fetch_page(None, 10).await, Err(SourceError::Fatal(_))));

        let path = fixture("cursor", "{\"id\": 1}\n");
        let mut source = NdjsonFileSource::new(&path);
        let result = source.fetch_page(Some(&Cursor::new("abc")), 10).await;
        assert!(matches!(result, Err(SourceError::Fatal(_))));
        fs::remove_file(&path).unwrap_or_else(|err| panic!("failed to remove fixture: {err}"));
    }
}
