use roster_core::{Cursor, IngestConfig, IngestionPhase, MemberRecord, RawMember, RunId};
use roster_store_sqlite::{CheckpointWrite, SqliteStore};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{CancellationToken, IngestError, ListingSource, Page, SourceError};

/// Progress of one `ingest` call, also published after every committed page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProgressReport {
    pub target_id: String,
    pub run_id: RunId,
    /// Records applied by this run.
    pub processed: u64,
    /// Records applied across all runs of the target, as recorded in its checkpoint.
    pub total_processed: u64,
    /// Pages committed by this run.
    pub committed: u64,
    /// Members that did not exist before this run.
    pub inserted: u64,
    pub rejected: u64,
    pub retries: u64,
    pub terminal: bool,
    pub cancelled: bool,
    /// Next cursor to fetch.
    pub cursor: Option<Cursor>,
}

/// Sequential pull, normalize, commit loop for one target at a time.
pub struct IngestEngine<S> {
    store: SqliteStore,
    source: S,
    config: IngestConfig,
    cancel: CancellationToken,
    progress: watch::Sender<ProgressReport>,
}

impl<S: ListingSource> IngestEngine<S> {
    /// # Errors
    /// Returns [`IngestError::Config`] when `config` fails validation.
    pub fn new(store: SqliteStore, source: S, config: IngestConfig) -> Result<Self, IngestError> {
        config.validate().map_err(IngestError::Config)?;
        let (progress, _) = watch::channel(ProgressReport::default());
        Ok(Self {
            store,
            source,
            config,
            cancel: CancellationToken::new(),
            progress,
        })
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Receiver that observes the report after each committed page.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ProgressReport> {
        self.progress.subscribe()
    }

    #[must_use]
    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    #[must_use]
    pub fn into_store(self) -> SqliteStore {
        self.store
    }

    /// Ingest `target_id` until the listing is exhausted or cancellation is observed.
    ///
    /// A target whose checkpoint is terminal is left untouched. Otherwise the run starts at the
    /// checkpoint cursor (or the beginning) and commits every page together with its checkpoint.
    ///
    /// # Errors
    /// Returns an [`IngestError`] carrying the target, cursor and page index when the source keeps
    /// failing, a page is rejected, or a commit fails. Committed pages stay committed.
    pub async fn ingest(&mut self, target_id: &str) -> Result<ProgressReport, IngestError> {
        let existing = self
            .store
            .load_checkpoint(target_id)
            .map_err(|source| IngestError::Checkpoint {
                target_id: target_id.to_string(),
                source,
            })?;

        let mut report = ProgressReport {
            target_id: target_id.to_string(),
            run_id: RunId::new(),
            ..ProgressReport::default()
        };
        let run_id = report.run_id;

        match IngestionPhase::of(existing.as_ref()) {
            IngestionPhase::Complete => {
                report.terminal = true;
                report.total_processed = existing.as_ref().map_or(0, |state| state.records_processed);
                info!(target_id, "ingestion already complete; nothing to do");
                self.progress.send_replace(report.clone());
                return Ok(report);
            }
            IngestionPhase::InProgress => {
                info!(
                    target_id,
                    %run_id,
                    cursor = ?existing.as_ref().and_then(|state| state.cursor.as_ref()),
                    "resuming ingestion from checkpoint"
                );
            }
            IngestionPhase::NotStarted => info!(target_id, %run_id, "starting ingestion"),
        }

        let mut cursor = existing.as_ref().and_then(|state| state.cursor.clone());
        let mut total_processed = existing.as_ref().map_or(0, |state| state.records_processed);
        let mut pages_total = existing.as_ref().map_or(0, |state| state.pages_committed);
        report.total_processed = total_processed;
        report.cursor.clone_from(&cursor);
        // Set while committed pages are ahead of the stored checkpoint.
        let mut checkpoint_behind = false;

        loop {
            if self.cancel.is_cancelled() {
                if checkpoint_behind {
                    let checkpoint = CheckpointWrite {
                        target_id,
                        cursor: cursor.as_ref(),
                        records_processed: total_processed,
                        pages_committed: pages_total,
                        page_size: self.config.page_size,
                        run_id,
                        terminal: false,
                    };
                    self.store.commit_checkpoint(&checkpoint).map_err(|source| {
                        IngestError::Checkpoint {
                            target_id: target_id.to_string(),
                            source,
                        }
                    })?;
                }
                report.cancelled = true;
                info!(target_id, %run_id, processed = report.processed, "ingestion cancelled between pages");
                self.progress.send_replace(report.clone());
                return Ok(report);
            }

            let page_index = pages_total;
            let page = self
                .fetch_with_retry(target_id, cursor.as_ref(), page_index, &mut report)
                .await?;

            let total = page.records.len();
            let records = normalize_page(target_id, cursor.as_ref(), page_index, &page.records);
            let rejected = total - records.len();
            if self.config.page_is_rejected(rejected, total) {
                return Err(IngestError::PageRejected {
                    target_id: target_id.to_string(),
                    cursor,
                    page_index,
                    rejected,
                    total,
                });
            }

            let applied = records.len() as u64;
            let terminal = page.next_cursor.is_none();
            let pages_in_run = report.committed + 1;
            let checkpoint = CheckpointWrite {
                target_id,
                cursor: page.next_cursor.as_ref(),
                records_processed: total_processed + applied,
                pages_committed: pages_total + 1,
                page_size: self.config.page_size,
                run_id,
                terminal,
            };
            let write_checkpoint = terminal || self.config.checkpoint_due(pages_in_run);
            let inserted = self
                .store
                .commit_page(&records, write_checkpoint.then_some(&checkpoint))
                .map_err(|source| IngestError::StorageCommit {
                    target_id: target_id.to_string(),
                    cursor: cursor.clone(),
                    page_index,
                    source,
                })?;

            checkpoint_behind = !write_checkpoint;
            total_processed += applied;
            pages_total += 1;
            report.processed += applied;
            report.total_processed = total_processed;
            report.committed = pages_in_run;
            report.inserted += inserted as u64;
            report.rejected += rejected as u64;
            report.terminal = terminal;
            report.cursor.clone_from(&page.next_cursor);
            self.progress.send_replace(report.clone());

            if terminal {
                info!(
                    target_id,
                    %run_id,
                    processed = report.processed,
                    total_processed,
                    pages = pages_total,
                    "ingestion complete"
                );
                return Ok(report);
            }

            cursor = page.next_cursor;
            let delay = self.config.inter_page_delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    async fn fetch_with_retry(
        &mut self,
        target_id: &str,
        cursor: Option<&Cursor>,
        page_index: u64,
        report: &mut ProgressReport,
    ) -> Result<Page, IngestError> {
        let policy = &self.config.retry;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let err = match self.source.fetch_page(cursor, self.config.page_size).await {
                Ok(page) => return Ok(page),
                Err(SourceError::Fatal(message)) => {
                    return Err(IngestError::FatalSource {
                        target_id: target_id.to_string(),
                        cursor: cursor.cloned(),
                        page_index,
                        message,
                    });
                }
                Err(err) => err,
            };

            if attempts >= policy.max_attempts {
                return Err(IngestError::TransientSource {
                    target_id: target_id.to_string(),
                    cursor: cursor.cloned(),
                    page_index,
                    attempts,
                    message: err.to_string(),
                });
            }

            let mut delay = policy.backoff_for(attempts);
            if let SourceError::RateLimited { retry_after } = &err {
                delay = delay.max(*retry_after);
            }
            warn!(
                target_id,
                page_index,
                cursor = ?cursor,
                attempt = attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "transient source failure; retrying same page"
            );
            report.retries += 1;
            tokio::time::sleep(delay).await;
        }
    }
}

fn normalize_page(
    target_id: &str,
    cursor: Option<&Cursor>,
    page_index: u64,
    raw: &[RawMember],
) -> Vec<MemberRecord> {
    let seen_at = OffsetDateTime::now_utc();
    raw.iter()
        .enumerate()
        .filter_map(|(position, member)| match member.normalize(target_id, seen_at) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(
                    target_id,
                    page_index,
                    position,
                    cursor = ?cursor,
                    error = %err,
                    "dropping invalid listing record"
                );
                None
            }
        })
        .collect()
}
