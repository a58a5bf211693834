use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use roster_core::{
    Cursor, IngestConfig, IngestionPhase, MemberId, MemberQuery, MemberRecord, RawMember, RetryPolicy,
};
use roster_ingest::{
    CancellationToken, IngestEngine, IngestError, ListingSource, NdjsonFileSource, Page, SourceError,
};
use roster_store_sqlite::SqliteStore;
use time::OffsetDateTime;
use ulid::Ulid;

/// Pages addressed by index; the cursor is the index of the page to fetch.
struct ScriptedSource {
    pages: Vec<Vec<RawMember>>,
    failures: HashMap<usize, VecDeque<SourceError>>,
    calls: Arc<Mutex<Vec<Option<String>>>>,
    cancel_after_page: Option<(usize, CancellationToken)>,
}

impl ScriptedSource {
    fn new(pages: Vec<Vec<RawMember>>) -> Self {
        Self {
            pages,
            failures: HashMap::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
            cancel_after_page: None,
        }
    }

    fn fail_page(mut self, index: usize, errors: Vec<SourceError>) -> Self {
        self.failures.insert(index, errors.into());
        self
    }

    fn cancel_after(mut self, index: usize, token: CancellationToken) -> Self {
        self.cancel_after_page = Some((index, token));
        self
    }

    fn call_log(&self) -> Arc<Mutex<Vec<Option<String>>>> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl ListingSource for ScriptedSource {
    async fn fetch_page(&mut self, cursor: Option<&Cursor>, _page_size: u32) -> Result<Page, SourceError> {
        self.calls
            .lock()
            .unwrap_or_else(|err| panic!("call log poisoned: {err}"))
            .push(cursor.map(|c| c.as_str().to_string()));

        let index = match cursor {
            None => 0,
            Some(cursor) => cursor
                .as_str()
                .parse::<usize>()
                .map_err(|err| SourceError::Fatal(format!("bad cursor: {err}")))?,
        };
        if let Some(error) = self.failures.get_mut(&index).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        let Some(records) = self.pages.get(index) else {
            return Err(SourceError::Fatal(format!("no page {index}")));
        };
        if let Some((after, token)) = &self.cancel_after_page {
            if *after == index {
                token.cancel();
            }
        }
        let next_cursor = (index + 1 < self.pages.len()).then(|| Cursor::new((index + 1).to_string()));
        Ok(Page {
            records: records.clone(),
            next_cursor,
        })
    }
}

fn raw(id: i64) -> RawMember {
    RawMember {
        id: Some(id),
        access_hash: Some(id * 7),
        first_name: Some(format!("Member{id}")),
        ..RawMember::default()
    }
}

fn six_in_three_pages() -> Vec<Vec<RawMember>> {
    vec![vec![raw(1), raw(2)], vec![raw(3), raw(4)], vec![raw(5), raw(6)]]
}

fn fast_config() -> IngestConfig {
    IngestConfig {
        page_size: 2,
        inter_page_delay_ms: 0,
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            multiplier: 2,
        },
        ..IngestConfig::default()
    }
}

fn temp_db_path(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("roster-ingest-{label}-{}.sqlite3", Ulid::new()))
}

fn cleanup(db_path: &Path) -> Result<()> {
    for suffix in ["", "-wal", "-shm"] {
        let path = PathBuf::from(format!("{}{}", db_path.display(), suffix));
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
        }
    }
    Ok(())
}

fn active_ids(store: &SqliteStore) -> Result<Vec<i64>> {
    store
        .active_members(MemberQuery::all(), 100)
        .map(|member| member.map(|m| m.member_id.0))
        .collect()
}

/// Active members with observation timestamps pinned, for comparing two stores.
fn members_without_timestamps(store: &SqliteStore) -> Result<Vec<MemberRecord>> {
    store
        .active_members(MemberQuery::all(), 100)
        .map(|member| {
            member.map(|mut record| {
                record.first_seen_at = OffsetDateTime::UNIX_EPOCH;
                record.last_seen_at = OffsetDateTime::UNIX_EPOCH;
                record
            })
        })
        .collect()
}

#[tokio::test]
async fn full_run_ingests_every_page_and_marks_terminal() -> Result<()> {
    let store = SqliteStore::initialize(Path::new(":memory:"))?;
    let mut engine = IngestEngine::new(store, ScriptedSource::new(six_in_three_pages()), fast_config())?;

    let report = engine.ingest("@channel").await?;
    assert_eq!(report.processed, 6);
    assert_eq!(report.total_processed, 6);
    assert_eq!(report.committed, 3);
    assert_eq!(report.inserted, 6);
    assert!(report.terminal);
    assert!(!report.cancelled);
    assert_eq!(report.cursor, None);

    let store = engine.store();
    assert_eq!(active_ids(store)?, vec![1, 2, 3, 4, 5, 6]);
    let state = store
        .load_checkpoint("@channel")?
        .ok_or_else(|| anyhow!("checkpoint missing after full run"))?;
    assert!(state.terminal);
    assert_eq!(state.records_processed, 6);
    assert_eq!(state.pages_committed, 3);
    assert_eq!(IngestionPhase::of(Some(&state)), IngestionPhase::Complete);
    Ok(())
}

#[tokio::test]
async fn restart_resumes_after_last_committed_page() -> Result<()> {
    let db_path = temp_db_path("resume");

    // First run dies on page 1 after page 0 was committed.
    {
        let store = SqliteStore::initialize(&db_path)?;
        let source = ScriptedSource::new(six_in_three_pages())
            .fail_page(1, vec![SourceError::Fatal("process killed".to_string())]);
        let mut engine = IngestEngine::new(store, source, fast_config())?;
        let err = match engine.ingest("@channel").await {
            Ok(report) => return Err(anyhow!("expected first run to fail, got {report:?}")),
            Err(err) => err,
        };
        assert!(matches!(err, IngestError::FatalSource { page_index: 1, .. }));

        let state = engine
            .store()
            .load_checkpoint("@channel")?
            .ok_or_else(|| anyhow!("checkpoint missing after first page"))?;
        assert_eq!(state.cursor, Some(Cursor::new("1")));
        assert_eq!(state.records_processed, 2);
        assert_eq!(IngestionPhase::of(Some(&state)), IngestionPhase::InProgress);
    }

    let store = SqliteStore::initialize(&db_path)?;
    let source = ScriptedSource::new(six_in_three_pages());
    let calls = source.call_log();
    let mut engine = IngestEngine::new(store, source, fast_config())?;
    let report = engine.ingest("@channel").await?;

    assert_eq!(report.processed, 4);
    assert_eq!(report.total_processed, 6);
    assert!(report.terminal);
    let fetched = calls.lock().map_err(|_| anyhow!("call log poisoned"))?.clone();
    assert_eq!(fetched, vec![Some("1".to_string()), Some("2".to_string())]);

    let store = engine.into_store();
    assert_eq!(active_ids(&store)?, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(store.member_counts(None)?.total, 6);

    let uninterrupted = SqliteStore::initialize(Path::new(":memory:"))?;
    let mut reference =
        IngestEngine::new(uninterrupted, ScriptedSource::new(six_in_three_pages()), fast_config())?;
    reference.ingest("@channel").await?;
    let expected = members_without_timestamps(reference.store())?;
    assert_eq!(expected.len(), 6);
    assert_eq!(members_without_timestamps(&store)?, expected);
    assert_eq!(store.member_counts(None)?, reference.store().member_counts(None)?);
    drop(store);
    cleanup(&db_path)
}

#[tokio::test]
async fn invalid_record_is_dropped_and_checkpoint_advances() -> Result<()> {
    let store = SqliteStore::initialize(Path::new(":memory:"))?;
    let pages = vec![vec![raw(10), RawMember::default()], vec![raw(11), raw(12)]];
    let mut engine = IngestEngine::new(store, ScriptedSource::new(pages), fast_config())?;

    let report = engine.ingest("@channel").await?;
    assert_eq!(report.rejected, 1);
    assert_eq!(report.processed, 3);
    assert!(report.terminal);
    assert_eq!(active_ids(engine.store())?, vec![10, 11, 12]);
    Ok(())
}

#[tokio::test]
async fn non_utf8_listing_line_is_rejected_not_retried() -> Result<()> {
    let listing = std::env::temp_dir().join(format!("roster-ingest-utf8-{}.ndjson", Ulid::new()));
    fs::write(&listing, b"{\"id\": 1}\n\xff\xfe\n{\"id\": 3}\n")?;
    let store = SqliteStore::initialize(Path::new(":memory:"))?;
    let mut engine = IngestEngine::new(store, NdjsonFileSource::new(&listing), fast_config())?;

    let report = engine.ingest("@channel").await?;
    assert!(report.terminal);
    assert_eq!(report.retries, 0);
    assert_eq!(report.rejected, 1);
    assert_eq!(report.processed, 2);
    assert_eq!(active_ids(engine.store())?, vec![1, 3]);

    fs::remove_file(&listing)?;
    Ok(())
}

#[tokio::test]
async fn wholly_invalid_page_fails_the_run() -> Result<()> {
    let store = SqliteStore::initialize(Path::new(":memory:"))?;
    let pages = vec![
        vec![raw(1), raw(2)],
        vec![RawMember::default(), RawMember { id: Some(-3), ..RawMember::default() }],
    ];
    let mut engine = IngestEngine::new(store, ScriptedSource::new(pages), fast_config())?;

    let err = match engine.ingest("@channel").await {
        Ok(report) => return Err(anyhow!("expected page rejection, got {report:?}")),
        Err(err) => err,
    };
    assert!(matches!(
        err,
        IngestError::PageRejected { page_index: 1, rejected: 2, total: 2, .. }
    ));
    let state = engine
        .store()
        .load_checkpoint("@channel")?
        .ok_or_else(|| anyhow!("checkpoint missing"))?;
    assert_eq!(state.cursor, Some(Cursor::new("1")));
    assert!(!state.terminal);
    Ok(())
}

#[tokio::test]
async fn transient_failures_retry_the_same_cursor() -> Result<()> {
    let store = SqliteStore::initialize(Path::new(":memory:"))?;
    let source = ScriptedSource::new(six_in_three_pages()).fail_page(
        1,
        vec![
            SourceError::Transient("connection reset".to_string()),
            SourceError::RateLimited {
                retry_after: Duration::from_millis(2),
            },
        ],
    );
    let calls = source.call_log();
    let mut engine = IngestEngine::new(store, source, fast_config())?;

    let report = engine.ingest("@channel").await?;
    assert_eq!(report.retries, 2);
    assert_eq!(report.processed, 6);
    let fetched = calls.lock().map_err(|_| anyhow!("call log poisoned"))?.clone();
    assert_eq!(
        fetched,
        vec![
            None,
            Some("1".to_string()),
            Some("1".to_string()),
            Some("1".to_string()),
            Some("2".to_string()),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_surface_resume_context() -> Result<()> {
    let store = SqliteStore::initialize(Path::new(":memory:"))?;
    let failures = (0..3)
        .map(|_| SourceError::Transient("timeout".to_string()))
        .collect();
    let source = ScriptedSource::new(six_in_three_pages()).fail_page(2, failures);
    let mut engine = IngestEngine::new(store, source, fast_config())?;

    let err = match engine.ingest("@channel").await {
        Ok(report) => return Err(anyhow!("expected retries to run out, got {report:?}")),
        Err(err) => err,
    };
    match err {
        IngestError::TransientSource {
            target_id,
            cursor,
            page_index,
            attempts,
            ..
        } => {
            assert_eq!(target_id, "@channel");
            assert_eq!(cursor, Some(Cursor::new("2")));
            assert_eq!(page_index, 2);
            assert_eq!(attempts, 3);
        }
        other => return Err(anyhow!("unexpected error: {other}")),
    }
    assert_eq!(engine.store().member_counts(None)?.total, 4);
    Ok(())
}

#[tokio::test]
async fn cancellation_stops_between_pages() -> Result<()> {
    let store = SqliteStore::initialize(Path::new(":memory:"))?;
    let token = CancellationToken::new();
    let source = ScriptedSource::new(six_in_three_pages()).cancel_after(0, token.clone());
    let mut engine = IngestEngine::new(store, source, fast_config())?.with_cancellation(token);
    let progress = engine.subscribe();

    let report = engine.ingest("@channel").await?;
    assert!(report.cancelled);
    assert!(!report.terminal);
    assert_eq!(report.processed, 2);
    assert_eq!(report.cursor, Some(Cursor::new("1")));
    assert_eq!(*progress.borrow(), report);

    let state = engine
        .store()
        .load_checkpoint("@channel")?
        .ok_or_else(|| anyhow!("checkpoint missing"))?;
    assert_eq!(state.cursor, Some(Cursor::new("1")));
    Ok(())
}

#[tokio::test]
async fn complete_target_is_a_no_op_until_reset() -> Result<()> {
    let store = SqliteStore::initialize(Path::new(":memory:"))?;
    let mut engine = IngestEngine::new(store, ScriptedSource::new(six_in_three_pages()), fast_config())?;
    engine.ingest("@channel").await?;
    let store = engine.into_store();

    let source = ScriptedSource::new(six_in_three_pages());
    let calls = source.call_log();
    let mut engine = IngestEngine::new(store, source, fast_config())?;
    let report = engine.ingest("@channel").await?;
    assert!(report.terminal);
    assert_eq!(report.processed, 0);
    assert_eq!(report.total_processed, 6);
    assert!(calls.lock().map_err(|_| anyhow!("call log poisoned"))?.is_empty());

    let mut store = engine.into_store();
    assert!(store.reset_checkpoint("@channel")?);
    let mut engine = IngestEngine::new(store, ScriptedSource::new(six_in_three_pages()), fast_config())?;
    let rerun = engine.ingest("@channel").await?;
    assert_eq!(rerun.processed, 6);
    assert_eq!(rerun.inserted, 0);
    assert_eq!(engine.store().member_counts(None)?.total, 6);
    Ok(())
}

#[tokio::test]
async fn sparse_checkpoints_still_finish_terminal() -> Result<()> {
    let store = SqliteStore::initialize(Path::new(":memory:"))?;
    let config = IngestConfig {
        checkpoint_every_pages: 2,
        ..fast_config()
    };
    let pages = vec![vec![raw(1)], vec![raw(2)], vec![raw(3)]];
    let token = CancellationToken::new();
    let source = ScriptedSource::new(pages).cancel_after(0, token.clone());
    let mut engine = IngestEngine::new(store, source, config.clone())?.with_cancellation(token);

    let report = engine.ingest("@channel").await?;
    assert!(report.cancelled);
    assert_eq!(report.cursor, Some(Cursor::new("1")));
    // Page 0 skipped its checkpoint; stopping flushes the position the report holds.
    let flushed = engine
        .store()
        .load_checkpoint("@channel")?
        .ok_or_else(|| anyhow!("cancelled run left no checkpoint"))?;
    assert_eq!(flushed.cursor, report.cursor);
    assert_eq!(flushed.pages_committed, 1);
    assert_eq!(flushed.records_processed, 1);
    assert!(!flushed.terminal);
    assert_eq!(engine.store().member_counts(None)?.total, 1);

    let store = engine.into_store();
    let pages = vec![vec![raw(1)], vec![raw(2)], vec![raw(3)]];
    let source = ScriptedSource::new(pages);
    let calls = source.call_log();
    let mut engine = IngestEngine::new(store, source, config)?;
    let report = engine.ingest("@channel").await?;
    assert!(report.terminal);
    assert_eq!(report.processed, 2);
    assert_eq!(report.total_processed, 3);
    assert_eq!(report.inserted, 2);
    let fetched = calls.lock().map_err(|_| anyhow!("call log poisoned"))?.clone();
    assert_eq!(fetched, vec![Some("1".to_string()), Some("2".to_string())]);
    let state = engine
        .store()
        .load_checkpoint("@channel")?
        .ok_or_else(|| anyhow!("checkpoint missing"))?;
    assert!(state.terminal);
    assert_eq!(state.pages_committed, 3);
    Ok(())
}

#[tokio::test]
async fn invalid_config_is_rejected_up_front() -> Result<()> {
    let store = SqliteStore::initialize(Path::new(":memory:"))?;
    let config = IngestConfig {
        page_size: 0,
        ..fast_config()
    };
    let result = IngestEngine::new(store, ScriptedSource::new(Vec::new()), config);
    assert!(matches!(result, Err(IngestError::Config(_))));
    Ok(())
}

#[tokio::test]
async fn moved_members_stay_removed_after_reingest() -> Result<()> {
    let store = SqliteStore::initialize(Path::new(":memory:"))?;
    let mut engine = IngestEngine::new(store, ScriptedSource::new(six_in_three_pages()), fast_config())?;
    engine.ingest("@channel").await?;

    let mut store = engine.into_store();
    assert_eq!(store.move_to_removed(&[MemberId(2), MemberId(5)], "pattern:deleted")?, 2);
    assert!(store.reset_checkpoint("@channel")?);

    let mut engine = IngestEngine::new(store, ScriptedSource::new(six_in_three_pages()), fast_config())?;
    engine.ingest("@channel").await?;
    assert_eq!(active_ids(engine.store())?, vec![1, 3, 4, 6]);
    Ok(())
}
