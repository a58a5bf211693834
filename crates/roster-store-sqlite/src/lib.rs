use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use roster_core::{
    CheckpointState, Cursor, DeletionAttempt, KernelError, MemberId, MemberPage, MemberQuery,
    MemberRecord, MemberStatus, NamePattern, Presence, RemovedMember, RunId,
};
use rusqlite::{params, Connection, DatabaseName, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info};
use ulid::Ulid;

mod migrations;

use migrations::{
    current_schema_version, detect_effective_schema_version, record_schema_version,
    CREATE_SCHEMA_MIGRATIONS_SQL, LATEST_SCHEMA_VERSION, MIGRATIONS,
};

const MEMBER_COLUMNS: &str = "member_id, target_id, access_hash, first_name, last_name, username,
    photo_id, is_bot, presence, first_seen_at, last_seen_at, status";

const CHECKPOINT_COLUMNS: &str = "target_id, cursor, records_processed, pages_committed, page_size,
    run_id, started_at, updated_at, terminal";

/// Rows fetched per round trip when a predicate scan has to skip non-matching members.
const SCAN_CHUNK: usize = 500;

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreOptions {
    pub busy_timeout_ms: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppliedMigration {
    pub version: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationReport {
    pub from_version: i64,
    pub to_version: i64,
    pub applied: Vec<AppliedMigration>,
}

/// Values written into the checkpoint row of one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointWrite<'a> {
    pub target_id: &'a str,
    /// Next cursor to fetch; `None` together with `terminal` once the listing is exhausted.
    pub cursor: Option<&'a Cursor>,
    /// Cumulative across runs.
    pub records_processed: u64,
    pub pages_committed: u64,
    pub page_size: u32,
    pub run_id: RunId,
    pub terminal: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MemberCounts {
    pub active: u64,
    pub removed: u64,
    pub total: u64,
    pub removed_snapshots: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DeletionStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub with_errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed roster store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_options(path, &StoreOptions::default())
    }

    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open_with_options(path: &Path, options: &StoreOptions) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {};",
            options.busy_timeout_ms
        ))
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Open the store and bring its schema to the latest version.
    ///
    /// # Errors
    /// Returns an error when opening fails or the schema cannot be migrated.
    pub fn initialize(path: &Path) -> Result<Self> {
        let mut store = Self::open(path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Report current and target schema versions plus pending migrations. Does not write.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = MIGRATIONS
            .iter()
            .map(|step| step.version)
            .filter(|version| *version > current_version)
            .collect();

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// Each step runs in its own transaction together with its version marker. A store written by a
    /// newer build is refused before any step runs.
    ///
    /// # Errors
    /// Returns [`KernelError::SchemaVersion`] (wrapped) for a newer store, or an error when any
    /// migration step fails.
    pub fn migrate(&mut self) -> Result<MigrationReport> {
        let (from_version, inferred) = detect_effective_schema_version(&self.conn)?;
        if from_version > LATEST_SCHEMA_VERSION {
            return Err(KernelError::SchemaVersion {
                found: from_version,
                supported: LATEST_SCHEMA_VERSION,
            }
            .into());
        }

        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        if inferred {
            // Tables exist without marker rows; record what the layout already provides.
            for step in MIGRATIONS.iter().filter(|step| step.version <= from_version) {
                record_schema_version(&self.conn, step.version)?;
            }
            info!(version = from_version, "recorded schema version inferred from table layout");
        }

        let mut applied = Vec::new();
        for step in MIGRATIONS.iter().filter(|step| step.version > from_version) {
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to start migration transaction")?;
            (step.apply)(&tx).with_context(|| {
                format!("migration {} ({}) failed", step.version, step.name)
            })?;
            record_schema_version(&tx, step.version)?;
            tx.commit()
                .with_context(|| format!("failed to commit migration {}", step.version))?;
            info!(version = step.version, name = step.name, "applied schema migration");
            applied.push(AppliedMigration {
                version: step.version,
                name: step.name.to_string(),
            });
        }

        let to_version = current_schema_version(&self.conn)?;
        if to_version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {to_version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(MigrationReport {
            from_version,
            to_version,
            applied,
        })
    }

    /// Insert members that are new and refresh the mutable fields of known ones.
    ///
    /// The whole batch is validated before anything is written; one invalid record fails the call.
    /// Refreshing never touches `member_id`, `first_seen_at` or `status`.
    ///
    /// # Errors
    /// Returns a wrapped [`KernelError::Validation`] for an invalid record, or an error when the
    /// transaction cannot be committed.
    pub fn upsert_batch(&mut self, records: &[MemberRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        validate_batch(records)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start upsert transaction")?;
        let inserted = upsert_members(&tx, records)?;
        tx.commit().context("failed to commit upsert transaction")?;

        debug!(batch = records.len(), inserted, "upserted member batch");
        Ok(inserted)
    }

    /// Upsert one page and, when given, advance the checkpoint in the same transaction.
    ///
    /// # Errors
    /// Returns an error when validation fails or any write in the transaction fails. Nothing is
    /// persisted in that case.
    pub fn commit_page(
        &mut self,
        records: &[MemberRecord],
        checkpoint: Option<&CheckpointWrite<'_>>,
    ) -> Result<usize> {
        validate_batch(records)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start page transaction")?;
        let inserted = upsert_members(&tx, records)?;
        if let Some(checkpoint) = checkpoint {
            write_checkpoint(&tx, checkpoint)?;
        }
        tx.commit().context("failed to commit page transaction")?;
        Ok(inserted)
    }

    /// Advance the checkpoint on its own, for hosts that commit pages separately.
    ///
    /// # Errors
    /// Returns an error when the checkpoint row cannot be written.
    pub fn commit_checkpoint(&mut self, checkpoint: &CheckpointWrite<'_>) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start checkpoint transaction")?;
        write_checkpoint(&tx, checkpoint)?;
        tx.commit().context("failed to commit checkpoint transaction")
    }

    /// # Errors
    /// Returns an error when the checkpoint row cannot be read or decoded.
    pub fn load_checkpoint(&self, target_id: &str) -> Result<Option<CheckpointState>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM ingest_checkpoints WHERE target_id = ?1"
        ))?;
        let mut rows = stmt.query(params![target_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(checkpoint_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// # Errors
    /// Returns an error when checkpoint rows cannot be read or decoded.
    pub fn list_checkpoints(&self) -> Result<Vec<CheckpointState>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM ingest_checkpoints ORDER BY target_id ASC"
        ))?;
        let mut rows = stmt.query([])?;
        let mut states = Vec::new();
        while let Some(row) = rows.next()? {
            states.push(checkpoint_from_row(row)?);
        }
        Ok(states)
    }

    /// Flag a target as fully ingested. Returns false when the target has no checkpoint.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn mark_terminal(&mut self, target_id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE ingest_checkpoints SET terminal = 1, cursor = NULL, updated_at = ?2
                 WHERE target_id = ?1",
                params![target_id, now_rfc3339()?],
            )
            .with_context(|| format!("failed to mark checkpoint terminal for {target_id}"))?;
        Ok(changed == 1)
    }

    /// Forget a target's progress so the next run starts from the beginning.
    ///
    /// # Errors
    /// Returns an error when the checkpoint row cannot be deleted.
    pub fn reset_checkpoint(&mut self, target_id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM ingest_checkpoints WHERE target_id = ?1", params![target_id])
            .with_context(|| format!("failed to reset checkpoint for {target_id}"))?;
        if changed == 1 {
            info!(target_id, "checkpoint reset");
        }
        Ok(changed == 1)
    }

    /// Move active members into the removed set.
    ///
    /// Identities are deduplicated; unknown or already removed ones are skipped. Returns the number
    /// of members transitioned by this call only, so repeating a call returns 0.
    ///
    /// # Errors
    /// Returns a wrapped [`KernelError::Validation`] for a blank reason, or an error when the
    /// transaction fails (in which case nothing moved).
    pub fn move_to_removed(&mut self, member_ids: &[MemberId], reason: &str) -> Result<usize> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(KernelError::Validation("move reason MUST be provided".to_string()).into());
        }
        let unique: BTreeSet<MemberId> = member_ids.iter().copied().collect();
        if unique.is_empty() {
            return Ok(0);
        }

        let moved_at = now_rfc3339()?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start move transaction")?;
        let mut moved = 0;
        {
            let mut snapshot = tx.prepare_cached(
                "INSERT OR IGNORE INTO removed_members(
                    member_id, target_id, access_hash, first_name, last_name, username, photo_id,
                    reason, moved_at
                 )
                 SELECT member_id, target_id, access_hash, first_name, last_name, username, photo_id,
                        ?2, ?3
                 FROM members WHERE member_id = ?1 AND status = 'active'",
            )?;
            let mut flip = tx.prepare_cached(
                "UPDATE members SET status = 'removed' WHERE member_id = ?1 AND status = 'active'",
            )?;
            for member_id in &unique {
                snapshot
                    .execute(params![member_id.0, reason, moved_at])
                    .with_context(|| format!("failed to snapshot member {member_id}"))?;
                moved += flip
                    .execute(params![member_id.0])
                    .with_context(|| format!("failed to flip status of member {member_id}"))?;
            }
        }
        tx.commit().context("failed to commit move transaction")?;

        info!(requested = unique.len(), moved, reason, "moved members to removed set");
        Ok(moved)
    }

    /// One keyset page of active members ordered by identity.
    ///
    /// # Errors
    /// Returns an error when `limit` is zero or rows cannot be read.
    pub fn query_active_page(
        &self,
        query: &MemberQuery,
        after: Option<MemberId>,
        limit: usize,
    ) -> Result<MemberPage> {
        if limit == 0 {
            return Err(KernelError::Validation("page limit MUST be at least 1".to_string()).into());
        }
        let fetch = i64::try_from(limit.saturating_add(1)).context("page limit is too large")?;
        let sql = format!(
            "SELECT {MEMBER_COLUMNS} FROM members
             WHERE status = 'active' AND member_id > ?1 AND (?2 IS NULL OR target_id = ?2) {}
             ORDER BY member_id ASC
             LIMIT ?3",
            pattern_clause(query.pattern)
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let mut rows = stmt.query(params![
            after.map_or(0, |id| id.0),
            query.target_id.as_deref(),
            fetch
        ])?;

        let mut items = Vec::with_capacity(limit);
        let mut has_more = false;
        while let Some(row) = rows.next()? {
            if items.len() == limit {
                has_more = true;
                break;
            }
            items.push(member_from_row(row)?);
        }

        let next_cursor = if has_more {
            items.last().map(|member| member.member_id)
        } else {
            None
        };
        Ok(MemberPage { items, next_cursor })
    }

    /// Lazy sequence of active members, fetched one keyset chunk at a time.
    #[must_use]
    pub fn active_members(&self, query: MemberQuery, chunk: usize) -> ActiveMembers<'_> {
        ActiveMembers {
            store: self,
            query,
            chunk: chunk.max(1),
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
            last_yielded: None,
        }
    }

    /// Keyset page of active members accepted by `predicate`.
    ///
    /// Scans forward in chunks until `limit` matches are found or rows run out, so the cost is
    /// bounded by the rows skipped rather than the table size.
    ///
    /// # Errors
    /// Returns an error when `limit` is zero or rows cannot be read.
    pub fn scan_active<F>(
        &self,
        query: &MemberQuery,
        predicate: F,
        after: Option<MemberId>,
        limit: usize,
    ) -> Result<MemberPage>
    where
        F: Fn(&MemberRecord) -> bool,
    {
        if limit == 0 {
            return Err(KernelError::Validation("page limit MUST be at least 1".to_string()).into());
        }
        let chunk = limit.max(SCAN_CHUNK);
        let mut items = Vec::with_capacity(limit);
        let mut position = after;
        loop {
            let page = self.query_active_page(query, position, chunk)?;
            for member in page.items {
                position = Some(member.member_id);
                if predicate(&member) {
                    items.push(member);
                    if items.len() == limit {
                        return Ok(MemberPage {
                            items,
                            next_cursor: position,
                        });
                    }
                }
            }
            if page.next_cursor.is_none() {
                return Ok(MemberPage {
                    items,
                    next_cursor: None,
                });
            }
        }
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_member(&self, member_id: MemberId) -> Result<Option<MemberRecord>> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT {MEMBER_COLUMNS} FROM members WHERE member_id = ?1"))?;
        let mut rows = stmt.query(params![member_id.0])?;
        match rows.next()? {
            Some(row) => Ok(Some(member_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_removed(&self) -> Result<Vec<RemovedMember>> {
        let mut stmt = self.conn.prepare(
            "SELECT member_id, target_id, access_hash, first_name, last_name, username, photo_id,
                    reason, moved_at
             FROM removed_members
             ORDER BY member_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut removed = Vec::new();
        while let Some(row) = rows.next()? {
            removed.push(RemovedMember {
                member_id: MemberId(row.get(0)?),
                target_id: row.get(1)?,
                access_hash: row.get(2)?,
                first_name: row.get(3)?,
                last_name: row.get(4)?,
                username: row.get(5)?,
                photo_id: row.get(6)?,
                reason: row.get(7)?,
                moved_at: parse_rfc3339(&row.get::<_, String>(8)?)?,
            });
        }
        Ok(removed)
    }

    /// # Errors
    /// Returns an error when the counting queries fail.
    pub fn member_counts(&self, target_id: Option<&str>) -> Result<MemberCounts> {
        // One statement so the member and snapshot counts come from the same read snapshot.
        let (active, removed, total, removed_snapshots) = self
            .conn
            .query_row(
                "SELECT
                    COALESCE(SUM(CASE WHEN status = 'active' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'removed' THEN 1 ELSE 0 END), 0),
                    COUNT(*),
                    (SELECT COUNT(*) FROM removed_members WHERE ?1 IS NULL OR target_id = ?1)
                 FROM members
                 WHERE ?1 IS NULL OR target_id = ?1",
                params![target_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .context("failed to count members")?;

        Ok(MemberCounts {
            active: count_from_sql(active)?,
            removed: count_from_sql(removed)?,
            total: count_from_sql(total)?,
            removed_snapshots: count_from_sql(removed_snapshots)?,
        })
    }

    /// Append one deletion attempt to the audit log and return its row id.
    ///
    /// # Errors
    /// Returns an error when the row cannot be inserted.
    pub fn log_deletion(&mut self, attempt: &DeletionAttempt) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO deletion_log(member_id, username, attempted_at, outcome, error_message)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    attempt.member_id.0,
                    attempt.username,
                    rfc3339(attempt.attempted_at)?,
                    attempt.outcome.as_str(),
                    attempt.error_message,
                ],
            )
            .with_context(|| format!("failed to log deletion attempt for {}", attempt.member_id))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// # Errors
    /// Returns an error when the aggregate query fails.
    pub fn deletion_stats(&self) -> Result<DeletionStats> {
        let (total, successful, failed, with_errors) = self
            .conn
            .query_row(
                "SELECT
                    COUNT(*),
                    COALESCE(SUM(CASE WHEN outcome = 'success' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN outcome = 'error' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN error_message IS NOT NULL THEN 1 ELSE 0 END), 0)
                 FROM deletion_log",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .context("failed to aggregate deletion log")?;
        Ok(DeletionStats {
            total: count_from_sql(total)?,
            successful: count_from_sql(successful)?,
            failed: count_from_sql(failed)?,
            with_errors: count_from_sql(with_errors)?,
        })
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

/// Restartable iterator returned by [`SqliteStore::active_members`].
pub struct ActiveMembers<'a> {
    store: &'a SqliteStore,
    query: MemberQuery,
    chunk: usize,
    after: Option<MemberId>,
    buffer: VecDeque<MemberRecord>,
    exhausted: bool,
    last_yielded: Option<MemberId>,
}

impl ActiveMembers<'_> {
    /// Resume strictly after `cursor`, e.g. a value previously taken from [`Self::position`].
    #[must_use]
    pub fn starting_after(mut self, cursor: MemberId) -> Self {
        self.after = Some(cursor);
        self.last_yielded = Some(cursor);
        self.buffer.clear();
        self.exhausted = false;
        self
    }

    /// Identity of the last member handed out.
    #[must_use]
    pub fn position(&self) -> Option<MemberId> {
        self.last_yielded
    }
}

impl Iterator for ActiveMembers<'_> {
    type Item = Result<MemberRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self.store.query_active_page(&self.query, self.after, self.chunk) {
                Ok(page) => {
                    self.exhausted = page.next_cursor.is_none();
                    self.after = page.next_cursor;
                    self.buffer.extend(page.items);
                }
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
            }
        }
        let member = self.buffer.pop_front()?;
        self.last_yielded = Some(member.member_id);
        Some(Ok(member))
    }
}

fn validate_batch(records: &[MemberRecord]) -> Result<()> {
    for (index, record) in records.iter().enumerate() {
        record
            .validate()
            .map_err(anyhow::Error::new)
            .with_context(|| format!("record {index} of batch failed validation"))?;
    }
    Ok(())
}

fn upsert_members(conn: &Connection, records: &[MemberRecord]) -> Result<usize> {
    let mut insert = conn.prepare_cached(&format!(
        "INSERT INTO members({MEMBER_COLUMNS})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(member_id) DO NOTHING"
    ))?;
    // access_hash keeps its last known value when a sighting omits it.
    let mut refresh = conn.prepare_cached(
        "UPDATE members SET
            target_id = ?2,
            access_hash = COALESCE(?3, access_hash),
            first_name = ?4,
            last_name = ?5,
            username = ?6,
            photo_id = ?7,
            is_bot = ?8,
            presence = ?9,
            last_seen_at = ?10
         WHERE member_id = ?1",
    )?;

    let mut inserted = 0;
    for record in records {
        let seen_at = rfc3339(record.last_seen_at)?;
        let changed = insert
            .execute(params![
                record.member_id.0,
                record.target_id,
                record.access_hash,
                record.first_name,
                record.last_name,
                record.username,
                record.photo_id,
                record.is_bot,
                record.presence.as_str(),
                rfc3339(record.first_seen_at)?,
                seen_at,
                MemberStatus::Active.as_str(),
            ])
            .with_context(|| format!("failed to insert member {}", record.member_id))?;
        if changed == 1 {
            inserted += 1;
            continue;
        }
        refresh
            .execute(params![
                record.member_id.0,
                record.target_id,
                record.access_hash,
                record.first_name,
                record.last_name,
                record.username,
                record.photo_id,
                record.is_bot,
                record.presence.as_str(),
                seen_at,
            ])
            .with_context(|| format!("failed to refresh member {}", record.member_id))?;
    }
    Ok(inserted)
}

fn write_checkpoint(conn: &Connection, checkpoint: &CheckpointWrite<'_>) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT INTO ingest_checkpoints(
            target_id, cursor, records_processed, pages_committed, page_size, run_id,
            started_at, updated_at, terminal
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?8)
         ON CONFLICT(target_id) DO UPDATE SET
            cursor = excluded.cursor,
            records_processed = excluded.records_processed,
            pages_committed = excluded.pages_committed,
            page_size = excluded.page_size,
            run_id = excluded.run_id,
            updated_at = excluded.updated_at,
            terminal = excluded.terminal",
        params![
            checkpoint.target_id,
            checkpoint.cursor.map(Cursor::as_str),
            count_to_sql(checkpoint.records_processed)?,
            count_to_sql(checkpoint.pages_committed)?,
            checkpoint.page_size,
            checkpoint.run_id.to_string(),
            now,
            checkpoint.terminal,
        ],
    )
    .with_context(|| format!("failed to write checkpoint for {}", checkpoint.target_id))?;
    Ok(())
}

fn pattern_clause(pattern: NamePattern) -> &'static str {
    match pattern {
        NamePattern::Any => "",
        NamePattern::DeletedAccount => {
            "AND (first_name LIKE 'Deleted%' OR first_name = '')
             AND (last_name LIKE 'Account%' OR last_name LIKE 'User%' OR last_name = '')"
        }
        NamePattern::EmptyProfile => "AND first_name = '' AND last_name = '' AND username = ''",
    }
}

fn member_from_row(row: &Row<'_>) -> Result<MemberRecord> {
    let presence_raw: String = row.get(8)?;
    let status_raw: String = row.get(11)?;
    Ok(MemberRecord {
        member_id: MemberId(row.get(0)?),
        target_id: row.get(1)?,
        access_hash: row.get(2)?,
        first_name: row.get(3)?,
        last_name: row.get(4)?,
        username: row.get(5)?,
        photo_id: row.get(6)?,
        is_bot: row.get(7)?,
        presence: Presence::parse(&presence_raw)
            .ok_or_else(|| anyhow!("unknown presence: {presence_raw}"))?,
        first_seen_at: parse_rfc3339(&row.get::<_, String>(9)?)?,
        last_seen_at: parse_rfc3339(&row.get::<_, String>(10)?)?,
        status: MemberStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("unknown member status: {status_raw}"))?,
    })
}

fn checkpoint_from_row(row: &Row<'_>) -> Result<CheckpointState> {
    let run_id_raw: String = row.get(5)?;
    Ok(CheckpointState {
        target_id: row.get(0)?,
        cursor: row.get::<_, Option<String>>(1)?.map(Cursor),
        records_processed: count_from_sql(row.get(2)?)?,
        pages_committed: count_from_sql(row.get(3)?)?,
        page_size: row.get(4)?,
        run_id: RunId(
            Ulid::from_string(&run_id_raw).with_context(|| format!("invalid ULID: {run_id_raw}"))?,
        ),
        started_at: parse_rfc3339(&row.get::<_, String>(6)?)?,
        updated_at: parse_rfc3339(&row.get::<_, String>(7)?)?,
        terminal: row.get(8)?,
    })
}

fn count_to_sql(value: u64) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("counter {value} does not fit in sqlite INTEGER"))
}

fn count_from_sql(value: i64) -> Result<u64> {
    u64::try_from(value).with_context(|| format!("negative counter {value} in store"))
}

pub(crate) fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
