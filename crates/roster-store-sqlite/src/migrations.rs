//! Ordered, additive schema steps. Each step is idempotent so a half-recorded store can re-run it.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection};

use crate::now_rfc3339;

pub(crate) const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

pub(crate) const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS members (
  member_id INTEGER PRIMARY KEY CHECK (member_id > 0),
  target_id TEXT NOT NULL CHECK (length(trim(target_id)) > 0),
  access_hash INTEGER,
  first_name TEXT NOT NULL DEFAULT '',
  last_name TEXT NOT NULL DEFAULT '',
  username TEXT NOT NULL DEFAULT '',
  is_bot INTEGER NOT NULL DEFAULT 0 CHECK (is_bot IN (0, 1)),
  presence TEXT NOT NULL DEFAULT 'unknown',
  first_seen_at TEXT NOT NULL,
  last_seen_at TEXT NOT NULL,
  status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'removed'))
);

CREATE TABLE IF NOT EXISTS removed_members (
  member_id INTEGER PRIMARY KEY REFERENCES members(member_id),
  target_id TEXT NOT NULL,
  access_hash INTEGER,
  first_name TEXT NOT NULL DEFAULT '',
  last_name TEXT NOT NULL DEFAULT '',
  username TEXT NOT NULL DEFAULT '',
  reason TEXT NOT NULL CHECK (length(trim(reason)) > 0),
  moved_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ingest_checkpoints (
  target_id TEXT PRIMARY KEY,
  cursor TEXT,
  records_processed INTEGER NOT NULL DEFAULT 0 CHECK (records_processed >= 0),
  pages_committed INTEGER NOT NULL DEFAULT 0 CHECK (pages_committed >= 0),
  page_size INTEGER NOT NULL CHECK (page_size > 0),
  run_id TEXT NOT NULL,
  started_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  terminal INTEGER NOT NULL DEFAULT 0 CHECK (terminal IN (0, 1))
);

CREATE INDEX IF NOT EXISTS idx_members_target ON members(target_id);
CREATE INDEX IF NOT EXISTS idx_members_names ON members(first_name, last_name);
CREATE INDEX IF NOT EXISTS idx_members_username ON members(username);
";

const MIGRATION_003_SQL: &str = r"
CREATE TABLE IF NOT EXISTS deletion_log (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  member_id INTEGER NOT NULL CHECK (member_id > 0),
  username TEXT NOT NULL DEFAULT '',
  attempted_at TEXT NOT NULL,
  outcome TEXT NOT NULL CHECK (outcome IN ('success', 'error')),
  error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_deletion_log_member ON deletion_log(member_id);
CREATE INDEX IF NOT EXISTS idx_members_status ON members(status, member_id);
";

pub(crate) struct Migration {
    pub(crate) version: i64,
    pub(crate) name: &'static str,
    pub(crate) apply: fn(&Connection) -> Result<()>,
}

pub(crate) const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_member_tables",
        apply: apply_migration_1,
    },
    Migration {
        version: 2,
        name: "add_photo_id",
        apply: apply_migration_2,
    },
    Migration {
        version: 3,
        name: "create_deletion_log",
        apply: apply_migration_3,
    },
];

pub(crate) const LATEST_SCHEMA_VERSION: i64 = 3;

fn apply_migration_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_001_SQL)
        .context("failed to apply migration 001")
}

fn apply_migration_2(conn: &Connection) -> Result<()> {
    for table in ["members", "removed_members"] {
        if !table_has_column(conn, table, "photo_id")? {
            conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN photo_id INTEGER"))
                .with_context(|| format!("failed to add photo_id to {table}"))?;
        }
    }
    Ok(())
}

fn apply_migration_3(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_003_SQL)
        .context("failed to apply migration 003")
}

pub(crate) fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

pub(crate) fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

/// Highest recorded version, or 0 when nothing is recorded yet (including a missing marker table).
pub(crate) fn current_schema_version(conn: &Connection) -> Result<i64> {
    if !table_exists(conn, "schema_migrations")? {
        return Ok(0);
    }
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

/// Recorded version, or the version implied by the table layout of a store without marker rows.
pub(crate) fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "members")? {
        return Ok((0, false));
    }

    if !table_has_column(conn, "members", "member_id")? {
        return Err(anyhow!("database schema is invalid: members has no member_id column"));
    }

    if table_exists(conn, "deletion_log")? {
        return Ok((3, true));
    }

    if table_has_column(conn, "members", "photo_id")? {
        return Ok((2, true));
    }

    Ok((1, true))
}

pub(crate) fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_are_ordered_and_end_at_latest() {
        let versions: Vec<i64> = MIGRATIONS.iter().map(|step| step.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(versions.last().copied(), Some(LATEST_SCHEMA_VERSION));
    }

    #[test]
    fn every_step_can_run_twice() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        for step in MIGRATIONS {
            (step.apply)(&conn)?;
            (step.apply)(&conn)?;
        }
        assert!(table_has_column(&conn, "members", "photo_id")?);
        assert!(table_has_column(&conn, "removed_members", "photo_id")?);
        assert!(table_exists(&conn, "deletion_log")?);
        Ok(())
    }

    #[test]
    fn layout_inference_follows_columns() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        assert_eq!(detect_effective_schema_version(&conn)?, (0, false));

        apply_migration_1(&conn)?;
        assert_eq!(detect_effective_schema_version(&conn)?, (1, true));

        apply_migration_2(&conn)?;
        assert_eq!(detect_effective_schema_version(&conn)?, (2, true));

        apply_migration_3(&conn)?;
        assert_eq!(detect_effective_schema_version(&conn)?, (3, true));

        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
        record_schema_version(&conn, 1)?;
        assert_eq!(detect_effective_schema_version(&conn)?, (1, false));
        Ok(())
    }
}
