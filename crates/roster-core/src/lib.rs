use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

mod classify;
mod config;

pub use classify::{Classification, DeletedAccountClassifier, RemovalReason};
pub use config::{IngestConfig, RetryPolicy};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("database schema version {found} is newer than the latest supported version {supported}")]
    SchemaVersion { found: i64, supported: i64 },
    #[error("configuration error: {0}")]
    Config(String),
}

/// External identity of a listing member. Always positive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemberId(pub i64);

impl MemberId {
    /// Build an identity from its raw value.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when the value is not positive.
    pub fn new(raw: i64) -> Result<Self, KernelError> {
        if raw <= 0 {
            return Err(KernelError::Validation(format!(
                "member identity MUST be positive, got {raw}"
            )));
        }
        Ok(Self(raw))
    }
}

impl Display for MemberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MemberId {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s
            .trim()
            .parse::<i64>()
            .map_err(|err| KernelError::Validation(format!("invalid member identity {s:?}: {err}")))?;
        Self::new(raw)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque position token handed out by a listing source.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(transparent)]
pub struct Cursor(pub String);

impl Cursor {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Cursor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Active,
    Removed,
}

impl MemberStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Removed => "removed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "removed" => Some(Self::Removed),
            _ => None,
        }
    }
}

/// Last-seen presence bucket reported by the listing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Online,
    Offline,
    Recently,
    LastWeek,
    LastMonth,
    #[default]
    Unknown,
}

impl Presence {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Recently => "recently",
            Self::LastWeek => "last_week",
            Self::LastMonth => "last_month",
            Self::Unknown => "unknown",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            "recently" => Some(Self::Recently),
            "last_week" => Some(Self::LastWeek),
            "last_month" => Some(Self::LastMonth),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// One listing entry exactly as the source delivered it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(default)]
pub struct RawMember {
    pub id: Option<i64>,
    pub access_hash: Option<i64>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub photo_id: Option<i64>,
    pub bot: bool,
    pub presence: Option<Presence>,
}

impl RawMember {
    /// Turn a raw listing entry into a storable record observed at `seen_at`.
    ///
    /// Absent names and usernames become empty strings so pattern matching stays total.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when the identity is missing or not positive, or
    /// when `target_id` is blank.
    pub fn normalize(&self, target_id: &str, seen_at: OffsetDateTime) -> Result<MemberRecord, KernelError> {
        let Some(raw_id) = self.id else {
            return Err(KernelError::Validation("member identity is missing".to_string()));
        };
        let record = MemberRecord {
            member_id: MemberId::new(raw_id)?,
            target_id: target_id.trim().to_string(),
            access_hash: self.access_hash,
            first_name: normalize_text(self.first_name.as_deref()),
            last_name: normalize_text(self.last_name.as_deref()),
            username: normalize_text(self.username.as_deref()),
            photo_id: self.photo_id,
            is_bot: self.bot,
            presence: self.presence.unwrap_or_default(),
            first_seen_at: seen_at,
            last_seen_at: seen_at,
            status: MemberStatus::Active,
        };
        record.validate()?;
        Ok(record)
    }
}

#[must_use]
pub fn normalize_text(value: Option<&str>) -> String {
    value.map(str::trim).unwrap_or_default().to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MemberRecord {
    pub member_id: MemberId,
    pub target_id: String,
    pub access_hash: Option<i64>,
    pub first_name: String,
    pub last_name: String,
    pub username: String,
    pub photo_id: Option<i64>,
    pub is_bot: bool,
    pub presence: Presence,
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen_at: OffsetDateTime,
    pub status: MemberStatus,
}

impl MemberRecord {
    /// Check the invariants every stored member must satisfy.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for a non-positive identity or a blank target.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.member_id.0 <= 0 {
            return Err(KernelError::Validation(format!(
                "member identity MUST be positive, got {}",
                self.member_id
            )));
        }
        if self.target_id.trim().is_empty() {
            return Err(KernelError::Validation(format!(
                "target_id MUST be provided for member {}",
                self.member_id
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }
}

/// Snapshot written when a member leaves the active set.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RemovedMember {
    pub member_id: MemberId,
    pub target_id: String,
    pub access_hash: Option<i64>,
    pub first_name: String,
    pub last_name: String,
    pub username: String,
    pub photo_id: Option<i64>,
    pub reason: String,
    #[serde(with = "time::serde::rfc3339")]
    pub moved_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CheckpointState {
    pub target_id: String,
    /// Next cursor to fetch. `None` means the initial position (or nothing left once terminal).
    pub cursor: Option<Cursor>,
    pub records_processed: u64,
    pub pages_committed: u64,
    pub page_size: u32,
    pub run_id: RunId,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub terminal: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum IngestionPhase {
    NotStarted,
    InProgress,
    Complete,
}

impl IngestionPhase {
    /// Derive the phase of a target from its persisted checkpoint.
    ///
    /// An interrupted run is not persisted separately: it shows up as `InProgress`.
    #[must_use]
    pub fn of(state: Option<&CheckpointState>) -> Self {
        match state {
            None => Self::NotStarted,
            Some(state) if state.terminal => Self::Complete,
            Some(_) => Self::InProgress,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
        }
    }
}

/// Name-shape prefilter pushed down into the active-member query.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NamePattern {
    #[default]
    Any,
    DeletedAccount,
    EmptyProfile,
}

impl NamePattern {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::DeletedAccount => "deleted_account",
            Self::EmptyProfile => "empty_profile",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "any" => Some(Self::Any),
            "deleted_account" => Some(Self::DeletedAccount),
            "empty_profile" => Some(Self::EmptyProfile),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct MemberQuery {
    pub target_id: Option<String>,
    pub pattern: NamePattern,
}

impl MemberQuery {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_pattern(mut self, pattern: NamePattern) -> Self {
        self.pattern = pattern;
        self
    }

    #[must_use]
    pub fn for_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MemberPage {
    pub items: Vec<MemberRecord>,
    /// Identity to pass as `after` for the following page; `None` once the scan is exhausted.
    pub next_cursor: Option<MemberId>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DeletionOutcome {
    Success,
    Error,
}

impl DeletionOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One account-removal attempt reported back by the deletion stage.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DeletionAttempt {
    pub member_id: MemberId,
    pub username: String,
    pub outcome: DeletionOutcome,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub attempted_at: OffsetDateTime,
}
