use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::{KernelError, MemberId, MemberRecord};

const DELETED_NAME_PATTERNS: &[(&str, &str)] = &[
    ("deleted_account", r"deleted\s+account"),
    ("deleted_user", r"deleted\s+user"),
    ("deleted_only", r"^deleted\s*$"),
    ("account_deleted", r"account\s+deleted"),
    ("user_deleted", r"user\s+deleted"),
];

const SUSPICIOUS_USERNAME_PATTERNS: &[(&str, &str)] = &[
    ("user_digits", r"^user\d+"),
    ("long_digits", r"^\d{5,}$"),
    ("short_prefix_digits", r"^[a-z]{1,2}\d+$"),
    ("leading_underscore", r"^_\w+$"),
    ("trailing_underscore", r"^\w+_$"),
];

const DEFAULT_NAMES: &[&str] = &["user", "account", "profile", "anonymous", "telegram"];
const PLACEHOLDER_USERNAMES: &[&str] = &["deleted", "account", "user"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    Deleted,
    FakePattern,
    EmptyProfile,
}

impl RemovalReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deleted => "deleted",
            Self::FakePattern => "fake_pattern",
            Self::EmptyProfile => "empty_profile",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Classification {
    pub member_id: MemberId,
    pub reason: RemovalReason,
    pub confidence: f64,
    /// Name of the rule that fired.
    pub pattern: String,
}

impl Classification {
    /// Reason string recorded on the removed snapshot, e.g. `pattern:deleted`.
    #[must_use]
    pub fn reason_tag(&self) -> String {
        format!("pattern:{}", self.reason.as_str())
    }
}

/// Rule-based detector for deleted and placeholder accounts.
#[derive(Debug, Clone)]
pub struct DeletedAccountClassifier {
    deleted_names: Vec<(&'static str, Regex)>,
    suspicious_usernames: Vec<(&'static str, Regex)>,
}

impl DeletedAccountClassifier {
    /// # Errors
    /// Returns [`KernelError::Config`] if a built-in pattern fails to compile.
    pub fn new() -> Result<Self, KernelError> {
        Ok(Self {
            deleted_names: compile(DELETED_NAME_PATTERNS)?,
            suspicious_usernames: compile(SUSPICIOUS_USERNAME_PATTERNS)?,
        })
    }

    /// Decide whether a member looks like a deleted account.
    #[must_use]
    pub fn classify(&self, member: &MemberRecord) -> Option<Classification> {
        let first = member.first_name.trim().to_lowercase();
        let last = member.last_name.trim().to_lowercase();
        let username = member.username.trim().to_lowercase();

        if first.is_empty() && last.is_empty() && username.is_empty() {
            return Some(Classification {
                member_id: member.member_id,
                reason: RemovalReason::Deleted,
                confidence: 0.85,
                pattern: "empty_profile".to_string(),
            });
        }

        let full_name = format!("{first} {last}");
        let (name, _) = self
            .deleted_names
            .iter()
            .find(|(_, regex)| regex.is_match(&full_name))?;
        let confidence = if username.is_empty() {
            0.99
        } else if PLACEHOLDER_USERNAMES.contains(&username.as_str()) {
            0.98
        } else {
            0.95
        };
        Some(Classification {
            member_id: member.member_id,
            reason: RemovalReason::Deleted,
            confidence,
            pattern: (*name).to_string(),
        })
    }

    /// Full analysis: a deleted-account verdict wins, otherwise every weaker signal is reported.
    #[must_use]
    pub fn analyze(&self, member: &MemberRecord) -> Vec<Classification> {
        if let Some(deleted) = self.classify(member) {
            return vec![deleted];
        }

        let mut found = Vec::new();
        let username = member.username.trim().to_lowercase();
        if !username.is_empty() {
            if let Some((name, _)) = self
                .suspicious_usernames
                .iter()
                .find(|(_, regex)| regex.is_match(&username))
            {
                found.push(Classification {
                    member_id: member.member_id,
                    reason: RemovalReason::FakePattern,
                    confidence: 0.6,
                    pattern: (*name).to_string(),
                });
            }
        }

        let mut confidence = 0.0;
        if DEFAULT_NAMES.contains(&member.first_name.trim().to_lowercase().as_str()) {
            confidence += 0.3;
        }
        if DEFAULT_NAMES.contains(&member.last_name.trim().to_lowercase().as_str()) {
            confidence += 0.2;
        }
        if confidence >= 0.5 {
            found.push(Classification {
                member_id: member.member_id,
                reason: RemovalReason::EmptyProfile,
                confidence: f64::min(confidence, 0.8),
                pattern: "default_names".to_string(),
            });
        }
        found
    }
}

fn compile(patterns: &[(&'static str, &str)]) -> Result<Vec<(&'static str, Regex)>, KernelError> {
    patterns
        .iter()
        .map(|(name, pattern)| {
            Regex::new(pattern)
                .map(|regex| (*name, regex))
                .map_err(|err| KernelError::Config(format!("invalid pattern {name}: {err}")))
        })
        .collect()
}
