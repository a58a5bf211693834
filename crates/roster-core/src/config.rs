use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::KernelError;

pub const DEFAULT_PAGE_SIZE: u32 = 200;
pub const MAX_PAGE_SIZE: u32 = 10_000;
pub const DEFAULT_INTER_PAGE_DELAY_MS: u64 = 33;

/// Bounded exponential backoff applied to transient source failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per page, the first one included.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the next attempt, after `failed_attempts` consecutive failures.
    #[must_use]
    pub fn backoff_for(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1);
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(exponent);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }

    /// # Errors
    /// Returns [`KernelError::Config`] when attempts are zero or the backoff bounds are inverted.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.max_attempts == 0 {
            return Err(KernelError::Config(
                "retry.max_attempts MUST be at least 1".to_string(),
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(KernelError::Config(format!(
                "retry.initial_backoff_ms ({}) MUST NOT exceed retry.max_backoff_ms ({})",
                self.initial_backoff_ms, self.max_backoff_ms
            )));
        }
        if self.multiplier == 0 {
            return Err(KernelError::Config(
                "retry.multiplier MUST be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Tuning knobs for one ingestion run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngestConfig {
    pub page_size: u32,
    pub inter_page_delay_ms: u64,
    /// Persist a checkpoint every N committed pages. The final page always checkpoints.
    pub checkpoint_every_pages: u32,
    /// Fraction of invalid records at which a whole page is rejected.
    pub reject_threshold: f64,
    pub retry: RetryPolicy,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            inter_page_delay_ms: DEFAULT_INTER_PAGE_DELAY_MS,
            checkpoint_every_pages: 1,
            reject_threshold: 1.0,
            retry: RetryPolicy::default(),
        }
    }
}

impl IngestConfig {
    /// # Errors
    /// Returns [`KernelError::Config`] for out-of-range values.
    pub fn validate(&self) -> Result<(), KernelError> {
        if !(1..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(KernelError::Config(format!(
                "page_size MUST be within 1..={MAX_PAGE_SIZE}, got {}",
                self.page_size
            )));
        }
        if self.checkpoint_every_pages == 0 {
            return Err(KernelError::Config(
                "checkpoint_every_pages MUST be at least 1".to_string(),
            ));
        }
        if !(self.reject_threshold > 0.0 && self.reject_threshold <= 1.0) {
            return Err(KernelError::Config(format!(
                "reject_threshold MUST be within (0, 1], got {}",
                self.reject_threshold
            )));
        }
        self.retry.validate()
    }

    #[must_use]
    pub fn inter_page_delay(&self) -> Duration {
        Duration::from_millis(self.inter_page_delay_ms)
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn page_is_rejected(&self, rejected: usize, total: usize) -> bool {
        if total == 0 || rejected == 0 {
            return false;
        }
        (rejected as f64 / total as f64) >= self.reject_threshold
    }

    /// Whether the page that brings the run to `pages_in_run` pages should persist a checkpoint.
    #[must_use]
    pub fn checkpoint_due(&self, pages_in_run: u64) -> bool {
        pages_in_run % u64::from(self.checkpoint_every_pages.max(1)) == 0
    }
}
