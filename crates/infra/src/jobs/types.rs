//! Job model and the retry / dead-letter state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use feedq_ai::ErrorCode;
use feedq_core::{JobId, SubjectId};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// A Running job whose lock is older than this is considered abandoned.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(5 * 60);

/// Job lifecycle status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, never attempted
    Pending,
    /// Claimed by a worker
    Running,
    /// Results persisted
    Succeeded,
    /// Last attempt failed; eligible again after `not_before`
    Failed,
    /// Dead-lettered; never reclaimed
    Dead,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Dead)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            "dead" => Some(JobStatus::Dead),
            _ => None,
        }
    }
}

/// One row of the job table: "analyze this subject".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub subject_id: SubjectId,
    /// Rate-limit bucket; `None` shares the default bucket.
    pub group_key: Option<String>,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Not claimable before this instant.
    pub not_before: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    /// Claim token of the worker holding the lock.
    pub lock_owner: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(subject_id: SubjectId) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            subject_id,
            group_key: None,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            not_before: None,
            locked_at: None,
            lock_owner: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_group_key(mut self, key: impl Into<String>) -> Self {
        self.group_key = Some(key.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Claim predicate.
    ///
    /// Running is accepted only through lock expiry: that is the crash
    /// recovery path, there is no heartbeat.
    pub fn is_claimable(&self, now: DateTime<Utc>, lock_ttl: Duration) -> bool {
        let status_ok = matches!(
            self.status,
            JobStatus::Pending | JobStatus::Failed | JobStatus::Running
        );
        let due = self.not_before.map_or(true, |at| at <= now);
        let unlocked = self
            .locked_at
            .map_or(true, |at| at <= lock_cutoff(now, lock_ttl));
        status_ok && due && unlocked
    }
}

/// Where a failed attempt leaves the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureTransition {
    pub status: JobStatus,
    pub attempts: u32,
    pub not_before: Option<DateTime<Utc>>,
}

/// Job-level retry policy (between claims, as opposed to the provider's
/// in-call retries).
///
/// Delay after the n-th failed attempt is `min(max_backoff, base_backoff × 2^(n−1))`.
/// Rate-limit codes are floored at `rate_limit_floor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub rate_limit_floor: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(10 * 60),
            rate_limit_floor: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Codes that dead-letter on first sight: configuration problems do not
    /// fix themselves.
    pub fn is_fatal(code: ErrorCode) -> bool {
        matches!(
            code,
            ErrorCode::Unauthorized | ErrorCode::MissingApiKey | ErrorCode::RealDisabled
        )
    }

    /// Backoff for a job that has now failed `attempts` times.
    pub fn backoff_for(&self, attempts: u32, code: ErrorCode) -> Duration {
        let exp = attempts.saturating_sub(1).min(31);
        let delay = self
            .base_backoff
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff);

        if code.is_rate_limit() {
            delay.max(self.rate_limit_floor)
        } else {
            delay
        }
    }

    /// Apply one failure to a job with `attempts` prior failures.
    pub fn next_state(
        &self,
        attempts: u32,
        max_attempts: u32,
        code: ErrorCode,
        now: DateTime<Utc>,
    ) -> FailureTransition {
        let attempts = attempts.saturating_add(1);

        if Self::is_fatal(code) || attempts >= max_attempts {
            return FailureTransition {
                status: JobStatus::Dead,
                attempts,
                not_before: None,
            };
        }

        let delay = self.backoff_for(attempts, code);
        FailureTransition {
            status: JobStatus::Failed,
            attempts,
            not_before: Some(now + chrono_duration(delay)),
        }
    }
}

pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// Locks taken at or before this instant are abandoned. A TTL too large to
/// subtract pins the cutoff to the epoch, so such locks never expire.
pub(crate) fn lock_cutoff(now: DateTime<Utc>, lock_ttl: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(chrono_duration(lock_ttl))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
