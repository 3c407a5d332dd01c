//! Job storage: the claim / finalize contract and an in-memory store.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use feedq_core::{JobId, SubjectId};

use super::types::{FailureTransition, Job, JobStatus};

/// Parameters of one claim.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Token written to `lock_owner`; unique per claim.
    pub owner: String,
    pub now: DateTime<Utc>,
    /// Locks older than this are treated as abandoned.
    pub lock_ttl: Duration,
}

/// Guard applied to a finalize write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateCondition {
    /// Write regardless of the current lock holder.
    Always,
    /// Write only while `lock_owner` still equals this token.
    LockedBy(String),
}

/// Finalize write. Always clears the lock fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPatch {
    pub status: JobStatus,
    pub attempts: u32,
    pub not_before: Option<DateTime<Utc>>,
    /// `None` leaves the stored value untouched.
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl JobPatch {
    pub fn succeeded(job: &Job, now: DateTime<Utc>) -> Self {
        Self {
            status: JobStatus::Succeeded,
            attempts: job.attempts,
            not_before: None,
            last_error: None,
            updated_at: now,
        }
    }

    pub fn failed(transition: FailureTransition, error: String, now: DateTime<Utc>) -> Self {
        Self {
            status: transition.status,
            attempts: transition.attempts,
            not_before: transition.not_before,
            last_error: Some(error),
            updated_at: now,
        }
    }

    pub(crate) fn apply(&self, job: &mut Job) {
        job.status = self.status;
        job.attempts = self.attempts;
        job.not_before = self.not_before;
        if let Some(error) = &self.last_error {
            job.last_error = Some(error.clone());
        }
        job.locked_at = None;
        job.lock_owner = None;
        job.updated_at = self.updated_at;
    }
}

/// Result of [`JobStore::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Created(JobId),
    /// The subject already has an unfinished job.
    Duplicate(JobId),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            EnqueueOutcome::Created(id) | EnqueueOutcome::Duplicate(id) => *id,
        }
    }
}

/// Job store abstraction.
///
/// `claim_next` must be atomic: two concurrent claimers never receive the
/// same job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Enqueue a job unless its subject already has a non-terminal one.
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome, JobStoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Claim the oldest claimable job, marking it Running under `claim.owner`.
    async fn claim_next(&self, claim: &ClaimRequest) -> Result<Option<Job>, JobStoreError>;

    /// Apply a finalize write. Returns `None` when no row matched, which
    /// under [`UpdateCondition::LockedBy`] means the lock was lost.
    async fn update(
        &self,
        id: JobId,
        condition: UpdateCondition,
        patch: JobPatch,
    ) -> Result<Option<Job>, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("invalid job row: {0}")]
    InvalidRow(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub dead: usize,
}

impl JobStats {
    pub(crate) fn add(&mut self, status: JobStatus, n: usize) {
        match status {
            JobStatus::Pending => self.pending += n,
            JobStatus::Running => self.running += n,
            JobStatus::Succeeded => self.succeeded += n,
            JobStatus::Failed => self.failed += n,
            JobStatus::Dead => self.dead += n,
        }
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

fn poisoned<T>(_: T) -> JobStoreError {
    JobStoreError::Storage("job store lock poisoned".to_string())
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Overwrite a job as-is. Test helper for staging stale locks.
    pub fn put(&self, job: Job) -> Result<(), JobStoreError> {
        self.jobs.write().map_err(poisoned)?.insert(job.id, job);
        Ok(())
    }

    fn active_for(jobs: &HashMap<JobId, Job>, subject_id: SubjectId) -> Option<JobId> {
        jobs.values()
            .find(|j| j.subject_id == subject_id && !j.status.is_terminal())
            .map(|j| j.id)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        if let Some(existing) = Self::active_for(&jobs, job.subject_id) {
            return Ok(EnqueueOutcome::Duplicate(existing));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(EnqueueOutcome::Created(id))
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs.read().map_err(poisoned)?.get(&id).cloned())
    }

    async fn claim_next(&self, claim: &ClaimRequest) -> Result<Option<Job>, JobStoreError> {
        // Select and mark under one write lock.
        let mut jobs = self.jobs.write().map_err(poisoned)?;

        let next = jobs
            .values()
            .filter(|j| j.is_claimable(claim.now, claim.lock_ttl))
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.status = JobStatus::Running;
        job.locked_at = Some(claim.now);
        job.lock_owner = Some(claim.owner.clone());
        job.updated_at = claim.now;
        Ok(Some(job.clone()))
    }

    async fn update(
        &self,
        id: JobId,
        condition: UpdateCondition,
        patch: JobPatch,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        if let UpdateCondition::LockedBy(owner) = &condition {
            if job.lock_owner.as_deref() != Some(owner.as_str()) {
                return Ok(None);
            }
        }
        patch.apply(job);
        Ok(Some(job.clone()))
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.add(job.status, 1);
        }
        Ok(stats)
    }
}

/// Lock-expiry cutoff for a claim issued at `now`.

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::DEFAULT_LOCK_TTL;
    use std::collections::HashSet;

    fn claim(owner: &str) -> ClaimRequest {
        ClaimRequest {
            owner: owner.to_string(),
            now: Utc::now(),
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }

    #[tokio::test]
    async fn enqueue_and_claim() {
        let store = InMemoryJobStore::new();
        let job = Job::new(SubjectId::new());
        let id = store.enqueue(job).await.unwrap().job_id();

        let claimed = store.claim_next(&claim("w1:a")).await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.lock_owner.as_deref(), Some("w1:a"));
        assert!(claimed.locked_at.is_some());

        // No more jobs
        assert!(store.claim_next(&claim("w1:b")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claims_oldest_first() {
        let store = InMemoryJobStore::new();
        let mut older = Job::new(SubjectId::new());
        older.created_at = Utc::now() - chrono::Duration::minutes(1);
        let newer = Job::new(SubjectId::new());
        store.enqueue(newer).await.unwrap();
        let older_id = store.enqueue(older).await.unwrap().job_id();

        let first = store.claim_next(&claim("w")).await.unwrap().unwrap();
        assert_eq!(first.id, older_id);
    }

    #[tokio::test]
    async fn one_active_job_per_subject() {
        let store = InMemoryJobStore::new();
        let subject = SubjectId::new();

        let first = store.enqueue(Job::new(subject)).await.unwrap();
        let second = store.enqueue(Job::new(subject)).await.unwrap();
        assert!(matches!(first, EnqueueOutcome::Created(_)));
        assert_eq!(second, EnqueueOutcome::Duplicate(first.job_id()));

        let job = store.claim_next(&claim("w")).await.unwrap().unwrap();
        store
            .update(job.id, UpdateCondition::Always, JobPatch::succeeded(&job, Utc::now()))
            .await
            .unwrap();

        // Terminal jobs don't block a fresh request.
        let third = store.enqueue(Job::new(subject)).await.unwrap();
        assert!(matches!(third, EnqueueOutcome::Created(id) if id != first.job_id()));
    }

    #[tokio::test]
    async fn scheduled_failures_wait_for_not_before() {
        let store = InMemoryJobStore::new();
        let mut job = Job::new(SubjectId::new());
        job.status = JobStatus::Failed;
        job.not_before = Some(Utc::now() + chrono::Duration::seconds(30));
        store.put(job.clone()).unwrap();

        assert!(store.claim_next(&claim("w")).await.unwrap().is_none());

        let later = ClaimRequest {
            now: Utc::now() + chrono::Duration::seconds(31),
            ..claim("w")
        };
        let claimed = store.claim_next(&later).await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
    }

    #[tokio::test]
    async fn stale_lock_is_reclaimed() {
        let store = InMemoryJobStore::new();
        let mut job = Job::new(SubjectId::new());
        job.status = JobStatus::Running;
        job.lock_owner = Some("crashed:1".to_string());
        job.locked_at = Some(Utc::now() - chrono::Duration::minutes(6));
        store.put(job.clone()).unwrap();

        let claimed = store.claim_next(&claim("w2:1")).await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.lock_owner.as_deref(), Some("w2:1"));

        // The old holder can no longer finalize conditionally.
        let lost = store
            .update(
                job.id,
                UpdateCondition::LockedBy("crashed:1".to_string()),
                JobPatch::succeeded(&job, Utc::now()),
            )
            .await
            .unwrap();
        assert!(lost.is_none());
        assert_eq!(store.get(job.id).await.unwrap().unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn fresh_lock_is_not_reclaimed() {
        let store = InMemoryJobStore::new();
        store.enqueue(Job::new(SubjectId::new())).await.unwrap();
        store.claim_next(&claim("w1")).await.unwrap().unwrap();

        let soon = ClaimRequest {
            now: Utc::now() + chrono::Duration::minutes(4),
            ..claim("w2")
        };
        assert!(store.claim_next(&soon).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_patch_clears_lock_and_records_error() {
        let store = InMemoryJobStore::new();
        store.enqueue(Job::new(SubjectId::new())).await.unwrap();
        let job = store.claim_next(&claim("w")).await.unwrap().unwrap();

        let transition = FailureTransition {
            status: JobStatus::Failed,
            attempts: 1,
            not_before: Some(Utc::now()),
        };
        let updated = store
            .update(
                job.id,
                UpdateCondition::Always,
                JobPatch::failed(transition, "TIMEOUT: slow".to_string(), Utc::now()),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.status, JobStatus::Failed);
        assert_eq!(updated.attempts, 1);
        assert_eq!(updated.last_error.as_deref(), Some("TIMEOUT: slow"));
        assert!(updated.lock_owner.is_none());
        assert!(updated.locked_at.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_never_overlap() {
        let store = InMemoryJobStore::arc();
        for _ in 0..20 {
            store.enqueue(Job::new(SubjectId::new())).await.unwrap();
        }

        let mut tasks = Vec::new();
        for w in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                while let Some(job) = store.claim_next(&claim(&format!("w{w}"))).await.unwrap() {
                    mine.push(job.id);
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        for task in tasks {
            for id in task.await.unwrap() {
                assert!(seen.insert(id), "job {id} claimed twice");
            }
        }
        assert_eq!(seen.len(), 20);
    }

    #[tokio::test]
    async fn stats_tracking() {
        let store = InMemoryJobStore::new();
        for _ in 0..5 {
            store.enqueue(Job::new(SubjectId::new())).await.unwrap();
        }
        assert_eq!(store.stats().await.unwrap().pending, 5);

        store.claim_next(&claim("a")).await.unwrap();
        store.claim_next(&claim("b")).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.running, 2);
    }
}
