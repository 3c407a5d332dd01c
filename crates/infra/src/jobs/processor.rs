//! Batch job processing: claim, analyze, persist, finalize.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use feedq_ai::{ErrorCode, FeedbackProvider, ProviderError, ResultItem};
use feedq_core::SubjectId;

use crate::guard::Guard;
use crate::results::{ResultSink, SinkError};
use crate::subjects::SubjectSource;

use super::store::{ClaimRequest, JobPatch, JobStore, JobStoreError, UpdateCondition};
use super::types::{Job, JobStatus, RetryPolicy, DEFAULT_LOCK_TTL};

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Prefix of every claim token this processor issues.
    pub worker_id: String,
    pub lock_ttl: Duration,
    pub retry: RetryPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            worker_id: "feedq-worker".to_string(),
            lock_ttl: DEFAULT_LOCK_TTL,
            retry: RetryPolicy::default(),
        }
    }
}

/// Counts for one `process_once` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    /// Jobs claimed.
    pub processed: usize,
    pub succeeded: usize,
    /// Jobs rescheduled for retry.
    pub failed: usize,
    /// Jobs dead-lettered.
    pub dead: usize,
}

/// Job store failure that aborts a batch. Everything that goes wrong while
/// working on a claimed job is recorded on that job instead.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

enum Finalized {
    Succeeded,
    Failed,
    Dead,
    /// Lock was taken over before the success write.
    LockLost,
}

/// Drives jobs from claim to a terminal or rescheduled state.
pub struct JobProcessor {
    store: Arc<dyn JobStore>,
    subjects: Arc<dyn SubjectSource>,
    sink: Arc<dyn ResultSink>,
    provider: Arc<dyn FeedbackProvider>,
    guard: Arc<Guard>,
    config: ProcessorConfig,
}

impl JobProcessor {
    pub fn new(
        store: Arc<dyn JobStore>,
        subjects: Arc<dyn SubjectSource>,
        sink: Arc<dyn ResultSink>,
        provider: Arc<dyn FeedbackProvider>,
        guard: Arc<Guard>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            subjects,
            sink,
            provider,
            guard,
            config,
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Process up to `batch_size` jobs sequentially, stopping early when the
    /// queue has nothing claimable.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn process_once(&self, batch_size: usize) -> Result<BatchOutcome, ProcessError> {
        let mut outcome = BatchOutcome::default();

        for _ in 0..batch_size {
            let claim = ClaimRequest {
                owner: self.claim_token(),
                now: Utc::now(),
                lock_ttl: self.config.lock_ttl,
            };
            let Some(job) = self.store.claim_next(&claim).await? else {
                break;
            };
            outcome.processed += 1;

            match self.process_job(&job, &claim.owner).await? {
                Finalized::Succeeded => outcome.succeeded += 1,
                Finalized::Failed => outcome.failed += 1,
                Finalized::Dead => outcome.dead += 1,
                Finalized::LockLost => {}
            }
        }

        if outcome.processed > 0 {
            info!(
                processed = outcome.processed,
                succeeded = outcome.succeeded,
                failed = outcome.failed,
                dead = outcome.dead,
                "batch processed"
            );
        }
        Ok(outcome)
    }

    fn claim_token(&self) -> String {
        format!("{}:{}", self.config.worker_id, Uuid::now_v7())
    }

    async fn process_job(&self, job: &Job, owner: &str) -> Result<Finalized, ProcessError> {
        debug!(job_id = %job.id, subject_id = %job.subject_id, attempts = job.attempts, "job claimed");

        let items = match self.analyze(job).await {
            Ok(items) => items,
            Err(err) => return self.finalize_failure(job, err).await,
        };

        match self.persist(job.subject_id, &items).await {
            Ok(stored) => {
                debug!(job_id = %job.id, items = items.len(), stored, "results persisted");
                self.finalize_success(job, owner).await
            }
            Err(err) => self.finalize_failure(job, err).await,
        }
    }

    /// Rate check, subject lookup and the guarded provider call.
    async fn analyze(&self, job: &Job) -> Result<Vec<ResultItem>, ProviderError> {
        if !self.guard.try_consume(job.group_key.as_deref()) {
            return Err(ProviderError::new(
                ErrorCode::RateLimitLocal,
                format!(
                    "local rate limit reached for {}",
                    job.group_key.as_deref().unwrap_or(crate::guard::DEFAULT_BUCKET)
                ),
            ));
        }

        let subject = self
            .subjects
            .fetch(job.subject_id)
            .await
            .map_err(|err| ProviderError::new(ErrorCode::Storage, err.to_string()))?
            .ok_or_else(|| {
                ProviderError::new(
                    ErrorCode::SubjectNotFound,
                    format!("subject {} not found", job.subject_id),
                )
            })?;

        let mut permit = self.guard.acquire().await;
        let result = self.provider.analyze(&subject).await;
        permit.release();

        result
    }

    async fn persist(&self, subject_id: SubjectId, items: &[ResultItem]) -> Result<usize, ProviderError> {
        match self.sink.insert_many(subject_id, items).await {
            Ok(stored) => Ok(stored),
            Err(SinkError::Duplicate(detail)) => {
                debug!(%subject_id, %detail, "results already stored");
                Ok(0)
            }
            Err(err) => Err(ProviderError::new(ErrorCode::Storage, err.to_string())),
        }
    }

    async fn finalize_success(&self, job: &Job, owner: &str) -> Result<Finalized, ProcessError> {
        let updated = self
            .store
            .update(
                job.id,
                UpdateCondition::LockedBy(owner.to_string()),
                JobPatch::succeeded(job, Utc::now()),
            )
            .await?;

        match updated {
            Some(_) => {
                info!(job_id = %job.id, subject_id = %job.subject_id, "job succeeded");
                Ok(Finalized::Succeeded)
            }
            None => {
                warn!(
                    job_id = %job.id,
                    owner,
                    "lock lost before success could be recorded; results kept, status left to current holder"
                );
                Ok(Finalized::LockLost)
            }
        }
    }

    async fn finalize_failure(&self, job: &Job, err: ProviderError) -> Result<Finalized, ProcessError> {
        let now = Utc::now();
        let transition = self
            .config
            .retry
            .next_state(job.attempts, job.max_attempts, err.code, now);
        let status = transition.status;
        let attempts = transition.attempts;

        self.store
            .update(
                job.id,
                UpdateCondition::Always,
                JobPatch::failed(transition, err.to_string(), now),
            )
            .await?;

        if status == JobStatus::Dead {
            warn!(job_id = %job.id, code = %err.code, attempts, error = %err.message, "job dead-lettered");
            Ok(Finalized::Dead)
        } else {
            warn!(job_id = %job.id, code = %err.code, attempts, error = %err.message, "job failed; retry scheduled");
            Ok(Finalized::Failed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::GuardConfig;
    use crate::jobs::store::InMemoryJobStore;
    use crate::results::InMemoryResultSink;
    use crate::subjects::{InMemorySubjectSource, SourceError};
    use async_trait::async_trait;
    use feedq_ai::{Category, Severity};
    use feedq_core::Subject;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Provider that replays canned outcomes.
    #[derive(Default)]
    struct ScriptedProvider {
        replies: Mutex<VecDeque<Result<Vec<ResultItem>, ProviderError>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedProvider {
        fn new(replies: Vec<Result<Vec<ResultItem>, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl FeedbackProvider for ScriptedProvider {
        async fn analyze(&self, _subject: &Subject) -> Result<Vec<ResultItem>, ProviderError> {
            *self.calls.lock().unwrap() += 1;
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    /// Sink that always reports the rows as already present.
    struct DuplicateSink;

    #[async_trait]
    impl ResultSink for DuplicateSink {
        async fn insert_many(&self, _: SubjectId, _: &[ResultItem]) -> Result<usize, SinkError> {
            Err(SinkError::Duplicate("feedback_results_subject_id_key".to_string()))
        }
    }

    /// Sink whose backing table rejects every write.
    struct BrokenSink;

    #[async_trait]
    impl ResultSink for BrokenSink {
        async fn insert_many(&self, _: SubjectId, _: &[ResultItem]) -> Result<usize, SinkError> {
            Err(SinkError::Storage("value too long for type".to_string()))
        }
    }

    struct BrokenSource;

    #[async_trait]
    impl SubjectSource for BrokenSource {
        async fn fetch(&self, _: SubjectId) -> Result<Option<Subject>, SourceError> {
            Err(SourceError::Storage("connection reset".to_string()))
        }
    }

    struct Harness {
        store: Arc<InMemoryJobStore>,
        subjects: Arc<InMemorySubjectSource>,
        sink: Arc<InMemoryResultSink>,
        provider: Arc<ScriptedProvider>,
        processor: JobProcessor,
    }

    fn harness(replies: Vec<Result<Vec<ResultItem>, ProviderError>>, guard: GuardConfig) -> Harness {
        let store = InMemoryJobStore::arc();
        let subjects = InMemorySubjectSource::arc();
        let sink = InMemoryResultSink::arc();
        let provider = ScriptedProvider::new(replies);
        let processor = JobProcessor::new(
            store.clone(),
            subjects.clone(),
            sink.clone(),
            provider.clone(),
            Arc::new(Guard::new(guard)),
            ProcessorConfig {
                worker_id: "test-worker".to_string(),
                ..ProcessorConfig::default()
            },
        );
        Harness {
            store,
            subjects,
            sink,
            provider,
            processor,
        }
    }

    impl Harness {
        async fn seed(&self) -> Job {
            let subject = Subject::new(SubjectId::new(), "x = 1", "python");
            self.subjects.insert(subject.clone());
            let job = Job::new(subject.id);
            self.store.enqueue(job.clone()).await.unwrap();
            job
        }
    }

    fn finding() -> ResultItem {
        ResultItem::new(Category::Bug, Severity::Warn, "unused variable")
    }

    #[tokio::test]
    async fn success_persists_results_and_clears_lock() {
        let h = harness(vec![Ok(vec![finding()])], GuardConfig::default());
        let job = h.seed().await;

        let outcome = h.processor.process_once(5).await.unwrap();
        assert_eq!(
            outcome,
            BatchOutcome {
                processed: 1,
                succeeded: 1,
                failed: 0,
                dead: 0
            }
        );

        let stored = h.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
        assert!(stored.lock_owner.is_none());
        assert!(stored.locked_at.is_none());
        assert!(stored.not_before.is_none());
        assert_eq!(h.sink.for_subject(job.subject_id).len(), 1);
    }

    #[tokio::test]
    async fn empty_queue_is_a_no_op() {
        let h = harness(vec![], GuardConfig::default());
        assert_eq!(h.processor.process_once(5).await.unwrap(), BatchOutcome::default());
        assert_eq!(h.provider.calls(), 0);
    }

    #[tokio::test]
    async fn batch_size_bounds_claims() {
        let h = harness(vec![], GuardConfig::default());
        for _ in 0..4 {
            h.seed().await;
        }

        let outcome = h.processor.process_once(3).await.unwrap();
        assert_eq!(outcome.processed, 3);
        assert_eq!(h.store.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn retryable_failure_schedules_retry() {
        let h = harness(
            vec![Err(ProviderError::new(ErrorCode::Upstream5xx, "502 bad gateway"))],
            GuardConfig::default(),
        );
        let job = h.seed().await;
        let before = Utc::now();

        let outcome = h.processor.process_once(5).await.unwrap();
        assert_eq!(outcome.failed, 1);

        let stored = h.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.last_error.as_deref(), Some("UPSTREAM_5XX: 502 bad gateway"));
        assert!(stored.lock_owner.is_none());
        let not_before = stored.not_before.unwrap();
        assert!(not_before >= before + chrono::Duration::seconds(30));

        // Not claimable again until the backoff elapses.
        assert_eq!(h.processor.process_once(5).await.unwrap().processed, 0);
    }

    #[tokio::test]
    async fn unauthorized_dead_letters_immediately() {
        let h = harness(
            vec![Err(ProviderError::new(ErrorCode::Unauthorized, "401"))],
            GuardConfig::default(),
        );
        let job = h.seed().await;

        let outcome = h.processor.process_once(5).await.unwrap();
        assert_eq!(outcome.dead, 1);

        let stored = h.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Dead);
        assert_eq!(stored.attempts, 1);
        assert!(stored.not_before.is_none());
    }

    #[tokio::test]
    async fn exhausted_attempts_dead_letter() {
        let h = harness(
            vec![Err(ProviderError::new(ErrorCode::Timeout, "slow"))],
            GuardConfig::default(),
        );
        let subject = Subject::new(SubjectId::new(), "x", "python");
        h.subjects.insert(subject.clone());
        let mut job = Job::new(subject.id);
        job.status = JobStatus::Failed;
        job.attempts = 2;
        h.store.put(job.clone()).unwrap();

        let outcome = h.processor.process_once(5).await.unwrap();
        assert_eq!(outcome.dead, 1);
        let stored = h.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Dead);
        assert_eq!(stored.attempts, 3);
    }

    #[tokio::test]
    async fn missing_subject_fails_without_provider_call() {
        let h = harness(vec![], GuardConfig::default());
        let job = Job::new(SubjectId::new());
        h.store.enqueue(job.clone()).await.unwrap();

        let outcome = h.processor.process_once(5).await.unwrap();
        assert_eq!(outcome.failed, 1);
        assert_eq!(h.provider.calls(), 0);

        let stored = h.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 1);
        assert!(stored.last_error.unwrap().starts_with("SUBJECT_NOT_FOUND:"));
    }

    #[tokio::test]
    async fn sink_failure_is_recorded_and_batch_continues() {
        let store = InMemoryJobStore::arc();
        let subjects = InMemorySubjectSource::arc();
        let processor = JobProcessor::new(
            store.clone(),
            subjects.clone(),
            Arc::new(BrokenSink),
            ScriptedProvider::new(vec![Ok(vec![finding()]), Ok(vec![finding()])]),
            Arc::new(Guard::new(GuardConfig::default())),
            ProcessorConfig::default(),
        );
        let mut jobs = Vec::new();
        for _ in 0..2 {
            let subject = Subject::new(SubjectId::new(), "x", "python");
            subjects.insert(subject.clone());
            let job = Job::new(subject.id);
            store.enqueue(job.clone()).await.unwrap();
            jobs.push(job);
        }

        let outcome = processor.process_once(5).await.unwrap();
        assert_eq!(outcome.processed, 2);
        assert_eq!(outcome.failed, 2);

        for job in jobs {
            let stored = store.get(job.id).await.unwrap().unwrap();
            assert_eq!(stored.status, JobStatus::Failed);
            assert_eq!(stored.attempts, 1);
            assert!(stored.lock_owner.is_none());
            assert_eq!(
                stored.last_error.as_deref(),
                Some("STORAGE: result sink error: value too long for type")
            );
        }
    }

    #[tokio::test]
    async fn subject_lookup_failure_is_recorded_on_the_job() {
        let store = InMemoryJobStore::arc();
        let provider = ScriptedProvider::new(vec![]);
        let processor = JobProcessor::new(
            store.clone(),
            Arc::new(BrokenSource),
            InMemoryResultSink::arc(),
            provider.clone(),
            Arc::new(Guard::new(GuardConfig::default())),
            ProcessorConfig::default(),
        );
        let job = Job::new(SubjectId::new());
        store.enqueue(job.clone()).await.unwrap();

        let outcome = processor.process_once(5).await.unwrap();
        assert_eq!(outcome.failed, 1);
        assert_eq!(provider.calls(), 0);

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.last_error.unwrap().starts_with("STORAGE:"));
    }

    #[tokio::test]
    async fn persistent_sink_failure_dead_letters() {
        let store = InMemoryJobStore::arc();
        let subjects = InMemorySubjectSource::arc();
        let processor = JobProcessor::new(
            store.clone(),
            subjects.clone(),
            Arc::new(BrokenSink),
            ScriptedProvider::new(vec![]),
            Arc::new(Guard::new(GuardConfig::default())),
            ProcessorConfig::default(),
        );
        let subject = Subject::new(SubjectId::new(), "x", "python");
        subjects.insert(subject.clone());
        let job = Job::new(subject.id);
        store.enqueue(job.clone()).await.unwrap();

        for _ in 0..3 {
            let mut current = store.get(job.id).await.unwrap().unwrap();
            current.not_before = None;
            store.put(current).unwrap();
            processor.process_once(1).await.unwrap();
        }

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Dead);
        assert_eq!(stored.attempts, 3);
    }

    #[tokio::test]
    async fn local_rate_limit_fails_without_provider_call() {
        let h = harness(
            vec![Ok(vec![finding()])],
            GuardConfig {
                rate_limit: 1,
                ..GuardConfig::default()
            },
        );
        let first = h.seed().await;
        let second = h.seed().await;

        let outcome = h.processor.process_once(5).await.unwrap();
        assert_eq!(outcome.processed, 2);
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(outcome.failed, 1);
        assert_eq!(h.provider.calls(), 1);

        let a = h.store.get(first.id).await.unwrap().unwrap();
        let b = h.store.get(second.id).await.unwrap().unwrap();
        let limited = if a.status == JobStatus::Failed { a } else { b };
        assert_eq!(limited.status, JobStatus::Failed);
        assert!(limited.last_error.unwrap().starts_with("RATE_LIMIT_LOCAL:"));
        // Rate-limit failures back off by at least the floor.
        assert!(limited.not_before.unwrap() >= Utc::now() + chrono::Duration::seconds(29));
    }

    #[tokio::test]
    async fn duplicate_results_still_succeed() {
        let store = InMemoryJobStore::arc();
        let subjects = InMemorySubjectSource::arc();
        let processor = JobProcessor::new(
            store.clone(),
            subjects.clone(),
            Arc::new(DuplicateSink),
            ScriptedProvider::new(vec![Ok(vec![finding()])]),
            Arc::new(Guard::new(GuardConfig::default())),
            ProcessorConfig::default(),
        );
        let subject = Subject::new(SubjectId::new(), "x", "python");
        subjects.insert(subject.clone());
        let job = Job::new(subject.id);
        store.enqueue(job.clone()).await.unwrap();

        let outcome = processor.process_once(1).await.unwrap();
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(store.get(job.id).await.unwrap().unwrap().status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn lost_lock_leaves_new_holder_in_charge() {
        let h = harness(vec![Ok(vec![finding()])], GuardConfig::default());
        let job = h.seed().await;
        let claimed = h
            .store
            .claim_next(&ClaimRequest {
                owner: "test-worker:1".to_string(),
                now: Utc::now(),
                lock_ttl: DEFAULT_LOCK_TTL,
            })
            .await
            .unwrap()
            .unwrap();

        // Another worker takes over the lock while we hold the results.
        let mut stolen = claimed.clone();
        stolen.lock_owner = Some("other-worker:9".to_string());
        h.store.put(stolen).unwrap();

        let result = h.processor.finalize_success(&claimed, "test-worker:1").await.unwrap();
        assert!(matches!(result, Finalized::LockLost));

        let stored = h.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert_eq!(stored.lock_owner.as_deref(), Some("other-worker:9"));
    }

    #[tokio::test]
    async fn claim_tokens_are_unique_and_prefixed() {
        let h = harness(vec![], GuardConfig::default());
        let a = h.processor.claim_token();
        let b = h.processor.claim_token();
        assert!(a.starts_with("test-worker:"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn permit_released_after_each_call() {
        let h = harness(
            vec![
                Ok(vec![finding()]),
                Err(ProviderError::new(ErrorCode::BadResponse, "garbage")),
            ],
            GuardConfig {
                max_concurrency: 1,
                ..GuardConfig::default()
            },
        );
        h.seed().await;
        h.seed().await;

        let outcome = h.processor.process_once(5).await.unwrap();
        assert_eq!(outcome.processed, 2);
        assert_eq!(h.processor.guard.in_flight(), 0);
    }
}
