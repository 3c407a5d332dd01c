//! Postgres-backed job store.
//!
//! ## Claiming
//!
//! `claim_next` is a single `UPDATE ... WHERE id = (SELECT ... FOR UPDATE SKIP LOCKED)`.
//! Concurrent claimers skip rows another transaction is locking instead of
//! blocking on them, so each claimable row goes to exactly one caller.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (enqueue, primary key) |
//! | Database (other) | Any other | `Storage` |
//! | Row decode failure | N/A | `InvalidRow` |
//! | PoolClosed / Other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use feedq_core::{JobId, SubjectId};

use super::store::{
    ClaimRequest, EnqueueOutcome, JobPatch, JobStats, JobStore, JobStoreError, UpdateCondition,
};
use super::types::{lock_cutoff, Job, JobStatus};

const JOB_COLUMNS: &str = "id, subject_id, group_key, status, attempts, max_attempts, \
     not_before, locked_at, lock_owner, last_error, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn active_for(&self, subject_id: SubjectId) -> Result<Option<JobId>, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT id FROM feedback_jobs
            WHERE subject_id = $1 AND status IN ('pending', 'running', 'failed')
            LIMIT 1
            "#,
        )
        .bind(subject_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("active_for", e))?;

        row.map(|r| {
            r.try_get::<uuid::Uuid, _>("id")
                .map(JobId::from_uuid)
                .map_err(|e| JobStoreError::InvalidRow(e.to_string()))
        })
        .transpose()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, subject_id = %job.subject_id), err)]
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome, JobStoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO feedback_jobs
                (id, subject_id, group_key, status, attempts, max_attempts,
                 not_before, locked_at, lock_owner, last_error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (subject_id) WHERE status IN ('pending', 'running', 'failed')
            DO NOTHING
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.subject_id.as_uuid())
        .bind(job.group_key.as_deref())
        .bind(job.status.as_str())
        .bind(to_i32("attempts", job.attempts)?)
        .bind(to_i32("max_attempts", job.max_attempts)?)
        .bind(job.not_before)
        .bind(job.locked_at)
        .bind(job.lock_owner.as_deref())
        .bind(job.last_error.as_deref())
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("enqueue", e)
            }
        })?;

        if inserted.rows_affected() == 1 {
            return Ok(EnqueueOutcome::Created(job.id));
        }

        // The active job may finish between the conflict and this read.
        match self.active_for(job.subject_id).await? {
            Some(existing) => Ok(EnqueueOutcome::Duplicate(existing)),
            None => Err(JobStoreError::Storage(format!(
                "enqueue for subject {} conflicted but no active job was found",
                job.subject_id
            ))),
        }
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM feedback_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self, claim), fields(owner = %claim.owner), err)]
    async fn claim_next(&self, claim: &ClaimRequest) -> Result<Option<Job>, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE feedback_jobs
            SET status = 'running', locked_at = $1, lock_owner = $2, updated_at = $1
            WHERE id = (
                SELECT id FROM feedback_jobs
                WHERE status IN ('pending', 'failed', 'running')
                  AND (not_before IS NULL OR not_before <= $1)
                  AND (locked_at IS NULL OR locked_at <= $3)
                ORDER BY created_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(claim.now)
            .bind(&claim.owner)
            .bind(lock_cutoff(claim.now, claim.lock_ttl))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self, patch), fields(job_id = %id, status = patch.status.as_str()), err)]
    async fn update(
        &self,
        id: JobId,
        condition: UpdateCondition,
        patch: JobPatch,
    ) -> Result<Option<Job>, JobStoreError> {
        let owner = match &condition {
            UpdateCondition::Always => None,
            UpdateCondition::LockedBy(owner) => Some(owner.as_str()),
        };

        let sql = format!(
            r#"
            UPDATE feedback_jobs
            SET status = $2,
                attempts = $3,
                not_before = $4,
                last_error = COALESCE($5, last_error),
                locked_at = NULL,
                lock_owner = NULL,
                updated_at = $6
            WHERE id = $1 AND ($7::text IS NULL OR lock_owner = $7)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(patch.status.as_str())
            .bind(to_i32("attempts", patch.attempts)?)
            .bind(patch.not_before)
            .bind(patch.last_error.as_deref())
            .bind(patch.updated_at)
            .bind(owner)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM feedback_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| JobStoreError::InvalidRow(e.to_string()))?;
            let total: i64 = row
                .try_get("total")
                .map_err(|e| JobStoreError::InvalidRow(e.to_string()))?;
            let status = JobStatus::parse(&status)
                .ok_or_else(|| JobStoreError::InvalidRow(format!("unknown status {status:?}")))?;
            stats.add(status, usize::try_from(total).unwrap_or(0));
        }
        Ok(stats)
    }
}

fn to_i32(field: &str, value: u32) -> Result<i32, JobStoreError> {
    i32::try_from(value).map_err(|_| JobStoreError::InvalidRow(format!("{field} out of range: {value}")))
}

fn to_u32(field: &str, value: i32) -> Result<u32, JobStoreError> {
    u32::try_from(value).map_err(|_| JobStoreError::InvalidRow(format!("{field} is negative: {value}")))
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    subject_id: uuid::Uuid,
    group_key: Option<String>,
    status: String,
    attempts: i32,
    max_attempts: i32,
    not_before: Option<DateTime<Utc>>,
    locked_at: Option<DateTime<Utc>>,
    lock_owner: Option<String>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            subject_id: row.try_get("subject_id")?,
            group_key: row.try_get("group_key")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            not_before: row.try_get("not_before")?,
            locked_at: row.try_get("locked_at")?,
            lock_owner: row.try_get("lock_owner")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| JobStoreError::InvalidRow(format!("unknown status {:?}", row.status)))?;
        Ok(Job {
            id: JobId::from_uuid(row.id),
            subject_id: SubjectId::from_uuid(row.subject_id),
            group_key: row.group_key,
            status,
            attempts: to_u32("attempts", row.attempts)?,
            max_attempts: to_u32("max_attempts", row.max_attempts)?,
            not_before: row.not_before,
            locked_at: row.locked_at,
            lock_owner: row.lock_owner,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    use sqlx::FromRow;
    let raw = JobRow::from_row(row)
        .map_err(|e| JobStoreError::InvalidRow(format!("failed to deserialize job row: {e}")))?;
    Job::try_from(raw)
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
