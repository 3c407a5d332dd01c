//! Result persistence.
//!
//! Rows are unique on `(subject_id, category, severity, message)`; inserting
//! an item that already exists is skipped, never an error. That makes a
//! re-run of the same job (after a crash or a lost lock) harmless.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use feedq_ai::{Category, ResultItem, Severity};
use feedq_core::SubjectId;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SinkError {
    /// The item is already stored. Callers treat this as success.
    #[error("result already stored: {0}")]
    Duplicate(String),
    #[error("result sink error: {0}")]
    Storage(String),
}

/// A persisted result item.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResult {
    pub id: Uuid,
    pub subject_id: SubjectId,
    pub item: ResultItem,
    pub created_at: DateTime<Utc>,
}

/// Writes result items for a subject. Returns how many were newly stored.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn insert_many(&self, subject_id: SubjectId, items: &[ResultItem]) -> Result<usize, SinkError>;
}

type ResultKey = (SubjectId, Category, Severity, String);

#[derive(Debug, Default)]
pub struct InMemoryResultSink {
    rows: RwLock<HashMap<ResultKey, StoredResult>>,
}

impl InMemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Stored items for a subject, oldest first.
    pub fn for_subject(&self, subject_id: SubjectId) -> Vec<StoredResult> {
        let Ok(rows) = self.rows.read() else {
            return Vec::new();
        };
        let mut found: Vec<_> = rows
            .values()
            .filter(|r| r.subject_id == subject_id)
            .cloned()
            .collect();
        found.sort_by_key(|r| (r.created_at, r.id));
        found
    }
}

#[async_trait]
impl ResultSink for InMemoryResultSink {
    async fn insert_many(&self, subject_id: SubjectId, items: &[ResultItem]) -> Result<usize, SinkError> {
        let mut rows = self
            .rows
            .write()
            .map_err(|_| SinkError::Storage("result lock poisoned".to_string()))?;

        let mut inserted = 0;
        for item in items {
            let key = (subject_id, item.category, item.severity, item.message.clone());
            if rows.contains_key(&key) {
                continue;
            }
            rows.insert(
                key,
                StoredResult {
                    id: Uuid::now_v7(),
                    subject_id,
                    item: item.clone(),
                    created_at: Utc::now(),
                },
            );
            inserted += 1;
        }
        Ok(inserted)
    }
}

/// Writes to the `feedback_results` table.
#[derive(Debug, Clone)]
pub struct PostgresResultSink {
    pool: Arc<PgPool>,
}

impl PostgresResultSink {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl ResultSink for PostgresResultSink {
    async fn insert_many(&self, subject_id: SubjectId, items: &[ResultItem]) -> Result<usize, SinkError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let mut inserted = 0;
        for item in items {
            let result = sqlx::query(
                r#"
                INSERT INTO feedback_results
                    (id, subject_id, category, severity, message, suggestion, tags, score_hint, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (subject_id, category, severity, message) DO NOTHING
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(subject_id.as_uuid())
            .bind(item.category.as_str())
            .bind(item.severity.as_str())
            .bind(&item.message)
            .bind(item.suggestion.as_deref())
            .bind(&item.tags)
            .bind(item.score_hint)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

            inserted += result.rows_affected() as usize;
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(inserted)
    }
}

fn map_sqlx_error(err: sqlx::Error) -> SinkError {
    match err {
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
            SinkError::Duplicate(db_err.message().to_string())
        }
        other => SinkError::Storage(other.to_string()),
    }
}
