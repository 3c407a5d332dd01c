//! Where subject content comes from.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use feedq_core::{Subject, SubjectId};

#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("subject source error: {0}")]
    Storage(String),
}

/// Loads the subject a job refers to. `Ok(None)` means it no longer exists.
#[async_trait]
pub trait SubjectSource: Send + Sync {
    async fn fetch(&self, id: SubjectId) -> Result<Option<Subject>, SourceError>;
}

#[derive(Debug, Default)]
pub struct InMemorySubjectSource {
    subjects: RwLock<HashMap<SubjectId, Subject>>,
}

impl InMemorySubjectSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn insert(&self, subject: Subject) {
        if let Ok(mut subjects) = self.subjects.write() {
            subjects.insert(subject.id, subject);
        }
    }

    pub fn remove(&self, id: SubjectId) {
        if let Ok(mut subjects) = self.subjects.write() {
            subjects.remove(&id);
        }
    }
}

#[async_trait]
impl SubjectSource for InMemorySubjectSource {
    async fn fetch(&self, id: SubjectId) -> Result<Option<Subject>, SourceError> {
        let subjects = self
            .subjects
            .read()
            .map_err(|_| SourceError::Storage("subject lock poisoned".to_string()))?;
        Ok(subjects.get(&id).cloned())
    }
}

/// Reads from the `feedback_subjects` table.
#[derive(Debug, Clone)]
pub struct PostgresSubjectSource {
    pool: Arc<PgPool>,
}

impl PostgresSubjectSource {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl SubjectSource for PostgresSubjectSource {
    async fn fetch(&self, id: SubjectId) -> Result<Option<Subject>, SourceError> {
        let row = sqlx::query(
            "SELECT content, language, group_key FROM feedback_subjects WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| SourceError::Storage(format!("fetch subject {id}: {e}")))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let read = |e: sqlx::Error| SourceError::Storage(format!("subject row {id}: {e}"));
        Ok(Some(Subject {
            id,
            content: row.try_get("content").map_err(read)?,
            language: row.try_get("language").map_err(read)?,
            group_key: row.try_get("group_key").map_err(read)?,
        }))
    }
}
