use serde::{Deserialize, Serialize};

use crate::id::SubjectId;

/// The thing a feedback job analyzes.
///
/// `group_key` buckets subjects for local rate limiting (e.g. the author or
/// assignment a submission belongs to). `None` falls into a shared bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub id: SubjectId,
    pub content: String,
    pub language: String,
    pub group_key: Option<String>,
}

impl Subject {
    pub fn new(id: SubjectId, content: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            id,
            content: content.into(),
            language: language.into(),
            group_key: None,
        }
    }

    pub fn with_group_key(mut self, key: impl Into<String>) -> Self {
        self.group_key = Some(key.into());
        self
    }
}
