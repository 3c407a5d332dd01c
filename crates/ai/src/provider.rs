use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use feedq_core::Subject;

use crate::protocol::{extract_json, system_prompt, user_prompt, validate_response};
use crate::result::{ErrorCode, ProviderError, ResultItem};
use crate::retry::RetrySchedule;
use crate::transport::{ChatMessage, ChatRequest, ChatTransport, HttpChatTransport};

/// Something that turns a subject into validated feedback items.
///
/// Errors are already classified; callers only look at the code and its
/// retryable bit.
#[async_trait]
pub trait FeedbackProvider: Send + Sync {
    async fn analyze(&self, subject: &Subject) -> Result<Vec<ResultItem>, ProviderError>;
}

/// Provider configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Administrative switch; when false every call fails `REAL_DISABLED`.
    pub enabled: bool,
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    /// Hard timeout per HTTP attempt.
    pub timeout: Duration,
    /// Character budget for subject content in the user prompt.
    pub max_code_chars: usize,
    pub max_items: usize,
    pub retry: RetrySchedule,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.2,
            timeout: Duration::from_secs(20),
            max_code_chars: 12_000,
            max_items: 20,
            retry: RetrySchedule::default(),
        }
    }
}

/// Chat-completion backed provider.
///
/// Generic over the transport so the protocol can be exercised without a
/// network.
#[derive(Debug, Clone)]
pub struct ChatFeedbackProvider<T> {
    config: ProviderConfig,
    transport: T,
}

impl ChatFeedbackProvider<HttpChatTransport> {
    /// Build the HTTP-backed provider.
    ///
    /// A missing key is not an error here; it surfaces per call as
    /// `MISSING_API_KEY` so the job records why it was dead-lettered.
    pub fn from_config(config: ProviderConfig) -> Result<Self, ProviderError> {
        let transport = HttpChatTransport::new(
            config.base_url.clone(),
            config.api_key.clone().unwrap_or_default(),
            config.timeout,
        )?;
        Ok(Self::new(config, transport))
    }
}

impl<T: ChatTransport> ChatFeedbackProvider<T> {
    pub fn new(config: ProviderConfig, transport: T) -> Self {
        Self { config, transport }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn preflight(&self) -> Result<(), ProviderError> {
        if !self.config.enabled {
            return Err(ProviderError::new(
                ErrorCode::RealDisabled,
                "feedback provider is disabled",
            ));
        }
        let has_key = self
            .config
            .api_key
            .as_deref()
            .is_some_and(|k| !k.trim().is_empty());
        if !has_key {
            return Err(ProviderError::new(
                ErrorCode::MissingApiKey,
                "no API key configured for feedback provider",
            ));
        }
        Ok(())
    }

    fn build_request(&self, subject: &Subject) -> ChatRequest {
        let (prompt, truncated) = user_prompt(subject, self.config.max_code_chars);
        if truncated {
            info!(
                subject_id = %subject.id,
                max_chars = self.config.max_code_chars,
                "subject content truncated for provider prompt"
            );
        }
        ChatRequest::json(
            self.config.model.clone(),
            vec![ChatMessage::system(system_prompt()), ChatMessage::user(prompt)],
            self.config.temperature,
        )
    }

    async fn attempt(&self, subject: &Subject) -> Result<Vec<ResultItem>, ProviderError> {
        self.preflight()?;
        let request = self.build_request(subject);
        let content = self.transport.complete(&request).await?;
        let value = extract_json(&content)?;
        let items = validate_response(&value, self.config.max_items)?;
        debug!(subject_id = %subject.id, items = items.len(), "provider response validated");
        Ok(items)
    }
}

#[async_trait]
impl<T: ChatTransport> FeedbackProvider for ChatFeedbackProvider<T> {
    async fn analyze(&self, subject: &Subject) -> Result<Vec<ResultItem>, ProviderError> {
        self.config.retry.run(move |_| self.attempt(subject)).await
    }
}
