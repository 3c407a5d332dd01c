//! Chat-completion transport.
//!
//! The trait is the seam between prompt/validation logic and the network.
//! [`HttpChatTransport`] speaks the OpenAI-compatible
//! `POST {base_url}/chat/completions` dialect.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::result::{ErrorCode, ProviderError};

const ERROR_BODY_PREVIEW: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub format_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub response_format: ResponseFormat,
}

impl ChatRequest {
    /// JSON-mode request with the given messages.
    pub fn json(model: impl Into<String>, messages: Vec<ChatMessage>, temperature: f32) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature,
            response_format: ResponseFormat {
                format_type: "json_object".to_string(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Sends one chat request and returns the raw text content of the first
/// choice. Implementations classify every failure.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<String, ProviderError>;
}

/// Map a non-success HTTP status to an error code. `None` for 2xx.
pub fn classify_status(status: u16) -> Option<ErrorCode> {
    match status {
        200..=299 => None,
        401 | 403 => Some(ErrorCode::Unauthorized),
        429 => Some(ErrorCode::RateLimitUpstream),
        500..=599 => Some(ErrorCode::Upstream5xx),
        400..=499 => Some(ErrorCode::Upstream4xx),
        _ => Some(ErrorCode::BadResponse),
    }
}

/// reqwest-backed transport with a hard per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpChatTransport {
    client: Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl HttpChatTransport {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::new(ErrorCode::Network, format!("http client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            timeout,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn send(&self, request: &ChatRequest) -> Result<String, ProviderError> {
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if let Some(code) = classify_status(status.as_u16()) {
            let body = response.text().await.unwrap_or_default();
            let preview: String = body.chars().take(ERROR_BODY_PREVIEW).collect();
            return Err(ProviderError::new(
                code,
                format!("upstream status {}: {}", status.as_u16(), preview),
            ));
        }

        let parsed: ChatResponse = response.json().await.map_err(map_reqwest_error)?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::bad_response("response has no message content"))
    }
}

#[async_trait]
impl ChatTransport for HttpChatTransport {
    async fn complete(&self, request: &ChatRequest) -> Result<String, ProviderError> {
        debug!(model = %request.model, endpoint = %self.endpoint(), "sending chat completion");

        // reqwest's own timeout covers the request; this bounds body reads too.
        match tokio::time::timeout(self.timeout, self.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::new(
                ErrorCode::Timeout,
                format!("no response within {} ms", self.timeout.as_millis()),
            )),
        }
    }
}

fn map_reqwest_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::new(ErrorCode::Timeout, err.to_string())
    } else if err.is_decode() {
        ProviderError::bad_response(format!("malformed completion body: {err}"))
    } else if let Some(code) = err.status().and_then(|s| classify_status(s.as_u16())) {
        ProviderError::new(code, err.to_string())
    } else {
        ProviderError::new(ErrorCode::Network, err.to_string())
    }
}
