use core::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Feedback category. Serialized in the wire vocabulary (`"STYLE"`, ...).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    Bug,
    Style,
    Performance,
    Security,
    Readability,
    Maintainability,
    Other,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Bug,
        Category::Style,
        Category::Performance,
        Category::Security,
        Category::Readability,
        Category::Maintainability,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Bug => "BUG",
            Category::Style => "STYLE",
            Category::Performance => "PERFORMANCE",
            Category::Security => "SECURITY",
            Category::Readability => "READABILITY",
            Category::Maintainability => "MAINTAINABILITY",
            Category::Other => "OTHER",
        }
    }

    /// Case-insensitive lookup; `None` for anything outside the enum.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(raw))
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Feedback severity.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl Severity {
    pub const ALL: [Severity; 3] = [Severity::Info, Severity::Warn, Severity::Error];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        Self::ALL
            .into_iter()
            .find(|s| s.as_str().eq_ignore_ascii_case(raw))
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One normalized piece of feedback produced by a provider call.
///
/// Only ever constructed from a response that passed
/// [`crate::protocol::validate_response`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultItem {
    pub category: Category,
    pub severity: Severity,
    pub message: String,
    pub suggestion: Option<String>,
    pub tags: Vec<String>,
    pub score_hint: Option<f64>,
}

impl ResultItem {
    pub fn new(category: Category, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            category,
            severity,
            message: message.into(),
            suggestion: None,
            tags: Vec::new(),
            score_hint: None,
        }
    }
}

/// Provider failure classification.
///
/// Every code carries a fixed retryable bit; callers consult
/// [`ErrorCode::retryable`] and never reclassify.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Provider switched off by configuration.
    RealDisabled,
    MissingApiKey,
    /// Upstream answered 401/403.
    Unauthorized,
    /// Upstream answered 429.
    RateLimitUpstream,
    #[serde(rename = "UPSTREAM_5XX")]
    Upstream5xx,
    #[serde(rename = "UPSTREAM_4XX")]
    Upstream4xx,
    Timeout,
    /// Payload unparseable or outside the response protocol.
    BadResponse,
    /// Local per-key rate limiter refused the attempt.
    RateLimitLocal,
    /// Connection-level failure before any HTTP status was received.
    Network,
    /// The subject to analyze no longer exists.
    SubjectNotFound,
    /// Reading the subject or writing results failed on our side.
    Storage,
}

impl ErrorCode {
    pub fn retryable(&self) -> bool {
        match self {
            ErrorCode::RateLimitUpstream
            | ErrorCode::Upstream5xx
            | ErrorCode::Timeout
            | ErrorCode::RateLimitLocal
            | ErrorCode::Network
            | ErrorCode::Storage => true,
            ErrorCode::RealDisabled
            | ErrorCode::MissingApiKey
            | ErrorCode::Unauthorized
            | ErrorCode::Upstream4xx
            | ErrorCode::BadResponse
            | ErrorCode::SubjectNotFound => false,
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ErrorCode::RateLimitLocal | ErrorCode::RateLimitUpstream)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::RealDisabled => "REAL_DISABLED",
            ErrorCode::MissingApiKey => "MISSING_API_KEY",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::RateLimitUpstream => "RATE_LIMIT_UPSTREAM",
            ErrorCode::Upstream5xx => "UPSTREAM_5XX",
            ErrorCode::Upstream4xx => "UPSTREAM_4XX",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::BadResponse => "BAD_RESPONSE",
            ErrorCode::RateLimitLocal => "RATE_LIMIT_LOCAL",
            ErrorCode::Network => "NETWORK",
            ErrorCode::SubjectNotFound => "SUBJECT_NOT_FOUND",
            ErrorCode::Storage => "STORAGE",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed provider error: a code plus operator-facing detail.
///
/// `Display` renders `"<CODE>: <message>"`, which is what ends up in a job's
/// `last_error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ProviderError {
    pub code: ErrorCode,
    pub message: String,
}

impl ProviderError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn bad_response(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadResponse, message)
    }

    pub fn retryable(&self) -> bool {
        self.code.retryable()
    }
}
