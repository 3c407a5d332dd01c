//! `feedq-ai`
//!
//! **Responsibility:** the provider boundary of the feedback pipeline.
//!
//! - Builds the instruction/user prompts and calls a chat-completion service.
//! - Classifies every failure into exactly one [`ErrorCode`] with a fixed
//!   retryable bit before it leaves this crate.
//! - Treats model output as untrusted: responses are validated fail-closed
//!   (any unknown key rejects the whole payload) and normalized before
//!   anything reaches storage.
//!
//! This crate knows nothing about jobs, locks or persistence.

pub mod protocol;
pub mod provider;
pub mod result;
pub mod retry;
pub mod transport;

pub use provider::{ChatFeedbackProvider, FeedbackProvider, ProviderConfig};
pub use result::{Category, ErrorCode, ProviderError, ResultItem, Severity};
pub use retry::RetrySchedule;
pub use transport::{ChatMessage, ChatRequest, ChatTransport, HttpChatTransport};
