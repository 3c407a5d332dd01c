//! Feedback job queue with retry, backoff, and dead-letter handling.
//!
//! ## Design
//!
//! - One job per "analyze this subject" request; at most one unfinished job
//!   per subject
//! - Claims are atomic and carry a unique lock token; a lock older than the
//!   TTL is treated as abandoned and the job becomes claimable again
//! - Failures back off exponentially; configuration errors and exhausted
//!   attempts dead-letter the job
//! - Result writes are idempotent, so a job may safely run twice
//!
//! ## Components
//!
//! - `Job` / `RetryPolicy`: job model and failure state machine
//! - `JobStore`: claim/finalize contract (in-memory or Postgres)
//! - `JobProcessor`: runs one batch from claim to finalize

pub mod postgres;
pub mod processor;
pub mod store;
pub mod types;

pub use postgres::PostgresJobStore;
pub use processor::{BatchOutcome, JobProcessor, ProcessError, ProcessorConfig};
pub use store::{
    ClaimRequest, EnqueueOutcome, InMemoryJobStore, JobPatch, JobStats, JobStore, JobStoreError,
    UpdateCondition,
};
pub use types::{
    FailureTransition, Job, JobStatus, RetryPolicy, DEFAULT_LOCK_TTL, DEFAULT_MAX_ATTEMPTS,
};
