//! Background workers.

pub mod feedback_worker;

pub use feedback_worker::{FeedbackWorker, FeedbackWorkerConfig, WorkerHandle};
