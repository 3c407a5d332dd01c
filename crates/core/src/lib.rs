//! `feedq-core`: shared identifiers and the analysis subject.
//!
//! This crate has no infrastructure concerns: no I/O, no async runtime.

pub mod error;
pub mod id;
pub mod subject;

pub use error::DomainError;
pub use id::{JobId, SubjectId};
pub use subject::Subject;
