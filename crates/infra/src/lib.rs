//! Infrastructure layer: job storage, admission control, result persistence,
//! configuration, and the background worker.

pub mod config;
pub mod db;
pub mod guard;
pub mod jobs;
pub mod results;
pub mod subjects;
pub mod workers;


pub use config::{ConfigError, Settings};
pub use guard::{Guard, GuardConfig, GuardPermit};
pub use results::{InMemoryResultSink, PostgresResultSink, ResultSink, SinkError};
pub use subjects::{InMemorySubjectSource, PostgresSubjectSource, SourceError, SubjectSource};
