//! `feedq-worker`: process entry points for the feedback pipeline.

pub mod app;
pub mod cli;
