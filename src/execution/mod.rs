//! Pipeline execution
//!
//! [`StepRunner`] wraps a single operation with its timeout and retry
//! policy; [`PipelineExecutor`] drives a run through its template's steps,
//! publishing log events and persisting state transitions as it goes.

pub mod executor;
pub mod step_runner;

pub use executor::PipelineExecutor;
pub use step_runner::{StepRunner, DEFAULT_BACKOFF_MS};
