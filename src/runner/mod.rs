//! External operation runner
//!
//! One step of a pipeline maps to one external operation (image build,
//! git push, pull request, sync trigger, ...). The runner executes a single
//! operation and streams its output lines to the caller as they are
//! produced, so the log broker can forward near-real-time progress.

pub mod outcome;
pub mod process;

use crate::core::{LogLevel, StepDefinition};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

pub use outcome::{OperationOutput, RunnerError};
pub use process::{ProcessRunner, ToolConfig};

/// Context an operation executes against
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub service_id: String,
    pub service_name: String,
    pub namespace: String,
    pub template_id: String,
    pub config: BTreeMap<String, Value>,
    pub env: BTreeMap<String, String>,
}

/// One line of output produced by an operation
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub text: String,
    pub level: LogLevel,
}

impl OutputLine {
    /// Classify a raw line: inline markers win, otherwise the stream
    /// default applies.
    pub fn classify(text: String, default: LogLevel) -> Self {
        let level = LogLevel::from_markers(&text).unwrap_or(default);
        OutputLine { text, level }
    }
}

/// Receives output lines as an operation produces them
pub trait LineSink: Send + Sync {
    fn on_line(&self, line: &OutputLine);
}

/// Sink that discards all lines
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl LineSink for NoopSink {
    fn on_line(&self, _line: &OutputLine) {}
}

/// Trait for executing one external operation.
///
/// Implementations classify failures as [`RunnerError::Transient`]
/// (retryable: network timeouts, rate limiting) or
/// [`RunnerError::Permanent`] (authentication failures, remote validation
/// rejections).
#[async_trait]
pub trait OperationRunner: Send + Sync {
    async fn execute(
        &self,
        step: &StepDefinition,
        ctx: &OperationContext,
        sink: &dyn LineSink,
    ) -> Result<OperationOutput, RunnerError>;
}
