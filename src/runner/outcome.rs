//! Operation outcome and error types

use thiserror::Error;

/// Error types for external operations
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Retryable condition: network timeout, rate limiting, transient
    /// remote unavailability
    #[error("transient failure: {0}")]
    Transient(String),

    /// Non-retryable condition: authentication failure, remote validation
    /// rejection, or any unclassified hard failure
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The operation exceeded its allotted duration
    #[error("timed out after {0} seconds")]
    Timeout(u64),
}

impl RunnerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RunnerError::Transient(_))
    }
}

/// Result of a completed operation
#[derive(Debug, Clone)]
pub struct OperationOutput {
    /// Exit status reported by the external tool (0 on success)
    pub exit_code: i32,

    /// Number of output lines streamed to the sink
    pub lines_emitted: usize,
}

impl OperationOutput {
    pub fn success(lines_emitted: usize) -> Self {
        OperationOutput {
            exit_code: 0,
            lines_emitted,
        }
    }
}
