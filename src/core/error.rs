//! Error taxonomy for the orchestrator facade

use thiserror::Error;

/// Errors surfaced synchronously by facade operations.
///
/// Failures that happen after a run has started are never returned through
/// this type; they surface as error-level log events and the run's terminal
/// status.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Malformed or schema-violating request; nothing was persisted
    #[error("validation failed: {0}")]
    Validation(String),

    /// Invariant violation: duplicate name, concurrent run, or lifecycle
    /// change while a run is active
    #[error("conflict: {0}")]
    Conflict(String),

    /// Unknown service, run or template
    #[error("not found: {0}")]
    NotFound(String),

    /// The principal lacks the role required for the operation
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("registry error: {0}")]
    Registry(#[from] crate::registry::RegistryError),

    #[error("internal error: {0}")]
    Internal(String),
}
