//! Single-step execution with timeout and retry policy

use crate::core::{LogLevel, StepDefinition};
use crate::runner::{LineSink, OperationContext, OperationOutput, OperationRunner, OutputLine, RunnerError};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Initial retry backoff; doubles on each subsequent attempt.
pub const DEFAULT_BACKOFF_MS: u64 = 500;

/// Executes one step, enforcing its timeout and retrying transient
/// failures within the step's retry budget.
pub struct StepRunner {
    runner: Arc<dyn OperationRunner>,
    backoff_ms: u64,
}

impl StepRunner {
    pub fn new(runner: Arc<dyn OperationRunner>) -> Self {
        StepRunner {
            runner,
            backoff_ms: DEFAULT_BACKOFF_MS,
        }
    }

    /// Override the backoff base, mainly to keep tests fast.
    pub fn with_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.backoff_ms = backoff_ms;
        self
    }

    /// Retries allowed after the first attempt. Non-idempotent steps get
    /// at most one transient retry regardless of their configured budget.
    fn retry_budget(step: &StepDefinition) -> usize {
        if step.idempotent {
            step.max_retries
        } else {
            step.max_retries.min(1)
        }
    }

    /// A timed-out operation may still have taken effect remotely, so a
    /// timeout is only retried when the step is idempotent.
    fn retryable(step: &StepDefinition, err: &RunnerError) -> bool {
        match err {
            RunnerError::Transient(_) => true,
            RunnerError::Timeout(_) => step.idempotent,
            RunnerError::Permanent(_) => false,
        }
    }

    /// Run the step to completion. Returns the output and the number of
    /// attempts made, or the final error and the attempts spent.
    pub async fn run(
        &self,
        step: &StepDefinition,
        ctx: &OperationContext,
        sink: &dyn LineSink,
    ) -> Result<(OperationOutput, usize), (RunnerError, usize)> {
        let budget = Self::retry_budget(step);
        let mut attempts = 0;

        loop {
            attempts += 1;

            let outcome = tokio::time::timeout(
                Duration::from_secs(step.timeout_secs),
                self.runner.execute(step, ctx, sink),
            )
            .await
            .unwrap_or(Err(RunnerError::Timeout(step.timeout_secs)));

            match outcome {
                Ok(output) => return Ok((output, attempts)),
                Err(err) => {
                    let retries_left = budget.saturating_sub(attempts - 1);
                    if retries_left == 0 || !Self::retryable(step, &err) {
                        return Err((err, attempts));
                    }

                    let delay = self.backoff_ms * (1 << (attempts - 1).min(6));
                    warn!(
                        "step '{}' attempt {} failed ({}), retrying in {}ms",
                        step.name, attempts, err, delay
                    );
                    sink.on_line(&OutputLine {
                        text: format!(
                            "⚠️ Attempt {} of '{}' failed: {}. Retrying in {}ms",
                            attempts, step.name, err, delay
                        ),
                        level: LogLevel::Warning,
                    });
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }
    }
}
