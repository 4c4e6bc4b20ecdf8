//! Pipeline run state models

use crate::core::template::Template;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Overall status of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// State of a single step within a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "state")]
pub enum StepState {
    /// Not reached yet
    Pending,
    /// Currently executing
    Running { started_at: DateTime<Utc> },
    /// Finished successfully
    Succeeded {
        attempts: usize,
        finished_at: DateTime<Utc>,
    },
    /// Failed (after any automatic retries)
    Failed {
        error: String,
        attempts: usize,
        failed_at: DateTime<Utc>,
    },
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepState::Succeeded { .. } | StepState::Failed { .. })
    }
}

/// Recorded outcome of one step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub name: String,
    #[serde(flatten)]
    pub state: StepState,
}

/// One execution instance of a template's pipeline against a service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub service_id: String,
    pub template: String,
    pub status: RunStatus,

    /// Index of the step currently (or last) being executed
    pub current_step: usize,

    pub steps: Vec<StepOutcome>,

    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    /// Create a new run with all steps pending.
    pub fn new(service_id: &str, template: &Template) -> Self {
        PipelineRun {
            id: Uuid::new_v4(),
            service_id: service_id.to_string(),
            template: template.id.clone(),
            status: RunStatus::Running,
            current_step: 0,
            steps: template
                .steps
                .iter()
                .map(|s| StepOutcome {
                    name: s.name.clone(),
                    state: StepState::Pending,
                })
                .collect(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn mark_step_running(&mut self, index: usize) {
        self.current_step = index;
        if let Some(step) = self.steps.get_mut(index) {
            step.state = StepState::Running {
                started_at: Utc::now(),
            };
        }
    }

    pub fn mark_step_succeeded(&mut self, index: usize, attempts: usize) {
        if let Some(step) = self.steps.get_mut(index) {
            step.state = StepState::Succeeded {
                attempts,
                finished_at: Utc::now(),
            };
        }
    }

    pub fn mark_step_failed(&mut self, index: usize, error: String, attempts: usize) {
        if let Some(step) = self.steps.get_mut(index) {
            step.state = StepState::Failed {
                error,
                attempts,
                failed_at: Utc::now(),
            };
        }
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    /// Number of steps that reached `Succeeded`.
    pub fn succeeded_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.state, StepState::Succeeded { .. }))
            .count()
    }

    /// Error message of the first failed step, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.steps.iter().find_map(|s| match &s.state {
            StepState::Failed { error, .. } => Some(error.as_str()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::template::TemplateCatalog;

    #[test]
    fn test_run_step_tracking() {
        let catalog = TemplateCatalog::builtin();
        let template = catalog.get("simple-service").unwrap();
        let mut run = PipelineRun::new("svc-1", &template);

        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.steps.len(), 3);
        assert_eq!(run.succeeded_steps(), 0);

        run.mark_step_running(0);
        run.mark_step_succeeded(0, 1);
        run.mark_step_running(1);
        run.mark_step_failed(1, "build exploded".to_string(), 2);
        run.finish(RunStatus::Failed);

        assert_eq!(run.succeeded_steps(), 1);
        assert_eq!(run.last_error(), Some("build exploded"));
        assert!(run.status.is_terminal());
        assert!(run.finished_at.is_some());
        assert_eq!(run.steps[2].state, StepState::Pending);
    }
}
