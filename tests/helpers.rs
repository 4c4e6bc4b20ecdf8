//! Test utility functions for opsforge
#![allow(dead_code)]

use async_trait::async_trait;
use opsforge::core::{LogLevel, RunStatus, StepDefinition};
use opsforge::orchestrator::{Orchestrator, Principal, Role, StartReceipt, StartRequest};
use opsforge::registry::InMemoryRegistry;
use opsforge::runner::{
    LineSink, OperationContext, OperationOutput, OperationRunner, OutputLine, RunnerError,
};
use opsforge::{OrchestratorError, TemplateCatalog};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Scripted result for one attempt of one step
pub enum MockOutcome {
    /// Succeed, emitting the given output lines
    Ok(Vec<&'static str>),
    /// Succeed after sleeping
    OkAfter(Duration),
    /// Fail with a transient error
    Transient(&'static str),
    /// Fail with a permanent error
    Permanent(&'static str),
}

type Hook = Box<dyn Fn(&str) + Send + Sync>;

/// Operation runner that plays back scripted outcomes per step name.
/// Unscripted steps succeed with a single output line.
pub struct MockRunner {
    outcomes: Mutex<HashMap<String, VecDeque<MockOutcome>>>,
    calls: Mutex<Vec<String>>,
    hook: Mutex<Option<Hook>>,
}

impl MockRunner {
    pub fn new() -> Self {
        MockRunner {
            outcomes: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            hook: Mutex::new(None),
        }
    }

    /// Queue an outcome for the next attempt of `step`.
    pub fn script(&self, step: &str, outcome: MockOutcome) {
        self.outcomes
            .lock()
            .unwrap()
            .entry(step.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Install a callback invoked with the step name at the start of each
    /// attempt.
    pub fn on_execute(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// Step names in execution order, one entry per attempt.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl OperationRunner for MockRunner {
    async fn execute(
        &self,
        step: &StepDefinition,
        _ctx: &OperationContext,
        sink: &dyn LineSink,
    ) -> Result<OperationOutput, RunnerError> {
        self.calls.lock().unwrap().push(step.name.clone());
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook(&step.name);
        }

        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .get_mut(&step.name)
            .and_then(|queue| queue.pop_front());

        match outcome {
            None => {
                sink.on_line(&OutputLine {
                    text: format!("{} done", step.name),
                    level: LogLevel::Info,
                });
                Ok(OperationOutput::success(1))
            }
            Some(MockOutcome::Ok(lines)) => {
                for line in &lines {
                    sink.on_line(&OutputLine::classify(line.to_string(), LogLevel::Info));
                }
                Ok(OperationOutput::success(lines.len()))
            }
            Some(MockOutcome::OkAfter(delay)) => {
                tokio::time::sleep(delay).await;
                sink.on_line(&OutputLine {
                    text: format!("{} done", step.name),
                    level: LogLevel::Info,
                });
                Ok(OperationOutput::success(1))
            }
            Some(MockOutcome::Transient(msg)) => Err(RunnerError::Transient(msg.to_string())),
            Some(MockOutcome::Permanent(msg)) => Err(RunnerError::Permanent(msg.to_string())),
        }
    }
}

/// Everything a scenario needs: a shared registry, the mock runner and the
/// facade built on top of them
pub struct TestContext {
    pub registry: Arc<InMemoryRegistry>,
    pub runner: Arc<MockRunner>,
    pub orchestrator: Arc<Orchestrator>,
}

impl TestContext {
    pub fn new() -> Self {
        let registry = Arc::new(InMemoryRegistry::new());
        let runner = Arc::new(MockRunner::new());
        let orchestrator = Arc::new(Orchestrator::new(
            registry.clone(),
            runner.clone(),
            TemplateCatalog::builtin(),
        ));
        TestContext {
            registry,
            runner,
            orchestrator,
        }
    }

    /// Start a provisioning run as admin.
    pub async fn start(
        &self,
        name: &str,
        template: &str,
    ) -> Result<StartReceipt, OrchestratorError> {
        self.orchestrator
            .start(&admin(), StartRequest::new(name, template))
            .await
    }

    /// Start and follow the run to its terminal status.
    pub async fn start_and_wait(
        &self,
        name: &str,
        template: &str,
    ) -> Result<(StartReceipt, RunStatus), OrchestratorError> {
        let receipt = self.start(name, template).await?;
        let status = self.orchestrator.wait_for(receipt.run_id).await?;
        Ok((receipt, status))
    }
}

pub fn admin() -> Principal {
    Principal::new("alice", Role::Admin)
}

pub fn developer() -> Principal {
    Principal::new("devon", Role::Developer)
}

pub fn viewer() -> Principal {
    Principal::new("vera", Role::Viewer)
}
