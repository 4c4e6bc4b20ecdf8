//! Pipeline executor
//!
//! Drives one run through its template's steps in order. Cancellation is
//! cooperative and observed at step boundaries only; a step that has
//! started always runs to completion.

use crate::broker::LogBroker;
use crate::core::{LogLevel, PipelineRun, RunStatus, Service, ServiceState, Template};
use crate::execution::StepRunner;
use crate::registry::ServiceRegistry;
use crate::runner::{LineSink, OperationContext, OperationRunner, OutputLine};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Sink that forwards operation output into the broker, attributed to the
/// step currently executing.
struct BrokerSink {
    broker: Arc<LogBroker>,
    run_id: Uuid,
    step: String,
}

impl LineSink for BrokerSink {
    fn on_line(&self, line: &OutputLine) {
        self.broker
            .publish(self.run_id, Some(&self.step), line.level, &line.text);
    }
}

pub struct PipelineExecutor {
    registry: Arc<dyn ServiceRegistry>,
    broker: Arc<LogBroker>,
    steps: StepRunner,
}

impl PipelineExecutor {
    pub fn new(
        registry: Arc<dyn ServiceRegistry>,
        broker: Arc<LogBroker>,
        runner: Arc<dyn OperationRunner>,
    ) -> Self {
        PipelineExecutor {
            registry,
            broker,
            steps: StepRunner::new(runner),
        }
    }

    pub fn with_step_runner(mut self, steps: StepRunner) -> Self {
        self.steps = steps;
        self
    }

    /// Execute the run to a terminal status. Always releases the service's
    /// run lock, persists the final run snapshot and closes the log stream,
    /// whatever path the run takes.
    pub async fn run(
        &self,
        mut run: PipelineRun,
        service: Service,
        template: Arc<Template>,
        ctx: OperationContext,
        cancel: Arc<AtomicBool>,
    ) -> PipelineRun {
        info!(
            "run {} started for service {} ({} steps)",
            run.id,
            service.id,
            template.steps.len()
        );

        for (index, step) in template.steps.iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                self.broker.publish(
                    run.id,
                    None,
                    LogLevel::Warning,
                    &format!("⚠️ Run cancelled after {} steps", run.succeeded_steps()),
                );
                run.finish(RunStatus::Cancelled);
                break;
            }

            run.mark_step_running(index);
            self.persist(&run).await;
            self.broker.publish(
                run.id,
                Some(&step.name),
                LogLevel::Info,
                &format!(
                    "Starting step {}/{}: {} ({})",
                    index + 1,
                    template.steps.len(),
                    step.name,
                    step.kind
                ),
            );

            let sink = BrokerSink {
                broker: self.broker.clone(),
                run_id: run.id,
                step: step.name.clone(),
            };

            match self.steps.run(step, &ctx, &sink).await {
                Ok((_, attempts)) => {
                    run.mark_step_succeeded(index, attempts);
                    self.persist(&run).await;
                    self.broker.publish(
                        run.id,
                        Some(&step.name),
                        LogLevel::Success,
                        &format!("✅ Step {} completed", step.name),
                    );
                }
                Err((err, attempts)) => {
                    run.mark_step_failed(index, err.to_string(), attempts);
                    run.finish(RunStatus::Failed);
                    self.broker.publish(
                        run.id,
                        Some(&step.name),
                        LogLevel::Error,
                        &format!("❌ Step {} failed: {}", step.name, err),
                    );
                    break;
                }
            }
        }

        if run.status == RunStatus::Running {
            run.finish(RunStatus::Succeeded);
            self.broker.publish(
                run.id,
                None,
                LogLevel::Success,
                &format!("✅ Provisioning of {} completed", service.name),
            );
        }

        self.finalize_service(&service, run.status).await;
        self.persist(&run).await;

        // snapshot before closing so the persisted log matches what a
        // subscriber replaying from 0 would see
        let events = self.broker.snapshot(run.id);
        if let Err(e) = self.registry.save_logs(run.id, &events).await {
            error!("failed to persist logs for run {}: {}", run.id, e);
        }

        // the slot must be free before the terminal marker lands, so a
        // caller woken by the marker never sees a stale lock
        if let Err(e) = self.registry.release_run_lock(&service.id, run.id).await {
            error!("failed to release run lock for {}: {}", service.id, e);
        }
        self.broker.complete(run.id, run.status);

        info!("run {} finished: {}", run.id, run.status);
        run
    }

    async fn persist(&self, run: &PipelineRun) {
        if let Err(e) = self.registry.save_run(run).await {
            error!("failed to persist run {}: {}", run.id, e);
        }
    }

    /// Move the service out of `creating` when the run settles the
    /// question. A cancelled creation stays in `creating` so a later run
    /// can pick it up.
    async fn finalize_service(&self, service: &Service, status: RunStatus) {
        if service.state != ServiceState::Creating {
            return;
        }
        let target = match status {
            RunStatus::Succeeded => ServiceState::Active,
            RunStatus::Failed => ServiceState::Failed,
            RunStatus::Cancelled | RunStatus::Running => return,
        };
        if let Err(e) = self.registry.update_state(&service.id, target).await {
            error!(
                "failed to transition service {} to {}: {}",
                service.id, target, e
            );
        }
    }
}
