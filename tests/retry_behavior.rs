//! Test: transient failures are retried with a warning trail

mod helpers;

use helpers::*;
use opsforge::core::{LogLevel, RunStatus, StepState};

#[tokio::test]
async fn test_transient_failure_retried_to_success() {
    let ctx = TestContext::new();
    ctx.runner
        .script("publish", MockOutcome::Transient("connection reset by peer"));

    let (receipt, status) = ctx.start_and_wait("my-api", "simple-service").await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);

    // publish ran twice, everything else once
    assert_eq!(
        ctx.runner.calls(),
        vec!["generate", "build", "publish", "publish"]
    );

    let run = ctx.orchestrator.get_run(receipt.run_id).await.unwrap();
    let publish = run.steps.iter().find(|s| s.name == "publish").unwrap();
    assert!(matches!(publish.state, StepState::Succeeded { attempts: 2, .. }));
}

#[tokio::test]
async fn test_retry_emits_warning_event() {
    let ctx = TestContext::new();
    ctx.runner
        .script("publish", MockOutcome::Transient("503 service unavailable"));

    let (receipt, status) = ctx.start_and_wait("my-api", "simple-service").await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);

    let run = ctx.orchestrator.get_run(receipt.run_id).await.unwrap();
    let publish = run.steps.iter().find(|s| s.name == "publish").unwrap();
    assert!(matches!(publish.state, StepState::Succeeded { attempts: 2, .. }));

    let (events, _) = ctx
        .orchestrator
        .subscribe(receipt.run_id, 0)
        .await
        .unwrap()
        .collect()
        .await;
    let warning = events
        .iter()
        .find(|e| e.level == LogLevel::Warning)
        .expect("a retry warning");
    assert_eq!(warning.step.as_deref(), Some("publish"));
    assert!(warning.message.contains("Retrying"));
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let ctx = TestContext::new();
    ctx.runner
        .script("publish", MockOutcome::Permanent("invalid image reference"));

    let (receipt, status) = ctx.start_and_wait("my-api", "simple-service").await.unwrap();
    assert_eq!(status, RunStatus::Failed);

    // exactly one attempt for the failing step
    let attempts = ctx
        .runner
        .calls()
        .iter()
        .filter(|name| name.as_str() == "publish")
        .count();
    assert_eq!(attempts, 1);

    let run = ctx.orchestrator.get_run(receipt.run_id).await.unwrap();
    let publish = run.steps.iter().find(|s| s.name == "publish").unwrap();
    assert!(matches!(publish.state, StepState::Failed { attempts: 1, .. }));
}
