//! Test: at most one active run per service

mod helpers;

use helpers::*;
use opsforge::core::RunStatus;
use opsforge::{OrchestratorError, StartRequest};
use std::time::Duration;

#[tokio::test]
async fn test_concurrent_starts_produce_one_winner() {
    let ctx = TestContext::new();
    ctx.runner
        .script("generate", MockOutcome::OkAfter(Duration::from_millis(200)));

    let alice = admin();
    let bob = developer();
    let first = ctx
        .orchestrator
        .start(&alice, StartRequest::new("my-api", "simple-service"));
    let second = ctx
        .orchestrator
        .start(&bob, StartRequest::new("my-api", "simple-service"));

    let (a, b) = tokio::join!(first, second);
    let (winner, loser) = match (a, b) {
        (Ok(receipt), Err(err)) | (Err(err), Ok(receipt)) => (receipt, err),
        other => panic!("expected exactly one winner, got {:?}", other),
    };

    assert!(
        matches!(loser, OrchestratorError::Conflict(_)),
        "loser should conflict, got: {}",
        loser
    );

    let status = ctx.orchestrator.wait_for(winner.run_id).await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);

    // exactly one service record and one run exist
    let services = ctx.orchestrator.list_services(true).await.unwrap();
    assert_eq!(services.len(), 1);
    let runs = ctx.orchestrator.list_runs(&winner.service.id).await.unwrap();
    assert_eq!(runs.len(), 1);
}

#[tokio::test]
async fn test_many_simultaneous_starts_one_winner() {
    let ctx = TestContext::new();
    ctx.runner
        .script("generate", MockOutcome::OkAfter(Duration::from_millis(200)));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let orchestrator = ctx.orchestrator.clone();
        handles.push(tokio::spawn(async move {
            orchestrator
                .start(&admin(), StartRequest::new("my-api", "simple-service"))
                .await
        }));
    }

    let mut winners = Vec::new();
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(receipt) => winners.push(receipt),
            Err(OrchestratorError::Conflict(_)) => conflicts += 1,
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(conflicts, 7);

    let winner = &winners[0];
    let status = ctx.orchestrator.wait_for(winner.run_id).await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);

    let services = ctx.orchestrator.list_services(true).await.unwrap();
    assert_eq!(services.len(), 1);
    let runs = ctx.orchestrator.list_runs(&winner.service.id).await.unwrap();
    assert_eq!(runs.len(), 1);
}

#[tokio::test]
async fn test_start_rejected_while_run_in_progress() {
    let ctx = TestContext::new();
    ctx.runner
        .script("generate", MockOutcome::OkAfter(Duration::from_millis(300)));

    let receipt = ctx.start("my-api", "simple-service").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = ctx.start("my-api", "simple-service").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Conflict(_)));

    let status = ctx.orchestrator.wait_for(receipt.run_id).await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);
}

#[tokio::test]
async fn test_duplicate_name_rejected_after_completion() {
    let ctx = TestContext::new();

    let (_, status) = ctx.start_and_wait("my-api", "simple-service").await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);

    // the service is now active, so the name is simply taken
    let err = ctx.start("my-api", "simple-service").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));
}

#[tokio::test]
async fn test_distinct_names_run_independently() {
    let ctx = TestContext::new();

    let alice = admin();
    let first = ctx
        .orchestrator
        .start(&alice, StartRequest::new("svc-one", "simple-service"));
    let second = ctx
        .orchestrator
        .start(&alice, StartRequest::new("svc-two", "simple-service"));

    let (a, b) = tokio::join!(first, second);
    let (a, b) = (a.unwrap(), b.unwrap());

    let (sa, sb) = tokio::join!(
        ctx.orchestrator.wait_for(a.run_id),
        ctx.orchestrator.wait_for(b.run_id)
    );
    assert_eq!(sa.unwrap(), RunStatus::Succeeded);
    assert_eq!(sb.unwrap(), RunStatus::Succeeded);
}
