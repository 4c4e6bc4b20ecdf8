//! Test: ordered, replayable, step-attributed log streams

mod helpers;

use helpers::*;
use opsforge::core::RunStatus;
use opsforge::StreamMessage;

#[tokio::test]
async fn test_sequences_are_gap_free_and_ordered() {
    let ctx = TestContext::new();
    ctx.runner.script(
        "build",
        MockOutcome::Ok(vec!["Step 1/3", "Step 2/3", "Step 3/3"]),
    );

    let (receipt, _) = ctx.start_and_wait("my-api", "simple-service").await.unwrap();

    let (events, status) = ctx
        .orchestrator
        .subscribe(receipt.run_id, 0)
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(status, Some(RunStatus::Succeeded));

    let seqs: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    let expected: Vec<u64> = (0..events.len() as u64).collect();
    assert_eq!(seqs, expected);
}

#[tokio::test]
async fn test_events_carry_step_attribution() {
    let ctx = TestContext::new();

    let (receipt, _) = ctx.start_and_wait("my-api", "simple-service").await.unwrap();
    let (events, _) = ctx
        .orchestrator
        .subscribe(receipt.run_id, 0)
        .await
        .unwrap()
        .collect()
        .await;

    // pre-pipeline events are attributed to initialization
    assert_eq!(events[0].step.as_deref(), Some("initialization"));
    assert!(events
        .iter()
        .any(|e| e.step.as_deref() == Some("generate")));
    assert!(events
        .iter()
        .any(|e| e.step.as_deref() == Some("publish")));
    // the final summary is a run-level event
    assert!(events.iter().any(|e| e.step.is_none()));
}

#[tokio::test]
async fn test_late_subscriber_sees_identical_replay() {
    let ctx = TestContext::new();

    let (receipt, _) = ctx.start_and_wait("my-api", "go-service").await.unwrap();

    let (first, _) = ctx
        .orchestrator
        .subscribe(receipt.run_id, 0)
        .await
        .unwrap()
        .collect()
        .await;
    let (second, _) = ctx
        .orchestrator
        .subscribe(receipt.run_id, 0)
        .await
        .unwrap()
        .collect()
        .await;

    assert!(!first.is_empty());
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_resume_from_sequence() {
    let ctx = TestContext::new();

    let (receipt, _) = ctx.start_and_wait("my-api", "simple-service").await.unwrap();

    let (all, _) = ctx
        .orchestrator
        .subscribe(receipt.run_id, 0)
        .await
        .unwrap()
        .collect()
        .await;
    let resume_at = all.len() as u64 / 2;

    let (tail, status) = ctx
        .orchestrator
        .subscribe(receipt.run_id, resume_at)
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(status, Some(RunStatus::Succeeded));
    assert_eq!(tail, all[resume_at as usize..]);
}

#[tokio::test]
async fn test_live_subscriber_reaches_terminal_marker() {
    let ctx = TestContext::new();
    ctx.runner.script(
        "generate",
        MockOutcome::OkAfter(std::time::Duration::from_millis(100)),
    );

    let receipt = ctx.start("my-api", "simple-service").await.unwrap();
    let mut stream = ctx
        .orchestrator
        .subscribe(receipt.run_id, 0)
        .await
        .unwrap();

    let mut last_seq = None;
    loop {
        match stream.next().await {
            Some(StreamMessage::Event(event)) => {
                if let Some(last) = last_seq {
                    assert_eq!(event.sequence, last + 1);
                }
                last_seq = Some(event.sequence);
            }
            Some(StreamMessage::Completed { status }) => {
                assert_eq!(status, RunStatus::Succeeded);
                break;
            }
            Some(StreamMessage::Gap { .. }) => panic!("unexpected gap"),
            None => panic!("stream ended without terminal marker"),
        }
    }
    assert!(last_seq.is_some());
}

#[tokio::test]
async fn test_persisted_logs_match_stream() {
    let ctx = TestContext::new();

    let (receipt, _) = ctx.start_and_wait("my-api", "simple-service").await.unwrap();

    let (streamed, _) = ctx
        .orchestrator
        .subscribe(receipt.run_id, 0)
        .await
        .unwrap()
        .collect()
        .await;
    let persisted = ctx.orchestrator.replay_logs(receipt.run_id).await.unwrap();

    assert_eq!(streamed, persisted);
}
