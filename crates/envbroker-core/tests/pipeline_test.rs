// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step manager behavior against an in-memory store.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use common::*;
use envbroker_core::{
    Classify, CollectingEventSink, Error, Operation, OperationState, OperationStore,
    OperationType, Pipeline, StepManager, Transitions,
};
use serde_json::json;

#[tokio::test]
async fn test_steps_run_in_weight_order() {
    let store = sqlite_store().await;
    insert_pending(store.as_ref(), "op-1").await;
    let log = CallLog::default();
    let events = Arc::new(CollectingEventSink::new());

    let pipeline = Pipeline::builder()
        .step(10, RecordingStep::new("w10", &log))
        .step(5, RecordingStep::new("w5a", &log))
        .step(5, RecordingStep::new("w5b", &log))
        .init_step(RecordingStep::new("w0", &log))
        .build();
    let manager = StepManager::new(store.clone(), pipeline).with_event_sink(events.clone());

    let delay = manager.execute("op-1").await.unwrap();

    assert_eq!(delay, Duration::ZERO);
    assert_eq!(log.calls(), vec!["w0", "w5a", "w5b", "w10"]);
    assert_eq!(events.step_names(), vec!["w0", "w5a", "w5b", "w10"]);
}

#[tokio::test]
async fn test_false_condition_skips_step_and_event() {
    let store = sqlite_store().await;
    insert_pending(store.as_ref(), "op-1").await;
    let log = CallLog::default();
    let events = Arc::new(CollectingEventSink::new());

    let pipeline = Pipeline::builder()
        .step(1, RecordingStep::new("always", &log))
        .step_if(2, RecordingStep::new("enterprise_only", &log), |op: &Operation| {
            op.parameter("plan") == Some("enterprise")
        })
        .step_if(3, RecordingStep::new("trial_only", &log), |op: &Operation| {
            op.parameter("plan") == Some("trial")
        })
        .build();
    let manager = StepManager::new(store.clone(), pipeline).with_event_sink(events.clone());

    manager.execute("op-1").await.unwrap();

    assert_eq!(log.calls(), vec!["always", "trial_only"]);
    assert_eq!(events.step_names(), vec!["always", "trial_only"]);
    let stored = store.get_by_id("op-1").await.unwrap();
    assert_eq!(stored.version, 1);
}

#[tokio::test]
async fn test_terminal_operation_runs_no_steps() {
    let store = sqlite_store().await;
    for (id, state) in [
        ("done", OperationState::Succeeded),
        ("broken", OperationState::Failed),
        ("stopped", OperationState::Canceled),
    ] {
        let mut op = Operation::with_id(id, "instance-1", OperationType::Provision, json!({}));
        op.state = state;
        store.insert(&op).await.unwrap();
    }
    let log = CallLog::default();
    let events = Arc::new(CollectingEventSink::new());
    let pipeline = Pipeline::builder()
        .init_step(RecordingStep::new("init", &log))
        .build();
    let manager = StepManager::new(store.clone(), pipeline).with_event_sink(events.clone());

    for id in ["done", "broken", "stopped"] {
        assert_eq!(manager.execute(id).await.unwrap(), Duration::ZERO);
        assert_eq!(store.get_by_id(id).await.unwrap().version, 0);
    }
    assert!(log.calls().is_empty());
    assert!(events.events().is_empty());
}

#[tokio::test]
async fn test_requeue_then_succeed_scenario() {
    let store = sqlite_store().await;
    insert_pending(store.as_ref(), "op-1").await;
    let transitions = Transitions::new(store.clone());
    let log = CallLog::default();

    let pipeline = Pipeline::builder()
        .step(1, RecordingStep::new("step_a", &log))
        .step(
            2,
            RequeueThenSucceed {
                calls: Arc::new(AtomicU32::new(0)),
                delay: Duration::from_secs(10),
                transitions,
            },
        )
        .build();
    let manager = StepManager::new(store.clone(), pipeline);

    let first = manager.execute("op-1").await.unwrap();
    assert_eq!(first, Duration::from_secs(10));
    let stored = store.get_by_id("op-1").await.unwrap();
    assert_eq!(stored.state, OperationState::InProgress);
    assert_eq!(stored.version, 1);

    let second = manager.execute("op-1").await.unwrap();
    assert_eq!(second, Duration::ZERO);
    let stored = store.get_by_id("op-1").await.unwrap();
    assert_eq!(stored.state, OperationState::Succeeded);
    assert_eq!(stored.version, 2);

    // Step A ran again on the second invocation.
    assert_eq!(log.calls(), vec!["step_a", "step_a"]);
}

#[tokio::test]
async fn test_resume_does_not_repeat_downstream_calls() {
    let store = sqlite_store().await;
    insert_pending(store.as_ref(), "op-1").await;
    let transitions = Transitions::new(store.clone());
    let downstream_calls = Arc::new(AtomicU32::new(0));
    let polls = Arc::new(AtomicU32::new(0));

    let pipeline = Pipeline::builder()
        .step(
            1,
            CreateOnce {
                downstream_calls: downstream_calls.clone(),
                transitions: transitions.clone(),
            },
        )
        .step(
            2,
            PollUntilReady {
                polls: polls.clone(),
                ready_after: 3,
                interval: Duration::from_secs(30),
            },
        )
        .step(10, Finish { transitions })
        .build();
    let manager = StepManager::new(store.clone(), pipeline);

    assert_eq!(manager.execute("op-1").await.unwrap(), Duration::from_secs(30));
    assert_eq!(manager.execute("op-1").await.unwrap(), Duration::from_secs(30));
    assert_eq!(manager.execute("op-1").await.unwrap(), Duration::ZERO);

    assert_eq!(downstream_calls.load(Ordering::SeqCst), 1);
    assert_eq!(polls.load(Ordering::SeqCst), 3);
    let stored = store.get_by_id("op-1").await.unwrap();
    assert_eq!(stored.state, OperationState::Succeeded);
    assert!(stored.payload.flag("created"));
}

#[tokio::test]
async fn test_step_that_persists_itself_is_not_written_twice() {
    let store = sqlite_store().await;
    insert_pending(store.as_ref(), "op-1").await;
    let transitions = Transitions::new(store.clone());
    let events = Arc::new(CollectingEventSink::new());

    let pipeline = Pipeline::builder()
        .step(
            1,
            CreateOnce {
                downstream_calls: Arc::new(AtomicU32::new(0)),
                transitions,
            },
        )
        .build();
    let manager = StepManager::new(store.clone(), pipeline).with_event_sink(events.clone());

    manager.execute("op-1").await.unwrap();

    // started (1) + the step's own update (2)
    let stored = store.get_by_id("op-1").await.unwrap();
    assert_eq!(stored.version, 2);
    let recorded = events.events();
    assert_eq!(recorded[0].old_operation.version, 1);
    assert_eq!(recorded[0].new_operation, stored);
}

#[tokio::test]
async fn test_cooperative_cancellation() {
    let store = sqlite_store().await;
    let op = insert_pending(store.as_ref(), "op-1").await;
    let transitions = Transitions::new(store.clone());
    let log = CallLog::default();

    // An external actor flags the operation before the worker picks it up.
    let mut flagged = op.clone();
    flagged.payload.set_flag("cancel_requested", true);
    store.update(&flagged).await.unwrap();

    let pipeline = Pipeline::builder()
        .init_step(CancelIfRequested { transitions })
        .step(1, RecordingStep::new("provision", &log))
        .build();
    let manager = StepManager::new(store.clone(), pipeline);

    assert_eq!(manager.execute("op-1").await.unwrap(), Duration::ZERO);
    assert!(log.calls().is_empty());
    assert_eq!(
        store.get_by_id("op-1").await.unwrap().state,
        OperationState::Canceled
    );
}

#[tokio::test]
async fn test_conflict_is_absorbed_by_reload() {
    let store = sqlite_store().await;
    let op = insert_pending(store.as_ref(), "op-1").await;
    let transitions = Transitions::new(store.clone());

    let mut external = op.clone();
    external.description = "touched by another writer".to_string();
    let external = store.update(&external).await.unwrap();
    assert_eq!(external.version, 1);

    let updated = transitions
        .update(op, |o| o.payload.runtime_id = Some("rt-1".to_string()))
        .await
        .unwrap();

    assert_eq!(updated.version, 2);
    assert_eq!(updated.description, "touched by another writer");
    assert_eq!(updated.payload.runtime_id.as_deref(), Some("rt-1"));
}

#[tokio::test]
async fn test_versions_increase_by_one() {
    let store = sqlite_store().await;
    let mut current = insert_pending(store.as_ref(), "op-1").await;

    for round in 1..=5 {
        current.description = format!("round {round}");
        let next = store.update(&current).await.unwrap();
        assert_eq!(next.version, current.version + 1);
        assert_eq!(store.get_by_id("op-1").await.unwrap().version, next.version);
        current = next;
    }
}

#[tokio::test]
async fn test_concurrent_updates_exactly_one_wins() {
    let store = sqlite_store().await;
    let op = insert_pending(store.as_ref(), "op-1").await;

    let mut a = op.clone();
    a.description = "a".to_string();
    let mut b = op.clone();
    b.description = "b".to_string();

    let (ra, rb) = tokio::join!(store.update(&a), store.update(&b));

    let wins = [&ra, &rb].iter().filter(|r| r.is_ok()).count();
    let conflicts = [&ra, &rb]
        .iter()
        .filter(|r| matches!(r, Err(Error::Conflict { .. })))
        .count();
    assert_eq!(wins, 1);
    assert_eq!(conflicts, 1);
    assert_eq!(store.get_by_id("op-1").await.unwrap().version, 1);
}

#[tokio::test]
async fn test_raw_step_error_leaves_operation_unfinished() {
    let store = sqlite_store().await;
    insert_pending(store.as_ref(), "op-1").await;
    let log = CallLog::default();
    let events = Arc::new(CollectingEventSink::new());

    let pipeline = Pipeline::builder()
        .step(1, FailingStep)
        .step(2, RecordingStep::new("after", &log))
        .build();
    let manager = StepManager::new(store.clone(), pipeline).with_event_sink(events.clone());

    let err = manager.execute("op-1").await.unwrap_err();

    assert_eq!(err.error_code(), "STEP_FAILED");
    assert!(err.is_temporary());
    assert!(log.calls().is_empty());
    let stored = store.get_by_id("op-1").await.unwrap();
    assert_eq!(stored.state, OperationState::InProgress);
    assert_eq!(events.events()[0].new_operation, stored);

    // The next invocation starts over from the same persisted state.
    assert!(manager.execute("op-1").await.is_err());
    assert_eq!(store.get_by_id("op-1").await.unwrap().version, 1);
}
