// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL store tests. Run only when TEST_DATABASE_URL is set.

#[macro_use]
mod common;

use std::time::Duration;

use common::*;
use envbroker_core::{
    Error, Operation, OperationState, OperationStore, OperationType, Pipeline, StepManager,
    Transitions,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use uuid::Uuid;

fn unique_operation(instance_id: &str) -> Operation {
    Operation::new(instance_id, OperationType::Provision, json!({"plan": "aws"}))
}

#[tokio::test]
async fn test_pg_insert_get_update() {
    skip_if_no_db!();
    let Some(store) = postgres_store().await else {
        eprintln!("Skipping test: failed to connect to TEST_DATABASE_URL");
        return;
    };

    let op = unique_operation(&Uuid::new_v4().to_string());
    store.insert(&op).await.unwrap();
    assert_eq!(store.get_by_id(&op.id).await.unwrap(), op);

    let err = store.insert(&op).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyExists { .. }), "got {err:?}");

    let mut next = op.clone();
    next.payload.runtime_id = Some("rt-1".to_string());
    let next = store.update(&next).await.unwrap();
    assert_eq!(next.version, 1);
    assert_eq!(store.get_by_id(&op.id).await.unwrap(), next);
}

#[tokio::test]
async fn test_pg_conflict_and_terminal() {
    skip_if_no_db!();
    let Some(store) = postgres_store().await else {
        eprintln!("Skipping test: failed to connect to TEST_DATABASE_URL");
        return;
    };

    let op = unique_operation(&Uuid::new_v4().to_string());
    store.insert(&op).await.unwrap();

    let mut a = op.clone();
    a.state = OperationState::InProgress;
    let a = store.update(&a).await.unwrap();

    let err = store.update(&op).await.unwrap_err();
    assert!(
        matches!(err, Error::Conflict { expected: 0, actual: 1, .. }),
        "got {err:?}"
    );

    let mut done = a.clone();
    done.state = OperationState::Succeeded;
    let done = store.update(&done).await.unwrap();

    let err = store.update(&done).await.unwrap_err();
    assert!(matches!(err, Error::TerminalState { .. }), "got {err:?}");

    let err = store
        .get_by_id(&Uuid::new_v4().to_string())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_pg_listing() {
    skip_if_no_db!();
    let Some(store) = postgres_store().await else {
        eprintln!("Skipping test: failed to connect to TEST_DATABASE_URL");
        return;
    };

    let instance_id = Uuid::new_v4().to_string();
    let orchestration_id = Uuid::new_v4().to_string();

    let mut first = unique_operation(&instance_id).with_orchestration_id(&orchestration_id);
    first.created_at -= chrono::Duration::seconds(10);
    let second = Operation::new(&instance_id, OperationType::Deprovision, json!({}))
        .with_orchestration_id(&orchestration_id);
    store.insert(&first).await.unwrap();
    store.insert(&second).await.unwrap();

    let listed = store.list_by_instance_id(&instance_id).await.unwrap();
    assert_eq!(listed, vec![first.clone(), second.clone()]);
    assert_eq!(
        store.get_last_by_instance_id(&instance_id).await.unwrap(),
        second
    );
    assert_eq!(
        store
            .list_by_orchestration_id(&orchestration_id)
            .await
            .unwrap()
            .len(),
        2
    );

    let deprovisions = store
        .list_not_finished(Some(OperationType::Deprovision))
        .await
        .unwrap();
    assert!(deprovisions.iter().any(|o| o.id == second.id));
    assert!(deprovisions.iter().all(|o| o.id != first.id));

    assert!(store.health_check_db().await.unwrap());
}

#[tokio::test]
async fn test_pg_pipeline_scenario() {
    skip_if_no_db!();
    let Some(store) = postgres_store().await else {
        eprintln!("Skipping test: failed to connect to TEST_DATABASE_URL");
        return;
    };

    let op = unique_operation(&Uuid::new_v4().to_string());
    store.insert(&op).await.unwrap();

    let log = CallLog::default();
    let pipeline = Pipeline::builder()
        .step(1, RecordingStep::new("step_a", &log))
        .step(
            2,
            RequeueThenSucceed {
                calls: Arc::new(AtomicU32::new(0)),
                delay: Duration::from_secs(10),
                transitions: Transitions::new(store.clone()),
            },
        )
        .build();
    let manager = StepManager::new(store.clone(), pipeline);

    assert_eq!(
        manager.execute(&op.id).await.unwrap(),
        Duration::from_secs(10)
    );
    assert_eq!(store.get_by_id(&op.id).await.unwrap().version, 1);

    assert_eq!(manager.execute(&op.id).await.unwrap(), Duration::ZERO);
    let stored = store.get_by_id(&op.id).await.unwrap();
    assert_eq!(stored.state, OperationState::Succeeded);
    assert_eq!(stored.version, 2);
}
