// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for envbroker-core integration tests.
//!
//! Provides store constructors and small scripted steps.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;

use envbroker_core::{
    Error, Operation, OperationStore, OperationType, PostgresStore, SqliteStore, Step, StepOutput,
    StepResult, Transitions,
};

/// A fresh in-memory SQLite store with migrations applied.
pub async fn sqlite_store() -> Arc<SqliteStore> {
    Arc::new(
        SqliteStore::in_memory()
            .await
            .expect("Failed to create in-memory store"),
    )
}

/// A PostgreSQL store from TEST_DATABASE_URL, or `None` when unset.
pub async fn postgres_store() -> Option<Arc<PostgresStore>> {
    let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .ok()?;
    envbroker_core::migrations::run_postgres(&pool).await.ok()?;
    Some(Arc::new(PostgresStore::new(pool)))
}

#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

/// Insert a pending provisioning operation with the given ID.
pub async fn insert_pending(store: &dyn OperationStore, id: &str) -> Operation {
    let op = Operation::with_id(id, "instance-1", OperationType::Provision, json!({"plan": "trial"}));
    store.insert(&op).await.expect("Failed to insert operation");
    op
}

/// Shared, ordered log of step invocations.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn record(&self, name: &str) {
        self.0.lock().unwrap().push(name.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Records its name and completes without touching the operation.
pub struct RecordingStep {
    pub name: &'static str,
    pub log: CallLog,
}

impl RecordingStep {
    pub fn new(name: &'static str, log: &CallLog) -> Self {
        Self {
            name,
            log: log.clone(),
        }
    }
}

#[async_trait]
impl Step for RecordingStep {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(&self, operation: Operation) -> StepResult {
        self.log.record(self.name);
        Ok(StepOutput::done(operation))
    }
}

/// Requeues for `delay` on its first call, then succeeds the operation.
pub struct RequeueThenSucceed {
    pub calls: Arc<AtomicU32>,
    pub delay: Duration,
    pub transitions: Transitions,
}

#[async_trait]
impl Step for RequeueThenSucceed {
    fn name(&self) -> &str {
        "requeue_then_succeed"
    }

    async fn run(&self, operation: Operation) -> StepResult {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(StepOutput::requeue(operation, self.delay));
        }
        self.transitions.succeed(operation, "Operation succeeded").await
    }
}

/// Calls a counted downstream "create" once, guarded by a payload flag.
pub struct CreateOnce {
    pub downstream_calls: Arc<AtomicU32>,
    pub transitions: Transitions,
}

#[async_trait]
impl Step for CreateOnce {
    fn name(&self) -> &str {
        "create_once"
    }

    async fn run(&self, operation: Operation) -> StepResult {
        if operation.payload.flag("created") {
            return Ok(StepOutput::done(operation));
        }
        self.downstream_calls.fetch_add(1, Ordering::SeqCst);
        let operation = self
            .transitions
            .update(operation, |op| op.payload.set_flag("created", true))
            .await?;
        Ok(StepOutput::done(operation))
    }
}

/// Polls a counter; requeues until it has been polled `ready_after` times.
pub struct PollUntilReady {
    pub polls: Arc<AtomicU32>,
    pub ready_after: u32,
    pub interval: Duration,
}

#[async_trait]
impl Step for PollUntilReady {
    fn name(&self) -> &str {
        "poll_until_ready"
    }

    async fn run(&self, operation: Operation) -> StepResult {
        let polled = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        if polled < self.ready_after {
            return Ok(StepOutput::requeue(operation, self.interval));
        }
        Ok(StepOutput::done(operation))
    }
}

/// Succeeds the operation.
pub struct Finish {
    pub transitions: Transitions,
}

#[async_trait]
impl Step for Finish {
    fn name(&self) -> &str {
        "finish"
    }

    async fn run(&self, operation: Operation) -> StepResult {
        self.transitions.succeed(operation, "Operation succeeded").await
    }
}

/// Cancels the operation when the `cancel_requested` flag is set.
pub struct CancelIfRequested {
    pub transitions: Transitions,
}

#[async_trait]
impl Step for CancelIfRequested {
    fn name(&self) -> &str {
        "cancel_if_requested"
    }

    async fn run(&self, operation: Operation) -> StepResult {
        if operation.payload.flag("cancel_requested") {
            return self.transitions.cancel(operation, "Canceled on request").await;
        }
        Ok(StepOutput::done(operation))
    }
}

/// Fails with a temporary error without touching the operation.
pub struct FailingStep;

#[async_trait]
impl Step for FailingStep {
    fn name(&self) -> &str {
        "failing"
    }

    async fn run(&self, _operation: Operation) -> StepResult {
        Err(Error::temporary("downstream unavailable"))
    }
}
