// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for envbroker-worker integration tests.
//!
//! Provides a [`Harness`] with an in-memory store, mock downstream clients
//! and step managers for both pipelines.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use envbroker_core::{
    CollectingEventSink, Operation, OperationStore, OperationType, SqliteStore, StepManager,
    Transitions,
};
use envbroker_worker::catalog::default_catalog;
use envbroker_worker::clients::{MockProvisioner, MockServiceBroker};
use envbroker_worker::steps::{StepContext, deprovisioning_pipeline, provisioning_pipeline};

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Store, mocks and managers wired the way the worker runtime wires them.
pub struct Harness {
    pub store: Arc<SqliteStore>,
    pub provisioner: Arc<MockProvisioner>,
    pub broker: Arc<MockServiceBroker>,
    pub events: Arc<CollectingEventSink>,
    pub ctx: StepContext,
    pub provisioning: StepManager,
    pub deprovisioning: StepManager,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_clients(MockProvisioner::new(), MockServiceBroker::new()).await
    }

    pub async fn with_clients(provisioner: MockProvisioner, broker: MockServiceBroker) -> Self {
        Self::build(provisioner, broker, Duration::from_secs(3600)).await
    }

    pub async fn with_timeout(provisioner: MockProvisioner, timeout: Duration) -> Self {
        Self::build(provisioner, MockServiceBroker::new(), timeout).await
    }

    async fn build(
        provisioner: MockProvisioner,
        broker: MockServiceBroker,
        operation_timeout: Duration,
    ) -> Self {
        let store = Arc::new(
            SqliteStore::in_memory()
                .await
                .expect("Failed to create in-memory store"),
        );
        let provisioner = Arc::new(provisioner);
        let broker = Arc::new(broker);
        let events = Arc::new(CollectingEventSink::new());

        let ctx = StepContext::new(
            provisioner.clone(),
            broker.clone(),
            Transitions::new(store.clone()),
            operation_timeout,
        )
        .with_intervals(POLL_INTERVAL, RETRY_INTERVAL);

        let (provisioning, deprovisioning) = managers(&store, &ctx, &events);
        Self {
            store,
            provisioner,
            broker,
            events,
            ctx,
            provisioning,
            deprovisioning,
        }
    }

    /// Fresh managers over the same store and clients, as after a restart.
    pub fn restart(&mut self) {
        let (provisioning, deprovisioning) = managers(&self.store, &self.ctx, &self.events);
        self.provisioning = provisioning;
        self.deprovisioning = deprovisioning;
    }

    /// Insert a pending provisioning for `instance_id` on `plan`.
    pub async fn provision(&self, instance_id: &str, plan: &str) -> Operation {
        let op = Operation::new(instance_id, OperationType::Provision, json!({"plan": plan}));
        self.store.insert(&op).await.expect("Failed to insert operation");
        op
    }

    /// Insert a pending deprovisioning for `instance_id`.
    pub async fn deprovision(&self, instance_id: &str) -> Operation {
        // Keep creation times of consecutive operations apart.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let op = Operation::new(instance_id, OperationType::Deprovision, json!({}));
        self.store.insert(&op).await.expect("Failed to insert operation");
        op
    }

    pub async fn get(&self, operation_id: &str) -> Operation {
        self.store
            .get_by_id(operation_id)
            .await
            .expect("Failed to load operation")
    }
}

fn managers(
    store: &Arc<SqliteStore>,
    ctx: &StepContext,
    events: &Arc<CollectingEventSink>,
) -> (StepManager, StepManager) {
    let catalog = default_catalog();
    let provisioning = StepManager::new(store.clone(), provisioning_pipeline(ctx, &catalog))
        .with_event_sink(events.clone());
    let deprovisioning = StepManager::new(store.clone(), deprovisioning_pipeline(ctx, &catalog))
        .with_event_sink(events.clone());
    (provisioning, deprovisioning)
}

/// Execute like the queue would until the manager returns zero or the
/// operation is terminal. Returns every execution result.
pub async fn drive(
    manager: &StepManager,
    store: &dyn OperationStore,
    operation_id: &str,
) -> Vec<envbroker_core::Result<Duration>> {
    let mut results = Vec::new();
    for _ in 0..50 {
        let result = manager.execute(operation_id).await;
        let finished = matches!(result, Ok(delay) if delay.is_zero());
        results.push(result);

        let stored = store
            .get_by_id(operation_id)
            .await
            .expect("Failed to load operation");
        if finished || stored.is_terminal() {
            break;
        }
    }
    results
}
