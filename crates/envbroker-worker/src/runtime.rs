// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable worker runtime.
//!
//! [`WorkerRuntime`] wires a store, the downstream clients and the add-on
//! catalog into one provisioning and one deprovisioning queue, each driven
//! by a [`StepManager`] over its pipeline.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use envbroker_core::PostgresStore;
//! use envbroker_worker::runtime::WorkerRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!
//!     let runtime = WorkerRuntime::builder()
//!         .store(Arc::new(PostgresStore::new(pool)))
//!         .provisioner(provisioner)
//!         .broker(broker)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     runtime.submit(operation).await?;
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! On start every not-finished operation found in the store is queued
//! again, so work interrupted by a restart resumes from its payload.

use std::sync::Arc;
use std::time::Duration;

use envbroker_core::{
    EngineConfig, EventSink, Operation, OperationStore, OperationType, StepManager,
    TracingEventSink, Transitions,
};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::catalog::{AddOn, default_catalog};
use crate::clients::{ProvisionerClient, ServiceBrokerClient};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::queue::OperationQueue;
use crate::steps::{StepContext, deprovisioning_pipeline, provisioning_pipeline};

/// Builder for creating a [`WorkerRuntime`].
pub struct WorkerRuntimeBuilder {
    store: Option<Arc<dyn OperationStore>>,
    provisioner: Option<Arc<dyn ProvisionerClient>>,
    broker: Option<Arc<dyn ServiceBrokerClient>>,
    events: Arc<dyn EventSink>,
    add_ons: Vec<AddOn>,
    provisioning_workers: usize,
    deprovisioning_workers: usize,
    error_backoff: Duration,
    operation_timeout: Duration,
    poll_interval: Duration,
    retry_interval: Duration,
    engine: EngineConfig,
}

impl Default for WorkerRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            provisioner: None,
            broker: None,
            events: Arc::new(TracingEventSink),
            add_ons: default_catalog(),
            provisioning_workers: 20,
            deprovisioning_workers: 20,
            error_backoff: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(60 * 60),
            poll_interval: Duration::from_secs(30),
            retry_interval: Duration::from_secs(10),
            engine: EngineConfig::default(),
        }
    }
}

impl WorkerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take worker counts, timings, add-ons and engine tuning from `config`.
    pub fn config(mut self, config: &Config) -> Self {
        self.add_ons = config.add_ons.clone();
        self.provisioning_workers = config.provisioning_workers;
        self.deprovisioning_workers = config.deprovisioning_workers;
        self.error_backoff = config.error_backoff;
        self.operation_timeout = config.operation_timeout;
        self.engine = config.engine.clone();
        self
    }

    /// Set the operation store (required).
    pub fn store(mut self, store: Arc<dyn OperationStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the cluster provisioner client (required).
    pub fn provisioner(mut self, provisioner: Arc<dyn ProvisionerClient>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Set the add-on broker client (required).
    pub fn broker(mut self, broker: Arc<dyn ServiceBrokerClient>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Replace the default tracing event sink.
    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn add_ons(mut self, add_ons: Vec<AddOn>) -> Self {
        self.add_ons = add_ons;
        self
    }

    pub fn workers(mut self, provisioning: usize, deprovisioning: usize) -> Self {
        self.provisioning_workers = provisioning;
        self.deprovisioning_workers = deprovisioning;
        self
    }

    /// Set the requeue delay after an execution error.
    pub fn error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Set how long steps may keep waiting on downstream work.
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set the downstream poll and temporary-failure retry intervals.
    pub fn intervals(mut self, poll_interval: Duration, retry_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.retry_interval = retry_interval;
        self
    }

    pub fn engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if the store or a client is missing.
    pub fn build(self) -> Result<WorkerRuntimeConfig> {
        let store = self.store.ok_or(Error::MissingComponent("store"))?;
        let provisioner = self
            .provisioner
            .ok_or(Error::MissingComponent("provisioner"))?;
        let broker = self.broker.ok_or(Error::MissingComponent("broker"))?;

        let transitions = Transitions::from_config(store.clone(), &self.engine);
        let steps = StepContext::new(provisioner, broker, transitions, self.operation_timeout)
            .with_intervals(self.poll_interval, self.retry_interval);

        Ok(WorkerRuntimeConfig {
            store,
            steps,
            events: self.events,
            add_ons: self.add_ons,
            provisioning_workers: self.provisioning_workers,
            deprovisioning_workers: self.deprovisioning_workers,
            error_backoff: self.error_backoff,
        })
    }
}

/// Configuration for a [`WorkerRuntime`].
pub struct WorkerRuntimeConfig {
    store: Arc<dyn OperationStore>,
    steps: StepContext,
    events: Arc<dyn EventSink>,
    add_ons: Vec<AddOn>,
    provisioning_workers: usize,
    deprovisioning_workers: usize,
    error_backoff: Duration,
}

impl WorkerRuntimeConfig {
    /// Start both queues and requeue unfinished operations.
    pub async fn start(self) -> Result<WorkerRuntime> {
        let provisioning_manager = StepManager::new(
            self.store.clone(),
            provisioning_pipeline(&self.steps, &self.add_ons),
        )
        .with_event_sink(self.events.clone());
        let deprovisioning_manager = StepManager::new(
            self.store.clone(),
            deprovisioning_pipeline(&self.steps, &self.add_ons),
        )
        .with_event_sink(self.events.clone());

        let provisioning = OperationQueue::new(
            "provisioning",
            Arc::new(provisioning_manager),
            self.error_backoff,
        );
        let deprovisioning = OperationQueue::new(
            "deprovisioning",
            Arc::new(deprovisioning_manager),
            self.error_backoff,
        );

        let runtime = WorkerRuntime {
            provisioning_handle: spawn_queue(&provisioning, self.provisioning_workers),
            deprovisioning_handle: spawn_queue(&deprovisioning, self.deprovisioning_workers),
            provisioning,
            deprovisioning,
            store: self.store,
        };

        let resumed = runtime.requeue_unfinished().await?;

        info!(
            provisioning_workers = self.provisioning_workers,
            deprovisioning_workers = self.deprovisioning_workers,
            add_ons = self.add_ons.len(),
            resumed,
            "WorkerRuntime started"
        );

        Ok(runtime)
    }
}

fn spawn_queue(queue: &OperationQueue, workers: usize) -> JoinHandle<()> {
    let queue = queue.clone();
    tokio::spawn(async move { queue.run(workers).await })
}

/// A running worker that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct WorkerRuntime {
    provisioning: OperationQueue,
    deprovisioning: OperationQueue,
    provisioning_handle: JoinHandle<()>,
    deprovisioning_handle: JoinHandle<()>,
    store: Arc<dyn OperationStore>,
}

impl WorkerRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> WorkerRuntimeBuilder {
        WorkerRuntimeBuilder::new()
    }

    pub fn store(&self) -> &Arc<dyn OperationStore> {
        &self.store
    }

    pub fn provisioning_queue(&self) -> &OperationQueue {
        &self.provisioning
    }

    pub fn deprovisioning_queue(&self) -> &OperationQueue {
        &self.deprovisioning
    }

    /// Persist a new operation and queue it.
    pub async fn submit(&self, operation: Operation) -> Result<()> {
        let queue = self.queue_for(operation.operation_type)?;
        self.store.insert(&operation).await?;
        info!(
            operation_id = %operation.id,
            instance_id = %operation.instance_id,
            operation_type = %operation.operation_type,
            "Operation submitted"
        );
        queue.add(&operation.id);
        Ok(())
    }

    /// Queue an operation that is already stored.
    pub fn enqueue(&self, operation: &Operation) -> Result<()> {
        self.queue_for(operation.operation_type)?.add(&operation.id);
        Ok(())
    }

    fn queue_for(&self, operation_type: OperationType) -> Result<&OperationQueue> {
        match operation_type {
            OperationType::Provision => Ok(&self.provisioning),
            OperationType::Deprovision => Ok(&self.deprovisioning),
            other => Err(Error::UnsupportedOperation(other)),
        }
    }

    async fn requeue_unfinished(&self) -> Result<usize> {
        let mut resumed = 0;
        for operation_type in [OperationType::Provision, OperationType::Deprovision] {
            for operation in self.store.list_not_finished(Some(operation_type)).await? {
                self.enqueue(&operation)?;
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    /// Check if both queues are still running.
    pub fn is_running(&self) -> bool {
        !self.provisioning_handle.is_finished() && !self.deprovisioning_handle.is_finished()
    }

    /// Stop both queues and wait for in-flight executions to finish.
    pub async fn shutdown(self) {
        info!("WorkerRuntime shutting down...");

        self.provisioning.shutdown();
        self.deprovisioning.shutdown();

        if let Err(e) = self.provisioning_handle.await {
            error!("Provisioning queue task panicked: {}", e);
        }
        if let Err(e) = self.deprovisioning_handle.await {
            error!("Deprovisioning queue task panicked: {}", e);
        }

        info!("WorkerRuntime shutdown complete");
    }
}
