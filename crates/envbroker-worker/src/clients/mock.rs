// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory downstream clients for testing.
//!
//! Both mocks count every call and can be scripted to fail the next call of
//! a given kind. Creation calls are idempotent the way the real services
//! are, so repeated calls are visible in the counters but create nothing new.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use super::{
    Binding, BrokerResponse, ClientError, ClientResult, LastOperation, LastOperationState,
    ProvisionInstanceRequest, ProvisionRuntimeInput, ProvisionerClient,
    ProvisionerOperationStatus, ProvisionerState, ServiceBrokerClient, ServiceRef,
};

fn take(queue: &mut VecDeque<ClientError>) -> ClientResult<()> {
    match queue.pop_front() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

// ============================================================================
// Provisioner
// ============================================================================

#[derive(Debug)]
struct MockOperation {
    polls: u32,
}

#[derive(Default)]
struct ProvisionerBook {
    operations: HashMap<String, MockOperation>,
    by_key: HashMap<String, String>,
    runtimes: HashSet<String>,
    removed: HashSet<String>,
    provision_failures: VecDeque<ClientError>,
    deprovision_failures: VecDeque<ClientError>,
    status_failures: VecDeque<ClientError>,
}

/// Mock cluster provisioner.
pub struct MockProvisioner {
    state: Mutex<ProvisionerBook>,
    /// Status polls an operation needs before it finishes.
    pub ready_after_polls: u32,
    /// If true, operations finish as failed.
    pub fail_operations: bool,
    provision_calls: AtomicU32,
    deprovision_calls: AtomicU32,
    status_calls: AtomicU32,
}

impl Default for MockProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvisioner {
    /// Operations finish on the second status poll.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProvisionerBook::default()),
            ready_after_polls: 2,
            fail_operations: false,
            provision_calls: AtomicU32::new(0),
            deprovision_calls: AtomicU32::new(0),
            status_calls: AtomicU32::new(0),
        }
    }

    /// Operations finish on the first status poll.
    pub fn instant() -> Self {
        Self {
            ready_after_polls: 1,
            ..Self::new()
        }
    }

    /// Operations finish as failed.
    pub fn failing() -> Self {
        Self {
            fail_operations: true,
            ..Self::new()
        }
    }

    pub async fn fail_next_provision(&self, err: ClientError) {
        self.state.lock().await.provision_failures.push_back(err);
    }

    pub async fn fail_next_deprovision(&self, err: ClientError) {
        self.state.lock().await.deprovision_failures.push_back(err);
    }

    pub async fn fail_next_status(&self, err: ClientError) {
        self.state.lock().await.status_failures.push_back(err);
    }

    pub fn provision_calls(&self) -> u32 {
        self.provision_calls.load(Ordering::SeqCst)
    }

    pub fn deprovision_calls(&self) -> u32 {
        self.deprovision_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> u32 {
        self.status_calls.load(Ordering::SeqCst)
    }

    /// Distinct runtimes created.
    pub async fn runtimes_created(&self) -> usize {
        self.state.lock().await.runtimes.len()
    }

    pub async fn runtime_exists(&self, runtime_id: &str) -> bool {
        let state = self.state.lock().await;
        state.runtimes.contains(runtime_id) && !state.removed.contains(runtime_id)
    }
}

#[async_trait]
impl ProvisionerClient for MockProvisioner {
    async fn provision_runtime(&self, input: &ProvisionRuntimeInput) -> ClientResult<String> {
        self.provision_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        take(&mut state.provision_failures)?;

        if let Some(existing) = state.by_key.get(&input.idempotency_key) {
            return Ok(existing.clone());
        }

        let operation_id = format!("prov-{}", state.operations.len() + 1);
        state
            .operations
            .insert(operation_id.clone(), MockOperation { polls: 0 });
        state
            .by_key
            .insert(input.idempotency_key.clone(), operation_id.clone());
        state.runtimes.insert(input.runtime_id.clone());
        Ok(operation_id)
    }

    async fn deprovision_runtime(&self, runtime_id: &str) -> ClientResult<String> {
        self.deprovision_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        take(&mut state.deprovision_failures)?;

        if !state.runtimes.contains(runtime_id) {
            return Err(ClientError::from_status(404, "runtime not found"));
        }

        let operation_id = format!("deprov-{}", state.operations.len() + 1);
        state
            .operations
            .insert(operation_id.clone(), MockOperation { polls: 0 });
        state.removed.insert(runtime_id.to_string());
        Ok(operation_id)
    }

    async fn operation_status(
        &self,
        operation_id: &str,
    ) -> ClientResult<ProvisionerOperationStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        take(&mut state.status_failures)?;

        let operation = state
            .operations
            .get_mut(operation_id)
            .ok_or_else(|| ClientError::from_status(404, "operation not found"))?;
        operation.polls += 1;

        let progress = if operation.polls < self.ready_after_polls {
            ProvisionerState::InProgress
        } else if self.fail_operations {
            ProvisionerState::Failed
        } else {
            ProvisionerState::Succeeded
        };

        Ok(ProvisionerOperationStatus {
            operation_id: operation_id.to_string(),
            state: progress,
            message: Some(format!("mock operation {}", operation_id)),
        })
    }
}

// ============================================================================
// Service broker
// ============================================================================

#[derive(Debug)]
struct MockInstance {
    polls: u32,
}

#[derive(Default)]
struct BrokerState {
    instances: HashMap<String, MockInstance>,
    created: HashSet<String>,
    bindings: HashSet<(String, String)>,
    provision_failures: VecDeque<ClientError>,
    bind_failures: VecDeque<ClientError>,
    unbind_failures: VecDeque<ClientError>,
    deprovision_failures: VecDeque<ClientError>,
}

/// Mock add-on service broker.
pub struct MockServiceBroker {
    state: Mutex<BrokerState>,
    /// If true, provisioning is asynchronous and needs `ready_after_polls`.
    pub asynchronous: bool,
    pub ready_after_polls: u32,
    provision_calls: AtomicU32,
    last_operation_calls: AtomicU32,
    bind_calls: AtomicU32,
    unbind_calls: AtomicU32,
    deprovision_calls: AtomicU32,
}

impl Default for MockServiceBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockServiceBroker {
    /// Asynchronous broker whose instances are ready on the second poll.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            asynchronous: true,
            ready_after_polls: 2,
            provision_calls: AtomicU32::new(0),
            last_operation_calls: AtomicU32::new(0),
            bind_calls: AtomicU32::new(0),
            unbind_calls: AtomicU32::new(0),
            deprovision_calls: AtomicU32::new(0),
        }
    }

    /// Broker that provisions synchronously.
    pub fn synchronous() -> Self {
        Self {
            asynchronous: false,
            ..Self::new()
        }
    }

    pub async fn fail_next_provision(&self, err: ClientError) {
        self.state.lock().await.provision_failures.push_back(err);
    }

    pub async fn fail_next_bind(&self, err: ClientError) {
        self.state.lock().await.bind_failures.push_back(err);
    }

    pub async fn fail_next_unbind(&self, err: ClientError) {
        self.state.lock().await.unbind_failures.push_back(err);
    }

    pub async fn fail_next_deprovision(&self, err: ClientError) {
        self.state.lock().await.deprovision_failures.push_back(err);
    }

    pub fn provision_calls(&self) -> u32 {
        self.provision_calls.load(Ordering::SeqCst)
    }

    pub fn last_operation_calls(&self) -> u32 {
        self.last_operation_calls.load(Ordering::SeqCst)
    }

    pub fn bind_calls(&self) -> u32 {
        self.bind_calls.load(Ordering::SeqCst)
    }

    pub fn unbind_calls(&self) -> u32 {
        self.unbind_calls.load(Ordering::SeqCst)
    }

    pub fn deprovision_calls(&self) -> u32 {
        self.deprovision_calls.load(Ordering::SeqCst)
    }

    /// Distinct instances ever created.
    pub async fn instances_created(&self) -> usize {
        self.state.lock().await.created.len()
    }

    /// Instances currently present.
    pub async fn live_instances(&self) -> usize {
        self.state.lock().await.instances.len()
    }

    pub async fn live_bindings(&self) -> usize {
        self.state.lock().await.bindings.len()
    }
}

#[async_trait]
impl ServiceBrokerClient for MockServiceBroker {
    async fn provision(
        &self,
        instance_id: &str,
        _request: &ProvisionInstanceRequest,
    ) -> ClientResult<BrokerResponse> {
        self.provision_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        take(&mut state.provision_failures)?;

        state.created.insert(instance_id.to_string());
        let instance = state
            .instances
            .entry(instance_id.to_string())
            .or_insert(MockInstance { polls: 0 });

        if !self.asynchronous || instance.polls >= self.ready_after_polls {
            return Ok(BrokerResponse::Done);
        }
        Ok(BrokerResponse::InProgress {
            operation: Some(format!("provision-{instance_id}")),
        })
    }

    async fn last_operation(
        &self,
        instance_id: &str,
        _service: &ServiceRef,
        _operation: Option<&str>,
    ) -> ClientResult<LastOperation> {
        self.last_operation_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;

        let instance = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| ClientError::from_status(410, "instance gone"))?;
        instance.polls += 1;

        let progress = if self.asynchronous && instance.polls < self.ready_after_polls {
            LastOperationState::InProgress
        } else {
            LastOperationState::Succeeded
        };
        Ok(LastOperation {
            state: progress,
            description: None,
        })
    }

    async fn bind(
        &self,
        instance_id: &str,
        binding_id: &str,
        _service: &ServiceRef,
    ) -> ClientResult<Binding> {
        self.bind_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        take(&mut state.bind_failures)?;

        if !state.instances.contains_key(instance_id) {
            return Err(ClientError::from_status(404, "instance not found"));
        }
        state
            .bindings
            .insert((instance_id.to_string(), binding_id.to_string()));
        Ok(Binding {
            credentials: json!({"binding_id": binding_id}),
        })
    }

    async fn unbind(
        &self,
        instance_id: &str,
        binding_id: &str,
        _service: &ServiceRef,
    ) -> ClientResult<()> {
        self.unbind_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        take(&mut state.unbind_failures)?;
        state
            .bindings
            .remove(&(instance_id.to_string(), binding_id.to_string()));
        Ok(())
    }

    async fn deprovision(
        &self,
        instance_id: &str,
        _service: &ServiceRef,
    ) -> ClientResult<BrokerResponse> {
        self.deprovision_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        take(&mut state.deprovision_failures)?;

        state.instances.remove(instance_id);
        state.bindings.retain(|(instance, _)| instance != instance_id);
        Ok(BrokerResponse::Done)
    }
}
