// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Steps that create an environment: runtime first, then add-ons.

use async_trait::async_trait;
use envbroker_core::{Operation, OperationType, Step, StepOutput, StepResult};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use super::StepContext;
use crate::catalog::AddOn;
use crate::clients::{
    BrokerResponse, LastOperationState, ProvisionInstanceRequest, ProvisionRuntimeInput,
    ProvisionerState, ServiceRef,
};

/// Whether an operation of the same instance that started after `operation`
/// is a deprovisioning.
pub(crate) fn superseded_by_deprovisioning(operation: &Operation, history: &[Operation]) -> bool {
    history
        .iter()
        .skip_while(|other| other.id != operation.id)
        .skip(1)
        .any(|other| other.operation_type == OperationType::Deprovision)
}

fn service_ref(add_on: &AddOn) -> ServiceRef {
    ServiceRef {
        service_id: add_on.service_id.clone(),
        plan_id: add_on.plan_id.clone(),
    }
}

// ============================================================================
// Initialisation
// ============================================================================

/// Cancels the operation once a deprovisioning was requested, validates the
/// plan and assigns the runtime ID.
pub struct InitialisationStep {
    ctx: StepContext,
}

impl InitialisationStep {
    pub fn new(ctx: StepContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Step for InitialisationStep {
    fn name(&self) -> &str {
        "initialisation"
    }

    async fn run(&self, operation: Operation) -> StepResult {
        let history = self
            .ctx
            .transitions
            .store()
            .list_by_instance_id(&operation.instance_id)
            .await?;

        if superseded_by_deprovisioning(&operation, &history) {
            info!(
                operation_id = %operation.id,
                instance_id = %operation.instance_id,
                "Deprovisioning requested, canceling provisioning"
            );
            return self
                .ctx
                .transitions
                .cancel(operation, "Canceled: environment deprovisioning requested")
                .await;
        }

        if operation.parameter("plan").is_none() {
            return self
                .ctx
                .transitions
                .fail(operation, "Provisioning parameters have no plan", None)
                .await;
        }

        if operation.payload.runtime_id.is_some() {
            return Ok(StepOutput::done(operation));
        }

        let runtime_id = Uuid::new_v4().to_string();
        debug!(operation_id = %operation.id, runtime_id = %runtime_id, "Assigning runtime ID");
        let stored = self
            .ctx
            .transitions
            .update(operation, |op| {
                if op.payload.runtime_id.is_none() {
                    op.payload.runtime_id = Some(runtime_id.clone());
                }
            })
            .await?;
        Ok(StepOutput::done(stored))
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// Asks the provisioner for the runtime, once.
pub struct CreateRuntimeStep {
    ctx: StepContext,
}

impl CreateRuntimeStep {
    pub fn new(ctx: StepContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Step for CreateRuntimeStep {
    fn name(&self) -> &str {
        "create_runtime"
    }

    async fn run(&self, operation: Operation) -> StepResult {
        if operation.payload.runtime_requested {
            return Ok(StepOutput::done(operation));
        }

        let Some(runtime_id) = operation.payload.runtime_id.clone() else {
            return self
                .ctx
                .transitions
                .fail(operation, "Runtime ID was never assigned", None)
                .await;
        };

        let input = ProvisionRuntimeInput {
            runtime_id,
            instance_id: operation.instance_id.clone(),
            plan: operation.parameter("plan").unwrap_or_default().to_string(),
            region: operation.parameter("region").map(str::to_string),
            // A repeated request after a lost write returns the same provisioner operation.
            idempotency_key: operation.id.clone(),
        };

        match self.ctx.provisioner.provision_runtime(&input).await {
            Ok(provisioner_operation) => {
                info!(
                    operation_id = %operation.id,
                    runtime_id = %input.runtime_id,
                    provisioner_operation = %provisioner_operation,
                    "Runtime provisioning started"
                );
                let stored = self
                    .ctx
                    .transitions
                    .update(operation, |op| {
                        op.payload.provisioner_operation_id = Some(provisioner_operation.clone());
                        op.payload.runtime_requested = true;
                        op.description = "Runtime provisioning started".to_string();
                    })
                    .await?;
                Ok(StepOutput::done(stored))
            }
            Err(err) => {
                self.ctx
                    .client_error(operation, "Runtime provisioning request", err)
                    .await
            }
        }
    }
}

/// Polls the provisioner until the runtime is ready.
pub struct WaitForRuntimeStep {
    ctx: StepContext,
}

impl WaitForRuntimeStep {
    pub fn new(ctx: StepContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Step for WaitForRuntimeStep {
    fn name(&self) -> &str {
        "wait_for_runtime"
    }

    async fn run(&self, operation: Operation) -> StepResult {
        if operation.payload.runtime_ready {
            return Ok(StepOutput::done(operation));
        }

        let Some(provisioner_operation) = operation.payload.provisioner_operation_id.clone() else {
            return self
                .ctx
                .transitions
                .fail(operation, "Runtime was never requested", None)
                .await;
        };

        let status = match self
            .ctx
            .provisioner
            .operation_status(&provisioner_operation)
            .await
        {
            Ok(status) => status,
            Err(err) => {
                return self
                    .ctx
                    .client_error(operation, "Runtime status check", err)
                    .await;
            }
        };

        match status.state {
            ProvisionerState::InProgress => {
                self.ctx
                    .wait(operation, "Waiting for runtime to be ready")
                    .await
            }
            ProvisionerState::Succeeded => {
                let stored = self
                    .ctx
                    .transitions
                    .update(operation, |op| {
                        op.payload.runtime_ready = true;
                        op.description = "Runtime ready".to_string();
                    })
                    .await?;
                Ok(StepOutput::done(stored))
            }
            ProvisionerState::Failed => {
                let description = format!(
                    "Runtime provisioning failed: {}",
                    status.message.as_deref().unwrap_or("no details")
                );
                self.ctx.transitions.fail(operation, &description, None).await
            }
        }
    }
}

// ============================================================================
// Add-ons
// ============================================================================

/// Creates one add-on service instance inside the runtime.
pub struct ProvisionAddOnStep {
    ctx: StepContext,
    add_on: AddOn,
    name: String,
}

impl ProvisionAddOnStep {
    pub fn new(ctx: StepContext, add_on: AddOn) -> Self {
        let name = format!("provision_{}", add_on.name);
        Self { ctx, add_on, name }
    }

    async fn trigger(&self, operation: Operation, instance_id: String) -> StepResult {
        let request = ProvisionInstanceRequest {
            service: service_ref(&self.add_on),
            context: json!({
                "runtime_id": operation.payload.runtime_id,
                "instance_id": operation.instance_id,
            }),
            parameters: json!({}),
        };

        let response = match self.ctx.broker.provision(&instance_id, &request).await {
            Ok(response) => response,
            Err(err) => {
                let action = format!("Provisioning of the {} add-on", self.add_on.name);
                return self.ctx.client_error(operation, &action, err).await;
            }
        };

        let name = self.add_on.name.clone();
        match response {
            BrokerResponse::Done => {
                let stored = self
                    .ctx
                    .transitions
                    .update(operation, |op| {
                        let state = op.payload.add_on_mut(&name);
                        state.provisioning_triggered = true;
                        state.provisioned = true;
                    })
                    .await?;
                Ok(StepOutput::done(stored))
            }
            BrokerResponse::InProgress { operation: token } => {
                let stored = self
                    .ctx
                    .transitions
                    .update(operation, |op| {
                        let state = op.payload.add_on_mut(&name);
                        state.provisioning_triggered = true;
                        state.last_operation = token.clone();
                    })
                    .await?;
                let message = format!("Waiting for the {name} add-on");
                self.ctx.wait(stored, &message).await
            }
        }
    }

    async fn poll(&self, operation: Operation, instance_id: String) -> StepResult {
        let token = operation
            .payload
            .add_on(&self.add_on.name)
            .and_then(|state| state.last_operation.clone());

        let last = match self
            .ctx
            .broker
            .last_operation(&instance_id, &service_ref(&self.add_on), token.as_deref())
            .await
        {
            Ok(last) => last,
            Err(err) => {
                let action = format!("Status check of the {} add-on", self.add_on.name);
                return self.ctx.client_error(operation, &action, err).await;
            }
        };

        let name = self.add_on.name.clone();
        match last.state {
            LastOperationState::InProgress => {
                let message = format!("Waiting for the {name} add-on");
                self.ctx.wait(operation, &message).await
            }
            LastOperationState::Succeeded => {
                let stored = self
                    .ctx
                    .transitions
                    .update(operation, |op| {
                        op.payload.add_on_mut(&name).provisioned = true;
                    })
                    .await?;
                Ok(StepOutput::done(stored))
            }
            LastOperationState::Failed => {
                let description = format!(
                    "Provisioning of the {name} add-on failed: {}",
                    last.description.as_deref().unwrap_or("no details")
                );
                self.ctx.transitions.fail(operation, &description, None).await
            }
        }
    }
}

#[async_trait]
impl Step for ProvisionAddOnStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, operation: Operation) -> StepResult {
        let state = operation
            .payload
            .add_on(&self.add_on.name)
            .cloned()
            .unwrap_or_default();
        if state.provisioned {
            return Ok(StepOutput::done(operation));
        }

        // The broker instance ID is persisted before the first provision
        // call so a re-run addresses the same instance.
        let (operation, instance_id) = match state.instance_id {
            Some(instance_id) => (operation, instance_id),
            None => {
                let instance_id = Uuid::new_v4().to_string();
                let name = self.add_on.name.clone();
                let stored = self
                    .ctx
                    .transitions
                    .update(operation, |op| {
                        let state = op.payload.add_on_mut(&name);
                        if state.instance_id.is_none() {
                            state.instance_id = Some(instance_id.clone());
                        }
                    })
                    .await?;
                let instance_id = stored
                    .payload
                    .add_on(&self.add_on.name)
                    .and_then(|state| state.instance_id.clone())
                    .unwrap_or(instance_id);
                (stored, instance_id)
            }
        };

        if state.provisioning_triggered {
            self.poll(operation, instance_id).await
        } else {
            self.trigger(operation, instance_id).await
        }
    }
}

/// Binds one provisioned add-on.
pub struct BindAddOnStep {
    ctx: StepContext,
    add_on: AddOn,
    name: String,
}

impl BindAddOnStep {
    pub fn new(ctx: StepContext, add_on: AddOn) -> Self {
        let name = format!("bind_{}", add_on.name);
        Self { ctx, add_on, name }
    }
}

#[async_trait]
impl Step for BindAddOnStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, operation: Operation) -> StepResult {
        let state = operation
            .payload
            .add_on(&self.add_on.name)
            .cloned()
            .unwrap_or_default();
        if state.bound {
            return Ok(StepOutput::done(operation));
        }

        let Some(instance_id) = state.instance_id.filter(|_| state.provisioned) else {
            let description = format!("The {} add-on is not provisioned", self.add_on.name);
            return self.ctx.transitions.fail(operation, &description, None).await;
        };

        let name = self.add_on.name.clone();
        let (operation, binding_id) = match state.binding_id {
            Some(binding_id) => (operation, binding_id),
            None => {
                let binding_id = Uuid::new_v4().to_string();
                let stored = self
                    .ctx
                    .transitions
                    .update(operation, |op| {
                        let state = op.payload.add_on_mut(&name);
                        if state.binding_id.is_none() {
                            state.binding_id = Some(binding_id.clone());
                        }
                    })
                    .await?;
                let binding_id = stored
                    .payload
                    .add_on(&name)
                    .and_then(|state| state.binding_id.clone())
                    .unwrap_or(binding_id);
                (stored, binding_id)
            }
        };

        if let Err(err) = self
            .ctx
            .broker
            .bind(&instance_id, &binding_id, &service_ref(&self.add_on))
            .await
        {
            let action = format!("Binding of the {name} add-on");
            return self.ctx.client_error(operation, &action, err).await;
        }

        let stored = self
            .ctx
            .transitions
            .update(operation, |op| {
                op.payload.add_on_mut(&name).bound = true;
            })
            .await?;
        Ok(StepOutput::done(stored))
    }
}

// ============================================================================
// Finish
// ============================================================================

pub struct FinishProvisioningStep {
    ctx: StepContext,
}

impl FinishProvisioningStep {
    pub fn new(ctx: StepContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Step for FinishProvisioningStep {
    fn name(&self) -> &str {
        "finish_provisioning"
    }

    async fn run(&self, operation: Operation) -> StepResult {
        self.ctx
            .transitions
            .succeed(operation, "Environment provisioned")
            .await
    }
}
