// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Steps that remove an environment: add-ons first, then the runtime.

use async_trait::async_trait;
use envbroker_core::{Operation, OperationType, Step, StepOutput, StepResult};
use tracing::{debug, info, warn};

use super::StepContext;
use crate::catalog::AddOn;
use crate::clients::{BrokerResponse, LastOperationState, ProvisionerState, ServiceRef};

const STATE_LOADED: &str = "provisioning_state_loaded";
const RUNTIME_DEPROVISION_REQUESTED: &str = "runtime_deprovision_requested";

fn deprovision_requested_flag(add_on: &str) -> String {
    format!("{add_on}_deprovision_requested")
}

/// Copies the runtime and add-on progress of the instance's latest
/// provisioning into this operation's payload.
pub struct DeprovisioningInitStep {
    ctx: StepContext,
}

impl DeprovisioningInitStep {
    pub fn new(ctx: StepContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Step for DeprovisioningInitStep {
    fn name(&self) -> &str {
        "deprovisioning_initialisation"
    }

    async fn run(&self, operation: Operation) -> StepResult {
        if operation.payload.flag(STATE_LOADED) {
            return Ok(StepOutput::done(operation));
        }

        let history = self
            .ctx
            .transitions
            .store()
            .list_by_instance_id(&operation.instance_id)
            .await?;
        let provisioning = history
            .into_iter()
            .rev()
            .find(|op| op.operation_type == OperationType::Provision);

        match &provisioning {
            Some(source) => info!(
                operation_id = %operation.id,
                provisioning_operation_id = %source.id,
                runtime_id = ?source.payload.runtime_id,
                "Deprovisioning environment"
            ),
            None => warn!(
                operation_id = %operation.id,
                instance_id = %operation.instance_id,
                "No provisioning found for instance, nothing to remove"
            ),
        }

        let stored = self
            .ctx
            .transitions
            .update(operation, |op| {
                if let Some(source) = &provisioning {
                    op.payload.runtime_id = source.payload.runtime_id.clone();
                    op.payload.add_ons = source.payload.add_ons.clone();
                }
                op.payload.set_flag(STATE_LOADED, true);
            })
            .await?;
        Ok(StepOutput::done(stored))
    }
}

/// Unbinds and deprovisions every add-on instance that was created.
pub struct DeprovisionAddOnsStep {
    ctx: StepContext,
    catalog: Vec<AddOn>,
}

impl DeprovisionAddOnsStep {
    pub fn new(ctx: StepContext, catalog: Vec<AddOn>) -> Self {
        Self { ctx, catalog }
    }

    /// Advance one add-on. A requeue means it is not gone yet.
    async fn deprovision(&self, operation: Operation, name: &str) -> StepResult {
        let Some(state) = operation.payload.add_on(name).cloned() else {
            return Ok(StepOutput::done(operation));
        };
        let Some(instance_id) = state.instance_id.clone() else {
            return Ok(StepOutput::done(operation));
        };

        let Some(add_on) = self.catalog.iter().find(|a| a.name == name) else {
            warn!(
                operation_id = %operation.id,
                add_on = name,
                "Add-on no longer in the catalog, leaving its instance behind"
            );
            let stored = self
                .ctx
                .transitions
                .update(operation, |op| {
                    op.payload.add_on_mut(name).deprovisioned = true;
                })
                .await?;
            return Ok(StepOutput::done(stored));
        };
        let service = ServiceRef {
            service_id: add_on.service_id.clone(),
            plan_id: add_on.plan_id.clone(),
        };

        let mut operation = operation;

        // A recorded binding ID may have reached the broker even when the
        // bind call never reported success.
        if let Some(binding_id) = state.binding_id.as_deref() {
            match self
                .ctx
                .broker
                .unbind(&instance_id, binding_id, &service)
                .await
            {
                Ok(()) => {}
                Err(err) if err.is_gone() => debug!(
                    operation_id = %operation.id,
                    add_on = name,
                    binding_id,
                    "Binding already gone"
                ),
                Err(err) => {
                    let action = format!("Unbinding of the {name} add-on");
                    return self.ctx.client_error(operation, &action, err).await;
                }
            }
            operation = self
                .ctx
                .transitions
                .update(operation, |op| {
                    let state = op.payload.add_on_mut(name);
                    state.bound = false;
                    state.binding_id = None;
                })
                .await?;
        }

        let requested = deprovision_requested_flag(name);
        if !operation.payload.flag(&requested) {
            let response = match self.ctx.broker.deprovision(&instance_id, &service).await {
                Ok(response) => response,
                Err(err) => {
                    let action = format!("Deprovisioning of the {name} add-on");
                    return self.ctx.client_error(operation, &action, err).await;
                }
            };

            return match response {
                BrokerResponse::Done => {
                    let stored = self
                        .ctx
                        .transitions
                        .update(operation, |op| {
                            op.payload.set_flag(&requested, true);
                            op.payload.add_on_mut(name).deprovisioned = true;
                        })
                        .await?;
                    Ok(StepOutput::done(stored))
                }
                BrokerResponse::InProgress { operation: token } => {
                    let stored = self
                        .ctx
                        .transitions
                        .update(operation, |op| {
                            op.payload.set_flag(&requested, true);
                            op.payload.add_on_mut(name).last_operation = token.clone();
                        })
                        .await?;
                    let message = format!("Waiting for removal of the {name} add-on");
                    self.ctx.wait(stored, &message).await
                }
            };
        }

        let token = operation
            .payload
            .add_on(name)
            .and_then(|state| state.last_operation.clone());
        let removed = match self
            .ctx
            .broker
            .last_operation(&instance_id, &service, token.as_deref())
            .await
        {
            Ok(last) => match last.state {
                LastOperationState::Succeeded => true,
                LastOperationState::InProgress => false,
                LastOperationState::Failed => {
                    let description = format!(
                        "Deprovisioning of the {name} add-on failed: {}",
                        last.description.as_deref().unwrap_or("no details")
                    );
                    return self.ctx.transitions.fail(operation, &description, None).await;
                }
            },
            Err(err) if err.is_gone() => true,
            Err(err) => {
                let action = format!("Removal check of the {name} add-on");
                return self.ctx.client_error(operation, &action, err).await;
            }
        };

        if !removed {
            let message = format!("Waiting for removal of the {name} add-on");
            return self.ctx.wait(operation, &message).await;
        }

        let stored = self
            .ctx
            .transitions
            .update(operation, |op| {
                op.payload.add_on_mut(name).deprovisioned = true;
            })
            .await?;
        Ok(StepOutput::done(stored))
    }
}

#[async_trait]
impl Step for DeprovisionAddOnsStep {
    fn name(&self) -> &str {
        "deprovision_add_ons"
    }

    async fn run(&self, operation: Operation) -> StepResult {
        let pending: Vec<String> = operation
            .payload
            .add_ons
            .iter()
            .filter(|(_, state)| state.instance_id.is_some() && !state.deprovisioned)
            .map(|(name, _)| name.clone())
            .collect();

        let mut operation = operation;
        for name in pending {
            debug!(operation_id = %operation.id, add_on = %name, "Deprovisioning add-on");
            let output = self.deprovision(operation, &name).await?;
            if output.is_requeue() {
                return Ok(output);
            }
            operation = output.operation;
        }

        Ok(StepOutput::done(operation))
    }
}

/// Asks the provisioner to remove the runtime, once.
pub struct RemoveRuntimeStep {
    ctx: StepContext,
}

impl RemoveRuntimeStep {
    pub fn new(ctx: StepContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Step for RemoveRuntimeStep {
    fn name(&self) -> &str {
        "remove_runtime"
    }

    async fn run(&self, operation: Operation) -> StepResult {
        let payload = &operation.payload;
        if payload.runtime_removed || payload.flag(RUNTIME_DEPROVISION_REQUESTED) {
            return Ok(StepOutput::done(operation));
        }
        let Some(runtime_id) = operation.payload.runtime_id.clone() else {
            return Ok(StepOutput::done(operation));
        };

        match self.ctx.provisioner.deprovision_runtime(&runtime_id).await {
            Ok(provisioner_operation) => {
                info!(
                    operation_id = %operation.id,
                    runtime_id = %runtime_id,
                    provisioner_operation = %provisioner_operation,
                    "Runtime removal started"
                );
                let stored = self
                    .ctx
                    .transitions
                    .update(operation, |op| {
                        op.payload.provisioner_operation_id = Some(provisioner_operation.clone());
                        op.payload.set_flag(RUNTIME_DEPROVISION_REQUESTED, true);
                        op.description = "Runtime removal started".to_string();
                    })
                    .await?;
                Ok(StepOutput::done(stored))
            }
            Err(err) if err.is_gone() => {
                info!(
                    operation_id = %operation.id,
                    runtime_id = %runtime_id,
                    "Runtime already gone"
                );
                let stored = self
                    .ctx
                    .transitions
                    .update(operation, |op| {
                        op.payload.set_flag(RUNTIME_DEPROVISION_REQUESTED, true);
                        op.payload.runtime_removed = true;
                    })
                    .await?;
                Ok(StepOutput::done(stored))
            }
            Err(err) => {
                self.ctx
                    .client_error(operation, "Runtime removal request", err)
                    .await
            }
        }
    }
}

/// Polls the provisioner until the runtime is removed.
pub struct WaitForRuntimeRemovalStep {
    ctx: StepContext,
}

impl WaitForRuntimeRemovalStep {
    pub fn new(ctx: StepContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Step for WaitForRuntimeRemovalStep {
    fn name(&self) -> &str {
        "wait_for_runtime_removal"
    }

    async fn run(&self, operation: Operation) -> StepResult {
        let payload = &operation.payload;
        if payload.runtime_removed || !payload.flag(RUNTIME_DEPROVISION_REQUESTED) {
            return Ok(StepOutput::done(operation));
        }
        let Some(provisioner_operation) = operation.payload.provisioner_operation_id.clone() else {
            return Ok(StepOutput::done(operation));
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
                    .client_error(operation, "Runtime removal check", err)
                    .await;
            }
        };

        match status.state {
            ProvisionerState::InProgress => {
                self.ctx
                    .wait(operation, "Waiting for runtime removal")
                    .await
            }
            ProvisionerState::Succeeded => {
                let stored = self
                    .ctx
                    .transitions
                    .update(operation, |op| {
                        op.payload.runtime_removed = true;
                        op.description = "Runtime removed".to_string();
                    })
                    .await?;
                Ok(StepOutput::done(stored))
            }
            ProvisionerState::Failed => {
                let description = format!(
                    "Runtime removal failed: {}",
                    status.message.as_deref().unwrap_or("no details")
                );
                self.ctx.transitions.fail(operation, &description, None).await
            }
        }
    }
}

pub struct FinishDeprovisioningStep {
    ctx: StepContext,
}

impl FinishDeprovisioningStep {
    pub fn new(ctx: StepContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Step for FinishDeprovisioningStep {
    fn name(&self) -> &str {
        "finish_deprovisioning"
    }

    async fn run(&self, operation: Operation) -> StepResult {
        self.ctx
            .transitions
            .succeed(operation, "Environment deprovisioned")
            .await
    }
}
