// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provisioning and deprovisioning step sets.
//!
//! Provisioning:
//!
//! | Weight | Step | Payload marker |
//! |--------|------|----------------|
//! | 0 | `initialisation` | `runtime_id` |
//! | 1 | `create_runtime` | `runtime_requested` |
//! | 2 | `wait_for_runtime` | `runtime_ready` |
//! | 3 | `provision_<add-on>` (plan dependent) | `add_ons[name].provisioned` |
//! | 4 | `bind_<add-on>` (plan dependent) | `add_ons[name].bound` |
//! | 10 | `finish_provisioning` | state `succeeded` |
//!
//! Deprovisioning:
//!
//! | Weight | Step | Payload marker |
//! |--------|------|----------------|
//! | 0 | `deprovisioning_initialisation` | `provisioning_state_loaded` flag |
//! | 1 | `deprovision_add_ons` | `add_ons[name].deprovisioned` |
//! | 2 | `remove_runtime` | `runtime_deprovision_requested` flag |
//! | 3 | `wait_for_runtime_removal` | `runtime_removed` |
//! | 10 | `finish_deprovisioning` | state `succeeded` |
//!
//! Every downstream call is preceded by a payload check and followed by
//! persisting its outcome, so a step re-run after a crash or requeue does
//! not repeat work that already succeeded.

pub mod deprovisioning;
pub mod provisioning;

use std::sync::Arc;
use std::time::Duration;

use envbroker_core::{Classify, Operation, Pipeline, StepResult, Transitions};
use tracing::warn;

use crate::catalog::AddOn;
use crate::clients::{ClientError, ProvisionerClient, ServiceBrokerClient};

pub use self::deprovisioning::{
    DeprovisionAddOnsStep, DeprovisioningInitStep, FinishDeprovisioningStep, RemoveRuntimeStep,
    WaitForRuntimeRemovalStep,
};
pub use self::provisioning::{
    BindAddOnStep, CreateRuntimeStep, FinishProvisioningStep, InitialisationStep,
    ProvisionAddOnStep, WaitForRuntimeStep,
};

/// Weight of the add-on provisioning steps.
pub const ADD_ON_PROVISION_WEIGHT: i32 = 3;
/// Weight of the add-on binding steps.
pub const ADD_ON_BIND_WEIGHT: i32 = 4;
/// Weight of the steps that complete an operation.
pub const FINISH_WEIGHT: i32 = 10;

/// Collaborators and timing shared by all steps.
#[derive(Clone)]
pub struct StepContext {
    pub provisioner: Arc<dyn ProvisionerClient>,
    pub broker: Arc<dyn ServiceBrokerClient>,
    pub transitions: Transitions,
    /// How long a step may keep waiting or retrying before it fails.
    pub operation_timeout: Duration,
    /// Delay between polls of a downstream operation.
    pub poll_interval: Duration,
    /// Delay before retrying a temporary downstream failure.
    pub retry_interval: Duration,
}

impl StepContext {
    pub fn new(
        provisioner: Arc<dyn ProvisionerClient>,
        broker: Arc<dyn ServiceBrokerClient>,
        transitions: Transitions,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            provisioner,
            broker,
            transitions,
            operation_timeout,
            poll_interval: Duration::from_secs(30),
            retry_interval: Duration::from_secs(10),
        }
    }

    pub fn with_intervals(mut self, poll_interval: Duration, retry_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.retry_interval = retry_interval;
        self
    }

    /// Retry temporary client errors, fail the operation on permanent ones.
    pub(crate) async fn client_error(
        &self,
        operation: Operation,
        action: &str,
        err: ClientError,
    ) -> StepResult {
        if err.is_temporary() {
            warn!(
                operation_id = %operation.id,
                action,
                error = %err,
                "Downstream call failed, will retry"
            );
            self.transitions
                .retry(
                    operation,
                    &format!("{action} failed, retrying"),
                    self.retry_interval,
                    self.operation_timeout,
                )
                .await
        } else {
            let description = format!("{action} failed: {}", err.message());
            self.transitions
                .fail(operation, &description, Some(err.into()))
                .await
        }
    }

    /// Requeue while a downstream operation is still running.
    pub(crate) async fn wait(&self, operation: Operation, message: &str) -> StepResult {
        self.transitions
            .retry(operation, message, self.poll_interval, self.operation_timeout)
            .await
    }
}

/// Steps that create an environment, with add-on steps for every catalog
/// entry that applies to the operation's plan.
pub fn provisioning_pipeline(ctx: &StepContext, add_ons: &[AddOn]) -> Pipeline {
    let mut builder = Pipeline::builder()
        .init_step(InitialisationStep::new(ctx.clone()))
        .step(1, CreateRuntimeStep::new(ctx.clone()))
        .step(2, WaitForRuntimeStep::new(ctx.clone()));

    for add_on in add_ons {
        let provision_filter = add_on.clone();
        builder = builder.step_if(
            ADD_ON_PROVISION_WEIGHT,
            ProvisionAddOnStep::new(ctx.clone(), add_on.clone()),
            move |op: &Operation| provision_filter.applies_to_plan(op.parameter("plan")),
        );

        let bind_filter = add_on.clone();
        builder = builder.step_if(
            ADD_ON_BIND_WEIGHT,
            BindAddOnStep::new(ctx.clone(), add_on.clone()),
            move |op: &Operation| bind_filter.applies_to_plan(op.parameter("plan")),
        );
    }

    builder
        .step(FINISH_WEIGHT, FinishProvisioningStep::new(ctx.clone()))
        .build()
}

/// Steps that remove an environment and everything installed into it.
pub fn deprovisioning_pipeline(ctx: &StepContext, add_ons: &[AddOn]) -> Pipeline {
    Pipeline::builder()
        .init_step(DeprovisioningInitStep::new(ctx.clone()))
        .step(1, DeprovisionAddOnsStep::new(ctx.clone(), add_ons.to_vec()))
        .step(2, RemoveRuntimeStep::new(ctx.clone()))
        .step(3, WaitForRuntimeRemovalStep::new(ctx.clone()))
        .step(FINISH_WEIGHT, FinishDeprovisioningStep::new(ctx.clone()))
        .build()
}
