// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The persisted unit of work.
//!
//! An [`Operation`] is one provisioning, upgrade or deprovisioning workflow
//! instance. Steps never keep state in memory between invocations; anything a
//! Step needs to remember ("the runtime was already requested") lives in the
//! [`OperationPayload`], which is stored as a whole alongside the operation.
//!
//! # Lifecycle
//!
//! ```text
//! ┌─────────┐     ┌────────────┐     ┌───────────┐
//! │ PENDING │────▶│ IN_PROGRESS│──┬─▶│ SUCCEEDED │
//! └─────────┘     └────────────┘  │  └───────────┘
//!      │                          ├─▶┌───────────┐
//!      │                          │  │  FAILED   │
//!      │                          │  └───────────┘
//!      └──────────────────────────┴─▶┌───────────┐
//!                                    │ CANCELED  │
//!                                    └───────────┘
//! ```
//!
//! Once terminal, an operation is immutable.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Kind of workflow an operation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Provision,
    Deprovision,
    UpgradeKyma,
    UpgradeCluster,
    Update,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Provision => "provision",
            OperationType::Deprovision => "deprovision",
            OperationType::UpgradeKyma => "upgrade_kyma",
            OperationType::UpgradeCluster => "upgrade_cluster",
            OperationType::Update => "update",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provision" => Ok(OperationType::Provision),
            "deprovision" => Ok(OperationType::Deprovision),
            "upgrade_kyma" => Ok(OperationType::UpgradeKyma),
            "upgrade_cluster" => Ok(OperationType::UpgradeCluster),
            "update" => Ok(OperationType::Update),
            other => Err(Error::permanent(format!("unknown operation type '{other}'"))),
        }
    }
}

/// Lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Canceled,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Pending => "pending",
            OperationState::InProgress => "in_progress",
            OperationState::Succeeded => "succeeded",
            OperationState::Failed => "failed",
            OperationState::Canceled => "canceled",
        }
    }

    /// Succeeded, failed and canceled operations never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Succeeded | OperationState::Failed | OperationState::Canceled
        )
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// Staying in the same non-terminal state is allowed (a description
    /// or payload update). Pending may be canceled before it ever starts.
    pub fn can_transition_to(&self, next: OperationState) -> bool {
        use OperationState::*;
        match (self, next) {
            (Pending, Pending) | (InProgress, InProgress) => true,
            (Pending, InProgress) | (Pending, Canceled) | (Pending, Failed) => true,
            (InProgress, Succeeded) | (InProgress, Failed) | (InProgress, Canceled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OperationState::Pending),
            "in_progress" => Ok(OperationState::InProgress),
            "succeeded" => Ok(OperationState::Succeeded),
            "failed" => Ok(OperationState::Failed),
            "canceled" => Ok(OperationState::Canceled),
            other => Err(Error::permanent(format!(
                "unknown operation state '{other}'"
            ))),
        }
    }
}

/// Progress of one service-broker style add-on (logging, connectivity, eventing).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceInstanceState {
    /// Broker-side instance ID, chosen before the first provision call.
    pub instance_id: Option<String>,
    /// Provision request accepted by the broker.
    pub provisioning_triggered: bool,
    /// Broker reported the instance as ready.
    pub provisioned: bool,
    /// Binding ID, chosen before the first bind call.
    pub binding_id: Option<String>,
    /// Binding created.
    pub bound: bool,
    /// Broker operation token for polling `last_operation`.
    pub last_operation: Option<String>,
    /// Deprovision request accepted and completed.
    pub deprovisioned: bool,
}

/// Type-specific state that Steps read and write.
///
/// This is the only place Steps may record what they already did. It is
/// serialized as one JSON document and must survive store/restore cycles
/// unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationPayload {
    /// Runtime identifier assigned to the tenant's environment.
    pub runtime_id: Option<String>,
    /// Provisioner-side operation token of the last create/delete/upgrade request.
    pub provisioner_operation_id: Option<String>,
    /// Cluster provisioning requested.
    pub runtime_requested: bool,
    /// Cluster reported ready by the provisioner.
    pub runtime_ready: bool,
    /// Cluster removal confirmed by the provisioner.
    pub runtime_removed: bool,
    /// Add-on progress keyed by add-on name.
    pub add_ons: BTreeMap<String, ServiceInstanceState>,
    /// Free-form flags for steps without a dedicated field.
    pub flags: BTreeMap<String, serde_json::Value>,
    /// Start of the current run of retries. Cleared when a step records progress.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrying_since: Option<DateTime<Utc>>,
}

impl OperationPayload {
    /// Progress of `add_on`, created empty on first access.
    pub fn add_on_mut(&mut self, add_on: &str) -> &mut ServiceInstanceState {
        self.add_ons.entry(add_on.to_string()).or_default()
    }

    pub fn add_on(&self, add_on: &str) -> Option<&ServiceInstanceState> {
        self.add_ons.get(add_on)
    }

    pub fn flag(&self, name: &str) -> bool {
        matches!(self.flags.get(name), Some(serde_json::Value::Bool(true)))
    }

    pub fn set_flag(&mut self, name: &str, value: bool) {
        self.flags
            .insert(name.to_string(), serde_json::Value::Bool(value));
    }
}

/// Persisted record of one long-running workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    /// The tenant's provisioned resource.
    pub instance_id: String,
    pub operation_type: OperationType,
    /// Optimistic-lock token, incremented on every committed update.
    pub version: i64,
    pub state: OperationState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Human-readable last status message.
    pub description: String,
    /// Input captured at creation. Never modified by the engine.
    pub provisioning_parameters: serde_json::Value,
    pub payload: OperationPayload,
    /// Groups operations created by one batch trigger.
    pub orchestration_id: Option<String>,
}

impl Operation {
    /// A new pending operation with a random ID and version 0.
    pub fn new(
        instance_id: impl Into<String>,
        operation_type: OperationType,
        provisioning_parameters: serde_json::Value,
    ) -> Self {
        Self::with_id(
            Uuid::new_v4().to_string(),
            instance_id,
            operation_type,
            provisioning_parameters,
        )
    }

    /// A new pending operation with an explicit ID.
    pub fn with_id(
        id: impl Into<String>,
        instance_id: impl Into<String>,
        operation_type: OperationType,
        provisioning_parameters: serde_json::Value,
    ) -> Self {
        let now = now();
        Self {
            id: id.into(),
            instance_id: instance_id.into(),
            operation_type,
            version: 0,
            state: OperationState::Pending,
            created_at: now,
            updated_at: now,
            description: "Operation created".to_string(),
            provisioning_parameters,
            payload: OperationPayload::default(),
            orchestration_id: None,
        }
    }

    pub fn with_orchestration_id(mut self, orchestration_id: impl Into<String>) -> Self {
        self.orchestration_id = Some(orchestration_id.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move to `next`, rejecting backwards or post-terminal changes.
    pub fn transition(&mut self, next: OperationState) -> Result<(), Error> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                operation_id: self.id.clone(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Look up a string field in the provisioning parameters.
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.provisioning_parameters.get(key).and_then(|v| v.as_str())
    }
}

/// Current time at the precision every store backend keeps (microseconds),
/// so an operation compares equal after a round trip.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}
