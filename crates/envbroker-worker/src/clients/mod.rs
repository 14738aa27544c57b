// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Downstream clients used by the provisioning steps.
//!
//! Every client error is classified before it reaches a step: transport
//! failures and HTTP 5xx/408/429 are temporary, everything else permanent.

pub mod http;
pub mod mock;

pub use self::http::{HttpProvisionerClient, HttpServiceBrokerClient};
pub use self::mock::{MockProvisioner, MockServiceBroker};

use std::error::Error as StdError;
use std::fmt;

use async_trait::async_trait;
use envbroker_core::classifier::{ClassifiedError, Classify, ErrorKind, classify_http_status};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Classified failure of a downstream call.
#[derive(Debug)]
pub struct ClientError {
    kind: ErrorKind,
    status: Option<u16>,
    message: String,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl ClientError {
    pub fn temporary(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Temporary,
            status: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            status: None,
            message: message.into(),
            source: None,
        }
    }

    /// An unexpected HTTP status, classified by status code.
    pub fn from_status(status: u16, body: &str) -> Self {
        Self {
            kind: classify_http_status(status),
            status: Some(status),
            message: format!("unexpected HTTP status {status}: {}", body.trim()),
            source: None,
        }
    }

    pub(crate) fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// The resource does not exist (404) or is already gone (410).
    pub fn is_gone(&self) -> bool {
        matches!(self.status, Some(404) | Some(410))
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

impl StdError for ClientError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

impl Classify for ClientError {
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<ClientError> for envbroker_core::Error {
    fn from(err: ClientError) -> Self {
        let kind = err.kind;
        envbroker_core::Error::Classified(ClassifiedError::wrap(
            kind,
            "downstream call failed",
            err,
        ))
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

// ============================================================================
// Cluster provisioner
// ============================================================================

/// Request to create a tenant runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionRuntimeInput {
    pub runtime_id: String,
    pub instance_id: String,
    pub plan: String,
    pub region: Option<String>,
    /// Repeating a request with the same key returns the original operation.
    pub idempotency_key: String,
}

/// Progress of a provisioner operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionerState {
    InProgress,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionerOperationStatus {
    pub operation_id: String,
    pub state: ProvisionerState,
    #[serde(default)]
    pub message: Option<String>,
}

/// Creates and removes Kubernetes runtimes.
#[async_trait]
pub trait ProvisionerClient: Send + Sync {
    /// Start creating a runtime. Returns the provisioner operation ID.
    async fn provision_runtime(&self, input: &ProvisionRuntimeInput) -> ClientResult<String>;

    /// Start removing a runtime. Returns the provisioner operation ID.
    async fn deprovision_runtime(&self, runtime_id: &str) -> ClientResult<String>;

    async fn operation_status(&self, operation_id: &str)
    -> ClientResult<ProvisionerOperationStatus>;
}

// ============================================================================
// Add-on service broker
// ============================================================================

/// Identifies the broker service and plan of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRef {
    pub service_id: String,
    pub plan_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionInstanceRequest {
    #[serde(flatten)]
    pub service: ServiceRef,
    /// Runtime the instance is installed into.
    pub context: Value,
    pub parameters: Value,
}

/// Broker answer to an asynchronous-capable request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerResponse {
    /// The request completed synchronously.
    Done,
    /// The request is being processed; poll `last_operation` with this token.
    InProgress { operation: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LastOperationState {
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastOperation {
    pub state: LastOperationState,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    #[serde(default)]
    pub credentials: Value,
}

/// Open Service Broker style API for add-ons.
#[async_trait]
pub trait ServiceBrokerClient: Send + Sync {
    async fn provision(
        &self,
        instance_id: &str,
        request: &ProvisionInstanceRequest,
    ) -> ClientResult<BrokerResponse>;

    async fn last_operation(
        &self,
        instance_id: &str,
        service: &ServiceRef,
        operation: Option<&str>,
    ) -> ClientResult<LastOperation>;

    async fn bind(
        &self,
        instance_id: &str,
        binding_id: &str,
        service: &ServiceRef,
    ) -> ClientResult<Binding>;

    async fn unbind(
        &self,
        instance_id: &str,
        binding_id: &str,
        service: &ServiceRef,
    ) -> ClientResult<()>;

    async fn deprovision(
        &self,
        instance_id: &str,
        service: &ServiceRef,
    ) -> ClientResult<BrokerResponse>;
}
