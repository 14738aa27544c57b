// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP implementations of the downstream clients.
//!
//! # Provisioner API
//!
//! | Call | Request | Success |
//! |------|---------|---------|
//! | provision | `POST /runtimes` + `Idempotency-Key` | `{"operation_id"}` |
//! | deprovision | `DELETE /runtimes/{id}` | `{"operation_id"}` |
//! | status | `GET /operations/{id}` | operation status |
//!
//! # Add-on broker API
//!
//! Open Service Broker v2 endpoints under `/v2/service_instances`, always
//! with `accepts_incomplete=true`. `410 Gone` on unbind and deprovision
//! means the resource is already removed and counts as success.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use super::{
    Binding, BrokerResponse, ClientError, ClientResult, LastOperation, ProvisionInstanceRequest,
    ProvisionRuntimeInput, ProvisionerClient, ProvisionerOperationStatus, ServiceBrokerClient,
    ServiceRef,
};

const BROKER_API_VERSION: &str = "2.16";

fn build_client(timeout: Duration) -> ClientResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ClientError::permanent("Failed to create HTTP client").with_source(e))
}

fn transport_error(url: &str, err: reqwest::Error) -> ClientError {
    if err.is_decode() {
        ClientError::permanent(format!("Invalid response body from {url}")).with_source(err)
    } else {
        ClientError::temporary(format!("HTTP request to {url} failed")).with_source(err)
    }
}

async fn unexpected_status(response: Response) -> ClientError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    ClientError::from_status(status, &body)
}

async fn read_json<T: DeserializeOwned>(url: &str, response: Response) -> ClientResult<T> {
    if !response.status().is_success() {
        return Err(unexpected_status(response).await);
    }
    response.json().await.map_err(|e| transport_error(url, e))
}

fn trim_base(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

#[derive(Debug, Deserialize)]
struct OperationAccepted {
    operation_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct AsyncAccepted {
    #[serde(default)]
    operation: Option<String>,
}

// ============================================================================
// Provisioner
// ============================================================================

/// Provisioner client over HTTP.
#[derive(Clone)]
pub struct HttpProvisionerClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProvisionerClient {
    pub fn new(base_url: &str, timeout: Duration) -> ClientResult<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: trim_base(base_url),
        })
    }
}

#[async_trait]
impl ProvisionerClient for HttpProvisionerClient {
    async fn provision_runtime(&self, input: &ProvisionRuntimeInput) -> ClientResult<String> {
        let url = format!("{}/runtimes", self.base_url);
        debug!(runtime_id = %input.runtime_id, url = %url, "Requesting runtime");

        let response = self
            .client
            .post(&url)
            .header("Idempotency-Key", &input.idempotency_key)
            .json(input)
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;

        let accepted: OperationAccepted = read_json(&url, response).await?;
        Ok(accepted.operation_id)
    }

    async fn deprovision_runtime(&self, runtime_id: &str) -> ClientResult<String> {
        let url = format!("{}/runtimes/{}", self.base_url, runtime_id);
        debug!(runtime_id, url = %url, "Requesting runtime removal");

        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;

        let accepted: OperationAccepted = read_json(&url, response).await?;
        Ok(accepted.operation_id)
    }

    async fn operation_status(
        &self,
        operation_id: &str,
    ) -> ClientResult<ProvisionerOperationStatus> {
        let url = format!("{}/operations/{}", self.base_url, operation_id);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;

        read_json(&url, response).await
    }
}

// ============================================================================
// Service broker
// ============================================================================

/// Open Service Broker client over HTTP.
#[derive(Clone)]
pub struct HttpServiceBrokerClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpServiceBrokerClient {
    pub fn new(base_url: &str, timeout: Duration) -> ClientResult<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: trim_base(base_url),
        })
    }

    fn instance_url(&self, instance_id: &str) -> String {
        format!("{}/v2/service_instances/{}", self.base_url, instance_id)
    }

    fn binding_url(&self, instance_id: &str, binding_id: &str) -> String {
        format!(
            "{}/service_bindings/{}",
            self.instance_url(instance_id),
            binding_id
        )
    }

    async fn async_response(url: &str, response: Response) -> ClientResult<BrokerResponse> {
        match response.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::GONE => Ok(BrokerResponse::Done),
            StatusCode::ACCEPTED => {
                let accepted: AsyncAccepted = response
                    .json()
                    .await
                    .map_err(|e| transport_error(url, e))?;
                Ok(BrokerResponse::InProgress {
                    operation: accepted.operation,
                })
            }
            _ => Err(unexpected_status(response).await),
        }
    }
}

#[async_trait]
impl ServiceBrokerClient for HttpServiceBrokerClient {
    async fn provision(
        &self,
        instance_id: &str,
        request: &ProvisionInstanceRequest,
    ) -> ClientResult<BrokerResponse> {
        let url = self.instance_url(instance_id);
        debug!(instance_id, service_id = %request.service.service_id, "Provisioning add-on instance");

        let response = self
            .client
            .put(&url)
            .header("X-Broker-API-Version", BROKER_API_VERSION)
            .query(&[("accepts_incomplete", "true")])
            .json(request)
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;

        if response.status() == StatusCode::GONE {
            return Err(unexpected_status(response).await);
        }
        Self::async_response(&url, response).await
    }

    async fn last_operation(
        &self,
        instance_id: &str,
        service: &ServiceRef,
        operation: Option<&str>,
    ) -> ClientResult<LastOperation> {
        let url = format!("{}/last_operation", self.instance_url(instance_id));

        let mut query = vec![
            ("service_id", service.service_id.as_str()),
            ("plan_id", service.plan_id.as_str()),
        ];
        if let Some(operation) = operation {
            query.push(("operation", operation));
        }

        let response = self
            .client
            .get(&url)
            .header("X-Broker-API-Version", BROKER_API_VERSION)
            .query(&query)
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;

        read_json(&url, response).await
    }

    async fn bind(
        &self,
        instance_id: &str,
        binding_id: &str,
        service: &ServiceRef,
    ) -> ClientResult<Binding> {
        let url = self.binding_url(instance_id, binding_id);
        debug!(instance_id, binding_id, "Binding add-on instance");

        let response = self
            .client
            .put(&url)
            .header("X-Broker-API-Version", BROKER_API_VERSION)
            .json(&json!({
                "service_id": service.service_id,
                "plan_id": service.plan_id,
            }))
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;

        read_json(&url, response).await
    }

    async fn unbind(
        &self,
        instance_id: &str,
        binding_id: &str,
        service: &ServiceRef,
    ) -> ClientResult<()> {
        let url = self.binding_url(instance_id, binding_id);

        let response = self
            .client
            .delete(&url)
            .header("X-Broker-API-Version", BROKER_API_VERSION)
            .query(&[
                ("service_id", service.service_id.as_str()),
                ("plan_id", service.plan_id.as_str()),
            ])
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;

        match response.status() {
            StatusCode::OK | StatusCode::GONE => Ok(()),
            _ => Err(unexpected_status(response).await),
        }
    }

    async fn deprovision(
        &self,
        instance_id: &str,
        service: &ServiceRef,
    ) -> ClientResult<BrokerResponse> {
        let url = self.instance_url(instance_id);
        debug!(instance_id, service_id = %service.service_id, "Deprovisioning add-on instance");

        let response = self
            .client
            .delete(&url)
            .header("X-Broker-API-Version", BROKER_API_VERSION)
            .query(&[
                ("accepts_incomplete", "true"),
                ("service_id", service.service_id.as_str()),
                ("plan_id", service.plan_id.as_str()),
            ])
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;

        Self::async_response(&url, response).await
    }
}
