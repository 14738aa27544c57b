// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for envbroker-core.
//!
//! The [`OperationStore`] is the only path through which operations are
//! read and written. Every update is a compare-and-swap on the `version`
//! column: `UPDATE ... WHERE id = ? AND version = ?`. Zero affected rows
//! means the writer lost a race (or the row is gone, or already terminal),
//! and the caller must reload instead of overwriting.

pub mod postgres;
pub mod retry;
pub mod sqlite;

pub use self::postgres::PostgresStore;
pub use self::retry::{RetryPolicy, with_retry};
pub use self::sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::operation::{Operation, OperationPayload, OperationType};

/// Operation row as stored in the `operations` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OperationRecord {
    /// Unique operation identifier.
    pub id: String,
    /// The tenant's provisioned resource.
    pub instance_id: String,
    /// Operation type (provision, deprovision, upgrade_kyma, upgrade_cluster, update).
    pub operation_type: String,
    /// Optimistic-lock version.
    pub version: i64,
    /// Lifecycle state (pending, in_progress, succeeded, failed, canceled).
    pub state: String,
    /// When the operation was created.
    pub created_at: DateTime<Utc>,
    /// When the operation was last updated.
    pub updated_at: DateTime<Utc>,
    /// Last status message.
    pub description: String,
    /// Serialized provisioning parameters.
    pub provisioning_parameters: String,
    /// Serialized type-specific payload.
    pub data: String,
    /// Batch trigger this operation belongs to.
    pub orchestration_id: Option<String>,
}

impl OperationRecord {
    /// Serialize an operation into its row representation.
    pub fn from_operation(operation: &Operation) -> Result<Self> {
        Ok(Self {
            id: operation.id.clone(),
            instance_id: operation.instance_id.clone(),
            operation_type: operation.operation_type.as_str().to_string(),
            version: operation.version,
            state: operation.state.as_str().to_string(),
            created_at: operation.created_at,
            updated_at: operation.updated_at,
            description: operation.description.clone(),
            provisioning_parameters: serde_json::to_string(&operation.provisioning_parameters)?,
            data: serde_json::to_string(&operation.payload)?,
            orchestration_id: operation.orchestration_id.clone(),
        })
    }
}

impl TryFrom<OperationRecord> for Operation {
    type Error = Error;

    fn try_from(record: OperationRecord) -> Result<Self> {
        let payload: OperationPayload = serde_json::from_str(&record.data)?;
        Ok(Operation {
            id: record.id,
            instance_id: record.instance_id,
            operation_type: record.operation_type.parse()?,
            version: record.version,
            state: record.state.parse()?,
            created_at: record.created_at,
            updated_at: record.updated_at,
            description: record.description,
            provisioning_parameters: serde_json::from_str(&record.provisioning_parameters)?,
            payload,
            orchestration_id: record.orchestration_id,
        })
    }
}

pub(crate) fn into_operations(records: Vec<OperationRecord>) -> Result<Vec<Operation>> {
    records.into_iter().map(Operation::try_from).collect()
}

/// Version and state of a row, read back after a conditional update missed.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct CurrentVersion {
    pub version: i64,
    pub state: String,
}

/// Decide why a conditional update affected zero rows.
pub(crate) fn missed_update_error(
    operation: &Operation,
    current: Option<CurrentVersion>,
) -> Error {
    match current {
        None => Error::NotFound {
            operation_id: operation.id.clone(),
        },
        Some(row) if row.version != operation.version => Error::Conflict {
            operation_id: operation.id.clone(),
            expected: operation.version,
            actual: row.version,
        },
        Some(row) => Error::TerminalState {
            operation_id: operation.id.clone(),
            state: row.state,
        },
    }
}

/// Map an insert failure, turning a primary-key violation into `AlreadyExists`.
pub(crate) fn insert_error(operation_id: &str, err: sqlx::Error) -> Error {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => Error::AlreadyExists {
            operation_id: operation_id.to_string(),
        },
        _ => Error::database("insert", err),
    }
}

/// Durable, concurrency-safe storage for operations.
///
/// Implementations retry transport failures with a fixed interval (see
/// [`RetryPolicy`]) and return `NotFound`, `Conflict`, `AlreadyExists` and
/// `TerminalState` immediately. No caching sits between the store and the
/// database: a committed update is visible to every later `get_by_id`.
#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Insert a new operation. Fails with `AlreadyExists` on a duplicate ID.
    async fn insert(&self, operation: &Operation) -> Result<()>;

    /// Load an operation. Fails with `NotFound` if absent.
    async fn get_by_id(&self, operation_id: &str) -> Result<Operation>;

    /// Conditionally write `operation`, based on `operation.version`.
    ///
    /// Returns the stored operation with `version + 1` and a fresh
    /// `updated_at`. Fails with `NotFound` if the row is gone, `Conflict` if
    /// it moved to another version and `TerminalState` if it is already
    /// succeeded, failed or canceled. Identity, type, creation time and
    /// provisioning parameters are never rewritten.
    async fn update(&self, operation: &Operation) -> Result<Operation>;

    /// All operations of an instance, oldest first.
    async fn list_by_instance_id(&self, instance_id: &str) -> Result<Vec<Operation>>;

    /// The most recently created operation of an instance.
    async fn get_last_by_instance_id(&self, instance_id: &str) -> Result<Operation>;

    /// Pending and in-progress operations, optionally of one type, oldest first.
    async fn list_not_finished(
        &self,
        operation_type: Option<OperationType>,
    ) -> Result<Vec<Operation>>;

    /// Operations created by one batch trigger, oldest first.
    async fn list_by_orchestration_id(&self, orchestration_id: &str) -> Result<Vec<Operation>>;

    /// Check database connectivity.
    async fn health_check_db(&self) -> Result<bool>;
}
