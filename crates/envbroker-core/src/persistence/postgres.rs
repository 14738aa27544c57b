// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed operation store.
//!
//! The query functions are public so that tooling can run them inside its
//! own transactions; [`PostgresStore`] wraps each of them in the retry loop.

use sqlx::PgPool;

use crate::error::{Error, Result};
use crate::operation::{self, Operation, OperationState, OperationType};

use super::{
    OperationRecord, OperationStore, RetryPolicy, CurrentVersion, insert_error, into_operations,
    missed_update_error, with_retry,
};

const SELECT_COLUMNS: &str = r#"
    SELECT id, instance_id, operation_type, version, state, created_at, updated_at,
           description, provisioning_parameters, data, orchestration_id
    FROM operations
"#;

/// PostgreSQL-backed operation store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PostgresStore {
    /// Create a store with the default retry policy.
    pub fn new(pool: PgPool) -> Self {
        Self::with_retry_policy(pool, RetryPolicy::default())
    }

    /// Create a store with an explicit retry policy.
    pub fn with_retry_policy(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Query functions
// ============================================================================

/// Insert a new operation row.
pub async fn insert_operation(pool: &PgPool, operation: &Operation) -> Result<()> {
    let record = OperationRecord::from_operation(operation)?;

    sqlx::query(
        r#"
        INSERT INTO operations (id, instance_id, operation_type, version, state, created_at,
                                updated_at, description, provisioning_parameters, data,
                                orchestration_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(&record.id)
    .bind(&record.instance_id)
    .bind(&record.operation_type)
    .bind(record.version)
    .bind(&record.state)
    .bind(record.created_at)
    .bind(record.updated_at)
    .bind(&record.description)
    .bind(&record.provisioning_parameters)
    .bind(&record.data)
    .bind(&record.orchestration_id)
    .execute(pool)
    .await
    .map_err(|e| insert_error(&record.id, e))?;

    Ok(())
}

/// Get an operation by ID.
pub async fn get_operation(pool: &PgPool, operation_id: &str) -> Result<Operation> {
    let record = sqlx::query_as::<_, OperationRecord>(&format!("{SELECT_COLUMNS} WHERE id = $1"))
        .bind(operation_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| Error::database("get_by_id", e))?
        .ok_or_else(|| Error::NotFound {
            operation_id: operation_id.to_string(),
        })?;

    Operation::try_from(record)
}

/// Compare-and-swap update on `(id, version)`.
pub async fn update_operation(pool: &PgPool, operation: &Operation) -> Result<Operation> {
    let record = OperationRecord::from_operation(operation)?;
    let updated_at = operation::now();

    let result = sqlx::query(
        r#"
        UPDATE operations
        SET state = $3,
            description = $4,
            data = $5,
            orchestration_id = $6,
            updated_at = $7,
            version = version + 1
        WHERE id = $1
          AND version = $2
          AND state NOT IN ('succeeded', 'failed', 'canceled')
        "#,
    )
    .bind(&record.id)
    .bind(record.version)
    .bind(&record.state)
    .bind(&record.description)
    .bind(&record.data)
    .bind(&record.orchestration_id)
    .bind(updated_at)
    .execute(pool)
    .await
    .map_err(|e| Error::database("update", e))?;

    if result.rows_affected() == 0 {
        let current = sqlx::query_as::<_, CurrentVersion>(
            "SELECT version, state FROM operations WHERE id = $1",
        )
        .bind(&record.id)
        .fetch_optional(pool)
        .await
        .map_err(|e| Error::database("update", e))?;

        return Err(missed_update_error(operation, current));
    }

    let mut updated = operation.clone();
    updated.version += 1;
    updated.updated_at = updated_at;
    Ok(updated)
}

/// List operations of an instance, oldest first.
pub async fn list_by_instance(pool: &PgPool, instance_id: &str) -> Result<Vec<Operation>> {
    let records = sqlx::query_as::<_, OperationRecord>(&format!(
        "{SELECT_COLUMNS} WHERE instance_id = $1 ORDER BY created_at ASC"
    ))
    .bind(instance_id)
    .fetch_all(pool)
    .await
    .map_err(|e| Error::database("list_by_instance_id", e))?;

    into_operations(records)
}

/// Get the newest operation of an instance.
pub async fn get_last_by_instance(pool: &PgPool, instance_id: &str) -> Result<Operation> {
    let record = sqlx::query_as::<_, OperationRecord>(&format!(
        "{SELECT_COLUMNS} WHERE instance_id = $1 ORDER BY created_at DESC LIMIT 1"
    ))
    .bind(instance_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| Error::database("get_last_by_instance_id", e))?
    .ok_or_else(|| Error::NotFound {
        operation_id: format!("last operation of instance {instance_id}"),
    })?;

    Operation::try_from(record)
}

/// List pending and in-progress operations, optionally filtered by type.
pub async fn list_not_finished(
    pool: &PgPool,
    operation_type: Option<OperationType>,
) -> Result<Vec<Operation>> {
    let records = sqlx::query_as::<_, OperationRecord>(&format!(
        r#"{SELECT_COLUMNS}
        WHERE state IN ($1, $2)
          AND ($3::text IS NULL OR operation_type = $3)
        ORDER BY created_at ASC"#
    ))
    .bind(OperationState::Pending.as_str())
    .bind(OperationState::InProgress.as_str())
    .bind(operation_type.map(|t| t.as_str()))
    .fetch_all(pool)
    .await
    .map_err(|e| Error::database("list_not_finished", e))?;

    into_operations(records)
}

/// List operations of one orchestration, oldest first.
pub async fn list_by_orchestration(
    pool: &PgPool,
    orchestration_id: &str,
) -> Result<Vec<Operation>> {
    let records = sqlx::query_as::<_, OperationRecord>(&format!(
        "{SELECT_COLUMNS} WHERE orchestration_id = $1 ORDER BY created_at ASC"
    ))
    .bind(orchestration_id)
    .fetch_all(pool)
    .await
    .map_err(|e| Error::database("list_by_orchestration_id", e))?;

    into_operations(records)
}

#[async_trait::async_trait]
impl OperationStore for PostgresStore {
    async fn insert(&self, operation: &Operation) -> Result<()> {
        with_retry(&self.retry, "insert", || insert_operation(&self.pool, operation)).await
    }

    async fn get_by_id(&self, operation_id: &str) -> Result<Operation> {
        with_retry(&self.retry, "get_by_id", || {
            get_operation(&self.pool, operation_id)
        })
        .await
    }

    async fn update(&self, operation: &Operation) -> Result<Operation> {
        with_retry(&self.retry, "update", || update_operation(&self.pool, operation)).await
    }

    async fn list_by_instance_id(&self, instance_id: &str) -> Result<Vec<Operation>> {
        with_retry(&self.retry, "list_by_instance_id", || {
            list_by_instance(&self.pool, instance_id)
        })
        .await
    }

    async fn get_last_by_instance_id(&self, instance_id: &str) -> Result<Operation> {
        with_retry(&self.retry, "get_last_by_instance_id", || {
            get_last_by_instance(&self.pool, instance_id)
        })
        .await
    }

    async fn list_not_finished(
        &self,
        operation_type: Option<OperationType>,
    ) -> Result<Vec<Operation>> {
        with_retry(&self.retry, "list_not_finished", || {
            list_not_finished(&self.pool, operation_type)
        })
        .await
    }

    async fn list_by_orchestration_id(&self, orchestration_id: &str) -> Result<Vec<Operation>> {
        with_retry(&self.retry, "list_by_orchestration_id", || {
            list_by_orchestration(&self.pool, orchestration_id)
        })
        .await
    }

    async fn health_check_db(&self) -> Result<bool> {
        let row: (i32,) = sqlx::query_as("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::database("health_check", e))?;
        Ok(row.0 == 1)
    }
}
