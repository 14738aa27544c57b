// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed operation store.
//!
//! Used for embedded single-node deployments and for tests. The table and
//! the compare-and-swap discipline are the same as the PostgreSQL backend.

use std::path::Path;

use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

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

/// SQLite-backed operation store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    retry: RetryPolicy,
}

impl SqliteStore {
    /// Create a store from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_retry_policy(pool, RetryPolicy::default())
    }

    pub fn with_retry_policy(pool: SqlitePool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    /// Create and initialize a store backed by a database file.
    ///
    /// Creates parent directories and the file if needed, then runs migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| Error::Database {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
                temporary: false,
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| Error::database("connect", e))?;

        Self::migrate(&pool).await?;
        Ok(Self::new(pool))
    }

    /// Create a private in-memory store with migrations applied.
    ///
    /// A single connection is used so every caller sees the same database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| Error::database("connect", e))?;

        Self::migrate(&pool).await?;
        Ok(Self::new(pool))
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        crate::migrations::run_sqlite(pool).await.map_err(|e| Error::Database {
            operation: "migrate".to_string(),
            details: format!("Failed to run migrations: {}", e),
            temporary: false,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn insert_once(&self, operation: &Operation) -> Result<()> {
        let record = OperationRecord::from_operation(operation)?;

        sqlx::query(
            r#"
            INSERT INTO operations (id, instance_id, operation_type, version, state, created_at,
                                    updated_at, description, provisioning_parameters, data,
                                    orchestration_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
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
        .execute(&self.pool)
        .await
        .map_err(|e| insert_error(&record.id, e))?;

        Ok(())
    }

    async fn get_once(&self, operation_id: &str) -> Result<Operation> {
        let record =
            sqlx::query_as::<_, OperationRecord>(&format!("{SELECT_COLUMNS} WHERE id = ?"))
                .bind(operation_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| Error::database("get_by_id", e))?
                .ok_or_else(|| Error::NotFound {
                    operation_id: operation_id.to_string(),
                })?;

        Operation::try_from(record)
    }

    async fn update_once(&self, operation: &Operation) -> Result<Operation> {
        let record = OperationRecord::from_operation(operation)?;
        let updated_at = operation::now();

        let result = sqlx::query(
            r#"
            UPDATE operations
            SET state = ?,
                description = ?,
                data = ?,
                orchestration_id = ?,
                updated_at = ?,
                version = version + 1
            WHERE id = ?
              AND version = ?
              AND state NOT IN ('succeeded', 'failed', 'canceled')
            "#,
        )
        .bind(&record.state)
        .bind(&record.description)
        .bind(&record.data)
        .bind(&record.orchestration_id)
        .bind(updated_at)
        .bind(&record.id)
        .bind(record.version)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::database("update", e))?;

        if result.rows_affected() == 0 {
            let current = sqlx::query_as::<_, CurrentVersion>(
                "SELECT version, state FROM operations WHERE id = ?",
            )
            .bind(&record.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::database("update", e))?;

            return Err(missed_update_error(operation, current));
        }

        let mut updated = operation.clone();
        updated.version += 1;
        updated.updated_at = updated_at;
        Ok(updated)
    }

    async fn list_where(
        &self,
        operation: &str,
        clause: &str,
        binds: &[Option<&str>],
    ) -> Result<Vec<Operation>> {
        let sql = format!("{SELECT_COLUMNS} WHERE {clause} ORDER BY created_at ASC");
        let mut query = sqlx::query_as::<_, OperationRecord>(&sql);
        for value in binds {
            query = query.bind(*value);
        }
        let records = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::database(operation, e))?;

        into_operations(records)
    }
}

#[async_trait::async_trait]
impl OperationStore for SqliteStore {
    async fn insert(&self, operation: &Operation) -> Result<()> {
        with_retry(&self.retry, "insert", || self.insert_once(operation)).await
    }

    async fn get_by_id(&self, operation_id: &str) -> Result<Operation> {
        with_retry(&self.retry, "get_by_id", || self.get_once(operation_id)).await
    }

    async fn update(&self, operation: &Operation) -> Result<Operation> {
        with_retry(&self.retry, "update", || self.update_once(operation)).await
    }

    async fn list_by_instance_id(&self, instance_id: &str) -> Result<Vec<Operation>> {
        let binds = [Some(instance_id)];
        with_retry(&self.retry, "list_by_instance_id", || {
            self.list_where("list_by_instance_id", "instance_id = ?", &binds)
        })
        .await
    }

    async fn get_last_by_instance_id(&self, instance_id: &str) -> Result<Operation> {
        let operations = self.list_by_instance_id(instance_id).await?;
        operations.into_iter().last().ok_or_else(|| Error::NotFound {
            operation_id: format!("last operation of instance {instance_id}"),
        })
    }

    async fn list_not_finished(
        &self,
        operation_type: Option<OperationType>,
    ) -> Result<Vec<Operation>> {
        let binds = [
            Some(OperationState::Pending.as_str()),
            Some(OperationState::InProgress.as_str()),
            operation_type.map(|t| t.as_str()),
            operation_type.map(|t| t.as_str()),
        ];
        with_retry(&self.retry, "list_not_finished", || {
            self.list_where(
                "list_not_finished",
                "state IN (?, ?) AND (? IS NULL OR operation_type = ?)",
                &binds,
            )
        })
        .await
    }

    async fn list_by_orchestration_id(&self, orchestration_id: &str) -> Result<Vec<Operation>> {
        let binds = [Some(orchestration_id)];
        with_retry(&self.retry, "list_by_orchestration_id", || {
            self.list_where("list_by_orchestration_id", "orchestration_id = ?", &binds)
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
