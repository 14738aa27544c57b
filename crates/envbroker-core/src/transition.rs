// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operation transition helper.
//!
//! Steps use [`Transitions`] instead of talking to the store directly, so
//! persistence, lifecycle validation and conflict handling live in one place.
//!
//! | Call | Persists | Returns |
//! |------|----------|---------|
//! | `succeed` | state `succeeded` | done |
//! | `fail` | state `failed` | `Err(OperationFailed)` |
//! | `cancel` | state `canceled` | done |
//! | `retry` | description, or `failed` after the timeout | requeue after interval |
//! | `update` | the mutation, ending any run of retries | the stored operation |
//!
//! When a write fails with a temporary error (database unreachable), the
//! helper returns a requeue after the persist retry interval instead.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::classifier::{ClassifiedError, Classify, ErrorKind};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::operation::{self, Operation, OperationState};
use crate::persistence::OperationStore;
use crate::step::{StepOutput, StepResult};

/// Apply `mutate` and persist, re-reading and re-applying on conflict.
///
/// At most `max_attempts` writes are made. Running out of attempts yields a
/// permanent error; finding the fresh copy terminal yields `TerminalState`.
pub async fn with_conflict_retry<F>(
    store: &dyn OperationStore,
    max_attempts: u32,
    operation: Operation,
    mut mutate: F,
) -> Result<Operation>
where
    F: FnMut(&mut Operation) -> Result<()> + Send,
{
    let max_attempts = max_attempts.max(1);
    let mut base = operation;
    let mut attempt = 1;

    loop {
        let mut candidate = base.clone();
        mutate(&mut candidate)?;

        match store.update(&candidate).await {
            Ok(stored) => return Ok(stored),
            Err(err @ Error::Conflict { .. }) => {
                if attempt >= max_attempts {
                    return Err(Error::Classified(ClassifiedError::wrap(
                        ErrorKind::Permanent,
                        format!(
                            "Operation '{}' still conflicting after {} attempts",
                            candidate.id, max_attempts
                        ),
                        err,
                    )));
                }

                debug!(
                    operation_id = %candidate.id,
                    attempt,
                    max_attempts,
                    error = %err,
                    "Conflict while persisting operation, reloading"
                );

                base = store.get_by_id(&candidate.id).await?;
                if base.is_terminal() {
                    return Err(Error::TerminalState {
                        operation_id: base.id,
                        state: base.state.to_string(),
                    });
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

enum Persisted {
    Stored(Operation),
    /// A temporary failure kept the write from happening.
    Deferred(Operation),
}

/// Persistence helper handed to steps.
#[derive(Clone)]
pub struct Transitions {
    store: Arc<dyn OperationStore>,
    conflict_retry_attempts: u32,
    persist_retry_interval: Duration,
}

impl Transitions {
    pub fn new(store: Arc<dyn OperationStore>) -> Self {
        Self::from_config(store, &EngineConfig::default())
    }

    pub fn from_config(store: Arc<dyn OperationStore>, config: &EngineConfig) -> Self {
        Self {
            store,
            conflict_retry_attempts: config.conflict_retry_attempts,
            persist_retry_interval: config.persist_retry_interval,
        }
    }

    pub fn store(&self) -> &Arc<dyn OperationStore> {
        &self.store
    }

    pub fn persist_retry_interval(&self) -> Duration {
        self.persist_retry_interval
    }

    /// Mark the operation succeeded.
    pub async fn succeed(&self, operation: Operation, message: &str) -> StepResult {
        match self
            .transition(operation, OperationState::Succeeded, message)
            .await?
        {
            Persisted::Stored(op) => Ok(StepOutput::done(op)),
            Persisted::Deferred(op) => Ok(StepOutput::requeue(op, self.persist_retry_interval)),
        }
    }

    /// Mark the operation failed and return `OperationFailed`.
    pub async fn fail(
        &self,
        operation: Operation,
        message: &str,
        cause: Option<Error>,
    ) -> StepResult {
        match self
            .transition(operation, OperationState::Failed, message)
            .await?
        {
            Persisted::Stored(op) => Err(Error::OperationFailed {
                operation_id: op.id,
                description: op.description,
                cause: cause.map(Box::new),
            }),
            Persisted::Deferred(op) => Ok(StepOutput::requeue(op, self.persist_retry_interval)),
        }
    }

    /// Mark the operation canceled.
    pub async fn cancel(&self, operation: Operation, message: &str) -> StepResult {
        match self
            .transition(operation, OperationState::Canceled, message)
            .await?
        {
            Persisted::Stored(op) => Ok(StepOutput::done(op)),
            Persisted::Deferred(op) => Ok(StepOutput::requeue(op, self.persist_retry_interval)),
        }
    }

    /// Ask to be run again after `interval`, or fail once the operation has
    /// been retrying for longer than `timeout`.
    ///
    /// A run of retries starts at the first retry after the last [`update`]
    /// (or at `updated_at` when no run is open) and is recorded in the
    /// payload, so a changing description does not restart the clock.
    ///
    /// [`update`]: Transitions::update
    pub async fn retry(
        &self,
        operation: Operation,
        message: &str,
        interval: Duration,
        timeout: Duration,
    ) -> StepResult {
        let since = operation
            .payload
            .retrying_since
            .unwrap_or(operation.updated_at);
        let retrying_for = (operation::now() - since)
            .to_std()
            .unwrap_or(Duration::ZERO);

        if retrying_for > timeout {
            warn!(
                operation_id = %operation.id,
                timeout_secs = timeout.as_secs(),
                "Operation retried for too long, failing"
            );
            let description = format!("{message}: timed out after {}s", timeout.as_secs());
            return self.fail(operation, &description, None).await;
        }

        if operation.description == message && operation.payload.retrying_since.is_some() {
            return Ok(StepOutput::requeue(operation, interval));
        }

        let description = message.to_string();
        let persisted = self
            .persist(operation, move |op| {
                op.description = description.clone();
                if op.payload.retrying_since.is_none() {
                    op.payload.retrying_since = Some(since);
                }
                Ok(())
            })
            .await?;

        match persisted {
            Persisted::Stored(op) | Persisted::Deferred(op) => {
                Ok(StepOutput::requeue(op, interval))
            }
        }
    }

    /// Apply `mutate` to a copy of the operation and persist it, absorbing
    /// optimistic-lock conflicts with concurrent writers.
    ///
    /// Counts as progress: an open run of retries is closed.
    pub async fn update<F>(&self, operation: Operation, mut mutate: F) -> Result<Operation>
    where
        F: FnMut(&mut Operation) + Send,
    {
        with_conflict_retry(
            self.store.as_ref(),
            self.conflict_retry_attempts,
            operation,
            |op| {
                mutate(op);
                op.payload.retrying_since = None;
                Ok(())
            },
        )
        .await
    }

    async fn transition(
        &self,
        operation: Operation,
        state: OperationState,
        message: &str,
    ) -> Result<Persisted> {
        let description = message.to_string();
        self.persist(operation, move |op| {
            op.transition(state)?;
            op.description = description.clone();
            Ok(())
        })
        .await
    }

    async fn persist<F>(&self, operation: Operation, mutate: F) -> Result<Persisted>
    where
        F: FnMut(&mut Operation) -> Result<()> + Send,
    {
        let fallback = operation.clone();
        match with_conflict_retry(
            self.store.as_ref(),
            self.conflict_retry_attempts,
            operation,
            mutate,
        )
        .await
        {
            Ok(stored) => Ok(Persisted::Stored(stored)),
            Err(err) if err.is_temporary() => {
                warn!(
                    operation_id = %fallback.id,
                    retry_after_ms = self.persist_retry_interval.as_millis() as u64,
                    error = %err,
                    "Unable to persist operation, will retry"
                );
                Ok(Persisted::Deferred(fallback))
            }
            Err(err) => Err(err),
        }
    }
}
