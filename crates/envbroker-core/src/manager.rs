// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step manager: runs a pipeline against one operation per call.
//!
//! # Execution
//!
//! 1. Load the operation. Terminal operations return immediately.
//! 2. A pending operation is moved to `in_progress` and persisted.
//! 3. Steps run in pipeline order; steps whose condition is false are skipped.
//! 4. After each step the returned operation is persisted unless the store
//!    already holds it, and a [`StepProcessed`] event is published. A state
//!    the lifecycle does not allow is rejected instead.
//! 5. The call stops on the first error, on a terminal state, or on a
//!    positive requeue delay, which is returned to the caller.
//!
//! The manager holds no per-operation state between calls. Two concurrent
//! calls for the same ID are safe: the store's version check lets only one
//! of them write each version and the other sees `Conflict`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{Instrument, debug, info, info_span};

use crate::error::{Error, Result};
use crate::events::{EventSink, StepProcessed, TracingEventSink};
use crate::operation::{Operation, OperationState};
use crate::persistence::OperationStore;
use crate::pipeline::{Pipeline, PipelineEntry};
use crate::step::StepOutput;

/// Anything that can advance an operation by ID.
///
/// The scheduler calls this and reacts to the result: an error means back
/// off and try again, a positive delay means requeue after it, zero means
/// the operation needs no further work from this executor.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, operation_id: &str) -> Result<Duration>;
}

/// Runs a fixed [`Pipeline`] against operations loaded from a store.
#[derive(Clone)]
pub struct StepManager {
    store: Arc<dyn OperationStore>,
    pipeline: Pipeline,
    events: Arc<dyn EventSink>,
}

impl StepManager {
    pub fn new(store: Arc<dyn OperationStore>, pipeline: Pipeline) -> Self {
        Self {
            store,
            pipeline,
            events: Arc::new(TracingEventSink),
        }
    }

    /// Replace the default tracing sink.
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Advance the operation as far as possible in this call.
    pub async fn execute(&self, operation_id: &str) -> Result<Duration> {
        let mut operation = self.store.get_by_id(operation_id).await?;

        if operation.is_terminal() {
            debug!(
                operation_id,
                state = %operation.state,
                "Operation already finished, nothing to do"
            );
            return Ok(Duration::ZERO);
        }

        if operation.state == OperationState::Pending {
            operation.transition(OperationState::InProgress)?;
            operation.description = "Operation in progress".to_string();
            operation = self.store.update(&operation).await?;
            info!(operation_id, version = operation.version, "Operation started");
        }

        for entry in self.pipeline.entries() {
            if !entry.applies_to(&operation) {
                debug!(operation_id, step = entry.name(), "Skipping step");
                continue;
            }

            let (next, requeue_after) = self.run_step(entry, operation).await?;
            operation = next;

            if operation.is_terminal() {
                info!(
                    operation_id,
                    step = entry.name(),
                    state = %operation.state,
                    "Operation finished"
                );
                return Ok(Duration::ZERO);
            }

            if !requeue_after.is_zero() {
                debug!(
                    operation_id,
                    step = entry.name(),
                    requeue_after_ms = requeue_after.as_millis() as u64,
                    "Step requested requeue"
                );
                return Ok(requeue_after);
            }
        }

        Ok(Duration::ZERO)
    }

    async fn run_step(
        &self,
        entry: &PipelineEntry,
        operation: Operation,
    ) -> Result<(Operation, Duration)> {
        let step = entry.name().to_string();
        let span = info_span!(
            "step",
            operation_id = %operation.id,
            step = %step,
            version = operation.version
        );

        let old = operation.clone();
        let started = Instant::now();
        let result = entry.step().run(operation).instrument(span).await;

        let outcome = match result {
            Ok(output) => self.persist_output(&old, output).await,
            Err(err) => Err(err),
        };
        let duration = started.elapsed();

        match outcome {
            Ok((new, requeue_after)) => {
                self.publish(&step, old, new.clone(), duration, requeue_after, None);
                Ok((new, requeue_after))
            }
            Err(err) => {
                // Report what was actually persisted, not what the step held.
                let new = self
                    .store
                    .get_by_id(&old.id)
                    .await
                    .unwrap_or_else(|_| old.clone());
                self.publish(&step, old, new, duration, Duration::ZERO, Some(&err));
                Err(Error::Step {
                    step,
                    source: Box::new(err),
                })
            }
        }
    }

    /// Write what the step returned unless the store already holds it.
    ///
    /// A step may persist part of its work and keep editing the copy it
    /// returns, so a moved version is checked against the stored row. The
    /// returned state must be reachable from the state the step started in.
    async fn persist_output(
        &self,
        old: &Operation,
        output: StepOutput,
    ) -> Result<(Operation, Duration)> {
        let StepOutput {
            operation,
            requeue_after,
        } = output;

        if operation == *old {
            return Ok((operation, requeue_after));
        }

        if operation.state != old.state && !old.state.can_transition_to(operation.state) {
            return Err(Error::InvalidTransition {
                operation_id: operation.id,
                from: old.state.to_string(),
                to: operation.state.to_string(),
            });
        }

        if operation.version > old.version {
            let persisted = self.store.get_by_id(&operation.id).await?;
            if persisted == operation {
                return Ok((operation, requeue_after));
            }
            debug!(
                operation_id = %operation.id,
                version = operation.version,
                "Step changed the operation after persisting it, writing again"
            );
        }

        let stored = self.store.update(&operation).await?;
        Ok((stored, requeue_after))
    }

    fn publish(
        &self,
        step: &str,
        old: Operation,
        new: Operation,
        duration: Duration,
        requeue_after: Duration,
        error: Option<&Error>,
    ) {
        self.events.publish(&StepProcessed {
            operation_id: old.id.clone(),
            step: step.to_string(),
            old_operation: old,
            new_operation: new,
            duration,
            requeue_after,
            error: error.map(|e| e.to_string()),
        });
    }
}

#[async_trait]
impl Executor for StepManager {
    async fn execute(&self, operation_id: &str) -> Result<Duration> {
        StepManager::execute(self, operation_id).await
    }
}
