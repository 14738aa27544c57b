// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step-processed events.
//!
//! The step manager publishes one [`StepProcessed`] per executed step. This
//! is the single instrumentation point of the engine: steps only log their
//! own domain messages.

use std::sync::Mutex;
use std::time::Duration;

use tracing::{info, warn};

use crate::operation::Operation;

/// Record of one step execution.
#[derive(Debug, Clone)]
pub struct StepProcessed {
    pub operation_id: String,
    pub step: String,
    /// Operation as the step received it.
    pub old_operation: Operation,
    /// Operation after the step, as persisted.
    pub new_operation: Operation,
    pub duration: Duration,
    pub requeue_after: Duration,
    /// Display form of the error the step returned, if any.
    pub error: Option<String>,
}

/// Receives step-processed events.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &StepProcessed);
}

/// Logs every event as one structured record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: &StepProcessed) {
        let duration_ms = event.duration.as_millis() as u64;
        let requeue_after_ms = event.requeue_after.as_millis() as u64;

        match &event.error {
            Some(error) => warn!(
                operation_id = %event.operation_id,
                step = %event.step,
                old_version = event.old_operation.version,
                version = event.new_operation.version,
                state = %event.new_operation.state,
                duration_ms,
                error = %error,
                "Step processed with error"
            ),
            None => info!(
                operation_id = %event.operation_id,
                step = %event.step,
                old_version = event.old_operation.version,
                version = event.new_operation.version,
                state = %event.new_operation.state,
                duration_ms,
                requeue_after_ms,
                "Step processed"
            ),
        }
    }
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: Mutex<Vec<StepProcessed>>,
}

impl CollectingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events published so far, oldest first.
    pub fn events(&self) -> Vec<StepProcessed> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Step names of all events published so far.
    pub fn step_names(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.step).collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl EventSink for CollectingEventSink {
    fn publish(&self, event: &StepProcessed) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
