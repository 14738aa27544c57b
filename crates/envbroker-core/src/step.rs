// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The unit of work executed by the step manager.
//!
//! A [`Step`] receives the latest persisted [`Operation`] and returns it,
//! possibly modified, together with a requeue delay:
//!
//! | Outcome | Meaning |
//! |---------|---------|
//! | `Ok` with zero delay | Step finished, continue with the next one |
//! | `Ok` with positive delay | Not finished, run the whole pipeline again later |
//! | `Err` | Abort this invocation; the scheduler backs off and retries |
//!
//! Because the pipeline restarts from the first step after every requeue,
//! steps must detect from the payload that their work is already done.
//! Steps never sleep; waiting is always expressed as a requeue delay.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::operation::Operation;

/// What a step hands back to the step manager.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    /// The operation after the step ran.
    pub operation: Operation,
    /// Zero to continue, positive to stop and run again after the delay.
    pub requeue_after: Duration,
}

impl StepOutput {
    /// The step is complete.
    pub fn done(operation: Operation) -> Self {
        Self {
            operation,
            requeue_after: Duration::ZERO,
        }
    }

    /// The step is waiting on something; try again after `delay`.
    pub fn requeue(operation: Operation, delay: Duration) -> Self {
        Self {
            operation,
            requeue_after: delay,
        }
    }

    pub fn is_requeue(&self) -> bool {
        !self.requeue_after.is_zero()
    }
}

/// Result of a single step run.
pub type StepResult = Result<StepOutput>;

/// A named, idempotent piece of an operation's workflow.
///
/// Steps run inside a tracing span carrying the operation ID and step name,
/// so plain `tracing` macros in `run` are already attributed.
#[async_trait]
pub trait Step: Send + Sync {
    /// Stable name used in logs and events.
    fn name(&self) -> &str;

    /// Advance the operation.
    async fn run(&self, operation: Operation) -> StepResult;
}
