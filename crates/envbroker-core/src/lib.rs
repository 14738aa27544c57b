// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Envbroker Core - Operation Execution Engine
//!
//! This crate drives long-running provisioning workflows to completion.
//! Every workflow instance is a persisted [`Operation`]; its work is split
//! into idempotent [`Step`]s arranged in a weighted [`Pipeline`], and the
//! [`StepManager`] advances one operation per call.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        envbroker-worker                                  │
//! │              (operation queues, downstream clients, steps)               │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ execute(operation_id) → delay
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  StepManager ──▶ Pipeline ──▶ Step ──▶ Transitions                       │
//! │       │                                    │                             │
//! │       └──── StepProcessed ──▶ EventSink    │                             │
//! └────────────────────────────────────────────┼────────────────────────────┘
//!                                              ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │            OperationStore (PostgreSQL / SQLite, version CAS)             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Resumption
//!
//! Nothing in the engine blocks. A step that has to wait for a downstream
//! system returns a requeue delay; the scheduler calls `execute` again after
//! that delay and the pipeline restarts from its first step. Steps skip work
//! the payload says is already done.
//!
//! # Concurrency
//!
//! The operation row is the only shared state. Every write is
//! `UPDATE ... WHERE id = ? AND version = ?`, so of two writers starting from
//! the same version exactly one wins and the other gets
//! [`Error::Conflict`]. [`Transitions::update`] absorbs such conflicts by
//! reloading and re-applying the mutation a bounded number of times.
//!
//! # Errors
//!
//! Collaborator errors are classified as temporary or permanent (see
//! [`classifier`]). Steps turn temporary failures into
//! [`Transitions::retry`] and permanent ones into [`Transitions::fail`]; the
//! manager itself never retries.

/// Temporary/permanent error taxonomy.
pub mod classifier;

/// Engine configuration loaded from environment variables.
pub mod config;

/// Error types with stable error codes.
pub mod error;

/// Step-processed events and sinks.
pub mod events;

/// Step manager and the executor seam used by schedulers.
pub mod manager;

/// Embedded database migrations.
pub mod migrations;

/// Operation model and lifecycle.
pub mod operation;

/// Operation store trait and backends.
pub mod persistence;

/// Pipeline definitions.
pub mod pipeline;

/// The step contract.
pub mod step;

/// Transition helper for steps.
pub mod transition;

pub use classifier::{ClassifiedError, Classify, ErrorKind};
pub use config::{ConfigError, EngineConfig};
pub use error::{Error, Result};
pub use events::{CollectingEventSink, EventSink, StepProcessed, TracingEventSink};
pub use manager::{Executor, StepManager};
pub use operation::{Operation, OperationPayload, OperationState, OperationType};
pub use persistence::{OperationStore, PostgresStore, RetryPolicy, SqliteStore};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use step::{Step, StepOutput, StepResult};
pub use transition::{Transitions, with_conflict_retry};
