// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Envbroker Worker - Environment Provisioning Service
//!
//! This crate runs provisioning and deprovisioning operations for managed
//! Kubernetes environments on top of the `envbroker-core` engine.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                       envbroker-worker (This Crate)                    │
//! │                                                                        │
//! │  ┌──────────────────┐                    ┌──────────────────────┐      │
//! │  │ provisioning     │  execute(id)       │ StepManager          │      │
//! │  │ OperationQueue   │───────────────────▶│ (provisioning steps) │      │
//! │  └──────────────────┘   ◀── delay ───    └──────────┬───────────┘      │
//! │  ┌──────────────────┐                    ┌──────────┴───────────┐      │
//! │  │ deprovisioning   │───────────────────▶│ StepManager          │      │
//! │  │ OperationQueue   │                    │ (deprovision steps)  │      │
//! │  └──────────────────┘                    └──────────┬───────────┘      │
//! └─────────────────────────────────────────────────────┼──────────────────┘
//!                                                       │
//!            ┌──────────────────────┬───────────────────┼─────────────────┐
//!            ▼                      ▼                   ▼                 │
//! ┌────────────────────┐ ┌────────────────────┐ ┌──────────────────┐      │
//! │ Cluster provisioner│ │ Add-on broker (OSB)│ │   PostgreSQL     │      │
//! │ /runtimes          │ │ /v2/service_...    │ │   (operations)   │      │
//! └────────────────────┘ └────────────────────┘ └──────────────────┘      │
//! ```
//!
//! # Provisioning
//!
//! | Weight | Step |
//! |--------|------|
//! | 0 | Cancel if deprovisioning was requested, assign runtime ID |
//! | 1 | Request the runtime |
//! | 2 | Wait for the runtime |
//! | 3 | Provision each add-on that applies to the plan |
//! | 4 | Bind each add-on |
//! | 10 | Mark succeeded |
//!
//! # Deprovisioning
//!
//! | Weight | Step |
//! |--------|------|
//! | 0 | Load runtime and add-on progress from the last provisioning |
//! | 1 | Unbind and deprovision add-ons |
//! | 2 | Request runtime removal |
//! | 3 | Wait for removal |
//! | 10 | Mark succeeded |
//!
//! # Queue Policy
//!
//! | Execution result | Action |
//! |------------------|--------|
//! | Error | Log, requeue after `ENVBROKER_ERROR_BACKOFF_MS` |
//! | Positive delay | Requeue after the delay |
//! | Zero | Drop |
//!
//! # Configuration
//!
//! See [`config::Config::from_env`] for the environment variables.

/// Add-on catalog.
pub mod catalog;

/// Cluster provisioner and add-on broker clients (HTTP and in-memory).
pub mod clients;

/// Worker configuration loaded from environment variables.
pub mod config;

/// Error types for worker operations.
pub mod error;

/// Deduplicating operation queue and worker pool.
pub mod queue;

/// Embeddable worker runtime.
pub mod runtime;

/// Provisioning and deprovisioning steps.
pub mod steps;

pub use config::Config;
pub use error::Error;
pub use queue::OperationQueue;
pub use runtime::WorkerRuntime;
