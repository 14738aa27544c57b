// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for envbroker-worker.

use thiserror::Error;

/// Worker errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] envbroker_core::ConfigError),

    /// Database connection or pool setup failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Applying migrations failed.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// The operation engine reported an error.
    #[error("Engine error: {0}")]
    Engine(#[from] envbroker_core::Error),

    /// A downstream client could not be set up.
    #[error("Client error: {0}")]
    Client(#[from] crate::clients::ClientError),

    /// A required runtime component was not provided to the builder.
    #[error("'{0}' is required")]
    MissingComponent(&'static str),

    /// The operation type has no queue in this worker.
    #[error("No queue handles '{0}' operations")]
    UnsupportedOperation(envbroker_core::OperationType),
}

/// Result type using the worker [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
