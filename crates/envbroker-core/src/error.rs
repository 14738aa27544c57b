// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for envbroker-core.

use thiserror::Error as ThisError;

use crate::classifier::{ClassifiedError, Classify, ErrorKind, classify_sqlx};

/// Result type using the engine [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the store, the transition helper and the step manager.
#[derive(Debug, ThisError)]
#[non_exhaustive]
pub enum Error {
    /// Operation row is absent.
    #[error("Operation '{operation_id}' not found")]
    NotFound {
        /// The operation ID that was looked up.
        operation_id: String,
    },

    /// Duplicate insert.
    #[error("Operation '{operation_id}' already exists")]
    AlreadyExists {
        /// The duplicated operation ID.
        operation_id: String,
    },

    /// Optimistic-lock loss: the row moved on since it was read.
    #[error(
        "Operation '{operation_id}' was modified concurrently: expected version {expected}, found {actual}"
    )]
    Conflict {
        /// The operation ID.
        operation_id: String,
        /// Version the writer based its update on.
        expected: i64,
        /// Version currently stored.
        actual: i64,
    },

    /// The stored operation is already succeeded, failed or canceled.
    #[error("Operation '{operation_id}' is already in terminal state '{state}'")]
    TerminalState {
        /// The operation ID.
        operation_id: String,
        /// The terminal state found.
        state: String,
    },

    /// A state change that goes backwards in the lifecycle.
    #[error("Operation '{operation_id}' cannot move from '{from}' to '{to}'")]
    InvalidTransition {
        /// The operation ID.
        operation_id: String,
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    Database {
        /// The store call that failed.
        operation: String,
        /// Error details.
        details: String,
        /// Whether the failure was a transport/connectivity problem.
        temporary: bool,
    },

    /// Payload or parameters could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A classified collaborator error.
    #[error(transparent)]
    Classified(#[from] ClassifiedError),

    /// The operation was marked failed by a step.
    #[error("Operation '{operation_id}' failed: {description}")]
    OperationFailed {
        /// The operation ID.
        operation_id: String,
        /// The description stored on the failed operation.
        description: String,
        /// What caused the failure, if anything.
        #[source]
        cause: Option<Box<Error>>,
    },

    /// A step returned an error.
    #[error("Step '{step}' failed: {source}")]
    Step {
        /// Name of the step.
        step: String,
        /// The error the step returned.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "OPERATION_NOT_FOUND",
            Self::AlreadyExists { .. } => "OPERATION_ALREADY_EXISTS",
            Self::Conflict { .. } => "VERSION_CONFLICT",
            Self::TerminalState { .. } => "TERMINAL_STATE",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Classified(_) => "CLASSIFIED_ERROR",
            Self::OperationFailed { .. } => "OPERATION_FAILED",
            Self::Step { .. } => "STEP_FAILED",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Shorthand for a temporary classified error.
    pub fn temporary(message: impl Into<String>) -> Self {
        Self::Classified(ClassifiedError::temporary(message))
    }

    /// Shorthand for a permanent classified error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Classified(ClassifiedError::permanent(message))
    }

    /// Record a sqlx failure for `operation`, keeping its classification.
    pub fn database(operation: &str, err: sqlx::Error) -> Self {
        Self::Database {
            operation: operation.to_string(),
            details: err.to_string(),
            temporary: classify_sqlx(&err) == ErrorKind::Temporary,
        }
    }
}

impl Classify for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            // A lost optimistic-lock race is retried by reloading.
            Self::Conflict { .. } => ErrorKind::Temporary,
            Self::Database { temporary, .. } => {
                if *temporary {
                    ErrorKind::Temporary
                } else {
                    ErrorKind::Permanent
                }
            }
            Self::Classified(e) => e.kind(),
            Self::Step { source, .. } => source.kind(),
            Self::NotFound { .. }
            | Self::AlreadyExists { .. }
            | Self::TerminalState { .. }
            | Self::InvalidTransition { .. }
            | Self::Serialization(_)
            | Self::OperationFailed { .. } => ErrorKind::Permanent,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::database("query", err)
    }
}
