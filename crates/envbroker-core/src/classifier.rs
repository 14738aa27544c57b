// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Temporary/permanent error classification.
//!
//! Every collaborator error that reaches a Step is labelled either
//! [`ErrorKind::Temporary`] (the same call, retried later, may succeed) or
//! [`ErrorKind::Permanent`] (retrying without changing the input will not help).
//! Steps use the label to choose between rescheduling and failing the operation.

use std::error::Error as StdError;
use std::fmt;

/// Classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Retrying later may succeed (timeouts, 5xx, database unreachable).
    Temporary,
    /// Retrying with the same input will not help (4xx, bad configuration).
    Permanent,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Temporary => "temporary",
            ErrorKind::Permanent => "permanent",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that carry a temporary/permanent label.
///
/// Wrapping errors must preserve or re-derive the label of what they wrap.
pub trait Classify {
    /// The classification of this error.
    fn kind(&self) -> ErrorKind;

    /// Whether retrying later may succeed.
    fn is_temporary(&self) -> bool {
        self.kind() == ErrorKind::Temporary
    }
}

/// A message with an explicit classification and an optional cause.
#[derive(Debug, thiserror::Error)]
#[error("{message}{}", cause_suffix(.source))]
pub struct ClassifiedError {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

fn cause_suffix(source: &Option<Box<dyn StdError + Send + Sync + 'static>>) -> String {
    source
        .as_ref()
        .map(|source| format!(": {source}"))
        .unwrap_or_default()
}

impl ClassifiedError {
    /// A retryable error.
    pub fn temporary(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Temporary,
            message: message.into(),
            source: None,
        }
    }

    /// A non-retryable error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            message: message.into(),
            source: None,
        }
    }

    /// Wrap `source` under an explicit classification.
    pub fn wrap(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Wrap `source`, deriving the classification from its source chain.
    pub fn derive(message: impl Into<String>, source: impl StdError + Send + Sync + 'static) -> Self {
        let kind = if is_temporary(&source) {
            ErrorKind::Temporary
        } else {
            ErrorKind::Permanent
        };
        Self::wrap(kind, message, source)
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Classify for ClassifiedError {
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

/// Classify an HTTP status returned by a downstream service.
///
/// 5xx, 408 (request timeout) and 429 (too many requests) are temporary;
/// every other status is permanent.
pub fn classify_http_status(status: u16) -> ErrorKind {
    match status {
        408 | 429 => ErrorKind::Temporary,
        500..=599 => ErrorKind::Temporary,
        _ => ErrorKind::Permanent,
    }
}

/// Classify a sqlx error.
///
/// Only transport and connectivity failures are temporary: I/O, pool
/// exhaustion, a crashed worker and the SQLSTATE classes for connection
/// exceptions (`08`), insufficient resources (`53`), operator intervention
/// (`57P0x`), serialization failure (`40001`) and deadlock (`40P01`).
pub fn classify_sqlx(err: &sqlx::Error) -> ErrorKind {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Tls(_) => ErrorKind::Temporary,
        sqlx::Error::Database(db) => match db.code() {
            Some(code) if is_transient_sqlstate(&code) => ErrorKind::Temporary,
            _ => ErrorKind::Permanent,
        },
        _ => ErrorKind::Permanent,
    }
}

fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08")
        || code.starts_with("53")
        || code.starts_with("57P0")
        || code == "40001"
        || code == "40P01"
}

/// Whether `err` is temporary, looking through its `source()` chain.
///
/// The first classified error found decides. Errors with no classification
/// anywhere in the chain are permanent.
pub fn is_temporary(err: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(kind) = known_kind(e) {
            return kind == ErrorKind::Temporary;
        }
        current = e.source();
    }
    false
}

fn known_kind(err: &(dyn StdError + 'static)) -> Option<ErrorKind> {
    if let Some(e) = err.downcast_ref::<ClassifiedError>() {
        return Some(e.kind());
    }
    if let Some(e) = err.downcast_ref::<crate::error::Error>() {
        return Some(e.kind());
    }
    if let Some(e) = err.downcast_ref::<sqlx::Error>() {
        return Some(classify_sqlx(e));
    }
    if err.downcast_ref::<std::io::Error>().is_some() {
        return Some(ErrorKind::Temporary);
    }
    None
}
