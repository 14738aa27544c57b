// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded fixed-interval retry for store calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};

/// How store calls retry transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause between attempts.
    pub interval: Duration,
    /// Total attempts, including the first one.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            interval: Duration::ZERO,
            max_attempts: 1,
        }
    }
}

/// Only connectivity failures are retried; `NotFound`, `Conflict`,
/// `AlreadyExists` and friends go straight back to the caller.
fn is_retryable(err: &Error) -> bool {
    matches!(
        err,
        Error::Database {
            temporary: true,
            ..
        }
    )
}

/// Run `call` until it succeeds, fails with a non-retryable error, or
/// `policy.max_attempts` is exhausted.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if is_retryable(&err) && attempt < max_attempts => {
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    error = %err,
                    "Store call failed, retrying"
                );
                tokio::time::sleep(policy.interval).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
