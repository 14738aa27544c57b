// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::persistence::RetryPolicy;

/// Engine tuning shared by the store, the transition helper and the step manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Fixed-interval retry for store calls.
    pub store_retry: RetryPolicy,
    /// How often the transition helper re-applies a mutation after a conflict.
    pub conflict_retry_attempts: u32,
    /// Requeue delay when a transition cannot be persisted for a temporary reason.
    pub persist_retry_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_retry: RetryPolicy::default(),
            conflict_retry_attempts: 3,
            persist_retry_interval: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `ENVBROKER_STORE_RETRY_INTERVAL_MS`: pause between store attempts (default: 1000)
    /// - `ENVBROKER_STORE_RETRY_ATTEMPTS`: attempts per store call (default: 5)
    /// - `ENVBROKER_CONFLICT_RETRY_ATTEMPTS`: conflict re-applies (default: 3)
    /// - `ENVBROKER_PERSIST_RETRY_INTERVAL_MS`: requeue after a failed persist (default: 60000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let interval_ms: u64 = env_or(
            "ENVBROKER_STORE_RETRY_INTERVAL_MS",
            1000,
            "must be a non-negative integer",
        )?;
        let attempts: u32 = env_or(
            "ENVBROKER_STORE_RETRY_ATTEMPTS",
            5,
            "must be a positive integer",
        )?;
        if attempts == 0 {
            return Err(ConfigError::Invalid(
                "ENVBROKER_STORE_RETRY_ATTEMPTS",
                "must be a positive integer",
            ));
        }
        let conflict_retry_attempts: u32 = env_or(
            "ENVBROKER_CONFLICT_RETRY_ATTEMPTS",
            3,
            "must be a positive integer",
        )?;
        if conflict_retry_attempts == 0 {
            return Err(ConfigError::Invalid(
                "ENVBROKER_CONFLICT_RETRY_ATTEMPTS",
                "must be a positive integer",
            ));
        }
        let persist_ms: u64 = env_or(
            "ENVBROKER_PERSIST_RETRY_INTERVAL_MS",
            60_000,
            "must be a non-negative integer",
        )?;

        Ok(Self {
            store_retry: RetryPolicy {
                interval: Duration::from_millis(interval_ms),
                max_attempts: attempts,
            },
            conflict_retry_attempts,
            persist_retry_interval: Duration::from_millis(persist_ms),
        })
    }
}

/// Read `key` and parse it, falling back to `default` when unset.
pub fn env_or<T: FromStr>(
    key: &'static str,
    default: T,
    expected: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(key, expected)),
        Err(_) => Ok(default),
    }
}

/// Read a required variable.
pub fn env_required(key: &'static str) -> Result<String, ConfigError> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(key))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Serializes tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Sets env vars for a test and restores them on drop
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }

        fn clear_engine(&mut self) {
            for key in [
                "ENVBROKER_STORE_RETRY_INTERVAL_MS",
                "ENVBROKER_STORE_RETRY_ATTEMPTS",
                "ENVBROKER_CONFLICT_RETRY_ATTEMPTS",
                "ENVBROKER_PERSIST_RETRY_INTERVAL_MS",
            ] {
                self.remove(key);
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_engine_config_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.clear_engine();

        let config = EngineConfig::from_env().unwrap();

        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.store_retry.interval, Duration::from_secs(1));
        assert_eq!(config.store_retry.max_attempts, 5);
        assert_eq!(config.conflict_retry_attempts, 3);
        assert_eq!(config.persist_retry_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_engine_config_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("ENVBROKER_STORE_RETRY_INTERVAL_MS", "250");
        guard.set("ENVBROKER_STORE_RETRY_ATTEMPTS", "2");
        guard.set("ENVBROKER_CONFLICT_RETRY_ATTEMPTS", "7");
        guard.set("ENVBROKER_PERSIST_RETRY_INTERVAL_MS", "1500");

        let config = EngineConfig::from_env().unwrap();

        assert_eq!(config.store_retry.interval, Duration::from_millis(250));
        assert_eq!(config.store_retry.max_attempts, 2);
        assert_eq!(config.conflict_retry_attempts, 7);
        assert_eq!(config.persist_retry_interval, Duration::from_millis(1500));
    }

    #[test]
    fn test_engine_config_invalid_number() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.clear_engine();
        guard.set("ENVBROKER_STORE_RETRY_ATTEMPTS", "many");

        let err = EngineConfig::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("ENVBROKER_STORE_RETRY_ATTEMPTS", _)
        ));
    }

    #[test]
    fn test_engine_config_zero_conflict_attempts() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.clear_engine();
        guard.set("ENVBROKER_CONFLICT_RETRY_ATTEMPTS", "0");

        let err = EngineConfig::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("ENVBROKER_CONFLICT_RETRY_ATTEMPTS", _)
        ));
    }

    #[test]
    fn test_env_required() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("ENVBROKER_TEST_REQUIRED", "value");
        guard.set("ENVBROKER_TEST_BLANK", "  ");
        guard.remove("ENVBROKER_TEST_ABSENT");

        assert_eq!(env_required("ENVBROKER_TEST_REQUIRED").unwrap(), "value");
        assert!(matches!(
            env_required("ENVBROKER_TEST_BLANK"),
            Err(ConfigError::Missing("ENVBROKER_TEST_BLANK"))
        ));
        assert!(matches!(
            env_required("ENVBROKER_TEST_ABSENT"),
            Err(ConfigError::Missing("ENVBROKER_TEST_ABSENT"))
        ));
    }

    #[test]
    fn test_config_error_display() {
        let missing = ConfigError::Missing("MY_VAR");
        assert_eq!(
            missing.to_string(),
            "missing required environment variable: MY_VAR"
        );

        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }
}
