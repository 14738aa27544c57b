// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for envbroker-worker.

use std::time::Duration;

use envbroker_core::EngineConfig;
use envbroker_core::config::{ConfigError, env_or, env_required};

use crate::catalog::{AddOn, default_catalog};

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Connection pool size
    pub database_max_connections: u32,
    /// Concurrent provisioning workers
    pub provisioning_workers: usize,
    /// Concurrent deprovisioning workers
    pub deprovisioning_workers: usize,
    /// Requeue delay after an execution error
    pub error_backoff: Duration,
    /// Cluster provisioner base URL
    pub provisioner_url: String,
    /// Add-on service broker base URL
    pub addon_broker_url: String,
    /// Timeout for a single downstream request
    pub http_timeout: Duration,
    /// How long a step may keep retrying temporary failures
    pub operation_timeout: Duration,
    /// Add-ons installed into new environments
    pub add_ons: Vec<AddOn>,
    /// Engine tuning
    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `ENVBROKER_DATABASE_URL`
    /// - `ENVBROKER_PROVISIONER_URL`
    /// - `ENVBROKER_ADDON_BROKER_URL`
    ///
    /// Optional (with defaults):
    /// - `ENVBROKER_DATABASE_MAX_CONNECTIONS` (10)
    /// - `ENVBROKER_PROVISIONING_WORKERS` (20)
    /// - `ENVBROKER_DEPROVISIONING_WORKERS` (20)
    /// - `ENVBROKER_ERROR_BACKOFF_MS` (5000)
    /// - `ENVBROKER_HTTP_TIMEOUT_MS` (30000)
    /// - `ENVBROKER_OPERATION_TIMEOUT_MIN` (60)
    /// - `ENVBROKER_ADDONS`: JSON array of add-ons (built-in catalog)
    /// - the engine variables read by [`EngineConfig::from_env`]
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env_required("ENVBROKER_DATABASE_URL")?;
        let provisioner_url = env_required("ENVBROKER_PROVISIONER_URL")?;
        let addon_broker_url = env_required("ENVBROKER_ADDON_BROKER_URL")?;

        let database_max_connections: u32 = env_or(
            "ENVBROKER_DATABASE_MAX_CONNECTIONS",
            10,
            "must be a positive integer",
        )?;
        let provisioning_workers = positive(
            "ENVBROKER_PROVISIONING_WORKERS",
            env_or("ENVBROKER_PROVISIONING_WORKERS", 20, "must be a positive integer")?,
        )?;
        let deprovisioning_workers = positive(
            "ENVBROKER_DEPROVISIONING_WORKERS",
            env_or("ENVBROKER_DEPROVISIONING_WORKERS", 20, "must be a positive integer")?,
        )?;
        let error_backoff_ms: u64 = env_or(
            "ENVBROKER_ERROR_BACKOFF_MS",
            5000,
            "must be a non-negative integer",
        )?;
        let http_timeout_ms: u64 = env_or(
            "ENVBROKER_HTTP_TIMEOUT_MS",
            30_000,
            "must be a non-negative integer",
        )?;
        let operation_timeout_min: u64 = env_or(
            "ENVBROKER_OPERATION_TIMEOUT_MIN",
            60,
            "must be a non-negative integer",
        )?;

        let add_ons = match std::env::var("ENVBROKER_ADDONS") {
            Ok(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw).map_err(|_| {
                ConfigError::Invalid("ENVBROKER_ADDONS", "must be a JSON array of add-ons")
            })?,
            _ => default_catalog(),
        };

        Ok(Self {
            database_url,
            database_max_connections: database_max_connections.max(1),
            provisioning_workers,
            deprovisioning_workers,
            error_backoff: Duration::from_millis(error_backoff_ms),
            provisioner_url,
            addon_broker_url,
            http_timeout: Duration::from_millis(http_timeout_ms),
            operation_timeout: Duration::from_secs(operation_timeout_min * 60),
            add_ons,
            engine: EngineConfig::from_env()?,
        })
    }
}

fn positive(key: &'static str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(key, "must be a positive integer"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

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

        fn minimal(&mut self) {
            for key in [
                "ENVBROKER_DATABASE_MAX_CONNECTIONS",
                "ENVBROKER_PROVISIONING_WORKERS",
                "ENVBROKER_DEPROVISIONING_WORKERS",
                "ENVBROKER_ERROR_BACKOFF_MS",
                "ENVBROKER_HTTP_TIMEOUT_MS",
                "ENVBROKER_OPERATION_TIMEOUT_MIN",
                "ENVBROKER_ADDONS",
                "ENVBROKER_STORE_RETRY_INTERVAL_MS",
                "ENVBROKER_STORE_RETRY_ATTEMPTS",
                "ENVBROKER_CONFLICT_RETRY_ATTEMPTS",
                "ENVBROKER_PERSIST_RETRY_INTERVAL_MS",
            ] {
                self.remove(key);
            }
            self.set("ENVBROKER_DATABASE_URL", "postgres://localhost/envbroker");
            self.set("ENVBROKER_PROVISIONER_URL", "http://provisioner:8080");
            self.set("ENVBROKER_ADDON_BROKER_URL", "http://broker:8080");
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
    fn test_config_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.minimal();

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "postgres://localhost/envbroker");
        assert_eq!(config.database_max_connections, 10);
        assert_eq!(config.provisioning_workers, 20);
        assert_eq!(config.deprovisioning_workers, 20);
        assert_eq!(config.error_backoff, Duration::from_secs(5));
        assert_eq!(config.http_timeout, Duration::from_secs(30));
        assert_eq!(config.operation_timeout, Duration::from_secs(3600));
        assert_eq!(config.add_ons, default_catalog());
        assert_eq!(config.engine, EngineConfig::default());
    }

    #[test]
    fn test_config_custom_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.minimal();
        guard.set("ENVBROKER_PROVISIONING_WORKERS", "4");
        guard.set("ENVBROKER_ERROR_BACKOFF_MS", "250");
        guard.set("ENVBROKER_OPERATION_TIMEOUT_MIN", "5");
        guard.set(
            "ENVBROKER_ADDONS",
            r#"[{"name": "eventing", "service_id": "ev", "plan_id": "std", "plans": ["aws"]}]"#,
        );

        let config = Config::from_env().unwrap();

        assert_eq!(config.provisioning_workers, 4);
        assert_eq!(config.error_backoff, Duration::from_millis(250));
        assert_eq!(config.operation_timeout, Duration::from_secs(300));
        assert_eq!(config.add_ons.len(), 1);
        assert_eq!(config.add_ons[0].plans, vec!["aws"]);
    }

    #[test]
    fn test_config_missing_required() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.minimal();
        guard.remove("ENVBROKER_PROVISIONER_URL");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("ENVBROKER_PROVISIONER_URL")));
    }

    #[test]
    fn test_config_rejects_zero_workers() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.minimal();
        guard.set("ENVBROKER_DEPROVISIONING_WORKERS", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("ENVBROKER_DEPROVISIONING_WORKERS", _)
        ));
    }

    #[test]
    fn test_config_rejects_malformed_catalog() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.minimal();
        guard.set("ENVBROKER_ADDONS", "{not json");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("ENVBROKER_ADDONS", _)));
    }
}
