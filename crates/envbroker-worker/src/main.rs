// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Envbroker Worker - Environment Provisioning Service
//!
//! A background service responsible for:
//! - Creating runtimes through the cluster provisioner
//! - Installing and binding add-ons through the service broker
//! - Removing both again on deprovisioning
//! - Resuming unfinished operations after a restart

use std::sync::Arc;
use tracing::{info, warn};

use envbroker_core::{PostgresStore, migrations};
use envbroker_worker::clients::{HttpProvisionerClient, HttpServiceBrokerClient};
use envbroker_worker::config::Config;
use envbroker_worker::runtime::WorkerRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "envbroker=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        provisioner_url = %config.provisioner_url,
        addon_broker_url = %config.addon_broker_url,
        add_ons = config.add_ons.len(),
        "Starting Envbroker Worker"
    );

    // Connect to database
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;

    info!("Connected to database");

    migrations::run_postgres(&pool).await?;

    info!("Database schema verified");

    let store = Arc::new(PostgresStore::with_retry_policy(pool, config.engine.store_retry));
    let provisioner = Arc::new(HttpProvisionerClient::new(
        &config.provisioner_url,
        config.http_timeout,
    )?);
    let broker = Arc::new(HttpServiceBrokerClient::new(
        &config.addon_broker_url,
        config.http_timeout,
    )?);

    // Start the runtime
    let runtime = WorkerRuntime::builder()
        .config(&config)
        .store(store)
        .provisioner(provisioner)
        .broker(broker)
        .build()?
        .start()
        .await?;

    info!("Envbroker Worker ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await;

    info!("Envbroker Worker shut down");

    Ok(())
}
