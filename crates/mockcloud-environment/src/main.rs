// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! MockCloud Environment - mock cloud environment server
//!
//! Serves:
//! - the cloud API gateway (EC2/VPC, SQS, DynamoDB, Lambda)
//! - the control API (environments, DNS records, sandbox, credits)
//! - authoritative DNS for running environments
//!
//! and runs the auto-shutdown and billing reconciliation workers.

use std::sync::Arc;

use mockcloud_core::{Persistence, PostgresPersistence, SqlitePersistence};
use mockcloud_environment::auth::StaticTokenIdentity;
use mockcloud_environment::cloud_network::{CloudNetwork, MockCloudNetwork, OciNetworkClient};
use mockcloud_environment::config::Config;
use mockcloud_environment::runner::DockerRuntime;
use mockcloud_environment::runtime::EnvironmentRuntime;
use mockcloud_environment::sandbox::SandboxConfig;
use mockcloud_environment::shutdown_worker::ShutdownWorkerConfig;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::{info, warn};

async fn connect(config: &Config) -> anyhow::Result<Arc<dyn Persistence>> {
    if !config.is_sqlite() {
        let persistence = PostgresPersistence::connect(&config.database_url, 10).await?;
        return Ok(Arc::new(persistence));
    }

    let path = config
        .database_url
        .trim_start_matches("sqlite:")
        .trim_start_matches("//");
    if path == ":memory:" {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        mockcloud_core::migrations::run_sqlite(&pool).await?;
        return Ok(Arc::new(SqlitePersistence::new(pool)));
    }
    let path = path.split('?').next().unwrap_or(path);
    Ok(Arc::new(SqlitePersistence::from_path(path).await?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let dotenv = dotenvy::dotenv();

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "mockcloud_environment=info,mockcloud_core=info".into());
    let json_logs = std::env::var("MOCKCLOUD_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    if let Err(e) = dotenv {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        http_addr = %config.http_addr,
        dns_addr = %config.dns_addr,
        gateway_domain = %config.gateway_domain,
        data_dir = %config.data_dir.display(),
        "Starting MockCloud Environment"
    );

    // Connect to database
    let persistence = connect(&config).await?;
    info!(sqlite = config.is_sqlite(), "Connected to database");

    // Container engine
    let container_runtime = Arc::new(DockerRuntime::connect(config.docker_host.as_deref())?);

    // Cloud network
    let network: Arc<dyn CloudNetwork> = match &config.oci {
        Some(oci) => {
            info!(endpoint = %oci.endpoint, "Using OCI cloud network");
            Arc::new(OciNetworkClient::new(oci))
        }
        None => {
            warn!("OCI_ENDPOINT/OCI_COMPARTMENT_ID not set; using mock cloud network");
            Arc::new(MockCloudNetwork::new())
        }
    };

    // Identity
    let identity = StaticTokenIdentity::parse(&config.api_tokens);
    if identity.is_empty() {
        warn!("MOCKCLOUD_API_TOKENS is empty; control API will reject every bearer token");
    }

    // Start the runtime
    let runtime = EnvironmentRuntime::builder()
        .persistence(persistence)
        .container_runtime(container_runtime)
        .network(network)
        .identity(Arc::new(identity))
        .http_addr(config.http_addr)
        .dns_addr(config.dns_addr)
        .data_dir(&config.data_dir)
        .port_range(config.port_range.0, config.port_range.1)
        .gateway_domain(&config.gateway_domain)
        .backing_host(&config.backing_host)
        .sandbox_config(SandboxConfig {
            timeout: config.sandbox_timeout,
            memory_mb: config.sandbox_memory_mb,
            cpu_quota: config.sandbox_cpu_quota,
            ..Default::default()
        })
        .shutdown_config(ShutdownWorkerConfig {
            poll_interval: config.shutdown_poll_interval,
        })
        .build()?
        .start()
        .await?;

    info!(
        http_addr = %runtime.http_addr(),
        dns_addr = ?runtime.dns_addr(),
        "Environment server ready"
    );

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("MockCloud Environment shut down");

    Ok(())
}
