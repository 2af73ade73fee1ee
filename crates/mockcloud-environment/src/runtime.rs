// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for mockcloud-environment.
//!
//! [`EnvironmentRuntime`] wires the adapters into the provisioner, the
//! emulators and the sandbox, then runs the HTTP server, the DNS responder
//! and the background workers inside an existing tokio application.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use mockcloud_core::SqlitePersistence;
//! use mockcloud_environment::cloud_network::MockCloudNetwork;
//! use mockcloud_environment::runner::DockerRuntime;
//! use mockcloud_environment::runtime::EnvironmentRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::from_path(".data/mockcloud.db").await?);
//!
//!     let runtime = EnvironmentRuntime::builder()
//!         .persistence(persistence)
//!         .container_runtime(Arc::new(DockerRuntime::connect(None)?))
//!         .network(Arc::new(MockCloudNetwork::new()))
//!         .http_addr("0.0.0.0:8080".parse()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use mockcloud_core::Persistence;
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::auth::{IdentityProvider, StaticTokenIdentity};
use crate::billing::BillingEngine;
use crate::billing_worker::{BillingWorker, BillingWorkerConfig};
use crate::cloud_network::CloudNetwork;
use crate::dns_server::{DnsResponder, DnsServer};
use crate::emulators::{
    DynamoEmulator, EmulatorContext, HttpLambdaTransport, LambdaEmulator, LambdaTransport,
    S3Emulator, SqsEmulator, VpcEmulator,
};
use crate::gateway::{self, GatewayState};
use crate::materializer::Materializer;
use crate::port_allocator::{PortAllocator, PortAllocatorConfig};
use crate::provisioner::{Provisioner, ProvisionerConfig};
use crate::runner::ContainerRuntime;
use crate::sandbox::{Sandbox, SandboxConfig};
use crate::shutdown_worker::{ShutdownWorker, ShutdownWorkerConfig};

/// Builder for creating an [`EnvironmentRuntime`].
pub struct EnvironmentRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    container_runtime: Option<Arc<dyn ContainerRuntime>>,
    network: Option<Arc<dyn CloudNetwork>>,
    identity: Option<Arc<dyn IdentityProvider>>,
    lambda_transport: Option<Arc<dyn LambdaTransport>>,
    http_addr: SocketAddr,
    dns_addr: Option<SocketAddr>,
    data_dir: PathBuf,
    port_range: (i32, i32),
    provisioner_config: ProvisionerConfig,
    sandbox_config: SandboxConfig,
    shutdown_config: ShutdownWorkerConfig,
    billing_config: BillingWorkerConfig,
}

impl Default for EnvironmentRuntimeBuilder {
    fn default() -> Self {
        let ports = PortAllocatorConfig::default();
        Self {
            persistence: None,
            container_runtime: None,
            network: None,
            identity: None,
            lambda_transport: None,
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            dns_addr: None,
            data_dir: PathBuf::from(".data"),
            port_range: (ports.lo, ports.hi),
            provisioner_config: ProvisionerConfig::default(),
            sandbox_config: SandboxConfig::default(),
            shutdown_config: ShutdownWorkerConfig::from_env(),
            billing_config: BillingWorkerConfig::from_env(),
        }
    }
}

impl EnvironmentRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the container engine (required).
    pub fn container_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.container_runtime = Some(runtime);
        self
    }

    /// Set the cloud network adapter (required).
    pub fn network(mut self, network: Arc<dyn CloudNetwork>) -> Self {
        self.network = Some(network);
        self
    }

    /// Set the identity provider. Without one every bearer token is rejected.
    pub fn identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Set the transport used to reach function containers.
    pub fn lambda_transport(mut self, transport: Arc<dyn LambdaTransport>) -> Self {
        self.lambda_transport = Some(transport);
        self
    }

    pub fn http_addr(mut self, addr: SocketAddr) -> Self {
        self.http_addr = addr;
        self
    }

    /// Serve DNS on `addr`. DNS is disabled unless set.
    pub fn dns_addr(mut self, addr: SocketAddr) -> Self {
        self.dns_addr = Some(addr);
        self
    }

    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    /// Inclusive host port range for backing containers.
    pub fn port_range(mut self, lo: i32, hi: i32) -> Self {
        self.port_range = (lo, hi);
        self
    }

    pub fn gateway_domain(mut self, domain: impl Into<String>) -> Self {
        self.provisioner_config.gateway_domain = domain.into();
        self
    }

    pub fn backing_host(mut self, host: impl Into<String>) -> Self {
        self.provisioner_config.backing_host = host.into();
        self
    }

    pub fn provisioner_config(mut self, config: ProvisionerConfig) -> Self {
        self.provisioner_config = config;
        self
    }

    pub fn sandbox_config(mut self, config: SandboxConfig) -> Self {
        self.sandbox_config = config;
        self
    }

    pub fn shutdown_config(mut self, config: ShutdownWorkerConfig) -> Self {
        self.shutdown_config = config;
        self
    }

    pub fn billing_config(mut self, config: BillingWorkerConfig) -> Self {
        self.billing_config = config;
        self
    }

    /// Build the runtime configuration.
    pub fn build(self) -> Result<EnvironmentRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let container_runtime = self
            .container_runtime
            .ok_or_else(|| anyhow::anyhow!("container_runtime is required"))?;
        let network = self
            .network
            .ok_or_else(|| anyhow::anyhow!("network is required"))?;
        let (lo, hi) = self.port_range;
        if lo <= 0 || lo > hi || hi > i32::from(u16::MAX) {
            anyhow::bail!("invalid port range {lo}-{hi}");
        }

        Ok(EnvironmentRuntimeConfig {
            persistence,
            container_runtime,
            network,
            identity: self
                .identity
                .unwrap_or_else(|| Arc::new(StaticTokenIdentity::default())),
            lambda_transport: self
                .lambda_transport
                .unwrap_or_else(|| Arc::new(HttpLambdaTransport::new())),
            http_addr: self.http_addr,
            dns_addr: self.dns_addr,
            data_dir: self.data_dir,
            port_range: self.port_range,
            provisioner_config: self.provisioner_config,
            sandbox_config: self.sandbox_config,
            shutdown_config: self.shutdown_config,
            billing_config: self.billing_config,
        })
    }
}

/// Validated runtime configuration, ready to start.
pub struct EnvironmentRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    container_runtime: Arc<dyn ContainerRuntime>,
    network: Arc<dyn CloudNetwork>,
    identity: Arc<dyn IdentityProvider>,
    lambda_transport: Arc<dyn LambdaTransport>,
    http_addr: SocketAddr,
    dns_addr: Option<SocketAddr>,
    data_dir: PathBuf,
    port_range: (i32, i32),
    provisioner_config: ProvisionerConfig,
    sandbox_config: SandboxConfig,
    shutdown_config: ShutdownWorkerConfig,
    billing_config: BillingWorkerConfig,
}

impl EnvironmentRuntimeConfig {
    /// Wire the adapters into the services behind the HTTP surface.
    pub fn gateway_state(&self) -> GatewayState {
        let persistence = self.persistence.clone();
        let billing = BillingEngine::new(persistence.clone());
        let ports = PortAllocator::new(
            persistence.clone(),
            PortAllocatorConfig {
                lo: self.port_range.0,
                hi: self.port_range.1,
                ..Default::default()
            },
        );
        let provisioner = Provisioner::new(
            persistence.clone(),
            self.container_runtime.clone(),
            self.network.clone(),
            ports,
            billing.clone(),
            self.provisioner_config.clone(),
        );
        let materializer = Materializer::new(
            provisioner.clone(),
            persistence.clone(),
            self.data_dir.clone(),
        );
        let ctx = EmulatorContext::new(persistence.clone(), billing.clone(), materializer);
        let sandbox = Sandbox::new(
            persistence.clone(),
            self.container_runtime.clone(),
            self.sandbox_config.clone(),
        );

        GatewayState {
            persistence,
            provisioner,
            billing,
            sandbox,
            vpc: VpcEmulator::new(ctx.clone()),
            sqs: SqsEmulator::new(ctx.clone()),
            s3: S3Emulator::new(ctx.clone()),
            dynamodb: DynamoEmulator::new(ctx.clone()),
            lambda: LambdaEmulator::new(ctx, self.lambda_transport.clone()),
            identity: self.identity.clone(),
        }
    }

    /// Start the HTTP server, the DNS responder and the background workers.
    pub async fn start(self) -> Result<EnvironmentRuntime> {
        let state = self.gateway_state();

        // Shutdown worker
        let shutdown_worker = ShutdownWorker::new(
            self.persistence.clone(),
            state.provisioner.clone(),
            self.shutdown_config.clone(),
        );
        let idle_shutdown = shutdown_worker.shutdown_handle();
        let idle_handle = tokio::spawn(async move {
            shutdown_worker.run().await;
        });

        // Billing worker
        let billing_worker = BillingWorker::new(
            self.persistence.clone(),
            state.billing.clone(),
            self.billing_config.clone(),
        );
        let billing_shutdown = billing_worker.shutdown_handle();
        let billing_handle = tokio::spawn(async move {
            billing_worker.run().await;
        });

        // DNS responder
        let (dns, dns_addr) = match self.dns_addr {
            Some(addr) => {
                let server = DnsServer::bind(addr, DnsResponder::new(self.persistence.clone())).await?;
                let bound = server.local_addr()?;
                let shutdown = server.shutdown_handle();
                let handle = tokio::spawn(async move {
                    server.run().await;
                });
                (Some((handle, shutdown)), Some(bound))
            }
            None => {
                debug!("dns_addr not configured; DNS responder disabled");
                (None, None)
            }
        };

        // HTTP server
        let listener = TcpListener::bind(self.http_addr).await?;
        let http_addr = listener.local_addr()?;
        let (server_shutdown_tx, mut server_shutdown_rx) = watch::channel(false);
        let app = gateway::router(state);
        let server_handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    while server_shutdown_rx.changed().await.is_ok() {
                        if *server_shutdown_rx.borrow() {
                            break;
                        }
                    }
                    info!("HTTP server received shutdown signal");
                })
                .await
        });

        info!(
            http_addr = %http_addr,
            dns_addr = ?dns_addr,
            port_range = ?self.port_range,
            "EnvironmentRuntime started"
        );

        Ok(EnvironmentRuntime {
            server_handle,
            idle_handle,
            billing_handle,
            dns,
            server_shutdown_tx,
            idle_shutdown,
            billing_shutdown,
            http_addr,
            dns_addr,
        })
    }
}

/// A running environment server.
pub struct EnvironmentRuntime {
    server_handle: JoinHandle<std::io::Result<()>>,
    idle_handle: JoinHandle<()>,
    billing_handle: JoinHandle<()>,
    dns: Option<(JoinHandle<()>, Arc<Notify>)>,
    server_shutdown_tx: watch::Sender<bool>,
    idle_shutdown: Arc<Notify>,
    billing_shutdown: Arc<Notify>,
    http_addr: SocketAddr,
    dns_addr: Option<SocketAddr>,
}

impl EnvironmentRuntime {
    pub fn builder() -> EnvironmentRuntimeBuilder {
        EnvironmentRuntimeBuilder::new()
    }

    /// Address the HTTP server is bound to.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Address the DNS responder is bound to, when enabled.
    pub fn dns_addr(&self) -> Option<SocketAddr> {
        self.dns_addr
    }

    /// Whether the HTTP server task is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
    }

    /// Signal every task to stop and wait for them.
    pub async fn shutdown(self) -> Result<()> {
        info!("EnvironmentRuntime shutting down...");

        let _ = self.server_shutdown_tx.send(true);
        self.idle_shutdown.notify_one();
        self.billing_shutdown.notify_one();
        if let Some((_, shutdown)) = &self.dns {
            shutdown.notify_one();
        }

        if let Err(e) = self.idle_handle.await {
            error!("Shutdown worker task panicked: {}", e);
        }
        if let Err(e) = self.billing_handle.await {
            error!("Billing worker task panicked: {}", e);
        }
        if let Some((handle, _)) = self.dns
            && let Err(e) = handle.await
        {
            error!("DNS server task panicked: {}", e);
        }
        match self.server_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "HTTP server error"),
            Err(e) => error!("HTTP server task panicked: {}", e),
        }

        info!("EnvironmentRuntime shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_requires_adapters() {
        let err = EnvironmentRuntime::builder().build().err().unwrap();
        assert!(err.to_string().contains("persistence is required"));
    }
}
