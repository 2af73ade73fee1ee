// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Environment lifecycle.
//!
//! ```text
//! provisioning ──► running ◄──► stopped
//!       │             │            │
//!       │             └─────┬──────┘
//!       │                   ▼
//!       │              destroying ──► destroyed
//!       ▼
//!     error   (from any non-terminal state)
//! ```
//!
//! Every transition is a compare-and-set in the store, so the control API,
//! the auto-shutdown sweep and the billing closer can race on the same
//! environment without a lock. Real objects are tracked in the
//! `backing_handles` arena; [`Provisioner::ensure_backing`] is the single
//! place a backing object is created and [`Provisioner::destroy`] the single
//! place the arena is torn down.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mockcloud_core::persistence::{
    BackingHandleRecord, ClaimOutcome, EnvironmentRecord, NewBackingHandle,
};
use mockcloud_core::{CoreError, Persistence};
use rand::Rng;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::billing::{BillingEngine, BillingError};
use crate::cloud_network::{CloudNetwork, NetworkError, SubnetSpec, VcnSpec, dns_label};
use crate::port_allocator::{AllocatorError, PortAllocator};
use crate::runner::{ContainerRuntime, ContainerSpec, Mount, RunnerError};
use crate::services::{
    DeclaredService, ServiceCategory, ServiceMap, ServiceType, compute_hourly_rate,
    generate_password, parse_service_map,
};

/// Placeholder for the host port in a container endpoint template.
pub const PORT_PLACEHOLDER: &str = "{port}";

/// Label carrying the owning environment on every backing container.
pub const ENVIRONMENT_LABEL: &str = "mockcloud.environment";

/// Handle name of the network created for a declared `aws_vpc` service.
pub const DECLARED_VCN_HANDLE: &str = "vcn";

const TEARDOWN_PASSES: usize = 3;

/// Lifecycle errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProvisionError {
    /// The environment does not exist.
    #[error("Environment not found: {0}")]
    NotFound(String),

    /// Destroy was called on a destroyed environment.
    #[error("Environment already destroyed: {0}")]
    AlreadyDestroyed(String),

    /// The environment is not in a state the operation accepts.
    #[error("Cannot {operation} environment {id} in status {status}")]
    InvalidState {
        /// Environment id.
        id: String,
        /// Current status.
        status: String,
        /// Attempted operation.
        operation: &'static str,
    },

    /// The request is invalid.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A backing object could not be created.
    #[error("Failed to materialize {name}: {reason}")]
    MaterializationFailed {
        /// Handle name.
        name: String,
        /// Cause.
        reason: String,
    },

    /// Port allocation failed.
    #[error(transparent)]
    Ports(#[from] AllocatorError),

    /// Container engine failed.
    #[error("Container runtime error: {0}")]
    Runner(#[from] RunnerError),

    /// Cloud network failed.
    #[error("Cloud network error: {0}")]
    Network(#[from] NetworkError),

    /// Usage period bookkeeping failed.
    #[error(transparent)]
    Billing(#[from] BillingError),

    /// The store failed.
    #[error("Store error: {0}")]
    Core(#[from] CoreError),

    /// Stored JSON could not be read.
    #[error("Invalid stored JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProvisionError {
    /// Whether the error is the port range running out.
    pub fn is_ports_exhausted(&self) -> bool {
        matches!(
            self,
            Self::Ports(AllocatorError::PortsExhausted { .. })
        )
    }
}

/// Result type for lifecycle operations.
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Lifecycle timing and addressing.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Host that mapped container ports are reachable on.
    pub backing_host: String,
    /// Domain of gateway endpoints.
    pub gateway_domain: String,
    /// Grace period when stopping a container.
    pub stop_timeout: Duration,
    /// How long a losing claimant waits for the winner.
    pub materialize_timeout: Duration,
    /// How often a losing claimant re-reads the handle.
    pub materialize_poll: Duration,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            backing_host: "127.0.0.1".to_string(),
            gateway_domain: "mockcloud.local".to_string(),
            stop_timeout: Duration::from_secs(10),
            materialize_timeout: Duration::from_secs(30),
            materialize_poll: Duration::from_millis(100),
        }
    }
}

/// One service of a create request.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceRequest {
    /// Service type name.
    #[serde(rename = "type")]
    pub service_type: String,
    /// Image version.
    #[serde(default)]
    pub version: Option<String>,
    /// Free-form service configuration.
    #[serde(default)]
    pub config: serde_json::Value,
}

/// A create request.
#[derive(Debug, Clone)]
pub struct NewEnvironment {
    /// Owner.
    pub user_id: String,
    /// Display name; the id when absent.
    pub name: Option<String>,
    /// Declared services.
    pub services: Vec<ServiceRequest>,
    /// Idle hours before auto-shutdown; 4 when absent.
    pub auto_shutdown_hours: Option<i32>,
}

/// A container to run as a backing object.
#[derive(Debug, Clone)]
pub struct ContainerBacking {
    /// Container name.
    pub container_name: String,
    /// Image reference.
    pub image: String,
    /// Port the service listens on inside the container.
    pub container_port: u16,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// Command override.
    pub command: Option<Vec<String>>,
    /// Bind mounts.
    pub mounts: Vec<Mount>,
    /// Endpoint with [`PORT_PLACEHOLDER`] standing for the host port.
    pub endpoint_template: Option<String>,
}

/// What to create for a backing handle.
#[derive(Debug, Clone)]
pub enum BackingSpec {
    /// A container on a freshly allocated host port.
    Container(ContainerBacking),
    /// A VCN.
    Vcn {
        /// Display name.
        display_name: String,
        /// CIDR block.
        cidr_block: String,
    },
    /// A subnet under the VCN of handle `parent`.
    Subnet {
        /// Parent handle name.
        parent: String,
        /// Display name.
        display_name: String,
        /// CIDR block.
        cidr_block: String,
    },
    /// An internet gateway in the VCN of handle `parent`.
    InternetGateway {
        /// Parent handle name.
        parent: String,
        /// Display name.
        display_name: String,
    },
    /// A network security group in the VCN of handle `parent`.
    Nsg {
        /// Parent handle name.
        parent: String,
        /// Display name.
        display_name: String,
    },
}

impl BackingSpec {
    /// Arena kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Container(_) => "container",
            Self::Vcn { .. } => "vcn",
            Self::Subnet { .. } => "subnet",
            Self::InternetGateway { .. } => "internet_gateway",
            Self::Nsg { .. } => "nsg",
        }
    }

    fn parent(&self) -> Option<&str> {
        match self {
            Self::Subnet { parent, .. }
            | Self::InternetGateway { parent, .. }
            | Self::Nsg { parent, .. } => Some(parent),
            _ => None,
        }
    }
}

struct Realized {
    handle_id: String,
    port: Option<i32>,
    endpoint: Option<String>,
}

/// Drives environments through their lifecycle.
#[derive(Clone)]
pub struct Provisioner {
    persistence: Arc<dyn Persistence>,
    runtime: Arc<dyn ContainerRuntime>,
    network: Arc<dyn CloudNetwork>,
    ports: PortAllocator,
    billing: BillingEngine,
    config: ProvisionerConfig,
}

impl Provisioner {
    /// Create a provisioner.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        runtime: Arc<dyn ContainerRuntime>,
        network: Arc<dyn CloudNetwork>,
        ports: PortAllocator,
        billing: BillingEngine,
        config: ProvisionerConfig,
    ) -> Self {
        Self {
            persistence,
            runtime,
            network,
            ports,
            billing,
            config,
        }
    }

    /// The cloud network adapter.
    pub fn network(&self) -> &Arc<dyn CloudNetwork> {
        &self.network
    }

    /// The container runtime adapter.
    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Lifecycle configuration.
    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    /// Fetch an environment.
    pub async fn get(&self, environment_id: &str) -> Result<EnvironmentRecord> {
        self.persistence
            .get_environment(environment_id)
            .await?
            .ok_or_else(|| ProvisionError::NotFound(environment_id.to_string()))
    }

    /// Validate, insert and provision a new environment.
    pub async fn create(&self, request: NewEnvironment) -> Result<EnvironmentRecord> {
        if request.services.is_empty() {
            return Err(ProvisionError::Validation(
                "At least one service is required".to_string(),
            ));
        }
        let auto_shutdown_hours = request.auto_shutdown_hours.unwrap_or(4);
        if !(1..=48).contains(&auto_shutdown_hours) {
            return Err(ProvisionError::Validation(format!(
                "auto_shutdown_hours must be between 1 and 48, got {auto_shutdown_hours}"
            )));
        }

        let mut services = ServiceMap::new();
        for service in request.services {
            let service_type: ServiceType = service
                .service_type
                .parse()
                .map_err(|e: crate::services::UnknownService| {
                    ProvisionError::Validation(e.to_string())
                })?;
            services.insert(
                service_type,
                DeclaredService {
                    version: service.version.unwrap_or_else(|| "latest".to_string()),
                    config: service.config,
                },
            );
        }

        let now = Utc::now();
        let id = new_environment_id();
        let environment = EnvironmentRecord {
            name: request.name.unwrap_or_else(|| id.clone()),
            id,
            user_id: request.user_id,
            status: "provisioning".to_string(),
            services: serde_json::to_string(&services)?,
            endpoints: "{}".to_string(),
            hourly_rate: compute_hourly_rate(services.keys()),
            total_cost: 0.0,
            auto_shutdown_hours,
            error: None,
            created_at: now,
            started_at: None,
            stopped_at: None,
            last_activity: now,
        };
        self.persistence.insert_environment(&environment).await?;

        info!(
            environment_id = %environment.id,
            user_id = %environment.user_id,
            services = services.len(),
            hourly_rate = environment.hourly_rate,
            "Environment created"
        );

        self.provision(&environment).await?;
        self.get(&environment.id).await
    }

    /// Realize every declared service of a `provisioning` environment and
    /// flip it to `running`. On failure the environment moves to `error`;
    /// handles created so far stay in the arena for destroy.
    pub async fn provision(&self, environment: &EnvironmentRecord) -> Result<()> {
        let result = match self.provision_services(environment).await {
            Ok(endpoints) => self.finish_provisioning(environment, &endpoints).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            error!(
                environment_id = %environment.id,
                error = %e,
                "Provisioning failed"
            );
            if let Err(mark_err) = self
                .persistence
                .mark_environment_error(&environment.id, &e.to_string())
                .await
            {
                error!(
                    environment_id = %environment.id,
                    error = %mark_err,
                    "Failed to mark environment as error"
                );
            }
        }
        result
    }

    async fn provision_services(
        &self,
        environment: &EnvironmentRecord,
    ) -> Result<BTreeMap<String, String>> {
        let services = parse_service_map(&environment.services)?;
        let mut endpoints = BTreeMap::new();

        for (service_type, declared) in &services {
            let endpoint = match service_type.category() {
                ServiceCategory::Container => {
                    let handle = self
                        .ensure_backing(
                            &environment.id,
                            service_type.as_str(),
                            self.container_backing(&environment.id, *service_type, declared)?,
                        )
                        .await?;
                    handle.endpoint.unwrap_or_default()
                }
                ServiceCategory::Network => {
                    self.ensure_backing(
                        &environment.id,
                        DECLARED_VCN_HANDLE,
                        BackingSpec::Vcn {
                            display_name: format!("{}-vcn", environment.id),
                            cidr_block: "10.0.0.0/16".to_string(),
                        },
                    )
                    .await?;
                    self.gateway_endpoint(&environment.id, *service_type)
                }
                ServiceCategory::Emulated => self.gateway_endpoint(&environment.id, *service_type),
            };
            endpoints.insert(service_type.as_str().to_string(), endpoint);
        }

        Ok(endpoints)
    }

    async fn finish_provisioning(
        &self,
        environment: &EnvironmentRecord,
        endpoints: &BTreeMap<String, String>,
    ) -> Result<()> {
        let now = Utc::now();
        self.billing.open_period(environment, now).await?;
        self.persistence
            .set_environment_endpoints(&environment.id, &serde_json::to_string(endpoints)?)
            .await?;

        if !self
            .persistence
            .transition_environment(&environment.id, "provisioning", "running", now)
            .await?
        {
            let current = self.get(&environment.id).await?;
            return Err(ProvisionError::InvalidState {
                id: environment.id.clone(),
                status: current.status,
                operation: "provision",
            });
        }

        info!(
            environment_id = %environment.id,
            endpoints = endpoints.len(),
            "Environment running"
        );
        Ok(())
    }

    fn container_backing(
        &self,
        environment_id: &str,
        service_type: ServiceType,
        declared: &DeclaredService,
    ) -> Result<BackingSpec> {
        let password = generate_password();
        let recipe = service_type
            .container_recipe(&declared.version, &password)
            .ok_or_else(|| {
                ProvisionError::Validation(format!("{service_type} is not a container service"))
            })?;
        // Passwords never contain braces, so the placeholder is unambiguous.
        let endpoint_template =
            recipe.connection_string(&self.config.backing_host, PORT_PLACEHOLDER, &password);

        Ok(BackingSpec::Container(ContainerBacking {
            container_name: format!("{environment_id}-{service_type}"),
            image: recipe.image,
            container_port: recipe.container_port,
            env: recipe.env,
            command: recipe.command,
            mounts: Vec::new(),
            endpoint_template: Some(endpoint_template),
        }))
    }

    fn gateway_endpoint(&self, environment_id: &str, service_type: ServiceType) -> String {
        service_type.gateway_endpoint(environment_id, &self.config.gateway_domain)
    }

    /// Stop a running environment: stop containers, park handles, clear
    /// endpoints and close the usage period.
    pub async fn stop(&self, environment_id: &str) -> Result<EnvironmentRecord> {
        let environment = self.get(environment_id).await?;
        let now = Utc::now();
        if !self
            .persistence
            .transition_environment(environment_id, "running", "stopped", now)
            .await?
        {
            return Err(self.invalid_state(environment_id, "stop").await);
        }

        for handle in self.container_handles(environment_id, "live").await? {
            if let Some(id) = &handle.handle_id
                && let Err(e) = self.runtime.stop(id, self.config.stop_timeout).await
            {
                warn!(
                    environment_id = %environment_id,
                    handle = %handle.name,
                    error = %e,
                    "Failed to stop container, skipping"
                );
            }
        }

        self.persistence
            .set_backing_handles_state(environment_id, "live", "parked")
            .await?;
        self.persistence
            .set_environment_endpoints(environment_id, "{}")
            .await?;
        self.billing.close_period(&environment, now).await?;

        info!(environment_id = %environment_id, "Environment stopped");
        self.get(environment_id).await
    }

    /// Resume a stopped environment.
    pub async fn start(&self, environment_id: &str) -> Result<EnvironmentRecord> {
        let now = Utc::now();
        if !self
            .persistence
            .transition_environment(environment_id, "stopped", "running", now)
            .await?
        {
            return Err(self.invalid_state(environment_id, "start").await);
        }

        for handle in self.container_handles(environment_id, "parked").await? {
            if let Some(id) = &handle.handle_id
                && let Err(e) = self.runtime.start(id).await
            {
                warn!(
                    environment_id = %environment_id,
                    handle = %handle.name,
                    error = %e,
                    "Failed to restart container, skipping"
                );
            }
        }
        self.persistence
            .set_backing_handles_state(environment_id, "parked", "live")
            .await?;

        let environment = self.get(environment_id).await?;
        let endpoints = self.rebuild_endpoints(&environment).await?;
        self.persistence
            .set_environment_endpoints(environment_id, &serde_json::to_string(&endpoints)?)
            .await?;
        self.billing.open_period(&environment, now).await?;
        self.persistence.touch_environment(environment_id, now).await?;

        info!(environment_id = %environment_id, "Environment started");
        self.get(environment_id).await
    }

    async fn rebuild_endpoints(
        &self,
        environment: &EnvironmentRecord,
    ) -> Result<BTreeMap<String, String>> {
        let services = parse_service_map(&environment.services)?;
        let handles = self.persistence.list_backing_handles(&environment.id).await?;
        let mut endpoints = BTreeMap::new();
        for service_type in services.keys() {
            let endpoint = match service_type.category() {
                ServiceCategory::Container => handles
                    .iter()
                    .find(|h| h.name == service_type.as_str() && h.state == "live")
                    .and_then(|h| h.endpoint.clone()),
                _ => Some(self.gateway_endpoint(&environment.id, *service_type)),
            };
            if let Some(endpoint) = endpoint {
                endpoints.insert(service_type.as_str().to_string(), endpoint);
            }
        }
        Ok(endpoints)
    }

    /// Stored endpoints merged with those of live backing handles.
    pub async fn endpoints(
        &self,
        environment: &EnvironmentRecord,
    ) -> Result<BTreeMap<String, String>> {
        let mut endpoints: BTreeMap<String, String> =
            serde_json::from_str(&environment.endpoints)?;
        if environment.status != "running" {
            return Ok(endpoints);
        }
        for handle in self.persistence.list_backing_handles(&environment.id).await? {
            if handle.state == "live"
                && let Some(endpoint) = handle.endpoint
            {
                endpoints.entry(handle.name).or_insert(endpoint);
            }
        }
        Ok(endpoints)
    }

    /// Tear an environment down: ports, containers, cloud objects in
    /// dependency order, handle rows, endpoints, usage period.
    ///
    /// An environment left in `destroying` by an interrupted destroy is torn
    /// down again; every step tolerates objects that are already gone.
    pub async fn destroy(&self, environment_id: &str) -> Result<()> {
        let environment = self.get(environment_id).await?;
        match environment.status.as_str() {
            "destroyed" => {
                return Err(ProvisionError::AlreadyDestroyed(environment_id.to_string()));
            }
            "destroying" => {
                warn!(environment_id = %environment_id, "Resuming interrupted destroy");
            }
            status => {
                if !self
                    .persistence
                    .transition_environment(environment_id, status, "destroying", Utc::now())
                    .await?
                {
                    return Err(self.invalid_state(environment_id, "destroy").await);
                }
            }
        }

        let released = self.ports.release_environment(environment_id).await?;
        debug!(environment_id = %environment_id, released, "Ports released");

        // No claim succeeds once the environment is `destroying`, but a row
        // claimed just before may complete while the first pass runs.
        let mut removed = 0;
        for _ in 0..TEARDOWN_PASSES {
            let handles = self.persistence.list_backing_handles(environment_id).await?;
            if handles.is_empty() {
                break;
            }
            removed += handles.len();
            self.teardown_arena(environment_id, &handles).await?;
        }

        self.persistence
            .set_environment_endpoints(environment_id, "{}")
            .await?;
        self.billing.close_period(&environment, Utc::now()).await?;

        if !self
            .persistence
            .transition_environment(environment_id, "destroying", "destroyed", Utc::now())
            .await?
        {
            return Err(self.invalid_state(environment_id, "destroy").await);
        }

        info!(
            environment_id = %environment_id,
            handles = removed,
            "Environment destroyed"
        );
        Ok(())
    }

    async fn teardown_arena(
        &self,
        environment_id: &str,
        handles: &[BackingHandleRecord],
    ) -> Result<()> {
        for handle in handles.iter().filter(|h| h.kind == "container") {
            self.teardown_container(handle).await;
        }
        for kind in ["subnet", "internet_gateway", "nsg", "vcn"] {
            for handle in handles.iter().filter(|h| h.kind == kind) {
                self.teardown_cloud_object(handle).await;
            }
        }
        for handle in handles {
            self.persistence
                .delete_backing_handle(environment_id, &handle.name)
                .await?;
        }
        Ok(())
    }

    /// Return the live handle `name`, creating its backing object if this
    /// caller wins the claim. Losers wait for the winner.
    pub async fn ensure_backing(
        &self,
        environment_id: &str,
        name: &str,
        spec: BackingSpec,
    ) -> Result<BackingHandleRecord> {
        let claim = NewBackingHandle {
            environment_id: environment_id.to_string(),
            name: name.to_string(),
            kind: spec.kind().to_string(),
            parent_name: spec.parent().map(str::to_string),
        };

        match self.persistence.claim_backing_handle(&claim).await? {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::Taken => return self.wait_for_backing(environment_id, name).await,
            ClaimOutcome::Inactive => {
                return Err(self.invalid_state(environment_id, "materialize").await);
            }
        }

        match self.realize(environment_id, name, &spec).await {
            Ok(realized) => {
                self.persistence
                    .complete_backing_handle(
                        environment_id,
                        name,
                        &realized.handle_id,
                        realized.port,
                        realized.endpoint.as_deref(),
                    )
                    .await?;

                // A stop or destroy that started while the object was being
                // created has already walked the arena without seeing it.
                let status = self.get(environment_id).await?.status;
                if !matches!(status.as_str(), "provisioning" | "running") {
                    warn!(
                        environment_id = %environment_id,
                        handle = %name,
                        status = %status,
                        "Environment left the running state during materialization, discarding"
                    );
                    self.discard_realized(environment_id, name, spec.kind(), &realized)
                        .await;
                    return Err(ProvisionError::InvalidState {
                        id: environment_id.to_string(),
                        status,
                        operation: "materialize",
                    });
                }

                info!(
                    environment_id = %environment_id,
                    handle = %name,
                    kind = spec.kind(),
                    handle_id = %realized.handle_id,
                    "Backing object materialized"
                );
                self.persistence
                    .get_backing_handle(environment_id, name)
                    .await?
                    .ok_or_else(|| ProvisionError::MaterializationFailed {
                        name: name.to_string(),
                        reason: "handle vanished after completion".to_string(),
                    })
            }
            Err(e) => {
                warn!(
                    environment_id = %environment_id,
                    handle = %name,
                    error = %e,
                    "Materialization failed, releasing claim"
                );
                if let Err(del) = self
                    .persistence
                    .delete_backing_handle(environment_id, name)
                    .await
                {
                    error!(handle = %name, error = %del, "Failed to release claim");
                }
                Err(e)
            }
        }
    }

    async fn wait_for_backing(
        &self,
        environment_id: &str,
        name: &str,
    ) -> Result<BackingHandleRecord> {
        let deadline = tokio::time::Instant::now() + self.config.materialize_timeout;
        loop {
            match self
                .persistence
                .get_backing_handle(environment_id, name)
                .await?
            {
                Some(handle) if handle.state != "materializing" => return Ok(handle),
                Some(_) => {}
                None => {
                    return Err(ProvisionError::MaterializationFailed {
                        name: name.to_string(),
                        reason: "concurrent materialization failed".to_string(),
                    });
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ProvisionError::MaterializationFailed {
                    name: name.to_string(),
                    reason: "timed out waiting for concurrent materialization".to_string(),
                });
            }
            tokio::time::sleep(self.config.materialize_poll).await;
        }
    }

    async fn realize(
        &self,
        environment_id: &str,
        name: &str,
        spec: &BackingSpec,
    ) -> Result<Realized> {
        match spec {
            BackingSpec::Container(container) => {
                let port = self.ports.allocate(environment_id, name).await?;
                let run_spec = ContainerSpec {
                    name: container.container_name.clone(),
                    image: container.image.clone(),
                    env: container.env.clone(),
                    command: container.command.clone(),
                    container_port: container.container_port,
                    host_port: port,
                    labels: HashMap::from([
                        (ENVIRONMENT_LABEL.to_string(), environment_id.to_string()),
                        ("mockcloud.handle".to_string(), name.to_string()),
                    ]),
                    mounts: container.mounts.clone(),
                };
                match self.runtime.run(&run_spec).await {
                    Ok(handle) => Ok(Realized {
                        handle_id: handle.id,
                        port: Some(i32::from(port)),
                        endpoint: container
                            .endpoint_template
                            .as_ref()
                            .map(|t| t.replace(PORT_PLACEHOLDER, &port.to_string())),
                    }),
                    Err(e) => {
                        if let Err(release) = self.ports.release(port).await {
                            error!(port, error = %release, "Failed to release port");
                        }
                        Err(e.into())
                    }
                }
            }
            BackingSpec::Vcn {
                display_name,
                cidr_block,
            } => {
                let vcn = self
                    .network
                    .create_vcn(&VcnSpec {
                        display_name: display_name.clone(),
                        cidr_block: cidr_block.clone(),
                        dns_label: dns_label(environment_id),
                    })
                    .await?;
                Ok(cloud_realized(vcn.id))
            }
            BackingSpec::Subnet {
                parent,
                display_name,
                cidr_block,
            } => {
                let vcn_id = self.parent_handle_id(environment_id, parent).await?;
                let subnet = self
                    .network
                    .create_subnet(&SubnetSpec {
                        vcn_id,
                        display_name: display_name.clone(),
                        cidr_block: cidr_block.clone(),
                    })
                    .await?;
                Ok(cloud_realized(subnet.id))
            }
            BackingSpec::InternetGateway {
                parent,
                display_name,
            } => {
                let vcn_id = self.parent_handle_id(environment_id, parent).await?;
                let igw = self
                    .network
                    .create_internet_gateway(&vcn_id, display_name)
                    .await?;
                Ok(cloud_realized(igw.id))
            }
            BackingSpec::Nsg {
                parent,
                display_name,
            } => {
                let vcn_id = self.parent_handle_id(environment_id, parent).await?;
                let nsg = self.network.create_nsg(&vcn_id, display_name).await?;
                Ok(cloud_realized(nsg.id))
            }
        }
    }

    /// Remove an object created for a claim that can no longer be kept.
    async fn discard_realized(
        &self,
        environment_id: &str,
        name: &str,
        kind: &str,
        realized: &Realized,
    ) {
        let handle = BackingHandleRecord {
            environment_id: environment_id.to_string(),
            name: name.to_string(),
            kind: kind.to_string(),
            state: "live".to_string(),
            handle_id: Some(realized.handle_id.clone()),
            parent_name: None,
            port: realized.port,
            endpoint: realized.endpoint.clone(),
            created_at: Utc::now(),
        };
        self.teardown(&handle).await;
        if let Err(e) = self
            .persistence
            .delete_backing_handle(environment_id, name)
            .await
        {
            error!(handle = %name, error = %e, "Failed to delete discarded handle");
        }
    }

    async fn parent_handle_id(&self, environment_id: &str, parent: &str) -> Result<String> {
        self.persistence
            .get_backing_handle(environment_id, parent)
            .await?
            .and_then(|h| h.handle_id)
            .ok_or_else(|| ProvisionError::MaterializationFailed {
                name: parent.to_string(),
                reason: "parent network is not materialized".to_string(),
            })
    }

    /// Tear down one handle and every handle parented on it, children first.
    pub async fn release_backing(&self, environment_id: &str, name: &str) -> Result<bool> {
        let handles = self.persistence.list_backing_handles(environment_id).await?;
        let Some(handle) = handles.iter().find(|h| h.name == name) else {
            return Ok(false);
        };

        for child in handles
            .iter()
            .filter(|h| h.parent_name.as_deref() == Some(name))
        {
            self.teardown(child).await;
            self.persistence
                .delete_backing_handle(environment_id, &child.name)
                .await?;
        }
        self.teardown(handle).await;
        self.persistence
            .delete_backing_handle(environment_id, name)
            .await?;

        debug!(environment_id = %environment_id, handle = %name, "Backing object released");
        Ok(true)
    }

    async fn teardown(&self, handle: &BackingHandleRecord) {
        if handle.kind == "container" {
            self.teardown_container(handle).await;
            if let Some(port) = handle.port.and_then(|p| u16::try_from(p).ok())
                && let Err(e) = self.ports.release(port).await
            {
                warn!(port, error = %e, "Failed to release port");
            }
        } else {
            self.teardown_cloud_object(handle).await;
        }
    }

    async fn teardown_container(&self, handle: &BackingHandleRecord) {
        let Some(id) = &handle.handle_id else { return };
        if let Err(e) = self.runtime.stop(id, self.config.stop_timeout).await
            && !e.is_not_found()
        {
            warn!(handle = %handle.name, error = %e, "Failed to stop container");
        }
        match self.runtime.remove(id, true).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                warn!(handle = %handle.name, container_id = %id, "Container already gone");
            }
            Err(e) => warn!(handle = %handle.name, error = %e, "Failed to remove container"),
        }
    }

    async fn teardown_cloud_object(&self, handle: &BackingHandleRecord) {
        let Some(id) = &handle.handle_id else { return };
        let result = match handle.kind.as_str() {
            "vcn" => self.network.delete_vcn(id).await,
            "subnet" => self.network.delete_subnet(id).await,
            "internet_gateway" => self.network.delete_internet_gateway(id).await,
            "nsg" => self.network.delete_nsg(id).await,
            _ => return,
        };
        match result {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                warn!(handle = %handle.name, object_id = %id, "Cloud object already gone");
            }
            Err(e) => warn!(handle = %handle.name, error = %e, "Failed to delete cloud object"),
        }
    }

    async fn container_handles(
        &self,
        environment_id: &str,
        state: &str,
    ) -> Result<Vec<BackingHandleRecord>> {
        Ok(self
            .persistence
            .list_backing_handles(environment_id)
            .await?
            .into_iter()
            .filter(|h| h.kind == "container" && h.state == state)
            .collect())
    }

    async fn invalid_state(&self, environment_id: &str, operation: &'static str) -> ProvisionError {
        match self.persistence.get_environment(environment_id).await {
            Ok(Some(env)) if env.status == "destroyed" && operation == "destroy" => {
                ProvisionError::AlreadyDestroyed(environment_id.to_string())
            }
            Ok(Some(env)) => ProvisionError::InvalidState {
                id: environment_id.to_string(),
                status: env.status,
                operation,
            },
            Ok(None) => ProvisionError::NotFound(environment_id.to_string()),
            Err(e) => e.into(),
        }
    }
}

fn cloud_realized(handle_id: String) -> Realized {
    Realized {
        handle_id,
        port: None,
        endpoint: None,
    }
}

/// `env-` followed by 12 lowercase alphanumerics.
pub fn new_environment_id() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..12)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();
    format!("env-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_id_shape() {
        let id = new_environment_id();
        assert_eq!(id.len(), 16);
        assert!(id.starts_with("env-"));
        assert!(
            id[4..]
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        );
    }

    #[test]
    fn test_backing_spec_kinds() {
        let subnet = BackingSpec::Subnet {
            parent: "vpc:vpc-1".to_string(),
            display_name: "s".to_string(),
            cidr_block: "10.0.1.0/24".to_string(),
        };
        assert_eq!(subnet.kind(), "subnet");
        assert_eq!(subnet.parent(), Some("vpc:vpc-1"));
        assert_eq!(
            BackingSpec::Vcn {
                display_name: "v".to_string(),
                cidr_block: "10.0.0.0/16".to_string()
            }
            .parent(),
            None
        );
    }
}
