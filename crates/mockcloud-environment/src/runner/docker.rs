// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker runtime backed by bollard.
//!
//! Backing containers publish one TCP port on all interfaces. Sandbox
//! containers get no network, no capabilities, a read-only root and a
//! seccomp profile, and are driven to completion with [`ContainerRuntime::wait`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
    WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::traits::*;

/// Label carried by every container this server creates.
pub const MANAGED_LABEL: &str = "mockcloud.managed";

const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Docker engine runtime.
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the daemon at `host` (`unix://...` or `tcp://...`), or to
    /// the local defaults when `host` is `None`.
    pub fn connect(host: Option<&str>) -> Result<Self> {
        let client = match host {
            Some(host) if host.starts_with("unix://") => Docker::connect_with_socket(
                host,
                CONNECT_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            ),
            Some(host) => {
                Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| RunnerError::Docker(format!("failed to connect to Docker daemon: {e}")))?;

        Ok(Self { client })
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.client.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let progress =
                progress.map_err(|e| RunnerError::StartFailed(format!("pull {image}: {e}")))?;
            if let Some(error) = progress.error {
                return Err(RunnerError::StartFailed(format!("pull {image}: {error}")));
            }
        }
        Ok(())
    }

    async fn create_and_start(&self, name: &str, config: Config<String>) -> Result<String> {
        let options = CreateContainerOptions {
            name,
            platform: None,
        };
        let created = self
            .client
            .create_container(Some(options), config)
            .await
            .map_err(|e| RunnerError::StartFailed(format!("create {name}: {e}")))?;

        if let Err(e) = self
            .client
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            if let Err(cleanup) = self.remove(&created.id, true).await {
                warn!(container_id = %created.id, error = %cleanup, "Failed to remove container after start failure");
            }
            return Err(RunnerError::StartFailed(format!("start {name}: {e}")));
        }

        Ok(created.id)
    }
}

fn map_err(id: &str, err: BollardError) -> RunnerError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RunnerError::NotFound(format!("{id}: {message}")),
        other => RunnerError::Docker(other.to_string()),
    }
}

fn is_not_modified(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

fn managed_labels(extra: &HashMap<String, String>) -> HashMap<String, String> {
    let mut labels = extra.clone();
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
    labels
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn runtime_type(&self) -> &'static str {
        "docker"
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        self.ensure_image(&spec.image).await?;

        let port_key = format!("{}/tcp", spec.container_port);
        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        );
        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let binds: Vec<String> = spec
            .mounts
            .iter()
            .map(|m| {
                let mode = if m.read_only { ":ro" } else { "" };
                format!("{}:{}{}", m.source, m.target, mode)
            })
            .collect();

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
            cmd: spec.command.clone(),
            exposed_ports: Some(exposed_ports),
            labels: Some(managed_labels(&spec.labels)),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                binds: (!binds.is_empty()).then_some(binds),
                ..Default::default()
            }),
            ..Default::default()
        };

        let id = self.create_and_start(&spec.name, config).await?;
        debug!(container_id = %id, name = %spec.name, host_port = spec.host_port, "Container started");

        Ok(ContainerHandle {
            id,
            name: spec.name.clone(),
            host_port: spec.host_port,
        })
    }

    async fn stop(&self, id: &str, timeout: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        match self.client.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(map_err(id, e)),
        }
    }

    async fn start(&self, id: &str) -> Result<()> {
        match self
            .client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(map_err(id, e)),
        }
    }

    async fn remove(&self, id: &str, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };
        self.client
            .remove_container(id, Some(options))
            .await
            .map_err(|e| map_err(id, e))
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInspection> {
        let info = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_err(id, e))?;

        let host = info.host_config.unwrap_or_default();
        let oom_killed = info
            .state
            .and_then(|state| state.oom_killed)
            .unwrap_or(false);

        Ok(ContainerInspection {
            privileged: host.privileged.unwrap_or(false),
            cap_add: host.cap_add.unwrap_or_default(),
            security_opt: host.security_opt.unwrap_or_default(),
            network_mode: host.network_mode,
            readonly_rootfs: host.readonly_rootfs.unwrap_or(false),
            oom_killed,
        })
    }

    async fn stats(&self, id: &str) -> Result<ContainerStats> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stream = self.client.stats(id, Some(options));
        match stream.next().await {
            Some(Ok(stats)) => Ok(ContainerStats {
                memory_usage_bytes: stats.memory_stats.usage,
                memory_peak_bytes: stats.memory_stats.max_usage,
                cpu_total_ns: Some(stats.cpu_stats.cpu_usage.total_usage),
            }),
            Some(Err(e)) => Err(map_err(id, e)),
            None => Ok(ContainerStats::default()),
        }
    }

    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<String> {
        self.ensure_image(&spec.image).await?;

        let memory_bytes = spec.memory_mb * 1024 * 1024;
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            user: Some(spec.user.clone()),
            network_disabled: Some(true),
            labels: Some(managed_labels(&HashMap::from([(
                "mockcloud.sandbox".to_string(),
                "true".to_string(),
            )]))),
            host_config: Some(HostConfig {
                network_mode: Some("none".to_string()),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec![
                    "no-new-privileges".to_string(),
                    format!("seccomp={}", spec.seccomp_profile),
                ]),
                privileged: Some(false),
                memory: Some(memory_bytes),
                memory_swap: Some(memory_bytes),
                cpu_quota: Some(spec.cpu_quota),
                cpu_period: Some(spec.cpu_period),
                pids_limit: Some(spec.pids_limit),
                readonly_rootfs: Some(spec.read_only),
                tmpfs: Some(spec.tmpfs.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.create_and_start(&spec.name, config).await
    }

    async fn wait(&self, id: &str) -> Result<i64> {
        let mut stream = self
            .client
            .wait_container(id, None::<WaitContainerOptions<String>>);
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code.
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(map_err(id, e)),
            None => Err(RunnerError::Other(format!(
                "wait stream for {id} ended without a status"
            ))),
        }
    }

    async fn kill(&self, id: &str) -> Result<()> {
        let options = KillContainerOptions { signal: "SIGKILL" };
        self.client
            .kill_container(id, Some(options))
            .await
            .map_err(|e| map_err(id, e))
    }

    async fn logs(&self, id: &str, max_bytes: usize) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = self.client.logs(id, Some(options));
        let mut output = CappedOutput::new(max_bytes);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_err(id, e))?;
            if !output.push(&chunk.to_string()) {
                break;
            }
        }
        Ok(output.into_string())
    }
}
