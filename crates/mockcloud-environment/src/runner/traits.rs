// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container runtime trait definitions.
//!
//! Defines the abstract interface the provisioner and the sandbox use to
//! drive a container engine.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from container runtime operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunnerError {
    /// The container does not exist.
    #[error("Container not found: {0}")]
    NotFound(String),

    /// Image pull, create or start failed.
    #[error("Container start failed: {0}")]
    StartFailed(String),

    /// The operation did not finish in time.
    #[error("Container operation timed out")]
    Timeout,

    /// The engine rejected a request.
    #[error("Docker error: {0}")]
    Docker(String),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

impl RunnerError {
    /// Whether the container was already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RunnerError>;

/// A bind mount from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Host path.
    pub source: String,
    /// Path inside the container.
    pub target: String,
    /// Mount read-only.
    pub read_only: bool,
}

/// Options for a long-running backing container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    /// Container name, e.g. `env-abc123def456-redis`.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// Command override.
    pub command: Option<Vec<String>>,
    /// Port the service listens on inside the container.
    pub container_port: u16,
    /// Host port mapped to `container_port`.
    pub host_port: u16,
    /// Labels used to find containers owned by an environment.
    pub labels: HashMap<String, String>,
    /// Bind mounts.
    pub mounts: Vec<Mount>,
}

/// A started backing container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    /// Engine container id.
    pub id: String,
    /// Container name.
    pub name: String,
    /// Mapped host port.
    pub host_port: u16,
}

/// Point-in-time resource usage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerStats {
    /// Current memory usage in bytes.
    pub memory_usage_bytes: Option<u64>,
    /// Peak memory usage in bytes.
    pub memory_peak_bytes: Option<u64>,
    /// Total CPU time in nanoseconds.
    pub cpu_total_ns: Option<u64>,
}

/// Options for a locked-down, run-to-completion sandbox container.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Command to run.
    pub command: Vec<String>,
    /// Memory and memory+swap limit.
    pub memory_mb: i64,
    /// CPU quota in µs per period.
    pub cpu_quota: i64,
    /// CPU period in µs.
    pub cpu_period: i64,
    /// Maximum number of processes.
    pub pids_limit: i64,
    /// Seccomp profile JSON.
    pub seccomp_profile: String,
    /// Read-only root filesystem.
    pub read_only: bool,
    /// tmpfs mounts: path to options.
    pub tmpfs: HashMap<String, String>,
    /// User to run as.
    pub user: String,
}

/// Security-relevant fields of a container's inspect data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInspection {
    /// Privileged mode.
    pub privileged: bool,
    /// Added capabilities.
    pub cap_add: Vec<String>,
    /// Security options (`no-new-privileges`, `seccomp=...`).
    pub security_opt: Vec<String>,
    /// Network mode (`none` when isolated).
    pub network_mode: Option<String>,
    /// Read-only root filesystem.
    pub readonly_rootfs: bool,
    /// The kernel OOM-killed the container.
    pub oom_killed: bool,
}

/// Trait for container engines.
///
/// Runtimes are pure execution engines; they never touch the store.
/// Bookkeeping (handles, ports, execution records) belongs to the caller.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runtime type identifier (e.g., "docker", "mock").
    fn runtime_type(&self) -> &'static str;

    /// Pull the image if needed, create the container and start it.
    async fn run(&self, spec: &ContainerSpec) -> Result<ContainerHandle>;

    /// Stop a running container, waiting up to `timeout` before killing it.
    async fn stop(&self, id: &str, timeout: Duration) -> Result<()>;

    /// Start a stopped container.
    async fn start(&self, id: &str) -> Result<()>;

    /// Remove a container.
    async fn remove(&self, id: &str, force: bool) -> Result<()>;

    /// Security-relevant inspect fields.
    async fn inspect(&self, id: &str) -> Result<ContainerInspection>;

    /// One-shot resource usage.
    async fn stats(&self, id: &str) -> Result<ContainerStats>;

    /// Create and start a sandbox container. Returns its id.
    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<String>;

    /// Wait for a container to exit and return its exit code.
    async fn wait(&self, id: &str) -> Result<i64>;

    /// Send SIGKILL.
    async fn kill(&self, id: &str) -> Result<()>;

    /// Combined stdout and stderr. Reading stops once more than
    /// `max_bytes` have been collected.
    async fn logs(&self, id: &str, max_bytes: usize) -> Result<String>;
}

/// Output collector that stops growing one byte past its limit, so the
/// caller can still tell that output was cut.
#[derive(Debug, Default)]
pub struct CappedOutput {
    buf: String,
    limit: usize,
}

impl CappedOutput {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: String::new(),
            limit,
        }
    }

    /// Append a chunk. Returns `false` once the collector is full and
    /// further chunks would be dropped.
    pub fn push(&mut self, chunk: &str) -> bool {
        let room = (self.limit + 1).saturating_sub(self.buf.len());
        if chunk.len() <= room {
            self.buf.push_str(chunk);
        } else {
            let mut end = room;
            while !chunk.is_char_boundary(end) {
                end -= 1;
            }
            self.buf.push_str(&chunk[..end]);
            return false;
        }
        self.buf.len() <= self.limit
    }

    pub fn into_string(self) -> String {
        self.buf
    }
}
