// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock runtime for testing.
//!
//! Simulates a container engine in memory and records every call so tests
//! can assert which adapter operations a code path performed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::traits::*;

/// Mock container state.
#[derive(Debug, Clone)]
struct MockContainer {
    name: String,
    running: bool,
    killed: bool,
    sandbox: bool,
}

/// Mock container runtime for testing.
pub struct MockRuntime {
    containers: Arc<Mutex<HashMap<String, MockContainer>>>,
    calls: Arc<Mutex<Vec<String>>>,
    specs: Arc<Mutex<Vec<ContainerSpec>>>,
    next_id: AtomicU64,
    /// If true, `run` and `create_sandbox` fail.
    pub fail_run: bool,
    /// Output returned by `logs` for sandbox containers.
    pub sandbox_output: String,
    /// Exit code returned by `wait` for sandbox containers.
    pub sandbox_exit_code: i64,
    /// If true, sandbox containers never exit until killed.
    pub sandbox_hangs: bool,
    /// Inspect data returned for sandbox containers; a compliant sandbox
    /// when `None`.
    pub inspection: Option<ContainerInspection>,
    /// Delay applied to `run`, to widen race windows.
    pub run_delay: Duration,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self {
            containers: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            specs: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
            fail_run: false,
            sandbox_output: String::new(),
            sandbox_exit_code: 0,
            sandbox_hangs: false,
            inspection: None,
            run_delay: Duration::ZERO,
        }
    }

    /// Create a mock runtime whose containers fail to start.
    pub fn failing() -> Self {
        Self {
            fail_run: true,
            ..Self::new()
        }
    }

    /// Create a mock runtime whose sandboxes print `output` and exit with `exit_code`.
    pub fn with_sandbox_result(output: &str, exit_code: i64) -> Self {
        Self {
            sandbox_output: output.to_string(),
            sandbox_exit_code: exit_code,
            ..Self::new()
        }
    }

    /// Create a mock runtime whose sandboxes run until killed.
    pub fn hanging() -> Self {
        Self {
            sandbox_hangs: true,
            ..Self::new()
        }
    }

    /// Every call in order, as `op:target`.
    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    /// Number of calls whose op is `op`.
    pub async fn count(&self, op: &str) -> usize {
        let prefix = format!("{op}:");
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    /// Specs passed to `run`, in order.
    pub async fn run_specs(&self) -> Vec<ContainerSpec> {
        self.specs.lock().await.clone()
    }

    /// Whether a container exists (was created and not removed).
    pub async fn exists(&self, id: &str) -> bool {
        self.containers.lock().await.contains_key(id)
    }

    /// Whether a container exists and is running.
    pub async fn is_running(&self, id: &str) -> bool {
        self.containers
            .lock()
            .await
            .get(id)
            .is_some_and(|c| c.running)
    }

    /// Number of containers that exist.
    pub async fn container_count(&self) -> usize {
        self.containers.lock().await.len()
    }

    async fn record(&self, op: &str, target: &str) {
        self.calls.lock().await.push(format!("{op}:{target}"));
    }

    fn next_id(&self) -> String {
        format!("mock-{:012x}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn runtime_type(&self) -> &'static str {
        "mock"
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        self.record("run", &spec.name).await;
        if !self.run_delay.is_zero() {
            tokio::time::sleep(self.run_delay).await;
        }
        if self.fail_run {
            return Err(RunnerError::StartFailed(format!(
                "mock failure starting {}",
                spec.name
            )));
        }

        self.specs.lock().await.push(spec.clone());
        let id = self.next_id();
        self.containers.lock().await.insert(
            id.clone(),
            MockContainer {
                name: spec.name.clone(),
                running: true,
                killed: false,
                sandbox: false,
            },
        );

        Ok(ContainerHandle {
            id,
            name: spec.name.clone(),
            host_port: spec.host_port,
        })
    }

    async fn stop(&self, id: &str, _timeout: Duration) -> Result<()> {
        self.record("stop", id).await;
        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(id)
            .ok_or_else(|| RunnerError::NotFound(id.to_string()))?;
        container.running = false;
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.record("start", id).await;
        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(id)
            .ok_or_else(|| RunnerError::NotFound(id.to_string()))?;
        container.running = true;
        Ok(())
    }

    async fn remove(&self, id: &str, force: bool) -> Result<()> {
        self.record("remove", id).await;
        let mut containers = self.containers.lock().await;
        match containers.get(id) {
            None => Err(RunnerError::NotFound(id.to_string())),
            Some(c) if c.running && !force => Err(RunnerError::Docker(format!(
                "container {} is running",
                c.name
            ))),
            Some(_) => {
                containers.remove(id);
                Ok(())
            }
        }
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInspection> {
        self.record("inspect", id).await;
        let containers = self.containers.lock().await;
        let container = containers
            .get(id)
            .ok_or_else(|| RunnerError::NotFound(id.to_string()))?;
        if !container.sandbox {
            return Ok(ContainerInspection::default());
        }
        Ok(self.inspection.clone().unwrap_or(ContainerInspection {
            privileged: false,
            cap_add: Vec::new(),
            security_opt: vec!["no-new-privileges".to_string()],
            network_mode: Some("none".to_string()),
            readonly_rootfs: true,
            oom_killed: false,
        }))
    }

    async fn stats(&self, id: &str) -> Result<ContainerStats> {
        if !self.exists(id).await {
            return Err(RunnerError::NotFound(id.to_string()));
        }
        Ok(ContainerStats {
            memory_usage_bytes: Some(8 * 1024 * 1024),
            memory_peak_bytes: Some(12 * 1024 * 1024),
            cpu_total_ns: Some(1_000_000),
        })
    }

    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<String> {
        self.record("create_sandbox", &spec.name).await;
        if self.fail_run {
            return Err(RunnerError::StartFailed(format!(
                "mock failure starting {}",
                spec.name
            )));
        }
        let id = self.next_id();
        self.containers.lock().await.insert(
            id.clone(),
            MockContainer {
                name: spec.name.clone(),
                running: true,
                killed: false,
                sandbox: true,
            },
        );
        Ok(id)
    }

    async fn wait(&self, id: &str) -> Result<i64> {
        self.record("wait", id).await;
        if self.sandbox_hangs {
            loop {
                {
                    let containers = self.containers.lock().await;
                    match containers.get(id) {
                        Some(c) if c.killed => return Ok(137),
                        Some(_) => {}
                        None => return Err(RunnerError::NotFound(id.to_string())),
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(id)
            .ok_or_else(|| RunnerError::NotFound(id.to_string()))?;
        container.running = false;
        Ok(self.sandbox_exit_code)
    }

    async fn kill(&self, id: &str) -> Result<()> {
        self.record("kill", id).await;
        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(id)
            .ok_or_else(|| RunnerError::NotFound(id.to_string()))?;
        container.running = false;
        container.killed = true;
        Ok(())
    }

    async fn logs(&self, id: &str, max_bytes: usize) -> Result<String> {
        if !self.exists(id).await {
            return Err(RunnerError::NotFound(id.to_string()));
        }
        let mut output = CappedOutput::new(max_bytes);
        for line in self.sandbox_output.split_inclusive('\n') {
            if !output.push(line) {
                break;
            }
        }
        Ok(output.into_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: "redis:7".to_string(),
            container_port: 6379,
            host_port: 30000,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_run_stop_start_remove() {
        let runtime = MockRuntime::new();
        let handle = runtime.run(&spec("env-1-redis")).await.unwrap();
        assert!(runtime.is_running(&handle.id).await);

        runtime
            .stop(&handle.id, Duration::from_secs(10))
            .await
            .unwrap();
        assert!(!runtime.is_running(&handle.id).await);

        runtime.start(&handle.id).await.unwrap();
        assert!(runtime.is_running(&handle.id).await);

        runtime.remove(&handle.id, true).await.unwrap();
        assert!(!runtime.exists(&handle.id).await);
        assert_eq!(runtime.count("run").await, 1);
    }

    #[tokio::test]
    async fn test_missing_container_is_not_found() {
        let runtime = MockRuntime::new();
        let err = runtime
            .stop("nope", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_failing_runtime() {
        let runtime = MockRuntime::failing();
        assert!(matches!(
            runtime.run(&spec("x")).await,
            Err(RunnerError::StartFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_hanging_sandbox_exits_when_killed() {
        let runtime = Arc::new(MockRuntime::hanging());
        let id = runtime
            .create_sandbox(&SandboxSpec {
                name: "sbx".to_string(),
                image: "alpine:latest".to_string(),
                command: vec!["sh".to_string()],
                memory_mb: 256,
                cpu_quota: 50_000,
                cpu_period: 100_000,
                pids_limit: 50,
                seccomp_profile: "{}".to_string(),
                read_only: true,
                tmpfs: HashMap::new(),
                user: "nobody".to_string(),
            })
            .await
            .unwrap();

        let waiter = {
            let runtime = runtime.clone();
            let id = id.clone();
            tokio::spawn(async move { runtime.wait(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        runtime.kill(&id).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), 137);
    }

    #[tokio::test]
    async fn test_logs_stop_past_the_limit() {
        let flood = "0123456789abcdef\n".repeat(64 * 1024);
        let runtime = MockRuntime::with_sandbox_result(&flood, 0);
        let handle = runtime.run(&spec("noisy")).await.unwrap();

        let logs = runtime.logs(&handle.id, 100).await.unwrap();
        assert_eq!(logs.len(), 101);
        assert!(flood.starts_with(&logs));

        let all = runtime.logs(&handle.id, flood.len()).await.unwrap();
        assert_eq!(all, flood);
    }
}
