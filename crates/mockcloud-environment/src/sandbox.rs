// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sandboxed code execution.
//!
//! Each execution runs in a fresh, locked-down container: no network, no
//! capabilities, a seccomp denylist, a read-only root filesystem and a hard
//! wall-clock timeout. The execution record moves through
//!
//! ```text
//! pending -> running -> completed | failed | timeout | security_violation
//! ```
//!
//! and is persisted at every step. The container is force-removed on every
//! path once it exists.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use mockcloud_core::persistence::ExecutionRecord;
use mockcloud_core::{CoreError, Persistence};
use thiserror::Error;
use tracing::{info, warn};

use crate::runner::{ContainerInspection, ContainerRuntime, SandboxSpec};

/// Syscalls answered with `EPERM` inside the sandbox.
pub const BLOCKED_SYSCALLS: [&str; 10] = [
    "clone",
    "unshare",
    "mount",
    "umount",
    "umount2",
    "pivot_root",
    "chroot",
    "reboot",
    "sethostname",
    "setdomainname",
];

/// Output fragments that indicate an escape or privilege probe.
pub const SUSPICIOUS_PATTERNS: [&str; 8] = [
    "permission denied",
    "operation not permitted",
    "capability not permitted",
    "/proc/",
    "/sys/",
    "mount",
    "unshare",
    "chroot",
];

/// Errors from the execution engine. Container failures are recorded on the
/// execution rather than returned.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SandboxError {
    /// The execution does not exist.
    #[error("Execution not found: {0}")]
    NotFound(String),

    /// The store failed.
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Result type for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Supported languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Python,
    Php,
    Perl,
    Javascript,
    Node,
    Go,
    Shell,
    Html,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Php => "php",
            Self::Perl => "perl",
            Self::Javascript => "javascript",
            Self::Node => "node",
            Self::Go => "go",
            Self::Shell => "shell",
            Self::Html => "html",
        }
    }

    /// Image the code runs in.
    pub fn image(&self) -> &'static str {
        match self {
            Self::Python => "python:3.11-alpine",
            Self::Php => "php:8.2-cli-alpine",
            Self::Perl => "perl:5.38-slim",
            Self::Javascript | Self::Node => "node:20-alpine",
            Self::Go => "golang:1.21-alpine",
            Self::Shell => "alpine:latest",
            Self::Html => "nginx:alpine",
        }
    }

    /// Command running `code`. Code that must be written to a file is passed
    /// as `$0` of a shell script, never interpolated into it.
    pub fn command(&self, code: &str) -> Vec<String> {
        let argv: &[&str] = match self {
            Self::Python => &["python", "-c"],
            Self::Php => &["php", "-r"],
            Self::Perl => &["perl", "-e"],
            Self::Javascript | Self::Node => &["node", "-e"],
            Self::Shell => &["sh", "-c"],
            Self::Go => &[
                "sh",
                "-c",
                "export HOME=/tmp GOCACHE=/tmp/.gocache; \
                 printf '%s' \"$0\" > /tmp/main.go && go run /tmp/main.go",
            ],
            Self::Html => &["sh", "-c", "printf '%s\\n' \"$0\""],
        };
        argv.iter()
            .map(|s| s.to_string())
            .chain(std::iter::once(code.to_string()))
            .collect()
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "python" => Self::Python,
            "php" => Self::Php,
            "perl" => Self::Perl,
            "javascript" => Self::Javascript,
            "node" => Self::Node,
            "go" => Self::Go,
            "shell" => Self::Shell,
            "html" => Self::Html,
            other => return Err(other.to_string()),
        })
    }
}

/// Execution lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    SecurityViolation,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::SecurityViolation => "security_violation",
        }
    }

    /// Whether the execution has finished.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limits applied to every sandbox container.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Hard wall-clock limit when the caller gives none.
    pub timeout: Duration,
    /// Memory and memory+swap limit.
    pub memory_mb: i64,
    /// CPU quota in µs per period.
    pub cpu_quota: i64,
    /// CPU period in µs.
    pub cpu_period: i64,
    /// Process limit.
    pub pids_limit: i64,
    /// Stored output is cut to this many bytes.
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            memory_mb: 256,
            cpu_quota: 50_000,
            cpu_period: 100_000,
            pids_limit: 50,
            max_output_bytes: 10_000,
        }
    }
}

/// A request to run code.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Authenticated caller.
    pub user_id: Option<String>,
    /// Anonymous caller session.
    pub session_id: Option<String>,
    pub language: String,
    pub code: String,
    /// Overrides [`SandboxConfig::timeout`].
    pub timeout: Option<Duration>,
}

/// What happened inside the container.
struct Observation {
    exit_code: Option<i64>,
    timed_out: bool,
    output: String,
    error: Option<String>,
    violations: Vec<String>,
    memory_used_mb: Option<f64>,
    elapsed: Duration,
}

/// Runs code in locked-down containers and records the outcome.
#[derive(Clone)]
pub struct Sandbox {
    persistence: Arc<dyn Persistence>,
    runtime: Arc<dyn ContainerRuntime>,
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        runtime: Arc<dyn ContainerRuntime>,
        config: SandboxConfig,
    ) -> Self {
        Self {
            persistence,
            runtime,
            config,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Fetch an execution.
    pub async fn get(&self, id: &str) -> Result<ExecutionRecord> {
        self.persistence
            .get_execution(id)
            .await?
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))
    }

    /// Run `request` to completion and return the terminal record.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionRecord> {
        let mut record = ExecutionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: request.user_id,
            session_id: request.session_id,
            language: request.language.trim().to_ascii_lowercase(),
            code: request.code,
            status: ExecutionStatus::Pending.as_str().to_string(),
            output: None,
            error: None,
            exit_code: None,
            execution_time_ms: None,
            memory_used_mb: None,
            security_violations: "[]".to_string(),
            container_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        self.persistence.insert_execution(&record).await?;

        let language = match record.language.parse::<Language>() {
            Ok(language) => language,
            Err(other) => {
                record.error = Some(format!("Unsupported language: {other}"));
                return self.finish(record, ExecutionStatus::Failed).await;
            }
        };

        let spec = self.spec(&record, language);
        let container_id = match self.runtime.create_sandbox(&spec).await {
            Ok(id) => id,
            Err(e) => {
                warn!(execution_id = %record.id, error = %e, "Sandbox container failed to start");
                record.error = Some(format!("Execution error: {e}"));
                return self.finish(record, ExecutionStatus::Failed).await;
            }
        };

        record.status = ExecutionStatus::Running.as_str().to_string();
        record.container_id = Some(container_id.clone());
        record.started_at = Some(Utc::now());
        if let Err(e) = self.persistence.update_execution(&record).await {
            self.remove(&container_id).await;
            return Err(e.into());
        }

        let timeout = request.timeout.unwrap_or(self.config.timeout);
        let observation = self.supervise(&container_id, timeout).await;
        self.remove(&container_id).await;

        let status = if !observation.violations.is_empty() {
            ExecutionStatus::SecurityViolation
        } else if observation.timed_out {
            ExecutionStatus::Timeout
        } else if observation.exit_code == Some(0) {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };

        record.output = Some(observation.output);
        record.error = observation.error;
        record.exit_code = observation.exit_code.map(|c| c as i32);
        record.execution_time_ms = Some(observation.elapsed.as_millis() as i64);
        record.memory_used_mb = observation.memory_used_mb;
        record.security_violations = serde_json::to_string(&observation.violations)
            .unwrap_or_else(|_| "[]".to_string());

        self.finish(record, status).await
    }

    fn spec(&self, record: &ExecutionRecord, language: Language) -> SandboxSpec {
        SandboxSpec {
            name: format!("mockcloud-sandbox-{}", record.id),
            image: language.image().to_string(),
            command: language.command(&record.code),
            memory_mb: self.config.memory_mb,
            cpu_quota: self.config.cpu_quota,
            cpu_period: self.config.cpu_period,
            pids_limit: self.config.pids_limit,
            seccomp_profile: seccomp_profile(),
            read_only: true,
            tmpfs: HashMap::from([("/tmp".to_string(), "size=10M,mode=1777".to_string())]),
            user: "nobody".to_string(),
        }
    }

    /// Wait for exit or the deadline, then collect output and audit data.
    async fn supervise(&self, container_id: &str, timeout: Duration) -> Observation {
        let started = Instant::now();
        let mut error = None;
        let mut timed_out = false;

        let exit_code = match tokio::time::timeout(timeout, self.runtime.wait(container_id)).await
        {
            Ok(Ok(code)) => Some(code),
            Ok(Err(e)) => {
                error = Some(format!("Execution error: {e}"));
                None
            }
            Err(_) => {
                timed_out = true;
                if let Err(e) = self.runtime.kill(container_id).await {
                    warn!(container_id, error = %e, "Failed to kill timed-out sandbox");
                }
                error = Some(format!(
                    "Execution timed out after {} seconds",
                    timeout.as_secs()
                ));
                None
            }
        };
        let elapsed = started.elapsed();

        let output = match self
            .runtime
            .logs(container_id, self.config.max_output_bytes)
            .await
        {
            Ok(logs) => truncate_output(&logs, self.config.max_output_bytes),
            Err(e) => {
                warn!(container_id, error = %e, "Failed to read sandbox logs");
                String::new()
            }
        };

        let mut violations = scan_output(&output);
        match self.runtime.inspect(container_id).await {
            Ok(inspection) => violations.extend(audit_inspection(&inspection)),
            Err(e) => warn!(container_id, error = %e, "Failed to inspect sandbox"),
        }

        let memory_used_mb = self
            .runtime
            .stats(container_id)
            .await
            .ok()
            .and_then(|s| s.memory_peak_bytes.or(s.memory_usage_bytes))
            .map(|bytes| bytes as f64 / (1024.0 * 1024.0));

        Observation {
            exit_code,
            timed_out,
            output,
            error,
            violations,
            memory_used_mb,
            elapsed,
        }
    }

    async fn remove(&self, container_id: &str) {
        if let Err(e) = self.runtime.remove(container_id, true).await
            && !e.is_not_found()
        {
            warn!(container_id, error = %e, "Failed to remove sandbox container");
        }
    }

    async fn finish(
        &self,
        mut record: ExecutionRecord,
        status: ExecutionStatus,
    ) -> Result<ExecutionRecord> {
        record.status = status.as_str().to_string();
        record.completed_at = Some(Utc::now());
        self.persistence.update_execution(&record).await?;

        info!(
            execution_id = %record.id,
            language = %record.language,
            status = %status,
            exit_code = ?record.exit_code,
            execution_time_ms = ?record.execution_time_ms,
            "Execution finished"
        );
        Ok(record)
    }
}

/// Seccomp profile allowing everything except [`BLOCKED_SYSCALLS`].
pub fn seccomp_profile() -> String {
    serde_json::json!({
        "defaultAction": "SCMP_ACT_ALLOW",
        "syscalls": [
            {
                "names": BLOCKED_SYSCALLS,
                "action": "SCMP_ACT_ERRNO",
            }
        ]
    })
    .to_string()
}

/// Case-insensitive scan of the output for [`SUSPICIOUS_PATTERNS`].
pub fn scan_output(output: &str) -> Vec<String> {
    let lower = output.to_lowercase();
    SUSPICIOUS_PATTERNS
        .iter()
        .filter(|pattern| contains_term(&lower, pattern))
        .map(|pattern| format!("Suspicious activity detected: {pattern}"))
        .collect()
}

/// Whether `term` occurs in `text` without being part of a longer word.
/// Only edges of the term that are word characters need a boundary, so
/// `/proc/` still matches inside a path.
fn contains_term(text: &str, term: &str) -> bool {
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    let needs_start = term.chars().next().is_some_and(is_word);
    let needs_end = term.chars().next_back().is_some_and(is_word);
    text.match_indices(term).any(|(start, matched)| {
        let end = start + matched.len();
        let start_ok = !needs_start || !text[..start].chars().next_back().is_some_and(is_word);
        let end_ok = !needs_end || !text[end..].chars().next().is_some_and(is_word);
        start_ok && end_ok
    })
}

/// Isolation settings the container ended up without.
pub fn audit_inspection(inspection: &ContainerInspection) -> Vec<String> {
    let mut violations = Vec::new();
    if inspection.privileged {
        violations.push("Privilege escalation attempt detected".to_string());
    }
    if !inspection.cap_add.is_empty() {
        violations.push(format!(
            "Capabilities added: {}",
            inspection.cap_add.join(", ")
        ));
    }
    if !inspection
        .security_opt
        .iter()
        .any(|opt| opt.starts_with("no-new-privileges"))
    {
        violations.push("no-new-privileges is not set".to_string());
    }
    if inspection.network_mode.as_deref() != Some("none") {
        violations.push("Network isolation is missing".to_string());
    }
    if !inspection.readonly_rootfs {
        violations.push("Root filesystem is writable".to_string());
    }
    if inspection.oom_killed {
        violations.push("Resource limit exceeded: memory".to_string());
    }
    violations
}

/// Cut `output` to at most `max` bytes on a character boundary.
pub fn truncate_output(output: &str, max: usize) -> String {
    if output.len() <= max {
        return output.to_string();
    }
    let mut end = max;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    output[..end].to_string()
}
