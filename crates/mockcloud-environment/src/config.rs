// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for mockcloud-environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// OCI Core Services settings. Present only when every variable is set.
#[derive(Debug, Clone)]
pub struct OciConfig {
    /// Base URL, e.g. `https://iaas.eu-frankfurt-1.oraclecloud.com`.
    pub endpoint: String,
    /// The one compartment every network object is created in.
    pub compartment_id: String,
    /// Bearer token sent with every request.
    pub auth_token: String,
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// `postgres://...` or `sqlite:...`
    pub database_url: String,
    /// HTTP address for the gateway and control API.
    pub http_addr: SocketAddr,
    /// UDP address for the DNS responder.
    pub dns_addr: SocketAddr,
    /// Domain under which gateway endpoints are published.
    pub gateway_domain: String,
    /// Inclusive host port range for backing containers.
    pub port_range: (i32, i32),
    /// Data directory (Lambda code extraction).
    pub data_dir: PathBuf,
    /// Docker daemon address; bollard local defaults when unset.
    pub docker_host: Option<String>,
    /// Host that mapped container ports are reachable on.
    pub backing_host: String,
    /// Hard wall-clock limit for a sandboxed run.
    pub sandbox_timeout: Duration,
    /// Sandbox memory limit in MB.
    pub sandbox_memory_mb: i64,
    /// Sandbox CPU quota against a 100000 µs period.
    pub sandbox_cpu_quota: i64,
    /// Cloud network settings; the mock adapter is used when absent.
    pub oci: Option<OciConfig>,
    /// Raw `token:user,...` list for the static identity provider.
    pub api_tokens: String,
    /// Auto-shutdown sweep interval.
    pub shutdown_poll_interval: Duration,
    /// Emit JSON log lines.
    pub json_logs: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("MOCKCLOUD_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("MOCKCLOUD_DATABASE_URL"))?;

        let http_port: u16 = std::env::var("MOCKCLOUD_HTTP_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let dns_port: u16 = std::env::var("MOCKCLOUD_DNS_PORT")
            .unwrap_or_else(|_| "5353".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let gateway_domain = std::env::var("MOCKCLOUD_GATEWAY_DOMAIN")
            .unwrap_or_else(|_| "mockcloud.local".to_string());

        let port_range = parse_port_range(
            &std::env::var("MOCKCLOUD_PORT_RANGE").unwrap_or_else(|_| "30000-40000".to_string()),
        )?;

        let data_dir = PathBuf::from(
            std::env::var("MOCKCLOUD_DATA_DIR").unwrap_or_else(|_| ".data".to_string()),
        );

        let docker_host = std::env::var("MOCKCLOUD_DOCKER_HOST")
            .ok()
            .filter(|v| !v.is_empty());

        let backing_host =
            std::env::var("MOCKCLOUD_BACKING_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let sandbox_timeout = Duration::from_secs(env_or("MOCKCLOUD_SANDBOX_TIMEOUT_SECS", 30));
        let sandbox_memory_mb = env_or("MOCKCLOUD_SANDBOX_MEMORY_MB", 256);
        let sandbox_cpu_quota = env_or("MOCKCLOUD_SANDBOX_CPU_QUOTA", 50_000);

        let oci = match (
            std::env::var("OCI_ENDPOINT"),
            std::env::var("OCI_COMPARTMENT_ID"),
            std::env::var("OCI_AUTH_TOKEN"),
        ) {
            (Ok(endpoint), Ok(compartment_id), Ok(auth_token))
                if !endpoint.is_empty() && !compartment_id.is_empty() =>
            {
                Some(OciConfig {
                    endpoint,
                    compartment_id,
                    auth_token,
                })
            }
            _ => None,
        };

        let api_tokens = std::env::var("MOCKCLOUD_API_TOKENS").unwrap_or_default();

        let shutdown_poll_interval =
            Duration::from_secs(env_or("MOCKCLOUD_SHUTDOWN_POLL_SECS", 300));

        let json_logs = std::env::var("MOCKCLOUD_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        Ok(Self {
            database_url,
            http_addr: SocketAddr::from(([0, 0, 0, 0], http_port)),
            dns_addr: SocketAddr::from(([0, 0, 0, 0], dns_port)),
            gateway_domain,
            port_range,
            data_dir,
            docker_host,
            backing_host,
            sandbox_timeout,
            sandbox_memory_mb,
            sandbox_cpu_quota,
            oci,
            api_tokens,
            shutdown_poll_interval,
            json_logs,
        })
    }

    /// Whether the database URL selects the SQLite backend.
    pub fn is_sqlite(&self) -> bool {
        self.database_url.starts_with("sqlite:")
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse `lo-hi` into an inclusive range.
pub fn parse_port_range(raw: &str) -> Result<(i32, i32), ConfigError> {
    let (lo, hi) = raw
        .split_once('-')
        .ok_or_else(|| ConfigError::InvalidPortRange(raw.to_string()))?;
    let lo: u16 = lo
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidPortRange(raw.to_string()))?;
    let hi: u16 = hi
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidPortRange(raw.to_string()))?;
    if lo == 0 || lo > hi {
        return Err(ConfigError::InvalidPortRange(raw.to_string()));
    }
    Ok((i32::from(lo), i32::from(hi)))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// The port number is invalid.
    #[error("Invalid port number")]
    InvalidPort,
    /// The port range is not `lo-hi` with `0 < lo <= hi`.
    #[error("Invalid port range: {0}")]
    InvalidPortRange(String),
}
