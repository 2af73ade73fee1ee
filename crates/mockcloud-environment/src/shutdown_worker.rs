// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that stops idle environments.
//!
//! Running environments whose `last_activity` is older than their
//! `auto_shutdown_hours` are stopped through the provisioner. The stop is a
//! status compare-and-set, so an environment stopped or destroyed by a user
//! between the listing and the stop is simply skipped and re-examined on
//! the next sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mockcloud_core::Persistence;
use mockcloud_core::persistence::EnvironmentRecord;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::provisioner::{ProvisionError, Provisioner};

/// Configuration for the shutdown worker.
#[derive(Debug, Clone)]
pub struct ShutdownWorkerConfig {
    /// How often to sweep.
    pub poll_interval: Duration,
}

impl Default for ShutdownWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(300),
        }
    }
}

impl ShutdownWorkerConfig {
    /// Load from `MOCKCLOUD_SHUTDOWN_POLL_SECS`, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_interval: std::env::var("MOCKCLOUD_SHUTDOWN_POLL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
        }
    }
}

/// Background worker that stops idle environments.
pub struct ShutdownWorker {
    persistence: Arc<dyn Persistence>,
    provisioner: Provisioner,
    config: ShutdownWorkerConfig,
    shutdown: Arc<Notify>,
}

impl ShutdownWorker {
    /// Create a new shutdown worker.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        provisioner: Provisioner,
        config: ShutdownWorkerConfig,
    ) -> Self {
        Self {
            persistence,
            provisioner,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Shutdown worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Shutdown worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.sweep_once(Utc::now()).await {
                        error!(error = %e, "Auto-shutdown sweep failed");
                    }
                }
            }
        }

        info!("Shutdown worker stopped");
    }

    /// Stop every environment idle at `now`. Returns how many were stopped.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<usize, ProvisionError> {
        let running = self
            .persistence
            .list_environments(None, Some("running"))
            .await?;
        let idle: Vec<_> = running.iter().filter(|e| is_idle(e, now)).collect();
        if idle.is_empty() {
            debug!("No idle environments");
            return Ok(0);
        }

        let mut stopped = 0;
        for environment in idle {
            match self.provisioner.stop(&environment.id).await {
                Ok(_) => {
                    stopped += 1;
                    info!(
                        environment_id = %environment.id,
                        user_id = %environment.user_id,
                        idle_since = %environment.last_activity,
                        "Environment auto-stopped"
                    );
                }
                Err(ProvisionError::InvalidState { status, .. }) => {
                    warn!(
                        environment_id = %environment.id,
                        status = %status,
                        "Environment changed during sweep, skipping"
                    );
                }
                Err(e) => {
                    error!(
                        environment_id = %environment.id,
                        error = %e,
                        "Failed to auto-stop environment"
                    );
                }
            }
        }
        Ok(stopped)
    }
}

/// Whether `environment` has been idle longer than its shutdown window.
pub fn is_idle(environment: &EnvironmentRecord, now: DateTime<Utc>) -> bool {
    environment.auto_shutdown_hours > 0
        && now - environment.last_activity
            > chrono::Duration::hours(i64::from(environment.auto_shutdown_hours))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn environment(hours: i32, idle_minutes: i64, now: DateTime<Utc>) -> EnvironmentRecord {
        EnvironmentRecord {
            id: "env-aaaaaaaaaaaa".to_string(),
            user_id: "alice".to_string(),
            name: "idle".to_string(),
            status: "running".to_string(),
            services: "{}".to_string(),
            endpoints: "{}".to_string(),
            hourly_rate: 0.1,
            total_cost: 0.0,
            auto_shutdown_hours: hours,
            error: None,
            created_at: now,
            started_at: Some(now),
            stopped_at: None,
            last_activity: now - chrono::Duration::minutes(idle_minutes),
        }
    }

    #[test]
    fn test_is_idle() {
        let now = Utc::now();
        assert!(is_idle(&environment(1, 61, now), now));
        assert!(!is_idle(&environment(1, 59, now), now));
        assert!(!is_idle(&environment(0, 10_000, now), now));
    }

    #[test]
    fn test_config_default() {
        assert_eq!(
            ShutdownWorkerConfig::default().poll_interval,
            Duration::from_secs(300)
        );
    }
}
