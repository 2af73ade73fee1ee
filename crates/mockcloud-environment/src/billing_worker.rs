// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for billing reconciliation.
//!
//! Runs daily at 00:00 UTC (or on a fixed interval when configured):
//!
//! 1. rolls over the usage period of every running environment, so long
//!    running environments are billed at least once a day
//! 2. retries charges left `pending`, `failed` or `insufficient`, giving up
//!    after `max_attempts`
//! 3. logs a per-user summary

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, Utc};
use mockcloud_core::Persistence;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::billing::{BillingEngine, BillingError, ChargeOutcome};

/// Configuration for the billing worker.
#[derive(Debug, Clone)]
pub struct BillingWorkerConfig {
    /// Fixed run interval. When `None`, runs at every 00:00 UTC.
    pub interval: Option<Duration>,
    /// Settlement attempts before a charge is abandoned.
    pub max_attempts: i32,
    /// Maximum charges retried per run.
    pub batch_size: i64,
}

impl Default for BillingWorkerConfig {
    fn default() -> Self {
        Self {
            interval: None,
            max_attempts: 5,
            batch_size: 1000,
        }
    }
}

impl BillingWorkerConfig {
    /// Load overrides from environment variables.
    ///
    /// - `MOCKCLOUD_BILLING_INTERVAL_SECS`: fixed interval instead of daily
    /// - `MOCKCLOUD_BILLING_MAX_ATTEMPTS`: default 5
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            interval: std::env::var("MOCKCLOUD_BILLING_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|secs: &u64| *secs > 0)
                .map(Duration::from_secs),
            max_attempts: std::env::var("MOCKCLOUD_BILLING_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_attempts),
            batch_size: defaults.batch_size,
        }
    }
}

/// Per-user totals of one reconciliation run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserSummary {
    /// Usage periods closed.
    pub periods_closed: usize,
    /// Cost of those periods, in credits.
    pub period_cost: f64,
    /// Retried charges that settled.
    pub applied: usize,
    /// Retried charges still short of credit.
    pub insufficient: usize,
    /// Retries that hit a store failure.
    pub failed: usize,
    /// Charges given up on.
    pub abandoned: usize,
}

/// Outcome of [`BillingWorker::reconcile_once`].
#[derive(Debug, Clone, Default)]
pub struct ReconciliationSummary {
    pub users: BTreeMap<String, UserSummary>,
}

impl ReconciliationSummary {
    fn user(&mut self, user_id: &str) -> &mut UserSummary {
        self.users.entry(user_id.to_string()).or_default()
    }
}

/// Background worker for billing reconciliation.
pub struct BillingWorker {
    persistence: Arc<dyn Persistence>,
    billing: BillingEngine,
    config: BillingWorkerConfig,
    shutdown: Arc<Notify>,
}

impl BillingWorker {
    /// Create a new billing worker.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        billing: BillingEngine,
        config: BillingWorkerConfig,
    ) -> Self {
        Self {
            persistence,
            billing,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.interval.map(|d| d.as_secs()),
            max_attempts = self.config.max_attempts,
            "Billing worker started"
        );

        loop {
            let wait = self
                .config
                .interval
                .unwrap_or_else(|| until_next_midnight(Utc::now()));

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Billing worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(wait) => {
                    if let Err(e) = self.reconcile_once(Utc::now()).await {
                        error!(error = %e, "Billing reconciliation failed");
                    }
                }
            }
        }

        info!("Billing worker stopped");
    }

    /// One reconciliation pass as of `now`.
    pub async fn reconcile_once(&self, now: DateTime<Utc>) -> Result<ReconciliationSummary, BillingError> {
        let mut summary = ReconciliationSummary::default();

        let running = self
            .persistence
            .list_environments(None, Some("running"))
            .await?;
        for environment in &running {
            match self.billing.close_period(environment, now).await {
                Ok(Some(cost)) => {
                    let user = summary.user(&environment.user_id);
                    user.periods_closed += 1;
                    user.period_cost += cost;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(
                        environment_id = %environment.id,
                        error = %e,
                        "Failed to close usage period"
                    );
                    continue;
                }
            }
            match self.billing.open_period(environment, now).await {
                Ok(_) => {}
                Err(BillingError::Core(e)) if e.is_unique_violation() => {
                    debug!(environment_id = %environment.id, "Usage period already open");
                }
                Err(e) => {
                    error!(
                        environment_id = %environment.id,
                        error = %e,
                        "Failed to open usage period"
                    );
                }
            }
        }

        let events = self
            .persistence
            .list_unsettled_billing_events(now, self.config.batch_size)
            .await?;
        for event in &events {
            if event.attempts >= self.config.max_attempts {
                match self.billing.abandon(event, now).await {
                    Ok(()) => {
                        warn!(
                            event_id = %event.id,
                            user_id = %event.user_id,
                            cost = event.cost_nanocredits,
                            attempts = event.attempts,
                            "Charge abandoned after retry limit"
                        );
                        summary.user(&event.user_id).abandoned += 1;
                    }
                    Err(e) => error!(event_id = %event.id, error = %e, "Failed to abandon charge"),
                }
                continue;
            }

            let user = summary.user(&event.user_id);
            match self.billing.settle(event, now).await {
                ChargeOutcome::Applied => user.applied += 1,
                ChargeOutcome::Insufficient => user.insufficient += 1,
                ChargeOutcome::Failed => user.failed += 1,
            }
        }

        for (user_id, user) in &summary.users {
            info!(
                user_id = %user_id,
                periods_closed = user.periods_closed,
                period_cost = user.period_cost,
                applied = user.applied,
                insufficient = user.insufficient,
                failed = user.failed,
                abandoned = user.abandoned,
                "Billing reconciled"
            );
        }
        info!(
            environments = running.len(),
            retried = events.len(),
            users = summary.users.len(),
            "Billing reconciliation complete"
        );
        Ok(summary)
    }
}

/// Time from `now` to the next 00:00 UTC.
pub fn until_next_midnight(now: DateTime<Utc>) -> Duration {
    let next = now
        .date_naive()
        .checked_add_days(Days::new(1))
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc());
    next.and_then(|t| (t - now).to_std().ok())
        .unwrap_or(Duration::from_secs(24 * 3600))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_until_next_midnight() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 23, 0, 0).unwrap();
        assert_eq!(until_next_midnight(now), Duration::from_secs(3600));

        let midnight = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(until_next_midnight(midnight), Duration::from_secs(24 * 3600));
    }

    #[test]
    fn test_config_defaults() {
        let config = BillingWorkerConfig::default();
        assert!(config.interval.is_none());
        assert_eq!(config.max_attempts, 5);
    }
}
