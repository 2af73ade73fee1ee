// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Metered billing.
//!
//! Data-plane operations are priced in nanocredits (one credit is 1e9
//! nanocredits) so balances never accumulate float drift. Every charge is
//! first recorded as a `pending` billing event and then settled with a
//! conditional debit; a charge that cannot be settled stays on record for
//! the reconciliation worker and never fails the operation that caused it.
//!
//! | Item                      | Nanocredits      |
//! |---------------------------|------------------|
//! | Lambda GB-second          | 16 666.7         |
//! | Lambda request            | 200              |
//! | DynamoDB read unit        | 250              |
//! | DynamoDB write unit       | 1 250            |
//! | SQS request               | 400              |
//! | EC2/VPC wiring action     | 10 000           |
//!
//! Environments are additionally billed by the hour when a usage period
//! closes.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mockcloud_core::persistence::{BillingEventRecord, EnvironmentRecord, UsagePeriodRecord};
use mockcloud_core::{CoreError, Persistence};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Nanocredits per credit.
pub const NANOCREDITS_PER_CREDIT: i64 = 1_000_000_000;

/// Lambda compute price, in tenths of a nanocredit per GB-second.
const LAMBDA_GB_SECOND_DECI_NANO: i64 = 166_667;
const LAMBDA_REQUEST_NANO: i64 = 200;
const DYNAMODB_READ_UNIT_NANO: i64 = 250;
const DYNAMODB_WRITE_UNIT_NANO: i64 = 1_250;
const SQS_REQUEST_NANO: i64 = 400;
/// PUT, LIST and other write-class S3 requests: $0.005 per 1000.
const S3_WRITE_REQUEST_NANO: i64 = 5_000;
/// GET and HEAD requests: $0.0004 per 1000.
const S3_READ_REQUEST_NANO: i64 = 400;
const WIRING_ACTION_NANO: i64 = 10_000;

/// Billing errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BillingError {
    /// The caller's balance does not cover data-plane use.
    #[error("Insufficient credit for user {user_id}: balance {balance} nanocredits")]
    InsufficientCredit {
        /// Account owner.
        user_id: String,
        /// Balance in nanocredits.
        balance: i64,
    },

    /// The store failed.
    #[error("Billing store error: {0}")]
    Core(#[from] CoreError),
}

/// Result type for billing operations.
pub type Result<T> = std::result::Result<T, BillingError>;

/// How a charge ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeOutcome {
    /// The balance was debited.
    Applied,
    /// The balance did not cover the cost; the event awaits reconciliation.
    Insufficient,
    /// The store failed; the event (if recorded) awaits reconciliation.
    Failed,
}

impl ChargeOutcome {
    fn status(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Insufficient => "insufficient",
            Self::Failed => "failed",
        }
    }
}

/// One metered charge.
#[derive(Debug, Clone)]
pub struct Charge<'a> {
    pub user_id: &'a str,
    pub environment_id: Option<&'a str>,
    pub service: &'a str,
    pub operation: &'a str,
    pub units: i64,
    pub cost_nanocredits: i64,
}

/// DynamoDB capacity class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynamoOp {
    Read,
    Write,
}

/// S3 request class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S3Op {
    Read,
    Write,
}

/// Metered billing over the credit store.
#[derive(Clone)]
pub struct BillingEngine {
    persistence: Arc<dyn Persistence>,
}

impl BillingEngine {
    /// Create a billing engine.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// Current balance in nanocredits.
    pub async fn balance(&self, user_id: &str) -> Result<i64> {
        Ok(self.persistence.get_balance(user_id).await?)
    }

    /// Top up a balance. Returns the new balance.
    pub async fn add_credits(&self, user_id: &str, nanocredits: i64) -> Result<i64> {
        let balance = self
            .persistence
            .credit_account(user_id, nanocredits, Utc::now())
            .await?;
        info!(user_id = %user_id, amount = nanocredits, balance, "Credits added");
        Ok(balance)
    }

    /// Fail with `InsufficientCredit` unless the balance is positive.
    pub async fn ensure_funds(&self, user_id: &str) -> Result<()> {
        let balance = self.balance(user_id).await?;
        if balance <= 0 {
            return Err(BillingError::InsufficientCredit {
                user_id: user_id.to_string(),
                balance,
            });
        }
        Ok(())
    }

    /// Record and settle a charge. Never fails: storage errors leave the
    /// event for reconciliation.
    pub async fn charge(&self, charge: Charge<'_>) -> ChargeOutcome {
        let now = Utc::now();
        let event = BillingEventRecord {
            id: Uuid::new_v4().to_string(),
            user_id: charge.user_id.to_string(),
            environment_id: charge.environment_id.map(str::to_string),
            service: charge.service.to_string(),
            operation: charge.operation.to_string(),
            units: charge.units,
            cost_nanocredits: charge.cost_nanocredits,
            status: "pending".to_string(),
            attempts: 0,
            error: None,
            created_at: now,
            reconciled_at: None,
        };

        if let Err(e) = self.persistence.insert_billing_event(&event).await {
            error!(
                error = %e,
                user_id = %charge.user_id,
                service = %charge.service,
                operation = %charge.operation,
                cost = charge.cost_nanocredits,
                "Failed to record billing event"
            );
            return ChargeOutcome::Failed;
        }

        let outcome = self.settle(&event, now).await;
        debug!(
            event_id = %event.id,
            service = %charge.service,
            operation = %charge.operation,
            units = charge.units,
            cost = charge.cost_nanocredits,
            outcome = outcome.status(),
            "Charge settled"
        );
        outcome
    }

    /// Attempt the debit for a recorded event and store the outcome.
    pub async fn settle(&self, event: &BillingEventRecord, at: DateTime<Utc>) -> ChargeOutcome {
        let (outcome, err) = match self
            .persistence
            .debit_account(&event.user_id, event.cost_nanocredits, at)
            .await
        {
            Ok(true) => (ChargeOutcome::Applied, None),
            Ok(false) => (ChargeOutcome::Insufficient, None),
            Err(e) => (ChargeOutcome::Failed, Some(e.to_string())),
        };

        let reconciled_at = (outcome == ChargeOutcome::Applied).then_some(at);
        if let Err(e) = self
            .persistence
            .update_billing_event(&event.id, outcome.status(), err.as_deref(), reconciled_at)
            .await
        {
            // A debit that landed but could not be marked would be charged
            // twice on reconciliation.
            error!(
                error = %e,
                event_id = %event.id,
                outcome = outcome.status(),
                "Failed to record billing outcome"
            );
        }

        if outcome == ChargeOutcome::Insufficient {
            warn!(
                user_id = %event.user_id,
                event_id = %event.id,
                cost = event.cost_nanocredits,
                "Insufficient credit, charge left for reconciliation"
            );
        }
        outcome
    }

    /// Give up on an event.
    pub async fn abandon(&self, event: &BillingEventRecord, at: DateTime<Utc>) -> Result<()> {
        self.persistence
            .update_billing_event(
                &event.id,
                "failed",
                Some("retry limit reached"),
                Some(at),
            )
            .await?;
        Ok(())
    }

    /// Open a usage period for a running environment.
    pub async fn open_period(
        &self,
        environment: &EnvironmentRecord,
        at: DateTime<Utc>,
    ) -> Result<UsagePeriodRecord> {
        let period = UsagePeriodRecord {
            id: Uuid::new_v4().to_string(),
            environment_id: environment.id.clone(),
            user_id: environment.user_id.clone(),
            period_start: at,
            period_end: None,
            hourly_rate: environment.hourly_rate,
            cost: None,
        };
        self.persistence.open_usage_period(&period).await?;
        Ok(period)
    }

    /// Close the open usage period of an environment, if any: fix its cost,
    /// add it to the environment total and charge the owner. Returns the
    /// cost in credits.
    pub async fn close_period(
        &self,
        environment: &EnvironmentRecord,
        at: DateTime<Utc>,
    ) -> Result<Option<f64>> {
        let Some(period) = self
            .persistence
            .get_open_usage_period(&environment.id)
            .await?
        else {
            return Ok(None);
        };

        let cost = period_cost(period.hourly_rate, period.period_start, at);
        if !self
            .persistence
            .close_usage_period(&period.id, at, cost)
            .await?
        {
            // Closed concurrently; the other closer billed it.
            return Ok(None);
        }
        self.persistence
            .add_environment_cost(&environment.id, cost)
            .await?;

        let nanocredits = credits_to_nanocredits(cost);
        if nanocredits > 0 {
            let seconds = (at - period.period_start).num_seconds().max(0);
            self.charge(Charge {
                user_id: &period.user_id,
                environment_id: Some(&environment.id),
                service: "environment",
                operation: "instance_hours",
                units: seconds,
                cost_nanocredits: nanocredits,
            })
            .await;
        }

        info!(
            environment_id = %environment.id,
            period_id = %period.id,
            cost,
            "Usage period closed"
        );
        Ok(Some(cost))
    }
}

fn ceil_div(numerator: i64, denominator: i64) -> i64 {
    (numerator + denominator - 1) / denominator
}

/// Whole credits to nanocredits.
pub fn credits_to_nanocredits(credits: f64) -> i64 {
    (credits * NANOCREDITS_PER_CREDIT as f64).round() as i64
}

/// Nanocredits to credits, for display.
pub fn nanocredits_to_credits(nanocredits: i64) -> f64 {
    nanocredits as f64 / NANOCREDITS_PER_CREDIT as f64
}

/// Lambda cost: requests plus GB-seconds of the billed duration.
pub fn lambda_cost(billed_duration_ms: i64, memory_mb: i64, requests: i64) -> i64 {
    // GB-s = memory_mb / 1024 * duration_ms / 1000, priced in tenths.
    let compute = ceil_div(
        memory_mb.max(0) * billed_duration_ms.max(0) * LAMBDA_GB_SECOND_DECI_NANO,
        1024 * 1000 * 10,
    );
    (compute + requests * LAMBDA_REQUEST_NANO).max(1)
}

/// Capacity units for one item: `max(1, ceil(kb / 4))`, with the size
/// rounded up to whole KB.
pub fn dynamodb_units(item_bytes: usize) -> i64 {
    let kb = ceil_div(item_bytes as i64, 1024);
    ceil_div(kb, 4).max(1)
}

/// DynamoDB cost for `ops` operations on items of `item_bytes`.
pub fn dynamodb_cost(op: DynamoOp, item_bytes: usize, ops: i64) -> i64 {
    dynamodb_unit_cost(op, ops * dynamodb_units(item_bytes))
}

/// DynamoDB cost of `units` capacity units.
pub fn dynamodb_unit_cost(op: DynamoOp, units: i64) -> i64 {
    let unit = match op {
        DynamoOp::Read => DYNAMODB_READ_UNIT_NANO,
        DynamoOp::Write => DYNAMODB_WRITE_UNIT_NANO,
    };
    (units * unit).max(1)
}

/// SQS cost for `requests` API requests.
pub fn sqs_cost(requests: i64) -> i64 {
    (requests * SQS_REQUEST_NANO).max(1)
}

/// S3 cost for `requests` requests of one class.
pub fn s3_cost(op: S3Op, requests: i64) -> i64 {
    let unit = match op {
        S3Op::Read => S3_READ_REQUEST_NANO,
        S3Op::Write => S3_WRITE_REQUEST_NANO,
    };
    (requests * unit).max(1)
}

/// Cost of EC2/VPC wiring actions.
pub fn wiring_cost(actions: i64) -> i64 {
    (actions * WIRING_ACTION_NANO).max(1)
}

/// `round(hourly_rate * elapsed_hours, 2)` credits.
pub fn period_cost(hourly_rate: f64, start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let hours = (end - start).num_milliseconds().max(0) as f64 / 3_600_000.0;
    (hourly_rate * hours * 100.0).round() / 100.0
}

/// Monthly usage pattern to price.
#[derive(Debug, Clone, Default)]
pub struct UsageEstimate {
    pub lambda_invocations: i64,
    pub lambda_avg_duration_ms: i64,
    pub lambda_memory_mb: i64,
    pub dynamodb_reads: i64,
    pub dynamodb_writes: i64,
    pub sqs_requests: i64,
    pub s3_reads: i64,
    pub s3_writes: i64,
    pub wiring_actions: i64,
    /// Hourly rate of an environment kept running all month.
    pub environment_hourly_rate: f64,
    pub environment_hours: i64,
}

/// Per-service nanocredit breakdown of a monthly usage pattern, with a
/// `total` entry.
pub fn estimate_monthly_cost(usage: &UsageEstimate) -> BTreeMap<&'static str, i64> {
    let mut costs = BTreeMap::new();
    if usage.lambda_invocations > 0 {
        let per_call = lambda_cost(usage.lambda_avg_duration_ms, usage.lambda_memory_mb, 0);
        costs.insert(
            "lambda",
            per_call * usage.lambda_invocations + usage.lambda_invocations * LAMBDA_REQUEST_NANO,
        );
    }
    if usage.dynamodb_reads > 0 {
        costs.insert(
            "dynamodb_reads",
            dynamodb_cost(DynamoOp::Read, 0, usage.dynamodb_reads),
        );
    }
    if usage.dynamodb_writes > 0 {
        costs.insert(
            "dynamodb_writes",
            dynamodb_cost(DynamoOp::Write, 0, usage.dynamodb_writes),
        );
    }
    if usage.sqs_requests > 0 {
        costs.insert("sqs", sqs_cost(usage.sqs_requests));
    }
    if usage.s3_reads > 0 {
        costs.insert("s3_reads", s3_cost(S3Op::Read, usage.s3_reads));
    }
    if usage.s3_writes > 0 {
        costs.insert("s3_writes", s3_cost(S3Op::Write, usage.s3_writes));
    }
    if usage.wiring_actions > 0 {
        costs.insert("ec2", wiring_cost(usage.wiring_actions));
    }
    if usage.environment_hours > 0 {
        costs.insert(
            "environment",
            credits_to_nanocredits(usage.environment_hourly_rate * usage.environment_hours as f64),
        );
    }
    let total = costs.values().sum();
    costs.insert("total", total);
    costs
}
