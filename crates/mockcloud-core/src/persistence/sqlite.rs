// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use tracing::info;

use crate::error::CoreError;

use super::{
    BackingHandleRecord, BillingEventRecord, ClaimOutcome, DnsRecordRow, DynamoItemRecord,
    DynamoTableRecord, EnvironmentRecord, ExecutionRecord, LambdaFunctionRecord,
    LambdaInvocationRecord, NewBackingHandle, Persistence, PortAllocationRecord, ResourceTable,
    S3BucketRecord, S3ObjectRecord, SecurityGroupRuleRecord, SqsMessageCounts, SqsMessageRecord,
    SqsQueueRecord, SqsQueueSettings, UsagePeriodRecord, VpcResourceRecord,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, then
    /// runs all migrations.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/mockcloud.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let path_str = path.to_string_lossy();
        let url = format!("sqlite:{}?mode=rwc", path_str);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        info!(path = %path_str, "SQLite persistence ready");
        Ok(Self { pool })
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn insert_environment(&self, env: &EnvironmentRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO environments
                (id, user_id, name, status, services, endpoints, hourly_rate, total_cost,
                 auto_shutdown_hours, error, created_at, started_at, stopped_at, last_activity)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&env.id)
        .bind(&env.user_id)
        .bind(&env.name)
        .bind(&env.status)
        .bind(&env.services)
        .bind(&env.endpoints)
        .bind(env.hourly_rate)
        .bind(env.total_cost)
        .bind(env.auto_shutdown_hours)
        .bind(&env.error)
        .bind(env.created_at)
        .bind(env.started_at)
        .bind(env.stopped_at)
        .bind(env.last_activity)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_environment(&self, id: &str) -> Result<Option<EnvironmentRecord>, CoreError> {
        let record = sqlx::query_as::<_, EnvironmentRecord>(
            r#"
            SELECT * FROM environments WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_environments(
        &self,
        user_id: Option<&str>,
        status: Option<&str>,
    ) -> Result<Vec<EnvironmentRecord>, CoreError> {
        let records = sqlx::query_as::<_, EnvironmentRecord>(
            r#"
            SELECT * FROM environments
            WHERE (? IS NULL OR user_id = ?)
              AND (? IS NULL OR status = ?)
            ORDER BY created_at DESC, id
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .bind(status)
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn transition_environment(
        &self,
        id: &str,
        from: &str,
        to: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let started_at = (to == "running").then_some(at);
        let stopped_at = (to == "stopped").then_some(at);

        let result = sqlx::query(
            r#"
            UPDATE environments
            SET status = ?,
                started_at = COALESCE(?, started_at),
                stopped_at = COALESCE(?, stopped_at),
                last_activity = COALESCE(?, last_activity)
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(to)
        .bind(started_at)
        .bind(stopped_at)
        .bind(started_at)
        .bind(id)
        .bind(from)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_environment_error(&self, id: &str, message: &str) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE environments
            SET status = 'error', error = ?
            WHERE id = ? AND status NOT IN ('destroyed', 'destroying')
            "#,
        )
        .bind(message)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_environment_endpoints(&self, id: &str, endpoints: &str) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE environments SET endpoints = ? WHERE id = ?
            "#,
        )
        .bind(endpoints)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn touch_environment(&self, id: &str, at: DateTime<Utc>) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE environments SET last_activity = ? WHERE id = ?
            "#,
        )
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn add_environment_cost(&self, id: &str, cost: f64) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE environments SET total_cost = total_cost + ? WHERE id = ?
            "#,
        )
        .bind(cost)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn claim_backing_handle(
        &self,
        claim: &NewBackingHandle,
    ) -> Result<ClaimOutcome, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO backing_handles
                (environment_id, name, kind, state, parent_name, created_at)
            SELECT ?, ?, ?, 'materializing', ?, ?
            WHERE EXISTS (
                SELECT 1 FROM environments
                WHERE id = ? AND status IN ('provisioning', 'running')
            )
            "#,
        )
        .bind(&claim.environment_id)
        .bind(&claim.name)
        .bind(&claim.kind)
        .bind(&claim.parent_name)
        .bind(Utc::now())
        .bind(&claim.environment_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() > 0 => Ok(ClaimOutcome::Claimed),
            Ok(_) => Ok(ClaimOutcome::Inactive),
            Err(e) => match CoreError::from(e) {
                CoreError::UniqueViolation { .. } => Ok(ClaimOutcome::Taken),
                other => Err(other),
            },
        }
    }

    async fn complete_backing_handle(
        &self,
        environment_id: &str,
        name: &str,
        handle_id: &str,
        port: Option<i32>,
        endpoint: Option<&str>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE backing_handles
            SET state = 'live', handle_id = ?, port = ?, endpoint = ?
            WHERE environment_id = ? AND name = ?
            "#,
        )
        .bind(handle_id)
        .bind(port)
        .bind(endpoint)
        .bind(environment_id)
        .bind(name)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_backing_handle(
        &self,
        environment_id: &str,
        name: &str,
    ) -> Result<Option<BackingHandleRecord>, CoreError> {
        let record = sqlx::query_as::<_, BackingHandleRecord>(
            r#"
            SELECT * FROM backing_handles WHERE environment_id = ? AND name = ?
            "#,
        )
        .bind(environment_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_backing_handles(
        &self,
        environment_id: &str,
    ) -> Result<Vec<BackingHandleRecord>, CoreError> {
        let records = sqlx::query_as::<_, BackingHandleRecord>(
            r#"
            SELECT * FROM backing_handles
            WHERE environment_id = ?
            ORDER BY created_at, name
            "#,
        )
        .bind(environment_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn set_backing_handles_state(
        &self,
        environment_id: &str,
        from: &str,
        to: &str,
    ) -> Result<u64, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE backing_handles SET state = ?
            WHERE environment_id = ? AND state = ?
            "#,
        )
        .bind(to)
        .bind(environment_id)
        .bind(from)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn delete_backing_handle(
        &self,
        environment_id: &str,
        name: &str,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            DELETE FROM backing_handles WHERE environment_id = ? AND name = ?
            "#,
        )
        .bind(environment_id)
        .bind(name)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn attach_backing_handle(
        &self,
        table: ResourceTable,
        id: &str,
        handle: &str,
    ) -> Result<bool, CoreError> {
        let sql = format!(
            r#"
            UPDATE {} SET backing_handle = ? WHERE id = ? AND backing_handle IS NULL
            "#,
            table.table_name()
        );
        let result = sqlx::query(&sql)
            .bind(handle)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn detach_backing_handle(&self, table: ResourceTable, id: &str) -> Result<(), CoreError> {
        let sql = format!(
            r#"
            UPDATE {} SET backing_handle = NULL WHERE id = ?
            "#,
            table.table_name()
        );
        sqlx::query(&sql).bind(id).execute(&self.pool).await?;

        Ok(())
    }

    async fn list_active_ports(&self, lo: i32, hi: i32) -> Result<Vec<i32>, CoreError> {
        let ports: Vec<(i32,)> = sqlx::query_as(
            r#"
            SELECT port FROM port_allocations
            WHERE is_active = TRUE AND port BETWEEN ? AND ?
            ORDER BY port
            "#,
        )
        .bind(lo)
        .bind(hi)
        .fetch_all(&self.pool)
        .await?;

        Ok(ports.into_iter().map(|(p,)| p).collect())
    }

    async fn insert_port_allocation(
        &self,
        port: i32,
        environment_id: &str,
        service_name: &str,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO port_allocations (port, environment_id, service_name, is_active, allocated_at)
            VALUES (?, ?, ?, TRUE, ?)
            "#,
        )
        .bind(port)
        .bind(environment_id)
        .bind(service_name)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn release_port(&self, port: i32, at: DateTime<Utc>) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE port_allocations SET is_active = FALSE, released_at = ?
            WHERE port = ? AND is_active = TRUE
            "#,
        )
        .bind(at)
        .bind(port)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_environment_ports(
        &self,
        environment_id: &str,
        at: DateTime<Utc>,
    ) -> Result<u64, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE port_allocations SET is_active = FALSE, released_at = ?
            WHERE environment_id = ? AND is_active = TRUE
            "#,
        )
        .bind(at)
        .bind(environment_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn list_port_allocations(
        &self,
        environment_id: &str,
    ) -> Result<Vec<PortAllocationRecord>, CoreError> {
        let records = sqlx::query_as::<_, PortAllocationRecord>(
            r#"
            SELECT * FROM port_allocations WHERE environment_id = ? ORDER BY id
            "#,
        )
        .bind(environment_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn open_usage_period(&self, period: &UsagePeriodRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO usage_periods
                (id, environment_id, user_id, period_start, period_end, hourly_rate, cost)
            VALUES (?, ?, ?, ?, NULL, ?, NULL)
            "#,
        )
        .bind(&period.id)
        .bind(&period.environment_id)
        .bind(&period.user_id)
        .bind(period.period_start)
        .bind(period.hourly_rate)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_open_usage_period(
        &self,
        environment_id: &str,
    ) -> Result<Option<UsagePeriodRecord>, CoreError> {
        let record = sqlx::query_as::<_, UsagePeriodRecord>(
            r#"
            SELECT * FROM usage_periods WHERE environment_id = ? AND period_end IS NULL
            "#,
        )
        .bind(environment_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn close_usage_period(
        &self,
        id: &str,
        end: DateTime<Utc>,
        cost: f64,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE usage_periods SET period_end = ?, cost = ?
            WHERE id = ? AND period_end IS NULL
            "#,
        )
        .bind(end)
        .bind(cost)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_usage_periods(
        &self,
        environment_id: &str,
    ) -> Result<Vec<UsagePeriodRecord>, CoreError> {
        let records = sqlx::query_as::<_, UsagePeriodRecord>(
            r#"
            SELECT * FROM usage_periods WHERE environment_id = ? ORDER BY period_start, id
            "#,
        )
        .bind(environment_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn get_balance(&self, user_id: &str) -> Result<i64, CoreError> {
        let balance: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT balance_nanocredits FROM accounts WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(balance.map(|(b,)| b).unwrap_or(0))
    }

    async fn credit_account(
        &self,
        user_id: &str,
        amount: i64,
        at: DateTime<Utc>,
    ) -> Result<i64, CoreError> {
        sqlx::query(
            r#"
            INSERT INTO accounts (user_id, balance_nanocredits, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (user_id) DO UPDATE
            SET balance_nanocredits = accounts.balance_nanocredits + excluded.balance_nanocredits,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .bind(at)
        .execute(&self.pool)
        .await?;

        self.get_balance(user_id).await
    }

    async fn debit_account(
        &self,
        user_id: &str,
        amount: i64,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET balance_nanocredits = balance_nanocredits - ?, updated_at = ?
            WHERE user_id = ? AND balance_nanocredits >= ?
            "#,
        )
        .bind(amount)
        .bind(at)
        .bind(user_id)
        .bind(amount)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_billing_event(&self, event: &BillingEventRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO billing_events
                (id, user_id, environment_id, service, operation, units, cost_nanocredits,
                 status, attempts, error, created_at, reconciled_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(&event.user_id)
        .bind(&event.environment_id)
        .bind(&event.service)
        .bind(&event.operation)
        .bind(event.units)
        .bind(event.cost_nanocredits)
        .bind(&event.status)
        .bind(event.attempts)
        .bind(&event.error)
        .bind(event.created_at)
        .bind(event.reconciled_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_billing_event(
        &self,
        id: &str,
        status: &str,
        error: Option<&str>,
        reconciled_at: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE billing_events
            SET status = ?, error = ?, reconciled_at = ?, attempts = attempts + 1
            WHERE id = ?
            "#,
        )
        .bind(status)
        .bind(error)
        .bind(reconciled_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_unsettled_billing_events(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<BillingEventRecord>, CoreError> {
        // Timestamps are stored as text; the cutoff is applied here.
        let records = sqlx::query_as::<_, BillingEventRecord>(
            r#"
            SELECT * FROM billing_events
            WHERE status <> 'applied' AND reconciled_at IS NULL
            ORDER BY created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records
            .into_iter()
            .filter(|e| e.created_at < before)
            .take(usize::try_from(limit).unwrap_or(0))
            .collect())
    }

    async fn list_billing_events(
        &self,
        environment_id: &str,
    ) -> Result<Vec<BillingEventRecord>, CoreError> {
        let records = sqlx::query_as::<_, BillingEventRecord>(
            r#"
            SELECT * FROM billing_events WHERE environment_id = ? ORDER BY created_at, id
            "#,
        )
        .bind(environment_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn insert_vpc_resource(&self, resource: &VpcResourceRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO vpc_resources
                (id, environment_id, kind, parent_id, name, description, cidr_block,
                 availability_zone, state, attributes, backing_handle, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&resource.id)
        .bind(&resource.environment_id)
        .bind(&resource.kind)
        .bind(&resource.parent_id)
        .bind(&resource.name)
        .bind(&resource.description)
        .bind(&resource.cidr_block)
        .bind(&resource.availability_zone)
        .bind(&resource.state)
        .bind(&resource.attributes)
        .bind(&resource.backing_handle)
        .bind(resource.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_vpc_resource(
        &self,
        environment_id: &str,
        kind: &str,
        id: &str,
    ) -> Result<Option<VpcResourceRecord>, CoreError> {
        let record = sqlx::query_as::<_, VpcResourceRecord>(
            r#"
            SELECT * FROM vpc_resources WHERE environment_id = ? AND kind = ? AND id = ?
            "#,
        )
        .bind(environment_id)
        .bind(kind)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_vpc_resources(
        &self,
        environment_id: &str,
        kind: &str,
    ) -> Result<Vec<VpcResourceRecord>, CoreError> {
        let records = sqlx::query_as::<_, VpcResourceRecord>(
            r#"
            SELECT * FROM vpc_resources
            WHERE environment_id = ? AND kind = ?
            ORDER BY created_at, id
            "#,
        )
        .bind(environment_id)
        .bind(kind)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn update_vpc_resource(
        &self,
        id: &str,
        state: &str,
        parent_id: Option<&str>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE vpc_resources SET state = ?, parent_id = COALESCE(?, parent_id) WHERE id = ?
            "#,
        )
        .bind(state)
        .bind(parent_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn transition_vpc_resource(
        &self,
        id: &str,
        from: &str,
        to: &str,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE vpc_resources SET state = ? WHERE id = ? AND state = ?
            "#,
        )
        .bind(to)
        .bind(id)
        .bind(from)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_vpc_resource(&self, id: &str) -> Result<bool, CoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM security_group_rules WHERE group_id = ?
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"
            DELETE FROM vpc_resources WHERE id = ?
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_security_group_rule(
        &self,
        rule: &SecurityGroupRuleRecord,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO security_group_rules
                (group_id, ip_protocol, from_port, to_port, cidr_ip, backing_handle, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&rule.group_id)
        .bind(&rule.ip_protocol)
        .bind(rule.from_port)
        .bind(rule.to_port)
        .bind(&rule.cidr_ip)
        .bind(&rule.backing_handle)
        .bind(rule.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_security_group_rules(
        &self,
        group_id: &str,
    ) -> Result<Vec<SecurityGroupRuleRecord>, CoreError> {
        let records = sqlx::query_as::<_, SecurityGroupRuleRecord>(
            r#"
            SELECT * FROM security_group_rules WHERE group_id = ? ORDER BY id
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn insert_dynamo_table(&self, table: &DynamoTableRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO dynamodb_tables
                (id, environment_id, name, status, key_schema, attribute_definitions,
                 billing_mode, item_count, table_size_bytes, backing_handle, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&table.id)
        .bind(&table.environment_id)
        .bind(&table.name)
        .bind(&table.status)
        .bind(&table.key_schema)
        .bind(&table.attribute_definitions)
        .bind(&table.billing_mode)
        .bind(table.item_count)
        .bind(table.table_size_bytes)
        .bind(&table.backing_handle)
        .bind(table.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_dynamo_table(
        &self,
        environment_id: &str,
        name: &str,
    ) -> Result<Option<DynamoTableRecord>, CoreError> {
        let record = sqlx::query_as::<_, DynamoTableRecord>(
            r#"
            SELECT * FROM dynamodb_tables WHERE environment_id = ? AND name = ?
            "#,
        )
        .bind(environment_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_dynamo_tables(
        &self,
        environment_id: &str,
    ) -> Result<Vec<DynamoTableRecord>, CoreError> {
        let records = sqlx::query_as::<_, DynamoTableRecord>(
            r#"
            SELECT * FROM dynamodb_tables WHERE environment_id = ? ORDER BY name
            "#,
        )
        .bind(environment_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn delete_dynamo_table(&self, table_id: &str) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM dynamodb_items WHERE table_id = ?
            "#,
        )
        .bind(table_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM dynamodb_tables WHERE id = ?
            "#,
        )
        .bind(table_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn put_dynamo_item(
        &self,
        item: &DynamoItemRecord,
    ) -> Result<Option<DynamoItemRecord>, CoreError> {
        let mut tx = self.pool.begin().await?;

        let previous = sqlx::query_as::<_, DynamoItemRecord>(
            r#"
            SELECT * FROM dynamodb_items
            WHERE table_id = ? AND partition_key = ? AND sort_key = ?
            "#,
        )
        .bind(&item.table_id)
        .bind(&item.partition_key)
        .bind(&item.sort_key)
        .fetch_optional(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO dynamodb_items (table_id, partition_key, sort_key, item, size_bytes, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (table_id, partition_key, sort_key) DO UPDATE
            SET item = excluded.item, size_bytes = excluded.size_bytes, updated_at = excluded.updated_at
            "#,
        )
        .bind(&item.table_id)
        .bind(&item.partition_key)
        .bind(&item.sort_key)
        .bind(&item.item)
        .bind(item.size_bytes)
        .bind(item.updated_at)
        .execute(&mut *tx)
        .await?;

        let (count_delta, size_delta) = match &previous {
            Some(old) => (0_i64, item.size_bytes - old.size_bytes),
            None => (1_i64, item.size_bytes),
        };
        sqlx::query(
            r#"
            UPDATE dynamodb_tables
            SET item_count = item_count + ?, table_size_bytes = table_size_bytes + ?
            WHERE id = ?
            "#,
        )
        .bind(count_delta)
        .bind(size_delta)
        .bind(&item.table_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(previous)
    }

    async fn get_dynamo_item(
        &self,
        table_id: &str,
        partition_key: &str,
        sort_key: &str,
    ) -> Result<Option<DynamoItemRecord>, CoreError> {
        let record = sqlx::query_as::<_, DynamoItemRecord>(
            r#"
            SELECT * FROM dynamodb_items
            WHERE table_id = ? AND partition_key = ? AND sort_key = ?
            "#,
        )
        .bind(table_id)
        .bind(partition_key)
        .bind(sort_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn delete_dynamo_item(
        &self,
        table_id: &str,
        partition_key: &str,
        sort_key: &str,
    ) -> Result<Option<DynamoItemRecord>, CoreError> {
        let mut tx = self.pool.begin().await?;

        let previous = sqlx::query_as::<_, DynamoItemRecord>(
            r#"
            SELECT * FROM dynamodb_items
            WHERE table_id = ? AND partition_key = ? AND sort_key = ?
            "#,
        )
        .bind(table_id)
        .bind(partition_key)
        .bind(sort_key)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(old) = &previous {
            sqlx::query(
                r#"
                DELETE FROM dynamodb_items
                WHERE table_id = ? AND partition_key = ? AND sort_key = ?
                "#,
            )
            .bind(table_id)
            .bind(partition_key)
            .bind(sort_key)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                UPDATE dynamodb_tables
                SET item_count = item_count - 1, table_size_bytes = table_size_bytes - ?
                WHERE id = ?
                "#,
            )
            .bind(old.size_bytes)
            .bind(table_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(previous)
    }

    async fn list_dynamo_items(
        &self,
        table_id: &str,
        partition_key: Option<&str>,
    ) -> Result<Vec<DynamoItemRecord>, CoreError> {
        let records = sqlx::query_as::<_, DynamoItemRecord>(
            r#"
            SELECT * FROM dynamodb_items
            WHERE table_id = ? AND (? IS NULL OR partition_key = ?)
            ORDER BY partition_key, sort_key
            "#,
        )
        .bind(table_id)
        .bind(partition_key)
        .bind(partition_key)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn insert_s3_bucket(&self, bucket: &S3BucketRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO s3_buckets
                (id, environment_id, name, object_count, total_size_bytes, backing_handle, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&bucket.id)
        .bind(&bucket.environment_id)
        .bind(&bucket.name)
        .bind(bucket.object_count)
        .bind(bucket.total_size_bytes)
        .bind(&bucket.backing_handle)
        .bind(bucket.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_s3_bucket(
        &self,
        environment_id: &str,
        name: &str,
    ) -> Result<Option<S3BucketRecord>, CoreError> {
        let record = sqlx::query_as::<_, S3BucketRecord>(
            r#"
            SELECT * FROM s3_buckets WHERE environment_id = ? AND name = ?
            "#,
        )
        .bind(environment_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_s3_buckets(
        &self,
        environment_id: &str,
    ) -> Result<Vec<S3BucketRecord>, CoreError> {
        let records = sqlx::query_as::<_, S3BucketRecord>(
            r#"
            SELECT * FROM s3_buckets WHERE environment_id = ? ORDER BY name
            "#,
        )
        .bind(environment_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn delete_s3_bucket(&self, bucket_id: &str) -> Result<bool, CoreError> {
        // Object writers hold the bucket row for their whole transaction,
        // so the count seen here is settled.
        let result = sqlx::query(
            r#"
            DELETE FROM s3_buckets WHERE id = ? AND object_count = 0
            "#,
        )
        .bind(bucket_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn put_s3_object(
        &self,
        object: &S3ObjectRecord,
    ) -> Result<Option<S3ObjectRecord>, CoreError> {
        let mut tx = self.pool.begin().await?;

        // Takes the bucket row first so writers to one bucket serialize.
        let locked = sqlx::query(
            r#"
            UPDATE s3_buckets SET object_count = object_count WHERE id = ?
            "#,
        )
        .bind(&object.bucket_id)
        .execute(&mut *tx)
        .await?;
        if locked.rows_affected() == 0 {
            return Err(CoreError::not_found("bucket", &object.bucket_id));
        }

        let previous = sqlx::query_as::<_, S3ObjectRecord>(
            r#"
            SELECT * FROM s3_objects WHERE bucket_id = ? AND object_key = ?
            "#,
        )
        .bind(&object.bucket_id)
        .bind(&object.object_key)
        .fetch_optional(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO s3_objects
                (bucket_id, object_key, body, etag, content_type, size_bytes, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (bucket_id, object_key) DO UPDATE
            SET body = excluded.body, etag = excluded.etag, content_type = excluded.content_type,
                size_bytes = excluded.size_bytes, updated_at = excluded.updated_at
            "#,
        )
        .bind(&object.bucket_id)
        .bind(&object.object_key)
        .bind(&object.body)
        .bind(&object.etag)
        .bind(&object.content_type)
        .bind(object.size_bytes)
        .bind(object.updated_at)
        .execute(&mut *tx)
        .await?;

        let (count_delta, size_delta) = match &previous {
            Some(old) => (0_i64, object.size_bytes - old.size_bytes),
            None => (1_i64, object.size_bytes),
        };
        sqlx::query(
            r#"
            UPDATE s3_buckets
            SET object_count = object_count + ?, total_size_bytes = total_size_bytes + ?
            WHERE id = ?
            "#,
        )
        .bind(count_delta)
        .bind(size_delta)
        .bind(&object.bucket_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(previous)
    }

    async fn get_s3_object(
        &self,
        bucket_id: &str,
        object_key: &str,
    ) -> Result<Option<S3ObjectRecord>, CoreError> {
        let record = sqlx::query_as::<_, S3ObjectRecord>(
            r#"
            SELECT * FROM s3_objects WHERE bucket_id = ? AND object_key = ?
            "#,
        )
        .bind(bucket_id)
        .bind(object_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn delete_s3_object(
        &self,
        bucket_id: &str,
        object_key: &str,
    ) -> Result<Option<S3ObjectRecord>, CoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE s3_buckets SET object_count = object_count WHERE id = ?
            "#,
        )
        .bind(bucket_id)
        .execute(&mut *tx)
        .await?;

        let previous = sqlx::query_as::<_, S3ObjectRecord>(
            r#"
            SELECT * FROM s3_objects WHERE bucket_id = ? AND object_key = ?
            "#,
        )
        .bind(bucket_id)
        .bind(object_key)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(old) = &previous {
            sqlx::query(
                r#"
                DELETE FROM s3_objects WHERE bucket_id = ? AND object_key = ?
                "#,
            )
            .bind(bucket_id)
            .bind(object_key)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                UPDATE s3_buckets
                SET object_count = object_count - 1, total_size_bytes = total_size_bytes - ?
                WHERE id = ?
                "#,
            )
            .bind(old.size_bytes)
            .bind(bucket_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(previous)
    }

    async fn list_s3_objects(
        &self,
        bucket_id: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<S3ObjectRecord>, CoreError> {
        let records = sqlx::query_as::<_, S3ObjectRecord>(
            r#"
            SELECT bucket_id, object_key, X'' AS body, etag, content_type, size_bytes, updated_at
            FROM s3_objects
            WHERE bucket_id = ? AND (? IS NULL OR substr(object_key, 1, length(?)) = ?)
            ORDER BY object_key
            "#,
        )
        .bind(bucket_id)
        .bind(prefix)
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn insert_sqs_queue(&self, queue: &SqsQueueRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO sqs_queues
                (id, environment_id, name, url, arn, fifo, visibility_timeout,
                 message_retention_period, delay_seconds, receive_wait_time, attributes,
                 backing_handle, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&queue.id)
        .bind(&queue.environment_id)
        .bind(&queue.name)
        .bind(&queue.url)
        .bind(&queue.arn)
        .bind(queue.fifo)
        .bind(queue.visibility_timeout)
        .bind(queue.message_retention_period)
        .bind(queue.delay_seconds)
        .bind(queue.receive_wait_time)
        .bind(&queue.attributes)
        .bind(&queue.backing_handle)
        .bind(queue.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_sqs_queue(
        &self,
        environment_id: &str,
        name: &str,
    ) -> Result<Option<SqsQueueRecord>, CoreError> {
        let record = sqlx::query_as::<_, SqsQueueRecord>(
            r#"
            SELECT * FROM sqs_queues WHERE environment_id = ? AND name = ?
            "#,
        )
        .bind(environment_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_sqs_queues(&self, environment_id: &str) -> Result<Vec<SqsQueueRecord>, CoreError> {
        let records = sqlx::query_as::<_, SqsQueueRecord>(
            r#"
            SELECT * FROM sqs_queues WHERE environment_id = ? ORDER BY name
            "#,
        )
        .bind(environment_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn update_sqs_queue_settings(
        &self,
        queue_id: &str,
        settings: &SqsQueueSettings,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE sqs_queues
            SET visibility_timeout = ?, message_retention_period = ?, delay_seconds = ?,
                receive_wait_time = ?, attributes = ?
            WHERE id = ?
            "#,
        )
        .bind(settings.visibility_timeout)
        .bind(settings.message_retention_period)
        .bind(settings.delay_seconds)
        .bind(settings.receive_wait_time)
        .bind(&settings.attributes)
        .bind(queue_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_sqs_queue(&self, queue_id: &str) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM sqs_messages WHERE queue_id = ?
            "#,
        )
        .bind(queue_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM sqs_queues WHERE id = ?
            "#,
        )
        .bind(queue_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn insert_sqs_message(&self, message: &SqsMessageRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO sqs_messages
                (message_id, queue_id, body, md5_of_body, receipt_handle, sent_at_ms,
                 visible_at_ms, receive_count, message_group_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.message_id)
        .bind(&message.queue_id)
        .bind(&message.body)
        .bind(&message.md5_of_body)
        .bind(&message.receipt_handle)
        .bind(message.sent_at_ms)
        .bind(message.visible_at_ms)
        .bind(message.receive_count)
        .bind(&message.message_group_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_visible_sqs_messages(
        &self,
        queue_id: &str,
        now_ms: i64,
        limit: i64,
    ) -> Result<Vec<SqsMessageRecord>, CoreError> {
        let records = sqlx::query_as::<_, SqsMessageRecord>(
            r#"
            SELECT * FROM sqs_messages
            WHERE queue_id = ? AND visible_at_ms <= ?
            ORDER BY sent_at_ms, message_id
            LIMIT ?
            "#,
        )
        .bind(queue_id)
        .bind(now_ms)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn claim_sqs_message(
        &self,
        message_id: &str,
        expected_visible_at_ms: i64,
        new_visible_at_ms: i64,
        receipt_handle: &str,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sqs_messages
            SET visible_at_ms = ?, receipt_handle = ?, receive_count = receive_count + 1
            WHERE message_id = ? AND visible_at_ms = ?
            "#,
        )
        .bind(new_visible_at_ms)
        .bind(receipt_handle)
        .bind(message_id)
        .bind(expected_visible_at_ms)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_sqs_message(
        &self,
        queue_id: &str,
        receipt_handle: &str,
        now_ms: i64,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM sqs_messages
            WHERE queue_id = ? AND receipt_handle = ? AND visible_at_ms > ?
            "#,
        )
        .bind(queue_id)
        .bind(receipt_handle)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn change_sqs_message_visibility(
        &self,
        queue_id: &str,
        receipt_handle: &str,
        now_ms: i64,
        new_visible_at_ms: i64,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sqs_messages SET visible_at_ms = ?
            WHERE queue_id = ? AND receipt_handle = ? AND visible_at_ms > ?
            "#,
        )
        .bind(new_visible_at_ms)
        .bind(queue_id)
        .bind(receipt_handle)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn purge_sqs_queue(&self, queue_id: &str) -> Result<u64, CoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM sqs_messages WHERE queue_id = ?
            "#,
        )
        .bind(queue_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn count_sqs_messages(
        &self,
        queue_id: &str,
        now_ms: i64,
    ) -> Result<SqsMessageCounts, CoreError> {
        let (visible, in_flight, delayed): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN visible_at_ms <= ? THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN visible_at_ms > ? AND receive_count > 0 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN visible_at_ms > ? AND receive_count = 0 THEN 1 ELSE 0 END), 0)
            FROM sqs_messages
            WHERE queue_id = ?
            "#,
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(now_ms)
        .bind(queue_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(SqsMessageCounts {
            visible,
            in_flight,
            delayed,
        })
    }

    async fn expire_sqs_messages(
        &self,
        queue_id: &str,
        sent_before_ms: i64,
    ) -> Result<u64, CoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM sqs_messages WHERE queue_id = ? AND sent_at_ms < ?
            "#,
        )
        .bind(queue_id)
        .bind(sent_before_ms)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn insert_lambda_function(
        &self,
        function: &LambdaFunctionRecord,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO lambda_functions
                (id, environment_id, name, arn, runtime, handler, role, description, code_zip,
                 code_size, code_sha256, memory_size, timeout, environment_vars, state,
                 last_update_status, backing_handle, created_at, last_modified)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&function.id)
        .bind(&function.environment_id)
        .bind(&function.name)
        .bind(&function.arn)
        .bind(&function.runtime)
        .bind(&function.handler)
        .bind(&function.role)
        .bind(&function.description)
        .bind(&function.code_zip)
        .bind(function.code_size)
        .bind(&function.code_sha256)
        .bind(function.memory_size)
        .bind(function.timeout)
        .bind(&function.environment_vars)
        .bind(&function.state)
        .bind(&function.last_update_status)
        .bind(&function.backing_handle)
        .bind(function.created_at)
        .bind(function.last_modified)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_lambda_function(
        &self,
        environment_id: &str,
        name: &str,
    ) -> Result<Option<LambdaFunctionRecord>, CoreError> {
        let record = sqlx::query_as::<_, LambdaFunctionRecord>(
            r#"
            SELECT * FROM lambda_functions WHERE environment_id = ? AND name = ?
            "#,
        )
        .bind(environment_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_lambda_functions(
        &self,
        environment_id: &str,
    ) -> Result<Vec<LambdaFunctionRecord>, CoreError> {
        let records = sqlx::query_as::<_, LambdaFunctionRecord>(
            r#"
            SELECT * FROM lambda_functions WHERE environment_id = ? ORDER BY name
            "#,
        )
        .bind(environment_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn update_lambda_code(
        &self,
        function_id: &str,
        code_zip: &str,
        code_size: i64,
        code_sha256: &str,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE lambda_functions
            SET code_zip = ?, code_size = ?, code_sha256 = ?, last_modified = ?,
                last_update_status = 'Successful'
            WHERE id = ?
            "#,
        )
        .bind(code_zip)
        .bind(code_size)
        .bind(code_sha256)
        .bind(at)
        .bind(function_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_lambda_function(&self, function_id: &str) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            DELETE FROM lambda_functions WHERE id = ?
            "#,
        )
        .bind(function_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_lambda_invocation(
        &self,
        invocation: &LambdaInvocationRecord,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO lambda_invocations
                (id, function_id, invocation_type, payload, response, status_code, duration_ms,
                 billed_duration_ms, memory_used_mb, function_error, error_message, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&invocation.id)
        .bind(&invocation.function_id)
        .bind(&invocation.invocation_type)
        .bind(&invocation.payload)
        .bind(&invocation.response)
        .bind(invocation.status_code)
        .bind(invocation.duration_ms)
        .bind(invocation.billed_duration_ms)
        .bind(invocation.memory_used_mb)
        .bind(&invocation.function_error)
        .bind(&invocation.error_message)
        .bind(invocation.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_lambda_invocations(
        &self,
        function_id: &str,
    ) -> Result<Vec<LambdaInvocationRecord>, CoreError> {
        let records = sqlx::query_as::<_, LambdaInvocationRecord>(
            r#"
            SELECT * FROM lambda_invocations WHERE function_id = ? ORDER BY created_at, id
            "#,
        )
        .bind(function_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn insert_execution(&self, execution: &ExecutionRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO executions
                (id, user_id, session_id, language, code, status, output, error, exit_code,
                 execution_time_ms, memory_used_mb, security_violations, container_id,
                 created_at, started_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.user_id)
        .bind(&execution.session_id)
        .bind(&execution.language)
        .bind(&execution.code)
        .bind(&execution.status)
        .bind(&execution.output)
        .bind(&execution.error)
        .bind(execution.exit_code)
        .bind(execution.execution_time_ms)
        .bind(execution.memory_used_mb)
        .bind(&execution.security_violations)
        .bind(&execution.container_id)
        .bind(execution.created_at)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_execution(&self, execution: &ExecutionRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE executions
            SET status = ?, output = ?, error = ?, exit_code = ?, execution_time_ms = ?,
                memory_used_mb = ?, security_violations = ?, container_id = ?,
                started_at = ?, completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&execution.status)
        .bind(&execution.output)
        .bind(&execution.error)
        .bind(execution.exit_code)
        .bind(execution.execution_time_ms)
        .bind(execution.memory_used_mb)
        .bind(&execution.security_violations)
        .bind(&execution.container_id)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(&execution.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<ExecutionRecord>, CoreError> {
        let record = sqlx::query_as::<_, ExecutionRecord>(
            r#"
            SELECT * FROM executions WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn insert_dns_record(&self, record: &DnsRecordRow) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO dns_records
                (id, environment_id, name, record_type, value, ttl, priority, weight, port, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.environment_id)
        .bind(&record.name)
        .bind(&record.record_type)
        .bind(&record.value)
        .bind(record.ttl)
        .bind(record.priority)
        .bind(record.weight)
        .bind(record.port)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_dns_records(&self, environment_id: &str) -> Result<Vec<DnsRecordRow>, CoreError> {
        let records = sqlx::query_as::<_, DnsRecordRow>(
            r#"
            SELECT * FROM dns_records WHERE environment_id = ? ORDER BY name, record_type, id
            "#,
        )
        .bind(environment_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn delete_dns_record(&self, environment_id: &str, id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM dns_records WHERE environment_id = ? AND id = ?
            "#,
        )
        .bind(environment_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_dns_records(
        &self,
        name: &str,
        record_type: &str,
    ) -> Result<Vec<DnsRecordRow>, CoreError> {
        let records = sqlx::query_as::<_, DnsRecordRow>(
            r#"
            SELECT r.* FROM dns_records r
            JOIN environments e ON e.id = r.environment_id
            WHERE r.name = ? AND r.record_type = ? AND e.status = 'running'
            ORDER BY r.created_at, r.id
            "#,
        )
        .bind(name)
        .bind(record_type)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        let (one,): (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(one == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    /// Create an in-memory SQLite pool for testing.
    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        MIGRATOR.run(&pool).await.expect("Failed to run migrations");

        pool
    }

    fn environment(id: &str, status: &str) -> EnvironmentRecord {
        let now = Utc::now();
        EnvironmentRecord {
            id: id.to_string(),
            user_id: "user-1".to_string(),
            name: format!("Environment {id}"),
            status: status.to_string(),
            services: r#"{"redis":{"version":"7"}}"#.to_string(),
            endpoints: "{}".to_string(),
            hourly_rate: 0.10,
            total_cost: 0.0,
            auto_shutdown_hours: 4,
            error: None,
            created_at: now,
            started_at: None,
            stopped_at: None,
            last_activity: now,
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_environment() {
        let persistence = SqlitePersistence::new(test_pool().await);
        persistence
            .insert_environment(&environment("env-a", "provisioning"))
            .await
            .expect("Failed to insert environment");

        let env = persistence
            .get_environment("env-a")
            .await
            .expect("Failed to get environment")
            .expect("Environment should exist");
        assert_eq!(env.status, "provisioning");
        assert_eq!(env.auto_shutdown_hours, 4);
        assert!(persistence.get_environment("env-missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let persistence = SqlitePersistence::new(test_pool().await);
        persistence
            .insert_environment(&environment("env-a", "provisioning"))
            .await
            .unwrap();

        let now = Utc::now();
        assert!(
            persistence
                .transition_environment("env-a", "provisioning", "running", now)
                .await
                .unwrap()
        );
        // Second transition from the stale status loses.
        assert!(
            !persistence
                .transition_environment("env-a", "provisioning", "running", now)
                .await
                .unwrap()
        );

        let env = persistence.get_environment("env-a").await.unwrap().unwrap();
        assert_eq!(env.status, "running");
        assert!(env.started_at.is_some());
        assert!(env.stopped_at.is_none());

        assert!(
            persistence
                .transition_environment("env-a", "running", "stopped", now)
                .await
                .unwrap()
        );
        let env = persistence.get_environment("env-a").await.unwrap().unwrap();
        assert!(env.stopped_at.is_some());
    }

    #[tokio::test]
    async fn test_mark_error_skips_destroyed() {
        let persistence = SqlitePersistence::new(test_pool().await);
        persistence
            .insert_environment(&environment("env-a", "destroyed"))
            .await
            .unwrap();
        assert!(!persistence.mark_environment_error("env-a", "boom").await.unwrap());

        persistence
            .insert_environment(&environment("env-b", "provisioning"))
            .await
            .unwrap();
        assert!(persistence.mark_environment_error("env-b", "boom").await.unwrap());
        let env = persistence.get_environment("env-b").await.unwrap().unwrap();
        assert_eq!(env.status, "error");
        assert_eq!(env.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_list_environments_filters() {
        let persistence = SqlitePersistence::new(test_pool().await);
        persistence
            .insert_environment(&environment("env-a", "running"))
            .await
            .unwrap();
        persistence
            .insert_environment(&environment("env-b", "stopped"))
            .await
            .unwrap();

        let all = persistence.list_environments(Some("user-1"), None).await.unwrap();
        assert_eq!(all.len(), 2);
        let running = persistence
            .list_environments(None, Some("running"))
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "env-a");
        assert!(
            persistence
                .list_environments(Some("user-2"), None)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_backing_handle_claim_is_exclusive() {
        let persistence = SqlitePersistence::new(test_pool().await);
        persistence
            .insert_environment(&environment("env-a", "running"))
            .await
            .unwrap();
        let claim = NewBackingHandle {
            environment_id: "env-a".to_string(),
            name: "dynamodb".to_string(),
            kind: "container".to_string(),
            parent_name: None,
        };
        assert_eq!(
            persistence.claim_backing_handle(&claim).await.unwrap(),
            ClaimOutcome::Claimed
        );
        assert_eq!(
            persistence.claim_backing_handle(&claim).await.unwrap(),
            ClaimOutcome::Taken
        );

        persistence
            .complete_backing_handle("env-a", "dynamodb", "cid-1", Some(30001), Some("http://x"))
            .await
            .unwrap();
        let handle = persistence
            .get_backing_handle("env-a", "dynamodb")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handle.state, "live");
        assert_eq!(handle.port, Some(30001));

        assert_eq!(
            persistence
                .set_backing_handles_state("env-a", "live", "parked")
                .await
                .unwrap(),
            1
        );
        persistence
            .delete_backing_handle("env-a", "dynamodb")
            .await
            .unwrap();
        // After deletion the name can be claimed again.
        assert_eq!(
            persistence.claim_backing_handle(&claim).await.unwrap(),
            ClaimOutcome::Claimed
        );
        persistence
            .delete_backing_handle("env-a", "dynamodb")
            .await
            .unwrap();

        // Nothing can be claimed once the environment is being torn down.
        assert!(
            persistence
                .transition_environment("env-a", "running", "destroying", Utc::now())
                .await
                .unwrap()
        );
        assert_eq!(
            persistence.claim_backing_handle(&claim).await.unwrap(),
            ClaimOutcome::Inactive
        );
        assert!(
            persistence
                .get_backing_handle("env-a", "dynamodb")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_port_allocation_unique_while_active() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let now = Utc::now();
        persistence
            .insert_port_allocation(30000, "env-a", "redis", now)
            .await
            .unwrap();
        let err = persistence
            .insert_port_allocation(30000, "env-b", "redis", now)
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());

        assert_eq!(persistence.list_active_ports(30000, 40000).await.unwrap(), vec![30000]);
        assert!(persistence.release_port(30000, now).await.unwrap());
        assert!(!persistence.release_port(30000, now).await.unwrap());

        // Released ports can be reused and history is kept.
        persistence
            .insert_port_allocation(30000, "env-b", "redis", now)
            .await
            .unwrap();
        assert_eq!(persistence.list_port_allocations("env-a").await.unwrap().len(), 1);
        assert_eq!(
            persistence
                .release_environment_ports("env-b", now)
                .await
                .unwrap(),
            1
        );
        assert!(persistence.list_active_ports(30000, 40000).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_single_open_usage_period() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let now = Utc::now();
        let period = UsagePeriodRecord {
            id: Uuid::new_v4().to_string(),
            environment_id: "env-a".to_string(),
            user_id: "user-1".to_string(),
            period_start: now,
            period_end: None,
            hourly_rate: 0.1,
            cost: None,
        };
        persistence.open_usage_period(&period).await.unwrap();

        let second = UsagePeriodRecord {
            id: Uuid::new_v4().to_string(),
            ..period.clone()
        };
        assert!(
            persistence
                .open_usage_period(&second)
                .await
                .unwrap_err()
                .is_unique_violation()
        );

        let open = persistence
            .get_open_usage_period("env-a")
            .await
            .unwrap()
            .unwrap();
        assert!(
            persistence
                .close_usage_period(&open.id, now + Duration::hours(1), 0.1)
                .await
                .unwrap()
        );
        assert!(
            !persistence
                .close_usage_period(&open.id, now + Duration::hours(2), 0.2)
                .await
                .unwrap()
        );
        assert!(persistence.get_open_usage_period("env-a").await.unwrap().is_none());
        persistence.open_usage_period(&second).await.unwrap();
        assert_eq!(persistence.list_usage_periods("env-a").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_debit_is_conditional() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let now = Utc::now();
        assert_eq!(persistence.get_balance("user-1").await.unwrap(), 0);
        assert!(!persistence.debit_account("user-1", 1, now).await.unwrap());

        assert_eq!(persistence.credit_account("user-1", 100, now).await.unwrap(), 100);
        assert_eq!(persistence.credit_account("user-1", 50, now).await.unwrap(), 150);
        assert!(persistence.debit_account("user-1", 150, now).await.unwrap());
        assert!(!persistence.debit_account("user-1", 1, now).await.unwrap());
        assert_eq!(persistence.get_balance("user-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dynamo_item_statistics_follow_writes() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let now = Utc::now();
        persistence
            .insert_dynamo_table(&DynamoTableRecord {
                id: "ddb-1".to_string(),
                environment_id: "env-a".to_string(),
                name: "orders".to_string(),
                status: "ACTIVE".to_string(),
                key_schema: "[]".to_string(),
                attribute_definitions: "[]".to_string(),
                billing_mode: "PAY_PER_REQUEST".to_string(),
                item_count: 0,
                table_size_bytes: 0,
                backing_handle: None,
                created_at: now,
            })
            .await
            .unwrap();

        let item = DynamoItemRecord {
            table_id: "ddb-1".to_string(),
            partition_key: "1".to_string(),
            sort_key: String::new(),
            item: r#"{"id":{"S":"1"}}"#.to_string(),
            size_bytes: 16,
            updated_at: now,
        };
        assert!(persistence.put_dynamo_item(&item).await.unwrap().is_none());
        let bigger = DynamoItemRecord {
            size_bytes: 40,
            ..item.clone()
        };
        assert!(persistence.put_dynamo_item(&bigger).await.unwrap().is_some());

        let table = persistence
            .get_dynamo_table("env-a", "orders")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(table.item_count, 1);
        assert_eq!(table.table_size_bytes, 40);

        let removed = persistence.delete_dynamo_item("ddb-1", "1", "").await.unwrap();
        assert!(removed.is_some());
        assert!(persistence.delete_dynamo_item("ddb-1", "1", "").await.unwrap().is_none());
        let table = persistence
            .get_dynamo_table("env-a", "orders")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(table.item_count, 0);
        assert_eq!(table.table_size_bytes, 0);
    }

    fn s3_object(bucket_id: &str, key: &str, body: &[u8]) -> S3ObjectRecord {
        S3ObjectRecord {
            bucket_id: bucket_id.to_string(),
            object_key: key.to_string(),
            body: body.to_vec(),
            etag: "\"e\"".to_string(),
            content_type: "text/plain".to_string(),
            size_bytes: body.len() as i64,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_s3_bucket_statistics_and_delete() {
        let persistence = SqlitePersistence::new(test_pool().await);
        persistence
            .insert_s3_bucket(&S3BucketRecord {
                id: "s3-1".to_string(),
                environment_id: "env-a".to_string(),
                name: "assets".to_string(),
                object_count: 0,
                total_size_bytes: 0,
                backing_handle: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        assert!(
            persistence
                .put_s3_object(&s3_object("s3-1", "logs/a.txt", b"hello"))
                .await
                .unwrap()
                .is_none()
        );
        persistence
            .put_s3_object(&s3_object("s3-1", "logs/b.txt", b"hi"))
            .await
            .unwrap();
        let replaced = persistence
            .put_s3_object(&s3_object("s3-1", "logs/a.txt", b"hello world"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replaced.body, b"hello");

        let bucket = persistence
            .get_s3_bucket("env-a", "assets")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bucket.object_count, 2);
        assert_eq!(bucket.total_size_bytes, 13);

        let listed = persistence
            .list_s3_objects("s3-1", Some("logs/a"))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].size_bytes, 11);
        assert!(listed[0].body.is_empty());

        assert!(!persistence.delete_s3_bucket("s3-1").await.unwrap());
        for key in ["logs/a.txt", "logs/b.txt"] {
            assert!(
                persistence
                    .delete_s3_object("s3-1", key)
                    .await
                    .unwrap()
                    .is_some()
            );
        }
        assert!(persistence.delete_s3_bucket("s3-1").await.unwrap());

        let orphan = persistence
            .put_s3_object(&s3_object("s3-1", "late.txt", b"x"))
            .await;
        assert!(matches!(orphan, Err(CoreError::NotFound { .. })));
        assert!(
            persistence
                .get_s3_object("s3-1", "late.txt")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_sqs_claim_and_delete_by_handle() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let message = SqsMessageRecord {
            message_id: "m-1".to_string(),
            queue_id: "sqs-1".to_string(),
            body: "hello".to_string(),
            md5_of_body: "5d41402abc4b2a76b9719d911017c592".to_string(),
            receipt_handle: None,
            sent_at_ms: 1_000,
            visible_at_ms: 1_000,
            receive_count: 0,
            message_group_id: None,
        };
        persistence.insert_sqs_message(&message).await.unwrap();

        let visible = persistence
            .list_visible_sqs_messages("sqs-1", 2_000, 10)
            .await
            .unwrap();
        assert_eq!(visible.len(), 1);

        assert!(
            persistence
                .claim_sqs_message("m-1", 1_000, 32_000, "rh-1")
                .await
                .unwrap()
        );
        // A concurrent receiver holding the stale visibility loses.
        assert!(
            !persistence
                .claim_sqs_message("m-1", 1_000, 32_000, "rh-2")
                .await
                .unwrap()
        );

        let counts = persistence.count_sqs_messages("sqs-1", 2_000).await.unwrap();
        assert_eq!(counts.visible, 0);
        assert_eq!(counts.in_flight, 1);

        // An expired handle does not delete.
        assert!(!persistence.delete_sqs_message("sqs-1", "rh-1", 40_000).await.unwrap());
        assert!(persistence.delete_sqs_message("sqs-1", "rh-1", 2_000).await.unwrap());
        assert_eq!(
            persistence.count_sqs_messages("sqs-1", 2_000).await.unwrap(),
            SqsMessageCounts::default()
        );
    }

    #[tokio::test]
    async fn test_dns_lookup_scoped_to_running_environments() {
        let persistence = SqlitePersistence::new(test_pool().await);
        persistence
            .insert_environment(&environment("env-a", "running"))
            .await
            .unwrap();
        persistence
            .insert_environment(&environment("env-b", "stopped"))
            .await
            .unwrap();

        for (id, env) in [("r-1", "env-a"), ("r-2", "env-b")] {
            persistence
                .insert_dns_record(&DnsRecordRow {
                    id: id.to_string(),
                    environment_id: env.to_string(),
                    name: "api.example.test".to_string(),
                    record_type: "A".to_string(),
                    value: "10.0.0.1".to_string(),
                    ttl: 300,
                    priority: None,
                    weight: None,
                    port: None,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let found = persistence
            .find_dns_records("api.example.test", "A")
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].environment_id, "env-a");

        assert!(persistence.delete_dns_record("env-a", "r-1").await.unwrap());
        assert!(!persistence.delete_dns_record("env-a", "r-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_vpc_resource_transition_needs_expected_state() {
        let persistence = SqlitePersistence::new(test_pool().await);
        persistence
            .insert_vpc_resource(&VpcResourceRecord {
                id: "i-0123".to_string(),
                environment_id: "env-a".to_string(),
                kind: "instance".to_string(),
                parent_id: None,
                name: None,
                description: None,
                cidr_block: None,
                availability_zone: None,
                state: "running".to_string(),
                attributes: "{}".to_string(),
                backing_handle: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        assert!(
            persistence
                .transition_vpc_resource("i-0123", "running", "stopped")
                .await
                .unwrap()
        );
        assert!(
            !persistence
                .transition_vpc_resource("i-0123", "running", "terminated")
                .await
                .unwrap()
        );
        let record = persistence
            .get_vpc_resource("env-a", "instance", "i-0123")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, "stopped");
    }

    #[tokio::test]
    async fn test_attach_backing_handle_only_once() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let now = Utc::now();
        persistence
            .insert_sqs_queue(&SqsQueueRecord {
                id: "sqs-1".to_string(),
                environment_id: "env-a".to_string(),
                name: "jobs".to_string(),
                url: "u".to_string(),
                arn: "a".to_string(),
                fifo: false,
                visibility_timeout: 30,
                message_retention_period: 345600,
                delay_seconds: 0,
                receive_wait_time: 0,
                attributes: "{}".to_string(),
                backing_handle: None,
                created_at: now,
            })
            .await
            .unwrap();

        assert!(
            persistence
                .attach_backing_handle(ResourceTable::SqsQueue, "sqs-1", "sqs")
                .await
                .unwrap()
        );
        assert!(
            !persistence
                .attach_backing_handle(ResourceTable::SqsQueue, "sqs-1", "sqs")
                .await
                .unwrap()
        );
        persistence
            .detach_backing_handle(ResourceTable::SqsQueue, "sqs-1")
            .await
            .unwrap();
        let queue = persistence.get_sqs_queue("env-a", "jobs").await.unwrap().unwrap();
        assert!(queue.backing_handle.is_none());
    }

    #[tokio::test]
    async fn test_from_path_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("mockcloud.db");
        let persistence = SqlitePersistence::from_path(&path).await.unwrap();
        assert!(persistence.health_check_db().await.unwrap());
        assert!(path.exists());
    }
}
