// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence implementation.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use tracing::info;

use crate::error::CoreError;

use super::{
    BackingHandleRecord, BillingEventRecord, ClaimOutcome, DnsRecordRow, DynamoItemRecord,
    DynamoTableRecord, EnvironmentRecord, ExecutionRecord, LambdaFunctionRecord,
    LambdaInvocationRecord, NewBackingHandle, Persistence, PortAllocationRecord, ResourceTable,
    S3BucketRecord, S3ObjectRecord, SecurityGroupRuleRecord, SqsMessageCounts, SqsMessageRecord,
    SqsQueueRecord, SqsQueueSettings, UsagePeriodRecord, VpcResourceRecord,
};

/// PostgreSQL-backed persistence provider.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new PostgreSQL persistence provider from an existing pool.
    ///
    /// Migrations are not run; call [`crate::migrations::run_postgres`] first.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and run all migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, CoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to PostgreSQL: {}", e),
            })?;

        crate::migrations::run_postgres(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        info!(max_connections, "PostgreSQL persistence ready");
        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn insert_environment(&self, env: &EnvironmentRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO environments
                (id, user_id, name, status, services, endpoints, hourly_rate, total_cost,
                 auto_shutdown_hours, error, created_at, started_at, stopped_at, last_activity)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
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
            SELECT * FROM environments WHERE id = $1
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
            WHERE ($1 IS NULL OR user_id = $2)
              AND ($3 IS NULL OR status = $4)
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
            SET status = $1,
                started_at = COALESCE($2, started_at),
                stopped_at = COALESCE($3, stopped_at),
                last_activity = COALESCE($4, last_activity)
            WHERE id = $5 AND status = $6
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
            SET status = 'error', error = $1
            WHERE id = $2 AND status NOT IN ('destroyed', 'destroying')
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
            UPDATE environments SET endpoints = $1 WHERE id = $2
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
            UPDATE environments SET last_activity = $1 WHERE id = $2
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
            UPDATE environments SET total_cost = total_cost + $1 WHERE id = $2
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
            SELECT $1::TEXT, $2::TEXT, $3::TEXT, 'materializing', $4::TEXT, $5::TIMESTAMPTZ
            WHERE EXISTS (
                SELECT 1 FROM environments
                WHERE id = $1 AND status IN ('provisioning', 'running')
            )
            "#,
        )
        .bind(&claim.environment_id)
        .bind(&claim.name)
        .bind(&claim.kind)
        .bind(&claim.parent_name)
        .bind(Utc::now())
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
            SET state = 'live', handle_id = $1, port = $2, endpoint = $3
            WHERE environment_id = $4 AND name = $5
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
            SELECT * FROM backing_handles WHERE environment_id = $1 AND name = $2
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
            WHERE environment_id = $1
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
            UPDATE backing_handles SET state = $1
            WHERE environment_id = $2 AND state = $3
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
            DELETE FROM backing_handles WHERE environment_id = $1 AND name = $2
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
            UPDATE {} SET backing_handle = $1 WHERE id = $2 AND backing_handle IS NULL
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
            UPDATE {} SET backing_handle = NULL WHERE id = $1
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
            WHERE is_active = TRUE AND port BETWEEN $1 AND $2
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
            VALUES ($1, $2, $3, TRUE, $4)
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
            UPDATE port_allocations SET is_active = FALSE, released_at = $1
            WHERE port = $2 AND is_active = TRUE
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
            UPDATE port_allocations SET is_active = FALSE, released_at = $1
            WHERE environment_id = $2 AND is_active = TRUE
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
            SELECT * FROM port_allocations WHERE environment_id = $1 ORDER BY id
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
            VALUES ($1, $2, $3, $4, NULL, $5, NULL)
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
            SELECT * FROM usage_periods WHERE environment_id = $1 AND period_end IS NULL
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
            UPDATE usage_periods SET period_end = $1, cost = $2
            WHERE id = $3 AND period_end IS NULL
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
            SELECT * FROM usage_periods WHERE environment_id = $1 ORDER BY period_start, id
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
            SELECT balance_nanocredits FROM accounts WHERE user_id = $1
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
            VALUES ($1, $2, $3)
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
            SET balance_nanocredits = balance_nanocredits - $1, updated_at = $2
            WHERE user_id = $3 AND balance_nanocredits >= $4
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
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
            SET status = $1, error = $2, reconciled_at = $3, attempts = attempts + 1
            WHERE id = $4
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
        let records = sqlx::query_as::<_, BillingEventRecord>(
            r#"
            SELECT * FROM billing_events
            WHERE status <> 'applied' AND reconciled_at IS NULL AND created_at < $1
            ORDER BY created_at, id
            LIMIT $2
            "#,
        )
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_billing_events(
        &self,
        environment_id: &str,
    ) -> Result<Vec<BillingEventRecord>, CoreError> {
        let records = sqlx::query_as::<_, BillingEventRecord>(
            r#"
            SELECT * FROM billing_events WHERE environment_id = $1 ORDER BY created_at, id
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
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
            SELECT * FROM vpc_resources WHERE environment_id = $1 AND kind = $2 AND id = $3
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
            WHERE environment_id = $1 AND kind = $2
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
            UPDATE vpc_resources SET state = $1, parent_id = COALESCE($2, parent_id) WHERE id = $3
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
            UPDATE vpc_resources SET state = $1 WHERE id = $2 AND state = $3
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
            DELETE FROM security_group_rules WHERE group_id = $1
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"
            DELETE FROM vpc_resources WHERE id = $1
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
            VALUES ($1, $2, $3, $4, $5, $6, $7)
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
            SELECT * FROM security_group_rules WHERE group_id = $1 ORDER BY id
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
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
            SELECT * FROM dynamodb_tables WHERE environment_id = $1 AND name = $2
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
            SELECT * FROM dynamodb_tables WHERE environment_id = $1 ORDER BY name
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
            DELETE FROM dynamodb_items WHERE table_id = $1
            "#,
        )
        .bind(table_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM dynamodb_tables WHERE id = $1
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
            WHERE table_id = $1 AND partition_key = $2 AND sort_key = $3
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
            VALUES ($1, $2, $3, $4, $5, $6)
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
            SET item_count = item_count + $1, table_size_bytes = table_size_bytes + $2
            WHERE id = $3
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
            WHERE table_id = $1 AND partition_key = $2 AND sort_key = $3
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
            WHERE table_id = $1 AND partition_key = $2 AND sort_key = $3
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
                WHERE table_id = $1 AND partition_key = $2 AND sort_key = $3
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
                SET item_count = item_count - 1, table_size_bytes = table_size_bytes - $1
                WHERE id = $2
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
            WHERE table_id = $1 AND ($2 IS NULL OR partition_key = $3)
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
            VALUES ($1, $2, $3, $4, $5, $6, $7)
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
            SELECT * FROM s3_buckets WHERE environment_id = $1 AND name = $2
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
            SELECT * FROM s3_buckets WHERE environment_id = $1 ORDER BY name
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
            DELETE FROM s3_buckets WHERE id = $1 AND object_count = 0
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
            UPDATE s3_buckets SET object_count = object_count WHERE id = $1
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
            SELECT * FROM s3_objects WHERE bucket_id = $1 AND object_key = $2
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
            VALUES ($1, $2, $3, $4, $5, $6, $7)
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
            SET object_count = object_count + $1, total_size_bytes = total_size_bytes + $2
            WHERE id = $3
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
            SELECT * FROM s3_objects WHERE bucket_id = $1 AND object_key = $2
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
            UPDATE s3_buckets SET object_count = object_count WHERE id = $1
            "#,
        )
        .bind(bucket_id)
        .execute(&mut *tx)
        .await?;

        let previous = sqlx::query_as::<_, S3ObjectRecord>(
            r#"
            SELECT * FROM s3_objects WHERE bucket_id = $1 AND object_key = $2
            "#,
        )
        .bind(bucket_id)
        .bind(object_key)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(old) = &previous {
            sqlx::query(
                r#"
                DELETE FROM s3_objects WHERE bucket_id = $1 AND object_key = $2
                "#,
            )
            .bind(bucket_id)
            .bind(object_key)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                UPDATE s3_buckets
                SET object_count = object_count - 1, total_size_bytes = total_size_bytes - $1
                WHERE id = $2
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
            SELECT bucket_id, object_key, ''::BYTEA AS body, etag, content_type, size_bytes, updated_at
            FROM s3_objects
            WHERE bucket_id = $1 AND ($2::TEXT IS NULL OR left(object_key, length($2::TEXT)) = $2::TEXT)
            ORDER BY object_key COLLATE "C"
            "#,
        )
        .bind(bucket_id)
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
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
            SELECT * FROM sqs_queues WHERE environment_id = $1 AND name = $2
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
            SELECT * FROM sqs_queues WHERE environment_id = $1 ORDER BY name
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
            SET visibility_timeout = $1, message_retention_period = $2, delay_seconds = $3,
                receive_wait_time = $4, attributes = $5
            WHERE id = $6
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
            DELETE FROM sqs_messages WHERE queue_id = $1
            "#,
        )
        .bind(queue_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM sqs_queues WHERE id = $1
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
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
            WHERE queue_id = $1 AND visible_at_ms <= $2
            ORDER BY sent_at_ms, message_id
            LIMIT $3
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
            SET visible_at_ms = $1, receipt_handle = $2, receive_count = receive_count + 1
            WHERE message_id = $3 AND visible_at_ms = $4
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
            WHERE queue_id = $1 AND receipt_handle = $2 AND visible_at_ms > $3
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
            UPDATE sqs_messages SET visible_at_ms = $1
            WHERE queue_id = $2 AND receipt_handle = $3 AND visible_at_ms > $4
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
            DELETE FROM sqs_messages WHERE queue_id = $1
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
                COALESCE(SUM(CASE WHEN visible_at_ms <= $1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN visible_at_ms > $2 AND receive_count > 0 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN visible_at_ms > $3 AND receive_count = 0 THEN 1 ELSE 0 END), 0)
            FROM sqs_messages
            WHERE queue_id = $4
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
            DELETE FROM sqs_messages WHERE queue_id = $1 AND sent_at_ms < $2
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
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
            SELECT * FROM lambda_functions WHERE environment_id = $1 AND name = $2
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
            SELECT * FROM lambda_functions WHERE environment_id = $1 ORDER BY name
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
            SET code_zip = $1, code_size = $2, code_sha256 = $3, last_modified = $4,
                last_update_status = 'Successful'
            WHERE id = $5
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
            DELETE FROM lambda_functions WHERE id = $1
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
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
            SELECT * FROM lambda_invocations WHERE function_id = $1 ORDER BY created_at, id
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
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
            SET status = $1, output = $2, error = $3, exit_code = $4, execution_time_ms = $5,
                memory_used_mb = $6, security_violations = $7, container_id = $8,
                started_at = $9, completed_at = $10
            WHERE id = $11
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
            SELECT * FROM executions WHERE id = $1
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
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
            SELECT * FROM dns_records WHERE environment_id = $1 ORDER BY name, record_type, id
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
            DELETE FROM dns_records WHERE environment_id = $1 AND id = $2
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
            WHERE r.name = $1 AND r.record_type = $2 AND e.status = 'running'
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
