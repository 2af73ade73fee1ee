// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for mockcloud-core.
//!
//! Every concurrency guarantee the platform makes is enforced here, by the
//! store, rather than by in-process locks:
//!
//! | Guarantee                          | Mechanism                                    |
//! |------------------------------------|----------------------------------------------|
//! | one active allocation per port     | partial unique index, caller retries         |
//! | one backing object per handle name | `(environment_id, name)` primary key         |
//! | lifecycle transitions              | `UPDATE ... WHERE status = ?` compare-and-set |
//! | one open usage period              | partial unique index on `period_end IS NULL` |
//! | message receipt                    | `UPDATE ... WHERE visible_at_ms = ?`         |
//! | credit debit                       | `UPDATE ... WHERE balance >= ?`              |
//! | item and message statistics        | transactions                                 |

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;

/// Environment record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EnvironmentRecord {
    /// Identifier (`env-` followed by 12 lowercase alphanumerics).
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Display name.
    pub name: String,
    /// Lifecycle status (provisioning, running, stopped, destroying, destroyed, error).
    pub status: String,
    /// JSON map of declared services: `{service_type: {version, config}}`.
    pub services: String,
    /// JSON map of published endpoints; empty unless running.
    pub endpoints: String,
    /// Sum of per-service hourly rates, rounded to cents.
    pub hourly_rate: f64,
    /// Accumulated cost of closed usage periods.
    pub total_cost: f64,
    /// Idle hours before the sweep stops the environment (0 disables).
    pub auto_shutdown_hours: i32,
    /// Last provisioning error.
    pub error: Option<String>,
    /// When the environment was created.
    pub created_at: DateTime<Utc>,
    /// When the environment last entered running.
    pub started_at: Option<DateTime<Utc>>,
    /// When the environment last entered stopped.
    pub stopped_at: Option<DateTime<Utc>>,
    /// Last request or lifecycle activity.
    pub last_activity: DateTime<Utc>,
}

/// A backing object realizing part of an environment.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BackingHandleRecord {
    /// Owning environment.
    pub environment_id: String,
    /// Unique name within the environment (`redis`, `dynamodb`, `lambda:fn`, `vpc:vpc-...`).
    pub name: String,
    /// container, vcn, subnet, internet_gateway or nsg.
    pub kind: String,
    /// materializing, live or parked.
    pub state: String,
    /// Container id or cloud object OCID, once known.
    pub handle_id: Option<String>,
    /// Handle this one depends on (a subnet's VCN).
    pub parent_name: Option<String>,
    /// Host port mapped to the container, if any.
    pub port: Option<i32>,
    /// Published endpoint or connection string.
    pub endpoint: Option<String>,
    /// When the claim row was inserted.
    pub created_at: DateTime<Utc>,
}

/// Input for claiming a backing handle name.
#[derive(Debug, Clone)]
pub struct NewBackingHandle {
    /// Owning environment.
    pub environment_id: String,
    /// Unique name within the environment.
    pub name: String,
    /// Handle kind.
    pub kind: String,
    /// Parent handle name, if any.
    pub parent_name: Option<String>,
}

/// Result of [`Persistence::claim_backing_handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller inserted the `materializing` row and must create the object.
    Claimed,
    /// Another caller holds the name.
    Taken,
    /// The environment is neither provisioning nor running.
    Inactive,
}

/// Port allocation record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PortAllocationRecord {
    /// Database primary key.
    pub id: i64,
    /// Host port.
    pub port: i32,
    /// Owning environment.
    pub environment_id: String,
    /// Service the port was allocated for.
    pub service_name: String,
    /// Whether the allocation is still held.
    pub is_active: bool,
    /// When the port was claimed.
    pub allocated_at: DateTime<Utc>,
    /// When the port was released.
    pub released_at: Option<DateTime<Utc>>,
}

/// Billable interval of a running environment.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UsagePeriodRecord {
    /// Identifier.
    pub id: String,
    /// Owning environment.
    pub environment_id: String,
    /// Owner charged for the period.
    pub user_id: String,
    /// Start of the period.
    pub period_start: DateTime<Utc>,
    /// End of the period; `None` while open.
    pub period_end: Option<DateTime<Utc>>,
    /// Rate fixed at open time.
    pub hourly_rate: f64,
    /// Cost fixed at close time.
    pub cost: Option<f64>,
}

/// Metered charge and its settlement status.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BillingEventRecord {
    /// Identifier.
    pub id: String,
    /// Charged user.
    pub user_id: String,
    /// Environment the operation ran in.
    pub environment_id: Option<String>,
    /// Service (dynamodb, sqs, lambda, vpc, environment).
    pub service: String,
    /// Operation name.
    pub operation: String,
    /// Billed units (requests, capacity units, GB-ms).
    pub units: i64,
    /// Cost in nanocredits.
    pub cost_nanocredits: i64,
    /// pending, applied, insufficient or failed.
    pub status: String,
    /// Settlement attempts so far.
    pub attempts: i32,
    /// Last settlement error.
    pub error: Option<String>,
    /// When the charge was recorded.
    pub created_at: DateTime<Utc>,
    /// When reconciliation gave up or settled the charge.
    pub reconciled_at: Option<DateTime<Utc>>,
}

/// Emulated VPC, subnet, security group, internet gateway or instance.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VpcResourceRecord {
    /// Provider-style id (`vpc-`, `subnet-`, `sg-`, `igw-`, `i-`).
    pub id: String,
    /// Owning environment.
    pub environment_id: String,
    /// vpc, subnet, security_group, internet_gateway or instance.
    pub kind: String,
    /// VPC id for subnets and groups; attached VPC for gateways; subnet for instances.
    pub parent_id: Option<String>,
    /// Group name.
    pub name: Option<String>,
    /// Group description.
    pub description: Option<String>,
    /// CIDR block.
    pub cidr_block: Option<String>,
    /// Subnet availability zone.
    pub availability_zone: Option<String>,
    /// Kind-specific state.
    pub state: String,
    /// JSON map of extra attributes.
    pub attributes: String,
    /// Backing handle name once materialized.
    pub backing_handle: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Ingress rule of a security group.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SecurityGroupRuleRecord {
    /// Database primary key.
    pub id: i64,
    /// Owning group.
    pub group_id: String,
    /// tcp, udp, icmp or -1.
    pub ip_protocol: String,
    /// First port of the range.
    pub from_port: Option<i32>,
    /// Last port of the range.
    pub to_port: Option<i32>,
    /// Source CIDR.
    pub cidr_ip: String,
    /// Cloud rule id, once created.
    pub backing_handle: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Emulated DynamoDB table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DynamoTableRecord {
    /// Identifier (`ddb-` + 16 hex).
    pub id: String,
    /// Owning environment.
    pub environment_id: String,
    /// Table name.
    pub name: String,
    /// CREATING, ACTIVE or DELETING.
    pub status: String,
    /// JSON key schema.
    pub key_schema: String,
    /// JSON attribute definitions.
    pub attribute_definitions: String,
    /// PAY_PER_REQUEST or PROVISIONED.
    pub billing_mode: String,
    /// Number of items.
    pub item_count: i64,
    /// Total item size.
    pub table_size_bytes: i64,
    /// Backing handle name once materialized.
    pub backing_handle: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Stored DynamoDB item.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DynamoItemRecord {
    /// Owning table.
    pub table_id: String,
    /// Partition key value.
    pub partition_key: String,
    /// Sort key value, empty when the table has none.
    pub sort_key: String,
    /// Item in typed attribute JSON.
    pub item: String,
    /// Billed size.
    pub size_bytes: i64,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
}

/// Emulated S3 bucket.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct S3BucketRecord {
    /// Identifier (`s3-` + 16 hex).
    pub id: String,
    /// Owning environment.
    pub environment_id: String,
    /// Bucket name.
    pub name: String,
    /// Number of objects.
    pub object_count: i64,
    /// Sum of object sizes.
    pub total_size_bytes: i64,
    /// Backing handle name once materialized.
    pub backing_handle: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Stored S3 object. Listings leave `body` empty.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct S3ObjectRecord {
    /// Owning bucket.
    pub bucket_id: String,
    /// Object key.
    pub object_key: String,
    /// Object content.
    pub body: Vec<u8>,
    /// Quoted hex MD5 of the content.
    pub etag: String,
    /// Content type given on upload.
    pub content_type: String,
    /// Content length.
    pub size_bytes: i64,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
}

/// Emulated SQS queue.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SqsQueueRecord {
    /// Identifier (`sqs-` + 16 hex).
    pub id: String,
    /// Owning environment.
    pub environment_id: String,
    /// Queue name.
    pub name: String,
    /// Queue URL.
    pub url: String,
    /// Queue ARN.
    pub arn: String,
    /// Whether the name ends in `.fifo`.
    pub fifo: bool,
    /// Default visibility timeout in seconds.
    pub visibility_timeout: i32,
    /// Retention in seconds.
    pub message_retention_period: i32,
    /// Default delivery delay in seconds.
    pub delay_seconds: i32,
    /// Default long-poll wait in seconds.
    pub receive_wait_time: i32,
    /// JSON map of other attributes.
    pub attributes: String,
    /// Backing handle name once materialized.
    pub backing_handle: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Stored SQS message. Times are epoch milliseconds.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SqsMessageRecord {
    /// Message id (UUID).
    pub message_id: String,
    /// Owning queue.
    pub queue_id: String,
    /// Body.
    pub body: String,
    /// Hex MD5 of the body.
    pub md5_of_body: String,
    /// Current receipt handle, reissued on every receive.
    pub receipt_handle: Option<String>,
    /// Send time.
    pub sent_at_ms: i64,
    /// The message is invisible until this time.
    pub visible_at_ms: i64,
    /// Number of receives.
    pub receive_count: i32,
    /// FIFO message group.
    pub message_group_id: Option<String>,
}

/// Emulated Lambda function.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LambdaFunctionRecord {
    /// Identifier (`lambda-` + 16 hex).
    pub id: String,
    /// Owning environment.
    pub environment_id: String,
    /// Function name.
    pub name: String,
    /// Function ARN.
    pub arn: String,
    /// Runtime identifier.
    pub runtime: String,
    /// Handler.
    pub handler: String,
    /// Execution role ARN.
    pub role: String,
    /// Description.
    pub description: String,
    /// Base64 deployment package.
    pub code_zip: String,
    /// Decoded package size.
    pub code_size: i64,
    /// Base64 SHA-256 of the package.
    pub code_sha256: String,
    /// Memory in MB.
    pub memory_size: i32,
    /// Timeout in seconds.
    pub timeout: i32,
    /// JSON map of environment variables.
    pub environment_vars: String,
    /// Active.
    pub state: String,
    /// Successful.
    pub last_update_status: String,
    /// Backing handle name once materialized.
    pub backing_handle: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last configuration or code change.
    pub last_modified: DateTime<Utc>,
}

/// Recorded Lambda invocation.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LambdaInvocationRecord {
    /// Request id.
    pub id: String,
    /// Invoked function.
    pub function_id: String,
    /// RequestResponse, Event or DryRun.
    pub invocation_type: String,
    /// Request payload.
    pub payload: String,
    /// Response payload.
    pub response: Option<String>,
    /// HTTP status returned to the caller.
    pub status_code: i32,
    /// Measured duration.
    pub duration_ms: i64,
    /// Duration rounded up to 100 ms.
    pub billed_duration_ms: i64,
    /// Configured memory charged for the invocation.
    pub memory_used_mb: i32,
    /// `Unhandled` when the function raised.
    pub function_error: Option<String>,
    /// Infrastructure or function error message.
    pub error_message: Option<String>,
    /// Invocation time.
    pub created_at: DateTime<Utc>,
}

/// Sandboxed execution.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ExecutionRecord {
    /// Identifier.
    pub id: String,
    /// Authenticated caller.
    pub user_id: Option<String>,
    /// Anonymous caller session.
    pub session_id: Option<String>,
    /// Language.
    pub language: String,
    /// Source code.
    pub code: String,
    /// pending, running, completed, failed, timeout or security_violation.
    pub status: String,
    /// Combined output, truncated.
    pub output: Option<String>,
    /// Error message.
    pub error: Option<String>,
    /// Process exit code.
    pub exit_code: Option<i32>,
    /// Wall time.
    pub execution_time_ms: Option<i64>,
    /// Peak memory.
    pub memory_used_mb: Option<f64>,
    /// JSON list of violation descriptions.
    pub security_violations: String,
    /// Container that ran the code.
    pub container_id: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Launch time.
    pub started_at: Option<DateTime<Utc>>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
}

/// DNS record served by the authoritative responder.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DnsRecordRow {
    /// Identifier.
    pub id: String,
    /// Owning environment.
    pub environment_id: String,
    /// Lowercased name without trailing dot.
    pub name: String,
    /// A, AAAA, CNAME, MX, TXT, NS, SRV or PTR.
    pub record_type: String,
    /// Record value.
    pub value: String,
    /// Time to live in seconds.
    pub ttl: i32,
    /// MX/SRV priority.
    pub priority: Option<i32>,
    /// SRV weight.
    pub weight: Option<i32>,
    /// SRV port.
    pub port: Option<i32>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Emulated resource tables carrying a `backing_handle` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceTable {
    /// `vpc_resources`
    Vpc,
    /// `dynamodb_tables`
    DynamoTable,
    /// `sqs_queues`
    SqsQueue,
    /// `s3_buckets`
    S3Bucket,
    /// `lambda_functions`
    LambdaFunction,
}

impl ResourceTable {
    /// SQL table name.
    pub fn table_name(&self) -> &'static str {
        match self {
            Self::Vpc => "vpc_resources",
            Self::DynamoTable => "dynamodb_tables",
            Self::SqsQueue => "sqs_queues",
            Self::S3Bucket => "s3_buckets",
            Self::LambdaFunction => "lambda_functions",
        }
    }
}

/// Mutable queue settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqsQueueSettings {
    /// Visibility timeout in seconds.
    pub visibility_timeout: i32,
    /// Retention in seconds.
    pub message_retention_period: i32,
    /// Delivery delay in seconds.
    pub delay_seconds: i32,
    /// Long-poll wait in seconds.
    pub receive_wait_time: i32,
    /// JSON map of other attributes.
    pub attributes: String,
}

/// Visible and in-flight message counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SqsMessageCounts {
    /// Messages that can be received now.
    pub visible: i64,
    /// Messages received and not yet deleted or expired.
    pub in_flight: i64,
    /// Messages whose delivery delay has not elapsed.
    pub delayed: i64,
}

/// Persistence interface used by the environment server.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ------------------------------------------------------------------
    // Environments
    // ------------------------------------------------------------------

    /// Insert a new environment.
    async fn insert_environment(&self, env: &EnvironmentRecord) -> Result<(), CoreError>;

    /// Fetch an environment by id.
    async fn get_environment(&self, id: &str) -> Result<Option<EnvironmentRecord>, CoreError>;

    /// List environments, newest first, optionally filtered by owner and status.
    async fn list_environments(
        &self,
        user_id: Option<&str>,
        status: Option<&str>,
    ) -> Result<Vec<EnvironmentRecord>, CoreError>;

    /// Compare-and-set the status. Entering `running` sets `started_at` and
    /// `last_activity`; entering `stopped` sets `stopped_at`. Returns false
    /// when the current status is not `from`.
    async fn transition_environment(
        &self,
        id: &str,
        from: &str,
        to: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Move a non-terminal environment to `error`.
    async fn mark_environment_error(&self, id: &str, message: &str) -> Result<bool, CoreError>;

    /// Replace the endpoints JSON.
    async fn set_environment_endpoints(&self, id: &str, endpoints: &str) -> Result<(), CoreError>;

    /// Record activity.
    async fn touch_environment(&self, id: &str, at: DateTime<Utc>) -> Result<(), CoreError>;

    /// Add a closed period's cost to the total.
    async fn add_environment_cost(&self, id: &str, cost: f64) -> Result<(), CoreError>;

    // ------------------------------------------------------------------
    // Backing handles
    // ------------------------------------------------------------------

    /// Insert a `materializing` row, only while the owning environment is
    /// `provisioning` or `running`.
    async fn claim_backing_handle(
        &self,
        claim: &NewBackingHandle,
    ) -> Result<ClaimOutcome, CoreError>;

    /// Mark a claimed handle `live` with its realized identity.
    async fn complete_backing_handle(
        &self,
        environment_id: &str,
        name: &str,
        handle_id: &str,
        port: Option<i32>,
        endpoint: Option<&str>,
    ) -> Result<(), CoreError>;

    /// Fetch a handle.
    async fn get_backing_handle(
        &self,
        environment_id: &str,
        name: &str,
    ) -> Result<Option<BackingHandleRecord>, CoreError>;

    /// All handles of an environment in claim order.
    async fn list_backing_handles(
        &self,
        environment_id: &str,
    ) -> Result<Vec<BackingHandleRecord>, CoreError>;

    /// Move every handle in state `from` to `to`.
    async fn set_backing_handles_state(
        &self,
        environment_id: &str,
        from: &str,
        to: &str,
    ) -> Result<u64, CoreError>;

    /// Remove a handle row.
    async fn delete_backing_handle(&self, environment_id: &str, name: &str)
    -> Result<(), CoreError>;

    /// Record the backing handle of a resource if none is set yet.
    async fn attach_backing_handle(
        &self,
        table: ResourceTable,
        id: &str,
        handle: &str,
    ) -> Result<bool, CoreError>;

    /// Forget the backing handle of a resource.
    async fn detach_backing_handle(&self, table: ResourceTable, id: &str) -> Result<(), CoreError>;

    // ------------------------------------------------------------------
    // Ports
    // ------------------------------------------------------------------

    /// Active ports inside `[lo, hi]`, ascending.
    async fn list_active_ports(&self, lo: i32, hi: i32) -> Result<Vec<i32>, CoreError>;

    /// Insert an active allocation. Fails with `UniqueViolation` when the
    /// port is already held.
    async fn insert_port_allocation(
        &self,
        port: i32,
        environment_id: &str,
        service_name: &str,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    /// Release one port. Returns false when it was not active.
    async fn release_port(&self, port: i32, at: DateTime<Utc>) -> Result<bool, CoreError>;

    /// Release every active port of an environment.
    async fn release_environment_ports(
        &self,
        environment_id: &str,
        at: DateTime<Utc>,
    ) -> Result<u64, CoreError>;

    /// Allocation history of an environment.
    async fn list_port_allocations(
        &self,
        environment_id: &str,
    ) -> Result<Vec<PortAllocationRecord>, CoreError>;

    // ------------------------------------------------------------------
    // Usage periods
    // ------------------------------------------------------------------

    /// Open a period. Fails with `UniqueViolation` when one is already open.
    async fn open_usage_period(&self, period: &UsagePeriodRecord) -> Result<(), CoreError>;

    /// The open period of an environment.
    async fn get_open_usage_period(
        &self,
        environment_id: &str,
    ) -> Result<Option<UsagePeriodRecord>, CoreError>;

    /// Close an open period. Returns false when it was already closed.
    async fn close_usage_period(
        &self,
        id: &str,
        end: DateTime<Utc>,
        cost: f64,
    ) -> Result<bool, CoreError>;

    /// Periods of an environment, oldest first.
    async fn list_usage_periods(
        &self,
        environment_id: &str,
    ) -> Result<Vec<UsagePeriodRecord>, CoreError>;

    // ------------------------------------------------------------------
    // Credits and billing events
    // ------------------------------------------------------------------

    /// Balance in nanocredits; 0 for unknown users.
    async fn get_balance(&self, user_id: &str) -> Result<i64, CoreError>;

    /// Add credits, creating the account if needed. Returns the new balance.
    async fn credit_account(
        &self,
        user_id: &str,
        amount: i64,
        at: DateTime<Utc>,
    ) -> Result<i64, CoreError>;

    /// Conditionally debit. Returns false when the balance is insufficient.
    async fn debit_account(
        &self,
        user_id: &str,
        amount: i64,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Record a charge.
    async fn insert_billing_event(&self, event: &BillingEventRecord) -> Result<(), CoreError>;

    /// Record a settlement attempt.
    async fn update_billing_event(
        &self,
        id: &str,
        status: &str,
        error: Option<&str>,
        reconciled_at: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError>;

    /// Charges not yet applied and not given up on, created before `before`.
    async fn list_unsettled_billing_events(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<BillingEventRecord>, CoreError>;

    /// Charges recorded for an environment.
    async fn list_billing_events(
        &self,
        environment_id: &str,
    ) -> Result<Vec<BillingEventRecord>, CoreError>;

    // ------------------------------------------------------------------
    // VPC resources
    // ------------------------------------------------------------------

    /// Insert a VPC resource.
    async fn insert_vpc_resource(&self, resource: &VpcResourceRecord) -> Result<(), CoreError>;

    /// Fetch a VPC resource of a given kind.
    async fn get_vpc_resource(
        &self,
        environment_id: &str,
        kind: &str,
        id: &str,
    ) -> Result<Option<VpcResourceRecord>, CoreError>;

    /// VPC resources of one kind, oldest first.
    async fn list_vpc_resources(
        &self,
        environment_id: &str,
        kind: &str,
    ) -> Result<Vec<VpcResourceRecord>, CoreError>;

    /// Update state and parent (gateway attachment).
    async fn update_vpc_resource(
        &self,
        id: &str,
        state: &str,
        parent_id: Option<&str>,
    ) -> Result<(), CoreError>;

    /// Move a resource from `from` to `to`; false when another writer got there first.
    async fn transition_vpc_resource(
        &self,
        id: &str,
        from: &str,
        to: &str,
    ) -> Result<bool, CoreError>;

    /// Delete a VPC resource and its rules.
    async fn delete_vpc_resource(&self, id: &str) -> Result<bool, CoreError>;

    /// Add an ingress rule.
    async fn insert_security_group_rule(
        &self,
        rule: &SecurityGroupRuleRecord,
    ) -> Result<(), CoreError>;

    /// Rules of a group.
    async fn list_security_group_rules(
        &self,
        group_id: &str,
    ) -> Result<Vec<SecurityGroupRuleRecord>, CoreError>;

    // ------------------------------------------------------------------
    // DynamoDB
    // ------------------------------------------------------------------

    /// Insert a table. Fails with `UniqueViolation` on a duplicate name.
    async fn insert_dynamo_table(&self, table: &DynamoTableRecord) -> Result<(), CoreError>;

    /// Fetch a table by name.
    async fn get_dynamo_table(
        &self,
        environment_id: &str,
        name: &str,
    ) -> Result<Option<DynamoTableRecord>, CoreError>;

    /// Tables ordered by name.
    async fn list_dynamo_tables(
        &self,
        environment_id: &str,
    ) -> Result<Vec<DynamoTableRecord>, CoreError>;

    /// Delete a table and its items.
    async fn delete_dynamo_table(&self, table_id: &str) -> Result<(), CoreError>;

    /// Upsert an item and adjust table statistics in one transaction.
    /// Returns the replaced item.
    async fn put_dynamo_item(
        &self,
        item: &DynamoItemRecord,
    ) -> Result<Option<DynamoItemRecord>, CoreError>;

    /// Fetch one item.
    async fn get_dynamo_item(
        &self,
        table_id: &str,
        partition_key: &str,
        sort_key: &str,
    ) -> Result<Option<DynamoItemRecord>, CoreError>;

    /// Delete an item and adjust statistics. Returns the removed item.
    async fn delete_dynamo_item(
        &self,
        table_id: &str,
        partition_key: &str,
        sort_key: &str,
    ) -> Result<Option<DynamoItemRecord>, CoreError>;

    /// Items of a table, optionally restricted to one partition.
    async fn list_dynamo_items(
        &self,
        table_id: &str,
        partition_key: Option<&str>,
    ) -> Result<Vec<DynamoItemRecord>, CoreError>;

    // ------------------------------------------------------------------
    // S3
    // ------------------------------------------------------------------

    /// Insert a bucket. Fails with `UniqueViolation` on a duplicate name.
    async fn insert_s3_bucket(&self, bucket: &S3BucketRecord) -> Result<(), CoreError>;

    /// Fetch a bucket by name.
    async fn get_s3_bucket(
        &self,
        environment_id: &str,
        name: &str,
    ) -> Result<Option<S3BucketRecord>, CoreError>;

    /// Buckets ordered by name.
    async fn list_s3_buckets(&self, environment_id: &str)
    -> Result<Vec<S3BucketRecord>, CoreError>;

    /// Delete a bucket that holds no objects. Returns false otherwise.
    async fn delete_s3_bucket(&self, bucket_id: &str) -> Result<bool, CoreError>;

    /// Upsert an object and adjust bucket statistics in one transaction.
    /// Returns the replaced object; fails with `NotFound` once the bucket
    /// is gone.
    async fn put_s3_object(
        &self,
        object: &S3ObjectRecord,
    ) -> Result<Option<S3ObjectRecord>, CoreError>;

    /// Fetch one object with its content.
    async fn get_s3_object(
        &self,
        bucket_id: &str,
        object_key: &str,
    ) -> Result<Option<S3ObjectRecord>, CoreError>;

    /// Delete an object and adjust statistics. Returns the removed object.
    async fn delete_s3_object(
        &self,
        bucket_id: &str,
        object_key: &str,
    ) -> Result<Option<S3ObjectRecord>, CoreError>;

    /// Objects ordered by key, without content, optionally under a prefix.
    async fn list_s3_objects(
        &self,
        bucket_id: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<S3ObjectRecord>, CoreError>;

    // ------------------------------------------------------------------
    // SQS
    // ------------------------------------------------------------------

    /// Insert a queue. Fails with `UniqueViolation` on a duplicate name.
    async fn insert_sqs_queue(&self, queue: &SqsQueueRecord) -> Result<(), CoreError>;

    /// Fetch a queue by name.
    async fn get_sqs_queue(
        &self,
        environment_id: &str,
        name: &str,
    ) -> Result<Option<SqsQueueRecord>, CoreError>;

    /// Queues ordered by name.
    async fn list_sqs_queues(&self, environment_id: &str)
    -> Result<Vec<SqsQueueRecord>, CoreError>;

    /// Replace queue settings.
    async fn update_sqs_queue_settings(
        &self,
        queue_id: &str,
        settings: &SqsQueueSettings,
    ) -> Result<(), CoreError>;

    /// Delete a queue and its messages.
    async fn delete_sqs_queue(&self, queue_id: &str) -> Result<(), CoreError>;

    /// Enqueue a message.
    async fn insert_sqs_message(&self, message: &SqsMessageRecord) -> Result<(), CoreError>;

    /// Messages visible at `now_ms`, oldest first.
    async fn list_visible_sqs_messages(
        &self,
        queue_id: &str,
        now_ms: i64,
        limit: i64,
    ) -> Result<Vec<SqsMessageRecord>, CoreError>;

    /// Take a visible message: compare-and-set on `visible_at_ms`, issue a
    /// new receipt handle and bump the receive count.
    async fn claim_sqs_message(
        &self,
        message_id: &str,
        expected_visible_at_ms: i64,
        new_visible_at_ms: i64,
        receipt_handle: &str,
    ) -> Result<bool, CoreError>;

    /// Delete by receipt handle while the message is still in flight.
    async fn delete_sqs_message(
        &self,
        queue_id: &str,
        receipt_handle: &str,
        now_ms: i64,
    ) -> Result<bool, CoreError>;

    /// Change visibility of an in-flight message.
    async fn change_sqs_message_visibility(
        &self,
        queue_id: &str,
        receipt_handle: &str,
        now_ms: i64,
        new_visible_at_ms: i64,
    ) -> Result<bool, CoreError>;

    /// Delete every message of a queue.
    async fn purge_sqs_queue(&self, queue_id: &str) -> Result<u64, CoreError>;

    /// Visible, in-flight and delayed counts.
    async fn count_sqs_messages(
        &self,
        queue_id: &str,
        now_ms: i64,
    ) -> Result<SqsMessageCounts, CoreError>;

    /// Drop messages sent before `sent_before_ms`.
    async fn expire_sqs_messages(
        &self,
        queue_id: &str,
        sent_before_ms: i64,
    ) -> Result<u64, CoreError>;

    // ------------------------------------------------------------------
    // Lambda
    // ------------------------------------------------------------------

    /// Insert a function. Fails with `UniqueViolation` on a duplicate name.
    async fn insert_lambda_function(&self, function: &LambdaFunctionRecord)
    -> Result<(), CoreError>;

    /// Fetch a function by name.
    async fn get_lambda_function(
        &self,
        environment_id: &str,
        name: &str,
    ) -> Result<Option<LambdaFunctionRecord>, CoreError>;

    /// Functions ordered by name.
    async fn list_lambda_functions(
        &self,
        environment_id: &str,
    ) -> Result<Vec<LambdaFunctionRecord>, CoreError>;

    /// Replace the deployment package.
    async fn update_lambda_code(
        &self,
        function_id: &str,
        code_zip: &str,
        code_size: i64,
        code_sha256: &str,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    /// Delete a function.
    async fn delete_lambda_function(&self, function_id: &str) -> Result<(), CoreError>;

    /// Record an invocation.
    async fn insert_lambda_invocation(
        &self,
        invocation: &LambdaInvocationRecord,
    ) -> Result<(), CoreError>;

    /// Invocations of a function, oldest first.
    async fn list_lambda_invocations(
        &self,
        function_id: &str,
    ) -> Result<Vec<LambdaInvocationRecord>, CoreError>;

    // ------------------------------------------------------------------
    // Executions
    // ------------------------------------------------------------------

    /// Insert a pending execution.
    async fn insert_execution(&self, execution: &ExecutionRecord) -> Result<(), CoreError>;

    /// Write every mutable field of an execution.
    async fn update_execution(&self, execution: &ExecutionRecord) -> Result<(), CoreError>;

    /// Fetch an execution.
    async fn get_execution(&self, id: &str) -> Result<Option<ExecutionRecord>, CoreError>;

    // ------------------------------------------------------------------
    // DNS
    // ------------------------------------------------------------------

    /// Insert a record.
    async fn insert_dns_record(&self, record: &DnsRecordRow) -> Result<(), CoreError>;

    /// Records of an environment.
    async fn list_dns_records(&self, environment_id: &str) -> Result<Vec<DnsRecordRow>, CoreError>;

    /// Delete a record. Returns false when absent.
    async fn delete_dns_record(&self, environment_id: &str, id: &str) -> Result<bool, CoreError>;

    /// Records matching `(name, type)` whose environment is running.
    async fn find_dns_records(
        &self,
        name: &str,
        record_type: &str,
    ) -> Result<Vec<DnsRecordRow>, CoreError>;

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    /// Check database connectivity.
    async fn health_check_db(&self) -> Result<bool, CoreError>;
}
