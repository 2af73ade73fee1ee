// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control API (`/api/v1`): environment lifecycle, usage, DNS records,
//! sandboxed execution and credit balance.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use chrono::{DateTime, Utc};
use mockcloud_core::CoreError;
use mockcloud_core::persistence::{DnsRecordRow, EnvironmentRecord, ExecutionRecord};
use mockcloud_protocol::dns::RecordType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use super::GatewayState;
use crate::auth::{self, AuthError, Caller, UserIdentity};
use crate::billing::{
    BillingError, UsageEstimate, estimate_monthly_cost, nanocredits_to_credits,
};
use crate::provisioner::{NewEnvironment, ProvisionError, ServiceRequest};
use crate::sandbox::{ExecutionRequest, SandboxError};
use crate::services::mask_password;

const MAX_HOSTNAME_LEN: usize = 253;
const MIN_TTL: i32 = 60;
const MAX_TTL: i32 = 86_400;
const DEFAULT_TTL: i32 = 300;
const MAX_EXECUTION_TIMEOUT_SECS: u64 = 300;
const HOURS_PER_MONTH: i64 = 730;

pub(super) fn routes() -> Router<GatewayState> {
    Router::new()
        .route(
            "/environments",
            post(create_environment).get(list_environments),
        )
        .route(
            "/environments/{id}",
            get(get_environment).delete(destroy_environment),
        )
        .route("/environments/{id}/stop", post(stop_environment))
        .route("/environments/{id}/start", post(start_environment))
        .route("/environments/{id}/usage", get(environment_usage))
        .route("/environments/{id}/estimate", post(estimate_environment))
        .route(
            "/environments/{id}/dns",
            post(create_dns_record).get(list_dns_records),
        )
        .route(
            "/environments/{id}/dns/{record_id}",
            delete(delete_dns_record),
        )
        .route("/execute", post(execute))
        .route("/executions/{id}", get(get_execution))
        .route("/credits", get(credits))
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

/// Control API error: a status and a machine-readable code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn unauthorized(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn service_unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, code, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            error: ErrorBody {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        Self::unauthorized("UNAUTHORIZED", e.to_string())
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        error!(error = %e, "Store failure in control API");
        Self::internal("INTERNAL_ERROR", "Internal error")
    }
}

impl From<ProvisionError> for ApiError {
    fn from(e: ProvisionError) -> Self {
        if e.is_ports_exhausted() {
            return Self::service_unavailable("PORTS_EXHAUSTED", e.to_string());
        }
        match e {
            ProvisionError::NotFound(_) => Self::not_found("NOT_FOUND", e.to_string()),
            ProvisionError::AlreadyDestroyed(_) => {
                Self::conflict("ALREADY_DESTROYED", e.to_string())
            }
            ProvisionError::InvalidState { .. } => Self::conflict("INVALID_STATE", e.to_string()),
            ProvisionError::Validation(message) => Self::bad_request("VALIDATION_ERROR", message),
            ProvisionError::MaterializationFailed { .. }
            | ProvisionError::Runner(_)
            | ProvisionError::Network(_)
            | ProvisionError::Ports(_) => Self::internal("PROVISIONING_FAILED", e.to_string()),
            other => {
                error!(error = %other, "Lifecycle failure in control API");
                Self::internal("INTERNAL_ERROR", "Internal error")
            }
        }
    }
}

impl From<SandboxError> for ApiError {
    fn from(e: SandboxError) -> Self {
        match e {
            SandboxError::NotFound(_) => Self::not_found("NOT_FOUND", e.to_string()),
            SandboxError::Core(core) => core.into(),
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::Core(core) => core.into(),
            other => Self::new(StatusCode::PAYMENT_REQUIRED, "INSUFFICIENT_CREDIT", other.to_string()),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn authenticate(state: &GatewayState, headers: &HeaderMap) -> ApiResult<UserIdentity> {
    Ok(auth::authenticate(state.identity.as_ref(), headers).await?)
}

/// The environment, provided the caller owns it. Others' environments are
/// reported as missing.
async fn owned_environment(
    state: &GatewayState,
    user: &UserIdentity,
    id: &str,
) -> ApiResult<EnvironmentRecord> {
    match state.persistence.get_environment(id).await? {
        Some(env) if env.user_id == user.user_id => Ok(env),
        _ => Err(ApiError::not_found(
            "NOT_FOUND",
            format!("Environment not found: {id}"),
        )),
    }
}

// ============================================================================
// Environments
// ============================================================================

#[derive(Debug, Deserialize)]
struct CreateEnvironmentRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    services: Vec<ServiceRequest>,
    #[serde(default)]
    auto_shutdown_hours: Option<i32>,
}

#[derive(Debug, Serialize)]
struct EnvironmentView {
    id: String,
    name: String,
    status: String,
    services: Value,
    endpoints: BTreeMap<String, String>,
    hourly_rate: f64,
    total_cost: f64,
    auto_shutdown_hours: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    last_activity: DateTime<Utc>,
}

async fn environment_view(
    state: &GatewayState,
    env: EnvironmentRecord,
) -> ApiResult<EnvironmentView> {
    let endpoints = state
        .provisioner
        .endpoints(&env)
        .await?
        .into_iter()
        .map(|(name, endpoint)| (name, mask_password(&endpoint)))
        .collect();
    Ok(EnvironmentView {
        services: serde_json::from_str(&env.services).unwrap_or(Value::Null),
        endpoints,
        id: env.id,
        name: env.name,
        status: env.status,
        hourly_rate: env.hourly_rate,
        total_cost: env.total_cost,
        auto_shutdown_hours: env.auto_shutdown_hours,
        error: env.error,
        created_at: env.created_at,
        started_at: env.started_at,
        stopped_at: env.stopped_at,
        last_activity: env.last_activity,
    })
}

async fn create_environment(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(request): Json<CreateEnvironmentRequest>,
) -> ApiResult<Response> {
    let user = authenticate(&state, &headers).await?;
    let env = state
        .provisioner
        .create(NewEnvironment {
            user_id: user.user_id,
            name: request.name,
            services: request.services,
            auto_shutdown_hours: request.auto_shutdown_hours,
        })
        .await?;
    let view = environment_view(&state, env).await?;
    Ok((StatusCode::CREATED, Json(view)).into_response())
}

#[derive(Debug, Deserialize)]
struct ListEnvironmentsQuery {
    status: Option<String>,
}

#[derive(Debug, Serialize)]
struct EnvironmentList {
    environments: Vec<EnvironmentView>,
    total_running_cost: f64,
}

async fn list_environments(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Query(query): Query<ListEnvironmentsQuery>,
) -> ApiResult<Json<EnvironmentList>> {
    let user = authenticate(&state, &headers).await?;
    let records = state
        .persistence
        .list_environments(Some(&user.user_id), query.status.as_deref())
        .await?;

    let running_cost: f64 = records
        .iter()
        .filter(|e| e.status == "running")
        .map(|e| e.hourly_rate)
        .sum();
    let mut environments = Vec::with_capacity(records.len());
    for env in records {
        environments.push(environment_view(&state, env).await?);
    }
    Ok(Json(EnvironmentList {
        environments,
        total_running_cost: (running_cost * 100.0).round() / 100.0,
    }))
}

async fn get_environment(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<EnvironmentView>> {
    let user = authenticate(&state, &headers).await?;
    let env = owned_environment(&state, &user, &id).await?;
    Ok(Json(environment_view(&state, env).await?))
}

async fn stop_environment(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<EnvironmentView>> {
    let user = authenticate(&state, &headers).await?;
    owned_environment(&state, &user, &id).await?;
    let env = state.provisioner.stop(&id).await?;
    Ok(Json(environment_view(&state, env).await?))
}

async fn start_environment(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<EnvironmentView>> {
    let user = authenticate(&state, &headers).await?;
    owned_environment(&state, &user, &id).await?;
    let env = state.provisioner.start(&id).await?;
    Ok(Json(environment_view(&state, env).await?))
}

async fn destroy_environment(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let user = authenticate(&state, &headers).await?;
    owned_environment(&state, &user, &id).await?;
    state.provisioner.destroy(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct PeriodView {
    id: String,
    period_start: DateTime<Utc>,
    period_end: Option<DateTime<Utc>>,
    hourly_rate: f64,
    cost: Option<f64>,
}

#[derive(Debug, Serialize)]
struct ChargeView {
    id: String,
    service: String,
    operation: String,
    units: i64,
    cost: f64,
    status: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct UsageView {
    environment_id: String,
    hourly_rate: f64,
    total_cost: f64,
    periods: Vec<PeriodView>,
    charges: Vec<ChargeView>,
}

async fn environment_usage(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<UsageView>> {
    let user = authenticate(&state, &headers).await?;
    let env = owned_environment(&state, &user, &id).await?;

    let periods = state
        .persistence
        .list_usage_periods(&id)
        .await?
        .into_iter()
        .map(|p| PeriodView {
            id: p.id,
            period_start: p.period_start,
            period_end: p.period_end,
            hourly_rate: p.hourly_rate,
            cost: p.cost,
        })
        .collect();
    let charges = state
        .persistence
        .list_billing_events(&id)
        .await?
        .into_iter()
        .map(|e| ChargeView {
            id: e.id,
            service: e.service,
            operation: e.operation,
            units: e.units,
            cost: nanocredits_to_credits(e.cost_nanocredits),
            status: e.status,
            created_at: e.created_at,
        })
        .collect();

    Ok(Json(UsageView {
        environment_id: env.id,
        hourly_rate: env.hourly_rate,
        total_cost: env.total_cost,
        periods,
        charges,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EstimateRequest {
    lambda_invocations: i64,
    lambda_avg_duration_ms: i64,
    lambda_memory_mb: i64,
    dynamodb_reads: i64,
    dynamodb_writes: i64,
    sqs_requests: i64,
    s3_reads: i64,
    s3_writes: i64,
    ec2_actions: i64,
    /// Hours the environment runs; a full month when absent.
    hours: Option<i64>,
}

#[derive(Debug, Serialize)]
struct EstimateView {
    environment_id: String,
    hourly_rate: f64,
    hours: i64,
    /// Credits per line item, with a `total` entry.
    breakdown: BTreeMap<&'static str, f64>,
    total: f64,
    total_nanocredits: i64,
}

/// Monthly cost of the environment under a usage pattern, priced at the
/// current rates.
async fn estimate_environment(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<EstimateRequest>,
) -> ApiResult<Json<EstimateView>> {
    let user = authenticate(&state, &headers).await?;
    let env = owned_environment(&state, &user, &id).await?;

    let limits = [
        ("lambda_invocations", request.lambda_invocations, 1_000_000_000),
        ("lambda_avg_duration_ms", request.lambda_avg_duration_ms, 900_000),
        ("lambda_memory_mb", request.lambda_memory_mb, 10_240),
        ("dynamodb_reads", request.dynamodb_reads, 10_000_000_000),
        ("dynamodb_writes", request.dynamodb_writes, 10_000_000_000),
        ("sqs_requests", request.sqs_requests, 10_000_000_000),
        ("s3_reads", request.s3_reads, 10_000_000_000),
        ("s3_writes", request.s3_writes, 10_000_000_000),
        ("ec2_actions", request.ec2_actions, 10_000_000_000),
        ("hours", request.hours.unwrap_or(0), HOURS_PER_MONTH),
    ];
    if let Some((field, _, max)) = limits
        .iter()
        .find(|(_, value, max)| !(0..=*max).contains(value))
    {
        return Err(ApiError::bad_request(
            "VALIDATION_ERROR",
            format!("{field} must be between 0 and {max}"),
        ));
    }

    let hours = request.hours.unwrap_or(HOURS_PER_MONTH);
    let costs = estimate_monthly_cost(&UsageEstimate {
        lambda_invocations: request.lambda_invocations,
        lambda_avg_duration_ms: request.lambda_avg_duration_ms,
        lambda_memory_mb: request.lambda_memory_mb,
        dynamodb_reads: request.dynamodb_reads,
        dynamodb_writes: request.dynamodb_writes,
        sqs_requests: request.sqs_requests,
        s3_reads: request.s3_reads,
        s3_writes: request.s3_writes,
        wiring_actions: request.ec2_actions,
        environment_hourly_rate: env.hourly_rate,
        environment_hours: hours,
    });
    let total_nanocredits = costs.get("total").copied().unwrap_or(0);
    Ok(Json(EstimateView {
        environment_id: env.id,
        hourly_rate: env.hourly_rate,
        hours,
        breakdown: costs
            .into_iter()
            .map(|(item, nano)| (item, nanocredits_to_credits(nano)))
            .collect(),
        total: nanocredits_to_credits(total_nanocredits),
        total_nanocredits,
    }))
}

// ============================================================================
// DNS records
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CreateDnsRecordRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub value: String,
    #[serde(default = "default_ttl")]
    pub ttl: i32,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub weight: Option<i32>,
    #[serde(default)]
    pub port: Option<i32>,
}

fn default_ttl() -> i32 {
    DEFAULT_TTL
}

#[derive(Debug, Serialize)]
struct DnsRecordView {
    id: String,
    name: String,
    #[serde(rename = "type")]
    record_type: String,
    value: String,
    ttl: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    weight: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<i32>,
    created_at: DateTime<Utc>,
}

impl From<DnsRecordRow> for DnsRecordView {
    fn from(row: DnsRecordRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            record_type: row.record_type,
            value: row.value,
            ttl: row.ttl,
            priority: row.priority,
            weight: row.weight,
            port: row.port,
            created_at: row.created_at,
        }
    }
}

fn is_hostname(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_HOSTNAME_LEN
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        })
}

/// Validate a record and normalize its name and type.
pub(crate) fn validate_dns_record(
    request: &CreateDnsRecordRequest,
) -> ApiResult<(String, RecordType)> {
    let invalid = |message: String| ApiError::bad_request("VALIDATION_ERROR", message);

    let name = request.name.trim().trim_end_matches('.').to_ascii_lowercase();
    if !is_hostname(&name) {
        return Err(invalid(format!("Invalid hostname: {}", request.name)));
    }
    let record_type: RecordType = request
        .record_type
        .parse()
        .ok()
        .filter(RecordType::is_answerable)
        .ok_or_else(|| invalid(format!("Unsupported record type: {}", request.record_type)))?;
    if !(MIN_TTL..=MAX_TTL).contains(&request.ttl) {
        return Err(invalid(format!(
            "TTL must be between {MIN_TTL} and {MAX_TTL}, got {}",
            request.ttl
        )));
    }

    let value = request.value.trim();
    let valid_value = match record_type {
        RecordType::A => value.parse::<Ipv4Addr>().is_ok(),
        RecordType::Aaaa => value.contains(':'),
        RecordType::Cname | RecordType::Ns | RecordType::Mx | RecordType::Ptr => {
            is_hostname(value.trim_end_matches('.'))
        }
        RecordType::Srv => is_hostname(value.trim_end_matches('.')) && request.port.is_some(),
        RecordType::Txt => !value.is_empty(),
        RecordType::Soa => false,
    };
    if !valid_value {
        return Err(invalid(format!(
            "Invalid value for {} record: {}",
            record_type.as_str(),
            request.value
        )));
    }
    Ok((name, record_type))
}

async fn create_dns_record(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<CreateDnsRecordRequest>,
) -> ApiResult<Response> {
    let user = authenticate(&state, &headers).await?;
    let env = owned_environment(&state, &user, &id).await?;
    if env.status == "destroyed" || env.status == "destroying" {
        return Err(ApiError::conflict(
            "INVALID_STATE",
            format!("Environment {id} is {}", env.status),
        ));
    }
    let (name, record_type) = validate_dns_record(&request)?;

    let row = DnsRecordRow {
        id: uuid::Uuid::new_v4().to_string(),
        environment_id: env.id,
        name,
        record_type: record_type.as_str().to_string(),
        value: request.value.trim().to_string(),
        ttl: request.ttl,
        priority: request.priority,
        weight: request.weight,
        port: request.port,
        created_at: Utc::now(),
    };
    state.persistence.insert_dns_record(&row).await?;
    info!(
        environment_id = %row.environment_id,
        name = %row.name,
        record_type = %row.record_type,
        "DNS record created"
    );
    Ok((StatusCode::CREATED, Json(DnsRecordView::from(row))).into_response())
}

async fn list_dns_records(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<DnsRecordView>>> {
    let user = authenticate(&state, &headers).await?;
    owned_environment(&state, &user, &id).await?;
    let records = state.persistence.list_dns_records(&id).await?;
    Ok(Json(records.into_iter().map(DnsRecordView::from).collect()))
}

async fn delete_dns_record(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path((id, record_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let user = authenticate(&state, &headers).await?;
    owned_environment(&state, &user, &id).await?;
    if state.persistence.delete_dns_record(&id, &record_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(
            "NOT_FOUND",
            format!("DNS record not found: {record_id}"),
        ))
    }
}

// ============================================================================
// Sandboxed execution
// ============================================================================

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    language: String,
    code: String,
    /// Seconds.
    #[serde(default)]
    timeout: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ExecutionView {
    id: String,
    language: String,
    status: String,
    output: Option<String>,
    error: Option<String>,
    exit_code: Option<i32>,
    execution_time_ms: Option<i64>,
    memory_used_mb: Option<f64>,
    security_violations: Vec<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<ExecutionRecord> for ExecutionView {
    fn from(record: ExecutionRecord) -> Self {
        Self {
            security_violations: serde_json::from_str(&record.security_violations)
                .unwrap_or_default(),
            id: record.id,
            language: record.language,
            status: record.status,
            output: record.output,
            error: record.error,
            exit_code: record.exit_code,
            execution_time_ms: record.execution_time_ms,
            memory_used_mb: record.memory_used_mb,
            created_at: record.created_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
        }
    }
}

fn owns_execution(caller: &Caller, record: &ExecutionRecord) -> bool {
    match caller {
        Caller::User(identity) => record.user_id.as_deref() == Some(identity.user_id.as_str()),
        Caller::Anonymous { session_id } => {
            record.session_id.as_deref() == Some(session_id.as_str())
        }
    }
}

async fn execute(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(request): Json<ExecuteRequest>,
) -> ApiResult<Json<ExecutionView>> {
    let caller = auth::identify(state.identity.as_ref(), &headers).await?;
    if request.code.trim().is_empty() {
        return Err(ApiError::bad_request("VALIDATION_ERROR", "code must not be empty"));
    }
    if let Some(secs) = request.timeout
        && !(1..=MAX_EXECUTION_TIMEOUT_SECS).contains(&secs)
    {
        return Err(ApiError::bad_request(
            "VALIDATION_ERROR",
            format!("timeout must be between 1 and {MAX_EXECUTION_TIMEOUT_SECS} seconds"),
        ));
    }

    let record = state
        .sandbox
        .execute(ExecutionRequest {
            user_id: caller.user_id().map(String::from),
            session_id: caller.session_id().map(String::from),
            language: request.language,
            code: request.code,
            timeout: request.timeout.map(Duration::from_secs),
        })
        .await?;
    Ok(Json(record.into()))
}

async fn get_execution(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<ExecutionView>> {
    let caller = auth::identify(state.identity.as_ref(), &headers).await?;
    let record = state.sandbox.get(&id).await?;
    if !owns_execution(&caller, &record) {
        return Err(ApiError::not_found(
            "NOT_FOUND",
            format!("Execution not found: {id}"),
        ));
    }
    Ok(Json(record.into()))
}

// ============================================================================
// Credits
// ============================================================================

#[derive(Debug, Serialize)]
struct CreditsView {
    user_id: String,
    balance: f64,
    balance_nanocredits: i64,
}

async fn credits(
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> ApiResult<Json<CreditsView>> {
    let user = authenticate(&state, &headers).await?;
    let balance = state.billing.balance(&user.user_id).await?;
    Ok(Json(CreditsView {
        user_id: user.user_id,
        balance: nanocredits_to_credits(balance),
        balance_nanocredits: balance,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str, kind: &str, value: &str, ttl: i32) -> CreateDnsRecordRequest {
        CreateDnsRecordRequest {
            name: name.to_string(),
            record_type: kind.to_string(),
            value: value.to_string(),
            ttl,
            priority: None,
            weight: None,
            port: None,
        }
    }

    #[test]
    fn test_dns_validation_accepts_and_normalizes() {
        let (name, kind) = validate_dns_record(&request("API.Example.Test.", "a", "10.0.0.1", 300))
            .unwrap();
        assert_eq!(name, "api.example.test");
        assert_eq!(kind, RecordType::A);

        assert!(validate_dns_record(&request("v6.example.test", "AAAA", "fd00::1", 60)).is_ok());
        assert!(validate_dns_record(&request("www.example.test", "CNAME", "api.example.test", 86_400)).is_ok());
        assert!(validate_dns_record(&request("_sip._tcp.example.test", "TXT", "v=spf1 -all", 300)).is_ok());
    }

    #[test]
    fn test_dns_validation_rejects() {
        let cases = [
            request("bad..name", "A", "10.0.0.1", 300),
            request(&"a".repeat(254), "A", "10.0.0.1", 300),
            request("ok.example.test", "A", "999.0.0.1", 300),
            request("ok.example.test", "AAAA", "10.0.0.1", 300),
            request("ok.example.test", "MX", "not a host", 300),
            request("ok.example.test", "A", "10.0.0.1", 59),
            request("ok.example.test", "A", "10.0.0.1", 86_401),
            request("ok.example.test", "SOA", "ns.example.test", 300),
            request("ok.example.test", "SRV", "sip.example.test", 300),
        ];
        for case in cases {
            let err = validate_dns_record(&case).unwrap_err();
            assert_eq!(err.status, StatusCode::BAD_REQUEST, "{case:?}");
        }
    }

    #[test]
    fn test_provision_error_mapping() {
        let err = ApiError::from(ProvisionError::AlreadyDestroyed("env-1".into()));
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.code, "ALREADY_DESTROYED");

        let err = ApiError::from(ProvisionError::Validation("no services".into()));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err = ApiError::from(ProvisionError::NotFound("env-1".into()));
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_owns_execution() {
        let record = ExecutionRecord {
            id: "x".to_string(),
            user_id: None,
            session_id: Some("sess".to_string()),
            language: "python".to_string(),
            code: "print(1)".to_string(),
            status: "completed".to_string(),
            output: None,
            error: None,
            exit_code: Some(0),
            execution_time_ms: None,
            memory_used_mb: None,
            security_violations: "[]".to_string(),
            container_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        assert!(owns_execution(
            &Caller::Anonymous { session_id: "sess".to_string() },
            &record
        ));
        assert!(!owns_execution(
            &Caller::User(UserIdentity { user_id: "alice".to_string() }),
            &record
        ));
    }
}
