// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lambda emulator.
//!
//! Function definitions are metadata. The first invoke starts the
//! function's runtime container through the materializer and posts the
//! payload to its runtime interface endpoint; later invokes reuse the warm
//! container until the code changes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use mockcloud_core::persistence::{
    EnvironmentRecord, LambdaFunctionRecord, LambdaInvocationRecord,
};
use mockcloud_protocol::lambda::{
    CreateFunctionInput, DEFAULT_HANDLER, DEFAULT_MEMORY_MB, DEFAULT_ROLE, DEFAULT_RUNTIME,
    DEFAULT_TIMEOUT_SECS, InvocationType, InvokeInput, LambdaAction, function_arn,
};
use mockcloud_protocol::{ACCOUNT_ID, REGION};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{EmulatorContext, EmulatorError, Result, hex_id};
use crate::billing::lambda_cost;

const NOT_FOUND: &str = "ResourceNotFoundException";
const CONFLICT: &str = "ResourceConflictException";
const INVALID_VALUE: &str = "InvalidParameterValueException";

/// Extra time allowed on top of the function timeout for a cold start.
const COLD_START_GRACE: Duration = Duration::from_secs(30);

/// Response of a runtime interface endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Delivers an invocation payload to a function container.
#[async_trait]
pub trait LambdaTransport: Send + Sync {
    /// POST `payload` to `endpoint`. `Err` means the function could not be
    /// reached at all.
    async fn invoke(
        &self,
        endpoint: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> std::result::Result<TransportResponse, String>;
}

/// [`LambdaTransport`] over HTTP. Connection failures are retried while
/// a freshly started runtime is still binding its port.
pub struct HttpLambdaTransport {
    client: reqwest::Client,
    connect_attempts: u32,
    retry_delay: Duration,
}

impl HttpLambdaTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            connect_attempts: 25,
            retry_delay: Duration::from_millis(200),
        }
    }
}

impl Default for HttpLambdaTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LambdaTransport for HttpLambdaTransport {
    async fn invoke(
        &self,
        endpoint: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> std::result::Result<TransportResponse, String> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let sent = self
                .client
                .post(endpoint)
                .timeout(timeout)
                .header("content-type", "application/json")
                .body(payload.clone())
                .send()
                .await;
            match sent {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response.bytes().await.map_err(|e| e.to_string())?;
                    return Ok(TransportResponse {
                        status,
                        body: body.to_vec(),
                    });
                }
                Err(e) if e.is_connect() && attempt < self.connect_attempts => {
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e.to_string()),
            }
        }
    }
}

/// Outcome of an invoke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationResult {
    /// 200, 202 (Event) or 204 (DryRun).
    pub status: u16,
    pub request_id: String,
    pub payload: Vec<u8>,
    /// `Unhandled` when the function reported an error.
    pub function_error: Option<String>,
}

/// Result of a Lambda action, rendered by the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum LambdaOutput {
    Json { status: u16, body: Value },
    NoContent,
    Invocation(InvocationResult),
}

/// Executes Lambda actions for one environment.
#[derive(Clone)]
pub struct LambdaEmulator {
    ctx: EmulatorContext,
    transport: Arc<dyn LambdaTransport>,
}

impl LambdaEmulator {
    pub fn new(ctx: EmulatorContext, transport: Arc<dyn LambdaTransport>) -> Self {
        Self { ctx, transport }
    }

    /// Execute a decoded action.
    pub async fn execute(
        &self,
        env: &EnvironmentRecord,
        action: LambdaAction,
    ) -> Result<LambdaOutput> {
        match action {
            LambdaAction::CreateFunction(input) => self.create_function(env, input).await,
            LambdaAction::GetFunction { function_name } => {
                let function = self.function(env, &function_name).await?;
                Ok(LambdaOutput::Json {
                    status: 200,
                    body: json!({
                        "Configuration": configuration(&function),
                        "Code": {
                            "RepositoryType": "S3",
                            "Location": format!(
                                "https://awslambda-{REGION}-tasks.s3.{REGION}.amazonaws.com/snapshots/{ACCOUNT_ID}/{}",
                                function.name
                            ),
                        },
                    }),
                })
            }
            LambdaAction::ListFunctions => {
                let functions: Vec<Value> = self
                    .ctx
                    .persistence
                    .list_lambda_functions(&env.id)
                    .await?
                    .iter()
                    .map(configuration)
                    .collect();
                Ok(LambdaOutput::Json {
                    status: 200,
                    body: json!({ "Functions": functions }),
                })
            }
            LambdaAction::UpdateFunctionCode {
                function_name,
                zip_file,
            } => {
                let function = self.function(env, &function_name).await?;
                let (size, sha256) = package_digest(&zip_file)?;
                let now = Utc::now();
                self.ctx
                    .persistence
                    .update_lambda_code(&function.id, &zip_file, size, &sha256, now)
                    .await?;
                self.ctx.materializer.invalidate_lambda(&function).await?;
                info!(environment_id = %env.id, function = %function.name, "Function code updated");

                let function = self.function(env, &function_name).await?;
                Ok(LambdaOutput::Json {
                    status: 200,
                    body: configuration(&function),
                })
            }
            LambdaAction::DeleteFunction { function_name } => {
                let function = self.function(env, &function_name).await?;
                self.ctx.materializer.invalidate_lambda(&function).await?;
                self.ctx
                    .persistence
                    .delete_lambda_function(&function.id)
                    .await?;
                info!(environment_id = %env.id, function = %function.name, "Function deleted");
                Ok(LambdaOutput::NoContent)
            }
            LambdaAction::Invoke(input) => self.invoke(env, input).await,
        }
    }

    async fn create_function(
        &self,
        env: &EnvironmentRecord,
        input: CreateFunctionInput,
    ) -> Result<LambdaOutput> {
        validate_function_name(&input.function_name)?;
        let memory_size = input.memory_size.unwrap_or(DEFAULT_MEMORY_MB);
        if !(128..=10_240).contains(&memory_size) {
            return Err(EmulatorError::validation(
                INVALID_VALUE,
                format!("MemorySize {memory_size} is outside the allowed range 128-10240"),
            ));
        }
        let timeout = input.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS);
        if !(1..=900).contains(&timeout) {
            return Err(EmulatorError::validation(
                INVALID_VALUE,
                format!("Timeout {timeout} is outside the allowed range 1-900"),
            ));
        }
        let code_zip = input.code.zip_file.unwrap_or_default();
        let (code_size, code_sha256) = package_digest(&code_zip)?;

        let now = Utc::now();
        let function = LambdaFunctionRecord {
            id: hex_id("lambda-", 16),
            environment_id: env.id.clone(),
            arn: function_arn(&input.function_name),
            name: input.function_name,
            runtime: input.runtime.unwrap_or_else(|| DEFAULT_RUNTIME.to_string()),
            handler: input.handler.unwrap_or_else(|| DEFAULT_HANDLER.to_string()),
            role: input.role.unwrap_or_else(|| DEFAULT_ROLE.to_string()),
            description: input.description.unwrap_or_default(),
            code_zip,
            code_size,
            code_sha256,
            memory_size: memory_size as i32,
            timeout: timeout as i32,
            environment_vars: serde_json::to_string(&input.environment.variables)?,
            state: "Active".to_string(),
            last_update_status: "Successful".to_string(),
            backing_handle: None,
            created_at: now,
            last_modified: now,
        };
        if let Err(e) = self.ctx.persistence.insert_lambda_function(&function).await {
            if e.is_unique_violation() {
                return Err(EmulatorError::already_exists(
                    CONFLICT,
                    format!("Function already exist: {}", function.name),
                ));
            }
            return Err(e.into());
        }
        info!(environment_id = %env.id, function = %function.name, "Function created");
        Ok(LambdaOutput::Json {
            status: 201,
            body: configuration(&function),
        })
    }

    async fn invoke(&self, env: &EnvironmentRecord, input: InvokeInput) -> Result<LambdaOutput> {
        let function = self.function(env, &input.function_name).await?;
        let request_id = Uuid::new_v4().to_string();

        if input.invocation_type == InvocationType::DryRun {
            return Ok(LambdaOutput::Invocation(InvocationResult {
                status: 204,
                request_id,
                payload: Vec::new(),
                function_error: None,
            }));
        }
        self.ctx.require_funds(env).await?;

        if input.invocation_type == InvocationType::Event {
            let this = self.clone();
            let env = env.clone();
            let id = request_id.clone();
            tokio::spawn(async move {
                if let Err(e) = this
                    .run(&env, &function, InvocationType::Event, input.payload, &id)
                    .await
                {
                    warn!(function = %function.name, request_id = %id, error = %e, "Async invocation failed");
                }
            });
            return Ok(LambdaOutput::Invocation(InvocationResult {
                status: 202,
                request_id,
                payload: Vec::new(),
                function_error: None,
            }));
        }

        let result = self
            .run(
                env,
                &function,
                InvocationType::RequestResponse,
                input.payload,
                &request_id,
            )
            .await?;
        Ok(LambdaOutput::Invocation(result))
    }

    /// Materialize, post, record and bill one invocation.
    async fn run(
        &self,
        env: &EnvironmentRecord,
        function: &LambdaFunctionRecord,
        invocation_type: InvocationType,
        payload: Vec<u8>,
        request_id: &str,
    ) -> Result<InvocationResult> {
        let mut record = LambdaInvocationRecord {
            id: request_id.to_string(),
            function_id: function.id.clone(),
            invocation_type: invocation_type.as_str().to_string(),
            payload: String::from_utf8_lossy(&payload).into_owned(),
            response: None,
            status_code: 500,
            duration_ms: 0,
            billed_duration_ms: 0,
            memory_used_mb: 0,
            function_error: None,
            error_message: None,
            created_at: Utc::now(),
        };

        let handle = match self.ctx.materializer.materialize_lambda(function).await {
            Ok(handle) => handle,
            Err(e) => {
                let e = EmulatorError::from(e);
                self.record_failure(record, &e).await;
                return Err(e);
            }
        };
        let Some(endpoint) = handle.endpoint.clone() else {
            let e = EmulatorError::Backing("function container has no endpoint".to_string());
            self.record_failure(record, &e).await;
            return Err(e);
        };

        let timeout = Duration::from_secs(function.timeout.max(1) as u64) + COLD_START_GRACE;
        let started = Instant::now();
        let sent = self.transport.invoke(&endpoint, payload, timeout).await;
        let duration_ms = started.elapsed().as_millis() as i64;
        let response = match sent {
            Ok(response) => response,
            Err(reason) => {
                record.duration_ms = duration_ms;
                let e = EmulatorError::Backing(reason);
                self.record_failure(record, &e).await;
                return Err(e);
            }
        };

        let billed = billed_duration_ms(duration_ms);
        let error_message = function_error_message(&response.body);
        let function_error = error_message.as_ref().map(|_| "Unhandled".to_string());
        record.response = Some(String::from_utf8_lossy(&response.body).into_owned());
        record.status_code = 200;
        record.duration_ms = duration_ms;
        record.billed_duration_ms = billed;
        record.memory_used_mb = self.memory_used_mb(handle.handle_id.as_deref()).await;
        record.function_error = function_error.clone();
        record.error_message = error_message;
        if let Err(e) = self.ctx.persistence.insert_lambda_invocation(&record).await {
            error!(request_id = %request_id, error = %e, "Failed to record invocation");
        }

        self.ctx
            .charge(
                env,
                "lambda",
                "Invoke",
                1,
                lambda_cost(billed, i64::from(function.memory_size), 1),
            )
            .await;
        info!(
            function = %function.name,
            request_id = %request_id,
            duration_ms,
            billed_duration_ms = billed,
            function_error = function_error.is_some(),
            "Function invoked"
        );

        Ok(InvocationResult {
            status: 200,
            request_id: request_id.to_string(),
            payload: response.body,
            function_error,
        })
    }

    async fn record_failure(&self, mut record: LambdaInvocationRecord, cause: &EmulatorError) {
        record.status_code = i32::from(cause.status());
        record.error_message = Some(cause.to_string());
        if let Err(e) = self.ctx.persistence.insert_lambda_invocation(&record).await {
            error!(request_id = %record.id, error = %e, "Failed to record invocation");
        }
    }

    async fn memory_used_mb(&self, container_id: Option<&str>) -> i32 {
        let Some(id) = container_id else {
            return 0;
        };
        match self.ctx.materializer.provisioner().runtime().stats(id).await {
            Ok(stats) => stats
                .memory_peak_bytes
                .or(stats.memory_usage_bytes)
                .map(|b| (b / (1024 * 1024)) as i32)
                .unwrap_or(0),
            Err(_) => 0,
        }
    }

    async fn function(&self, env: &EnvironmentRecord, name: &str) -> Result<LambdaFunctionRecord> {
        // Callers may address a function by ARN.
        let name = name.rsplit(':').next().unwrap_or(name);
        self.ctx
            .persistence
            .get_lambda_function(&env.id, name)
            .await?
            .ok_or_else(|| {
                EmulatorError::not_found(
                    NOT_FOUND,
                    format!("Function not found: {}", function_arn(name)),
                )
            })
    }
}

/// Billed duration: the next whole 100 ms block above the measured time.
pub fn billed_duration_ms(duration_ms: i64) -> i64 {
    (duration_ms.max(0) / 100 + 1) * 100
}

/// `errorMessage` of a payload that reports a function error.
fn function_error_message(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let object = value.as_object()?;
    if !object.contains_key("errorMessage") && !object.contains_key("errorType") {
        return None;
    }
    Some(
        object
            .get("errorMessage")
            .and_then(Value::as_str)
            .or_else(|| object.get("errorType").and_then(Value::as_str))
            .unwrap_or_default()
            .to_string(),
    )
}

/// Size and base64 SHA-256 of a base64 deployment package.
fn package_digest(code_zip: &str) -> Result<(i64, String)> {
    let bytes = BASE64.decode(code_zip.trim()).map_err(|_| {
        EmulatorError::validation(
            INVALID_VALUE,
            "Could not unzip uploaded file. Please check your file, then try to upload again.",
        )
    })?;
    Ok((
        bytes.len() as i64,
        BASE64.encode(Sha256::digest(&bytes)),
    ))
}

fn validate_function_name(name: &str) -> Result<()> {
    let valid = (1..=64).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(EmulatorError::validation(
            INVALID_VALUE,
            format!("1 validation error detected: Value '{name}' at 'functionName' failed to satisfy constraint"),
        ));
    }
    Ok(())
}

fn lambda_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3f+0000").to_string()
}

/// `FunctionConfiguration` document.
pub fn configuration(function: &LambdaFunctionRecord) -> Value {
    let variables: Value =
        serde_json::from_str(&function.environment_vars).unwrap_or_else(|_| json!({}));
    json!({
        "FunctionName": function.name,
        "FunctionArn": function.arn,
        "Runtime": function.runtime,
        "Role": function.role,
        "Handler": function.handler,
        "CodeSize": function.code_size,
        "CodeSha256": function.code_sha256,
        "Description": function.description,
        "Timeout": function.timeout,
        "MemorySize": function.memory_size,
        "LastModified": lambda_timestamp(function.last_modified),
        "Version": "$LATEST",
        "Environment": { "Variables": variables },
        "State": function.state,
        "LastUpdateStatus": function.last_update_status,
        "PackageType": "Zip",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billed_duration_rounds_up_to_next_block() {
        assert_eq!(billed_duration_ms(0), 100);
        assert_eq!(billed_duration_ms(42), 100);
        assert_eq!(billed_duration_ms(100), 200);
        assert_eq!(billed_duration_ms(250), 300);
    }

    #[test]
    fn test_function_error_detection() {
        assert_eq!(
            function_error_message(br#"{"errorMessage":"boom","errorType":"ValueError"}"#),
            Some("boom".to_string())
        );
        assert_eq!(
            function_error_message(br#"{"errorType":"Timeout"}"#),
            Some("Timeout".to_string())
        );
        assert_eq!(function_error_message(br#"{"statusCode":200}"#), None);
        assert_eq!(function_error_message(b"not json"), None);
    }

    #[test]
    fn test_package_digest() {
        let (size, sha) = package_digest("aGVsbG8=").unwrap();
        assert_eq!(size, 5);
        assert_eq!(sha, "LPJNul+wow4m6DsqxbninhsWHlwfp0JecwQzYpOLmCQ=");
        assert!(package_digest("***").is_err());
    }

    #[test]
    fn test_function_name_validation() {
        assert!(validate_function_name("hello-world_1").is_ok());
        assert!(validate_function_name("").is_err());
        assert!(validate_function_name("has space").is_err());
    }
}
