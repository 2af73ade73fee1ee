// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lambda endpoints: target-header JSON and REST-style invoke.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use mockcloud_protocol::aws_json::{JsonError, TARGET_HEADER, Target};
use mockcloud_protocol::lambda::{INVOCATION_TYPE_HEADER, InvokeInput, LambdaAction};
use tracing::error;

use super::{GatewayState, json_response, status_code};
use crate::emulators::EmulatorError;
use crate::emulators::lambda::{InvocationResult, LambdaOutput};

const JSON: &str = "application/json";

const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-amz-request-id");
const FUNCTION_ERROR_HEADER: HeaderName = HeaderName::from_static("x-amz-function-error");
const EXECUTED_VERSION_HEADER: HeaderName = HeaderName::from_static("x-amz-executed-version");

fn invocation_type(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(INVOCATION_TYPE_HEADER)
        .and_then(|v| v.to_str().ok())
}

/// `POST /aws/lambda` with `X-Amz-Target: AWSLambda.<Op>20150331`.
pub(super) async fn handle_target(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let environment = match state.resolve(&headers).await {
        Ok(env) => env,
        Err(e) => return error_json(e.status(), e.code(), e.to_string()),
    };
    let target = headers
        .get(TARGET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let action = Target::parse(target)
        .and_then(|t| LambdaAction::decode(&t.operation, invocation_type(&headers), &body));
    match action {
        Ok(action) => execute(&state, &environment, action).await,
        Err(e) => emulator_error(EmulatorError::from(e)),
    }
}

/// `POST /2015-03-31/functions/{name}/invocations`.
pub(super) async fn handle_invoke(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let environment = match state.resolve(&headers).await {
        Ok(env) => env,
        Err(e) => return error_json(e.status(), e.code(), e.to_string()),
    };
    match InvokeInput::from_rest(&name, invocation_type(&headers), &body) {
        Ok(input) => execute(&state, &environment, LambdaAction::Invoke(input)).await,
        Err(e) => emulator_error(EmulatorError::from(e)),
    }
}

async fn execute(
    state: &GatewayState,
    environment: &mockcloud_core::persistence::EnvironmentRecord,
    action: LambdaAction,
) -> Response {
    let name = action.name();
    match state.lambda.execute(environment, action).await {
        Ok(LambdaOutput::Json { status, body }) => match serde_json::to_vec(&body) {
            Ok(body) => json_response(status_code(status), JSON, body),
            Err(e) => emulator_error(EmulatorError::from(e)),
        },
        Ok(LambdaOutput::NoContent) => StatusCode::NO_CONTENT.into_response(),
        Ok(LambdaOutput::Invocation(result)) => invocation_response(result),
        Err(e) => {
            if !e.is_client_error() {
                error!(environment_id = %environment.id, action = name, error = %e, "Lambda action failed");
            }
            emulator_error(e)
        }
    }
}

fn invocation_response(result: InvocationResult) -> Response {
    let mut response = json_response(status_code(result.status), JSON, result.payload);
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&result.request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    headers.insert(EXECUTED_VERSION_HEADER, HeaderValue::from_static("$LATEST"));
    if let Some(kind) = result.function_error
        && let Ok(value) = HeaderValue::from_str(&kind)
    {
        headers.insert(FUNCTION_ERROR_HEADER, value);
    }
    response
}

/// Lambda's own name for an emulator error. Infrastructure failures
/// surface as `ServiceException`.
fn error_code(e: &EmulatorError) -> &'static str {
    match e {
        EmulatorError::Backing(_) | EmulatorError::Core(_) | EmulatorError::Json(_) => {
            "ServiceException"
        }
        other => other.code(),
    }
}

fn emulator_error(e: EmulatorError) -> Response {
    error_json(status_code(e.status()), error_code(&e), e.to_string())
}

fn error_json(status: StatusCode, code: &str, message: String) -> Response {
    let body = serde_json::to_vec(&JsonError::new(None, code, message)).unwrap_or_default();
    json_response(status, JSON, body)
}
