// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DynamoDB JSON endpoint (`X-Amz-Target: DynamoDB_20120810.<Op>`).

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use mockcloud_protocol::aws_json::{CONTENT_TYPE_1_0, JsonError, TARGET_HEADER, Target};
use mockcloud_protocol::dynamodb::{DynamoAction, ERROR_PREFIX, TARGET_PREFIX};
use serde::Serialize;
use tracing::error;

use super::{GatewayState, json_response, status_code};
use crate::emulators::EmulatorError;

pub(super) async fn handle(
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
    let operation = match Target::parse(target) {
        Ok(target) if target.service.is_empty() || target.service == TARGET_PREFIX => {
            target.operation
        }
        Ok(target) => {
            return error_json(
                StatusCode::BAD_REQUEST,
                "UnknownOperationException",
                format!("Unknown target service {}", target.service),
            );
        }
        Err(e) => return emulator_error(EmulatorError::from(e)),
    };

    let action = match DynamoAction::decode(&operation, &body) {
        Ok(action) => action,
        Err(e) => return emulator_error(EmulatorError::from(e)),
    };
    let name = action.name();
    match state.dynamodb.execute(&environment, action).await {
        Ok(value) => match serde_json::to_vec(&value) {
            Ok(body) => json_response(StatusCode::OK, CONTENT_TYPE_1_0, body),
            Err(e) => emulator_error(EmulatorError::from(e)),
        },
        Err(e) => {
            if !e.is_client_error() {
                error!(environment_id = %environment.id, action = name, error = %e, "DynamoDB action failed");
            }
            emulator_error(e)
        }
    }
}

/// DynamoDB's own name for an emulator error.
fn error_code(e: &EmulatorError) -> &'static str {
    match e {
        EmulatorError::InvalidAction(_) => "UnknownOperationException",
        EmulatorError::Protocol(_) => "ValidationException",
        EmulatorError::InsufficientCredit(_) => "InsufficientCredit",
        EmulatorError::ServiceUnavailable(_) => "ServiceUnavailable",
        EmulatorError::Backing(_) | EmulatorError::Core(_) | EmulatorError::Json(_) => {
            "InternalServerError"
        }
        other => other.code(),
    }
}

fn emulator_error(e: EmulatorError) -> Response {
    error_json(status_code(e.query_status()), error_code(&e), e.to_string())
}

fn error_json(status: StatusCode, code: &str, message: String) -> Response {
    render(status, &JsonError::new(Some(ERROR_PREFIX), code, message))
}

fn render(status: StatusCode, body: &impl Serialize) -> Response {
    let body = serde_json::to_vec(body).unwrap_or_default();
    json_response(status, CONTENT_TYPE_1_0, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockcloud_protocol::ProtocolError;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            error_code(&EmulatorError::from(ProtocolError::UnknownAction("Foo".into()))),
            "UnknownOperationException"
        );
        assert_eq!(
            error_code(&EmulatorError::from(ProtocolError::MissingParameter("TableName".into()))),
            "ValidationException"
        );
        assert_eq!(
            error_code(&EmulatorError::not_found("ResourceNotFoundException", "missing")),
            "ResourceNotFoundException"
        );
        assert_eq!(
            error_code(&EmulatorError::Backing("boom".into())),
            "InternalServerError"
        );
    }
}
