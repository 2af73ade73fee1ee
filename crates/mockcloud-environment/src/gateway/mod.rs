// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP surface: the cloud API gateway and the control API.
//!
//! Gateway requests are resolved to a running environment, decoded once
//! into a typed action and handed to the matching emulator. Errors are
//! rendered in the native shape of the protocol that carried the request.

mod control;
mod dynamodb;
mod ec2;
mod lambda;
mod s3;
mod sqs;

pub use control::ApiError;

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::header::{CONTENT_TYPE, HOST};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use chrono::Utc;
use mockcloud_core::persistence::EnvironmentRecord;
use mockcloud_core::{CoreError, Persistence};
use serde_json::json;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::auth::IdentityProvider;
use crate::billing::BillingEngine;
use crate::emulators::{DynamoEmulator, LambdaEmulator, S3Emulator, SqsEmulator, VpcEmulator};
use crate::provisioner::Provisioner;
use crate::sandbox::Sandbox;

/// Header naming the target environment when the Host carries none.
pub const ENVIRONMENT_HEADER: &str = "x-mock-environment-id";

const XML_CONTENT_TYPE: &str = "text/xml";

/// Everything a request handler needs.
#[derive(Clone)]
pub struct GatewayState {
    pub persistence: Arc<dyn Persistence>,
    pub provisioner: Provisioner,
    pub billing: BillingEngine,
    pub sandbox: Sandbox,
    pub vpc: VpcEmulator,
    pub sqs: SqsEmulator,
    pub s3: S3Emulator,
    pub dynamodb: DynamoEmulator,
    pub lambda: LambdaEmulator,
    pub identity: Arc<dyn IdentityProvider>,
}

/// Failures resolving the target environment.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Neither the Host nor the header names an environment.
    #[error("No environment specified; use an env-<id> subdomain or the X-Mock-Environment-ID header")]
    MissingEnvironment,

    /// The environment does not exist or is not running.
    #[error("Environment {0} does not exist or is not running")]
    EnvironmentNotRunning(String),

    /// The store failed.
    #[error("Internal error: {0}")]
    Core(#[from] CoreError),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingEnvironment => "MissingEnvironment",
            Self::EnvironmentNotRunning(_) => "InvalidEnvironment",
            Self::Core(_) => "InternalFailure",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingEnvironment => StatusCode::BAD_REQUEST,
            Self::EnvironmentNotRunning(_) => StatusCode::NOT_FOUND,
            Self::Core(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// The environment id a request addresses: the first Host label when it
/// starts with `env-`, else the [`ENVIRONMENT_HEADER`].
pub fn environment_id(headers: &HeaderMap) -> Option<String> {
    let from_host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .and_then(|host| host.split(':').next())
        .and_then(|host| host.split('.').next())
        .filter(|label| label.starts_with("env-") && label.len() > 4)
        .map(str::to_ascii_lowercase);
    from_host.or_else(|| {
        headers
            .get(ENVIRONMENT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from)
    })
}

impl GatewayState {
    /// Resolve the running environment a request targets and record the
    /// activity.
    pub async fn resolve(&self, headers: &HeaderMap) -> Result<EnvironmentRecord, GatewayError> {
        let id = environment_id(headers).ok_or(GatewayError::MissingEnvironment)?;
        let environment = match self.persistence.get_environment(&id).await? {
            Some(env) if env.status == "running" => env,
            _ => return Err(GatewayError::EnvironmentNotRunning(id)),
        };
        if let Err(e) = self.persistence.touch_environment(&id, Utc::now()).await {
            warn!(environment_id = %id, error = %e, "Failed to record activity");
        }
        Ok(environment)
    }
}

/// Build the full router.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", post(ec2::handle_root))
        .route("/aws/ec2", post(ec2::handle))
        .route("/aws/sqs", get(sqs::handle).post(sqs::handle))
        .route("/aws/dynamodb", post(dynamodb::handle))
        .route("/aws/s3", get(s3::handle_service))
        .route("/aws/s3/", get(s3::handle_service))
        .route("/aws/s3/{bucket}", any(s3::handle_bucket))
        .route("/aws/s3/{bucket}/", any(s3::handle_bucket))
        .route(
            "/aws/s3/{bucket}/{*key}",
            any(s3::handle_object).layer(DefaultBodyLimit::max(s3::BODY_LIMIT)),
        )
        .route("/aws/lambda", post(lambda::handle_target))
        .route(
            "/2015-03-31/functions/{name}/invocations",
            post(lambda::handle_invoke),
        )
        .route("/health", get(health))
        .nest("/api/v1", control::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<GatewayState>) -> Response {
    match state.persistence.health_check_db().await {
        Ok(true) => Json(json!({ "status": "ok", "database": true })).into_response(),
        Ok(false) | Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "database": false })),
        )
            .into_response(),
    }
}

fn request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn status_code(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn xml_response(status: StatusCode, body: String) -> Response {
    let mut response = (status, body).into_response();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(XML_CONTENT_TYPE));
    response
}

fn json_response(status: StatusCode, content_type: &'static str, body: Vec<u8>) -> Response {
    let mut response = (status, body).into_response();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_environment_id_from_host() {
        let map = headers(&[("host", "env-abc123def456.mockcloud.local:8080")]);
        assert_eq!(environment_id(&map).as_deref(), Some("env-abc123def456"));
    }

    #[test]
    fn test_environment_id_from_header() {
        let map = headers(&[
            ("host", "localhost:8080"),
            ("x-mock-environment-id", "env-abc123def456"),
        ]);
        assert_eq!(environment_id(&map).as_deref(), Some("env-abc123def456"));
    }

    #[test]
    fn test_host_takes_precedence() {
        let map = headers(&[
            ("host", "env-aaaaaaaaaaaa.mockcloud.local"),
            ("x-mock-environment-id", "env-bbbbbbbbbbbb"),
        ]);
        assert_eq!(environment_id(&map).as_deref(), Some("env-aaaaaaaaaaaa"));
    }

    #[test]
    fn test_no_environment() {
        assert_eq!(environment_id(&headers(&[("host", "api.mockcloud.local")])), None);
        assert_eq!(environment_id(&HeaderMap::new()), None);
    }
}
