// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for mockcloud-environment integration tests.
//!
//! Provides TestContext wiring an in-memory SQLite store, the mock container
//! runtime, the mock cloud network and a scripted Lambda transport into the
//! real gateway router.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use bytes::Bytes;
use mockcloud_core::persistence::EnvironmentRecord;
use mockcloud_core::{Persistence, SqlitePersistence};
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::Mutex;
use tower::ServiceExt;

use mockcloud_environment::auth::StaticTokenIdentity;
use mockcloud_environment::cloud_network::MockCloudNetwork;
use mockcloud_environment::emulators::LambdaTransport;
use mockcloud_environment::emulators::lambda::TransportResponse;
use mockcloud_environment::gateway::{self, ENVIRONMENT_HEADER, GatewayState};
use mockcloud_environment::provisioner::{NewEnvironment, ServiceRequest};
use mockcloud_environment::runner::MockRuntime;
use mockcloud_environment::runtime::EnvironmentRuntime;

/// Bearer token of the user `alice`.
pub const ALICE: &str = "token-alice";
/// Bearer token of the user `bob`.
pub const BOB: &str = "token-bob";

/// One credit, in nanocredits.
pub const ONE_CREDIT: i64 = 1_000_000_000;

/// Lambda transport that answers every invoke with a fixed body.
pub struct ScriptedTransport {
    pub body: Vec<u8>,
    pub invocations: Mutex<Vec<(String, Vec<u8>)>>,
}

impl ScriptedTransport {
    pub fn new(body: &str) -> Self {
        Self {
            body: body.as_bytes().to_vec(),
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub async fn count(&self) -> usize {
        self.invocations.lock().await.len()
    }
}

#[async_trait]
impl LambdaTransport for ScriptedTransport {
    async fn invoke(
        &self,
        endpoint: &str,
        payload: Vec<u8>,
        _timeout: Duration,
    ) -> Result<TransportResponse, String> {
        self.invocations
            .lock()
            .await
            .push((endpoint.to_string(), payload));
        Ok(TransportResponse {
            status: 200,
            body: self.body.clone(),
        })
    }
}

/// A response read to completion.
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or_else(|e| {
            panic!("response is not JSON ({e}): {}", self.text())
        })
    }
}

/// Test context holding the gateway and the mocks behind it.
pub struct TestContext {
    pub persistence: Arc<dyn Persistence>,
    pub runtime: Arc<MockRuntime>,
    pub network: Arc<MockCloudNetwork>,
    pub transport: Arc<ScriptedTransport>,
    pub state: GatewayState,
    pub router: Router,
    _temp_dir: tempfile::TempDir,
}

impl TestContext {
    /// Create a context with default mocks.
    pub async fn new() -> Self {
        Self::with_runtime(MockRuntime::new()).await
    }

    /// Create a context around a configured mock runtime.
    pub async fn with_runtime(runtime: MockRuntime) -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to open in-memory database");
        mockcloud_core::migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");
        let persistence: Arc<dyn Persistence> = Arc::new(SqlitePersistence::new(pool));

        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let runtime = Arc::new(runtime);
        let network = Arc::new(MockCloudNetwork::new());
        let transport = Arc::new(ScriptedTransport::new(r#"{"ok":true}"#));

        let config = EnvironmentRuntime::builder()
            .persistence(persistence.clone())
            .container_runtime(runtime.clone())
            .network(network.clone())
            .identity(Arc::new(StaticTokenIdentity::parse(&format!(
                "{ALICE}:alice,{BOB}:bob"
            ))))
            .lambda_transport(transport.clone())
            .data_dir(temp_dir.path())
            .port_range(31000, 31099)
            .build()
            .expect("Failed to build runtime config");
        let state = config.gateway_state();
        let router = gateway::router(state.clone());

        Self {
            persistence,
            runtime,
            network,
            transport,
            state,
            router,
            _temp_dir: temp_dir,
        }
    }

    /// Give `user_id` some credit.
    pub async fn fund(&self, user_id: &str, nanocredits: i64) {
        self.state
            .billing
            .add_credits(user_id, nanocredits)
            .await
            .expect("Failed to add credits");
    }

    /// Create a running environment owned by `user_id`.
    pub async fn environment(&self, user_id: &str, services: &[&str]) -> EnvironmentRecord {
        self.state
            .provisioner
            .create(NewEnvironment {
                user_id: user_id.to_string(),
                name: None,
                services: services
                    .iter()
                    .map(|s| ServiceRequest {
                        service_type: s.to_string(),
                        version: None,
                        config: serde_json::Value::Null,
                    })
                    .collect(),
                auto_shutdown_hours: None,
            })
            .await
            .expect("Failed to create environment")
    }

    /// Send a request through the router.
    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("Failed to read body");
        TestResponse {
            status,
            headers,
            body,
        }
    }

    /// POST a form-encoded Query protocol request to `path`.
    pub async fn query(&self, path: &str, environment_id: &str, form: &[(&str, &str)]) -> TestResponse {
        let body = form
            .iter()
            .map(|(k, v)| format!("{}={}", encode(k), encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        self.send(
            Request::post(path)
                .header(ENVIRONMENT_HEADER, environment_id)
                .header("content-type", "application/x-www-form-urlencoded")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
    }

    /// POST an AWS JSON protocol request.
    pub async fn aws_json(
        &self,
        path: &str,
        environment_id: &str,
        target: &str,
        body: serde_json::Value,
    ) -> TestResponse {
        self.send(
            Request::post(path)
                .header(ENVIRONMENT_HEADER, environment_id)
                .header("x-amz-target", target)
                .header("content-type", "application/x-amz-json-1.0")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    /// Call the control API.
    pub async fn api(
        &self,
        method: &str,
        path: &str,
        token: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> TestResponse {
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("/api/v1{path}"));
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        self.send(builder.body(body).unwrap()).await
    }
}

/// Percent-encode a form component.
pub fn encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Text of the first `<tag>` element in `xml`.
pub fn xml_text<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(&xml[start..end])
}
