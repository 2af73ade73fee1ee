// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! OCI Core Services client for network primitives.
//!
//! Talks to the `20160918` REST surface with a bearer token. Every create
//! request carries the configured compartment id, so nothing this client
//! makes can land outside that compartment.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::*;
use crate::config::OciConfig;

const API_VERSION: &str = "20160918";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OciObject {
    id: String,
    #[serde(default)]
    lifecycle_state: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddRulesResponse {
    #[serde(default)]
    security_rules: Vec<OciObject>,
}

/// OCI network client.
pub struct OciNetworkClient {
    http: reqwest::Client,
    endpoint: String,
    compartment_id: String,
    auth_token: String,
}

impl OciNetworkClient {
    /// Create a client from configuration.
    pub fn new(config: &OciConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            compartment_id: config.compartment_id.clone(),
            auth_token: config.auth_token.clone(),
        }
    }

    /// The compartment objects are created in.
    pub fn compartment_id(&self) -> &str {
        &self.compartment_id
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.endpoint, API_VERSION, path)
    }

    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<Option<Value>> {
        let url = self.url(path);
        debug!(method = %method, url = %url, "OCI request");

        let mut request = self
            .http
            .request(method, &url)
            .bearer_auth(&self.auth_token);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| NetworkError::Http(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| NetworkError::Http(e.to_string()))?;

        match status {
            s if s.is_success() => {
                if text.trim().is_empty() {
                    Ok(None)
                } else {
                    serde_json::from_str(&text)
                        .map(Some)
                        .map_err(|e| NetworkError::Http(format!("invalid response body: {e}")))
                }
            }
            StatusCode::NOT_FOUND => Err(NetworkError::NotFound(path.to_string())),
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
                Err(NetworkError::Conflict(text))
            }
            other => Err(NetworkError::Api {
                status: other.as_u16(),
                message: text,
            }),
        }
    }

    async fn create(&self, path: &str, body: Value) -> Result<CloudObject> {
        let value = self
            .send(Method::POST, path, Some(body))
            .await?
            .ok_or_else(|| NetworkError::Http(format!("empty response creating {path}")))?;
        let object: OciObject = serde_json::from_value(value)
            .map_err(|e| NetworkError::Http(format!("invalid response body: {e}")))?;
        Ok(CloudObject {
            id: object.id,
            lifecycle_state: object
                .lifecycle_state
                .unwrap_or_else(|| "PROVISIONING".to_string()),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.send(Method::DELETE, path, None).await.map(|_| ())
    }
}

/// Body of an `addSecurityRules` request for one ingress rule.
pub fn ingress_rule_body(rule: &NsgRuleSpec) -> Value {
    let mut security_rule = json!({
        "direction": "INGRESS",
        "protocol": rule.protocol,
        "source": rule.source_cidr,
        "sourceType": "CIDR_BLOCK",
        "isStateless": false,
    });

    let options_key = match rule.protocol.as_str() {
        "6" => Some("tcpOptions"),
        "17" => Some("udpOptions"),
        _ => None,
    };
    if let (Some(key), Some(min)) = (options_key, rule.port_min) {
        let max = rule.port_max.unwrap_or(min);
        security_rule[key] = json!({
            "destinationPortRange": { "min": min, "max": max }
        });
    }

    json!({ "securityRules": [security_rule] })
}

#[async_trait]
impl CloudNetwork for OciNetworkClient {
    fn provider_type(&self) -> &'static str {
        "oci"
    }

    async fn create_vcn(&self, spec: &VcnSpec) -> Result<CloudObject> {
        self.create(
            "vcns",
            json!({
                "compartmentId": self.compartment_id,
                "cidrBlock": spec.cidr_block,
                "displayName": spec.display_name,
                "dnsLabel": spec.dns_label,
            }),
        )
        .await
    }

    async fn delete_vcn(&self, id: &str) -> Result<()> {
        self.delete(&format!("vcns/{id}")).await
    }

    async fn create_subnet(&self, spec: &SubnetSpec) -> Result<CloudObject> {
        self.create(
            "subnets",
            json!({
                "compartmentId": self.compartment_id,
                "vcnId": spec.vcn_id,
                "cidrBlock": spec.cidr_block,
                "displayName": spec.display_name,
            }),
        )
        .await
    }

    async fn delete_subnet(&self, id: &str) -> Result<()> {
        self.delete(&format!("subnets/{id}")).await
    }

    async fn create_internet_gateway(
        &self,
        vcn_id: &str,
        display_name: &str,
    ) -> Result<CloudObject> {
        self.create(
            "internetGateways",
            json!({
                "compartmentId": self.compartment_id,
                "vcnId": vcn_id,
                "displayName": display_name,
                "isEnabled": true,
            }),
        )
        .await
    }

    async fn delete_internet_gateway(&self, id: &str) -> Result<()> {
        self.delete(&format!("internetGateways/{id}")).await
    }

    async fn create_nsg(&self, vcn_id: &str, display_name: &str) -> Result<CloudObject> {
        self.create(
            "networkSecurityGroups",
            json!({
                "compartmentId": self.compartment_id,
                "vcnId": vcn_id,
                "displayName": display_name,
            }),
        )
        .await
    }

    async fn delete_nsg(&self, id: &str) -> Result<()> {
        self.delete(&format!("networkSecurityGroups/{id}")).await
    }

    async fn add_nsg_rule(&self, nsg_id: &str, rule: &NsgRuleSpec) -> Result<String> {
        let value = self
            .send(
                Method::POST,
                &format!("networkSecurityGroups/{nsg_id}/actions/addSecurityRules"),
                Some(ingress_rule_body(rule)),
            )
            .await?
            .unwrap_or(Value::Null);
        let response: AddRulesResponse = serde_json::from_value(value)
            .map_err(|e| NetworkError::Http(format!("invalid response body: {e}")))?;
        response
            .security_rules
            .into_iter()
            .next()
            .map(|r| r.id)
            .ok_or_else(|| NetworkError::Http("addSecurityRules returned no rule".to_string()))
    }
}
