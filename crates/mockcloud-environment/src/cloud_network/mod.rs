// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cloud network adapter.
//!
//! Real network primitives (VCNs, subnets, internet gateways and network
//! security groups) created in one dedicated compartment. Emulated VPCs are
//! realized through this trait on their first wiring action.

pub mod mock;
pub mod oci;

pub use mock::MockCloudNetwork;
pub use oci::OciNetworkClient;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from cloud network operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NetworkError {
    /// The object does not exist.
    #[error("Cloud object not found: {0}")]
    NotFound(String),

    /// The object is in a state that forbids the operation (e.g. a VCN
    /// with children).
    #[error("Cloud conflict: {0}")]
    Conflict(String),

    /// The API answered with an error status.
    #[error("Cloud API error {status}: {message}")]
    Api {
        /// HTTP status.
        status: u16,
        /// Response body.
        message: String,
    },

    /// The request could not be sent or the response not read.
    #[error("Cloud HTTP error: {0}")]
    Http(String),
}

impl NetworkError {
    /// Whether the object was already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type for cloud network operations.
pub type Result<T> = std::result::Result<T, NetworkError>;

/// A virtual cloud network to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcnSpec {
    /// Display name, `{env_id}-vcn` for environment networks.
    pub display_name: String,
    /// CIDR block.
    pub cidr_block: String,
    /// DNS label: alphanumerics only, at most 15 characters.
    pub dns_label: String,
}

/// A subnet to create inside a VCN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetSpec {
    /// Parent VCN OCID.
    pub vcn_id: String,
    /// Display name.
    pub display_name: String,
    /// CIDR block.
    pub cidr_block: String,
}

/// One ingress rule of a network security group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsgRuleSpec {
    /// Protocol number as a string (`6`, `17`, `1`) or `all`.
    pub protocol: String,
    /// Source CIDR.
    pub source_cidr: String,
    /// First destination port (TCP/UDP only).
    pub port_min: Option<i32>,
    /// Last destination port (TCP/UDP only).
    pub port_max: Option<i32>,
}

/// A created cloud object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudObject {
    /// OCID.
    pub id: String,
    /// Provider lifecycle state.
    pub lifecycle_state: String,
}

/// Map an EC2 `IpProtocol` to the cloud's protocol identifier.
pub fn oci_protocol(ip_protocol: &str) -> String {
    match ip_protocol.to_ascii_lowercase().as_str() {
        "tcp" | "6" => "6".to_string(),
        "udp" | "17" => "17".to_string(),
        "icmp" | "1" => "1".to_string(),
        "-1" | "all" => "all".to_string(),
        other => other.to_string(),
    }
}

/// DNS label for an environment network: the id stripped to alphanumerics,
/// truncated to 15 characters.
pub fn dns_label(environment_id: &str) -> String {
    environment_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(15)
        .collect()
}

/// Trait for cloud network providers.
///
/// Every object is created in the provider's single configured compartment.
#[async_trait]
pub trait CloudNetwork: Send + Sync {
    /// Provider identifier (e.g., "oci", "mock").
    fn provider_type(&self) -> &'static str;

    /// Create a VCN.
    async fn create_vcn(&self, spec: &VcnSpec) -> Result<CloudObject>;

    /// Delete a VCN. Fails with `Conflict` while children exist.
    async fn delete_vcn(&self, id: &str) -> Result<()>;

    /// Create a subnet.
    async fn create_subnet(&self, spec: &SubnetSpec) -> Result<CloudObject>;

    /// Delete a subnet.
    async fn delete_subnet(&self, id: &str) -> Result<()>;

    /// Create an enabled internet gateway in a VCN.
    async fn create_internet_gateway(&self, vcn_id: &str, display_name: &str)
    -> Result<CloudObject>;

    /// Delete an internet gateway.
    async fn delete_internet_gateway(&self, id: &str) -> Result<()>;

    /// Create a network security group in a VCN.
    async fn create_nsg(&self, vcn_id: &str, display_name: &str) -> Result<CloudObject>;

    /// Delete a network security group.
    async fn delete_nsg(&self, id: &str) -> Result<()>;

    /// Add an ingress rule. Returns the rule id.
    async fn add_nsg_rule(&self, nsg_id: &str, rule: &NsgRuleSpec) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oci_protocol_mapping() {
        assert_eq!(oci_protocol("tcp"), "6");
        assert_eq!(oci_protocol("UDP"), "17");
        assert_eq!(oci_protocol("icmp"), "1");
        assert_eq!(oci_protocol("-1"), "all");
        assert_eq!(oci_protocol("all"), "all");
    }

    #[test]
    fn test_dns_label() {
        assert_eq!(dns_label("env-abc123def456"), "envabc123def456");
        assert_eq!(dns_label("env-abcdefghijklmnop").len(), 15);
    }
}
