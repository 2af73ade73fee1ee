// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory cloud network for tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::*;

#[derive(Debug, Clone)]
struct MockObject {
    kind: &'static str,
    parent: Option<String>,
}

/// Mock cloud network that enforces parent/child deletion order.
pub struct MockCloudNetwork {
    objects: Arc<Mutex<HashMap<String, MockObject>>>,
    calls: Arc<Mutex<Vec<String>>>,
    next_id: AtomicU64,
    /// If true, every create fails.
    pub fail_create: bool,
}

impl Default for MockCloudNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCloudNetwork {
    /// Create an empty mock network.
    pub fn new() -> Self {
        Self {
            objects: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
            fail_create: false,
        }
    }

    /// Create a mock network whose creates fail.
    pub fn failing() -> Self {
        Self {
            fail_create: true,
            ..Self::new()
        }
    }

    /// Every call in order, as `op:target`.
    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    /// Number of calls whose op is `op`.
    pub async fn count(&self, op: &str) -> usize {
        let prefix = format!("{op}:");
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    /// Number of live objects of a kind.
    pub async fn live(&self, kind: &str) -> usize {
        self.objects
            .lock()
            .await
            .values()
            .filter(|o| o.kind == kind)
            .count()
    }

    async fn record(&self, op: &str, target: &str) {
        self.calls.lock().await.push(format!("{op}:{target}"));
    }

    async fn create(&self, kind: &'static str, parent: Option<&str>) -> Result<CloudObject> {
        if self.fail_create {
            return Err(NetworkError::Api {
                status: 500,
                message: format!("mock failure creating {kind}"),
            });
        }
        let mut objects = self.objects.lock().await;
        if let Some(parent) = parent
            && !objects.contains_key(parent)
        {
            return Err(NetworkError::NotFound(parent.to_string()));
        }
        let id = format!(
            "ocid1.{kind}.oc1..mock{:08}",
            self.next_id.fetch_add(1, Ordering::SeqCst)
        );
        objects.insert(
            id.clone(),
            MockObject {
                kind,
                parent: parent.map(str::to_string),
            },
        );
        Ok(CloudObject {
            id,
            lifecycle_state: "AVAILABLE".to_string(),
        })
    }

    async fn delete(&self, kind: &'static str, id: &str) -> Result<()> {
        let mut objects = self.objects.lock().await;
        match objects.get(id) {
            Some(object) if object.kind == kind => {}
            _ => return Err(NetworkError::NotFound(id.to_string())),
        }
        if objects.values().any(|o| o.parent.as_deref() == Some(id)) {
            return Err(NetworkError::Conflict(format!("{kind} {id} has dependents")));
        }
        objects.remove(id);
        Ok(())
    }
}

#[async_trait]
impl CloudNetwork for MockCloudNetwork {
    fn provider_type(&self) -> &'static str {
        "mock"
    }

    async fn create_vcn(&self, spec: &VcnSpec) -> Result<CloudObject> {
        self.record("create_vcn", &spec.display_name).await;
        self.create("vcn", None).await
    }

    async fn delete_vcn(&self, id: &str) -> Result<()> {
        self.record("delete_vcn", id).await;
        self.delete("vcn", id).await
    }

    async fn create_subnet(&self, spec: &SubnetSpec) -> Result<CloudObject> {
        self.record("create_subnet", &spec.display_name).await;
        self.create("subnet", Some(&spec.vcn_id)).await
    }

    async fn delete_subnet(&self, id: &str) -> Result<()> {
        self.record("delete_subnet", id).await;
        self.delete("subnet", id).await
    }

    async fn create_internet_gateway(
        &self,
        vcn_id: &str,
        display_name: &str,
    ) -> Result<CloudObject> {
        self.record("create_internet_gateway", display_name).await;
        self.create("internetgateway", Some(vcn_id)).await
    }

    async fn delete_internet_gateway(&self, id: &str) -> Result<()> {
        self.record("delete_internet_gateway", id).await;
        self.delete("internetgateway", id).await
    }

    async fn create_nsg(&self, vcn_id: &str, display_name: &str) -> Result<CloudObject> {
        self.record("create_nsg", display_name).await;
        self.create("networksecuritygroup", Some(vcn_id)).await
    }

    async fn delete_nsg(&self, id: &str) -> Result<()> {
        self.record("delete_nsg", id).await;
        self.delete("networksecuritygroup", id).await
    }

    async fn add_nsg_rule(&self, nsg_id: &str, rule: &NsgRuleSpec) -> Result<String> {
        self.record("add_nsg_rule", &format!("{nsg_id}/{}", rule.protocol))
            .await;
        if !self.objects.lock().await.contains_key(nsg_id) {
            return Err(NetworkError::NotFound(nsg_id.to_string()));
        }
        Ok(format!(
            "rule-{:08}",
            self.next_id.fetch_add(1, Ordering::SeqCst)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vcn() -> VcnSpec {
        VcnSpec {
            display_name: "env-1-vcn".to_string(),
            cidr_block: "10.0.0.0/16".to_string(),
            dns_label: "env1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_vcn_with_children_cannot_be_deleted() {
        let network = MockCloudNetwork::new();
        let vcn = network.create_vcn(&vcn()).await.unwrap();
        let subnet = network
            .create_subnet(&SubnetSpec {
                vcn_id: vcn.id.clone(),
                display_name: "s".to_string(),
                cidr_block: "10.0.1.0/24".to_string(),
            })
            .await
            .unwrap();

        assert!(matches!(
            network.delete_vcn(&vcn.id).await,
            Err(NetworkError::Conflict(_))
        ));
        network.delete_subnet(&subnet.id).await.unwrap();
        network.delete_vcn(&vcn.id).await.unwrap();
        assert_eq!(network.live("vcn").await, 0);
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let network = MockCloudNetwork::new();
        assert!(network.delete_nsg("nope").await.unwrap_err().is_not_found());
    }
}
