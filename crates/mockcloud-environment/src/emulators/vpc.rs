// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! EC2/VPC emulator.
//!
//! VPCs, subnets, security groups and internet gateways are rows in
//! `vpc_resources`. Creating a VPC is metadata only; the wiring actions
//! (CreateSubnet, AuthorizeSecurityGroupIngress, AttachInternetGateway)
//! materialize the VPC's VCN and the matching real object, and are metered
//! per action.
//!
//! Instances are metadata only: RunInstances records them with addresses
//! drawn from their subnet and the state actions move them between running,
//! stopped and terminated with a compare-and-set on the stored state.

use std::net::Ipv4Addr;

use chrono::Utc;
use mockcloud_core::persistence::{
    EnvironmentRecord, ResourceTable, SecurityGroupRuleRecord, VpcResourceRecord,
};
use mockcloud_protocol::ec2::{DEFAULT_VPC_CIDR, Ec2Action, IngressPermission, InstanceState};
use rand::Rng;
use tracing::{debug, info, warn};

use super::{EmulatorContext, EmulatorError, Result, hex_id};
use crate::billing::wiring_cost;
use crate::cloud_network::{NsgRuleSpec, oci_protocol};
use crate::materializer::vpc_handle;

/// Resource kinds stored in `vpc_resources`.
pub const KIND_VPC: &str = "vpc";
/// Subnet kind.
pub const KIND_SUBNET: &str = "subnet";
/// Security group kind.
pub const KIND_SECURITY_GROUP: &str = "security_group";
/// Internet gateway kind.
pub const KIND_INTERNET_GATEWAY: &str = "internet_gateway";
/// Instance kind.
pub const KIND_INSTANCE: &str = "instance";

const ID_DIGITS: usize = 17;

/// Instances one RunInstances call may launch.
pub const MAX_INSTANCES_PER_RUN: u32 = 20;

/// Compare-and-set attempts before a state change gives up.
const STATE_CHANGE_ATTEMPTS: usize = 3;

/// One instance moved by Stop/Start/TerminateInstances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStateChange {
    pub instance_id: String,
    pub previous: InstanceState,
    pub current: InstanceState,
}

/// Result of an EC2 action, rendered by the gateway.
#[derive(Debug, Clone)]
pub enum Ec2Output {
    Vpc(VpcResourceRecord),
    Vpcs(Vec<VpcResourceRecord>),
    Subnet(VpcResourceRecord),
    Subnets(Vec<VpcResourceRecord>),
    SecurityGroupCreated { group_id: String },
    SecurityGroups(Vec<(VpcResourceRecord, Vec<SecurityGroupRuleRecord>)>),
    InternetGateway(VpcResourceRecord),
    InternetGateways(Vec<VpcResourceRecord>),
    /// Instances launched by one RunInstances call.
    Reservation {
        reservation_id: String,
        instances: Vec<VpcResourceRecord>,
    },
    /// Instances grouped into reservations by the gateway.
    Instances(Vec<VpcResourceRecord>),
    InstanceStateChanges(Vec<InstanceStateChange>),
    /// `<return>true</return>`
    Return,
}

/// Executes EC2 actions for one environment.
#[derive(Clone)]
pub struct VpcEmulator {
    ctx: EmulatorContext,
}

impl VpcEmulator {
    pub fn new(ctx: EmulatorContext) -> Self {
        Self { ctx }
    }

    /// Execute a decoded action.
    pub async fn execute(&self, env: &EnvironmentRecord, action: Ec2Action) -> Result<Ec2Output> {
        let name = action.name();
        let wiring = action.is_wiring();

        let output = match action {
            Ec2Action::CreateVpc { cidr_block } => self.create_vpc(env, cidr_block).await?,
            Ec2Action::DescribeVpcs { vpc_ids } => {
                Ec2Output::Vpcs(self.describe(env, KIND_VPC, &vpc_ids).await?)
            }
            Ec2Action::DeleteVpc { vpc_id } => self.delete_vpc(env, &vpc_id).await?,
            Ec2Action::CreateSubnet {
                vpc_id,
                cidr_block,
                availability_zone,
            } => {
                self.create_subnet(env, &vpc_id, cidr_block, availability_zone)
                    .await?
            }
            Ec2Action::DescribeSubnets {
                subnet_ids,
                vpc_ids,
            } => {
                let mut subnets = self.describe(env, KIND_SUBNET, &subnet_ids).await?;
                if !vpc_ids.is_empty() {
                    subnets.retain(|s| {
                        s.parent_id
                            .as_ref()
                            .is_some_and(|parent| vpc_ids.contains(parent))
                    });
                }
                Ec2Output::Subnets(subnets)
            }
            Ec2Action::DeleteSubnet { subnet_id } => {
                let subnet = self.require(env, KIND_SUBNET, &subnet_id).await?;
                let instances = self
                    .ctx
                    .persistence
                    .list_vpc_resources(&env.id, KIND_INSTANCE)
                    .await?;
                if instances.iter().any(|i| {
                    i.parent_id.as_deref() == Some(subnet_id.as_str())
                        && i.state != InstanceState::Terminated.as_str()
                }) {
                    return Err(EmulatorError::DependencyViolation(format!(
                        "The subnet '{subnet_id}' has dependencies and cannot be deleted."
                    )));
                }
                self.release_and_delete(env, &subnet, "subnet").await?;
                Ec2Output::Return
            }
            Ec2Action::CreateSecurityGroup {
                group_name,
                description,
                vpc_id,
            } => {
                self.create_security_group(env, group_name, description, vpc_id)
                    .await?
            }
            Ec2Action::DescribeSecurityGroups { group_ids } => {
                let groups = self.describe(env, KIND_SECURITY_GROUP, &group_ids).await?;
                let mut described = Vec::with_capacity(groups.len());
                for group in groups {
                    let rules = self
                        .ctx
                        .persistence
                        .list_security_group_rules(&group.id)
                        .await?;
                    described.push((group, rules));
                }
                Ec2Output::SecurityGroups(described)
            }
            Ec2Action::DeleteSecurityGroup { group_id } => {
                let group = self.require(env, KIND_SECURITY_GROUP, &group_id).await?;
                self.release_and_delete(env, &group, "nsg").await?;
                Ec2Output::Return
            }
            Ec2Action::AuthorizeSecurityGroupIngress {
                group_id,
                permissions,
            } => self.authorize_ingress(env, &group_id, permissions).await?,
            Ec2Action::CreateInternetGateway => {
                let igw = self
                    .insert(env, KIND_INTERNET_GATEWAY, "igw-", |r| {
                        r.state = "available".to_string();
                    })
                    .await?;
                Ec2Output::InternetGateway(igw)
            }
            Ec2Action::AttachInternetGateway {
                internet_gateway_id,
                vpc_id,
            } => {
                self.attach_internet_gateway(env, &internet_gateway_id, &vpc_id)
                    .await?
            }
            Ec2Action::DescribeInternetGateways {
                internet_gateway_ids,
            } => Ec2Output::InternetGateways(
                self.describe(env, KIND_INTERNET_GATEWAY, &internet_gateway_ids)
                    .await?,
            ),
            Ec2Action::RunInstances {
                image_id,
                instance_type,
                min_count,
                max_count: _,
                subnet_id,
            } => {
                self.run_instances(env, image_id, instance_type, min_count, subnet_id)
                    .await?
            }
            Ec2Action::DescribeInstances { instance_ids } => {
                Ec2Output::Instances(self.describe(env, KIND_INSTANCE, &instance_ids).await?)
            }
            Ec2Action::StopInstances { instance_ids } => {
                self.change_states(env, &instance_ids, InstanceState::Stopped)
                    .await?
            }
            Ec2Action::StartInstances { instance_ids } => {
                self.change_states(env, &instance_ids, InstanceState::Running)
                    .await?
            }
            Ec2Action::TerminateInstances { instance_ids } => {
                self.change_states(env, &instance_ids, InstanceState::Terminated)
                    .await?
            }
        };

        if wiring {
            self.ctx.charge(env, "ec2", name, 1, wiring_cost(1)).await;
        }
        Ok(output)
    }

    async fn create_vpc(&self, env: &EnvironmentRecord, cidr_block: String) -> Result<Ec2Output> {
        validate_cidr(&cidr_block)?;
        let vpc = self
            .insert(env, KIND_VPC, "vpc-", |r| {
                r.cidr_block = Some(cidr_block);
                r.attributes = serde_json::json!({
                    "dhcp_options_id": hex_id("dopt-", ID_DIGITS),
                    "is_default": false,
                })
                .to_string();
            })
            .await?;
        info!(environment_id = %env.id, vpc_id = %vpc.id, "VPC created");
        Ok(Ec2Output::Vpc(vpc))
    }

    async fn delete_vpc(&self, env: &EnvironmentRecord, vpc_id: &str) -> Result<Ec2Output> {
        let vpc = self.require(env, KIND_VPC, vpc_id).await?;
        let persistence = &self.ctx.persistence;

        let subnets = persistence.list_vpc_resources(&env.id, KIND_SUBNET).await?;
        if subnets
            .iter()
            .any(|s| s.parent_id.as_deref() == Some(vpc_id))
        {
            return Err(EmulatorError::DependencyViolation(format!(
                "The vpc '{vpc_id}' has dependencies and cannot be deleted."
            )));
        }

        // Releasing the VCN deletes the NSGs and gateways under it.
        if vpc.backing_handle.is_some() {
            self.ctx
                .materializer
                .release(&env.id, &vpc_handle(vpc_id))
                .await?;
        }

        for group in persistence
            .list_vpc_resources(&env.id, KIND_SECURITY_GROUP)
            .await?
            .into_iter()
            .filter(|g| g.parent_id.as_deref() == Some(vpc_id))
        {
            persistence.delete_vpc_resource(&group.id).await?;
        }
        for igw in persistence
            .list_vpc_resources(&env.id, KIND_INTERNET_GATEWAY)
            .await?
            .into_iter()
            .filter(|g| g.parent_id.as_deref() == Some(vpc_id))
        {
            persistence
                .update_vpc_resource(&igw.id, "available", None)
                .await?;
            persistence
                .detach_backing_handle(ResourceTable::Vpc, &igw.id)
                .await?;
        }

        persistence.delete_vpc_resource(vpc_id).await?;
        info!(environment_id = %env.id, vpc_id = %vpc_id, "VPC deleted");
        Ok(Ec2Output::Return)
    }

    async fn create_subnet(
        &self,
        env: &EnvironmentRecord,
        vpc_id: &str,
        cidr_block: String,
        availability_zone: String,
    ) -> Result<Ec2Output> {
        let vpc = self.require(env, KIND_VPC, vpc_id).await?;
        validate_cidr(&cidr_block)?;
        self.ctx.require_funds(env).await?;

        let subnet = self
            .insert(env, KIND_SUBNET, "subnet-", |r| {
                r.parent_id = Some(vpc_id.to_string());
                r.cidr_block = Some(cidr_block.clone());
                r.availability_zone = Some(availability_zone);
                r.attributes = serde_json::json!({
                    "available_ip_address_count": available_addresses(&cidr_block),
                })
                .to_string();
            })
            .await?;

        let materialized = match self.materialize_vpc(env, &vpc).await {
            Ok(()) => self
                .ctx
                .materializer
                .materialize_subnet(&env.id, vpc_id, &subnet.id, &cidr_block)
                .await
                .map(|_| ())
                .map_err(EmulatorError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = materialized {
            // A subnet without its real counterpart is not kept.
            self.ctx.persistence.delete_vpc_resource(&subnet.id).await?;
            return Err(e);
        }

        let subnet = self.require(env, KIND_SUBNET, &subnet.id).await?;
        info!(environment_id = %env.id, subnet_id = %subnet.id, vpc_id = %vpc_id, "Subnet created");
        Ok(Ec2Output::Subnet(subnet))
    }

    async fn create_security_group(
        &self,
        env: &EnvironmentRecord,
        group_name: String,
        description: String,
        vpc_id: Option<String>,
    ) -> Result<Ec2Output> {
        if let Some(vpc_id) = &vpc_id {
            self.require(env, KIND_VPC, vpc_id).await?;
        }
        let existing = self
            .ctx
            .persistence
            .list_vpc_resources(&env.id, KIND_SECURITY_GROUP)
            .await?;
        if existing
            .iter()
            .any(|g| g.name.as_deref() == Some(group_name.as_str()) && g.parent_id == vpc_id)
        {
            return Err(EmulatorError::already_exists(
                "InvalidGroup.Duplicate",
                format!("The security group '{group_name}' already exists"),
            ));
        }

        let group = self
            .insert(env, KIND_SECURITY_GROUP, "sg-", |r| {
                r.name = Some(group_name);
                r.description = Some(description);
                r.parent_id = vpc_id;
            })
            .await?;
        Ok(Ec2Output::SecurityGroupCreated { group_id: group.id })
    }

    async fn authorize_ingress(
        &self,
        env: &EnvironmentRecord,
        group_id: &str,
        permissions: Vec<IngressPermission>,
    ) -> Result<Ec2Output> {
        let group = self.require(env, KIND_SECURITY_GROUP, group_id).await?;
        self.ctx.require_funds(env).await?;

        // Groups outside a VPC only keep their rules as metadata.
        let nsg_id = match &group.parent_id {
            Some(vpc_id) => {
                let vpc = self.require(env, KIND_VPC, vpc_id).await?;
                self.materialize_vpc(env, &vpc).await?;
                let nsg = self
                    .ctx
                    .materializer
                    .materialize_nsg(&env.id, vpc_id, group_id)
                    .await?;
                nsg.handle_id
            }
            None => None,
        };

        let network = self.ctx.materializer.provisioner().network();
        for permission in permissions {
            let backing_handle = match &nsg_id {
                Some(nsg_id) => {
                    let rule = NsgRuleSpec {
                        protocol: oci_protocol(&permission.ip_protocol),
                        source_cidr: permission.cidr_ip.clone(),
                        port_min: permission.from_port,
                        port_max: permission.to_port,
                    };
                    let rule_id = network
                        .add_nsg_rule(nsg_id, &rule)
                        .await
                        .map_err(|e| EmulatorError::Backing(e.to_string()))?;
                    Some(rule_id)
                }
                None => None,
            };
            self.ctx
                .persistence
                .insert_security_group_rule(&SecurityGroupRuleRecord {
                    id: 0,
                    group_id: group_id.to_string(),
                    ip_protocol: permission.ip_protocol,
                    from_port: permission.from_port,
                    to_port: permission.to_port,
                    cidr_ip: permission.cidr_ip,
                    backing_handle,
                    created_at: Utc::now(),
                })
                .await?;
        }
        debug!(environment_id = %env.id, group_id = %group_id, "Ingress authorized");
        Ok(Ec2Output::Return)
    }

    async fn attach_internet_gateway(
        &self,
        env: &EnvironmentRecord,
        igw_id: &str,
        vpc_id: &str,
    ) -> Result<Ec2Output> {
        let igw = self.require(env, KIND_INTERNET_GATEWAY, igw_id).await?;
        let vpc = self.require(env, KIND_VPC, vpc_id).await?;
        if let Some(attached) = &igw.parent_id {
            return Err(EmulatorError::validation(
                "Resource.AlreadyAssociated",
                format!("resource {igw_id} is already attached to network {attached}"),
            ));
        }
        self.ctx.require_funds(env).await?;

        self.materialize_vpc(env, &vpc).await?;
        self.ctx
            .materializer
            .materialize_internet_gateway(&env.id, vpc_id, igw_id)
            .await?;
        self.ctx
            .persistence
            .update_vpc_resource(igw_id, "attached", Some(vpc_id))
            .await?;
        info!(environment_id = %env.id, igw_id = %igw_id, vpc_id = %vpc_id, "Internet gateway attached");
        Ok(Ec2Output::Return)
    }

    async fn run_instances(
        &self,
        env: &EnvironmentRecord,
        image_id: String,
        instance_type: String,
        count: u32,
        subnet_id: Option<String>,
    ) -> Result<Ec2Output> {
        if count > MAX_INSTANCES_PER_RUN {
            return Err(EmulatorError::validation(
                "InstanceLimitExceeded",
                format!(
                    "You have requested more instances ({count}) than your current instance limit of {MAX_INSTANCES_PER_RUN} allows."
                ),
            ));
        }
        let subnet = match &subnet_id {
            Some(id) => Some(self.require(env, KIND_SUBNET, id).await?),
            None => None,
        };
        self.ctx.require_funds(env).await?;

        let reservation_id = hex_id("r-", ID_DIGITS);
        let mut instances = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let private_ip = private_address(subnet.as_ref().and_then(|s| s.cidr_block.as_deref()));
            let attributes = serde_json::json!({
                "image_id": image_id,
                "instance_type": instance_type,
                "private_ip": private_ip.to_string(),
                "public_ip": public_address().to_string(),
                "reservation_id": reservation_id,
                "vpc_id": subnet.as_ref().and_then(|s| s.parent_id.clone()),
            })
            .to_string();
            let instance = self
                .insert(env, KIND_INSTANCE, "i-", |r| {
                    r.parent_id = subnet_id.clone();
                    r.availability_zone = subnet.as_ref().and_then(|s| s.availability_zone.clone());
                    r.state = InstanceState::Running.as_str().to_string();
                    r.attributes = attributes;
                })
                .await?;
            instances.push(instance);
        }

        let launched = i64::from(count);
        self.ctx
            .charge(env, "ec2", "RunInstances", launched, wiring_cost(launched))
            .await;
        info!(
            environment_id = %env.id,
            reservation_id = %reservation_id,
            count,
            "Instances launched"
        );
        Ok(Ec2Output::Reservation {
            reservation_id,
            instances,
        })
    }

    async fn change_states(
        &self,
        env: &EnvironmentRecord,
        instance_ids: &[String],
        target: InstanceState,
    ) -> Result<Ec2Output> {
        // Unknown ids fail the whole call before anything moves.
        self.describe(env, KIND_INSTANCE, instance_ids).await?;

        let mut changes = Vec::with_capacity(instance_ids.len());
        for id in instance_ids {
            changes.push(self.change_state(env, id, target).await?);
        }
        Ok(Ec2Output::InstanceStateChanges(changes))
    }

    async fn change_state(
        &self,
        env: &EnvironmentRecord,
        instance_id: &str,
        target: InstanceState,
    ) -> Result<InstanceStateChange> {
        for _ in 0..STATE_CHANGE_ATTEMPTS {
            let instance = self.require(env, KIND_INSTANCE, instance_id).await?;
            let previous = stored_state(&instance);
            if previous == target {
                return Ok(InstanceStateChange {
                    instance_id: instance_id.to_string(),
                    previous,
                    current: target,
                });
            }
            if previous == InstanceState::Terminated {
                return Err(incorrect_state(instance_id, previous));
            }
            if self
                .ctx
                .persistence
                .transition_vpc_resource(instance_id, previous.as_str(), target.as_str())
                .await?
            {
                debug!(
                    environment_id = %env.id,
                    instance_id = %instance_id,
                    from = previous.as_str(),
                    to = target.as_str(),
                    "Instance state changed"
                );
                return Ok(InstanceStateChange {
                    instance_id: instance_id.to_string(),
                    previous,
                    current: target,
                });
            }
        }
        warn!(instance_id = %instance_id, "Instance state kept changing underneath");
        let instance = self.require(env, KIND_INSTANCE, instance_id).await?;
        Err(incorrect_state(instance_id, stored_state(&instance)))
    }

    async fn materialize_vpc(&self, env: &EnvironmentRecord, vpc: &VpcResourceRecord) -> Result<()> {
        let cidr = vpc
            .cidr_block
            .as_deref()
            .unwrap_or(DEFAULT_VPC_CIDR);
        self.ctx
            .materializer
            .materialize_vpc(&env.id, &vpc.id, cidr)
            .await?;
        Ok(())
    }

    async fn release_and_delete(
        &self,
        env: &EnvironmentRecord,
        resource: &VpcResourceRecord,
        handle_prefix: &str,
    ) -> Result<()> {
        if resource.backing_handle.is_some() {
            self.ctx
                .materializer
                .release(&env.id, &format!("{handle_prefix}:{}", resource.id))
                .await?;
        }
        self.ctx.persistence.delete_vpc_resource(&resource.id).await?;
        Ok(())
    }

    async fn insert(
        &self,
        env: &EnvironmentRecord,
        kind: &str,
        prefix: &str,
        fill: impl FnOnce(&mut VpcResourceRecord),
    ) -> Result<VpcResourceRecord> {
        let mut record = VpcResourceRecord {
            id: hex_id(prefix, ID_DIGITS),
            environment_id: env.id.clone(),
            kind: kind.to_string(),
            parent_id: None,
            name: None,
            description: None,
            cidr_block: None,
            availability_zone: None,
            state: "available".to_string(),
            attributes: "{}".to_string(),
            backing_handle: None,
            created_at: Utc::now(),
        };
        fill(&mut record);
        self.ctx.persistence.insert_vpc_resource(&record).await?;
        Ok(record)
    }

    async fn require(
        &self,
        env: &EnvironmentRecord,
        kind: &str,
        id: &str,
    ) -> Result<VpcResourceRecord> {
        self.ctx
            .persistence
            .get_vpc_resource(&env.id, kind, id)
            .await?
            .ok_or_else(|| not_found(kind, id))
    }

    async fn describe(
        &self,
        env: &EnvironmentRecord,
        kind: &str,
        ids: &[String],
    ) -> Result<Vec<VpcResourceRecord>> {
        let all = self.ctx.persistence.list_vpc_resources(&env.id, kind).await?;
        if ids.is_empty() {
            return Ok(all);
        }
        if let Some(missing) = ids.iter().find(|id| !all.iter().any(|r| &r.id == *id)) {
            return Err(not_found(kind, missing));
        }
        Ok(all.into_iter().filter(|r| ids.contains(&r.id)).collect())
    }
}

fn not_found(kind: &str, id: &str) -> EmulatorError {
    let (code, label) = match kind {
        KIND_VPC => ("InvalidVpcID.NotFound", "vpc ID"),
        KIND_SUBNET => ("InvalidSubnetID.NotFound", "subnet ID"),
        KIND_SECURITY_GROUP => ("InvalidGroup.NotFound", "security group"),
        KIND_INSTANCE => ("InvalidInstanceID.NotFound", "instance ID"),
        _ => ("InvalidInternetGatewayID.NotFound", "internetGateway ID"),
    };
    EmulatorError::not_found(code, format!("The {label} '{id}' does not exist"))
}

fn validate_cidr(cidr: &str) -> Result<()> {
    let invalid = || {
        EmulatorError::validation(
            "InvalidParameterValue",
            format!("Value ({cidr}) for parameter cidrBlock is invalid. This is not a valid CIDR block."),
        )
    };
    let (addr, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    addr.parse::<std::net::Ipv4Addr>().map_err(|_| invalid())?;
    match prefix.parse::<u8>() {
        Ok(p) if p <= 32 => Ok(()),
        _ => Err(invalid()),
    }
}

fn incorrect_state(instance_id: &str, state: InstanceState) -> EmulatorError {
    EmulatorError::validation(
        "IncorrectInstanceState",
        format!(
            "The instance '{instance_id}' is not in a state from which it can be modified ({}).",
            state.as_str()
        ),
    )
}

fn stored_state(instance: &VpcResourceRecord) -> InstanceState {
    InstanceState::parse(&instance.state).unwrap_or(InstanceState::Pending)
}

/// Host address inside `cidr` past the five reserved ones, or 10.0.x.y.
fn private_address(cidr: Option<&str>) -> Ipv4Addr {
    let mut rng = rand::thread_rng();
    let subnet = cidr.and_then(|c| {
        let (addr, prefix) = c.split_once('/')?;
        let addr = addr.parse::<Ipv4Addr>().ok()?;
        let prefix = prefix.parse::<u32>().ok().filter(|p| *p <= 28)?;
        Some((u64::from(u32::from(addr)), prefix))
    });
    match subnet {
        Some((base, prefix)) => {
            let size = 1u64 << (32 - prefix);
            let network = base & !(size - 1);
            // .0 to .3 and the broadcast address are reserved.
            let host = network + rng.gen_range(4..size - 1);
            Ipv4Addr::from(u32::try_from(host).unwrap_or(u32::MAX))
        }
        None => Ipv4Addr::new(10, 0, rng.gen_range(0..=255), rng.gen_range(1..=254)),
    }
}

fn public_address() -> Ipv4Addr {
    let mut rng = rand::thread_rng();
    Ipv4Addr::new(54, rng.gen_range(0..=255), rng.gen_range(0..=255), rng.gen_range(1..=254))
}

// Five addresses of every subnet are reserved.
fn available_addresses(cidr: &str) -> u64 {
    cidr.split_once('/')
        .and_then(|(_, p)| p.parse::<u32>().ok())
        .filter(|p| *p <= 32)
        .map(|p| (1u64 << (32 - p)).saturating_sub(5))
        .unwrap_or(0)
}
