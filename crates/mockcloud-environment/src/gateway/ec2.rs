// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! EC2 Query endpoint.

use axum::extract::{RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use chrono::SecondsFormat;
use mockcloud_core::persistence::{SecurityGroupRuleRecord, VpcResourceRecord};
use mockcloud_protocol::ACCOUNT_ID;
use mockcloud_protocol::ec2::{self, EC2_NAMESPACE, Ec2Action, InstanceState};
use mockcloud_protocol::query::QueryParams;
use mockcloud_protocol::xml::XmlWriter;
use serde_json::Value;
use tracing::error;

use super::{GatewayState, request_id, status_code, xml_response};
use crate::emulators::EmulatorError;
use crate::emulators::vpc::{Ec2Output, InstanceStateChange};

pub(super) fn params(query: Option<&str>, body: &[u8]) -> QueryParams {
    let from_body = QueryParams::parse(body);
    match query {
        Some(query) => from_body.merge(QueryParams::parse(query.as_bytes())),
        None => from_body,
    }
}

pub(super) async fn handle(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let params = params(query.as_deref(), &body);
    dispatch(&state, &headers, &params).await
}

/// `POST /`: accepted only for EC2 actions.
pub(super) async fn handle_root(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let params = params(query.as_deref(), &body);
    match params.action() {
        Ok(action) if ec2::is_ec2_action(action) => dispatch(&state, &headers, &params).await,
        Ok(action) => error_xml(
            StatusCode::BAD_REQUEST,
            "InvalidAction",
            &format!("The action {action} is not valid for this web service."),
            &request_id(),
        ),
        Err(e) => error_xml(StatusCode::BAD_REQUEST, e.aws_code(), &e.to_string(), &request_id()),
    }
}

async fn dispatch(state: &GatewayState, headers: &HeaderMap, params: &QueryParams) -> Response {
    let request_id = request_id();
    let environment = match state.resolve(headers).await {
        Ok(env) => env,
        Err(e) => return error_xml(e.status(), e.code(), &e.to_string(), &request_id),
    };
    let action = match Ec2Action::decode(params) {
        Ok(action) => action,
        Err(e) => return emulator_error(EmulatorError::from(e), &request_id),
    };
    let name = action.name();
    match state.vpc.execute(&environment, action).await {
        Ok(output) => xml_response(StatusCode::OK, render(name, &output, &request_id)),
        Err(e) => {
            if !e.is_client_error() {
                error!(environment_id = %environment.id, action = name, error = %e, "EC2 action failed");
            }
            emulator_error(e, &request_id)
        }
    }
}

fn emulator_error(e: EmulatorError, request_id: &str) -> Response {
    error_xml(status_code(e.query_status()), e.code(), &e.to_string(), request_id)
}

fn error_xml(status: StatusCode, code: &str, message: &str, request_id: &str) -> Response {
    xml_response(status, ec2::error_response(code, message, request_id))
}

fn attributes(record: &VpcResourceRecord) -> Value {
    serde_json::from_str(&record.attributes).unwrap_or(Value::Null)
}

fn render(action: &str, output: &Ec2Output, request_id: &str) -> String {
    let mut w = XmlWriter::document(&format!("{action}Response"), Some(EC2_NAMESPACE));
    w.element("requestId", request_id);
    match output {
        Ec2Output::Vpc(vpc) => {
            w.open("vpc");
            write_vpc(&mut w, vpc);
            w.close();
        }
        Ec2Output::Vpcs(vpcs) => {
            w.open("vpcSet");
            for vpc in vpcs {
                w.open("item");
                write_vpc(&mut w, vpc);
                w.close();
            }
            w.close();
        }
        Ec2Output::Subnet(subnet) => {
            w.open("subnet");
            write_subnet(&mut w, subnet);
            w.close();
        }
        Ec2Output::Subnets(subnets) => {
            w.open("subnetSet");
            for subnet in subnets {
                w.open("item");
                write_subnet(&mut w, subnet);
                w.close();
            }
            w.close();
        }
        Ec2Output::SecurityGroupCreated { group_id } => {
            w.element("return", "true").element("groupId", group_id);
        }
        Ec2Output::SecurityGroups(groups) => {
            w.open("securityGroupInfo");
            for (group, rules) in groups {
                w.open("item");
                write_security_group(&mut w, group, rules);
                w.close();
            }
            w.close();
        }
        Ec2Output::InternetGateway(gateway) => {
            w.open("internetGateway");
            write_internet_gateway(&mut w, gateway);
            w.close();
        }
        Ec2Output::InternetGateways(gateways) => {
            w.open("internetGatewaySet");
            for gateway in gateways {
                w.open("item");
                write_internet_gateway(&mut w, gateway);
                w.close();
            }
            w.close();
        }
        Ec2Output::Reservation {
            reservation_id,
            instances,
        } => {
            write_reservation(&mut w, reservation_id, instances.iter());
        }
        Ec2Output::Instances(instances) => {
            w.open("reservationSet");
            for (reservation_id, members) in by_reservation(instances) {
                w.open("item");
                write_reservation(&mut w, &reservation_id, members);
                w.close();
            }
            w.close();
        }
        Ec2Output::InstanceStateChanges(changes) => {
            w.open("instancesSet");
            for change in changes {
                write_state_change(&mut w, change);
            }
            w.close();
        }
        Ec2Output::Return => {
            w.element("return", "true");
        }
    }
    w.finish()
}

/// Groups instances by reservation, keeping first-seen order.
fn by_reservation(instances: &[VpcResourceRecord]) -> Vec<(String, Vec<&VpcResourceRecord>)> {
    let mut groups: Vec<(String, Vec<&VpcResourceRecord>)> = Vec::new();
    for instance in instances {
        let reservation = attributes(instance)
            .get("reservation_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| instance.id.clone());
        match groups.iter_mut().find(|(id, _)| *id == reservation) {
            Some((_, members)) => members.push(instance),
            None => groups.push((reservation, vec![instance])),
        }
    }
    groups
}

fn write_reservation<'a>(
    w: &mut XmlWriter,
    reservation_id: &str,
    instances: impl IntoIterator<Item = &'a VpcResourceRecord>,
) {
    w.element("reservationId", reservation_id)
        .element("ownerId", ACCOUNT_ID)
        .empty("groupSet")
        .open("instancesSet");
    for instance in instances {
        w.open("item");
        write_instance(w, instance);
        w.close();
    }
    w.close();
}

fn write_instance(w: &mut XmlWriter, instance: &VpcResourceRecord) {
    let attributes = attributes(instance);
    let attribute = |key: &str| attributes.get(key).and_then(Value::as_str);
    let state = InstanceState::parse(&instance.state).unwrap_or(InstanceState::Pending);
    let private_ip = attribute("private_ip");

    w.element("instanceId", &instance.id)
        .optional("imageId", attribute("image_id"));
    write_state(w, "instanceState", state);
    w.optional(
        "privateDnsName",
        private_ip.map(|ip| format!("ip-{}.ec2.internal", ip.replace('.', "-"))),
    )
    .optional("privateIpAddress", private_ip);
    // Public addresses are released while the instance is not running.
    if state == InstanceState::Running {
        w.optional("ipAddress", attribute("public_ip"));
    }
    w.optional("instanceType", attribute("instance_type"))
        .element(
            "launchTime",
            instance
                .created_at
                .to_rfc3339_opts(SecondsFormat::Millis, true),
        )
        .optional("subnetId", instance.parent_id.as_ref())
        .optional("vpcId", attribute("vpc_id"));
    if let Some(zone) = &instance.availability_zone {
        w.open("placement").element("availabilityZone", zone).close();
    }
}

fn write_state(w: &mut XmlWriter, tag: &str, state: InstanceState) {
    w.open(tag)
        .element("code", state.code())
        .element("name", state.as_str())
        .close();
}

fn write_state_change(w: &mut XmlWriter, change: &InstanceStateChange) {
    w.open("item").element("instanceId", &change.instance_id);
    write_state(w, "currentState", change.current);
    write_state(w, "previousState", change.previous);
    w.close();
}

fn write_vpc(w: &mut XmlWriter, vpc: &VpcResourceRecord) {
    let attributes = attributes(vpc);
    w.element("vpcId", &vpc.id)
        .element("state", &vpc.state)
        .optional("cidrBlock", vpc.cidr_block.as_ref())
        .optional(
            "dhcpOptionsId",
            attributes.get("dhcp_options_id").and_then(Value::as_str),
        )
        .element("instanceTenancy", "default")
        .element(
            "isDefault",
            attributes
                .get("is_default")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        )
        .element("ownerId", ACCOUNT_ID);
}

fn write_subnet(w: &mut XmlWriter, subnet: &VpcResourceRecord) {
    let attributes = attributes(subnet);
    w.element("subnetId", &subnet.id)
        .element("state", &subnet.state)
        .optional("vpcId", subnet.parent_id.as_ref())
        .optional("cidrBlock", subnet.cidr_block.as_ref())
        .optional(
            "availableIpAddressCount",
            attributes
                .get("available_ip_address_count")
                .and_then(Value::as_u64),
        )
        .optional("availabilityZone", subnet.availability_zone.as_ref())
        .element("defaultForAz", "false")
        .element("mapPublicIpOnLaunch", "false")
        .element("ownerId", ACCOUNT_ID);
}

fn write_security_group(
    w: &mut XmlWriter,
    group: &VpcResourceRecord,
    rules: &[SecurityGroupRuleRecord],
) {
    w.element("ownerId", ACCOUNT_ID)
        .element("groupId", &group.id)
        .optional("groupName", group.name.as_ref())
        .optional("groupDescription", group.description.as_ref())
        .optional("vpcId", group.parent_id.as_ref());
    w.open("ipPermissions");
    for rule in rules {
        w.open("item")
            .element("ipProtocol", &rule.ip_protocol)
            .optional("fromPort", rule.from_port)
            .optional("toPort", rule.to_port)
            .open("ipRanges")
            .open("item")
            .element("cidrIp", &rule.cidr_ip)
            .close()
            .close()
            .close();
    }
    w.close();
    w.empty("ipPermissionsEgress");
}

fn write_internet_gateway(w: &mut XmlWriter, gateway: &VpcResourceRecord) {
    w.element("internetGatewayId", &gateway.id)
        .element("ownerId", ACCOUNT_ID)
        .open("attachmentSet");
    if let Some(vpc_id) = &gateway.parent_id {
        w.open("item")
            .element("vpcId", vpc_id)
            .element("state", "available")
            .close();
    }
    w.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(id: &str, kind: &str) -> VpcResourceRecord {
        VpcResourceRecord {
            id: id.to_string(),
            environment_id: "env-aaaaaaaaaaaa".to_string(),
            kind: kind.to_string(),
            parent_id: None,
            name: None,
            description: None,
            cidr_block: Some("10.0.0.0/16".to_string()),
            availability_zone: None,
            state: "available".to_string(),
            attributes: r#"{"dhcp_options_id":"dopt-1","is_default":false}"#.to_string(),
            backing_handle: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_render_create_vpc() {
        let xml = render("CreateVpc", &Ec2Output::Vpc(record("vpc-1", "vpc")), "req-1");
        assert!(xml.contains("<CreateVpcResponse xmlns=\"http://ec2.amazonaws.com/doc/2016-11-15/\">"));
        assert!(xml.contains("<requestId>req-1</requestId>"));
        assert!(xml.contains("<vpc><vpcId>vpc-1</vpcId><state>available</state>"));
        assert!(xml.contains("<dhcpOptionsId>dopt-1</dhcpOptionsId>"));
        assert!(xml.ends_with("</vpc></CreateVpcResponse>"));
    }

    #[test]
    fn test_render_security_group_rules() {
        let mut group = record("sg-1", "security_group");
        group.name = Some("web".to_string());
        group.parent_id = Some("vpc-1".to_string());
        let rule = SecurityGroupRuleRecord {
            id: 1,
            group_id: "sg-1".to_string(),
            ip_protocol: "tcp".to_string(),
            from_port: Some(443),
            to_port: Some(443),
            cidr_ip: "0.0.0.0/0".to_string(),
            backing_handle: None,
            created_at: Utc::now(),
        };
        let xml = render(
            "DescribeSecurityGroups",
            &Ec2Output::SecurityGroups(vec![(group, vec![rule])]),
            "req-2",
        );
        assert!(xml.contains("<securityGroupInfo><item><ownerId>123456789012</ownerId><groupId>sg-1</groupId>"));
        assert!(xml.contains(
            "<ipPermissions><item><ipProtocol>tcp</ipProtocol><fromPort>443</fromPort><toPort>443</toPort><ipRanges><item><cidrIp>0.0.0.0/0</cidrIp></item></ipRanges></item></ipPermissions>"
        ));
    }

    fn instance(id: &str, reservation: &str, state: &str) -> VpcResourceRecord {
        let mut instance = record(id, "instance");
        instance.cidr_block = None;
        instance.state = state.to_string();
        instance.parent_id = Some("subnet-1".to_string());
        instance.attributes = serde_json::json!({
            "image_id": "ami-mock-ubuntu",
            "instance_type": "t2.micro",
            "private_ip": "10.0.1.7",
            "public_ip": "54.1.2.3",
            "reservation_id": reservation,
            "vpc_id": "vpc-1",
        })
        .to_string();
        instance
    }

    #[test]
    fn test_render_run_instances() {
        let xml = render(
            "RunInstances",
            &Ec2Output::Reservation {
                reservation_id: "r-1".to_string(),
                instances: vec![instance("i-1", "r-1", "running")],
            },
            "req-3",
        );
        assert!(xml.contains("<reservationId>r-1</reservationId><ownerId>123456789012</ownerId>"));
        assert!(xml.contains(
            "<instancesSet><item><instanceId>i-1</instanceId><imageId>ami-mock-ubuntu</imageId><instanceState><code>16</code><name>running</name></instanceState>"
        ));
        assert!(xml.contains("<privateDnsName>ip-10-0-1-7.ec2.internal</privateDnsName>"));
        assert!(xml.contains("<ipAddress>54.1.2.3</ipAddress>"));
        assert!(xml.contains("<subnetId>subnet-1</subnetId><vpcId>vpc-1</vpcId>"));
    }

    #[test]
    fn test_describe_groups_instances_by_reservation() {
        let instances = vec![
            instance("i-1", "r-1", "running"),
            instance("i-2", "r-2", "stopped"),
            instance("i-3", "r-1", "running"),
        ];
        let xml = render("DescribeInstances", &Ec2Output::Instances(instances), "req-4");
        assert_eq!(xml.matches("<reservationId>").count(), 2);
        let first = xml.find("<reservationId>r-1").unwrap();
        let second = xml.find("<reservationId>r-2").unwrap();
        let third = xml.find("<instanceId>i-3").unwrap();
        assert!(first < third && third < second);
        // Stopped instances have no public address.
        assert_eq!(xml.matches("<ipAddress>").count(), 2);
    }

    #[test]
    fn test_render_state_changes() {
        let xml = render(
            "StopInstances",
            &Ec2Output::InstanceStateChanges(vec![InstanceStateChange {
                instance_id: "i-1".to_string(),
                previous: InstanceState::Running,
                current: InstanceState::Stopped,
            }]),
            "req-5",
        );
        assert!(xml.contains(
            "<instancesSet><item><instanceId>i-1</instanceId><currentState><code>80</code><name>stopped</name></currentState><previousState><code>16</code><name>running</name></previousState></item></instancesSet>"
        ));
    }

    #[test]
    fn test_params_merge_query_and_body() {
        let params = params(Some("Action=DescribeVpcs"), b"VpcId.1=vpc-1");
        assert_eq!(params.get("Action"), Some("DescribeVpcs"));
        assert_eq!(params.get("VpcId.1"), Some("vpc-1"));
    }
}
