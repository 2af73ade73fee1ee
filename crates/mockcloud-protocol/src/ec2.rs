// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! EC2 Query protocol: VPC, subnet, security group, internet gateway and
//! instance actions.

use crate::error::ProtocolError;
use crate::query::QueryParams;
use crate::xml::XmlWriter;

/// XML namespace of EC2 responses.
pub const EC2_NAMESPACE: &str = "http://ec2.amazonaws.com/doc/2016-11-15/";

/// Default VPC CIDR block when the request omits one.
pub const DEFAULT_VPC_CIDR: &str = "10.0.0.0/16";

/// Default availability zone for subnets.
pub const DEFAULT_AVAILABILITY_ZONE: &str = "us-east-1a";

/// Instance type launched when `InstanceType` is absent.
pub const DEFAULT_INSTANCE_TYPE: &str = "t2.micro";

/// Image launched when `ImageId` is absent.
pub const DEFAULT_IMAGE_ID: &str = "ami-mock-ubuntu";

/// Instance lifecycle states and their numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
}

impl InstanceState {
    pub fn code(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 16,
            Self::ShuttingDown => 32,
            Self::Terminated => 48,
            Self::Stopping => 64,
            Self::Stopped => 80,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "shutting-down" => Self::ShuttingDown,
            "terminated" => Self::Terminated,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            _ => return None,
        })
    }
}

/// One ingress permission of `AuthorizeSecurityGroupIngress`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressPermission {
    pub ip_protocol: String,
    pub from_port: Option<i32>,
    pub to_port: Option<i32>,
    pub cidr_ip: String,
}

/// Decoded EC2 action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ec2Action {
    CreateVpc {
        cidr_block: String,
    },
    DescribeVpcs {
        vpc_ids: Vec<String>,
    },
    DeleteVpc {
        vpc_id: String,
    },
    CreateSubnet {
        vpc_id: String,
        cidr_block: String,
        availability_zone: String,
    },
    DescribeSubnets {
        subnet_ids: Vec<String>,
        vpc_ids: Vec<String>,
    },
    DeleteSubnet {
        subnet_id: String,
    },
    CreateSecurityGroup {
        group_name: String,
        description: String,
        vpc_id: Option<String>,
    },
    DescribeSecurityGroups {
        group_ids: Vec<String>,
    },
    DeleteSecurityGroup {
        group_id: String,
    },
    AuthorizeSecurityGroupIngress {
        group_id: String,
        permissions: Vec<IngressPermission>,
    },
    CreateInternetGateway,
    AttachInternetGateway {
        internet_gateway_id: String,
        vpc_id: String,
    },
    DescribeInternetGateways {
        internet_gateway_ids: Vec<String>,
    },
    RunInstances {
        image_id: String,
        instance_type: String,
        min_count: u32,
        max_count: u32,
        subnet_id: Option<String>,
    },
    DescribeInstances {
        instance_ids: Vec<String>,
    },
    StopInstances {
        instance_ids: Vec<String>,
    },
    StartInstances {
        instance_ids: Vec<String>,
    },
    TerminateInstances {
        instance_ids: Vec<String>,
    },
}

impl Ec2Action {
    /// Decode the `Action` parameter and its arguments.
    pub fn decode(params: &QueryParams) -> Result<Self, ProtocolError> {
        let action = params.action()?;
        let decoded = match action {
            "CreateVpc" => Self::CreateVpc {
                cidr_block: params
                    .get("CidrBlock")
                    .filter(|c| !c.is_empty())
                    .unwrap_or(DEFAULT_VPC_CIDR)
                    .to_string(),
            },
            "DescribeVpcs" => Self::DescribeVpcs {
                vpc_ids: params.indexed("VpcId"),
            },
            "DeleteVpc" => Self::DeleteVpc {
                vpc_id: params.require("VpcId")?.to_string(),
            },
            "CreateSubnet" => Self::CreateSubnet {
                vpc_id: params.require("VpcId")?.to_string(),
                cidr_block: params.require("CidrBlock")?.to_string(),
                availability_zone: params
                    .get("AvailabilityZone")
                    .filter(|z| !z.is_empty())
                    .unwrap_or(DEFAULT_AVAILABILITY_ZONE)
                    .to_string(),
            },
            "DescribeSubnets" => Self::DescribeSubnets {
                subnet_ids: params.indexed("SubnetId"),
                vpc_ids: filter_values(params, "vpc-id"),
            },
            "DeleteSubnet" => Self::DeleteSubnet {
                subnet_id: params.require("SubnetId")?.to_string(),
            },
            "CreateSecurityGroup" => Self::CreateSecurityGroup {
                group_name: params.require("GroupName")?.to_string(),
                description: params.require("GroupDescription")?.to_string(),
                vpc_id: params.get("VpcId").filter(|v| !v.is_empty()).map(String::from),
            },
            "DescribeSecurityGroups" => Self::DescribeSecurityGroups {
                group_ids: params.indexed("GroupId"),
            },
            "DeleteSecurityGroup" => Self::DeleteSecurityGroup {
                group_id: params.require("GroupId")?.to_string(),
            },
            "AuthorizeSecurityGroupIngress" => Self::AuthorizeSecurityGroupIngress {
                group_id: params.require("GroupId")?.to_string(),
                permissions: decode_permissions(params)?,
            },
            "CreateInternetGateway" => Self::CreateInternetGateway,
            "AttachInternetGateway" => Self::AttachInternetGateway {
                internet_gateway_id: params.require("InternetGatewayId")?.to_string(),
                vpc_id: params.require("VpcId")?.to_string(),
            },
            "DescribeInternetGateways" => Self::DescribeInternetGateways {
                internet_gateway_ids: params.indexed("InternetGatewayId"),
            },
            "RunInstances" => {
                let min_count = params.get_parsed::<u32>("MinCount")?.unwrap_or(1);
                let max_count = params.get_parsed::<u32>("MaxCount")?.unwrap_or(min_count);
                if min_count == 0 {
                    return Err(ProtocolError::invalid("MinCount", "must be at least 1"));
                }
                if max_count < min_count {
                    return Err(ProtocolError::invalid(
                        "MaxCount",
                        "must not be less than MinCount",
                    ));
                }
                Self::RunInstances {
                    image_id: params
                        .get("ImageId")
                        .filter(|v| !v.is_empty())
                        .unwrap_or(DEFAULT_IMAGE_ID)
                        .to_string(),
                    instance_type: params
                        .get("InstanceType")
                        .filter(|v| !v.is_empty())
                        .unwrap_or(DEFAULT_INSTANCE_TYPE)
                        .to_string(),
                    min_count,
                    max_count,
                    subnet_id: params
                        .get("SubnetId")
                        .filter(|v| !v.is_empty())
                        .map(String::from),
                }
            }
            "DescribeInstances" => Self::DescribeInstances {
                instance_ids: params.indexed("InstanceId"),
            },
            "StopInstances" => Self::StopInstances {
                instance_ids: required_ids(params, "InstanceId")?,
            },
            "StartInstances" => Self::StartInstances {
                instance_ids: required_ids(params, "InstanceId")?,
            },
            "TerminateInstances" => Self::TerminateInstances {
                instance_ids: required_ids(params, "InstanceId")?,
            },
            other => return Err(ProtocolError::UnknownAction(other.to_string())),
        };
        Ok(decoded)
    }

    /// Wire name of the action, used for response element names.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateVpc { .. } => "CreateVpc",
            Self::DescribeVpcs { .. } => "DescribeVpcs",
            Self::DeleteVpc { .. } => "DeleteVpc",
            Self::CreateSubnet { .. } => "CreateSubnet",
            Self::DescribeSubnets { .. } => "DescribeSubnets",
            Self::DeleteSubnet { .. } => "DeleteSubnet",
            Self::CreateSecurityGroup { .. } => "CreateSecurityGroup",
            Self::DescribeSecurityGroups { .. } => "DescribeSecurityGroups",
            Self::DeleteSecurityGroup { .. } => "DeleteSecurityGroup",
            Self::AuthorizeSecurityGroupIngress { .. } => "AuthorizeSecurityGroupIngress",
            Self::CreateInternetGateway => "CreateInternetGateway",
            Self::AttachInternetGateway { .. } => "AttachInternetGateway",
            Self::DescribeInternetGateways { .. } => "DescribeInternetGateways",
            Self::RunInstances { .. } => "RunInstances",
            Self::DescribeInstances { .. } => "DescribeInstances",
            Self::StopInstances { .. } => "StopInstances",
            Self::StartInstances { .. } => "StartInstances",
            Self::TerminateInstances { .. } => "TerminateInstances",
        }
    }

    /// Actions that create real network objects and are metered.
    pub fn is_wiring(&self) -> bool {
        matches!(
            self,
            Self::CreateSubnet { .. }
                | Self::AuthorizeSecurityGroupIngress { .. }
                | Self::AttachInternetGateway { .. }
        )
    }
}

/// Whether `action` names an EC2 action this gateway understands.
pub fn is_ec2_action(action: &str) -> bool {
    matches!(
        action,
        "CreateVpc"
            | "DescribeVpcs"
            | "DeleteVpc"
            | "CreateSubnet"
            | "DescribeSubnets"
            | "DeleteSubnet"
            | "CreateSecurityGroup"
            | "DescribeSecurityGroups"
            | "DeleteSecurityGroup"
            | "AuthorizeSecurityGroupIngress"
            | "CreateInternetGateway"
            | "AttachInternetGateway"
            | "DescribeInternetGateways"
            | "RunInstances"
            | "DescribeInstances"
            | "StopInstances"
            | "StartInstances"
            | "TerminateInstances"
    )
}

fn required_ids(params: &QueryParams, prefix: &str) -> Result<Vec<String>, ProtocolError> {
    let ids = params.indexed(prefix);
    if ids.is_empty() {
        return Err(ProtocolError::MissingParameter(format!("{prefix}.1")));
    }
    Ok(ids)
}

// Filter.N.Name=<name>&Filter.N.Value.M=<value>
fn filter_values(params: &QueryParams, name: &str) -> Vec<String> {
    params
        .indexed_groups("Filter")
        .into_values()
        .filter(|group| group.get("Name").map(String::as_str) == Some(name))
        .flat_map(|group| {
            group
                .into_iter()
                .filter(|(k, _)| k.starts_with("Value."))
                .map(|(_, v)| v)
                .collect::<Vec<_>>()
        })
        .collect()
}

fn decode_permissions(params: &QueryParams) -> Result<Vec<IngressPermission>, ProtocolError> {
    let groups = params.indexed_groups("IpPermissions");
    if groups.is_empty() {
        // Flat form: IpProtocol, FromPort, ToPort, CidrIp
        return Ok(vec![IngressPermission {
            ip_protocol: params.require("IpProtocol")?.to_string(),
            from_port: params.get_parsed("FromPort")?,
            to_port: params.get_parsed("ToPort")?,
            cidr_ip: params
                .get("CidrIp")
                .filter(|c| !c.is_empty())
                .unwrap_or("0.0.0.0/0")
                .to_string(),
        }]);
    }

    let mut permissions = Vec::new();
    for (index, group) in groups {
        let field = |name: &str| format!("IpPermissions.{index}.{name}");
        let ip_protocol = group
            .get("IpProtocol")
            .cloned()
            .ok_or_else(|| ProtocolError::MissingParameter(field("IpProtocol")))?;
        let parse_port = |name: &str| -> Result<Option<i32>, ProtocolError> {
            group
                .get(name)
                .map(|v| {
                    v.parse::<i32>()
                        .map_err(|_| ProtocolError::invalid(field(name), format!("'{v}' is not a port")))
                })
                .transpose()
        };
        let from_port = parse_port("FromPort")?;
        let to_port = parse_port("ToPort")?;

        let cidrs: Vec<String> = group
            .iter()
            .filter(|(k, _)| k.starts_with("IpRanges.") && k.ends_with(".CidrIp"))
            .map(|(_, v)| v.clone())
            .collect();
        let cidrs = if cidrs.is_empty() {
            vec!["0.0.0.0/0".to_string()]
        } else {
            cidrs
        };
        for cidr_ip in cidrs {
            permissions.push(IngressPermission {
                ip_protocol: ip_protocol.clone(),
                from_port,
                to_port,
                cidr_ip,
            });
        }
    }
    Ok(permissions)
}

/// `<Response><Errors><Error>` body.
pub fn error_response(code: &str, message: &str, request_id: &str) -> String {
    let mut w = XmlWriter::document("Response", None);
    w.open("Errors")
        .open("Error")
        .element("Code", code)
        .element("Message", message)
        .close()
        .close()
        .element("RequestID", request_id);
    w.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(body: &str) -> Result<Ec2Action, ProtocolError> {
        Ec2Action::decode(&QueryParams::parse(body.as_bytes()))
    }

    #[test]
    fn test_create_vpc_defaults_cidr() {
        assert_eq!(
            decode("Action=CreateVpc").unwrap(),
            Ec2Action::CreateVpc {
                cidr_block: DEFAULT_VPC_CIDR.to_string()
            }
        );
    }

    #[test]
    fn test_create_subnet_requires_vpc() {
        let err = decode("Action=CreateSubnet&CidrBlock=10.0.1.0%2F24").unwrap_err();
        assert!(matches!(err, ProtocolError::MissingParameter(ref p) if p == "VpcId"));
    }

    #[test]
    fn test_describe_subnets_vpc_filter() {
        let action =
            decode("Action=DescribeSubnets&Filter.1.Name=vpc-id&Filter.1.Value.1=vpc-123").unwrap();
        assert_eq!(
            action,
            Ec2Action::DescribeSubnets {
                subnet_ids: vec![],
                vpc_ids: vec!["vpc-123".to_string()],
            }
        );
    }

    #[test]
    fn test_authorize_flat_form() {
        let action = decode(
            "Action=AuthorizeSecurityGroupIngress&GroupId=sg-1&IpProtocol=tcp&FromPort=22&ToPort=22",
        )
        .unwrap();
        let Ec2Action::AuthorizeSecurityGroupIngress { permissions, .. } = action else {
            panic!("unexpected action");
        };
        assert_eq!(permissions.len(), 1);
        assert_eq!(permissions[0].cidr_ip, "0.0.0.0/0");
        assert_eq!(permissions[0].from_port, Some(22));
    }

    #[test]
    fn test_authorize_structured_form_expands_ranges() {
        let action = decode(
            "Action=AuthorizeSecurityGroupIngress&GroupId=sg-1\
             &IpPermissions.1.IpProtocol=udp&IpPermissions.1.FromPort=53&IpPermissions.1.ToPort=53\
             &IpPermissions.1.IpRanges.1.CidrIp=10.0.0.0%2F8&IpPermissions.1.IpRanges.2.CidrIp=192.168.0.0%2F16",
        )
        .unwrap();
        let Ec2Action::AuthorizeSecurityGroupIngress { permissions, .. } = action else {
            panic!("unexpected action");
        };
        assert_eq!(permissions.len(), 2);
        assert!(permissions.iter().all(|p| p.ip_protocol == "udp"));
    }

    #[test]
    fn test_unknown_action() {
        assert!(matches!(
            decode("Action=CreateNatGateway"),
            Err(ProtocolError::UnknownAction(a)) if a == "CreateNatGateway"
        ));
        assert!(!is_ec2_action("CreateNatGateway"));
        assert!(is_ec2_action("CreateVpc"));
        assert!(is_ec2_action("RunInstances"));
    }

    #[test]
    fn test_run_instances_defaults() {
        assert_eq!(
            decode("Action=RunInstances").unwrap(),
            Ec2Action::RunInstances {
                image_id: DEFAULT_IMAGE_ID.to_string(),
                instance_type: DEFAULT_INSTANCE_TYPE.to_string(),
                min_count: 1,
                max_count: 1,
                subnet_id: None,
            }
        );
        let Ec2Action::RunInstances { min_count, max_count, instance_type, .. } =
            decode("Action=RunInstances&MinCount=2&MaxCount=3&InstanceType=m5.large").unwrap()
        else {
            panic!("unexpected action");
        };
        assert_eq!((min_count, max_count), (2, 3));
        assert_eq!(instance_type, "m5.large");
    }

    #[test]
    fn test_run_instances_rejects_bad_counts() {
        assert!(decode("Action=RunInstances&MinCount=0").is_err());
        assert!(decode("Action=RunInstances&MinCount=3&MaxCount=2").is_err());
        assert!(decode("Action=RunInstances&MinCount=lots").is_err());
    }

    #[test]
    fn test_instance_actions_need_ids() {
        let err = decode("Action=StopInstances").unwrap_err();
        assert!(matches!(err, ProtocolError::MissingParameter(ref p) if p == "InstanceId.1"));
        assert_eq!(
            decode("Action=TerminateInstances&InstanceId.1=i-1&InstanceId.2=i-2").unwrap(),
            Ec2Action::TerminateInstances {
                instance_ids: vec!["i-1".to_string(), "i-2".to_string()],
            }
        );
        assert_eq!(
            decode("Action=DescribeInstances").unwrap(),
            Ec2Action::DescribeInstances { instance_ids: vec![] }
        );
    }

    #[test]
    fn test_instance_state_codes() {
        assert_eq!(InstanceState::Running.code(), 16);
        assert_eq!(InstanceState::Stopped.code(), 80);
        assert_eq!(InstanceState::parse("terminated"), Some(InstanceState::Terminated));
        assert_eq!(InstanceState::parse("asleep"), None);
    }

    #[test]
    fn test_wiring_actions() {
        assert!(decode("Action=AttachInternetGateway&InternetGatewayId=igw-1&VpcId=vpc-1")
            .unwrap()
            .is_wiring());
        assert!(!decode("Action=CreateVpc").unwrap().is_wiring());
    }

    #[test]
    fn test_error_response_shape() {
        let xml = error_response("InvalidVpcID.NotFound", "The vpc 'vpc-1' does not exist", "req-1");
        assert!(xml.contains("<Response><Errors><Error><Code>InvalidVpcID.NotFound</Code>"));
        assert!(xml.contains("<RequestID>req-1</RequestID></Response>"));
    }
}
