// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lambda JSON protocol.
//!
//! Operations arrive either with a target header
//! (`X-Amz-Target: AWSLambda.CreateFunction20150331`) or, for invocation,
//! as `POST /2015-03-31/functions/{name}/invocations` with the raw payload
//! as the body.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::Deserialize;

use crate::aws_json::parse_body;
use crate::error::ProtocolError;
use crate::{ACCOUNT_ID, REGION};

/// Header selecting the invocation type.
pub const INVOCATION_TYPE_HEADER: &str = "x-amz-invocation-type";

/// Image used when a runtime is not in the table.
pub const DEFAULT_RUNTIME_IMAGE: &str = "public.ecr.aws/lambda/python:3.11";

pub const DEFAULT_RUNTIME: &str = "python3.11";
pub const DEFAULT_HANDLER: &str = "index.handler";
pub const DEFAULT_ROLE: &str = "arn:aws:iam::123456789012:role/mock-lambda-role";
pub const DEFAULT_MEMORY_MB: i64 = 128;
pub const DEFAULT_TIMEOUT_SECS: i64 = 3;

pub fn function_arn(name: &str) -> String {
    format!("arn:aws:lambda:{REGION}:{ACCOUNT_ID}:function:{name}")
}

/// Runtime interface image for a Lambda runtime identifier.
pub fn runtime_image(runtime: &str) -> &'static str {
    match runtime {
        "python3.9" => "public.ecr.aws/lambda/python:3.9",
        "python3.10" => "public.ecr.aws/lambda/python:3.10",
        "python3.11" => "public.ecr.aws/lambda/python:3.11",
        "nodejs16.x" => "public.ecr.aws/lambda/nodejs:16",
        "nodejs18.x" => "public.ecr.aws/lambda/nodejs:18",
        "ruby3.2" => "public.ecr.aws/lambda/ruby:3.2",
        "java11" => "public.ecr.aws/lambda/java:11",
        "java17" => "public.ecr.aws/lambda/java:17",
        "dotnet6" => "public.ecr.aws/lambda/dotnet:6",
        "go1.x" => "public.ecr.aws/lambda/go:1",
        _ => DEFAULT_RUNTIME_IMAGE,
    }
}

/// `X-Amz-Invocation-Type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvocationType {
    #[default]
    RequestResponse,
    Event,
    DryRun,
}

impl InvocationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestResponse => "RequestResponse",
            Self::Event => "Event",
            Self::DryRun => "DryRun",
        }
    }
}

impl FromStr for InvocationType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "RequestResponse" => Ok(Self::RequestResponse),
            "Event" => Ok(Self::Event),
            "DryRun" => Ok(Self::DryRun),
            other => Err(ProtocolError::invalid(
                "X-Amz-Invocation-Type",
                format!("'{other}' is not a valid invocation type"),
            )),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FunctionCode {
    pub zip_file: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EnvironmentVariables {
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateFunctionInput {
    pub function_name: String,
    pub runtime: Option<String>,
    pub handler: Option<String>,
    pub role: Option<String>,
    pub description: Option<String>,
    pub memory_size: Option<i64>,
    pub timeout: Option<i64>,
    #[serde(default)]
    pub code: FunctionCode,
    #[serde(default)]
    pub environment: EnvironmentVariables,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FunctionNameInput {
    function_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UpdateCodeInput {
    function_name: String,
    zip_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TargetInvokeInput {
    function_name: String,
    #[serde(default)]
    payload: Option<serde_json::Value>,
    invocation_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeInput {
    pub function_name: String,
    pub invocation_type: InvocationType,
    pub payload: Vec<u8>,
}

impl InvokeInput {
    /// Decode a REST-style invocation: the name comes from the path and the
    /// body is the raw payload.
    pub fn from_rest(
        function_name: &str,
        invocation_type: Option<&str>,
        body: &[u8],
    ) -> Result<Self, ProtocolError> {
        if function_name.is_empty() {
            return Err(ProtocolError::MissingParameter("FunctionName".into()));
        }
        let payload = if body.is_empty() {
            b"{}".to_vec()
        } else {
            body.to_vec()
        };
        Ok(Self {
            function_name: function_name.to_string(),
            invocation_type: invocation_type.unwrap_or_default().parse()?,
            payload,
        })
    }
}

/// Decoded Lambda operation.
#[derive(Debug, Clone)]
pub enum LambdaAction {
    CreateFunction(CreateFunctionInput),
    GetFunction { function_name: String },
    ListFunctions,
    UpdateFunctionCode { function_name: String, zip_file: String },
    DeleteFunction { function_name: String },
    Invoke(InvokeInput),
}

/// Strip the service prefix and the API version suffix from a target
/// operation (`CreateFunction20150331` becomes `CreateFunction`).
pub fn operation_name(operation: &str) -> &str {
    operation.strip_suffix("20150331").unwrap_or(operation)
}

impl LambdaAction {
    /// Decode a target-header request.
    pub fn decode(
        operation: &str,
        invocation_type: Option<&str>,
        body: &[u8],
    ) -> Result<Self, ProtocolError> {
        let action = match operation_name(operation) {
            "CreateFunction" => Self::CreateFunction(parse_body(body)?),
            "GetFunction" => {
                let input: FunctionNameInput = parse_body(body)?;
                Self::GetFunction {
                    function_name: input.function_name,
                }
            }
            "ListFunctions" => Self::ListFunctions,
            "UpdateFunctionCode" => {
                let input: UpdateCodeInput = parse_body(body)?;
                Self::UpdateFunctionCode {
                    function_name: input.function_name,
                    zip_file: input
                        .zip_file
                        .ok_or_else(|| ProtocolError::MissingParameter("ZipFile".into()))?,
                }
            }
            "DeleteFunction" => {
                let input: FunctionNameInput = parse_body(body)?;
                Self::DeleteFunction {
                    function_name: input.function_name,
                }
            }
            "Invoke" => {
                let input: TargetInvokeInput = parse_body(body)?;
                let payload = match input.payload {
                    Some(serde_json::Value::String(raw)) => raw.into_bytes(),
                    Some(value) => serde_json::to_vec(&value)?,
                    None => b"{}".to_vec(),
                };
                let invocation_type = invocation_type
                    .or(input.invocation_type.as_deref())
                    .unwrap_or_default()
                    .parse()?;
                Self::Invoke(InvokeInput {
                    function_name: input.function_name,
                    invocation_type,
                    payload,
                })
            }
            other => return Err(ProtocolError::UnknownAction(other.to_string())),
        };
        Ok(action)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateFunction(_) => "CreateFunction",
            Self::GetFunction { .. } => "GetFunction",
            Self::ListFunctions => "ListFunctions",
            Self::UpdateFunctionCode { .. } => "UpdateFunctionCode",
            Self::DeleteFunction { .. } => "DeleteFunction",
            Self::Invoke(_) => "Invoke",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_name_strips_version() {
        assert_eq!(operation_name("CreateFunction20150331"), "CreateFunction");
        assert_eq!(operation_name("Invoke"), "Invoke");
    }

    #[test]
    fn test_create_function_defaults_are_optional() {
        let action = LambdaAction::decode(
            "CreateFunction20150331",
            None,
            br#"{"FunctionName": "hello", "Code": {"ZipFile": "UEsDBA=="}}"#,
        )
        .unwrap();
        let LambdaAction::CreateFunction(input) = action else {
            panic!("unexpected action");
        };
        assert_eq!(input.function_name, "hello");
        assert!(input.runtime.is_none());
        assert_eq!(input.code.zip_file.as_deref(), Some("UEsDBA=="));
        assert!(input.environment.variables.is_empty());
    }

    #[test]
    fn test_invoke_via_target_uses_header_type() {
        let action = LambdaAction::decode(
            "Invoke",
            Some("Event"),
            br#"{"FunctionName": "hello", "Payload": {"k": 1}}"#,
        )
        .unwrap();
        let LambdaAction::Invoke(input) = action else {
            panic!("unexpected action");
        };
        assert_eq!(input.invocation_type, InvocationType::Event);
        assert_eq!(input.payload, br#"{"k":1}"#.to_vec());
    }

    #[test]
    fn test_invoke_rest_form() {
        let input = InvokeInput::from_rest("hello", Some("DryRun"), b"").unwrap();
        assert_eq!(input.invocation_type, InvocationType::DryRun);
        assert_eq!(input.payload, b"{}".to_vec());
        assert!(InvokeInput::from_rest("hello", Some("Later"), b"").is_err());
    }

    #[test]
    fn test_runtime_images() {
        assert_eq!(runtime_image("nodejs18.x"), "public.ecr.aws/lambda/nodejs:18");
        assert_eq!(runtime_image("cobol"), DEFAULT_RUNTIME_IMAGE);
    }

    #[test]
    fn test_unknown_operation() {
        assert!(matches!(
            LambdaAction::decode("PublishLayerVersion20150331", None, b"{}"),
            Err(ProtocolError::UnknownAction(op)) if op == "PublishLayerVersion"
        ));
    }

    #[test]
    fn test_function_arn() {
        assert_eq!(
            function_arn("hello"),
            "arn:aws:lambda:us-east-1:123456789012:function:hello"
        );
    }
}
