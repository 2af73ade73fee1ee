// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AWS JSON 1.0/1.1 protocol helpers.
//!
//! Operations are selected by the `X-Amz-Target` header
//! (`DynamoDB_20120810.PutItem`, `AWSLambda.CreateFunction20150331`) and
//! errors are JSON objects carrying a `__type` discriminator.

use serde::Serialize;

use crate::error::ProtocolError;

/// Header naming the operation.
pub const TARGET_HEADER: &str = "x-amz-target";

/// Content type used by DynamoDB responses.
pub const CONTENT_TYPE_1_0: &str = "application/x-amz-json-1.0";

/// A parsed `X-Amz-Target` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub service: String,
    pub operation: String,
}

impl Target {
    /// Split `Service.Operation` at the last dot. A value without a dot is
    /// treated as a bare operation name.
    pub fn parse(header: &str) -> Result<Self, ProtocolError> {
        let header = header.trim();
        if header.is_empty() {
            return Err(ProtocolError::MissingTarget);
        }
        let (service, operation) = match header.rsplit_once('.') {
            Some((service, operation)) => (service, operation),
            None => ("", header),
        };
        if operation.is_empty() {
            return Err(ProtocolError::MissingTarget);
        }
        Ok(Self {
            service: service.to_string(),
            operation: operation.to_string(),
        })
    }
}

/// JSON error body: `{"__type": ..., "message": ...}`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JsonError {
    #[serde(rename = "__type")]
    pub error_type: String,
    pub message: String,
}

impl JsonError {
    /// Error whose `__type` is `{prefix}#{code}` (or just `code`).
    pub fn new(prefix: Option<&str>, code: &str, message: impl Into<String>) -> Self {
        let error_type = match prefix {
            Some(prefix) => format!("{prefix}#{code}"),
            None => code.to_string(),
        };
        Self {
            error_type,
            message: message.into(),
        }
    }
}

/// Parse a JSON request body, treating an empty body as `{}`.
pub fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, ProtocolError> {
    let trimmed = body.iter().all(u8::is_ascii_whitespace);
    if trimmed {
        return Ok(serde_json::from_slice(b"{}")?);
    }
    Ok(serde_json::from_slice(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_parse() {
        let target = Target::parse("DynamoDB_20120810.PutItem").unwrap();
        assert_eq!(target.service, "DynamoDB_20120810");
        assert_eq!(target.operation, "PutItem");

        let bare = Target::parse("Invoke").unwrap();
        assert_eq!(bare.service, "");
        assert_eq!(bare.operation, "Invoke");

        assert!(Target::parse("").is_err());
        assert!(Target::parse("DynamoDB_20120810.").is_err());
    }

    #[test]
    fn test_json_error_shape() {
        let err = JsonError::new(
            Some("com.amazonaws.dynamodb.v20120810"),
            "ResourceNotFoundException",
            "Requested resource not found",
        );
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(
            value["__type"],
            "com.amazonaws.dynamodb.v20120810#ResourceNotFoundException"
        );
        assert_eq!(value["message"], "Requested resource not found");
    }

    #[test]
    fn test_parse_empty_body() {
        let value: serde_json::Value = parse_body(b"  ").unwrap();
        assert!(value.as_object().unwrap().is_empty());
        assert!(parse_body::<serde_json::Value>(b"{not json").is_err());
    }
}
