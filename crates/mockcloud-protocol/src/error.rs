// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Decoding errors shared by the request codecs.

use thiserror::Error;

/// Errors raised while decoding a request into a typed action.
///
/// Every variant is a client error; the gateway renders it in the native
/// error shape of the protocol that produced it.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("missing required parameter: {0}")]
    MissingParameter(String),

    #[error("invalid value for parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("missing or malformed X-Amz-Target header")]
    MissingTarget,

    #[error("invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("invalid expression: {0}")]
    InvalidExpression(String),
}

impl ProtocolError {
    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// AWS error code matching this decoding failure.
    pub fn aws_code(&self) -> &'static str {
        match self {
            Self::MissingParameter(_) => "MissingParameter",
            Self::InvalidParameter { .. } => "InvalidParameterValue",
            Self::UnknownAction(_) => "InvalidAction",
            Self::MissingTarget => "InvalidAction",
            Self::InvalidJson(_) => "ValidationException",
            Self::InvalidExpression(_) => "ValidationException",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aws_codes() {
        assert_eq!(
            ProtocolError::MissingParameter("VpcId".into()).aws_code(),
            "MissingParameter"
        );
        assert_eq!(
            ProtocolError::UnknownAction("Foo".into()).aws_code(),
            "InvalidAction"
        );
        assert_eq!(
            ProtocolError::invalid("MaxNumberOfMessages", "not a number").to_string(),
            "invalid value for parameter MaxNumberOfMessages: not a number"
        );
    }
}
