// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource emulators.
//!
//! Each emulator owns the logical resource model of one cloud service and
//! executes already-decoded actions against it. Emulators know nothing
//! about wire formats; the gateway decodes requests into typed actions and
//! renders emulator output and [`EmulatorError`]s in the caller's protocol.
//!
//! Data-plane actions follow one sequence:
//!
//! 1. locate the owning resource (provider-shaped not-found otherwise)
//! 2. require a positive credit balance
//! 3. materialize the backing object (write-class actions only)
//! 4. mutate, with statistics updated in the same store transaction
//! 5. charge; a failed charge is recorded, never unwound

pub mod dynamodb;
pub mod lambda;
pub mod s3;
pub mod sqs;
pub mod vpc;

pub use dynamodb::DynamoEmulator;
pub use lambda::{HttpLambdaTransport, LambdaEmulator, LambdaTransport};
pub use s3::S3Emulator;
pub use sqs::SqsEmulator;
pub use vpc::VpcEmulator;

use std::sync::Arc;

use mockcloud_core::persistence::EnvironmentRecord;
use mockcloud_core::{CoreError, Persistence};
use mockcloud_protocol::ProtocolError;
use rand::Rng;
use thiserror::Error;

use crate::billing::{BillingEngine, BillingError, Charge};
use crate::materializer::Materializer;
use crate::provisioner::ProvisionError;

/// Errors surfaced by emulated actions.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EmulatorError {
    /// The request is well-formed but invalid.
    #[error("{message}")]
    Validation {
        /// Provider error code.
        code: &'static str,
        /// Message.
        message: String,
    },

    /// The addressed resource does not exist.
    #[error("{message}")]
    NotFound {
        /// Provider error code.
        code: &'static str,
        /// Message.
        message: String,
    },

    /// A resource with the same identity exists.
    #[error("{message}")]
    AlreadyExists {
        /// Provider error code.
        code: &'static str,
        /// Message.
        message: String,
    },

    /// The action is not supported.
    #[error("The action {0} is not valid for this web service.")]
    InvalidAction(String),

    /// Dependent resources block the action.
    #[error("{0}")]
    DependencyViolation(String),

    /// The owner has no credit left for data-plane use.
    #[error("{0}")]
    InsufficientCredit(String),

    /// A shared resource (the port range) is exhausted.
    #[error("{0}")]
    ServiceUnavailable(String),

    /// A container or cloud adapter failed.
    #[error("Backing service failure: {0}")]
    Backing(String),

    /// The request could not be decoded.
    #[error("{0}")]
    Protocol(ProtocolError),

    /// The store failed.
    #[error("Internal error: {0}")]
    Core(#[from] CoreError),

    /// A stored document could not be encoded or decoded.
    #[error("Internal error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EmulatorError {
    /// Not-found error with a provider code.
    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::NotFound {
            code,
            message: message.into(),
        }
    }

    /// Validation error with a provider code.
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    /// Conflict error with a provider code.
    pub fn already_exists(code: &'static str, message: impl Into<String>) -> Self {
        Self::AlreadyExists {
            code,
            message: message.into(),
        }
    }

    /// Provider error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { code, .. }
            | Self::NotFound { code, .. }
            | Self::AlreadyExists { code, .. } => code,
            Self::InvalidAction(_) => "InvalidAction",
            Self::DependencyViolation(_) => "DependencyViolation",
            Self::InsufficientCredit(_) => "InsufficientCredit",
            Self::ServiceUnavailable(_) => "ServiceUnavailable",
            Self::Backing(_) | Self::Core(_) | Self::Json(_) => "InternalFailure",
            Self::Protocol(e) => e.aws_code(),
        }
    }

    /// HTTP status.
    pub fn status(&self) -> u16 {
        match self {
            Self::Validation { .. }
            | Self::InvalidAction(_)
            | Self::DependencyViolation(_)
            | Self::Protocol(_) => 400,
            Self::NotFound { .. } => 404,
            Self::AlreadyExists { .. } => 409,
            Self::InsufficientCredit(_) => 402,
            Self::ServiceUnavailable(_) => 503,
            Self::Backing(_) | Self::Core(_) | Self::Json(_) => 500,
        }
    }

    /// Status for Query and DynamoDB protocols, which report every client
    /// error as 400.
    pub fn query_status(&self) -> u16 {
        match self.status() {
            404 | 409 => 400,
            other => other,
        }
    }

    /// Whether the caller is at fault.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status())
    }
}

impl From<ProtocolError> for EmulatorError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::UnknownAction(action) => Self::InvalidAction(action),
            other => Self::Protocol(other),
        }
    }
}

impl From<ProvisionError> for EmulatorError {
    fn from(e: ProvisionError) -> Self {
        if e.is_ports_exhausted() {
            return Self::ServiceUnavailable(e.to_string());
        }
        match e {
            ProvisionError::Core(core) => Self::Core(core),
            other => Self::Backing(other.to_string()),
        }
    }
}

impl From<BillingError> for EmulatorError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::InsufficientCredit { .. } => Self::InsufficientCredit(
                "Insufficient credit balance for data-plane operations".to_string(),
            ),
            BillingError::Core(core) => Self::Core(core),
        }
    }
}

/// Result type for emulated actions.
pub type Result<T> = std::result::Result<T, EmulatorError>;

/// Collaborators shared by every emulator.
#[derive(Clone)]
pub struct EmulatorContext {
    /// Resource state.
    pub persistence: Arc<dyn Persistence>,
    /// Metering.
    pub billing: BillingEngine,
    /// Lazy backing objects.
    pub materializer: Materializer,
}

impl EmulatorContext {
    /// Create a context.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        billing: BillingEngine,
        materializer: Materializer,
    ) -> Self {
        Self {
            persistence,
            billing,
            materializer,
        }
    }

    /// Step 2 of a data-plane action.
    pub async fn require_funds(&self, environment: &EnvironmentRecord) -> Result<()> {
        self.billing.ensure_funds(&environment.user_id).await?;
        Ok(())
    }

    /// Step 5 of a data-plane action.
    pub async fn charge(
        &self,
        environment: &EnvironmentRecord,
        service: &str,
        operation: &str,
        units: i64,
        cost_nanocredits: i64,
    ) {
        self.billing
            .charge(Charge {
                user_id: &environment.user_id,
                environment_id: Some(&environment.id),
                service,
                operation,
                units,
                cost_nanocredits,
            })
            .await;
    }
}

/// `prefix` followed by `len` lowercase hex digits.
pub fn hex_id(prefix: &str, len: usize) -> String {
    let mut rng = rand::thread_rng();
    let digits: String = (0..len)
        .map(|_| char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
        .collect();
    format!("{prefix}{digits}")
}
