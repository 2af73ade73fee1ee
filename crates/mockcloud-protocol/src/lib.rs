// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! MockCloud Protocol - wire codecs for the emulation gateway
//!
//! This crate turns provider wire formats into typed actions and renders
//! provider-shaped responses. It holds no state and performs no I/O; the
//! gateway in `mockcloud-environment` owns transport and dispatch.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    mockcloud-protocol                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Typed actions: Ec2Action, SqsAction, DynamoAction,         │
//! │                 LambdaAction, S3Action                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Encodings: form/query params, XML writer, AWS JSON,        │
//! │             DynamoDB attribute values                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  DNS: RFC 1035 question parsing and answer building         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Protocols
//!
//! | Protocol            | Request shape                          | Error shape                          |
//! |---------------------|----------------------------------------|--------------------------------------|
//! | EC2 Query           | `Action=CreateVpc&CidrBlock=...`       | `<Response><Errors><Error>`          |
//! | SQS Query           | `Action=SendMessage&QueueUrl=...`      | `<ErrorResponse><Error>`             |
//! | DynamoDB JSON       | `X-Amz-Target: DynamoDB_20120810.Op`   | `{"__type": "...#Code"}`             |
//! | Lambda JSON         | `X-Amz-Target: AWSLambda.Op20150331`   | `{"__type": "Code", "message": ..}`  |
//! | S3 REST             | `PUT /{bucket}/{key}`                  | `<Error><Code>`                      |
//! | DNS                 | UDP packet, single question            | header-only response with RCODE      |
//!
//! # Usage
//!
//! ```ignore
//! use mockcloud_protocol::{QueryParams, ec2::Ec2Action};
//!
//! let params = QueryParams::parse(b"Action=CreateVpc&CidrBlock=10.1.0.0%2F16");
//! let action = Ec2Action::decode(&params)?;
//! ```

pub mod aws_json;
pub mod dns;
pub mod dynamodb;
pub mod ec2;
pub mod error;
pub mod lambda;
pub mod query;
pub mod s3;
pub mod sqs;
pub mod xml;

pub use error::ProtocolError;
pub use query::QueryParams;
pub use xml::XmlWriter;

/// Account id used in every ARN and queue URL.
pub const ACCOUNT_ID: &str = "123456789012";

/// Region used in every ARN and queue URL.
pub const REGION: &str = "us-east-1";
