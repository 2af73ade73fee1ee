// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQS Query protocol.

use std::collections::BTreeMap;

use md5::{Digest, Md5};

use crate::error::ProtocolError;
use crate::query::QueryParams;
use crate::xml::XmlWriter;
use crate::{ACCOUNT_ID, REGION};

/// XML namespace of SQS responses.
pub const SQS_NAMESPACE: &str = "http://queue.amazonaws.com/doc/2012-11-05/";

/// Upper bound for `MaxNumberOfMessages`.
pub const MAX_RECEIVE_MESSAGES: u32 = 10;

/// Upper bound for `WaitTimeSeconds`.
pub const MAX_WAIT_TIME_SECONDS: i64 = 20;

/// Hex MD5 digest of a message body, as returned in `MD5OfMessageBody`.
pub fn body_md5(body: &str) -> String {
    hex::encode(Md5::digest(body.as_bytes()))
}

pub fn queue_url(name: &str) -> String {
    format!("https://sqs.{REGION}.amazonaws.com/{ACCOUNT_ID}/{name}")
}

pub fn queue_arn(name: &str) -> String {
    format!("arn:aws:sqs:{REGION}:{ACCOUNT_ID}:{name}")
}

/// A message to enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub body: String,
    pub delay_seconds: Option<i64>,
    pub message_group_id: Option<String>,
}

/// One entry of `SendMessageBatch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub id: String,
    pub message: OutgoingMessage,
}

/// Decoded SQS action. Queues are addressed by name, taken from the last
/// path segment of `QueueUrl` or from `QueueName`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqsAction {
    CreateQueue {
        queue_name: String,
        attributes: BTreeMap<String, String>,
    },
    GetQueueUrl {
        queue_name: String,
    },
    ListQueues {
        prefix: Option<String>,
    },
    DeleteQueue {
        queue_name: String,
    },
    SendMessage {
        queue_name: String,
        message: OutgoingMessage,
    },
    SendMessageBatch {
        queue_name: String,
        entries: Vec<BatchEntry>,
    },
    ReceiveMessage {
        queue_name: String,
        max_messages: u32,
        visibility_timeout: Option<i64>,
        wait_time_seconds: Option<i64>,
    },
    DeleteMessage {
        queue_name: String,
        receipt_handle: String,
    },
    ChangeMessageVisibility {
        queue_name: String,
        receipt_handle: String,
        visibility_timeout: i64,
    },
    GetQueueAttributes {
        queue_name: String,
        names: Vec<String>,
    },
    SetQueueAttributes {
        queue_name: String,
        attributes: BTreeMap<String, String>,
    },
    PurgeQueue {
        queue_name: String,
    },
}

impl SqsAction {
    pub fn decode(params: &QueryParams) -> Result<Self, ProtocolError> {
        let action = params.action()?;
        let decoded = match action {
            "CreateQueue" => Self::CreateQueue {
                queue_name: params.require("QueueName")?.to_string(),
                attributes: params.attribute_map("Attribute"),
            },
            "GetQueueUrl" => Self::GetQueueUrl {
                queue_name: params.require("QueueName")?.to_string(),
            },
            "ListQueues" => Self::ListQueues {
                prefix: params
                    .get("QueueNamePrefix")
                    .filter(|p| !p.is_empty())
                    .map(String::from),
            },
            "DeleteQueue" => Self::DeleteQueue {
                queue_name: queue_name(params)?,
            },
            "SendMessage" => Self::SendMessage {
                queue_name: queue_name(params)?,
                message: OutgoingMessage {
                    body: params.require("MessageBody")?.to_string(),
                    delay_seconds: params.get_parsed("DelaySeconds")?,
                    message_group_id: params.get("MessageGroupId").map(String::from),
                },
            },
            "SendMessageBatch" => Self::SendMessageBatch {
                queue_name: queue_name(params)?,
                entries: decode_batch(params)?,
            },
            "ReceiveMessage" => {
                let max_messages = params
                    .get_parsed::<u32>("MaxNumberOfMessages")?
                    .unwrap_or(1)
                    .clamp(1, MAX_RECEIVE_MESSAGES);
                Self::ReceiveMessage {
                    queue_name: queue_name(params)?,
                    max_messages,
                    visibility_timeout: params.get_parsed("VisibilityTimeout")?,
                    wait_time_seconds: params
                        .get_parsed::<i64>("WaitTimeSeconds")?
                        .map(|w| w.clamp(0, MAX_WAIT_TIME_SECONDS)),
                }
            }
            "DeleteMessage" => Self::DeleteMessage {
                queue_name: queue_name(params)?,
                receipt_handle: params.require("ReceiptHandle")?.to_string(),
            },
            "ChangeMessageVisibility" => Self::ChangeMessageVisibility {
                queue_name: queue_name(params)?,
                receipt_handle: params.require("ReceiptHandle")?.to_string(),
                visibility_timeout: params
                    .get_parsed("VisibilityTimeout")?
                    .ok_or_else(|| ProtocolError::MissingParameter("VisibilityTimeout".into()))?,
            },
            "GetQueueAttributes" => Self::GetQueueAttributes {
                queue_name: queue_name(params)?,
                names: params.indexed("AttributeName"),
            },
            "SetQueueAttributes" => Self::SetQueueAttributes {
                queue_name: queue_name(params)?,
                attributes: params.attribute_map("Attribute"),
            },
            "PurgeQueue" => Self::PurgeQueue {
                queue_name: queue_name(params)?,
            },
            other => return Err(ProtocolError::UnknownAction(other.to_string())),
        };
        Ok(decoded)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateQueue { .. } => "CreateQueue",
            Self::GetQueueUrl { .. } => "GetQueueUrl",
            Self::ListQueues { .. } => "ListQueues",
            Self::DeleteQueue { .. } => "DeleteQueue",
            Self::SendMessage { .. } => "SendMessage",
            Self::SendMessageBatch { .. } => "SendMessageBatch",
            Self::ReceiveMessage { .. } => "ReceiveMessage",
            Self::DeleteMessage { .. } => "DeleteMessage",
            Self::ChangeMessageVisibility { .. } => "ChangeMessageVisibility",
            Self::GetQueueAttributes { .. } => "GetQueueAttributes",
            Self::SetQueueAttributes { .. } => "SetQueueAttributes",
            Self::PurgeQueue { .. } => "PurgeQueue",
        }
    }
}

fn queue_name(params: &QueryParams) -> Result<String, ProtocolError> {
    if let Some(url) = params.get("QueueUrl").filter(|u| !u.is_empty()) {
        let name = url.trim_end_matches('/').rsplit('/').next().unwrap_or(url);
        return Ok(name.to_string());
    }
    params
        .get("QueueName")
        .filter(|n| !n.is_empty())
        .map(String::from)
        .ok_or_else(|| ProtocolError::MissingParameter("QueueUrl".into()))
}

fn decode_batch(params: &QueryParams) -> Result<Vec<BatchEntry>, ProtocolError> {
    let prefix = "SendMessageBatchRequestEntry";
    let mut entries = Vec::new();
    for (index, group) in params.indexed_groups(prefix) {
        let missing = |name: &str| ProtocolError::MissingParameter(format!("{prefix}.{index}.{name}"));
        let id = group.get("Id").cloned().ok_or_else(|| missing("Id"))?;
        let body = group
            .get("MessageBody")
            .cloned()
            .ok_or_else(|| missing("MessageBody"))?;
        let delay_seconds = group
            .get("DelaySeconds")
            .map(|d| {
                d.parse::<i64>().map_err(|_| {
                    ProtocolError::invalid(format!("{prefix}.{index}.DelaySeconds"), "not a number")
                })
            })
            .transpose()?;
        entries.push(BatchEntry {
            id,
            message: OutgoingMessage {
                body,
                delay_seconds,
                message_group_id: group.get("MessageGroupId").cloned(),
            },
        });
    }
    if entries.is_empty() {
        return Err(ProtocolError::MissingParameter(format!("{prefix}.1.Id")));
    }
    Ok(entries)
}

/// `<ErrorResponse><Error>` body.
pub fn error_response(code: &str, message: &str, request_id: &str) -> String {
    let mut w = XmlWriter::document("ErrorResponse", Some(SQS_NAMESPACE));
    w.open("Error")
        .element("Type", "Sender")
        .element("Code", code)
        .element("Message", message)
        .empty("Detail")
        .close()
        .element("RequestId", request_id);
    w.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(body: &str) -> Result<SqsAction, ProtocolError> {
        SqsAction::decode(&QueryParams::parse(body.as_bytes()))
    }

    #[test]
    fn test_md5_matches_known_digest() {
        assert_eq!(body_md5("hello"), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn test_queue_name_from_url() {
        let action = decode(
            "Action=PurgeQueue&QueueUrl=https%3A%2F%2Fsqs.us-east-1.amazonaws.com%2F123456789012%2Forders",
        )
        .unwrap();
        assert_eq!(
            action,
            SqsAction::PurgeQueue {
                queue_name: "orders".into()
            }
        );
    }

    #[test]
    fn test_queue_name_fallback_and_missing() {
        assert_eq!(
            decode("Action=DeleteQueue&QueueName=jobs").unwrap(),
            SqsAction::DeleteQueue {
                queue_name: "jobs".into()
            }
        );
        assert!(matches!(
            decode("Action=DeleteQueue"),
            Err(ProtocolError::MissingParameter(p)) if p == "QueueUrl"
        ));
    }

    #[test]
    fn test_receive_clamps_limits() {
        let action =
            decode("Action=ReceiveMessage&QueueName=q&MaxNumberOfMessages=50&WaitTimeSeconds=90")
                .unwrap();
        let SqsAction::ReceiveMessage {
            max_messages,
            wait_time_seconds,
            ..
        } = action
        else {
            panic!("unexpected action");
        };
        assert_eq!(max_messages, 10);
        assert_eq!(wait_time_seconds, Some(20));
    }

    #[test]
    fn test_send_message_batch() {
        let action = decode(
            "Action=SendMessageBatch&QueueName=q\
             &SendMessageBatchRequestEntry.1.Id=a&SendMessageBatchRequestEntry.1.MessageBody=one\
             &SendMessageBatchRequestEntry.2.Id=b&SendMessageBatchRequestEntry.2.MessageBody=two\
             &SendMessageBatchRequestEntry.2.DelaySeconds=5",
        )
        .unwrap();
        let SqsAction::SendMessageBatch { entries, .. } = action else {
            panic!("unexpected action");
        };
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].message.delay_seconds, Some(5));
    }

    #[test]
    fn test_error_response_shape() {
        let xml = error_response(
            "AWS.SimpleQueueService.NonExistentQueue",
            "The specified queue does not exist.",
            "req-9",
        );
        assert!(xml.contains("<Type>Sender</Type>"));
        assert!(xml.contains("<Code>AWS.SimpleQueueService.NonExistentQueue</Code>"));
        assert!(xml.contains("<RequestId>req-9</RequestId>"));
    }

    #[test]
    fn test_url_and_arn() {
        assert_eq!(
            queue_url("q1"),
            "https://sqs.us-east-1.amazonaws.com/123456789012/q1"
        );
        assert_eq!(queue_arn("q1"), "arn:aws:sqs:us-east-1:123456789012:q1");
    }
}
