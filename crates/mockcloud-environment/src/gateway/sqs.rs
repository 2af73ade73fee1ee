// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQS Query endpoint. Parameters come from the query string, the form
//! body, or both.

use axum::extract::{RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use mockcloud_protocol::sqs::{self, SQS_NAMESPACE, SqsAction};
use mockcloud_protocol::xml::XmlWriter;
use tracing::error;

use super::ec2::params;
use super::{GatewayState, request_id, status_code, xml_response};
use crate::emulators::EmulatorError;
use crate::emulators::sqs::{ReceivedMessage, SqsOutput};

pub(super) async fn handle(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let request_id = request_id();
    let environment = match state.resolve(&headers).await {
        Ok(env) => env,
        Err(e) => return error_xml(e.status(), e.code(), &e.to_string(), &request_id),
    };
    let action = match SqsAction::decode(&params(query.as_deref(), &body)) {
        Ok(action) => action,
        Err(e) => return emulator_error(EmulatorError::from(e), &request_id),
    };
    let name = action.name();
    match state.sqs.execute(&environment, action).await {
        Ok(output) => xml_response(StatusCode::OK, render(name, &output, &request_id)),
        Err(e) => {
            if !e.is_client_error() {
                error!(environment_id = %environment.id, action = name, error = %e, "SQS action failed");
            }
            emulator_error(e, &request_id)
        }
    }
}

fn emulator_error(e: EmulatorError, request_id: &str) -> Response {
    error_xml(status_code(e.query_status()), e.code(), &e.to_string(), request_id)
}

fn error_xml(status: StatusCode, code: &str, message: &str, request_id: &str) -> Response {
    xml_response(status, sqs::error_response(code, message, request_id))
}

fn render(action: &str, output: &SqsOutput, request_id: &str) -> String {
    let mut w = XmlWriter::document(&format!("{action}Response"), Some(SQS_NAMESPACE));
    if !matches!(output, SqsOutput::Done) {
        w.open(&format!("{action}Result"));
        match output {
            SqsOutput::QueueUrl(url) => {
                w.element("QueueUrl", url);
            }
            SqsOutput::QueueUrls(urls) => {
                for url in urls {
                    w.element("QueueUrl", url);
                }
            }
            SqsOutput::MessageSent {
                message_id,
                md5_of_body,
            } => {
                w.element("MD5OfMessageBody", md5_of_body)
                    .element("MessageId", message_id);
            }
            SqsOutput::BatchSent(results) => {
                for result in results {
                    w.open("SendMessageBatchResultEntry")
                        .element("Id", &result.id)
                        .element("MessageId", &result.message_id)
                        .element("MD5OfMessageBody", &result.md5_of_body)
                        .close();
                }
            }
            SqsOutput::Messages(messages) => {
                for message in messages {
                    write_message(&mut w, message);
                }
            }
            SqsOutput::Attributes(attributes) => {
                for (name, value) in attributes {
                    write_attribute(&mut w, name, value);
                }
            }
            SqsOutput::Done => {}
        }
        w.close();
    }
    w.open("ResponseMetadata")
        .element("RequestId", request_id)
        .close();
    w.finish()
}

fn write_message(w: &mut XmlWriter, message: &ReceivedMessage) {
    w.open("Message")
        .element("MessageId", &message.message_id)
        .element("ReceiptHandle", &message.receipt_handle)
        .element("MD5OfBody", &message.md5_of_body)
        .element("Body", &message.body);
    write_attribute(w, "SentTimestamp", message.sent_at_ms);
    write_attribute(w, "ApproximateReceiveCount", message.receive_count);
    if let Some(group) = &message.message_group_id {
        write_attribute(w, "MessageGroupId", group);
    }
    w.close();
}

fn write_attribute(w: &mut XmlWriter, name: &str, value: impl std::fmt::Display) {
    w.open("Attribute")
        .element("Name", name)
        .element("Value", value)
        .close();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_receive() {
        let output = SqsOutput::Messages(vec![ReceivedMessage {
            message_id: "m-1".to_string(),
            receipt_handle: "rh-1".to_string(),
            md5_of_body: sqs::body_md5("hello"),
            body: "hello".to_string(),
            sent_at_ms: 1_700_000_000_000,
            receive_count: 2,
            message_group_id: None,
        }]);
        let xml = render("ReceiveMessage", &output, "req-1");
        assert!(xml.contains("<ReceiveMessageResult><Message><MessageId>m-1</MessageId>"));
        assert!(xml.contains("<MD5OfBody>5d41402abc4b2a76b9719d911017c592</MD5OfBody>"));
        assert!(xml.contains(
            "<Attribute><Name>ApproximateReceiveCount</Name><Value>2</Value></Attribute>"
        ));
        assert!(xml.ends_with(
            "<ResponseMetadata><RequestId>req-1</RequestId></ResponseMetadata></ReceiveMessageResponse>"
        ));
    }

    #[test]
    fn test_render_done_has_no_result() {
        let xml = render("DeleteMessage", &SqsOutput::Done, "req-2");
        assert!(!xml.contains("DeleteMessageResult"));
        assert!(xml.contains("<RequestId>req-2</RequestId>"));
    }

    #[test]
    fn test_body_is_escaped() {
        let xml = render(
            "ReceiveMessage",
            &SqsOutput::Messages(vec![ReceivedMessage {
                message_id: "m".to_string(),
                receipt_handle: "r".to_string(),
                md5_of_body: String::new(),
                body: "<a & b>".to_string(),
                sent_at_ms: 0,
                receive_count: 1,
                message_group_id: Some("g".to_string()),
            }]),
            "req",
        );
        assert!(xml.contains("<Body>&lt;a &amp; b&gt;</Body>"));
        assert!(xml.contains("<Name>MessageGroupId</Name><Value>g</Value>"));
    }
}
