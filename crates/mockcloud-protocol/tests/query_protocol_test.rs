// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Query protocol decoding tests for mockcloud-protocol.

use mockcloud_protocol::QueryParams;
use mockcloud_protocol::ec2::{Ec2Action, is_ec2_action};
use mockcloud_protocol::sqs::{SqsAction, body_md5};

#[test]
fn test_query_string_and_body_are_merged() {
    let body = QueryParams::parse(b"Action=SendMessage&MessageBody=%7B%22a%22%3A1%7D");
    let query = QueryParams::parse(b"QueueUrl=https%3A%2F%2Fsqs.us-east-1.amazonaws.com%2F123456789012%2Fjobs");
    let action = SqsAction::decode(&body.merge(query)).unwrap();
    match action {
        SqsAction::SendMessage {
            queue_name,
            message,
        } => {
            assert_eq!(queue_name, "jobs");
            assert_eq!(message.body, r#"{"a":1}"#);
            assert_eq!(body_md5(&message.body).len(), 32);
        }
        other => panic!("unexpected action: {other:?}"),
    }
}

#[test]
fn test_ec2_and_sqs_actions_are_disjoint() {
    for action in ["CreateQueue", "SendMessage", "PurgeQueue"] {
        assert!(!is_ec2_action(action), "{action}");
    }
    let params = QueryParams::parse(b"Action=DescribeVpcs&VpcId.1=vpc-a&VpcId.2=vpc-b");
    assert!(is_ec2_action(params.action().unwrap()));
    assert_eq!(
        Ec2Action::decode(&params).unwrap(),
        Ec2Action::DescribeVpcs {
            vpc_ids: vec!["vpc-a".into(), "vpc-b".into()]
        }
    );
}

#[test]
fn test_create_queue_with_attributes() {
    let params = QueryParams::parse(
        b"Action=CreateQueue&QueueName=events.fifo&Attribute.1.Name=FifoQueue&Attribute.1.Value=true",
    );
    let SqsAction::CreateQueue {
        queue_name,
        attributes,
    } = SqsAction::decode(&params).unwrap()
    else {
        panic!("unexpected action");
    };
    assert_eq!(queue_name, "events.fifo");
    assert_eq!(attributes.get("FifoQueue").map(String::as_str), Some("true"));
}

#[test]
fn test_missing_action() {
    let params = QueryParams::parse(b"QueueName=x");
    assert!(SqsAction::decode(&params).is_err());
    assert!(Ec2Action::decode(&params).is_err());
}
