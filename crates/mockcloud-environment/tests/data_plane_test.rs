// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests of the emulated cloud APIs through the gateway router.

mod common;

use std::io::{Cursor, Write};
use std::time::Duration;

use axum::body::Body;
use axum::http::Request;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use common::{ONE_CREDIT, TestContext, xml_text};
use mockcloud_environment::gateway::ENVIRONMENT_HEADER;
use mockcloud_environment::runner::MockRuntime;
use serde_json::json;

const DYNAMODB: &str = "/aws/dynamodb";

fn target(op: &str) -> String {
    format!("DynamoDB_20120810.{op}")
}

async fn create_table(ctx: &TestContext, env_id: &str, name: &str) {
    let response = ctx
        .aws_json(
            DYNAMODB,
            env_id,
            &target("CreateTable"),
            json!({
                "TableName": name,
                "KeySchema": [{"AttributeName": "pk", "KeyType": "HASH"}],
                "AttributeDefinitions": [{"AttributeName": "pk", "AttributeType": "S"}],
            }),
        )
        .await;
    assert_eq!(response.status, 200, "{}", response.text());
}

#[tokio::test]
async fn test_dynamodb_put_get_bills_one_write() {
    let ctx = TestContext::new().await;
    ctx.fund("alice", ONE_CREDIT).await;
    let env = ctx.environment("alice", &["aws_dynamodb"]).await;

    let created = ctx
        .aws_json(
            DYNAMODB,
            &env.id,
            &target("CreateTable"),
            json!({
                "TableName": "orders",
                "KeySchema": [{"AttributeName": "id", "KeyType": "HASH"}],
                "AttributeDefinitions": [{"AttributeName": "id", "AttributeType": "S"}],
            }),
        )
        .await;
    assert_eq!(created.status, 200, "{}", created.text());
    let description = &created.json()["TableDescription"];
    assert_eq!(description["TableStatus"], "ACTIVE");
    assert_eq!(description["ItemCount"], 0);
    // Table metadata alone starts nothing.
    assert_eq!(ctx.runtime.count("run").await, 0);

    let item = json!({
        "id": {"S": "o-1"},
        "total": {"N": "42"},
        "blob": {"B": "AAEC"},
    });

    let put = ctx
        .aws_json(
            DYNAMODB,
            &env.id,
            &target("PutItem"),
            json!({"TableName": "orders", "Item": item}),
        )
        .await;
    assert_eq!(put.status, 200, "{}", put.text());
    assert_eq!(
        put.headers["content-type"],
        "application/x-amz-json-1.0"
    );
    assert_eq!(ctx.runtime.count("run").await, 1);

    let get = ctx
        .aws_json(
            DYNAMODB,
            &env.id,
            &target("GetItem"),
            json!({"TableName": "orders", "Key": {"id": {"S": "o-1"}}}),
        )
        .await;
    assert_eq!(get.status, 200);
    assert_eq!(get.json()["Item"], item);

    let events = ctx.persistence.list_billing_events(&env.id).await.unwrap();
    let writes: Vec<_> = events.iter().filter(|e| e.operation == "PutItem").collect();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].service, "dynamodb");
    assert_eq!(writes[0].units, 1);
    assert_eq!(writes[0].status, "applied");

    let balance = ctx.state.billing.balance("alice").await.unwrap();
    let spent: i64 = events.iter().map(|e| e.cost_nanocredits).sum();
    assert_eq!(balance, ONE_CREDIT - spent);

    let deleted = ctx
        .aws_json(
            DYNAMODB,
            &env.id,
            &target("DeleteItem"),
            json!({"TableName": "orders", "Key": {"id": {"S": "o-1"}}}),
        )
        .await;
    assert_eq!(deleted.status, 200);
    let gone = ctx
        .aws_json(
            DYNAMODB,
            &env.id,
            &target("GetItem"),
            json!({"TableName": "orders", "Key": {"id": {"S": "o-1"}}}),
        )
        .await;
    assert_eq!(gone.status, 200);
    assert!(gone.json().get("Item").is_none());
}

#[tokio::test]
async fn test_dynamodb_query_and_scan_page_with_start_key() {
    let ctx = TestContext::new().await;
    ctx.fund("alice", ONE_CREDIT).await;
    let env = ctx.environment("alice", &["aws_dynamodb"]).await;

    let created = ctx
        .aws_json(
            DYNAMODB,
            &env.id,
            &target("CreateTable"),
            json!({
                "TableName": "events",
                "KeySchema": [
                    {"AttributeName": "pk", "KeyType": "HASH"},
                    {"AttributeName": "sk", "KeyType": "RANGE"},
                ],
                "AttributeDefinitions": [
                    {"AttributeName": "pk", "AttributeType": "S"},
                    {"AttributeName": "sk", "AttributeType": "N"},
                ],
            }),
        )
        .await;
    assert_eq!(created.status, 200, "{}", created.text());
    for sk in ["1", "2", "3"] {
        let put = ctx
            .aws_json(
                DYNAMODB,
                &env.id,
                &target("PutItem"),
                json!({"TableName": "events", "Item": {"pk": {"S": "u"}, "sk": {"N": sk}}}),
            )
            .await;
        assert_eq!(put.status, 200, "{}", put.text());
    }

    let query = |start: Option<serde_json::Value>| {
        let mut body = json!({
            "TableName": "events",
            "KeyConditionExpression": "pk = :pk",
            "ExpressionAttributeValues": {":pk": {"S": "u"}},
            "Limit": 2,
        });
        if let Some(start) = start {
            body["ExclusiveStartKey"] = start;
        }
        body
    };

    let first = ctx
        .aws_json(DYNAMODB, &env.id, &target("Query"), query(None))
        .await
        .json();
    assert_eq!(first["Count"], 2);
    assert_eq!(first["Items"][0]["sk"]["N"], "1");
    assert_eq!(first["Items"][1]["sk"]["N"], "2");
    let start = first["LastEvaluatedKey"].clone();
    assert_eq!(start, json!({"pk": {"S": "u"}, "sk": {"N": "2"}}));

    let second = ctx
        .aws_json(DYNAMODB, &env.id, &target("Query"), query(Some(start.clone())))
        .await
        .json();
    assert_eq!(second["Count"], 1);
    assert_eq!(second["Items"][0]["sk"]["N"], "3");
    assert!(second.get("LastEvaluatedKey").is_none());

    let scanned = ctx
        .aws_json(
            DYNAMODB,
            &env.id,
            &target("Scan"),
            json!({"TableName": "events", "Limit": 2, "ExclusiveStartKey": start}),
        )
        .await
        .json();
    assert_eq!(scanned["Count"], 1);
    assert_eq!(scanned["Items"][0]["sk"]["N"], "3");

    let bad_start = ctx
        .aws_json(
            DYNAMODB,
            &env.id,
            &target("Scan"),
            json!({"TableName": "events", "ExclusiveStartKey": {"other": {"S": "x"}}}),
        )
        .await;
    assert_eq!(bad_start.status, 400);
    assert!(bad_start.text().contains("ValidationException"));
}

#[tokio::test]
async fn test_dynamodb_add_overflow_is_rejected() {
    let ctx = TestContext::new().await;
    ctx.fund("alice", ONE_CREDIT).await;
    let env = ctx.environment("alice", &["aws_dynamodb"]).await;
    create_table(&ctx, &env.id, "counters").await;

    let nines = "9".repeat(38);
    let put = ctx
        .aws_json(
            DYNAMODB,
            &env.id,
            &target("PutItem"),
            json!({"TableName": "counters", "Item": {"pk": {"S": "c"}, "n": {"N": nines}}}),
        )
        .await;
    assert_eq!(put.status, 200, "{}", put.text());

    let update = ctx
        .aws_json(
            DYNAMODB,
            &env.id,
            &target("UpdateItem"),
            json!({
                "TableName": "counters",
                "Key": {"pk": {"S": "c"}},
                "UpdateExpression": "ADD n :v",
                "ExpressionAttributeValues": {":v": {"N": nines}},
            }),
        )
        .await;
    assert_eq!(update.status, 400);
    assert!(update.text().contains("Number overflow"), "{}", update.text());

    let get = ctx
        .aws_json(
            DYNAMODB,
            &env.id,
            &target("GetItem"),
            json!({"TableName": "counters", "Key": {"pk": {"S": "c"}}}),
        )
        .await;
    assert_eq!(get.json()["Item"]["n"]["N"], nines);
}

#[tokio::test]
async fn test_dynamodb_errors() {
    let ctx = TestContext::new().await;
    ctx.fund("alice", ONE_CREDIT).await;
    let env = ctx.environment("alice", &["aws_dynamodb"]).await;
    create_table(&ctx, &env.id, "orders").await;

    let duplicate = ctx
        .aws_json(
            DYNAMODB,
            &env.id,
            &target("CreateTable"),
            json!({
                "TableName": "orders",
                "KeySchema": [{"AttributeName": "pk", "KeyType": "HASH"}],
                "AttributeDefinitions": [{"AttributeName": "pk", "AttributeType": "S"}],
            }),
        )
        .await;
    assert_eq!(duplicate.status, 400);
    assert!(
        duplicate.json()["__type"]
            .as_str()
            .unwrap()
            .ends_with("#ResourceInUseException")
    );

    let missing = ctx
        .aws_json(
            DYNAMODB,
            &env.id,
            &target("GetItem"),
            json!({"TableName": "nope", "Key": {"pk": {"S": "a"}}}),
        )
        .await;
    assert_eq!(missing.status, 400);
    assert!(
        missing.json()["__type"]
            .as_str()
            .unwrap()
            .ends_with("#ResourceNotFoundException")
    );

    let unknown = ctx
        .aws_json(DYNAMODB, &env.id, &target("Frobnicate"), json!({}))
        .await;
    assert_eq!(unknown.status, 400);
    assert!(
        unknown.json()["__type"]
            .as_str()
            .unwrap()
            .ends_with("#UnknownOperationException")
    );
}

#[tokio::test]
async fn test_insufficient_credit_blocks_data_plane() {
    let ctx = TestContext::new().await;
    let env = ctx.environment("alice", &["aws_dynamodb"]).await;
    create_table(&ctx, &env.id, "orders").await;

    let put = ctx
        .aws_json(
            DYNAMODB,
            &env.id,
            &target("PutItem"),
            json!({"TableName": "orders", "Item": {"pk": {"S": "o-1"}}}),
        )
        .await;
    assert_eq!(put.status, 402, "{}", put.text());

    // Nothing was materialized, stored or billed.
    assert_eq!(ctx.runtime.count("run").await, 0);
    assert!(
        ctx.persistence
            .list_billing_events(&env.id)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_concurrent_first_writes_materialize_once() {
    let mut runtime = MockRuntime::new();
    runtime.run_delay = Duration::from_millis(50);
    let ctx = TestContext::with_runtime(runtime).await;
    ctx.fund("alice", ONE_CREDIT).await;
    let env = ctx.environment("alice", &["aws_dynamodb"]).await;
    create_table(&ctx, &env.id, "a").await;
    create_table(&ctx, &env.id, "b").await;

    let put_item = target("PutItem");
    let writes = (0..6).map(|i| {
        let table = if i % 2 == 0 { "a" } else { "b" };
        ctx.aws_json(
            DYNAMODB,
            &env.id,
            &put_item,
            json!({"TableName": table, "Item": {"pk": {"S": format!("k{i}")}}}),
        )
    });
    let responses = futures::future::join_all(writes).await;
    assert!(responses.iter().all(|r| r.status == 200));

    // Both tables share the environment's DynamoDB container.
    assert_eq!(ctx.runtime.count("run").await, 1);
    let handles = ctx.persistence.list_backing_handles(&env.id).await.unwrap();
    assert_eq!(handles.len(), 1);
    assert_eq!(handles[0].state, "live");
}

#[tokio::test]
async fn test_sqs_send_receive_delete() {
    let ctx = TestContext::new().await;
    ctx.fund("alice", ONE_CREDIT).await;
    let env = ctx.environment("alice", &["aws_sqs"]).await;

    let created = ctx
        .query("/aws/sqs", &env.id, &[("Action", "CreateQueue"), ("QueueName", "jobs")])
        .await;
    assert_eq!(created.status, 200, "{}", created.text());
    let body = created.text();
    let url = xml_text(&body, "QueueUrl").unwrap().to_string();
    assert!(url.ends_with("/123456789012/jobs"));

    let sent = ctx
        .query(
            "/aws/sqs",
            &env.id,
            &[("Action", "SendMessage"), ("QueueUrl", &url), ("MessageBody", "hello")],
        )
        .await;
    assert_eq!(sent.status, 200, "{}", sent.text());
    assert_eq!(
        xml_text(&sent.text(), "MD5OfMessageBody"),
        Some("5d41402abc4b2a76b9719d911017c592")
    );
    assert_eq!(ctx.runtime.count("run").await, 1);

    let received = ctx
        .query(
            "/aws/sqs",
            &env.id,
            &[("Action", "ReceiveMessage"), ("QueueUrl", &url)],
        )
        .await;
    let body = received.text();
    assert_eq!(xml_text(&body, "Body"), Some("hello"));
    let receipt = xml_text(&body, "ReceiptHandle").unwrap().to_string();

    // Invisible while the first receipt is outstanding.
    let empty = ctx
        .query(
            "/aws/sqs",
            &env.id,
            &[("Action", "ReceiveMessage"), ("QueueUrl", &url)],
        )
        .await;
    assert!(xml_text(&empty.text(), "Body").is_none());

    let deleted = ctx
        .query(
            "/aws/sqs",
            &env.id,
            &[
                ("Action", "DeleteMessage"),
                ("QueueUrl", &url),
                ("ReceiptHandle", &receipt),
            ],
        )
        .await;
    assert_eq!(deleted.status, 200);
    assert!(!deleted.text().contains("<DeleteMessageResult>"));

    // A stale receipt handle is accepted and does nothing.
    let stale = ctx
        .query(
            "/aws/sqs",
            &env.id,
            &[
                ("Action", "DeleteMessage"),
                ("QueueUrl", &url),
                ("ReceiptHandle", &receipt),
            ],
        )
        .await;
    assert_eq!(stale.status, 200);
}

#[tokio::test]
async fn test_sqs_redelivery_after_visibility_timeout() {
    let ctx = TestContext::new().await;
    ctx.fund("alice", ONE_CREDIT).await;
    let env = ctx.environment("alice", &["aws_sqs"]).await;
    ctx.query("/aws/sqs", &env.id, &[("Action", "CreateQueue"), ("QueueName", "jobs")])
        .await;
    let url = "https://sqs.us-east-1.amazonaws.com/123456789012/jobs";
    ctx.query(
        "/aws/sqs",
        &env.id,
        &[("Action", "SendMessage"), ("QueueUrl", url), ("MessageBody", "again")],
    )
    .await;

    let receive_form = [
        ("Action", "ReceiveMessage"),
        ("QueueUrl", url),
        ("VisibilityTimeout", "0"),
        ("AttributeName.1", "All"),
    ];
    let receive = || ctx.query("/aws/sqs", &env.id, &receive_form);
    let first = receive().await.text();
    let second = receive().await.text();
    assert_eq!(xml_text(&first, "Body"), Some("again"));
    assert_eq!(xml_text(&second, "Body"), Some("again"));
    assert_ne!(
        xml_text(&first, "ReceiptHandle"),
        xml_text(&second, "ReceiptHandle")
    );
    assert!(second.contains("<Name>ApproximateReceiveCount</Name><Value>2</Value>"));
}

#[tokio::test]
async fn test_sqs_get_query_string() {
    let ctx = TestContext::new().await;
    let env = ctx.environment("alice", &["aws_sqs"]).await;
    let response = ctx
        .send(
            Request::get("/aws/sqs?Action=ListQueues")
                .header(ENVIRONMENT_HEADER, &env.id)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status, 200);
    assert!(response.text().contains("<ListQueuesResponse"));

    let unknown = ctx
        .query("/aws/sqs", &env.id, &[("Action", "Frobnicate")])
        .await;
    assert_eq!(unknown.status, 400);
    assert!(unknown.text().contains("<Code>InvalidAction</Code>"));
}

#[tokio::test]
async fn test_ec2_wiring_materializes_network() {
    let ctx = TestContext::new().await;
    ctx.fund("alice", ONE_CREDIT).await;
    let env = ctx.environment("alice", &["aws_vpc"]).await;
    let declared = ctx.network.live("vcn").await;

    let vpc = ctx
        .query(
            "/aws/ec2",
            &env.id,
            &[("Action", "CreateVpc"), ("CidrBlock", "10.1.0.0/16")],
        )
        .await;
    assert_eq!(vpc.status, 200, "{}", vpc.text());
    let body = vpc.text();
    assert!(body.contains("<CreateVpcResponse"));
    let vpc_id = xml_text(&body, "vpcId").unwrap().to_string();
    assert!(vpc_id.starts_with("vpc-"));
    // Metadata only.
    assert_eq!(ctx.network.live("vcn").await, declared);

    let subnet = ctx
        .query(
            "/aws/ec2",
            &env.id,
            &[
                ("Action", "CreateSubnet"),
                ("VpcId", &vpc_id),
                ("CidrBlock", "10.1.1.0/24"),
            ],
        )
        .await;
    assert_eq!(subnet.status, 200, "{}", subnet.text());
    assert_eq!(ctx.network.live("vcn").await, declared + 1);
    assert_eq!(ctx.network.live("subnet").await, 1);

    let events = ctx.persistence.list_billing_events(&env.id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].operation, "CreateSubnet");

    // Destroy tears down children before their VCN.
    ctx.state.provisioner.destroy(&env.id).await.unwrap();
    assert_eq!(ctx.network.live("subnet").await, 0);
    assert_eq!(ctx.network.live("vcn").await, 0);
}

#[tokio::test]
async fn test_ec2_errors_are_query_shaped() {
    let ctx = TestContext::new().await;
    let env = ctx.environment("alice", &["aws_vpc"]).await;

    let missing = ctx
        .query(
            "/aws/ec2",
            &env.id,
            &[("Action", "DeleteVpc"), ("VpcId", "vpc-00000000")],
        )
        .await;
    assert_eq!(missing.status, 400);
    assert!(missing.text().contains("<Code>InvalidVpcID.NotFound</Code>"));

    // The root path only accepts EC2 actions.
    let root = ctx
        .query("/", &env.id, &[("Action", "SendMessage")])
        .await;
    assert_eq!(root.status, 400);
    assert!(root.text().contains("InvalidAction"));
}

#[tokio::test]
async fn test_ec2_instance_lifecycle() {
    let ctx = TestContext::new().await;
    ctx.fund("alice", ONE_CREDIT).await;
    let env = ctx.environment("alice", &["aws_vpc"]).await;

    let vpc = ctx
        .query(
            "/aws/ec2",
            &env.id,
            &[("Action", "CreateVpc"), ("CidrBlock", "10.2.0.0/16")],
        )
        .await;
    let vpc_id = xml_text(&vpc.text(), "vpcId").unwrap().to_string();
    let subnet = ctx
        .query(
            "/aws/ec2",
            &env.id,
            &[
                ("Action", "CreateSubnet"),
                ("VpcId", &vpc_id),
                ("CidrBlock", "10.2.3.0/24"),
            ],
        )
        .await;
    let subnet_id = xml_text(&subnet.text(), "subnetId").unwrap().to_string();

    let run = ctx
        .query(
            "/aws/ec2",
            &env.id,
            &[
                ("Action", "RunInstances"),
                ("MinCount", "2"),
                ("MaxCount", "2"),
                ("SubnetId", &subnet_id),
            ],
        )
        .await;
    assert_eq!(run.status, 200, "{}", run.text());
    let body = run.text();
    assert_eq!(body.matches("<instanceId>").count(), 2);
    assert!(body.contains("<instanceType>t2.micro</instanceType>"));
    assert!(body.contains("<privateIpAddress>10.2.3."));
    assert!(body.contains(&format!("<vpcId>{vpc_id}</vpcId>")));
    let instance_id = xml_text(&body, "instanceId").unwrap().to_string();
    assert!(instance_id.starts_with("i-"));

    let events = ctx.persistence.list_billing_events(&env.id).await.unwrap();
    let launch = events
        .iter()
        .find(|e| e.operation == "RunInstances")
        .unwrap();
    assert_eq!(launch.units, 2);

    let stop = ctx
        .query(
            "/aws/ec2",
            &env.id,
            &[("Action", "StopInstances"), ("InstanceId.1", &instance_id)],
        )
        .await;
    assert_eq!(stop.status, 200, "{}", stop.text());
    assert!(stop.text().contains(
        "<currentState><code>80</code><name>stopped</name></currentState><previousState><code>16</code><name>running</name></previousState>"
    ));

    let described = ctx
        .query(
            "/aws/ec2",
            &env.id,
            &[("Action", "DescribeInstances"), ("InstanceId.1", &instance_id)],
        )
        .await;
    let body = described.text();
    assert!(body.contains("<reservationSet><item><reservationId>r-"));
    assert!(body.contains("<name>stopped</name>"));
    assert_eq!(body.matches("<instanceId>").count(), 1);

    let start = ctx
        .query(
            "/aws/ec2",
            &env.id,
            &[("Action", "StartInstances"), ("InstanceId.1", &instance_id)],
        )
        .await;
    assert!(start.text().contains("<currentState><code>16</code><name>running</name>"));

    // Running instances keep their subnet.
    let blocked = ctx
        .query(
            "/aws/ec2",
            &env.id,
            &[("Action", "DeleteSubnet"), ("SubnetId", &subnet_id)],
        )
        .await;
    assert_eq!(blocked.status, 400);
    assert!(blocked.text().contains("<Code>DependencyViolation</Code>"));

    let all = ctx
        .query("/aws/ec2", &env.id, &[("Action", "DescribeInstances")])
        .await;
    let ids: Vec<String> = all
        .text()
        .split("<instanceId>")
        .skip(1)
        .filter_map(|rest| rest.split('<').next().map(str::to_string))
        .collect();
    assert_eq!(ids.len(), 2);
    let mut terminate = vec![("Action", "TerminateInstances")];
    let keys = ["InstanceId.1", "InstanceId.2"];
    for (key, id) in keys.iter().zip(&ids) {
        terminate.push((*key, id.as_str()));
    }
    let terminated = ctx.query("/aws/ec2", &env.id, &terminate).await;
    assert_eq!(terminated.status, 200, "{}", terminated.text());
    assert_eq!(terminated.text().matches("<name>terminated</name>").count(), 2);

    // Terminating twice is harmless; restarting is not.
    let again = ctx.query("/aws/ec2", &env.id, &terminate).await;
    assert_eq!(again.status, 200);
    let restart = ctx
        .query(
            "/aws/ec2",
            &env.id,
            &[("Action", "StartInstances"), ("InstanceId.1", &instance_id)],
        )
        .await;
    assert_eq!(restart.status, 400);
    assert!(restart.text().contains("<Code>IncorrectInstanceState</Code>"));

    let deleted = ctx
        .query(
            "/aws/ec2",
            &env.id,
            &[("Action", "DeleteSubnet"), ("SubnetId", &subnet_id)],
        )
        .await;
    assert_eq!(deleted.status, 200, "{}", deleted.text());

    let unknown = ctx
        .query(
            "/aws/ec2",
            &env.id,
            &[("Action", "StopInstances"), ("InstanceId.1", "i-00000000000000000")],
        )
        .await;
    assert_eq!(unknown.status, 400);
    assert!(unknown.text().contains("<Code>InvalidInstanceID.NotFound</Code>"));
}

fn package(files: &[(&str, &str)]) -> String {
    let mut buffer = Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut buffer);
        let options = zip::write::SimpleFileOptions::default();
        for (name, content) in files {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }
    BASE64.encode(buffer.into_inner())
}

#[tokio::test]
async fn test_lambda_invoke_reuses_warm_container() {
    let ctx = TestContext::new().await;
    ctx.fund("alice", ONE_CREDIT).await;
    let env = ctx.environment("alice", &["aws_lambda"]).await;

    let created = ctx
        .aws_json(
            "/aws/lambda",
            &env.id,
            "AWSLambda.CreateFunction20150331",
            json!({
                "FunctionName": "echo",
                "Code": {"ZipFile": package(&[("index.py", "def handler(e, c): return e")])},
            }),
        )
        .await;
    assert_eq!(created.status, 201, "{}", created.text());
    assert_eq!(created.json()["Runtime"], "python3.11");
    assert_eq!(ctx.runtime.count("run").await, 0);

    for _ in 0..2 {
        let invoked = ctx
            .send(
                Request::post("/2015-03-31/functions/echo/invocations")
                    .header(ENVIRONMENT_HEADER, &env.id)
                    .body(Body::from(r#"{"n":1}"#))
                    .unwrap(),
            )
            .await;
        assert_eq!(invoked.status, 200, "{}", invoked.text());
        assert_eq!(invoked.text(), r#"{"ok":true}"#);
        assert_eq!(invoked.headers["x-amz-executed-version"], "$LATEST");
        assert!(invoked.headers.get("x-amz-function-error").is_none());
    }

    assert_eq!(ctx.runtime.count("run").await, 1);
    assert_eq!(ctx.transport.count().await, 2);
    let (endpoint, payload) = ctx.transport.invocations.lock().await[0].clone();
    assert!(endpoint.starts_with("http://127.0.0.1:"));
    assert_eq!(payload, br#"{"n":1}"#);

    let events = ctx.persistence.list_billing_events(&env.id).await.unwrap();
    assert_eq!(events.iter().filter(|e| e.service == "lambda").count(), 2);
}

#[tokio::test]
async fn test_lambda_unknown_function() {
    let ctx = TestContext::new().await;
    ctx.fund("alice", ONE_CREDIT).await;
    let env = ctx.environment("alice", &["aws_lambda"]).await;
    let response = ctx
        .send(
            Request::post("/2015-03-31/functions/ghost/invocations")
                .header(ENVIRONMENT_HEADER, &env.id)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status, 404);
    assert_eq!(response.json()["__type"], "ResourceNotFoundException");
}

#[tokio::test]
async fn test_environment_resolution() {
    let ctx = TestContext::new().await;
    let env = ctx.environment("alice", &["aws_sqs"]).await;

    let missing = ctx
        .send(
            Request::post("/aws/sqs")
                .body(Body::from("Action=ListQueues"))
                .unwrap(),
        )
        .await;
    assert_eq!(missing.status, 400);
    assert!(missing.text().contains("MissingEnvironment"));

    // The Host subdomain names the environment.
    let by_host = ctx
        .send(
            Request::post("/aws/sqs")
                .header("host", format!("{}.mockcloud.local", env.id))
                .body(Body::from("Action=ListQueues"))
                .unwrap(),
        )
        .await;
    assert_eq!(by_host.status, 200, "{}", by_host.text());

    ctx.state.provisioner.stop(&env.id).await.unwrap();
    let stopped = ctx
        .query("/aws/sqs", &env.id, &[("Action", "ListQueues")])
        .await;
    assert_eq!(stopped.status, 404);
    assert!(stopped.text().contains("InvalidEnvironment"));
}

#[tokio::test]
async fn test_health() {
    let ctx = TestContext::new().await;
    let response = ctx
        .send(Request::get("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.json()["status"], "ok");
}

async fn s3(
    ctx: &TestContext,
    method: &str,
    path: &str,
    env_id: &str,
    body: &str,
) -> common::TestResponse {
    ctx.send(
        Request::builder()
            .method(method)
            .uri(format!("/aws/s3{path}"))
            .header(ENVIRONMENT_HEADER, env_id)
            .header("content-type", "text/plain")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
}

#[tokio::test]
async fn test_s3_bucket_and_object_lifecycle() {
    let ctx = TestContext::new().await;
    ctx.fund("alice", ONE_CREDIT).await;
    let env = ctx.environment("alice", &["aws_s3"]).await;

    let created = s3(&ctx, "PUT", "/assets", &env.id, "").await;
    assert_eq!(created.status, 200, "{}", created.text());
    assert_eq!(created.headers["location"], "/assets");
    assert!(created.headers.contains_key("x-amz-request-id"));
    let duplicate = s3(&ctx, "PUT", "/assets", &env.id, "").await;
    assert_eq!(duplicate.status, 409);
    assert_eq!(xml_text(&duplicate.text(), "Code"), Some("BucketAlreadyExists"));
    let invalid = s3(&ctx, "PUT", "/Bad_Name", &env.id, "").await;
    assert_eq!(invalid.status, 400);
    assert_eq!(xml_text(&invalid.text(), "Code"), Some("InvalidBucketName"));

    // Storage stays cold until the first object arrives.
    assert_eq!(ctx.runtime.count("run").await, 0);
    let put = s3(&ctx, "PUT", "/assets/hello.txt", &env.id, "hello world").await;
    assert_eq!(put.status, 200, "{}", put.text());
    assert_eq!(put.headers["etag"], "\"5eb63bbbe01eeed093cb22bb8f5acdc3\"");
    assert_eq!(ctx.runtime.count("run").await, 1);
    let handles = ctx.persistence.list_backing_handles(&env.id).await.unwrap();
    assert_eq!(handles[0].name, "minio");

    let get = s3(&ctx, "GET", "/assets/hello.txt", &env.id, "").await;
    assert_eq!(get.status, 200);
    assert_eq!(get.text(), "hello world");
    assert_eq!(get.headers["content-type"], "text/plain");
    assert_eq!(get.headers["etag"], "\"5eb63bbbe01eeed093cb22bb8f5acdc3\"");
    assert!(get.headers.contains_key("last-modified"));

    let head = s3(&ctx, "HEAD", "/assets/hello.txt", &env.id, "").await;
    assert_eq!(head.status, 200);
    assert_eq!(head.headers["content-length"], "11");
    assert!(head.body.is_empty());

    let missing_key = s3(&ctx, "GET", "/assets/nope.txt", &env.id, "").await;
    assert_eq!(missing_key.status, 404);
    assert_eq!(xml_text(&missing_key.text(), "Code"), Some("NoSuchKey"));
    let missing_bucket = s3(&ctx, "GET", "/other/hello.txt", &env.id, "").await;
    assert_eq!(missing_bucket.status, 404);
    assert_eq!(xml_text(&missing_bucket.text(), "Code"), Some("NoSuchBucket"));

    let not_empty = s3(&ctx, "DELETE", "/assets", &env.id, "").await;
    assert_eq!(not_empty.status, 409);
    assert_eq!(xml_text(&not_empty.text(), "Code"), Some("BucketNotEmpty"));

    let events = ctx.persistence.list_billing_events(&env.id).await.unwrap();
    for operation in ["PutObject", "GetObject"] {
        assert!(
            events
                .iter()
                .any(|e| e.service == "s3" && e.operation == operation)
        );
    }

    let deleted = s3(&ctx, "DELETE", "/assets/hello.txt", &env.id, "").await;
    assert_eq!(deleted.status, 204);
    let again = s3(&ctx, "DELETE", "/assets/hello.txt", &env.id, "").await;
    assert_eq!(again.status, 204);
    let dropped = s3(&ctx, "DELETE", "/assets", &env.id, "").await;
    assert_eq!(dropped.status, 204);

    let buckets = s3(&ctx, "GET", "", &env.id, "").await;
    assert_eq!(buckets.status, 200);
    assert!(!buckets.text().contains("<Name>assets</Name>"));
}

#[tokio::test]
async fn test_s3_listing_pages_and_prefixes() {
    let ctx = TestContext::new().await;
    ctx.fund("alice", ONE_CREDIT).await;
    let env = ctx.environment("alice", &["aws_s3"]).await;
    s3(&ctx, "PUT", "/logs", &env.id, "").await;
    for key in ["logs/a.txt", "logs/b.txt", "logs/2024/c.txt", "readme"] {
        let put = s3(&ctx, "PUT", &format!("/logs/{key}"), &env.id, key).await;
        assert_eq!(put.status, 200);
    }

    let buckets = s3(&ctx, "GET", "/", &env.id, "").await;
    assert!(buckets.text().contains("<Bucket><Name>logs</Name>"));

    let first = s3(
        &ctx,
        "GET",
        "/logs?prefix=logs/&delimiter=/&max-keys=2",
        &env.id,
        "",
    )
    .await;
    assert_eq!(first.status, 200, "{}", first.text());
    let body = first.text();
    assert_eq!(xml_text(&body, "IsTruncated"), Some("true"));
    assert!(body.contains("<CommonPrefixes><Prefix>logs/2024/</Prefix></CommonPrefixes>"));
    assert!(body.contains("<Key>logs/a.txt</Key>"));
    assert!(!body.contains("readme"));
    let marker = xml_text(&body, "NextMarker").unwrap().to_string();

    let second = s3(
        &ctx,
        "GET",
        &format!("/logs?prefix=logs/&delimiter=/&max-keys=2&marker={marker}"),
        &env.id,
        "",
    )
    .await;
    let body = second.text();
    assert_eq!(xml_text(&body, "IsTruncated"), Some("false"));
    assert!(body.contains("<Key>logs/b.txt</Key>"));
    assert!(!body.contains("<Key>logs/a.txt</Key>"));
    assert!(!body.contains("logs/2024/"));

    let v2 = s3(&ctx, "GET", "/logs?list-type=2&max-keys=3", &env.id, "").await;
    let body = v2.text();
    assert_eq!(xml_text(&body, "KeyCount"), Some("3"));
    assert_eq!(xml_text(&body, "IsTruncated"), Some("true"));
    let token = xml_text(&body, "NextContinuationToken").unwrap().to_string();
    let rest = s3(
        &ctx,
        "GET",
        &format!("/logs?list-type=2&continuation-token={token}"),
        &env.id,
        "",
    )
    .await;
    let body = rest.text();
    assert_eq!(xml_text(&body, "KeyCount"), Some("1"));
    assert!(body.contains("<Key>readme</Key>"));

    let query = "/logs?list-type=2&continuation-token=zz";
    let bad = s3(&ctx, "GET", query, &env.id, "").await;
    assert_eq!(bad.status, 400);
    assert_eq!(xml_text(&bad.text(), "Code"), Some("InvalidArgument"));
}
