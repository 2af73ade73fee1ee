// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Billing reconciliation tests.

mod common;

use chrono::Utc;
use common::{ONE_CREDIT, TestContext};
use mockcloud_environment::billing_worker::{BillingWorker, BillingWorkerConfig};
use serde_json::json;

/// Create a table and write one item while the balance covers only a
/// single nanocredit, leaving the write charge short of credit.
async fn underfunded_write(ctx: &TestContext) -> String {
    ctx.fund("alice", 1).await;
    let env = ctx.environment("alice", &["aws_dynamodb"]).await;
    ctx.aws_json(
        "/aws/dynamodb",
        &env.id,
        "DynamoDB_20120810.CreateTable",
        json!({
            "TableName": "t",
            "KeySchema": [{"AttributeName": "pk", "KeyType": "HASH"}],
            "AttributeDefinitions": [{"AttributeName": "pk", "AttributeType": "S"}],
        }),
    )
    .await;
    let put = ctx
        .aws_json(
            "/aws/dynamodb",
            &env.id,
            "DynamoDB_20120810.PutItem",
            json!({"TableName": "t", "Item": {"pk": {"S": "a"}}}),
        )
        .await;
    // The write itself succeeds; only the debit falls short.
    assert_eq!(put.status, 200, "{}", put.text());
    env.id
}

fn worker(ctx: &TestContext, config: BillingWorkerConfig) -> BillingWorker {
    BillingWorker::new(ctx.persistence.clone(), ctx.state.billing.clone(), config)
}

#[tokio::test]
async fn test_reconcile_settles_short_charges_after_top_up() {
    let ctx = TestContext::new().await;
    let env_id = underfunded_write(&ctx).await;

    let events = ctx.persistence.list_billing_events(&env_id).await.unwrap();
    let put = events.iter().find(|e| e.operation == "PutItem").unwrap();
    assert_eq!(put.status, "insufficient");
    assert_eq!(ctx.state.billing.balance("alice").await.unwrap(), 1);

    ctx.fund("alice", ONE_CREDIT).await;
    let now = Utc::now();
    let summary = worker(&ctx, BillingWorkerConfig::default())
        .reconcile_once(now)
        .await
        .unwrap();

    let alice = &summary.users["alice"];
    assert_eq!(alice.applied, 1);
    assert_eq!(alice.periods_closed, 1);

    let events = ctx.persistence.list_billing_events(&env_id).await.unwrap();
    let put = events.iter().find(|e| e.operation == "PutItem").unwrap();
    assert_eq!(put.status, "applied");
    assert!(put.reconciled_at.is_some());

    // The running environment's period was rolled over, not ended.
    let periods = ctx.persistence.list_usage_periods(&env_id).await.unwrap();
    assert_eq!(periods.len(), 2);
    assert_eq!(periods.iter().filter(|p| p.period_end.is_none()).count(), 1);
}

#[tokio::test]
async fn test_reconcile_abandons_after_retry_limit() {
    let ctx = TestContext::new().await;
    let env_id = underfunded_write(&ctx).await;

    let config = BillingWorkerConfig {
        max_attempts: 1,
        ..BillingWorkerConfig::default()
    };
    let summary = worker(&ctx, config).reconcile_once(Utc::now()).await.unwrap();
    assert_eq!(summary.users["alice"].abandoned, 1);
    assert_eq!(summary.users["alice"].applied, 0);

    let events = ctx.persistence.list_billing_events(&env_id).await.unwrap();
    let put = events.iter().find(|e| e.operation == "PutItem").unwrap();
    assert_eq!(put.status, "failed");
    assert!(put.reconciled_at.is_some());

    // Abandoned charges are not retried.
    ctx.fund("alice", ONE_CREDIT).await;
    worker(&ctx, BillingWorkerConfig::default())
        .reconcile_once(Utc::now())
        .await
        .unwrap();
    let events = ctx.persistence.list_billing_events(&env_id).await.unwrap();
    let put = events.iter().find(|e| e.operation == "PutItem").unwrap();
    assert_eq!(put.status, "failed");
}

#[tokio::test]
async fn test_reconcile_without_work() {
    let ctx = TestContext::new().await;
    let summary = worker(&ctx, BillingWorkerConfig::default())
        .reconcile_once(Utc::now())
        .await
        .unwrap();
    assert!(summary.users.is_empty());
}

#[tokio::test]
async fn test_stopped_environment_period_is_charged() {
    let ctx = TestContext::new().await;
    ctx.fund("alice", ONE_CREDIT).await;
    let env = ctx.environment("alice", &["postgresql"]).await;

    ctx.state.provisioner.stop(&env.id).await.unwrap();

    let periods = ctx.persistence.list_usage_periods(&env.id).await.unwrap();
    assert_eq!(periods.len(), 1);
    assert!(periods[0].period_end.is_some());
    assert!(periods[0].cost.unwrap_or(0.0) >= 0.0);

    let stopped = ctx.state.provisioner.get(&env.id).await.unwrap();
    assert!((stopped.total_cost - periods[0].cost.unwrap_or(0.0)).abs() < 1e-9);
}
