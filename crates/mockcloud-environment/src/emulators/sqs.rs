// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQS emulator.
//!
//! Messages are rows keyed by queue. Receiving a message is a
//! compare-and-set on its visibility deadline that also issues a fresh
//! receipt handle, so concurrent receivers never get the same delivery and
//! a superseded handle no longer matches anything.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use mockcloud_core::persistence::{
    EnvironmentRecord, SqsMessageRecord, SqsQueueRecord, SqsQueueSettings,
};
use mockcloud_protocol::sqs::{
    BatchEntry, MAX_RECEIVE_MESSAGES, MAX_WAIT_TIME_SECONDS, OutgoingMessage, SqsAction,
    body_md5, queue_arn, queue_url,
};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::{EmulatorContext, EmulatorError, Result, hex_id};
use crate::billing::sqs_cost;

const NON_EXISTENT_QUEUE: &str = "AWS.SimpleQueueService.NonExistentQueue";
const INVALID_VALUE: &str = "InvalidParameterValue";
const INVALID_ATTRIBUTE: &str = "InvalidAttributeValue";

const DEFAULT_VISIBILITY_TIMEOUT: i32 = 30;
const DEFAULT_RETENTION_SECONDS: i32 = 345_600;
const MAX_VISIBILITY_TIMEOUT: i64 = 43_200;
const MAX_DELAY_SECONDS: i64 = 900;
const MAX_BATCH_ENTRIES: usize = 10;

/// Long-poll re-check interval.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A message handed to a receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub md5_of_body: String,
    pub body: String,
    pub sent_at_ms: i64,
    pub receive_count: i32,
    pub message_group_id: Option<String>,
}

/// Result of one `SendMessageBatch` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult {
    pub id: String,
    pub message_id: String,
    pub md5_of_body: String,
}

/// Result of an SQS action, rendered by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqsOutput {
    QueueUrl(String),
    QueueUrls(Vec<String>),
    MessageSent { message_id: String, md5_of_body: String },
    BatchSent(Vec<BatchResult>),
    Messages(Vec<ReceivedMessage>),
    Attributes(BTreeMap<String, String>),
    /// Actions with an empty result element.
    Done,
}

/// Executes SQS actions for one environment.
#[derive(Clone)]
pub struct SqsEmulator {
    ctx: EmulatorContext,
}

impl SqsEmulator {
    pub fn new(ctx: EmulatorContext) -> Self {
        Self { ctx }
    }

    /// Execute a decoded action.
    pub async fn execute(&self, env: &EnvironmentRecord, action: SqsAction) -> Result<SqsOutput> {
        match action {
            SqsAction::CreateQueue {
                queue_name,
                attributes,
            } => self.create_queue(env, queue_name, attributes).await,
            SqsAction::GetQueueUrl { queue_name } => {
                let queue = self.queue(env, &queue_name).await?;
                Ok(SqsOutput::QueueUrl(queue.url))
            }
            SqsAction::ListQueues { prefix } => {
                let urls = self
                    .ctx
                    .persistence
                    .list_sqs_queues(&env.id)
                    .await?
                    .into_iter()
                    .filter(|q| prefix.as_deref().is_none_or(|p| q.name.starts_with(p)))
                    .map(|q| q.url)
                    .collect();
                Ok(SqsOutput::QueueUrls(urls))
            }
            SqsAction::DeleteQueue { queue_name } => {
                let queue = self.queue(env, &queue_name).await?;
                self.ctx.persistence.delete_sqs_queue(&queue.id).await?;
                info!(environment_id = %env.id, queue = %queue.name, "Queue deleted");
                Ok(SqsOutput::Done)
            }
            SqsAction::SendMessage {
                queue_name,
                message,
            } => {
                let queue = self.queue(env, &queue_name).await?;
                validate_message(&queue, &message)?;
                self.ctx.require_funds(env).await?;
                self.backed(env, &queue).await?;

                let (message_id, md5_of_body) = self.enqueue(&queue, message).await?;
                self.ctx
                    .charge(env, "sqs", "SendMessage", 1, sqs_cost(1))
                    .await;
                Ok(SqsOutput::MessageSent {
                    message_id,
                    md5_of_body,
                })
            }
            SqsAction::SendMessageBatch {
                queue_name,
                entries,
            } => self.send_batch(env, &queue_name, entries).await,
            SqsAction::ReceiveMessage {
                queue_name,
                max_messages,
                visibility_timeout,
                wait_time_seconds,
            } => {
                let queue = self.queue(env, &queue_name).await?;
                if let Some(timeout) = visibility_timeout {
                    validate_visibility(timeout)?;
                }
                self.ctx.require_funds(env).await?;

                let messages = self
                    .receive(&queue, max_messages, visibility_timeout, wait_time_seconds)
                    .await?;
                self.ctx
                    .charge(env, "sqs", "ReceiveMessage", 1, sqs_cost(1))
                    .await;
                Ok(SqsOutput::Messages(messages))
            }
            SqsAction::DeleteMessage {
                queue_name,
                receipt_handle,
            } => {
                let queue = self.queue(env, &queue_name).await?;
                self.ctx.require_funds(env).await?;

                // A stale or superseded handle deletes nothing and still
                // succeeds.
                let deleted = self
                    .ctx
                    .persistence
                    .delete_sqs_message(&queue.id, &receipt_handle, now_ms())
                    .await?;
                if !deleted {
                    debug!(queue = %queue.name, "Delete with stale receipt handle ignored");
                }
                self.ctx
                    .charge(env, "sqs", "DeleteMessage", 1, sqs_cost(1))
                    .await;
                Ok(SqsOutput::Done)
            }
            SqsAction::ChangeMessageVisibility {
                queue_name,
                receipt_handle,
                visibility_timeout,
            } => {
                let queue = self.queue(env, &queue_name).await?;
                validate_visibility(visibility_timeout)?;
                let now = now_ms();
                let changed = self
                    .ctx
                    .persistence
                    .change_sqs_message_visibility(
                        &queue.id,
                        &receipt_handle,
                        now,
                        now + visibility_timeout * 1000,
                    )
                    .await?;
                if !changed {
                    return Err(EmulatorError::validation(
                        "AWS.SimpleQueueService.MessageNotInflight",
                        "The message referred to is not in flight.",
                    ));
                }
                Ok(SqsOutput::Done)
            }
            SqsAction::GetQueueAttributes { queue_name, names } => {
                let queue = self.queue(env, &queue_name).await?;
                self.expire(&queue).await?;
                let counts = self
                    .ctx
                    .persistence
                    .count_sqs_messages(&queue.id, now_ms())
                    .await?;
                let mut attributes = queue_attributes(&queue);
                attributes.insert(
                    "ApproximateNumberOfMessages".into(),
                    counts.visible.to_string(),
                );
                attributes.insert(
                    "ApproximateNumberOfMessagesNotVisible".into(),
                    counts.in_flight.to_string(),
                );
                attributes.insert(
                    "ApproximateNumberOfMessagesDelayed".into(),
                    counts.delayed.to_string(),
                );
                if !names.is_empty() && !names.iter().any(|n| n == "All") {
                    attributes.retain(|k, _| names.contains(k));
                }
                Ok(SqsOutput::Attributes(attributes))
            }
            SqsAction::SetQueueAttributes {
                queue_name,
                attributes,
            } => {
                let queue = self.queue(env, &queue_name).await?;
                let current = settings_of(&queue);
                let settings = apply_attributes(current, &attributes)?;
                self.ctx
                    .persistence
                    .update_sqs_queue_settings(&queue.id, &settings)
                    .await?;
                Ok(SqsOutput::Done)
            }
            SqsAction::PurgeQueue { queue_name } => {
                let queue = self.queue(env, &queue_name).await?;
                let purged = self.ctx.persistence.purge_sqs_queue(&queue.id).await?;
                info!(queue = %queue.name, purged, "Queue purged");
                Ok(SqsOutput::Done)
            }
        }
    }

    async fn create_queue(
        &self,
        env: &EnvironmentRecord,
        queue_name: String,
        attributes: BTreeMap<String, String>,
    ) -> Result<SqsOutput> {
        validate_queue_name(&queue_name)?;
        if let Some(existing) = self
            .ctx
            .persistence
            .get_sqs_queue(&env.id, &queue_name)
            .await?
        {
            return Ok(SqsOutput::QueueUrl(existing.url));
        }

        let fifo = queue_name.ends_with(".fifo");
        if attributes.get("FifoQueue").is_some_and(|v| v == "true") && !fifo {
            return Err(EmulatorError::validation(
                INVALID_ATTRIBUTE,
                "The name of a FIFO queue can only include alphanumeric characters, hyphens, or underscores, must end with .fifo suffix",
            ));
        }
        let settings = apply_attributes(
            SqsQueueSettings {
                visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
                message_retention_period: DEFAULT_RETENTION_SECONDS,
                delay_seconds: 0,
                receive_wait_time: 0,
                attributes: "{}".to_string(),
            },
            &attributes,
        )?;

        let queue = SqsQueueRecord {
            id: hex_id("sqs-", 16),
            environment_id: env.id.clone(),
            url: queue_url(&queue_name),
            arn: queue_arn(&queue_name),
            name: queue_name,
            fifo,
            visibility_timeout: settings.visibility_timeout,
            message_retention_period: settings.message_retention_period,
            delay_seconds: settings.delay_seconds,
            receive_wait_time: settings.receive_wait_time,
            attributes: settings.attributes,
            backing_handle: None,
            created_at: Utc::now(),
        };
        match self.ctx.persistence.insert_sqs_queue(&queue).await {
            Ok(()) => {
                info!(environment_id = %env.id, queue = %queue.name, "Queue created");
                Ok(SqsOutput::QueueUrl(queue.url))
            }
            // A concurrent create of the same name won; return its URL.
            Err(e) if e.is_unique_violation() => {
                let existing = self.queue(env, &queue.name).await?;
                Ok(SqsOutput::QueueUrl(existing.url))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn send_batch(
        &self,
        env: &EnvironmentRecord,
        queue_name: &str,
        entries: Vec<BatchEntry>,
    ) -> Result<SqsOutput> {
        let queue = self.queue(env, queue_name).await?;
        if entries.is_empty() {
            return Err(EmulatorError::validation(
                "AWS.SimpleQueueService.EmptyBatchRequest",
                "There should be at least one SendMessageBatchRequestEntry in the request.",
            ));
        }
        if entries.len() > MAX_BATCH_ENTRIES {
            return Err(EmulatorError::validation(
                "AWS.SimpleQueueService.TooManyEntriesInBatchRequest",
                format!("Maximum number of entries per request are {MAX_BATCH_ENTRIES}."),
            ));
        }
        for (i, entry) in entries.iter().enumerate() {
            if entries[..i].iter().any(|e| e.id == entry.id) {
                return Err(EmulatorError::validation(
                    "AWS.SimpleQueueService.BatchEntryIdsNotDistinct",
                    format!("Id {} repeated.", entry.id),
                ));
            }
            validate_message(&queue, &entry.message)?;
        }
        self.ctx.require_funds(env).await?;
        self.backed(env, &queue).await?;

        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let (message_id, md5_of_body) = self.enqueue(&queue, entry.message).await?;
            results.push(BatchResult {
                id: entry.id,
                message_id,
                md5_of_body,
            });
        }
        self.ctx
            .charge(env, "sqs", "SendMessageBatch", 1, sqs_cost(1))
            .await;
        Ok(SqsOutput::BatchSent(results))
    }

    async fn enqueue(
        &self,
        queue: &SqsQueueRecord,
        message: OutgoingMessage,
    ) -> Result<(String, String)> {
        let delay = message
            .delay_seconds
            .unwrap_or(i64::from(queue.delay_seconds));
        let now = now_ms();
        let record = SqsMessageRecord {
            message_id: Uuid::new_v4().to_string(),
            queue_id: queue.id.clone(),
            md5_of_body: body_md5(&message.body),
            body: message.body,
            receipt_handle: None,
            sent_at_ms: now,
            visible_at_ms: now + delay * 1000,
            receive_count: 0,
            message_group_id: message.message_group_id,
        };
        self.ctx.persistence.insert_sqs_message(&record).await?;
        Ok((record.message_id, record.md5_of_body))
    }

    /// Claim up to `max_messages`, re-checking every [`POLL_INTERVAL`]
    /// until the wait time elapses or something is received.
    async fn receive(
        &self,
        queue: &SqsQueueRecord,
        max_messages: u32,
        visibility_timeout: Option<i64>,
        wait_time_seconds: Option<i64>,
    ) -> Result<Vec<ReceivedMessage>> {
        let max = max_messages.clamp(1, MAX_RECEIVE_MESSAGES) as usize;
        let visibility = visibility_timeout.unwrap_or(i64::from(queue.visibility_timeout));
        let wait = wait_time_seconds
            .unwrap_or(i64::from(queue.receive_wait_time))
            .clamp(0, MAX_WAIT_TIME_SECONDS);
        let deadline = Instant::now() + Duration::from_secs(wait as u64);

        loop {
            self.expire(queue).await?;
            let received = self.claim(queue, max, visibility).await?;
            if !received.is_empty() || Instant::now() >= deadline {
                return Ok(received);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - Instant::now())).await;
        }
    }

    async fn claim(
        &self,
        queue: &SqsQueueRecord,
        max: usize,
        visibility: i64,
    ) -> Result<Vec<ReceivedMessage>> {
        let now = now_ms();
        let candidates = self
            .ctx
            .persistence
            .list_visible_sqs_messages(&queue.id, now, max as i64)
            .await?;

        let mut received = Vec::with_capacity(candidates.len());
        for message in candidates {
            let receipt_handle = new_receipt_handle();
            // Losing the compare-and-set means another receiver took it.
            if !self
                .ctx
                .persistence
                .claim_sqs_message(
                    &message.message_id,
                    message.visible_at_ms,
                    now + visibility * 1000,
                    &receipt_handle,
                )
                .await?
            {
                continue;
            }
            received.push(ReceivedMessage {
                message_id: message.message_id,
                receipt_handle,
                md5_of_body: message.md5_of_body,
                body: message.body,
                sent_at_ms: message.sent_at_ms,
                receive_count: message.receive_count + 1,
                message_group_id: message.message_group_id,
            });
        }
        Ok(received)
    }

    async fn expire(&self, queue: &SqsQueueRecord) -> Result<()> {
        let cutoff = now_ms() - i64::from(queue.message_retention_period) * 1000;
        let expired = self
            .ctx
            .persistence
            .expire_sqs_messages(&queue.id, cutoff)
            .await?;
        if expired > 0 {
            debug!(queue = %queue.name, expired, "Expired messages dropped");
        }
        Ok(())
    }

    async fn queue(&self, env: &EnvironmentRecord, name: &str) -> Result<SqsQueueRecord> {
        self.ctx
            .persistence
            .get_sqs_queue(&env.id, name)
            .await?
            .ok_or_else(|| {
                EmulatorError::not_found(
                    NON_EXISTENT_QUEUE,
                    "The specified queue does not exist for this wsdl version.",
                )
            })
    }

    async fn backed(&self, env: &EnvironmentRecord, queue: &SqsQueueRecord) -> Result<()> {
        if queue.backing_handle.is_none() {
            self.ctx
                .materializer
                .materialize_sqs(&env.id, &queue.id)
                .await?;
        }
        Ok(())
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Opaque single-use receipt handle.
fn new_receipt_handle() -> String {
    hex::encode(Sha256::digest(Uuid::new_v4().as_bytes()))
}

fn validate_queue_name(name: &str) -> Result<()> {
    let base = name.strip_suffix(".fifo").unwrap_or(name);
    let valid = !base.is_empty()
        && name.len() <= 80
        && base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(EmulatorError::validation(
            INVALID_VALUE,
            "Can only include alphanumeric characters, hyphens, or underscores. 1 to 80 in length",
        ));
    }
    Ok(())
}

fn validate_visibility(timeout: i64) -> Result<()> {
    if !(0..=MAX_VISIBILITY_TIMEOUT).contains(&timeout) {
        return Err(EmulatorError::validation(
            INVALID_VALUE,
            format!(
                "Value {timeout} for parameter VisibilityTimeout is invalid. Reason: Must be between 0 and {MAX_VISIBILITY_TIMEOUT}."
            ),
        ));
    }
    Ok(())
}

fn validate_message(queue: &SqsQueueRecord, message: &OutgoingMessage) -> Result<()> {
    if message.body.is_empty() {
        return Err(EmulatorError::validation(
            "MissingParameter",
            "The request must contain the parameter MessageBody.",
        ));
    }
    if let Some(delay) = message.delay_seconds
        && !(0..=MAX_DELAY_SECONDS).contains(&delay)
    {
        return Err(EmulatorError::validation(
            INVALID_VALUE,
            format!(
                "Value {delay} for parameter DelaySeconds is invalid. Reason: must be between 0 and {MAX_DELAY_SECONDS}."
            ),
        ));
    }
    if queue.fifo && message.message_group_id.is_none() {
        return Err(EmulatorError::validation(
            "MissingParameter",
            "The request must contain the parameter MessageGroupId.",
        ));
    }
    Ok(())
}

fn settings_of(queue: &SqsQueueRecord) -> SqsQueueSettings {
    SqsQueueSettings {
        visibility_timeout: queue.visibility_timeout,
        message_retention_period: queue.message_retention_period,
        delay_seconds: queue.delay_seconds,
        receive_wait_time: queue.receive_wait_time,
        attributes: queue.attributes.clone(),
    }
}

/// Overlay `Attribute.N` pairs on current settings. Known numeric
/// attributes are range-checked; others are kept verbatim.
fn apply_attributes(
    mut settings: SqsQueueSettings,
    attributes: &BTreeMap<String, String>,
) -> Result<SqsQueueSettings> {
    let mut extra: BTreeMap<String, String> =
        serde_json::from_str(&settings.attributes).unwrap_or_default();
    for (name, value) in attributes {
        let ranged = |lo: i64, hi: i64| -> Result<i32> {
            value
                .trim()
                .parse::<i64>()
                .ok()
                .filter(|v| (lo..=hi).contains(v))
                .map(|v| v as i32)
                .ok_or_else(|| {
                    EmulatorError::validation(
                        INVALID_ATTRIBUTE,
                        format!("Invalid value for the parameter {name}."),
                    )
                })
        };
        match name.as_str() {
            "VisibilityTimeout" => settings.visibility_timeout = ranged(0, MAX_VISIBILITY_TIMEOUT)?,
            "MessageRetentionPeriod" => {
                settings.message_retention_period = ranged(60, 1_209_600)?
            }
            "DelaySeconds" => settings.delay_seconds = ranged(0, MAX_DELAY_SECONDS)?,
            "ReceiveMessageWaitTimeSeconds" => {
                settings.receive_wait_time = ranged(0, MAX_WAIT_TIME_SECONDS)?
            }
            _ => {
                extra.insert(name.clone(), value.clone());
            }
        }
    }
    settings.attributes = serde_json::to_string(&extra)?;
    Ok(settings)
}

/// Static attributes of a queue.
fn queue_attributes(queue: &SqsQueueRecord) -> BTreeMap<String, String> {
    let mut attributes: BTreeMap<String, String> =
        serde_json::from_str(&queue.attributes).unwrap_or_default();
    let created = queue.created_at.timestamp().to_string();
    for (name, value) in [
        ("QueueArn", queue.arn.clone()),
        ("VisibilityTimeout", queue.visibility_timeout.to_string()),
        (
            "MessageRetentionPeriod",
            queue.message_retention_period.to_string(),
        ),
        ("DelaySeconds", queue.delay_seconds.to_string()),
        (
            "ReceiveMessageWaitTimeSeconds",
            queue.receive_wait_time.to_string(),
        ),
        ("CreatedTimestamp", created.clone()),
        ("LastModifiedTimestamp", created),
        ("FifoQueue", queue.fifo.to_string()),
    ] {
        attributes.insert(name.to_string(), value);
    }
    attributes
}
