// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DynamoDB emulator.
//!
//! Tables and items live in the store; item documents keep the typed
//! attribute encoding so every value round-trips unchanged. Item count and
//! table size are maintained by the store in the same transaction as the
//! item write.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::Utc;
use mockcloud_core::persistence::{DynamoItemRecord, DynamoTableRecord, EnvironmentRecord};
use mockcloud_protocol::dynamodb::expression::{
    KeyOp, Operand, SetValue, UpdateAction, parse_key_condition, parse_update,
};
use mockcloud_protocol::dynamodb::{
    AttributeValue, AttributeValueUpdate, BatchGetItemInput, BatchWriteItemInput,
    CreateTableInput, DynamoAction, Item, KeyInput, KeySchemaElement, ListTablesInput,
    PutItemInput, QueryInput, ScanInput, UpdateItemInput, item_size_bytes, table_arn,
};
use serde_json::{Value, json};
use tracing::info;

use super::{EmulatorContext, EmulatorError, Result, hex_id};
use crate::billing::{DynamoOp, dynamodb_unit_cost, dynamodb_units};

const VALIDATION: &str = "ValidationException";
const NOT_FOUND: &str = "ResourceNotFoundException";
const IN_USE: &str = "ResourceInUseException";

const MAX_LIST_TABLES: usize = 100;
const MAX_BATCH_GET: usize = 100;
const MAX_BATCH_WRITE: usize = 25;
/// Numbers carry at most 38 significant digits.
const MAX_NUMBER_MAGNITUDE: u128 = 10u128.pow(38) - 1;

/// Key attributes of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableKeys {
    pub hash: String,
    pub range: Option<String>,
}

impl TableKeys {
    /// Read the stored key schema.
    pub fn from_table(table: &DynamoTableRecord) -> Result<Self> {
        let schema: Vec<KeySchemaElement> = serde_json::from_str(&table.key_schema)?;
        Self::from_schema(&schema)
    }

    fn from_schema(schema: &[KeySchemaElement]) -> Result<Self> {
        let of_type = |key_type: &str| {
            schema
                .iter()
                .filter(|k| k.key_type.eq_ignore_ascii_case(key_type))
                .map(|k| k.attribute_name.clone())
                .collect::<Vec<_>>()
        };
        let hashes = of_type("HASH");
        let ranges = of_type("RANGE");
        if hashes.len() != 1 || ranges.len() > 1 || schema.len() != hashes.len() + ranges.len() {
            return Err(EmulatorError::validation(
                VALIDATION,
                "Invalid KeySchema: exactly one HASH key and at most one RANGE key are allowed",
            ));
        }
        Ok(Self {
            hash: hashes[0].clone(),
            range: ranges.into_iter().next(),
        })
    }

    fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.hash.as_str()).chain(self.range.as_deref())
    }

    fn is_key(&self, attribute: &str) -> bool {
        self.names().any(|k| k == attribute)
    }

    /// `(partition, sort)` strings of an item. Tables without a range key
    /// use an empty sort key.
    pub fn extract(&self, item: &Item) -> Result<(String, String)> {
        let component = |name: &str| -> Result<String> {
            let value = item.get(name).ok_or_else(|| {
                EmulatorError::validation(
                    VALIDATION,
                    format!("One or more parameter values were invalid: Missing the key {name} in the item"),
                )
            })?;
            value.key_string().ok_or_else(|| {
                EmulatorError::validation(
                    VALIDATION,
                    format!(
                        "One or more parameter values were invalid: Type mismatch for key {name}"
                    ),
                )
            })
        };
        let pk = component(&self.hash)?;
        let sk = match &self.range {
            Some(range) => component(range)?,
            None => String::new(),
        };
        Ok((pk, sk))
    }

    /// Like [`extract`](Self::extract), but the map must hold exactly the
    /// key attributes.
    pub fn extract_key(&self, key: &Item) -> Result<(String, String)> {
        if key.len() != self.names().count() || !key.keys().all(|k| self.is_key(k)) {
            return Err(EmulatorError::validation(
                VALIDATION,
                "The provided key element does not match the schema",
            ));
        }
        self.extract(key)
    }

    fn key_of(&self, item: &Item) -> Item {
        self.names()
            .filter_map(|k| item.get(k).map(|v| (k.to_string(), v.clone())))
            .collect()
    }
}

/// Executes DynamoDB actions for one environment.
#[derive(Clone)]
pub struct DynamoEmulator {
    ctx: EmulatorContext,
}

impl DynamoEmulator {
    pub fn new(ctx: EmulatorContext) -> Self {
        Self { ctx }
    }

    /// Execute a decoded action and return the JSON response body.
    pub async fn execute(&self, env: &EnvironmentRecord, action: DynamoAction) -> Result<Value> {
        match action {
            DynamoAction::CreateTable(input) => self.create_table(env, input).await,
            DynamoAction::DescribeTable(input) => {
                let table = self.table(env, &input.table_name).await?;
                Ok(json!({ "Table": describe(&table, &table.status)? }))
            }
            DynamoAction::ListTables(input) => self.list_tables(env, input).await,
            DynamoAction::DeleteTable(input) => {
                let table = self.table(env, &input.table_name).await?;
                self.ctx.persistence.delete_dynamo_table(&table.id).await?;
                info!(environment_id = %env.id, table = %table.name, "Table deleted");
                Ok(json!({ "TableDescription": describe(&table, "DELETING")? }))
            }
            DynamoAction::PutItem(input) => self.put_item(env, input).await,
            DynamoAction::GetItem(input) => self.get_item(env, input).await,
            DynamoAction::DeleteItem(input) => self.delete_item(env, input).await,
            DynamoAction::UpdateItem(input) => self.update_item(env, input).await,
            DynamoAction::Query(input) => self.query(env, input).await,
            DynamoAction::Scan(input) => self.scan(env, input).await,
            DynamoAction::BatchGetItem(input) => self.batch_get(env, input).await,
            DynamoAction::BatchWriteItem(input) => self.batch_write(env, input).await,
        }
    }

    async fn create_table(&self, env: &EnvironmentRecord, input: CreateTableInput) -> Result<Value> {
        validate_table_name(&input.table_name)?;
        let keys = TableKeys::from_schema(&input.key_schema)?;
        for key in keys.names() {
            let defined = input
                .attribute_definitions
                .iter()
                .find(|d| d.attribute_name == key)
                .ok_or_else(|| {
                    EmulatorError::validation(
                        VALIDATION,
                        format!("One or more parameter values were invalid: Some index key attributes are not defined in AttributeDefinitions. Keys: [{key}]"),
                    )
                })?;
            if !matches!(defined.attribute_type.as_str(), "S" | "N" | "B") {
                return Err(EmulatorError::validation(
                    VALIDATION,
                    format!("Member must satisfy enum value set: [B, N, S] for attribute {key}"),
                ));
            }
        }

        let table = DynamoTableRecord {
            id: hex_id("ddb-", 16),
            environment_id: env.id.clone(),
            name: input.table_name.clone(),
            status: "ACTIVE".to_string(),
            key_schema: serde_json::to_string(&input.key_schema)?,
            attribute_definitions: serde_json::to_string(&input.attribute_definitions)?,
            billing_mode: input
                .billing_mode
                .unwrap_or_else(|| "PAY_PER_REQUEST".to_string()),
            item_count: 0,
            table_size_bytes: 0,
            backing_handle: None,
            created_at: Utc::now(),
        };
        if let Err(e) = self.ctx.persistence.insert_dynamo_table(&table).await {
            if e.is_unique_violation() {
                return Err(EmulatorError::already_exists(
                    IN_USE,
                    format!("Table already exists: {}", input.table_name),
                ));
            }
            return Err(e.into());
        }
        info!(environment_id = %env.id, table = %table.name, "Table created");
        Ok(json!({ "TableDescription": describe(&table, "ACTIVE")? }))
    }

    async fn list_tables(&self, env: &EnvironmentRecord, input: ListTablesInput) -> Result<Value> {
        let limit = input
            .limit
            .map(|l| l as usize)
            .unwrap_or(MAX_LIST_TABLES)
            .clamp(1, MAX_LIST_TABLES);
        let names: Vec<String> = self
            .ctx
            .persistence
            .list_dynamo_tables(&env.id)
            .await?
            .into_iter()
            .map(|t| t.name)
            .filter(|name| {
                input
                    .exclusive_start_table_name
                    .as_ref()
                    .is_none_or(|start| name > start)
            })
            .collect();

        let page: Vec<&String> = names.iter().take(limit).collect();
        let mut body = json!({ "TableNames": page });
        if names.len() > limit
            && let Some(last) = page.last()
        {
            body["LastEvaluatedTableName"] = json!(last);
        }
        Ok(body)
    }

    async fn put_item(&self, env: &EnvironmentRecord, input: PutItemInput) -> Result<Value> {
        let return_all_old = return_values(input.return_values.as_deref(), &["ALL_OLD"])?;
        let table = self.table(env, &input.table_name).await?;
        let keys = TableKeys::from_table(&table)?;
        let (pk, sk) = keys.extract(&input.item)?;
        self.ctx.require_funds(env).await?;
        self.backed(env, &table).await?;

        let size = item_size_bytes(&input.item);
        let old = self.store(&table, pk, sk, &input.item).await?;
        self.charge_write(env, "PutItem", dynamodb_units(size)).await;

        match old {
            Some(old) if return_all_old.is_some() => Ok(json!({ "Attributes": old })),
            _ => Ok(json!({})),
        }
    }

    async fn get_item(&self, env: &EnvironmentRecord, input: KeyInput) -> Result<Value> {
        let table = self.table(env, &input.table_name).await?;
        let keys = TableKeys::from_table(&table)?;
        let (pk, sk) = keys.extract_key(&input.key)?;
        self.ctx.require_funds(env).await?;

        let item = self
            .ctx
            .persistence
            .get_dynamo_item(&table.id, &pk, &sk)
            .await?;
        let size = item.as_ref().map(|i| i.size_bytes as usize).unwrap_or(0);
        self.charge_read(env, "GetItem", dynamodb_units(size)).await;

        match item {
            Some(record) => Ok(json!({ "Item": decode_item(&record)? })),
            None => Ok(json!({})),
        }
    }

    async fn delete_item(&self, env: &EnvironmentRecord, input: KeyInput) -> Result<Value> {
        let return_all_old = return_values(input.return_values.as_deref(), &["ALL_OLD"])?;
        let table = self.table(env, &input.table_name).await?;
        let keys = TableKeys::from_table(&table)?;
        let (pk, sk) = keys.extract_key(&input.key)?;
        self.ctx.require_funds(env).await?;

        let removed = self
            .ctx
            .persistence
            .delete_dynamo_item(&table.id, &pk, &sk)
            .await?;
        let size = removed.as_ref().map(|i| i.size_bytes as usize).unwrap_or(0);
        self.charge_write(env, "DeleteItem", dynamodb_units(size)).await;

        match removed {
            Some(record) if return_all_old.is_some() => {
                Ok(json!({ "Attributes": decode_item(&record)? }))
            }
            _ => Ok(json!({})),
        }
    }

    async fn update_item(&self, env: &EnvironmentRecord, input: UpdateItemInput) -> Result<Value> {
        let mode = return_values(
            input.return_values.as_deref(),
            &["ALL_NEW", "ALL_OLD", "UPDATED_NEW", "UPDATED_OLD"],
        )?;
        let table = self.table(env, &input.table_name).await?;
        let keys = TableKeys::from_table(&table)?;
        let (pk, sk) = keys.extract_key(&input.key)?;

        let actions = match &input.update_expression {
            Some(expression) => Some(parse_update(
                expression,
                &input.expression_attribute_names,
                &input.expression_attribute_values,
            )?),
            None => None,
        };

        self.ctx.require_funds(env).await?;
        self.backed(env, &table).await?;

        let old = match self
            .ctx
            .persistence
            .get_dynamo_item(&table.id, &pk, &sk)
            .await?
        {
            Some(record) => Some(decode_item(&record)?),
            None => None,
        };
        let mut item = old.clone().unwrap_or_else(|| input.key.clone());
        if let Some(actions) = actions {
            apply_update(&mut item, actions, &keys)?;
        } else if let Some(updates) = input.attribute_updates {
            apply_attribute_updates(&mut item, updates, &keys)?;
        }

        let size = item_size_bytes(&item);
        self.store(&table, pk, sk, &item).await?;
        self.charge_write(env, "UpdateItem", dynamodb_units(size)).await;

        let attributes = match mode {
            Some("ALL_NEW") => Some(item),
            Some("ALL_OLD") => old,
            Some("UPDATED_NEW") => Some(changed(&item, old.as_ref())),
            Some("UPDATED_OLD") => old.as_ref().map(|o| {
                let updated = changed(&item, Some(o));
                o.iter()
                    .filter(|(k, _)| updated.contains_key(*k) || !item.contains_key(*k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            }),
            _ => None,
        };
        match attributes {
            Some(attributes) => Ok(json!({ "Attributes": attributes })),
            None => Ok(json!({})),
        }
    }

    async fn query(&self, env: &EnvironmentRecord, input: QueryInput) -> Result<Value> {
        let table = self.table(env, &input.table_name).await?;
        let keys = TableKeys::from_table(&table)?;
        let expression = input.key_condition_expression.as_deref().ok_or_else(|| {
            EmulatorError::validation(
                VALIDATION,
                "Either the KeyConditions or KeyConditionExpression parameter must be specified in the request.",
            )
        })?;
        let terms = parse_key_condition(
            expression,
            &input.expression_attribute_names,
            &input.expression_attribute_values,
        )?;

        let partition = terms
            .iter()
            .find(|t| t.attribute == keys.hash)
            .ok_or_else(|| {
                EmulatorError::validation(
                    VALIDATION,
                    format!("Query condition missed key schema element: {}", keys.hash),
                )
            })?;
        let KeyOp::Eq(partition_value) = &partition.op else {
            return Err(EmulatorError::validation(
                VALIDATION,
                "Query key condition not supported",
            ));
        };
        let pk = partition_value.key_string().ok_or_else(|| {
            EmulatorError::validation(VALIDATION, "Invalid partition key value type")
        })?;
        let sort = terms.iter().find(|t| t.attribute != keys.hash);
        if let Some(term) = sort
            && keys.range.as_deref() != Some(term.attribute.as_str())
        {
            return Err(EmulatorError::validation(
                VALIDATION,
                format!(
                    "Query key condition not supported: {} is not a key attribute",
                    term.attribute
                ),
            ));
        }

        self.ctx.require_funds(env).await?;

        let mut items = self.items(&table.id, Some(&pk)).await?;
        if let Some(term) = sort {
            items.retain(|item| {
                item.get(&term.attribute)
                    .is_some_and(|value| term.op.matches(value))
            });
        }
        if let Some(range) = &keys.range {
            items.sort_by(|a, b| match (a.get(range), b.get(range)) {
                (Some(a), Some(b)) => a.compare(b).unwrap_or(Ordering::Equal),
                _ => Ordering::Equal,
            });
        }
        let forward = input.scan_index_forward != Some(false);
        if !forward {
            items.reverse();
        }
        if let Some(start) = &input.exclusive_start_key {
            keys.extract_key(start).map_err(|_| invalid_start_key())?;
            let range = keys.range.clone();
            items = resume_after(items, start, &keys, |item| {
                let (Some(range), Some(start)) = (&range, range.as_ref().and_then(|r| start.get(r)))
                else {
                    return false;
                };
                let expected = if forward {
                    Ordering::Greater
                } else {
                    Ordering::Less
                };
                item.get(range).and_then(|v| v.compare(start)) == Some(expected)
            });
        }

        let bytes: usize = items.iter().map(item_size_bytes).sum();
        let body = page(items, input.limit, &keys);
        self.charge_read(env, "Query", dynamodb_units(bytes)).await;
        Ok(body)
    }

    async fn scan(&self, env: &EnvironmentRecord, input: ScanInput) -> Result<Value> {
        let table = self.table(env, &input.table_name).await?;
        let keys = TableKeys::from_table(&table)?;
        self.ctx.require_funds(env).await?;

        let mut items = self.items(&table.id, None).await?;
        if let Some(start) = &input.exclusive_start_key {
            let start_at = keys.extract_key(start).map_err(|_| invalid_start_key())?;
            items = resume_after(items, start, &keys, |item| {
                keys.extract(item).is_ok_and(|at| at > start_at)
            });
        }
        let bytes: usize = items.iter().map(item_size_bytes).sum();
        let body = page(items, input.limit, &keys);
        self.charge_read(env, "Scan", dynamodb_units(bytes)).await;
        Ok(body)
    }

    async fn batch_get(&self, env: &EnvironmentRecord, input: BatchGetItemInput) -> Result<Value> {
        let total: usize = input.request_items.values().map(|r| r.keys.len()).sum();
        if total == 0 || total > MAX_BATCH_GET {
            return Err(EmulatorError::validation(
                VALIDATION,
                format!("Too many items requested for the BatchGetItem call: {total}"),
            ));
        }

        let mut lookups = Vec::with_capacity(input.request_items.len());
        for (name, request) in input.request_items {
            let table = self.table(env, &name).await?;
            let keys = TableKeys::from_table(&table)?;
            let mut pairs = Vec::with_capacity(request.keys.len());
            for key in &request.keys {
                pairs.push(keys.extract_key(key)?);
            }
            lookups.push((name, table, pairs));
        }
        self.ctx.require_funds(env).await?;

        let mut responses = BTreeMap::new();
        let mut units = 0;
        for (name, table, pairs) in lookups {
            let mut found = Vec::new();
            for (pk, sk) in pairs {
                if let Some(record) = self
                    .ctx
                    .persistence
                    .get_dynamo_item(&table.id, &pk, &sk)
                    .await?
                {
                    units += dynamodb_units(record.size_bytes as usize);
                    found.push(decode_item(&record)?);
                }
            }
            responses.insert(name, found);
        }
        self.charge_read(env, "BatchGetItem", units.max(1)).await;
        Ok(json!({ "Responses": responses, "UnprocessedKeys": {} }))
    }

    async fn batch_write(
        &self,
        env: &EnvironmentRecord,
        input: BatchWriteItemInput,
    ) -> Result<Value> {
        let total: usize = input.request_items.values().map(Vec::len).sum();
        if total == 0 || total > MAX_BATCH_WRITE {
            return Err(EmulatorError::validation(
                VALIDATION,
                format!("Too many items requested for the BatchWriteItem call: {total}"),
            ));
        }

        enum Write {
            Put(String, String, Item),
            Delete(String, String),
        }

        let mut plans = Vec::with_capacity(input.request_items.len());
        for (name, requests) in input.request_items {
            let table = self.table(env, &name).await?;
            let keys = TableKeys::from_table(&table)?;
            let mut writes = Vec::with_capacity(requests.len());
            for request in requests {
                match (request.put_request, request.delete_request) {
                    (Some(put), None) => {
                        let (pk, sk) = keys.extract(&put.item)?;
                        writes.push(Write::Put(pk, sk, put.item));
                    }
                    (None, Some(delete)) => {
                        let (pk, sk) = keys.extract_key(&delete.key)?;
                        writes.push(Write::Delete(pk, sk));
                    }
                    _ => {
                        return Err(EmulatorError::validation(
                            VALIDATION,
                            "Each WriteRequest must contain exactly one of PutRequest or DeleteRequest",
                        ));
                    }
                }
            }
            plans.push((table, writes));
        }
        self.ctx.require_funds(env).await?;

        let mut units = 0;
        for (table, writes) in plans {
            self.backed(env, &table).await?;
            for write in writes {
                match write {
                    Write::Put(pk, sk, item) => {
                        units += dynamodb_units(item_size_bytes(&item));
                        self.store(&table, pk, sk, &item).await?;
                    }
                    Write::Delete(pk, sk) => {
                        let removed = self
                            .ctx
                            .persistence
                            .delete_dynamo_item(&table.id, &pk, &sk)
                            .await?;
                        units += dynamodb_units(
                            removed.map(|r| r.size_bytes as usize).unwrap_or(0),
                        );
                    }
                }
            }
        }
        self.charge_write(env, "BatchWriteItem", units).await;
        Ok(json!({ "UnprocessedItems": {} }))
    }

    async fn table(&self, env: &EnvironmentRecord, name: &str) -> Result<DynamoTableRecord> {
        self.ctx
            .persistence
            .get_dynamo_table(&env.id, name)
            .await?
            .ok_or_else(|| {
                EmulatorError::not_found(
                    NOT_FOUND,
                    format!("Requested resource not found: Table: {name} not found"),
                )
            })
    }

    async fn backed(&self, env: &EnvironmentRecord, table: &DynamoTableRecord) -> Result<()> {
        if table.backing_handle.is_none() {
            self.ctx
                .materializer
                .materialize_dynamodb(&env.id, &table.id)
                .await?;
        }
        Ok(())
    }

    async fn store(
        &self,
        table: &DynamoTableRecord,
        partition_key: String,
        sort_key: String,
        item: &Item,
    ) -> Result<Option<Item>> {
        let record = DynamoItemRecord {
            table_id: table.id.clone(),
            partition_key,
            sort_key,
            item: serde_json::to_string(item)?,
            size_bytes: item_size_bytes(item) as i64,
            updated_at: Utc::now(),
        };
        match self.ctx.persistence.put_dynamo_item(&record).await? {
            Some(old) => Ok(Some(decode_item(&old)?)),
            None => Ok(None),
        }
    }

    async fn items(&self, table_id: &str, partition_key: Option<&str>) -> Result<Vec<Item>> {
        self.ctx
            .persistence
            .list_dynamo_items(table_id, partition_key)
            .await?
            .iter()
            .map(decode_item)
            .collect()
    }

    async fn charge_read(&self, env: &EnvironmentRecord, operation: &str, units: i64) {
        self.ctx
            .charge(env, "dynamodb", operation, units, dynamodb_unit_cost(DynamoOp::Read, units))
            .await;
    }

    async fn charge_write(&self, env: &EnvironmentRecord, operation: &str, units: i64) {
        let units = units.max(1);
        self.ctx
            .charge(env, "dynamodb", operation, units, dynamodb_unit_cost(DynamoOp::Write, units))
            .await;
    }
}

/// `TableDescription` / `Table` document.
fn describe(table: &DynamoTableRecord, status: &str) -> Result<Value> {
    let key_schema: Value = serde_json::from_str(&table.key_schema)?;
    let attribute_definitions: Value = serde_json::from_str(&table.attribute_definitions)?;
    Ok(json!({
        "TableName": table.name,
        "TableId": table.id,
        "TableArn": table_arn(&table.name),
        "TableStatus": status,
        "KeySchema": key_schema,
        "AttributeDefinitions": attribute_definitions,
        "BillingModeSummary": { "BillingMode": table.billing_mode },
        "ProvisionedThroughput": {
            "NumberOfDecreasesToday": 0,
            "ReadCapacityUnits": 0,
            "WriteCapacityUnits": 0,
        },
        "ItemCount": table.item_count,
        "TableSizeBytes": table.table_size_bytes,
        "CreationDateTime": table.created_at.timestamp_millis() as f64 / 1000.0,
    }))
}

fn decode_item(record: &DynamoItemRecord) -> Result<Item> {
    Ok(serde_json::from_str(&record.item)?)
}

fn validate_table_name(name: &str) -> Result<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if !(3..=255).contains(&name.len()) || !valid_chars {
        return Err(EmulatorError::validation(
            VALIDATION,
            format!(
                "1 validation error detected: Value '{name}' at 'tableName' failed to satisfy constraint: \
                 Member must satisfy regular expression pattern: [a-zA-Z0-9_.-]+ and length 3-255"
            ),
        ));
    }
    Ok(())
}

/// Validate `ReturnValues`. `NONE` and absence mean no attributes.
fn return_values<'a>(requested: Option<&'a str>, allowed: &[&str]) -> Result<Option<&'a str>> {
    match requested {
        None | Some("NONE") => Ok(None),
        Some(mode) if allowed.contains(&mode) => Ok(Some(mode)),
        Some(mode) => Err(EmulatorError::validation(
            VALIDATION,
            format!("Return values set to invalid value: {mode}"),
        )),
    }
}

/// Drop the items up to and including the one keyed by `start`. When that
/// item no longer exists, keep only the items `is_after` accepts.
fn resume_after(
    items: Vec<Item>,
    start: &Item,
    keys: &TableKeys,
    is_after: impl Fn(&Item) -> bool,
) -> Vec<Item> {
    match items.iter().position(|item| keys.key_of(item) == *start) {
        Some(index) => items.into_iter().skip(index + 1).collect(),
        None => items.into_iter().filter(|item| is_after(item)).collect(),
    }
}

fn invalid_start_key() -> EmulatorError {
    EmulatorError::validation(VALIDATION, "The provided starting key is invalid")
}

/// Apply `Limit` and build a Query/Scan response.
fn page(mut items: Vec<Item>, limit: Option<u32>, keys: &TableKeys) -> Value {
    let mut last_key = None;
    if let Some(limit) = limit.map(|l| l as usize)
        && limit > 0
        && items.len() > limit
    {
        items.truncate(limit);
        last_key = items.last().map(|item| keys.key_of(item));
    }
    let mut body = json!({
        "Items": items,
        "Count": items.len(),
        "ScannedCount": items.len(),
    });
    if let Some(key) = last_key {
        body["LastEvaluatedKey"] = json!(key);
    }
    body
}

/// Attributes of `new` that differ from `old`.
fn changed(new: &Item, old: Option<&Item>) -> Item {
    new.iter()
        .filter(|(k, v)| old.and_then(|o| o.get(*k)) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn key_update_error(attribute: &str) -> EmulatorError {
    EmulatorError::validation(
        VALIDATION,
        format!(
            "One or more parameter values were invalid: Cannot update attribute {attribute}. This attribute is part of the key"
        ),
    )
}

fn type_error() -> EmulatorError {
    EmulatorError::validation(
        VALIDATION,
        "An operand in the update expression has an incorrect data type",
    )
}

/// Apply a parsed `UpdateExpression`.
fn apply_update(item: &mut Item, actions: Vec<UpdateAction>, keys: &TableKeys) -> Result<()> {
    for action in actions {
        match action {
            UpdateAction::Set { path, value } => {
                if keys.is_key(&path) {
                    return Err(key_update_error(&path));
                }
                let resolved = match value {
                    SetValue::Operand(operand) => resolve(item, &operand)?,
                    SetValue::Plus(a, b) => {
                        add_numbers(&resolve(item, &a)?, &resolve(item, &b)?, false)?
                    }
                    SetValue::Minus(a, b) => {
                        add_numbers(&resolve(item, &a)?, &resolve(item, &b)?, true)?
                    }
                };
                item.insert(path, resolved);
            }
            UpdateAction::Remove { path } => {
                if keys.is_key(&path) {
                    return Err(key_update_error(&path));
                }
                item.remove(&path);
            }
            UpdateAction::Add { path, value } => {
                if keys.is_key(&path) {
                    return Err(key_update_error(&path));
                }
                add_to(item, path, value)?;
            }
        }
    }
    Ok(())
}

/// Apply legacy `AttributeUpdates`.
fn apply_attribute_updates(
    item: &mut Item,
    updates: BTreeMap<String, AttributeValueUpdate>,
    keys: &TableKeys,
) -> Result<()> {
    for (attribute, update) in updates {
        if keys.is_key(&attribute) {
            return Err(key_update_error(&attribute));
        }
        let action = update.action.as_deref().unwrap_or("PUT");
        match (action, update.value) {
            ("PUT", Some(value)) => {
                item.insert(attribute, value);
            }
            ("DELETE", None) => {
                item.remove(&attribute);
            }
            ("DELETE", Some(value)) => {
                let remaining = match (item.get(&attribute), value) {
                    (Some(AttributeValue::Ss(have)), AttributeValue::Ss(drop)) => {
                        AttributeValue::Ss(set_difference(have, &drop))
                    }
                    (Some(AttributeValue::Ns(have)), AttributeValue::Ns(drop)) => {
                        AttributeValue::Ns(set_difference(have, &drop))
                    }
                    (Some(AttributeValue::Bs(have)), AttributeValue::Bs(drop)) => {
                        AttributeValue::Bs(set_difference(have, &drop))
                    }
                    (None, _) => continue,
                    _ => return Err(type_error()),
                };
                if set_is_empty(&remaining) {
                    item.remove(&attribute);
                } else {
                    item.insert(attribute, remaining);
                }
            }
            ("ADD", Some(value)) => add_to(item, attribute, value)?,
            (other, _) => {
                return Err(EmulatorError::validation(
                    VALIDATION,
                    format!("Invalid AttributeUpdates action {other} for attribute {attribute}"),
                ));
            }
        }
    }
    Ok(())
}

fn resolve(item: &Item, operand: &Operand) -> Result<AttributeValue> {
    match operand {
        Operand::Value(value) => Ok(value.clone()),
        Operand::Path(path) => item.get(path).cloned().ok_or_else(|| {
            EmulatorError::validation(
                VALIDATION,
                "The provided expression refers to an attribute that does not exist in the item",
            )
        }),
        Operand::IfNotExists(path, default) => {
            Ok(item.get(path).cloned().unwrap_or_else(|| default.clone()))
        }
    }
}

/// `ADD` semantics: numeric sum or set union; absent attributes take the value.
fn add_to(item: &mut Item, attribute: String, value: AttributeValue) -> Result<()> {
    let merged = match (item.get(&attribute), value) {
        (None, value @ (AttributeValue::N(_) | AttributeValue::Ss(_) | AttributeValue::Ns(_) | AttributeValue::Bs(_))) => value,
        (Some(current @ AttributeValue::N(_)), value @ AttributeValue::N(_)) => {
            add_numbers(current, &value, false)?
        }
        (Some(AttributeValue::Ss(have)), AttributeValue::Ss(more)) => {
            AttributeValue::Ss(set_union(have, more))
        }
        (Some(AttributeValue::Ns(have)), AttributeValue::Ns(more)) => {
            AttributeValue::Ns(set_union(have, more))
        }
        (Some(AttributeValue::Bs(have)), AttributeValue::Bs(more)) => {
            AttributeValue::Bs(set_union(have, more))
        }
        _ => return Err(type_error()),
    };
    item.insert(attribute, merged);
    Ok(())
}

/// Add or subtract two `N` values, exactly for integers.
fn add_numbers(a: &AttributeValue, b: &AttributeValue, subtract: bool) -> Result<AttributeValue> {
    let (AttributeValue::N(a), AttributeValue::N(b)) = (a, b) else {
        return Err(type_error());
    };
    let (a, b) = (a.trim(), b.trim());
    let overflow = || EmulatorError::validation(VALIDATION, "Number overflow");
    if let (Ok(x), Ok(y)) = (a.parse::<i128>(), b.parse::<i128>()) {
        let result = if subtract {
            x.checked_sub(y)
        } else {
            x.checked_add(y)
        };
        let result = result
            .filter(|r| r.unsigned_abs() <= MAX_NUMBER_MAGNITUDE)
            .ok_or_else(overflow)?;
        return Ok(AttributeValue::N(result.to_string()));
    }
    let x: f64 = a.parse().map_err(|_| type_error())?;
    let y: f64 = b.parse().map_err(|_| type_error())?;
    let result = if subtract { x - y } else { x + y };
    if !result.is_finite() {
        return Err(overflow());
    }
    Ok(AttributeValue::N(format!("{result}")))
}

fn set_union(have: &[String], more: Vec<String>) -> Vec<String> {
    let mut merged = have.to_vec();
    for value in more {
        if !merged.contains(&value) {
            merged.push(value);
        }
    }
    merged
}

fn set_difference(have: &[String], drop: &[String]) -> Vec<String> {
    have.iter().filter(|v| !drop.contains(v)).cloned().collect()
}

fn set_is_empty(value: &AttributeValue) -> bool {
    matches!(value, AttributeValue::Ss(v) | AttributeValue::Ns(v) | AttributeValue::Bs(v) if v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> TableKeys {
        TableKeys {
            hash: "pk".into(),
            range: Some("sk".into()),
        }
    }

    fn s(v: &str) -> AttributeValue {
        AttributeValue::S(v.into())
    }

    fn n(v: &str) -> AttributeValue {
        AttributeValue::N(v.into())
    }

    #[test]
    fn test_key_schema_validation() {
        let schema = |pairs: &[(&str, &str)]| -> Vec<KeySchemaElement> {
            pairs
                .iter()
                .map(|(name, kind)| KeySchemaElement {
                    attribute_name: name.to_string(),
                    key_type: kind.to_string(),
                })
                .collect()
        };
        assert_eq!(
            TableKeys::from_schema(&schema(&[("id", "HASH")])).unwrap(),
            TableKeys {
                hash: "id".into(),
                range: None
            }
        );
        assert!(TableKeys::from_schema(&schema(&[("a", "RANGE")])).is_err());
        assert!(TableKeys::from_schema(&schema(&[("a", "HASH"), ("b", "HASH")])).is_err());
    }

    #[test]
    fn test_extract_requires_key_attributes() {
        let item = Item::from([("pk".to_string(), s("a")), ("data".to_string(), n("1"))]);
        let err = keys().extract(&item).unwrap_err();
        assert_eq!(err.code(), VALIDATION);
        assert!(err.to_string().contains("Missing the key sk"));

        let item = Item::from([("pk".to_string(), s("a")), ("sk".to_string(), n("1.50"))]);
        assert_eq!(
            keys().extract(&item).unwrap(),
            ("a".to_string(), "1.5".to_string())
        );
    }

    #[test]
    fn test_extract_key_rejects_extra_attributes() {
        let key = Item::from([
            ("pk".to_string(), s("a")),
            ("sk".to_string(), s("b")),
            ("other".to_string(), s("c")),
        ]);
        assert!(keys().extract_key(&key).is_err());
    }

    #[test]
    fn test_update_expression() {
        let mut item = Item::from([
            ("pk".to_string(), s("a")),
            ("sk".to_string(), s("b")),
            ("count".to_string(), n("5")),
            ("gone".to_string(), s("x")),
        ]);
        let values = Item::from([
            (":inc".to_string(), n("2")),
            (":name".to_string(), s("widget")),
            (":tags".to_string(), AttributeValue::Ss(vec!["red".into()])),
        ]);
        let names = BTreeMap::from([("#n".to_string(), "name".to_string())]);
        let actions = parse_update(
            "SET #n = :name, count = count + :inc REMOVE gone ADD tags :tags",
            &names,
            &values,
        )
        .unwrap();
        apply_update(&mut item, actions, &keys()).unwrap();

        assert_eq!(item["name"], s("widget"));
        assert_eq!(item["count"], n("7"));
        assert!(!item.contains_key("gone"));
        assert_eq!(item["tags"], AttributeValue::Ss(vec!["red".into()]));
    }

    #[test]
    fn test_update_cannot_touch_key() {
        let mut item = Item::from([("pk".to_string(), s("a")), ("sk".to_string(), s("b"))]);
        let values = Item::from([(":v".to_string(), s("z"))]);
        let actions = parse_update("SET pk = :v", &BTreeMap::new(), &values).unwrap();
        assert!(apply_update(&mut item, actions, &keys()).is_err());
    }

    #[test]
    fn test_add_numbers() {
        assert_eq!(add_numbers(&n("10"), &n("3"), true).unwrap(), n("7"));
        assert_eq!(add_numbers(&n("1.5"), &n("1"), false).unwrap(), n("2.5"));
        assert!(add_numbers(&s("1"), &n("1"), false).is_err());
    }

    #[test]
    fn test_add_numbers_overflow_is_a_validation_error() {
        let nines = n(&"9".repeat(38));
        let err = add_numbers(&nines, &nines, false).unwrap_err();
        assert!(err.to_string().contains("Number overflow"), "{err}");

        let negative = n(&format!("-{}", "9".repeat(38)));
        assert!(add_numbers(&negative, &nines, true).is_err());

        let max = n(&i128::MAX.to_string());
        assert!(add_numbers(&max, &n("1"), false).is_err());

        // The largest 38-digit value itself is still representable.
        assert_eq!(
            add_numbers(&n(&"9".repeat(38)), &n("0"), false).unwrap(),
            nines
        );
    }

    #[test]
    fn test_resume_after_start_key() {
        let items: Vec<Item> = (0..3)
            .map(|i| {
                Item::from([
                    ("pk".to_string(), s("a")),
                    ("sk".to_string(), n(&i.to_string())),
                ])
            })
            .collect();
        let start = Item::from([("pk".to_string(), s("a")), ("sk".to_string(), n("0"))]);
        let rest = resume_after(items.clone(), &start, &keys(), |_| false);
        assert_eq!(rest, items[1..].to_vec());

        // A deleted start item falls back to ordering.
        let gone = Item::from([("pk".to_string(), s("a")), ("sk".to_string(), n("5"))]);
        assert!(resume_after(items, &gone, &keys(), |_| false).is_empty());
    }

    #[test]
    fn test_legacy_attribute_updates() {
        let mut item = Item::from([
            ("pk".to_string(), s("a")),
            ("sk".to_string(), s("b")),
            ("tags".to_string(), AttributeValue::Ss(vec!["x".into(), "y".into()])),
        ]);
        let updates = BTreeMap::from([
            (
                "tags".to_string(),
                AttributeValueUpdate {
                    value: Some(AttributeValue::Ss(vec!["x".into()])),
                    action: Some("DELETE".into()),
                },
            ),
            (
                "visits".to_string(),
                AttributeValueUpdate {
                    value: Some(n("1")),
                    action: Some("ADD".into()),
                },
            ),
        ]);
        apply_attribute_updates(&mut item, updates, &keys()).unwrap();
        assert_eq!(item["tags"], AttributeValue::Ss(vec!["y".into()]));
        assert_eq!(item["visits"], n("1"));
    }

    #[test]
    fn test_page_sets_last_evaluated_key() {
        let items: Vec<Item> = (0..3)
            .map(|i| {
                Item::from([
                    ("pk".to_string(), s("a")),
                    ("sk".to_string(), n(&i.to_string())),
                ])
            })
            .collect();
        let body = page(items, Some(2), &keys());
        assert_eq!(body["Count"], 2);
        assert_eq!(body["LastEvaluatedKey"]["sk"]["N"], "1");

        let body = page(Vec::new(), None, &keys());
        assert_eq!(body["Count"], 0);
        assert!(body.get("LastEvaluatedKey").is_none());
    }

    #[test]
    fn test_return_values() {
        assert_eq!(return_values(None, &["ALL_OLD"]).unwrap(), None);
        assert_eq!(return_values(Some("NONE"), &["ALL_OLD"]).unwrap(), None);
        assert_eq!(
            return_values(Some("ALL_OLD"), &["ALL_OLD"]).unwrap(),
            Some("ALL_OLD")
        );
        assert!(return_values(Some("ALL_NEW"), &["ALL_OLD"]).is_err());
    }
}
