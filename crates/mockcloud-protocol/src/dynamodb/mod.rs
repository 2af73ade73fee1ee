// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DynamoDB JSON protocol (`X-Amz-Target: DynamoDB_20120810.<Operation>`).
//!
//! Attribute values use the typed wire form, a single-key object whose key
//! names the type:
//!
//! ```text
//! {"id": {"S": "order-1"}, "total": {"N": "12.50"}, "tags": {"SS": ["a", "b"]}}
//! ```

pub mod expression;

use std::cmp::Ordering;
use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::aws_json::parse_body;
use crate::error::ProtocolError;
use crate::{ACCOUNT_ID, REGION};

/// `__type` prefix of DynamoDB errors.
pub const ERROR_PREFIX: &str = "com.amazonaws.dynamodb.v20120810";

/// Target prefix expected in `X-Amz-Target`.
pub const TARGET_PREFIX: &str = "DynamoDB_20120810";

pub fn table_arn(name: &str) -> String {
    format!("arn:aws:dynamodb:{REGION}:{ACCOUNT_ID}:table/{name}")
}

/// A typed DynamoDB attribute value. Binary values keep their base64 wire
/// form so they round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    S(String),
    N(String),
    B(String),
    #[serde(rename = "BOOL")]
    Bool(bool),
    #[serde(rename = "NULL")]
    Null(bool),
    M(BTreeMap<String, AttributeValue>),
    L(Vec<AttributeValue>),
    #[serde(rename = "SS")]
    Ss(Vec<String>),
    #[serde(rename = "NS")]
    Ns(Vec<String>),
    #[serde(rename = "BS")]
    Bs(Vec<String>),
}

/// An item: attribute name to typed value.
pub type Item = BTreeMap<String, AttributeValue>;

impl AttributeValue {
    /// Wire type code (`S`, `N`, `BOOL`, ...).
    pub fn type_code(&self) -> &'static str {
        match self {
            Self::S(_) => "S",
            Self::N(_) => "N",
            Self::B(_) => "B",
            Self::Bool(_) => "BOOL",
            Self::Null(_) => "NULL",
            Self::M(_) => "M",
            Self::L(_) => "L",
            Self::Ss(_) => "SS",
            Self::Ns(_) => "NS",
            Self::Bs(_) => "BS",
        }
    }

    /// String form of a scalar key attribute (S, N or B). Other types cannot
    /// be keys.
    pub fn key_string(&self) -> Option<String> {
        match self {
            Self::S(s) | Self::B(s) => Some(s.clone()),
            Self::N(n) => Some(normalize_number(n)),
            _ => None,
        }
    }

    /// Compare two scalar values of the same type, following DynamoDB
    /// ordering: numbers numerically, strings by code points, binary by
    /// unsigned bytes. Mixed or non-scalar types are incomparable.
    pub fn compare(&self, other: &AttributeValue) -> Option<Ordering> {
        match (self, other) {
            (Self::S(a), Self::S(b)) => Some(a.cmp(b)),
            (Self::N(a), Self::N(b)) => {
                let a = a.trim().parse::<f64>().ok()?;
                let b = b.trim().parse::<f64>().ok()?;
                a.partial_cmp(&b)
            }
            (Self::B(a), Self::B(b)) => {
                let a = STANDARD.decode(a).ok()?;
                let b = STANDARD.decode(b).ok()?;
                Some(a.cmp(&b))
            }
            _ => None,
        }
    }

    /// `begins_with` for strings and binary values.
    pub fn begins_with(&self, prefix: &AttributeValue) -> bool {
        match (self, prefix) {
            (Self::S(a), Self::S(p)) => a.starts_with(p.as_str()),
            (Self::B(a), Self::B(p)) => match (STANDARD.decode(a), STANDARD.decode(p)) {
                (Ok(a), Ok(p)) => a.starts_with(&p),
                _ => false,
            },
            _ => false,
        }
    }
}

// "1.50" and "1.5" name the same key.
fn normalize_number(raw: &str) -> String {
    let raw = raw.trim();
    match raw.parse::<f64>() {
        Ok(n) if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", n as i64),
        Ok(n) if n.is_finite() => format!("{n}"),
        _ => raw.to_string(),
    }
}

/// Size of an item as DynamoDB bills it, approximated by its JSON length.
pub fn item_size_bytes(item: &Item) -> usize {
    serde_json::to_vec(item).map(|v| v.len()).unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeySchemaElement {
    pub attribute_name: String,
    /// `HASH` or `RANGE`.
    pub key_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AttributeDefinition {
    pub attribute_name: String,
    pub attribute_type: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateTableInput {
    pub table_name: String,
    #[serde(default)]
    pub key_schema: Vec<KeySchemaElement>,
    #[serde(default)]
    pub attribute_definitions: Vec<AttributeDefinition>,
    pub billing_mode: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TableNameInput {
    pub table_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListTablesInput {
    pub limit: Option<u32>,
    pub exclusive_start_table_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PutItemInput {
    pub table_name: String,
    pub item: Item,
    pub return_values: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeyInput {
    pub table_name: String,
    pub key: Item,
    pub return_values: Option<String>,
}

/// Legacy `AttributeUpdates` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AttributeValueUpdate {
    pub value: Option<AttributeValue>,
    /// `PUT` (default), `ADD` or `DELETE`.
    pub action: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateItemInput {
    pub table_name: String,
    pub key: Item,
    pub update_expression: Option<String>,
    #[serde(default)]
    pub expression_attribute_values: Item,
    #[serde(default)]
    pub expression_attribute_names: BTreeMap<String, String>,
    pub attribute_updates: Option<BTreeMap<String, AttributeValueUpdate>>,
    pub return_values: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueryInput {
    pub table_name: String,
    pub key_condition_expression: Option<String>,
    #[serde(default)]
    pub expression_attribute_values: Item,
    #[serde(default)]
    pub expression_attribute_names: BTreeMap<String, String>,
    pub scan_index_forward: Option<bool>,
    pub limit: Option<u32>,
    pub exclusive_start_key: Option<Item>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScanInput {
    pub table_name: String,
    pub limit: Option<u32>,
    pub exclusive_start_key: Option<Item>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeysAndAttributes {
    pub keys: Vec<Item>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BatchGetItemInput {
    pub request_items: BTreeMap<String, KeysAndAttributes>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PutRequest {
    pub item: Item,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeleteRequest {
    pub key: Item,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WriteRequest {
    pub put_request: Option<PutRequest>,
    pub delete_request: Option<DeleteRequest>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BatchWriteItemInput {
    pub request_items: BTreeMap<String, Vec<WriteRequest>>,
}

/// Decoded DynamoDB operation.
#[derive(Debug, Clone)]
pub enum DynamoAction {
    CreateTable(CreateTableInput),
    DescribeTable(TableNameInput),
    ListTables(ListTablesInput),
    DeleteTable(TableNameInput),
    PutItem(PutItemInput),
    GetItem(KeyInput),
    DeleteItem(KeyInput),
    UpdateItem(UpdateItemInput),
    Query(QueryInput),
    Scan(ScanInput),
    BatchGetItem(BatchGetItemInput),
    BatchWriteItem(BatchWriteItemInput),
}

impl DynamoAction {
    /// Decode the operation named by the target header.
    pub fn decode(operation: &str, body: &[u8]) -> Result<Self, ProtocolError> {
        let action = match operation {
            "CreateTable" => Self::CreateTable(parse_body(body)?),
            "DescribeTable" => Self::DescribeTable(parse_body(body)?),
            "ListTables" => Self::ListTables(parse_body(body)?),
            "DeleteTable" => Self::DeleteTable(parse_body(body)?),
            "PutItem" => Self::PutItem(parse_body(body)?),
            "GetItem" => Self::GetItem(parse_body(body)?),
            "DeleteItem" => Self::DeleteItem(parse_body(body)?),
            "UpdateItem" => Self::UpdateItem(parse_body(body)?),
            "Query" => Self::Query(parse_body(body)?),
            "Scan" => Self::Scan(parse_body(body)?),
            "BatchGetItem" => Self::BatchGetItem(parse_body(body)?),
            "BatchWriteItem" => Self::BatchWriteItem(parse_body(body)?),
            other => return Err(ProtocolError::UnknownAction(other.to_string())),
        };
        Ok(action)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateTable(_) => "CreateTable",
            Self::DescribeTable(_) => "DescribeTable",
            Self::ListTables(_) => "ListTables",
            Self::DeleteTable(_) => "DeleteTable",
            Self::PutItem(_) => "PutItem",
            Self::GetItem(_) => "GetItem",
            Self::DeleteItem(_) => "DeleteItem",
            Self::UpdateItem(_) => "UpdateItem",
            Self::Query(_) => "Query",
            Self::Scan(_) => "Scan",
            Self::BatchGetItem(_) => "BatchGetItem",
            Self::BatchWriteItem(_) => "BatchWriteItem",
        }
    }

    /// Item-level operations, which are metered.
    pub fn is_data_plane(&self) -> bool {
        !matches!(
            self,
            Self::CreateTable(_) | Self::DescribeTable(_) | Self::ListTables(_) | Self::DeleteTable(_)
        )
    }

    /// Operations that first materialize the backing store.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Self::PutItem(_) | Self::UpdateItem(_) | Self::BatchWriteItem(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_attribute_values_round_trip_every_type() {
        let wire = json!({
            "s": {"S": "text"},
            "n": {"N": "42.5"},
            "b": {"B": "AAEC"},
            "bool": {"BOOL": true},
            "null": {"NULL": true},
            "m": {"M": {"inner": {"S": "x"}}},
            "l": {"L": [{"N": "1"}, {"S": "two"}]},
            "ss": {"SS": ["a", "b"]},
            "ns": {"NS": ["1", "2"]},
            "bs": {"BS": ["AA=="]}
        });
        let item: Item = serde_json::from_value(wire.clone()).unwrap();
        assert_eq!(item["bool"], AttributeValue::Bool(true));
        assert_eq!(item["ss"].type_code(), "SS");
        assert_eq!(serde_json::to_value(&item).unwrap(), wire);
    }

    #[test]
    fn test_unknown_type_key_is_rejected() {
        let result: Result<Item, _> = serde_json::from_value(json!({"a": {"X": "1"}}));
        assert!(result.is_err());
    }

    #[test]
    fn test_key_string_normalizes_numbers() {
        assert_eq!(
            AttributeValue::N("1.50".into()).key_string(),
            AttributeValue::N("1.5".into()).key_string()
        );
        assert_eq!(
            AttributeValue::N("10".into()).key_string(),
            AttributeValue::N("10.0".into()).key_string()
        );
        assert_eq!(AttributeValue::Bool(true).key_string(), None);
    }

    #[test]
    fn test_compare_numbers_numerically() {
        let nine = AttributeValue::N("9".into());
        let ten = AttributeValue::N("10".into());
        assert_eq!(nine.compare(&ten), Some(Ordering::Less));
        assert_eq!(
            AttributeValue::S("9".into()).compare(&AttributeValue::S("10".into())),
            Some(Ordering::Greater)
        );
        assert_eq!(nine.compare(&AttributeValue::S("9".into())), None);
    }

    #[test]
    fn test_begins_with() {
        let value = AttributeValue::S("order#2024".into());
        assert!(value.begins_with(&AttributeValue::S("order#".into())));
        assert!(!value.begins_with(&AttributeValue::S("user#".into())));
    }

    #[test]
    fn test_decode_operations() {
        let action = DynamoAction::decode(
            "PutItem",
            br#"{"TableName": "orders", "Item": {"id": {"S": "1"}}}"#,
        )
        .unwrap();
        assert!(action.is_data_plane());
        assert!(action.is_write());

        let action = DynamoAction::decode("ListTables", b"").unwrap();
        assert!(!action.is_data_plane());

        assert!(matches!(
            DynamoAction::decode("CreateBackup", b"{}"),
            Err(ProtocolError::UnknownAction(_))
        ));
        assert!(matches!(
            DynamoAction::decode("GetItem", b"{\"TableName\": 5}"),
            Err(ProtocolError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_table_arn() {
        assert_eq!(
            table_arn("orders"),
            "arn:aws:dynamodb:us-east-1:123456789012:table/orders"
        );
    }
}
