// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AWS Query protocol parameters.
//!
//! EC2 and SQS accept `application/x-www-form-urlencoded` bodies (or the same
//! pairs in the query string). Lists are flattened with 1-based indexes:
//!
//! ```text
//! VpcId.1=vpc-a&VpcId.2=vpc-b
//! IpPermissions.1.IpProtocol=tcp&IpPermissions.1.IpRanges.1.CidrIp=0.0.0.0/0
//! ```

use std::collections::BTreeMap;
use std::str::FromStr;

use url::form_urlencoded;

use crate::error::ProtocolError;

/// Decoded Query protocol parameters, in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    /// Parse a form-encoded body or query string.
    pub fn parse(input: &[u8]) -> Self {
        let pairs = form_urlencoded::parse(input)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        Self { pairs }
    }

    /// Append the pairs of `other`. Existing keys win on lookup.
    pub fn merge(mut self, other: QueryParams) -> Self {
        self.pairs.extend(other.pairs);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// First non-empty value for `key`, or `MissingParameter`.
    pub fn require(&self, key: &str) -> Result<&str, ProtocolError> {
        match self.get(key) {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(ProtocolError::MissingParameter(key.to_string())),
        }
    }

    /// Parse the value for `key`, if present.
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>, ProtocolError> {
        match self.get(key) {
            None | Some("") => Ok(None),
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|_| ProtocolError::invalid(key, format!("'{raw}' is not valid"))),
        }
    }

    /// The `Action` parameter.
    pub fn action(&self) -> Result<&str, ProtocolError> {
        self.require("Action")
    }

    /// Values of a flattened scalar list (`Prefix.1`, `Prefix.2`, ...), in
    /// index order.
    pub fn indexed(&self, prefix: &str) -> Vec<String> {
        self.indexed_groups(prefix)
            .into_values()
            .filter_map(|mut group| group.remove(""))
            .collect()
    }

    /// Members of a flattened structure list, keyed by index. Each member
    /// maps the remaining key path (`IpProtocol`, `IpRanges.1.CidrIp`) to
    /// its value; a scalar member is stored under the empty key.
    pub fn indexed_groups(&self, prefix: &str) -> BTreeMap<u32, BTreeMap<String, String>> {
        let mut groups: BTreeMap<u32, BTreeMap<String, String>> = BTreeMap::new();
        for (key, value) in &self.pairs {
            let Some(rest) = key.strip_prefix(prefix).and_then(|r| r.strip_prefix('.')) else {
                continue;
            };
            let (index, member) = match rest.split_once('.') {
                Some((index, member)) => (index, member),
                None => (rest, ""),
            };
            if let Ok(index) = index.parse::<u32>() {
                groups
                    .entry(index)
                    .or_default()
                    .entry(member.to_string())
                    .or_insert_with(|| value.clone());
            }
        }
        groups
    }

    /// Name/value attribute pairs (`Attribute.N.Name` / `Attribute.N.Value`).
    pub fn attribute_map(&self, prefix: &str) -> BTreeMap<String, String> {
        self.indexed_groups(prefix)
            .into_values()
            .filter_map(|mut group| {
                let name = group.remove("Name")?;
                let value = group.remove("Value").unwrap_or_default();
                Some((name, value))
            })
            .collect()
    }
}

impl FromIterator<(String, String)> for QueryParams {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            pairs: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decodes_percent_and_plus() {
        let params = QueryParams::parse(b"Action=SendMessage&MessageBody=hello+world%21");
        assert_eq!(params.action().unwrap(), "SendMessage");
        assert_eq!(params.get("MessageBody"), Some("hello world!"));
    }

    #[test]
    fn test_require_rejects_empty() {
        let params = QueryParams::parse(b"VpcId=");
        assert!(matches!(
            params.require("VpcId"),
            Err(ProtocolError::MissingParameter(name)) if name == "VpcId"
        ));
    }

    #[test]
    fn test_indexed_is_ordered_by_index_not_wire_order() {
        let params = QueryParams::parse(b"VpcId.2=vpc-b&VpcId.1=vpc-a&VpcId.10=vpc-c");
        assert_eq!(params.indexed("VpcId"), vec!["vpc-a", "vpc-b", "vpc-c"]);
    }

    #[test]
    fn test_indexed_groups_nested_members() {
        let params = QueryParams::parse(
            b"IpPermissions.1.IpProtocol=tcp&IpPermissions.1.FromPort=22&IpPermissions.1.IpRanges.1.CidrIp=10.0.0.0%2F8",
        );
        let groups = params.indexed_groups("IpPermissions");
        let first = &groups[&1];
        assert_eq!(first["IpProtocol"], "tcp");
        assert_eq!(first["FromPort"], "22");
        assert_eq!(first["IpRanges.1.CidrIp"], "10.0.0.0/8");
    }

    #[test]
    fn test_attribute_map() {
        let params = QueryParams::parse(
            b"Attribute.1.Name=VisibilityTimeout&Attribute.1.Value=60&Attribute.2.Name=DelaySeconds&Attribute.2.Value=5",
        );
        let attrs = params.attribute_map("Attribute");
        assert_eq!(attrs["VisibilityTimeout"], "60");
        assert_eq!(attrs["DelaySeconds"], "5");
    }

    #[test]
    fn test_get_parsed() {
        let params = QueryParams::parse(b"MaxNumberOfMessages=abc&WaitTimeSeconds=5");
        assert!(params.get_parsed::<u32>("MaxNumberOfMessages").is_err());
        assert_eq!(params.get_parsed::<u32>("WaitTimeSeconds").unwrap(), Some(5));
        assert_eq!(params.get_parsed::<u32>("Missing").unwrap(), None);
    }

    #[test]
    fn test_merge_prefers_first_source() {
        let body = QueryParams::parse(b"Action=ListQueues");
        let query = QueryParams::parse(b"Action=Other&QueueNamePrefix=a");
        let merged = body.merge(query);
        assert_eq!(merged.action().unwrap(), "ListQueues");
        assert_eq!(merged.get("QueueNamePrefix"), Some("a"));
    }
}
