// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! S3 REST protocol.
//!
//! Requests are addressed by method and path (`/{bucket}/{key}`) rather than
//! by an action parameter; [`S3Action::decode`] maps the pair onto a typed
//! action. Responses are unqualified-namespace XML except for listings.

use bytes::Bytes;
use md5::{Digest, Md5};

use crate::error::ProtocolError;
use crate::query::QueryParams;
use crate::xml::XmlWriter;

pub const S3_NAMESPACE: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

/// Owner display name reported in bucket listings.
pub const OWNER_DISPLAY_NAME: &str = "mock-user";

/// Largest page a listing returns.
pub const MAX_KEYS: usize = 1000;

pub const DEFAULT_CONTENT_TYPE: &str = "binary/octet-stream";

/// Longest object key in bytes.
pub const MAX_KEY_BYTES: usize = 1024;

/// Which listing API the caller spoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListVersion {
    /// `GET /{bucket}` with `marker`.
    V1,
    /// `GET /{bucket}?list-type=2` with `continuation-token`.
    V2,
}

/// Paging and filtering of a bucket listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListObjectsRequest {
    pub version: ListVersion,
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub max_keys: usize,
    /// Keys up to and including this one are skipped.
    pub start_after: Option<String>,
    /// The token as sent, echoed back in V2 responses.
    pub continuation_token: Option<String>,
}

/// A decoded S3 request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum S3Action {
    ListBuckets,
    CreateBucket {
        bucket: String,
    },
    HeadBucket {
        bucket: String,
    },
    DeleteBucket {
        bucket: String,
    },
    ListObjects {
        bucket: String,
        request: ListObjectsRequest,
    },
    PutObject {
        bucket: String,
        key: String,
        body: Bytes,
        content_type: String,
    },
    GetObject {
        bucket: String,
        key: String,
    },
    HeadObject {
        bucket: String,
        key: String,
    },
    DeleteObject {
        bucket: String,
        key: String,
    },
}

impl S3Action {
    /// Decode from method, path segments and query string. An empty key
    /// addresses the bucket itself.
    pub fn decode(
        method: &str,
        bucket: Option<&str>,
        key: Option<&str>,
        query: &QueryParams,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<Self, ProtocolError> {
        let bucket = bucket.filter(|b| !b.is_empty()).map(str::to_string);
        let key = key.filter(|k| !k.is_empty()).map(str::to_string);

        let action = match (method, bucket, key) {
            ("GET", None, None) => Self::ListBuckets,
            ("PUT", Some(bucket), None) => Self::CreateBucket { bucket },
            ("HEAD", Some(bucket), None) => Self::HeadBucket { bucket },
            ("DELETE", Some(bucket), None) => Self::DeleteBucket { bucket },
            ("GET", Some(bucket), None) => Self::ListObjects {
                bucket,
                request: list_request(query)?,
            },
            ("PUT", Some(bucket), Some(key)) => Self::PutObject {
                bucket,
                key,
                body,
                content_type: content_type
                    .filter(|c| !c.is_empty())
                    .unwrap_or(DEFAULT_CONTENT_TYPE)
                    .to_string(),
            },
            ("GET", Some(bucket), Some(key)) => Self::GetObject { bucket, key },
            ("HEAD", Some(bucket), Some(key)) => Self::HeadObject { bucket, key },
            ("DELETE", Some(bucket), Some(key)) => Self::DeleteObject { bucket, key },
            (method, _, _) => return Err(ProtocolError::UnknownAction(method.to_string())),
        };
        Ok(action)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ListBuckets => "ListBuckets",
            Self::CreateBucket { .. } => "CreateBucket",
            Self::HeadBucket { .. } => "HeadBucket",
            Self::DeleteBucket { .. } => "DeleteBucket",
            Self::ListObjects { request, .. } => match request.version {
                ListVersion::V1 => "ListObjects",
                ListVersion::V2 => "ListObjectsV2",
            },
            Self::PutObject { .. } => "PutObject",
            Self::GetObject { .. } => "GetObject",
            Self::HeadObject { .. } => "HeadObject",
            Self::DeleteObject { .. } => "DeleteObject",
        }
    }

    /// The bucket the request addresses, for error `Resource` elements.
    pub fn resource(&self) -> String {
        match self {
            Self::ListBuckets => "/".to_string(),
            Self::CreateBucket { bucket }
            | Self::HeadBucket { bucket }
            | Self::DeleteBucket { bucket }
            | Self::ListObjects { bucket, .. } => format!("/{bucket}"),
            Self::PutObject { bucket, key, .. }
            | Self::GetObject { bucket, key }
            | Self::HeadObject { bucket, key }
            | Self::DeleteObject { bucket, key } => format!("/{bucket}/{key}"),
        }
    }
}

fn list_request(query: &QueryParams) -> Result<ListObjectsRequest, ProtocolError> {
    let version = match query.get("list-type") {
        None | Some("1") => ListVersion::V1,
        Some("2") => ListVersion::V2,
        Some(other) => return Err(ProtocolError::invalid("list-type", other)),
    };
    let max_keys = match query.get("max-keys") {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| {
                ProtocolError::invalid(
                    "max-keys",
                    "Provided max-keys not an integer or within integer range",
                )
            })?
            .min(MAX_KEYS),
        None => MAX_KEYS,
    };
    let non_empty = |name: &str| {
        query
            .get(name)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let continuation_token = match version {
        ListVersion::V2 => non_empty("continuation-token"),
        ListVersion::V1 => None,
    };
    let start_after = match (version, &continuation_token) {
        (ListVersion::V2, Some(token)) => Some(decode_continuation_token(token)?),
        (ListVersion::V2, None) => non_empty("start-after"),
        (ListVersion::V1, _) => non_empty("marker"),
    };

    Ok(ListObjectsRequest {
        version,
        prefix: non_empty("prefix"),
        delimiter: non_empty("delimiter"),
        max_keys,
        start_after,
        continuation_token,
    })
}

/// Opaque token resuming a V2 listing after `key`.
pub fn continuation_token(key: &str) -> String {
    hex::encode(key.as_bytes())
}

fn decode_continuation_token(token: &str) -> Result<String, ProtocolError> {
    hex::decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or_else(|| {
            ProtocolError::invalid(
                "continuation-token",
                "The continuation token provided is incorrect",
            )
        })
}

/// Quoted hex MD5, the ETag of a single-part upload.
pub fn etag(body: &[u8]) -> String {
    format!("\"{}\"", hex::encode(Md5::digest(body)))
}

/// Bucket naming rules: 3-63 characters of lowercase letters, digits,
/// dots and hyphens, starting and ending with a letter or digit, and not
/// shaped like an IPv4 address.
pub fn validate_bucket_name(name: &str) -> Result<(), String> {
    let invalid = || Err("The specified bucket is not valid.".to_string());
    if !(3..=63).contains(&name.len()) {
        return invalid();
    }
    let allowed = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-';
    let edge = |c: Option<char>| c.is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    if !name.chars().all(allowed) || !edge(name.chars().next()) || !edge(name.chars().last()) {
        return invalid();
    }
    if name.contains("..") || name.parse::<std::net::Ipv4Addr>().is_ok() {
        return invalid();
    }
    Ok(())
}

/// S3 error document.
pub fn error_response(code: &str, message: &str, resource: &str, request_id: &str) -> String {
    let mut w = XmlWriter::document("Error", None);
    w.element("Code", code)
        .element("Message", message)
        .element("Resource", resource)
        .element("RequestId", request_id);
    w.finish()
}
