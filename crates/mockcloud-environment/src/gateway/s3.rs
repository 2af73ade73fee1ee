// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! S3 REST endpoint: `/aws/s3/{bucket}/{key}`.

use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, LAST_MODIFIED, LOCATION};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::SecondsFormat;
use mockcloud_core::persistence::S3ObjectRecord;
use mockcloud_protocol::s3::{
    self, ListVersion, OWNER_DISPLAY_NAME, S3_NAMESPACE, S3Action, continuation_token,
};
use mockcloud_protocol::xml::XmlWriter;
use mockcloud_protocol::{ACCOUNT_ID, ProtocolError, QueryParams};
use tracing::error;

use super::{GatewayState, request_id, status_code, xml_response};
use crate::emulators::EmulatorError;
use crate::emulators::s3::{MAX_OBJECT_BYTES, ObjectListing, S3Output};

/// Request body limit of object routes. Uploads between the object limit
/// and this size get an `EntityTooLarge` document instead of a bare 413.
pub(super) const BODY_LIMIT: usize = MAX_OBJECT_BYTES + 1024 * 1024;

const REQUEST_ID_HEADER: &str = "x-amz-request-id";

pub(super) async fn handle_service(
    State(state): State<GatewayState>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    dispatch(&state, &method, None, None, &headers, query.as_deref(), body).await
}

pub(super) async fn handle_bucket(
    State(state): State<GatewayState>,
    method: Method,
    Path(bucket): Path<String>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    dispatch(
        &state,
        &method,
        Some(&bucket),
        None,
        &headers,
        query.as_deref(),
        body,
    )
    .await
}

pub(super) async fn handle_object(
    State(state): State<GatewayState>,
    method: Method,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    dispatch(
        &state,
        &method,
        Some(&bucket),
        Some(&key),
        &headers,
        query.as_deref(),
        body,
    )
    .await
}

async fn dispatch(
    state: &GatewayState,
    method: &Method,
    bucket: Option<&str>,
    key: Option<&str>,
    headers: &HeaderMap,
    query: Option<&str>,
    body: Bytes,
) -> Response {
    let request_id = request_id();
    let head = method == Method::HEAD;
    let resource = match (bucket, key) {
        (Some(bucket), Some(key)) => format!("/{bucket}/{key}"),
        (Some(bucket), None) => format!("/{bucket}"),
        _ => "/".to_string(),
    };
    let environment = match state.resolve(headers).await {
        Ok(env) => env,
        Err(e) => {
            let message = e.to_string();
            return error_response(e.status(), e.code(), &message, &resource, &request_id, head);
        }
    };

    let params = QueryParams::parse(query.unwrap_or_default().as_bytes());
    let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
    let decoded = S3Action::decode(method.as_str(), bucket, key, &params, body, content_type);
    let action = match decoded {
        Ok(action) => action,
        Err(e) => return protocol_error(e, &resource, &request_id, head),
    };
    let name = action.name();
    let resource = action.resource();

    match state.s3.execute(&environment, action).await {
        Ok(output) => with_request_id(render(output, head), &request_id),
        Err(e) => {
            if !e.is_client_error() {
                error!(
                    environment_id = %environment.id,
                    action = name,
                    error = %e,
                    "S3 action failed"
                );
            }
            let (status, code) = error_status(&e);
            error_response(status, code, &e.to_string(), &resource, &request_id, head)
        }
    }
}

/// S3 reports conflicts on non-empty buckets as 409 and protocol faults
/// under its own codes.
fn error_status(e: &EmulatorError) -> (StatusCode, &'static str) {
    match e {
        EmulatorError::InvalidAction(_) => (StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed"),
        EmulatorError::Protocol(_) => (StatusCode::BAD_REQUEST, "InvalidArgument"),
        EmulatorError::Backing(_) | EmulatorError::Core(_) | EmulatorError::Json(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "InternalError")
        }
        other if other.code() == "BucketNotEmpty" => (StatusCode::CONFLICT, "BucketNotEmpty"),
        other => (status_code(other.status()), other.code()),
    }
}

fn protocol_error(e: ProtocolError, resource: &str, request_id: &str, head: bool) -> Response {
    let e = EmulatorError::from(e);
    let (status, code) = error_status(&e);
    error_response(status, code, &e.to_string(), resource, request_id, head)
}

fn error_response(
    status: StatusCode,
    code: &str,
    message: &str,
    resource: &str,
    request_id: &str,
    head: bool,
) -> Response {
    // HEAD responses carry no body, only the status.
    let response = if head {
        status.into_response()
    } else {
        xml_response(status, s3::error_response(code, message, resource, request_id))
    };
    with_request_id(response, request_id)
}

fn with_request_id(mut response: Response, request_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

fn render(output: S3Output, head: bool) -> Response {
    match output {
        S3Output::Buckets(buckets) => {
            let mut w = XmlWriter::document("ListAllMyBucketsResult", Some(S3_NAMESPACE));
            w.open("Owner")
                .element("ID", ACCOUNT_ID)
                .element("DisplayName", OWNER_DISPLAY_NAME)
                .close()
                .open("Buckets");
            for bucket in &buckets {
                w.open("Bucket")
                    .element("Name", &bucket.name)
                    .element("CreationDate", timestamp(bucket.created_at))
                    .close();
            }
            xml_response(StatusCode::OK, w.finish())
        }
        S3Output::BucketCreated { location } => {
            let mut response = StatusCode::OK.into_response();
            if let Ok(value) = HeaderValue::from_str(&location) {
                response.headers_mut().insert(LOCATION, value);
            }
            response
        }
        S3Output::Listing(listing) => xml_response(StatusCode::OK, render_listing(&listing)),
        S3Output::ObjectStored { etag } => {
            let mut response = StatusCode::OK.into_response();
            if let Ok(value) = HeaderValue::from_str(&etag) {
                response.headers_mut().insert(ETAG, value);
            }
            response
        }
        S3Output::Object(object) => object_response(object, head),
        S3Output::Exists => StatusCode::OK.into_response(),
        S3Output::Deleted => StatusCode::NO_CONTENT.into_response(),
    }
}

fn object_response(object: S3ObjectRecord, head: bool) -> Response {
    let mut headers = HeaderMap::new();
    let values = [
        (CONTENT_TYPE, object.content_type.clone()),
        (ETAG, object.etag.clone()),
        (
            LAST_MODIFIED,
            object
                .updated_at
                .format("%a, %d %b %Y %H:%M:%S GMT")
                .to_string(),
        ),
        (CONTENT_LENGTH, object.size_bytes.to_string()),
    ];
    for (name, value) in values {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
    let body = if head {
        Body::empty()
    } else {
        Body::from(object.body)
    };
    (StatusCode::OK, headers, body).into_response()
}

fn render_listing(listing: &ObjectListing) -> String {
    let request = &listing.request;
    let mut w = XmlWriter::document("ListBucketResult", Some(S3_NAMESPACE));
    w.element("Name", &listing.bucket)
        .element("Prefix", request.prefix.as_deref().unwrap_or_default());
    match request.version {
        ListVersion::V1 => {
            w.element("Marker", request.start_after.as_deref().unwrap_or_default())
                .optional("NextMarker", listing.next_marker.as_ref());
        }
        ListVersion::V2 => {
            w.element(
                "KeyCount",
                listing.contents.len() + listing.common_prefixes.len(),
            )
            .optional("ContinuationToken", request.continuation_token.as_ref())
            .optional(
                "NextContinuationToken",
                listing.next_marker.as_deref().map(continuation_token),
            );
            if request.continuation_token.is_none() {
                w.optional("StartAfter", request.start_after.as_ref());
            }
        }
    }
    w.element("MaxKeys", request.max_keys)
        .optional("Delimiter", request.delimiter.as_ref())
        .element("IsTruncated", listing.is_truncated);
    for object in &listing.contents {
        w.open("Contents")
            .element("Key", &object.object_key)
            .element("LastModified", timestamp(object.updated_at))
            .element("ETag", &object.etag)
            .element("Size", object.size_bytes)
            .element("StorageClass", "STANDARD")
            .close();
    }
    for prefix in &listing.common_prefixes {
        w.open("CommonPrefixes").element("Prefix", prefix).close();
    }
    w.finish()
}

fn timestamp(at: chrono::DateTime<chrono::Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mockcloud_protocol::s3::ListObjectsRequest;

    fn object(key: &str) -> S3ObjectRecord {
        S3ObjectRecord {
            bucket_id: "s3-1".to_string(),
            object_key: key.to_string(),
            body: b"hello".to_vec(),
            etag: s3::etag(b"hello"),
            content_type: "text/plain".to_string(),
            size_bytes: 5,
            updated_at: Utc::now(),
        }
    }

    fn listing(version: ListVersion) -> ObjectListing {
        ObjectListing {
            bucket: "assets".to_string(),
            request: ListObjectsRequest {
                version,
                prefix: Some("logs/".to_string()),
                delimiter: Some("/".to_string()),
                max_keys: 2,
                start_after: None,
                continuation_token: None,
            },
            contents: vec![object("logs/a.txt")],
            common_prefixes: vec!["logs/2024/".to_string()],
            is_truncated: true,
            next_marker: Some("logs/a.txt".to_string()),
        }
    }

    #[test]
    fn test_render_listing_v1() {
        let xml = render_listing(&listing(ListVersion::V1));
        assert!(xml.contains("<ListBucketResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">"));
        assert!(xml.contains("<Name>assets</Name><Prefix>logs/</Prefix><Marker></Marker><NextMarker>logs/a.txt</NextMarker><MaxKeys>2</MaxKeys><Delimiter>/</Delimiter><IsTruncated>true</IsTruncated>"));
        assert!(xml.contains("<Key>logs/a.txt</Key>"));
        assert!(xml.contains("<ETag>&quot;5d41402abc4b2a76b9719d911017c592&quot;</ETag><Size>5</Size><StorageClass>STANDARD</StorageClass>"));
        assert!(xml.contains("<CommonPrefixes><Prefix>logs/2024/</Prefix></CommonPrefixes>"));
    }

    #[test]
    fn test_render_listing_v2_token() {
        let xml = render_listing(&listing(ListVersion::V2));
        assert!(xml.contains("<KeyCount>2</KeyCount>"));
        assert!(xml.contains(&format!(
            "<NextContinuationToken>{}</NextContinuationToken>",
            continuation_token("logs/a.txt")
        )));
        assert!(!xml.contains("<Marker>"));
    }

    #[test]
    fn test_head_object_has_headers_only() {
        let response = object_response(object("a.txt"), true);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_LENGTH], "5");
        assert_eq!(response.headers()[ETAG], "\"5d41402abc4b2a76b9719d911017c592\"");
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");
    }

    #[test]
    fn test_error_statuses() {
        let not_empty = EmulatorError::validation("BucketNotEmpty", "busy");
        assert_eq!(error_status(&not_empty), (StatusCode::CONFLICT, "BucketNotEmpty"));
        let missing = EmulatorError::not_found("NoSuchKey", "gone");
        assert_eq!(error_status(&missing), (StatusCode::NOT_FOUND, "NoSuchKey"));
        let method = EmulatorError::from(ProtocolError::UnknownAction("POST".into()));
        assert_eq!(
            error_status(&method),
            (StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed")
        );
    }
}
