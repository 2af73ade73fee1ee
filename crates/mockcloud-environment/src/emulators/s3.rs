// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! S3 emulator.
//!
//! Buckets and objects are rows; object content is stored with the object.
//! The first upload into a bucket materializes the environment's MinIO
//! container. Listings are computed over keys in byte order, rolling keys
//! that share a delimited prefix into one common prefix.

use chrono::Utc;
use mockcloud_core::CoreError;
use mockcloud_core::persistence::{EnvironmentRecord, S3BucketRecord, S3ObjectRecord};
use mockcloud_protocol::s3::{
    ListObjectsRequest, MAX_KEY_BYTES, S3Action, etag, validate_bucket_name,
};
use tracing::{debug, info};

use super::{EmulatorContext, EmulatorError, Result, hex_id};
use crate::billing::{S3Op, s3_cost};

/// Largest object a single PUT stores.
pub const MAX_OBJECT_BYTES: usize = 5 * 1024 * 1024;

const NO_SUCH_BUCKET: &str = "NoSuchBucket";

/// One page of a bucket listing.
#[derive(Debug, Clone)]
pub struct ObjectListing {
    pub bucket: String,
    pub request: ListObjectsRequest,
    /// Objects without content.
    pub contents: Vec<S3ObjectRecord>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    /// Last key or prefix of a truncated page.
    pub next_marker: Option<String>,
}

/// Result of an S3 action, rendered by the gateway.
#[derive(Debug, Clone)]
pub enum S3Output {
    Buckets(Vec<S3BucketRecord>),
    BucketCreated { location: String },
    Listing(ObjectListing),
    ObjectStored { etag: String },
    /// GetObject and HeadObject.
    Object(S3ObjectRecord),
    /// HeadBucket.
    Exists,
    /// DeleteBucket and DeleteObject.
    Deleted,
}

/// Executes S3 actions for one environment.
#[derive(Clone)]
pub struct S3Emulator {
    ctx: EmulatorContext,
}

impl S3Emulator {
    pub fn new(ctx: EmulatorContext) -> Self {
        Self { ctx }
    }

    /// Execute a decoded action.
    pub async fn execute(&self, env: &EnvironmentRecord, action: S3Action) -> Result<S3Output> {
        match action {
            S3Action::ListBuckets => Ok(S3Output::Buckets(
                self.ctx.persistence.list_s3_buckets(&env.id).await?,
            )),
            S3Action::CreateBucket { bucket } => self.create_bucket(env, bucket).await,
            S3Action::HeadBucket { bucket } => {
                self.bucket(env, &bucket).await?;
                Ok(S3Output::Exists)
            }
            S3Action::DeleteBucket { bucket } => {
                let record = self.bucket(env, &bucket).await?;
                if !self.ctx.persistence.delete_s3_bucket(&record.id).await? {
                    return Err(EmulatorError::validation(
                        "BucketNotEmpty",
                        "The bucket you tried to delete is not empty",
                    ));
                }
                info!(environment_id = %env.id, bucket = %bucket, "Bucket deleted");
                Ok(S3Output::Deleted)
            }
            S3Action::ListObjects { bucket, request } => {
                let record = self.bucket(env, &bucket).await?;
                self.ctx.require_funds(env).await?;
                let objects = self
                    .ctx
                    .persistence
                    .list_s3_objects(&record.id, request.prefix.as_deref())
                    .await?;
                let listing = paginate(bucket, request, objects);
                self.ctx
                    .charge(env, "s3", "ListObjects", 1, s3_cost(S3Op::Write, 1))
                    .await;
                Ok(S3Output::Listing(listing))
            }
            S3Action::PutObject {
                bucket,
                key,
                body,
                content_type,
            } => {
                validate_key(&key)?;
                if body.len() > MAX_OBJECT_BYTES {
                    return Err(EmulatorError::validation(
                        "EntityTooLarge",
                        "Your proposed upload exceeds the maximum allowed object size.",
                    ));
                }
                let record = self.bucket(env, &bucket).await?;
                self.ctx.require_funds(env).await?;
                self.backed(env, &record).await?;

                let object = S3ObjectRecord {
                    bucket_id: record.id.clone(),
                    object_key: key,
                    etag: etag(&body),
                    content_type,
                    size_bytes: body.len() as i64,
                    body: body.to_vec(),
                    updated_at: Utc::now(),
                };
                match self.ctx.persistence.put_s3_object(&object).await {
                    Ok(_) => {}
                    // The bucket was deleted while the upload was in flight.
                    Err(CoreError::NotFound { .. }) => {
                        return Err(no_such_bucket(&bucket));
                    }
                    Err(e) => return Err(e.into()),
                }
                debug!(
                    bucket = %bucket,
                    key = %object.object_key,
                    size = object.size_bytes,
                    "Object stored"
                );
                self.ctx
                    .charge(env, "s3", "PutObject", 1, s3_cost(S3Op::Write, 1))
                    .await;
                Ok(S3Output::ObjectStored { etag: object.etag })
            }
            S3Action::GetObject { bucket, key } => {
                self.read_object(env, &bucket, &key, "GetObject").await
            }
            S3Action::HeadObject { bucket, key } => {
                self.read_object(env, &bucket, &key, "HeadObject").await
            }
            S3Action::DeleteObject { bucket, key } => {
                let record = self.bucket(env, &bucket).await?;
                // Deleting an absent key succeeds.
                self.ctx
                    .persistence
                    .delete_s3_object(&record.id, &key)
                    .await?;
                Ok(S3Output::Deleted)
            }
        }
    }

    async fn create_bucket(&self, env: &EnvironmentRecord, name: String) -> Result<S3Output> {
        validate_bucket_name(&name)
            .map_err(|message| EmulatorError::validation("InvalidBucketName", message))?;
        let already_exists = || {
            EmulatorError::already_exists(
                "BucketAlreadyExists",
                "The requested bucket name is not available.",
            )
        };
        if self
            .ctx
            .persistence
            .get_s3_bucket(&env.id, &name)
            .await?
            .is_some()
        {
            return Err(already_exists());
        }

        let bucket = S3BucketRecord {
            id: hex_id("s3-", 16),
            environment_id: env.id.clone(),
            name,
            object_count: 0,
            total_size_bytes: 0,
            backing_handle: None,
            created_at: Utc::now(),
        };
        match self.ctx.persistence.insert_s3_bucket(&bucket).await {
            Ok(()) => {
                info!(environment_id = %env.id, bucket = %bucket.name, "Bucket created");
                Ok(S3Output::BucketCreated {
                    location: format!("/{}", bucket.name),
                })
            }
            Err(e) if e.is_unique_violation() => Err(already_exists()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_object(
        &self,
        env: &EnvironmentRecord,
        bucket: &str,
        key: &str,
        operation: &str,
    ) -> Result<S3Output> {
        let record = self.bucket(env, bucket).await?;
        self.ctx.require_funds(env).await?;
        let object = self
            .ctx
            .persistence
            .get_s3_object(&record.id, key)
            .await?
            .ok_or_else(|| {
                EmulatorError::not_found("NoSuchKey", "The specified key does not exist.")
            })?;
        self.ctx
            .charge(env, "s3", operation, 1, s3_cost(S3Op::Read, 1))
            .await;
        Ok(S3Output::Object(object))
    }

    async fn bucket(&self, env: &EnvironmentRecord, name: &str) -> Result<S3BucketRecord> {
        self.ctx
            .persistence
            .get_s3_bucket(&env.id, name)
            .await?
            .ok_or_else(|| no_such_bucket(name))
    }

    async fn backed(&self, env: &EnvironmentRecord, bucket: &S3BucketRecord) -> Result<()> {
        if bucket.backing_handle.is_none() {
            self.ctx
                .materializer
                .materialize_s3(&env.id, &bucket.id)
                .await?;
        }
        Ok(())
    }
}

fn no_such_bucket(name: &str) -> EmulatorError {
    EmulatorError::not_found(
        NO_SUCH_BUCKET,
        format!("The specified bucket does not exist: {name}"),
    )
}

fn validate_key(key: &str) -> Result<()> {
    if key.len() > MAX_KEY_BYTES {
        return Err(EmulatorError::validation("KeyTooLongError", "Your key is too long"));
    }
    Ok(())
}

/// Cut one page out of `objects`, which are sorted by key and already
/// restricted to the request prefix.
fn paginate(
    bucket: String,
    request: ListObjectsRequest,
    objects: Vec<S3ObjectRecord>,
) -> ObjectListing {
    let prefix_len = request.prefix.as_deref().map_or(0, str::len);
    let mut contents = Vec::new();
    let mut common_prefixes: Vec<String> = Vec::new();
    let mut last = None;
    let mut is_truncated = false;

    for object in objects {
        let key = object.object_key.as_str();
        if request.start_after.as_deref().is_some_and(|after| key <= after) {
            continue;
        }
        let rolled = request.delimiter.as_deref().and_then(|delimiter| {
            key.get(prefix_len..)
                .and_then(|rest| rest.find(delimiter))
                .map(|at| key[..prefix_len + at + delimiter.len()].to_string())
        });
        if let Some(common) = &rolled {
            // Already listed here or on an earlier page.
            if common_prefixes.last() == Some(common)
                || request
                    .start_after
                    .as_deref()
                    .is_some_and(|after| after >= common.as_str())
            {
                continue;
            }
        }
        if contents.len() + common_prefixes.len() >= request.max_keys {
            is_truncated = true;
            break;
        }
        match rolled {
            Some(common) => {
                last = Some(common.clone());
                common_prefixes.push(common);
            }
            None => {
                last = Some(object.object_key.clone());
                contents.push(object);
            }
        }
    }

    ObjectListing {
        bucket,
        request,
        contents,
        common_prefixes,
        is_truncated,
        next_marker: if is_truncated { last } else { None },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockcloud_protocol::s3::ListVersion;

    fn objects(keys: &[&str]) -> Vec<S3ObjectRecord> {
        keys.iter()
            .map(|key| S3ObjectRecord {
                bucket_id: "s3-1".to_string(),
                object_key: key.to_string(),
                body: Vec::new(),
                etag: etag(b""),
                content_type: "text/plain".to_string(),
                size_bytes: 0,
                updated_at: Utc::now(),
            })
            .collect()
    }

    fn request(max_keys: usize) -> ListObjectsRequest {
        ListObjectsRequest {
            version: ListVersion::V2,
            prefix: None,
            delimiter: None,
            max_keys,
            start_after: None,
            continuation_token: None,
        }
    }

    fn keys(listing: &ObjectListing) -> Vec<&str> {
        listing
            .contents
            .iter()
            .map(|o| o.object_key.as_str())
            .collect()
    }

    #[test]
    fn test_pages_resume_after_marker() {
        let all = ["a", "b", "c", "d", "e"];
        let first = paginate("b".into(), request(2), objects(&all));
        assert_eq!(keys(&first), ["a", "b"]);
        assert!(first.is_truncated);
        assert_eq!(first.next_marker.as_deref(), Some("b"));

        let mut next = request(10);
        next.start_after = first.next_marker.clone();
        let rest = paginate("b".into(), next, objects(&all));
        assert_eq!(keys(&rest), ["c", "d", "e"]);
        assert!(!rest.is_truncated);
        assert_eq!(rest.next_marker, None);
    }

    #[test]
    fn test_delimiter_rolls_up_common_prefixes() {
        let all = ["logs/2024/a", "logs/2024/b", "logs/2025/a", "logs/index", "readme"];
        let mut req = request(10);
        req.prefix = Some("logs/".into());
        req.delimiter = Some("/".into());
        let listing = paginate("b".into(), req, objects(&all[..4]));
        assert_eq!(listing.common_prefixes, ["logs/2024/", "logs/2025/"]);
        assert_eq!(keys(&listing), ["logs/index"]);
    }

    #[test]
    fn test_common_prefix_counts_toward_page() {
        let all = ["a/1", "a/2", "b", "c/1"];
        let mut req = request(2);
        req.delimiter = Some("/".into());
        let first = paginate("b".into(), req.clone(), objects(&all));
        assert_eq!(first.common_prefixes, ["a/"]);
        assert_eq!(keys(&first), ["b"]);
        assert_eq!(first.next_marker.as_deref(), Some("b"));

        req.start_after = Some("a/".into());
        let resumed = paginate("b".into(), req, objects(&all));
        // Keys under a prefix already returned are not listed again.
        assert!(!resumed.common_prefixes.contains(&"a/".to_string()));
        assert_eq!(keys(&resumed), ["b"]);
        assert_eq!(resumed.common_prefixes, ["c/"]);
    }

    #[test]
    fn test_long_keys_rejected() {
        assert!(validate_key(&"k".repeat(MAX_KEY_BYTES)).is_ok());
        assert_eq!(
            validate_key(&"k".repeat(MAX_KEY_BYTES + 1))
                .unwrap_err()
                .code(),
            "KeyTooLongError"
        );
    }
}
