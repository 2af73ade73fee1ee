// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lazy materialization of emulated resources.
//!
//! Defining a table, queue, function or VPC only writes a row. The real
//! object behind it is created here, on first data-plane use, through
//! [`Provisioner::ensure_backing`], and the handle name is recorded on the
//! resource row.
//!
//! | Resource       | Handle name        | Backing object                           |
//! |----------------|--------------------|------------------------------------------|
//! | DynamoDB table | `dynamodb`         | `amazon/dynamodb-local` on port 8000     |
//! | SQS queue      | `elasticmq`        | `softwaremill/elasticmq` on port 9324    |
//! | S3 bucket      | `minio`            | `minio/minio` on port 9000               |
//! | Lambda function| `lambda:{name}`    | runtime image on port 8080               |
//! | VPC            | `vpc:{vpc_id}`     | VCN                                      |
//! | Subnet         | `subnet:{id}`      | subnet under the VPC's VCN               |
//! | Gateway        | `igw:{id}`         | internet gateway in the VPC's VCN        |
//! | Security group | `nsg:{id}`         | NSG in the VPC's VCN                     |

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use mockcloud_core::Persistence;
use mockcloud_core::persistence::{BackingHandleRecord, LambdaFunctionRecord, ResourceTable};
use mockcloud_protocol::lambda::runtime_image;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::provisioner::{
    BackingSpec, ContainerBacking, PORT_PLACEHOLDER, ProvisionError, Provisioner, Result,
};
use crate::runner::Mount;

/// Handle name of the shared DynamoDB backing container.
pub const DYNAMODB_HANDLE: &str = "dynamodb";

/// Handle name of the shared queue backing container.
pub const ELASTICMQ_HANDLE: &str = "elasticmq";

/// Handle name of the shared object store container.
pub const MINIO_HANDLE: &str = "minio";

/// Runtime interface path of Lambda base images.
pub const LAMBDA_INVOKE_PATH: &str = "/2015-03-31/functions/function/invocations";

/// Handle name of a function's runtime container.
pub fn lambda_handle(function_name: &str) -> String {
    format!("lambda:{function_name}")
}

/// Handle name of a VPC's VCN.
pub fn vpc_handle(vpc_id: &str) -> String {
    format!("vpc:{vpc_id}")
}

/// Creates backing objects for emulated resources on first use.
#[derive(Clone)]
pub struct Materializer {
    provisioner: Provisioner,
    persistence: Arc<dyn Persistence>,
    data_dir: PathBuf,
}

impl Materializer {
    /// Create a materializer extracting Lambda code under `data_dir`.
    pub fn new(
        provisioner: Provisioner,
        persistence: Arc<dyn Persistence>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            provisioner,
            persistence,
            data_dir: data_dir.into(),
        }
    }

    /// The provisioner backing objects are created through.
    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    fn http_endpoint(&self, path: &str) -> String {
        format!(
            "http://{}:{PORT_PLACEHOLDER}{path}",
            self.provisioner.config().backing_host
        )
    }

    fn shared_container(
        &self,
        environment_id: &str,
        handle: &str,
        image: &str,
        container_port: u16,
    ) -> BackingSpec {
        BackingSpec::Container(ContainerBacking {
            container_name: format!("{environment_id}-{handle}"),
            image: image.to_string(),
            container_port,
            env: HashMap::new(),
            command: None,
            mounts: Vec::new(),
            endpoint_template: Some(self.http_endpoint("")),
        })
    }

    /// Back a table with the environment's DynamoDB container.
    pub async fn materialize_dynamodb(
        &self,
        environment_id: &str,
        table_id: &str,
    ) -> Result<BackingHandleRecord> {
        let spec = self.shared_container(
            environment_id,
            DYNAMODB_HANDLE,
            "amazon/dynamodb-local:latest",
            8000,
        );
        let handle = self
            .provisioner
            .ensure_backing(environment_id, DYNAMODB_HANDLE, spec)
            .await?;
        self.attach(ResourceTable::DynamoTable, table_id, DYNAMODB_HANDLE)
            .await?;
        Ok(handle)
    }

    /// Back a queue with the environment's ElasticMQ container.
    pub async fn materialize_sqs(
        &self,
        environment_id: &str,
        queue_id: &str,
    ) -> Result<BackingHandleRecord> {
        let spec = self.shared_container(
            environment_id,
            ELASTICMQ_HANDLE,
            "softwaremill/elasticmq:latest",
            9324,
        );
        let handle = self
            .provisioner
            .ensure_backing(environment_id, ELASTICMQ_HANDLE, spec)
            .await?;
        self.attach(ResourceTable::SqsQueue, queue_id, ELASTICMQ_HANDLE)
            .await?;
        Ok(handle)
    }

    /// Back a bucket with the environment's MinIO container.
    pub async fn materialize_s3(
        &self,
        environment_id: &str,
        bucket_id: &str,
    ) -> Result<BackingHandleRecord> {
        let mut spec = self.shared_container(
            environment_id,
            MINIO_HANDLE,
            "minio/minio:latest",
            9000,
        );
        if let BackingSpec::Container(container) = &mut spec {
            container.command = Some(vec!["server".to_string(), "/data".to_string()]);
            container.env = HashMap::from([
                ("MINIO_ROOT_USER".to_string(), "mockcloud".to_string()),
                ("MINIO_ROOT_PASSWORD".to_string(), format!("{environment_id}-minio")),
            ]);
        }
        let handle = self
            .provisioner
            .ensure_backing(environment_id, MINIO_HANDLE, spec)
            .await?;
        self.attach(ResourceTable::S3Bucket, bucket_id, MINIO_HANDLE)
            .await?;
        Ok(handle)
    }

    /// Start the function's runtime container with its code mounted at
    /// `/var/task`. The handle endpoint is the runtime interface URL.
    pub async fn materialize_lambda(
        &self,
        function: &LambdaFunctionRecord,
    ) -> Result<BackingHandleRecord> {
        let name = lambda_handle(&function.name);
        if let Some(handle) = self
            .persistence
            .get_backing_handle(&function.environment_id, &name)
            .await?
            && handle.state == "live"
        {
            return Ok(handle);
        }

        let code_dir = stage_code(
            &function.code_zip,
            &function.code_sha256,
            &self.code_dir(&function.id),
        )
        .await
        .map_err(|reason| ProvisionError::MaterializationFailed {
            name: name.clone(),
            reason,
        })?;

        let mut env: HashMap<String, String> =
            serde_json::from_str(&function.environment_vars).unwrap_or_default();
        env.insert(
            "AWS_LAMBDA_FUNCTION_NAME".to_string(),
            function.name.clone(),
        );
        env.insert(
            "AWS_LAMBDA_FUNCTION_MEMORY_SIZE".to_string(),
            function.memory_size.to_string(),
        );

        let spec = BackingSpec::Container(ContainerBacking {
            container_name: format!(
                "{}-lambda-{}",
                function.environment_id,
                function.name.to_ascii_lowercase()
            ),
            image: runtime_image(&function.runtime).to_string(),
            container_port: 8080,
            env,
            command: Some(vec![function.handler.clone()]),
            mounts: vec![Mount {
                source: code_dir.to_string_lossy().into_owned(),
                target: "/var/task".to_string(),
                read_only: true,
            }],
            endpoint_template: Some(self.http_endpoint(LAMBDA_INVOKE_PATH)),
        });

        let handle = self
            .provisioner
            .ensure_backing(&function.environment_id, &name, spec)
            .await?;
        self.attach(ResourceTable::LambdaFunction, &function.id, &name)
            .await?;
        Ok(handle)
    }

    /// Drop the function's warm container and extracted code so the next
    /// invoke starts from the current package.
    pub async fn invalidate_lambda(&self, function: &LambdaFunctionRecord) -> Result<()> {
        let name = lambda_handle(&function.name);
        let released = self
            .provisioner
            .release_backing(&function.environment_id, &name)
            .await?;
        self.persistence
            .detach_backing_handle(ResourceTable::LambdaFunction, &function.id)
            .await?;

        let code_dir = self.code_dir(&function.id);
        if let Err(e) = tokio::fs::remove_dir_all(&code_dir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %code_dir.display(), error = %e, "Failed to remove function code");
        }

        if released {
            info!(function = %function.name, "Function container invalidated");
        }
        Ok(())
    }

    /// Create the VPC's VCN.
    pub async fn materialize_vpc(
        &self,
        environment_id: &str,
        vpc_id: &str,
        cidr_block: &str,
    ) -> Result<BackingHandleRecord> {
        let name = vpc_handle(vpc_id);
        let handle = self
            .provisioner
            .ensure_backing(
                environment_id,
                &name,
                BackingSpec::Vcn {
                    display_name: format!("{environment_id}-{vpc_id}"),
                    cidr_block: cidr_block.to_string(),
                },
            )
            .await?;
        self.attach(ResourceTable::Vpc, vpc_id, &name).await?;
        Ok(handle)
    }

    /// Create a real subnet under the VPC's VCN.
    pub async fn materialize_subnet(
        &self,
        environment_id: &str,
        vpc_id: &str,
        subnet_id: &str,
        cidr_block: &str,
    ) -> Result<BackingHandleRecord> {
        let name = format!("subnet:{subnet_id}");
        let handle = self
            .provisioner
            .ensure_backing(
                environment_id,
                &name,
                BackingSpec::Subnet {
                    parent: vpc_handle(vpc_id),
                    display_name: format!("{environment_id}-{subnet_id}"),
                    cidr_block: cidr_block.to_string(),
                },
            )
            .await?;
        self.attach(ResourceTable::Vpc, subnet_id, &name).await?;
        Ok(handle)
    }

    /// Create a real internet gateway in the VPC's VCN.
    pub async fn materialize_internet_gateway(
        &self,
        environment_id: &str,
        vpc_id: &str,
        igw_id: &str,
    ) -> Result<BackingHandleRecord> {
        let name = format!("igw:{igw_id}");
        let handle = self
            .provisioner
            .ensure_backing(
                environment_id,
                &name,
                BackingSpec::InternetGateway {
                    parent: vpc_handle(vpc_id),
                    display_name: format!("{environment_id}-{igw_id}"),
                },
            )
            .await?;
        self.attach(ResourceTable::Vpc, igw_id, &name).await?;
        Ok(handle)
    }

    /// Create a real NSG for a security group in the VPC's VCN.
    pub async fn materialize_nsg(
        &self,
        environment_id: &str,
        vpc_id: &str,
        group_id: &str,
    ) -> Result<BackingHandleRecord> {
        let name = format!("nsg:{group_id}");
        let handle = self
            .provisioner
            .ensure_backing(
                environment_id,
                &name,
                BackingSpec::Nsg {
                    parent: vpc_handle(vpc_id),
                    display_name: format!("{environment_id}-{group_id}"),
                },
            )
            .await?;
        self.attach(ResourceTable::Vpc, group_id, &name).await?;
        Ok(handle)
    }

    /// Delete a materialized cloud object (and, for a VPC, every object
    /// under it). Unmaterialized resources are a no-op.
    pub async fn release(&self, environment_id: &str, handle_name: &str) -> Result<bool> {
        self.provisioner
            .release_backing(environment_id, handle_name)
            .await
    }

    async fn attach(&self, table: ResourceTable, id: &str, handle: &str) -> Result<()> {
        if self
            .persistence
            .attach_backing_handle(table, id, handle)
            .await?
        {
            debug!(resource = %id, handle = %handle, "Backing handle attached");
        }
        Ok(())
    }

    fn code_dir(&self, function_id: &str) -> PathBuf {
        self.data_dir.join("lambda").join(function_id)
    }
}

/// Unpack a package into `root/{digest}` and return that directory.
///
/// Each attempt extracts into its own staging directory and renames it into
/// place. A directory that is already there is never touched, so a racing
/// materialization cannot pull files out from under a running container.
async fn stage_code(
    code_zip: &str,
    code_sha256: &str,
    root: &Path,
) -> std::result::Result<PathBuf, String> {
    let target = root.join(package_tag(code_sha256));
    if tokio::fs::try_exists(&target).await.unwrap_or(false) {
        return Ok(target);
    }

    let staging = root.join(format!(".staging-{}", uuid::Uuid::new_v4().simple()));
    if let Err(e) = extract_code(code_zip, &staging).await {
        let _ = tokio::fs::remove_dir_all(&staging).await;
        return Err(e);
    }
    match tokio::fs::rename(&staging, &target).await {
        Ok(()) => Ok(target),
        Err(_) if tokio::fs::try_exists(&target).await.unwrap_or(false) => {
            // Another attempt won the rename.
            let _ = tokio::fs::remove_dir_all(&staging).await;
            Ok(target)
        }
        Err(e) => {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            Err(format!("failed to place package: {e}"))
        }
    }
}

/// Directory name for a package: the hex digest when the stored base64
/// SHA-256 decodes, otherwise its path-safe characters.
fn package_tag(code_sha256: &str) -> String {
    match BASE64.decode(code_sha256.trim()) {
        Ok(digest) if !digest.is_empty() => hex::encode(digest),
        _ => {
            let tag: String = code_sha256
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect();
            if tag.is_empty() { "package".to_string() } else { tag }
        }
    }
}

/// Decode a base64 deployment package and unpack it into `dest`.
async fn extract_code(code_zip: &str, dest: &Path) -> std::result::Result<(), String> {
    let bytes = BASE64
        .decode(code_zip.trim())
        .map_err(|e| format!("invalid base64 package: {e}"))?;
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || unzip(&bytes, &dest))
        .await
        .map_err(|e| format!("extraction task failed: {e}"))?
}

fn unzip(bytes: &[u8], dest: &Path) -> std::result::Result<(), String> {
    std::fs::create_dir_all(dest).map_err(|e| e.to_string())?;
    if bytes.is_empty() {
        return Ok(());
    }

    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| format!("invalid zip: {e}"))?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| e.to_string())?;
        // Entries escaping the destination are skipped.
        let Some(relative) = entry.enclosed_name() else {
            continue;
        };
        let path = dest.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&path).map_err(|e| e.to_string())?;
            continue;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        let mut out = std::fs::File::create(&path).map_err(|e| e.to_string())?;
        std::io::copy(&mut entry, &mut out).map_err(|e| e.to_string())?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
                .map_err(|e| e.to_string())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

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
    async fn test_extract_code() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("fn");
        let zip = package(&[
            ("index.py", "def handler(e, c): return e"),
            ("lib/util.py", "X = 1"),
        ]);

        extract_code(&zip, &dest).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dest.join("index.py")).unwrap(),
            "def handler(e, c): return e"
        );
        assert!(dest.join("lib/util.py").exists());
    }

    #[tokio::test]
    async fn test_new_package_gets_its_own_directory() {
        let dir = tempfile::tempdir().unwrap();
        let old = stage_code(&package(&[("old.py", "")]), "b2xk", dir.path())
            .await
            .unwrap();
        let new = stage_code(&package(&[("new.py", "")]), "bmV3", dir.path())
            .await
            .unwrap();
        assert_ne!(old, new);
        assert!(old.join("old.py").exists());
        assert!(new.join("new.py").exists());
        assert!(!new.join("old.py").exists());
    }

    #[tokio::test]
    async fn test_staged_code_is_never_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let zip = package(&[("index.py", "def handler(e, c): return e")]);
        let first = stage_code(&zip, "c2hh", dir.path()).await.unwrap();
        // A file a running container would see must survive a later attempt.
        std::fs::write(first.join("in-use"), "x").unwrap();

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let zip = zip.clone();
                let root = dir.path().to_path_buf();
                tokio::spawn(async move { stage_code(&zip, "c2hh", &root).await })
            })
            .collect();
        for attempt in attempts {
            assert_eq!(attempt.await.unwrap().unwrap(), first);
        }

        assert!(first.join("in-use").exists());
        assert!(first.join("index.py").exists());
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".staging-"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_racing_first_extractions_agree() {
        let dir = tempfile::tempdir().unwrap();
        let zip = package(&[("index.py", "X = 1")]);
        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let zip = zip.clone();
                let root = dir.path().to_path_buf();
                tokio::spawn(async move { stage_code(&zip, "cmFjZQ==", &root).await })
            })
            .collect();
        let mut dirs = Vec::new();
        for attempt in attempts {
            dirs.push(attempt.await.unwrap().unwrap());
        }
        dirs.dedup();
        assert_eq!(dirs.len(), 1);
        assert_eq!(
            std::fs::read_to_string(dirs[0].join("index.py")).unwrap(),
            "X = 1"
        );
        assert_eq!(package_tag("cmFjZQ=="), hex::encode(b"race"));
    }

    #[tokio::test]
    async fn test_invalid_package() {
        let dir = tempfile::tempdir().unwrap();
        assert!(extract_code("!!!", dir.path()).await.is_err());
        assert!(
            extract_code(&BASE64.encode(b"not a zip"), &dir.path().join("x"))
                .await
                .is_err()
        );
    }

    #[test]
    fn test_handle_names() {
        assert_eq!(lambda_handle("fn"), "lambda:fn");
        assert_eq!(vpc_handle("vpc-1"), "vpc:vpc-1");
    }
}
