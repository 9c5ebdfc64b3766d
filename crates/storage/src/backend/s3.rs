//! S3-compatible storage backend.
//!
//! This module provides a storage backend implementation for S3-compatible
//! services including AWS S3, Backblaze B2, Tigris (Fly.io), and others.
//!
//! # Tiers
//!
//! | Tier                        | Storage class  | Readable        |
//! |-----------------------------|----------------|-----------------|
//! | [`StorageTier::Hot`]        | `STANDARD`     | yes             |
//! | [`StorageTier::Cool`]       | `STANDARD_IA`  | yes             |
//! | [`StorageTier::Cold`]       | `GLACIER_IR`   | yes             |
//! | [`StorageTier::Archive`]    | `DEEP_ARCHIVE` | after a restore |
//!
//! Services that only know `STANDARD` reject the other classes; use the hot
//! tier with them.
//!
//! # Credentials
//!
//! Credentials are provided explicitly via the configuration file.

use crate::{
    BlobInfo, BlobStore, Folder, StorageTier,
    backend::{BlobInfoStream, BoxSyncRead, BoxSyncWrite},
    error::{ErrorKind, Result},
    validate_path,
};
use async_stream::stream;
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Credentials, Region, retry::RetryConfig},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::{ByteStream, DateTime},
    types::{GlacierJobParameters, MetadataDirective, RestoreRequest, StorageClass, Tier},
};
use exn::{OptionExt, ResultExt};
use std::fmt::Debug;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{OffsetDateTime, UtcDateTime};
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::io::SyncIoBridge;

/// Generous default for concurrent S3 requests.
const DEFAULT_CONCURRENT_REQUESTS: usize = 100;
/// How long a restored copy of an archived object stays readable.
const RESTORE_DAYS: i32 = 7;

/// S3-compatible storage backend.
///
/// Stores blobs in an S3 bucket, optionally under a key prefix. All keys are
/// relative to the configured prefix (if any).
///
/// # Examples
///
/// ```no_run
/// use arca_storage::backend::S3Backend;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = S3Backend::new(
///     "offsite",
///     "my-bucket",
///     Some("arca/".to_string()),
///     "us-west-004",
///     Some("https://s3.us-west-004.backblazeb2.com".to_string()),
///     "access_key_id",
///     "secret_access_key",
/// ).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct S3Backend {
    name: String,
    client: Client,
    bucket: String,
    prefix: Option<String>,
    /// Rate limiter for concurrent S3 requests.
    rate_limiter: Arc<Semaphore>,
}

impl S3Backend {
    /// Create a new S3 storage backend.
    ///
    /// # Arguments
    /// * `name` - A name for this backend (used in display/logging)
    /// * `bucket` - S3 bucket name
    /// * `prefix` - Optional key prefix (acts as virtual directory)
    /// * `region` - AWS region or provider-specific region (e.g., "us-west-004" for Backblaze)
    /// * `endpoint` - Custom endpoint URL for S3-compatible services
    /// * `key_id` - AWS/provider access key ID
    /// * `key_secret` - AWS/provider secret access key
    pub async fn new(
        name: impl Into<String>,
        bucket: impl Into<String>,
        prefix: Option<String>,
        region: impl Into<String>,
        endpoint: Option<impl Into<String>>,
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
    ) -> Result<Self> {
        let prefix = prefix
            .map(validate_path)
            .transpose()?
            .map(|p| p.to_str().map(|s| s.to_string()).ok_or_raise(|| ErrorKind::InvalidPath(p)))
            .transpose()?;
        let name = name.into();
        let bucket = bucket.into();
        let region = Region::new(region.into());
        let credentials = Credentials::new(key_id, key_secret, None, None, "arca-config");
        let mut config_builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(region)
            // Configure retry policy with exponential backoff (1 initial + 3 retries)
            .retry_config(RetryConfig::standard().with_max_attempts(4))
            // Use path-style addressing for better compatibility with
            // S3-compatible services (Backblaze, MinIO, etc.)
            .force_path_style(true);
        // Set custom endpoint for non-AWS services
        if let Some(endpoint_url) = endpoint {
            config_builder = config_builder.endpoint_url(endpoint_url);
        }
        let client = Client::from_conf(config_builder.build());
        let rate_limiter = Arc::new(Semaphore::new(DEFAULT_CONCURRENT_REQUESTS));
        Ok(Self {
            name,
            client,
            bucket,
            prefix,
            rate_limiter,
        })
    }

    /// Construct the full S3 key from a blob key.
    fn full_key(&self, key: &Path) -> Result<String> {
        let validated = validate_path(key)?;
        let key_str = validated.to_str().ok_or_raise(|| ErrorKind::InvalidPath(validated.clone()))?;
        Ok(match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), key_str),
            None => key_str.to_string(),
        })
    }

    /// Strip the configured prefix from an S3 key to get the blob key.
    fn relative_path(&self, key: &str) -> Result<PathBuf> {
        let relative = match &self.prefix {
            Some(prefix) => {
                let prefix_normalized = prefix.trim_end_matches('/');
                key.strip_prefix(prefix_normalized).and_then(|s| s.strip_prefix('/')).unwrap_or(key)
            },
            None => key,
        };
        validate_path(relative)
    }

    /// Acquire a rate limiter permit before making an S3 API call.
    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.rate_limiter)
            .acquire_owned()
            .await
            .or_raise(|| ErrorKind::BackendError("S3 rate limiter closed".to_string()))
    }

    fn parse_datetime(dt: Option<&DateTime>) -> UtcDateTime {
        dt.and_then(|dt| OffsetDateTime::from_unix_timestamp_nanos(dt.as_nanos()).ok())
            .map(OffsetDateTime::to_utc)
            .unwrap_or(UtcDateTime::UNIX_EPOCH)
    }

    fn storage_class(tier: StorageTier) -> StorageClass {
        match tier {
            StorageTier::Hot => StorageClass::Standard,
            StorageTier::Cool => StorageClass::StandardIa,
            StorageTier::Cold => StorageClass::GlacierIr,
            StorageTier::Archive => StorageClass::DeepArchive,
        }
    }

    /// A missing storage class means `STANDARD`.
    fn tier_of(storage_class: Option<&str>) -> StorageTier {
        match storage_class {
            None | Some("STANDARD") | Some("REDUCED_REDUNDANCY") | Some("INTELLIGENT_TIERING") => StorageTier::Hot,
            Some("STANDARD_IA") | Some("ONEZONE_IA") => StorageTier::Cool,
            Some("GLACIER_IR") => StorageTier::Cold,
            Some("GLACIER") | Some("DEEP_ARCHIVE") => StorageTier::Archive,
            Some(other) => {
                tracing::debug!(storage_class = other, "Unknown S3 storage class, assuming hot");
                StorageTier::Hot
            },
        }
    }

    /// Map what is left after the caller has handled the service errors it
    /// expects (no such key, invalid object state, ...).
    fn map_sdk_error<E, R>(err: SdkError<E, R>, key: &Path) -> ErrorKind
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
        R: Debug + Send + Sync + 'static,
    {
        match &err {
            SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
                ErrorKind::Network(DisplayErrorContext(&err).to_string())
            },
            _ => match err.code() {
                Some("AccessDenied") | Some("InvalidAccessKeyId") | Some("SignatureDoesNotMatch") => {
                    ErrorKind::PermissionDenied(key.to_path_buf())
                },
                Some("NoSuchBucket") => ErrorKind::Unreachable(DisplayErrorContext(&err).to_string()),
                _ => ErrorKind::BackendError(DisplayErrorContext(&err).to_string()),
            },
        }
    }

    async fn get(&self, key: &Path) -> Result<aws_sdk_s3::operation::get_object::GetObjectOutput> {
        let full_key = self.full_key(key)?;
        let _permit = self.acquire_permit().await?;
        match self.client.get_object().bucket(&self.bucket).key(&full_key).send().await {
            Ok(output) => Ok(output),
            Err(err) => match err.as_service_error() {
                Some(service) if service.is_no_such_key() => exn::bail!(ErrorKind::NotFound(key.to_path_buf())),
                Some(service) if service.is_invalid_object_state() => {
                    exn::bail!(ErrorKind::Archived(key.to_path_buf()))
                },
                _ => exn::bail!(Self::map_sdk_error(err, key)),
            },
        }
    }
}

/// Buffers everything and uploads the blob on `flush()`.
struct S3Writer {
    client: Client,
    bucket: String,
    full_key: String,
    key: PathBuf,
    storage_class: StorageClass,
    buffer: Vec<u8>,
    handle: Handle,
}

impl Write for S3Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.full_key)
            .storage_class(self.storage_class.clone())
            .body(ByteStream::from(self.buffer.clone()));
        match self.handle.block_on(request.send()) {
            Ok(_) => Ok(()),
            Err(err) => Err(io::Error::other(S3Backend::map_sdk_error(err, &self.key))),
        }
    }
}

#[async_trait]
impl BlobStore for S3Backend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn verify(&self) -> Result<()> {
        let _permit = self.acquire_permit().await?;
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(()),
            Err(err) => {
                let reason = DisplayErrorContext(&err).to_string();
                exn::bail!(ErrorKind::Unreachable(format!("{}: {reason}", self.bucket)))
            },
        }
    }

    fn list_stream<'a>(&'a self, folder: Folder) -> BlobInfoStream<'a> {
        let prefix = match self.full_key(Path::new(folder.prefix())) {
            Ok(prefix) => format!("{prefix}/"),
            Err(e) => return Box::pin(futures::stream::once(async { Err(e) })),
        };

        Box::pin(stream! {
            let mut pages = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .into_paginator()
                .send();
            while let Some(page) = pages.next().await {
                let page = match page {
                    Ok(page) => page,
                    Err(err) => {
                        yield Err(exn::Exn::from(Self::map_sdk_error(err, Path::new(folder.prefix()))));
                        break;
                    },
                };
                for object in page.contents() {
                    let Some(full_key) = object.key() else { continue };
                    let key = match self.relative_path(full_key) {
                        Ok(key) => key,
                        Err(e) => { yield Err(e); continue; },
                    };
                    let tier = Self::tier_of(object.storage_class().map(|class| class.as_str()));
                    let size = object.size().unwrap_or_default().max(0) as u64;
                    yield Ok(BlobInfo::new(key, size, Self::parse_datetime(object.last_modified()), tier));
                }
            }
        })
    }

    async fn exists(&self, key: &Path) -> Result<bool> {
        match self.stat(key).await {
            Ok(_) => Ok(true),
            Err(err) if matches!(&*err, ErrorKind::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn read(&self, key: &Path) -> Result<Vec<u8>> {
        let output = self.get(key).await?;
        let data = output
            .body
            .collect()
            .await
            .or_raise(|| ErrorKind::Network(format!("reading body of {}", key.display())))?;
        Ok(data.into_bytes().to_vec())
    }

    async fn reader(&self, key: &Path) -> Result<BoxSyncRead> {
        let output = self.get(key).await?;
        Ok(Box::new(SyncIoBridge::new(Box::pin(output.body.into_async_read()))))
    }

    async fn write(&self, key: &Path, data: &[u8], tier: StorageTier) -> Result<()> {
        let full_key = self.full_key(key)?;
        let _permit = self.acquire_permit().await?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .storage_class(Self::storage_class(tier))
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|err| Self::map_sdk_error(err, key))?;
        Ok(())
    }

    async fn writer(&self, key: &Path, tier: StorageTier) -> Result<BoxSyncWrite> {
        Ok(Box::new(S3Writer {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            full_key: self.full_key(key)?,
            key: key.to_path_buf(),
            storage_class: Self::storage_class(tier),
            buffer: Vec::new(),
            handle: Handle::current(),
        }))
    }

    async fn delete(&self, key: &Path) -> Result<()> {
        // S3 deletes are idempotent; keep NotFound consistent with the other
        // backends.
        if !self.exists(key).await? {
            exn::bail!(ErrorKind::NotFound(key.to_path_buf()));
        }
        let full_key = self.full_key(key)?;
        let _permit = self.acquire_permit().await?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|err| Self::map_sdk_error(err, key))?;
        Ok(())
    }

    async fn stat(&self, key: &Path) -> Result<BlobInfo> {
        let full_key = self.full_key(key)?;
        let _permit = self.acquire_permit().await?;
        let output = match self.client.head_object().bucket(&self.bucket).key(&full_key).send().await {
            Ok(output) => output,
            Err(err) => match err.as_service_error() {
                Some(service) if service.is_not_found() => exn::bail!(ErrorKind::NotFound(key.to_path_buf())),
                _ => exn::bail!(Self::map_sdk_error(err, key)),
            },
        };
        let tier = Self::tier_of(output.storage_class().map(|class| class.as_str()));
        let size = output.content_length().unwrap_or_default().max(0) as u64;
        let rehydrating = output.restore().is_some_and(|restore| restore.contains("ongoing-request=\"true\""));
        Ok(BlobInfo::new(validate_path(key)?, size, Self::parse_datetime(output.last_modified()), tier)
            .with_rehydrating(rehydrating))
    }

    async fn set_tier(&self, key: &Path, tier: StorageTier) -> Result<()> {
        let current = self.stat(key).await?;
        if current.tier == tier {
            return Ok(());
        }
        if !current.tier.is_online() {
            return self.rehydrate(key, tier).await;
        }
        let full_key = self.full_key(key)?;
        let _permit = self.acquire_permit().await?;
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .copy_source(format!("{}/{}", self.bucket, full_key))
            .metadata_directive(MetadataDirective::Copy)
            .storage_class(Self::storage_class(tier))
            .send()
            .await
            .map_err(|err| Self::map_sdk_error(err, key))?;
        tracing::debug!(key = %key.display(), %tier, "Changed storage class");
        Ok(())
    }

    async fn rehydrate(&self, key: &Path, tier: StorageTier) -> Result<()> {
        let full_key = self.full_key(key)?;
        let job = GlacierJobParameters::builder()
            .tier(Tier::Standard)
            .build()
            .or_raise(|| ErrorKind::BackendError("invalid restore parameters".to_string()))?;
        let request = RestoreRequest::builder().days(RESTORE_DAYS).glacier_job_parameters(job).build();
        let _permit = self.acquire_permit().await?;
        match self
            .client
            .restore_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .restore_request(request)
            .send()
            .await
        {
            Ok(_) => {
                tracing::info!(key = %key.display(), %tier, "Requested rehydration");
                Ok(())
            },
            Err(err) => match err.as_service_error() {
                Some(service) if service.is_object_already_in_active_tier_error() => Ok(()),
                Some(service) if service.code() == Some("RestoreAlreadyInProgress") => Ok(()),
                Some(service) if service.code() == Some("NoSuchKey") => {
                    exn::bail!(ErrorKind::NotFound(key.to_path_buf()))
                },
                _ => exn::bail!(Self::map_sdk_error(err, key)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    async fn backend(prefix: Option<&str>) -> S3Backend {
        S3Backend::new(
            "test",
            "bucket",
            prefix.map(str::to_string),
            "us-east-1",
            Some("http://localhost:9000"),
            "key",
            "secret",
        )
        .await
        .unwrap()
    }

    #[rstest]
    #[case::without_prefix(None, "chunks/abc")]
    #[case::with_prefix(Some("arca"), "arca/chunks/abc")]
    #[case::with_trailing_slash_prefix(Some("arca/"), "arca/chunks/abc")]
    #[case::nested_prefix(Some("backups/arca"), "backups/arca/chunks/abc")]
    #[tokio::test]
    async fn test_full_key(#[case] prefix: Option<&str>, #[case] expected: &str) {
        let backend = backend(prefix).await;
        assert_eq!(backend.full_key(Path::new("chunks/abc")).unwrap(), expected);
    }

    #[rstest]
    #[case::without_prefix(None, "states/v1")]
    #[case::with_prefix(Some("arca"), "arca/states/v1")]
    #[case::with_trailing_slash_prefix(Some("arca/"), "arca/states/v1")]
    #[tokio::test]
    async fn test_relative_path(#[case] prefix: Option<&str>, #[case] key: &str) {
        let backend = backend(prefix).await;
        assert_eq!(backend.relative_path(key).unwrap(), Path::new("states/v1"));
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let backend = backend(Some("arca")).await;
        assert!(backend.full_key(Path::new("../other/chunks/abc")).is_err());
    }

    #[rstest]
    #[case::hot(StorageTier::Hot)]
    #[case::cool(StorageTier::Cool)]
    #[case::cold(StorageTier::Cold)]
    #[case::archive(StorageTier::Archive)]
    fn test_storage_class_round_trip(#[case] tier: StorageTier) {
        let class = S3Backend::storage_class(tier);
        assert_eq!(S3Backend::tier_of(Some(class.as_str())), tier);
    }

    #[rstest]
    #[case::missing(None, StorageTier::Hot)]
    #[case::one_zone(Some("ONEZONE_IA"), StorageTier::Cool)]
    #[case::flexible_glacier(Some("GLACIER"), StorageTier::Archive)]
    #[case::unknown(Some("SOMETHING_NEW"), StorageTier::Hot)]
    fn test_tier_of_other_classes(#[case] class: Option<&str>, #[case] expected: StorageTier) {
        assert_eq!(S3Backend::tier_of(class), expected);
    }
}
