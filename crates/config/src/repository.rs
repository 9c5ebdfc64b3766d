use crate::error::{ErrorKind, Result};
use arca_crypto::{ContentHasher, Passphrase};
use arca_storage::BlobHandle;
use arca_storage::backend::{LocalBackend, RetryBackend, RetryPolicy};
use directories::ProjectDirs;
use exn::{OptionExt, ResultExt};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// A credential that is never printed.
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);
impl Secret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// Where the container lives.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// A directory standing in for the container.
    Local { path: PathBuf },
    /// An S3-compatible bucket.
    S3 {
        bucket: String,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default = "default_region")]
        region: String,
        #[serde(default)]
        endpoint: Option<String>,
        key_id: String,
        key_secret: Secret,
    },
}

impl BackendConfig {
    /// Stable description of the container, without credentials.
    fn location(&self) -> String {
        match self {
            Self::Local { path } => format!("local:{}", path.display()),
            Self::S3 {
                bucket,
                prefix,
                endpoint,
                ..
            } => format!(
                "s3:{}/{bucket}/{}",
                endpoint.as_deref().unwrap_or("aws"),
                prefix.as_deref().unwrap_or_default()
            ),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}
impl Default for RetryOptions {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: u64::try_from(policy.base_delay.as_millis()).unwrap_or(u64::MAX),
        }
    }
}
impl RetryOptions {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
        }
    }
}

/// The container, its passphrase and the local snapshot cache.
#[derive(Clone, Debug, Deserialize)]
pub struct RepositoryConfig {
    pub backend: BackendConfig,
    pub passphrase: Passphrase,
    /// Root of the local state snapshot cache. Defaults to the platform
    /// cache directory.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub retry: RetryOptions,
}

impl RepositoryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.passphrase.is_empty() {
            exn::bail!(ErrorKind::Invalid("passphrase must not be empty".to_string()));
        }
        if self.retry.max_attempts == 0 {
            exn::bail!(ErrorKind::Invalid("retry.max_attempts must be at least 1".to_string()));
        }
        match &self.backend {
            BackendConfig::Local { path } if !path.is_absolute() => {
                exn::bail!(ErrorKind::Invalid(format!("local backend path must be absolute: {}", path.display())))
            },
            BackendConfig::S3 { bucket, .. } if bucket.is_empty() => {
                exn::bail!(ErrorKind::Invalid("s3 bucket must not be empty".to_string()))
            },
            _ => Ok(()),
        }
    }

    /// Snapshot cache for this container.
    ///
    /// Each container gets its own subdirectory, named after a digest of its
    /// location, so one cache root can serve several repositories.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        let root = match &self.cache_dir {
            Some(dir) => dir.clone(),
            None => ProjectDirs::from("", "", "arca")
                .map(|dirs| dirs.cache_dir().join("states"))
                .ok_or_raise(|| ErrorKind::NoCacheDir)?,
        };
        let digest = ContentHasher::new(&Passphrase::new("arca-cache")).hash_bytes(self.backend.location().as_bytes());
        Ok(root.join(&digest.to_string()[..16]))
    }

    /// Open the configured container, wrapped in the retry policy.
    pub async fn open_store(&self) -> Result<BlobHandle> {
        let store: BlobHandle = match &self.backend {
            BackendConfig::Local { path } => {
                Arc::new(LocalBackend::new("local", path).or_raise(|| ErrorKind::Backend)?)
            },
            #[cfg(feature = "s3")]
            BackendConfig::S3 {
                bucket,
                prefix,
                region,
                endpoint,
                key_id,
                key_secret,
            } => Arc::new(
                arca_storage::backend::S3Backend::new(
                    "s3",
                    bucket,
                    prefix.clone(),
                    region,
                    endpoint.clone(),
                    key_id,
                    key_secret.expose(),
                )
                .await
                .or_raise(|| ErrorKind::Backend)?,
            ),
            #[cfg(not(feature = "s3"))]
            BackendConfig::S3 { .. } => {
                exn::bail!(ErrorKind::Invalid("built without S3 support".to_string()))
            },
        };
        Ok(Arc::new(RetryBackend::new(store, self.retry.policy())))
    }

    /// Log the reviewed, secret-free subset of this configuration.
    pub fn log_fields(&self) {
        let cache_dir = self.cache_dir.as_ref().map(|dir| dir.display().to_string());
        match &self.backend {
            BackendConfig::Local { path } => {
                tracing::info!(backend = "local", path = %path.display(), ?cache_dir, "Repository configuration")
            },
            BackendConfig::S3 {
                bucket,
                prefix,
                region,
                endpoint,
                ..
            } => tracing::info!(
                backend = "s3",
                %bucket,
                ?prefix,
                %region,
                ?endpoint,
                ?cache_dir,
                "Repository configuration"
            ),
        }
    }
}
