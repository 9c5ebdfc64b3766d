//! Retrying storage backend.
//!
//! Wraps another backend and retries transient failures (see
//! [`ErrorKind::is_retryable`](crate::error::ErrorKind::is_retryable)) with
//! exponential back-off. Streams and the bodies of streaming readers and
//! writers are passed through untouched; only opening them is retried.

use crate::backend::{BlobInfoStream, BoxSyncRead, BoxSyncWrite};
use crate::error::Result;
use crate::{BlobHandle, BlobInfo, BlobStore, Folder, StorageTier};
use async_trait::async_trait;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on every retry after that.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based).
    fn delay(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << retry.saturating_sub(1).min(16))
    }
}

/// Retries transient failures of the wrapped backend.
#[derive(Clone)]
pub struct RetryBackend {
    inner: BlobHandle,
    policy: RetryPolicy,
}
impl RetryBackend {
    pub fn new(inner: BlobHandle, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn run<T, F, Fut>(&self, operation: &'static str, key: &Path, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay(attempt);
                    tracing::warn!(
                        backend = self.inner.name(),
                        operation,
                        key = %key.display(),
                        attempt,
                        ?delay,
                        error = %&*err,
                        "Retrying storage operation"
                    );
                    drop(err);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl BlobStore for RetryBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn verify(&self) -> Result<()> {
        self.run("verify", Path::new(""), || self.inner.verify()).await
    }

    fn list_stream<'a>(&'a self, folder: Folder) -> BlobInfoStream<'a> {
        self.inner.list_stream(folder)
    }

    async fn list(&self, folder: Folder) -> Result<Vec<BlobInfo>> {
        self.run("list", Path::new(folder.prefix()), || self.inner.list(folder)).await
    }

    async fn exists(&self, key: &Path) -> Result<bool> {
        self.run("exists", key, || self.inner.exists(key)).await
    }

    async fn read(&self, key: &Path) -> Result<Vec<u8>> {
        self.run("read", key, || self.inner.read(key)).await
    }

    async fn reader(&self, key: &Path) -> Result<BoxSyncRead> {
        self.run("reader", key, || self.inner.reader(key)).await
    }

    async fn write(&self, key: &Path, data: &[u8], tier: StorageTier) -> Result<()> {
        self.run("write", key, || self.inner.write(key, data, tier)).await
    }

    async fn writer(&self, key: &Path, tier: StorageTier) -> Result<BoxSyncWrite> {
        self.run("writer", key, || self.inner.writer(key, tier)).await
    }

    async fn delete(&self, key: &Path) -> Result<()> {
        self.run("delete", key, || self.inner.delete(key)).await
    }

    async fn stat(&self, key: &Path) -> Result<BlobInfo> {
        self.run("stat", key, || self.inner.stat(key)).await
    }

    async fn set_tier(&self, key: &Path, tier: StorageTier) -> Result<()> {
        self.run("set_tier", key, || self.inner.set_tier(key, tier)).await
    }

    async fn rehydrate(&self, key: &Path, tier: StorageTier) -> Result<()> {
        self.run("rehydrate", key, || self.inner.rehydrate(key, tier)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` reads with the given error, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        kind: fn() -> ErrorKind,
    }

    #[async_trait]
    impl BlobStore for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn verify(&self) -> Result<()> {
            Ok(())
        }
        fn list_stream<'a>(&'a self, _folder: Folder) -> BlobInfoStream<'a> {
            Box::pin(futures::stream::empty())
        }
        async fn exists(&self, _key: &Path) -> Result<bool> {
            Ok(true)
        }
        async fn read(&self, _key: &Path) -> Result<Vec<u8>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                exn::bail!((self.kind)());
            }
            Ok(b"payload".to_vec())
        }
        async fn reader(&self, key: &Path) -> Result<BoxSyncRead> {
            Ok(Box::new(std::io::Cursor::new(self.read(key).await?)))
        }
        async fn write(&self, _key: &Path, _data: &[u8], _tier: StorageTier) -> Result<()> {
            Ok(())
        }
        async fn writer(&self, _key: &Path, _tier: StorageTier) -> Result<BoxSyncWrite> {
            Ok(Box::new(std::io::sink()))
        }
        async fn delete(&self, _key: &Path) -> Result<()> {
            Ok(())
        }
        async fn stat(&self, key: &Path) -> Result<BlobInfo> {
            exn::bail!(ErrorKind::NotFound(key.to_path_buf()))
        }
        async fn set_tier(&self, _key: &Path, _tier: StorageTier) -> Result<()> {
            Ok(())
        }
        async fn rehydrate(&self, _key: &Path, _tier: StorageTier) -> Result<()> {
            Ok(())
        }
    }

    fn flaky(failures: u32, kind: fn() -> ErrorKind) -> Arc<Flaky> {
        Arc::new(Flaky {
            failures,
            calls: AtomicU32::new(0),
            kind,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors() {
        let inner = flaky(3, || ErrorKind::Network("reset".into()));
        let backend = RetryBackend::new(inner.clone(), RetryPolicy::default());
        assert_eq!(backend.read(Path::new("chunks/a")).await.unwrap(), b"payload");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let inner = flaky(10, || ErrorKind::Network("reset".into()));
        let backend = RetryBackend::new(inner.clone(), RetryPolicy::default());
        let err = backend.read(Path::new("chunks/a")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Network(_)));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let inner = flaky(1, || ErrorKind::Archived("chunks/a".into()));
        let backend = RetryBackend::new(inner.clone(), RetryPolicy::default());
        let err = backend.read(Path::new("chunks/a")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Archived(_)));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delay_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
    }
}
