//! Blob store trait and implementations.
//!
//! This module defines the [`BlobStore`] trait, which provides a unified
//! interface for tiered object storage across different backends (local
//! filesystem, S3-compatible services, an in-memory mock for tests).

mod local;
#[cfg(feature = "mock")]
mod mock;
mod retry;
#[cfg(feature = "s3")]
mod s3;

pub use self::local::LocalBackend;
#[cfg(feature = "mock")]
pub use self::mock::MockBackend;
pub use self::retry::{RetryBackend, RetryPolicy};
#[cfg(feature = "s3")]
pub use self::s3::S3Backend;
use crate::error::Result;
use crate::{BlobInfo, Folder, StorageTier};
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use std::io::{Read, Write};
use std::path::Path;
use std::pin::Pin;

pub type BlobInfoStream<'a> = Pin<Box<dyn Stream<Item = Result<BlobInfo>> + Send + 'a>>;
pub type BoxSyncRead = Box<dyn Read + Send + 'static>;
pub type BoxSyncWrite = Box<dyn Write + Send + 'static>;

/// Unified interface for blob storage.
///
/// A blob store is a single container of opaque, immutable-once-written
/// blobs addressed by keys such as `chunks/<hash>`. All operations are
/// asynchronous; the store may be shared by many workers at once (it holds
/// no per-call state).
///
/// # Keys
/// Keys are relative to the container root and must pass
/// [`validate_path`](crate::validate_path). Implementations enforce this.
///
/// # Tiers
/// Every write names the [`StorageTier`] to store the blob in. Reading a blob
/// whose tier is [`StorageTier::Archive`] fails with
/// [`Archived`](crate::error::ErrorKind::Archived); call
/// [`rehydrate()`](Self::rehydrate) and try again later.
///
/// # Examples
///
/// ```
/// use arca_storage::{BlobStore, Folder, StorageTier, error::Result};
///
/// async fn copy_state(store: &dyn BlobStore, from: &str, to: &str) -> Result<u64> {
///     let data = store.read(&Folder::States.key(from)).await?;
///     store.write(&Folder::States.key(to), &data, StorageTier::Hot).await?;
///     Ok(data.len() as u64)
/// }
/// ```
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Name of the configured backend, used for logging only.
    fn name(&self) -> &str;

    /// Check that the container exists and the credentials can reach it.
    ///
    /// Returns [`Unreachable`](crate::error::ErrorKind::Unreachable)
    /// otherwise. Called before a run makes any other remote call.
    async fn verify(&self) -> Result<()>;

    /// Stream metadata for every blob in `folder`, in no particular order.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use futures::TryStreamExt;
    /// use arca_storage::{BlobStore, Folder, error::Result};
    /// # async fn example(store: &dyn BlobStore) -> Result<()> {
    /// let mut stream = store.list_stream(Folder::Chunks);
    /// while let Some(info) = stream.try_next().await? {
    ///     println!("{}: {} bytes ({})", info.key.display(), info.size, info.tier);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    fn list_stream<'a>(&'a self, folder: Folder) -> BlobInfoStream<'a>;

    /// Collect [`list_stream()`](Self::list_stream) into a [`Vec`].
    async fn list(&self, folder: Folder) -> Result<Vec<BlobInfo>> {
        self.list_stream(folder).try_collect().await
    }

    /// Names of all state snapshots, sorted ascending. Version names sort
    /// chronologically, so the last entry is the latest version.
    async fn list_states(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .list(Folder::States)
            .await?
            .iter()
            .filter_map(|info| info.name().map(str::to_owned))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Check if a blob exists.
    async fn exists(&self, key: &Path) -> Result<bool>;

    /// Read a whole blob into memory.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the blob
    /// does not exist and [`Archived`](crate::error::ErrorKind::Archived) if
    /// it is not online.
    async fn read(&self, key: &Path) -> Result<Vec<u8>>;

    /// Open a blob for streaming reads.
    ///
    /// Returns a `'static` boxed [`Read`] suitable for use inside
    /// [`spawn_blocking`](tokio::task::spawn_blocking). The async setup
    /// (opening the file or request) happens before returning, so
    /// [`NotFound`](crate::error::ErrorKind::NotFound) and
    /// [`Archived`](crate::error::ErrorKind::Archived) surface here.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use arca_storage::{BlobStore, Folder, error::Result};
    /// # async fn example(store: &dyn BlobStore) -> Result<()> {
    /// let mut reader = store.reader(&Folder::Chunks.key("9f86d081")).await?;
    /// let bytes = tokio::task::spawn_blocking(move || {
    ///     let mut buf = Vec::new();
    ///     std::io::Read::read_to_end(&mut reader, &mut buf).map(|_| buf)
    /// }).await.unwrap().unwrap();
    /// # Ok(())
    /// # }
    /// ```
    async fn reader(&self, key: &Path) -> Result<BoxSyncRead>;

    /// Write a whole blob, replacing any existing blob at `key`.
    async fn write(&self, key: &Path, data: &[u8], tier: StorageTier) -> Result<()>;

    /// Open a blob for streaming writes.
    ///
    /// Returns a `'static` boxed [`Write`] suitable for use inside
    /// [`spawn_blocking`](tokio::task::spawn_blocking).
    ///
    /// # Notes
    /// - Callers must call `flush()` once everything is written. Some
    ///   backends buffer all data and only store the blob on `flush()`,
    ///   and errors are only reported from there.
    /// - `flush()` must not be called from inside an async context.
    async fn writer(&self, key: &Path, tier: StorageTier) -> Result<BoxSyncWrite>;

    /// Delete a blob.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the blob
    /// does not exist.
    async fn delete(&self, key: &Path) -> Result<()>;

    /// Get blob metadata, including its current tier, without reading it.
    async fn stat(&self, key: &Path) -> Result<BlobInfo>;

    /// Move a blob to another tier.
    ///
    /// Moving out of [`StorageTier::Archive`] is a rehydration and behaves
    /// like [`rehydrate()`](Self::rehydrate).
    async fn set_tier(&self, key: &Path, tier: StorageTier) -> Result<()>;

    /// Ask for an archived blob to be made readable in `tier`.
    ///
    /// Returns immediately. Does nothing if the blob is already online or a
    /// rehydration is already in progress.
    async fn rehydrate(&self, key: &Path, tier: StorageTier) -> Result<()>;
}
