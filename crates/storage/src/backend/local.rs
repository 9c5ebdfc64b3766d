//! Local filesystem blob store.
//!
//! A directory stands in for the container; keys map to files below it. The
//! filesystem has a single tier, so tier changes are accepted and ignored and
//! every blob reports [`StorageTier::Hot`].
//!
//! Blobs are written to a staging file below `.staging/` first and only
//! renamed onto their key once complete, so a key never holds a partial blob.

use crate::backend::{BlobInfoStream, BoxSyncRead, BoxSyncWrite};
use crate::error::{ErrorKind, Result};
use crate::{BlobInfo, BlobStore, Folder, StorageTier, path::validate as validate_path};
use async_stream::stream;
use async_trait::async_trait;
use exn::ResultExt;
use std::fs::{File, Metadata, create_dir_all as sync_create_dir};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use time::UtcDateTime;
use tokio::fs::{self, DirEntry};
use tokio::io::AsyncWriteExt;

/// Directory below the root holding blobs that are still being written.
/// Outside every [`Folder`], so listings never see it.
const STAGING_DIR: &str = ".staging";

enum WalkEntry {
    Blob(BlobInfo),
    Descend(PathBuf),
    Skip,
}

/// Local filesystem blob store.
///
/// # Examples
///
/// ```no_run
/// use arca_storage::backend::LocalBackend;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = LocalBackend::new("nas", "/mnt/backups/arca")?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LocalBackend {
    name: String,
    /// Root directory of the container
    root: PathBuf,
}
impl LocalBackend {
    /// Create a new local filesystem backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not absolute, or exists and is not a
    /// directory. A missing directory is created.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidPath(root));
            }
        } else {
            // Use non-async here; it only happens once when the repository is
            // opened and it's not worth making the constructor async.
            sync_create_dir(&root).map_err(|e| Self::map_io_error(e, &root))?;
        }

        Ok(Self { name: name.into(), root })
    }

    /// Validates the key and joins it with the root directory.
    fn absolute_path(&self, key: impl AsRef<Path>) -> Result<PathBuf> {
        let validated = validate_path(key.as_ref())?;
        Ok(self.root.join(validated))
    }

    /// Convert an absolute path back to a key.
    fn relative_path(&self, absolute: impl AsRef<Path>) -> Result<PathBuf> {
        let absolute = absolute.as_ref();
        let relative = absolute.strip_prefix(&self.root).or_raise(|| {
            ErrorKind::BackendError(format!("path `{:?}` is not within root `{:?}`", absolute, self.root))
        })?;
        validate_path(relative)
    }

    /// Re-use same data collection from file metadata for both list and stat functions
    fn metadata(key: &Path, metadata: Metadata) -> Result<BlobInfo> {
        let modified: UtcDateTime = metadata.modified().map_err(ErrorKind::Io)?.into();
        Ok(BlobInfo::new(key, metadata.len(), modified, StorageTier::Hot))
    }

    fn map_io_error(e: std::io::Error, path: &Path) -> ErrorKind {
        match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(path.to_path_buf()),
            _ => ErrorKind::Io(e),
        }
    }

    /// Create the parent directories of `key` and an empty staging file to
    /// write its content to.
    async fn stage(&self, key: &Path, abs_path: &Path) -> Result<NamedTempFile> {
        // Create parent directories if needed, to keep behaviour
        // consistent with S3-compatible storage.
        if let Some(parent) = abs_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| Self::map_io_error(e, key))?;
        }
        let staging = self.root.join(STAGING_DIR);
        fs::create_dir_all(&staging).await.map_err(|e| Self::map_io_error(e, &staging))?;
        Ok(NamedTempFile::new_in(&staging).map_err(|e| Self::map_io_error(e, &staging))?)
    }

    /// Errors can't be `?`-ed inside the `stream!` loop; this keeps the
    /// fallible part of the walk in one place.
    async fn process_entry(&self, entry: DirEntry) -> Result<WalkEntry> {
        let path = entry.path();
        let metadata = entry.metadata().await.map_err(|e| Self::map_io_error(e, &path))?;
        if metadata.is_dir() {
            return Ok(WalkEntry::Descend(path));
        }
        if metadata.is_file() {
            let key = self.relative_path(&path)?;
            return Ok(WalkEntry::Blob(Self::metadata(&key, metadata)?));
        }
        // Note: silently drop what is most likely a broken symlink.
        Ok(WalkEntry::Skip)
    }
}

#[async_trait]
impl BlobStore for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn verify(&self) -> Result<()> {
        match fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => exn::bail!(ErrorKind::Unreachable(format!("{} is not a directory", self.root.display()))),
            Err(e) => Err(e).or_raise(|| ErrorKind::Unreachable(self.root.display().to_string())),
        }
    }

    fn list_stream<'a>(&'a self, folder: Folder) -> BlobInfoStream<'a> {
        let mut stack = vec![self.root.join(folder.prefix())];

        Box::pin(stream! {
            'dirs: while let Some(current) = stack.pop() {
                let mut entries = match fs::read_dir(&current).await {
                    Ok(entries) => entries,
                    // Consistent with S3-compatible backends: an empty
                    // folder and a missing folder look the same.
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => {
                        yield Err(exn::Exn::from(Self::map_io_error(err, &current)));
                        continue 'dirs;
                    }
                };

                'entries: loop {
                    let entry = match entries.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break 'entries,
                        Err(e) => { yield Err(exn::Exn::from(Self::map_io_error(e, &current))); continue 'entries; },
                    };
                    match self.process_entry(entry).await {
                        Ok(WalkEntry::Blob(info)) => yield Ok(info),
                        Ok(WalkEntry::Descend(d)) => stack.push(d),
                        Ok(WalkEntry::Skip) => {},
                        Err(e) => yield Err(e),
                    };
                }
            }
        })
    }

    async fn exists(&self, key: &Path) -> Result<bool> {
        let abs_path = self.absolute_path(key)?;
        Ok(fs::try_exists(&abs_path).await.map_err(ErrorKind::Io)?)
    }

    async fn read(&self, key: &Path) -> Result<Vec<u8>> {
        let abs_path = self.absolute_path(key)?;
        Ok(fs::read(&abs_path).await.map_err(|e| Self::map_io_error(e, key))?)
    }

    async fn reader(&self, key: &Path) -> Result<BoxSyncRead> {
        let abs_path = self.absolute_path(key)?;
        let file = fs::File::open(&abs_path).await.map_err(|e| Self::map_io_error(e, key))?;
        Ok(Box::new(file.into_std().await))
    }

    async fn write(&self, key: &Path, data: &[u8], tier: StorageTier) -> Result<()> {
        let abs_path = self.absolute_path(key)?;
        tracing::trace!(key = %key.display(), %tier, "local backend ignores tiers");
        let (file, staged) = self.stage(key, &abs_path).await?.into_parts();
        let mut file = fs::File::from_std(file);
        file.write_all(data).await.map_err(|e| Self::map_io_error(e, key))?;
        file.flush().await.map_err(|e| Self::map_io_error(e, key))?;
        drop(file);
        Ok(staged.persist(&abs_path).map_err(|e| Self::map_io_error(e.error, key))?)
    }

    async fn writer(&self, key: &Path, tier: StorageTier) -> Result<BoxSyncWrite> {
        let abs_path = self.absolute_path(key)?;
        tracing::trace!(key = %key.display(), %tier, "local backend ignores tiers");
        let staged = self.stage(key, &abs_path).await?;
        Ok(Box::new(LocalWriter {
            target: abs_path,
            staged: Some(staged),
            committed: None,
        }))
    }

    async fn delete(&self, key: &Path) -> Result<()> {
        let abs_path = self.absolute_path(key)?;
        Ok(fs::remove_file(&abs_path).await.map_err(|e| Self::map_io_error(e, key))?)
    }

    async fn stat(&self, key: &Path) -> Result<BlobInfo> {
        let abs_path = self.absolute_path(key)?;
        let metadata = fs::metadata(&abs_path).await.map_err(|e| Self::map_io_error(e, key))?;
        Self::metadata(&validate_path(key)?, metadata)
    }

    async fn set_tier(&self, key: &Path, tier: StorageTier) -> Result<()> {
        if !self.exists(key).await? {
            exn::bail!(ErrorKind::NotFound(key.to_path_buf()));
        }
        tracing::debug!(key = %key.display(), %tier, "local backend ignores tier change");
        Ok(())
    }

    async fn rehydrate(&self, key: &Path, _tier: StorageTier) -> Result<()> {
        // Everything on a local disk is online.
        if !self.exists(key).await? {
            exn::bail!(ErrorKind::NotFound(key.to_path_buf()));
        }
        Ok(())
    }
}

/// Streaming writer that moves its staging file onto the key on the first
/// flush. Dropped without a flush, the staging file is removed and the key
/// is left as it was.
struct LocalWriter {
    target: PathBuf,
    staged: Option<NamedTempFile>,
    committed: Option<File>,
}

impl Write for LocalWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match (&mut self.staged, &mut self.committed) {
            (Some(staged), _) => staged.write(buf),
            (None, Some(file)) => file.write(buf),
            (None, None) => Err(io::Error::other("staging file could not be committed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let Some(mut staged) = self.staged.take() else {
            return self.committed.as_mut().map_or(Ok(()), Write::flush);
        };
        staged.flush()?;
        self.committed = Some(staged.persist(&self.target).map_err(|e| e.error)?);
        Ok(())
    }
}
