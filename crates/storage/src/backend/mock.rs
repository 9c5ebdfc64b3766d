//! In-memory storage backend for testing.

use super::{BlobInfoStream, BoxSyncRead, BoxSyncWrite};
use crate::error::{ErrorKind, Result};
use crate::path::validate as validate_path;
use crate::{BlobInfo, BlobStore, Folder, StorageTier};
use async_stream::stream;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use time::UtcDateTime;

#[derive(Clone)]
struct Blob {
    data: Vec<u8>,
    modified: UtcDateTime,
    tier: StorageTier,
    /// Target tier of a pending rehydration.
    rehydrating: Option<StorageTier>,
}

type Storage = Arc<RwLock<HashMap<PathBuf, Blob>>>;

/// In-memory storage backend for testing.
///
/// Blobs are stored in a `HashMap` behind a [`RwLock`], so all trait methods
/// can operate on `&self` without external synchronisation. The lock is the
/// std one because streaming writers store their blob from a blocking
/// `flush()`.
///
/// Tiers are tracked per blob: reading an archive-tier blob fails with
/// [`Archived`](ErrorKind::Archived) until [`rehydrate()`](BlobStore::rehydrate)
/// has been requested *and* the test calls
/// [`complete_rehydration()`](Self::complete_rehydration).
///
/// # Examples
///
/// ```
/// use arca_storage::backend::MockBackend;
/// use arca_storage::{BlobStore, Folder, StorageTier};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = MockBackend::with_files([("chunks/abc", b"ciphertext")]);
/// assert!(backend.exists(&Folder::Chunks.key("abc")).await?);
///
/// backend.write(&Folder::Chunks.key("def"), b"data...", StorageTier::Cool).await?;
/// assert_eq!(backend.stat(&Folder::Chunks.key("def")).await?.tier, StorageTier::Cool);
/// # Ok(())
/// # }
/// ```
pub struct MockBackend {
    name: String,
    storage: Storage,
    unreachable: AtomicBool,
    denied: RwLock<HashSet<PathBuf>>,
    writes: Arc<AtomicUsize>,
    reads: AtomicUsize,
}

impl MockBackend {
    /// Create a mock backend pre-populated with hot-tier blobs.
    ///
    /// Panics if any key fails validation (e.g. path traversal). If test
    /// setup is wrong, then test should not pass.
    pub fn with_files(files: impl IntoIterator<Item = (impl Into<PathBuf>, impl Into<Vec<u8>>)>) -> Self {
        let mut map = HashMap::new();
        let now = UtcDateTime::now();
        for (path, data) in files {
            let path = path.into();
            let Ok(validated) = validate_path(&path) else {
                // The panic here is DELIBERATE. MockBackend is intended to be
                // used in tests; panics are expected. There is no error result.
                panic!("MockBackend::with_files: invalid path {}", path.display());
            };
            map.insert(
                validated,
                Blob {
                    data: data.into(),
                    modified: now,
                    tier: StorageTier::Hot,
                    rehydrating: None,
                },
            );
        }
        Self {
            name: "mock".to_string(),
            storage: Arc::new(RwLock::new(map)),
            unreachable: AtomicBool::new(false),
            denied: RwLock::new(HashSet::new()),
            writes: Arc::new(AtomicUsize::new(0)),
            reads: AtomicUsize::new(0),
        }
    }

    /// Change the name of the mock backend.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Make [`verify()`](BlobStore::verify) fail as if the container did not
    /// exist or the credentials were wrong.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Every later access to `key` fails with
    /// [`PermissionDenied`](ErrorKind::PermissionDenied).
    pub fn deny(&self, key: impl AsRef<Path>) {
        self.denied.write().unwrap_or_else(PoisonError::into_inner).insert(key.as_ref().to_path_buf());
    }

    /// Finish a pending rehydration, moving the blob to the tier it was
    /// requested in. Returns `false` if no rehydration was pending.
    pub fn complete_rehydration(&self, key: impl AsRef<Path>) -> bool {
        let mut guard = self.storage.write().unwrap_or_else(PoisonError::into_inner);
        match guard.get_mut(key.as_ref()) {
            Some(blob) => match blob.rehydrating.take() {
                Some(tier) => {
                    blob.tier = tier;
                    true
                },
                None => false,
            },
            None => false,
        }
    }

    /// Finish every pending rehydration. Returns how many there were.
    pub fn complete_all_rehydrations(&self) -> usize {
        let mut guard = self.storage.write().unwrap_or_else(PoisonError::into_inner);
        let mut count = 0;
        for blob in guard.values_mut() {
            if let Some(tier) = blob.rehydrating.take() {
                blob.tier = tier;
                count += 1;
            }
        }
        count
    }

    /// Keys currently stored under `folder`, sorted.
    pub fn keys(&self, folder: Folder) -> Vec<PathBuf> {
        let guard = self.storage.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<PathBuf> = guard.keys().filter(|key| key.starts_with(folder.prefix())).cloned().collect();
        keys.sort();
        keys
    }

    /// Raw stored bytes, bypassing tiers and denials.
    pub fn raw(&self, key: impl AsRef<Path>) -> Option<Vec<u8>> {
        let guard = self.storage.read().unwrap_or_else(PoisonError::into_inner);
        guard.get(key.as_ref()).map(|blob| blob.data.clone())
    }

    /// Number of completed blob writes, streaming or not.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of blob reads, streaming or not.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn check_denied(&self, key: &Path) -> Result<()> {
        if self.denied.read().unwrap_or_else(PoisonError::into_inner).contains(key) {
            exn::bail!(ErrorKind::PermissionDenied(key.to_path_buf()));
        }
        Ok(())
    }

    fn blob_info(key: &Path, blob: &Blob) -> BlobInfo {
        BlobInfo::new(key, blob.data.len() as u64, blob.modified, blob.tier).with_rehydrating(blob.rehydrating.is_some())
    }

    fn readable(&self, key: &Path) -> Result<Vec<u8>> {
        let key = validate_path(key)?;
        self.check_denied(&key)?;
        let guard = self.storage.read().unwrap_or_else(PoisonError::into_inner);
        let blob = guard.get(&key).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(key.clone())))?;
        if !blob.tier.is_online() {
            exn::bail!(ErrorKind::Archived(key));
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(blob.data.clone())
    }
}
impl Default for MockBackend {
    fn default() -> Self {
        let files: [(&str, &str); 0] = [];
        Self::with_files(files)
    }
}

/// Buffers everything and stores the blob on `flush()`.
struct MockWriter {
    key: PathBuf,
    tier: StorageTier,
    buffer: Vec<u8>,
    storage: Storage,
    writes: Arc<AtomicUsize>,
}

impl Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let blob = Blob {
            data: self.buffer.clone(),
            modified: UtcDateTime::now(),
            tier: self.tier,
            rehydrating: None,
        };
        self.storage.write().unwrap_or_else(PoisonError::into_inner).insert(self.key.clone(), blob);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl BlobStore for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn verify(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            exn::bail!(ErrorKind::Unreachable(format!("{} is switched off", self.name)));
        }
        Ok(())
    }

    fn list_stream<'a>(&'a self, folder: Folder) -> BlobInfoStream<'a> {
        Box::pin(stream! {
            // Snapshot matching entries under the read lock, then drop it
            // before yielding to avoid holding the lock across yield points.
            let entries: Vec<BlobInfo> = {
                let guard = self.storage.read().unwrap_or_else(PoisonError::into_inner);
                guard
                    .iter()
                    .filter(|(key, _)| key.starts_with(folder.prefix()))
                    .map(|(key, blob)| Self::blob_info(key, blob))
                    .collect()
            };
            for info in entries {
                yield Ok(info);
            }
        })
    }

    async fn exists(&self, key: &Path) -> Result<bool> {
        let key = validate_path(key)?;
        Ok(self.storage.read().unwrap_or_else(PoisonError::into_inner).contains_key(&key))
    }

    async fn read(&self, key: &Path) -> Result<Vec<u8>> {
        self.readable(key)
    }

    async fn reader(&self, key: &Path) -> Result<BoxSyncRead> {
        Ok(Box::new(Cursor::new(self.readable(key)?)))
    }

    async fn write(&self, key: &Path, data: &[u8], tier: StorageTier) -> Result<()> {
        let key = validate_path(key)?;
        self.check_denied(&key)?;
        let blob = Blob {
            data: data.to_vec(),
            modified: UtcDateTime::now(),
            tier,
            rehydrating: None,
        };
        self.storage.write().unwrap_or_else(PoisonError::into_inner).insert(key, blob);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn writer(&self, key: &Path, tier: StorageTier) -> Result<BoxSyncWrite> {
        let key = validate_path(key)?;
        self.check_denied(&key)?;
        Ok(Box::new(MockWriter {
            key,
            tier,
            buffer: Vec::new(),
            storage: Arc::clone(&self.storage),
            writes: Arc::clone(&self.writes),
        }))
    }

    async fn delete(&self, key: &Path) -> Result<()> {
        let key = validate_path(key)?;
        let removed = self.storage.write().unwrap_or_else(PoisonError::into_inner).remove(&key);
        removed.map(|_| ()).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(key)))
    }

    async fn stat(&self, key: &Path) -> Result<BlobInfo> {
        let key = validate_path(key)?;
        let guard = self.storage.read().unwrap_or_else(PoisonError::into_inner);
        let blob = guard.get(&key).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(key.clone())))?;
        Ok(Self::blob_info(&key, blob))
    }

    async fn set_tier(&self, key: &Path, tier: StorageTier) -> Result<()> {
        let key = validate_path(key)?;
        let mut guard = self.storage.write().unwrap_or_else(PoisonError::into_inner);
        let blob = guard.get_mut(&key).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(key.clone())))?;
        if !blob.tier.is_online() && tier.is_online() {
            blob.rehydrating.get_or_insert(tier);
        } else {
            blob.tier = tier;
        }
        Ok(())
    }

    async fn rehydrate(&self, key: &Path, tier: StorageTier) -> Result<()> {
        let key = validate_path(key)?;
        let mut guard = self.storage.write().unwrap_or_else(PoisonError::into_inner);
        let blob = guard.get_mut(&key).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(key.clone())))?;
        if !blob.tier.is_online() {
            blob.rehydrating.get_or_insert(tier);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[tokio::test]
    async fn test_write_and_read() {
        let backend = MockBackend::default();
        backend.write(Path::new("chunks/a"), b"hello", StorageTier::Hot).await.unwrap();
        assert_eq!(backend.read(Path::new("chunks/a")).await.unwrap(), b"hello");
        assert_eq!(backend.write_count(), 1);
        assert_eq!(backend.read_count(), 1);
    }

    #[tokio::test]
    async fn test_with_files() {
        let backend = MockBackend::with_files([("chunks/a", Vec::from(*b"one")), ("states/v1", Vec::from(*b"two"))]);
        assert!(backend.exists(Path::new("chunks/a")).await.unwrap());
        assert!(backend.exists(Path::new("states/v1")).await.unwrap());
        assert!(!backend.exists(Path::new("chunks/nope")).await.unwrap());
        assert_eq!(backend.keys(Folder::States), vec![PathBuf::from("states/v1")]);
    }

    #[tokio::test]
    async fn test_read_not_found() {
        let backend = MockBackend::default();
        let err = backend.read(Path::new("chunks/missing")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_archived_blob_needs_rehydration() {
        let backend = MockBackend::default();
        let key = Folder::Chunks.key("cold");
        backend.write(&key, b"frozen", StorageTier::Archive).await.unwrap();

        let err = backend.read(&key).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Archived(_)));
        assert!(matches!(&*backend.reader(&key).await.err().unwrap(), ErrorKind::Archived(_)));

        backend.rehydrate(&key, StorageTier::Hot).await.unwrap();
        // Requested but not finished yet.
        assert!(backend.stat(&key).await.unwrap().rehydrating);
        assert!(backend.read(&key).await.is_err());

        assert!(backend.complete_rehydration(&key));
        let info = backend.stat(&key).await.unwrap();
        assert_eq!(info.tier, StorageTier::Hot);
        assert!(!info.rehydrating);
        assert_eq!(backend.read(&key).await.unwrap(), b"frozen");
    }

    #[tokio::test]
    async fn test_rehydrate_online_blob_is_noop() {
        let backend = MockBackend::with_files([("chunks/a", Vec::from(*b"x"))]);
        backend.rehydrate(Path::new("chunks/a"), StorageTier::Cool).await.unwrap();
        assert!(!backend.complete_rehydration("chunks/a"));
        assert_eq!(backend.stat(Path::new("chunks/a")).await.unwrap().tier, StorageTier::Hot);
    }

    #[tokio::test]
    async fn test_set_tier() {
        let backend = MockBackend::with_files([("chunks/a", Vec::from(*b"x"))]);
        backend.set_tier(Path::new("chunks/a"), StorageTier::Archive).await.unwrap();
        assert_eq!(backend.stat(Path::new("chunks/a")).await.unwrap().tier, StorageTier::Archive);
        backend.set_tier(Path::new("chunks/a"), StorageTier::Cool).await.unwrap();
        assert!(backend.stat(Path::new("chunks/a")).await.unwrap().rehydrating);
        assert_eq!(backend.complete_all_rehydrations(), 1);
        assert_eq!(backend.stat(Path::new("chunks/a")).await.unwrap().tier, StorageTier::Cool);
    }

    #[tokio::test]
    async fn test_streaming_writer_stores_on_flush() {
        let backend = MockBackend::default();
        let key = Folder::Chunks.key("streamed");
        let mut writer = backend.writer(&key, StorageTier::Cold).await.unwrap();
        writer.write_all(b"part one, ").unwrap();
        writer.write_all(b"part two").unwrap();
        assert!(!backend.exists(&key).await.unwrap());
        writer.flush().unwrap();
        let mut reader = backend.reader(&key).await.unwrap();
        let mut data = String::new();
        reader.read_to_string(&mut data).unwrap();
        assert_eq!(data, "part one, part two");
        assert_eq!(backend.stat(&key).await.unwrap().tier, StorageTier::Cold);
    }

    #[tokio::test]
    async fn test_unreachable() {
        let backend = MockBackend::default();
        backend.verify().await.unwrap();
        backend.set_unreachable(true);
        assert!(matches!(&*backend.verify().await.unwrap_err(), ErrorKind::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_denied_key() {
        let backend = MockBackend::with_files([("chunks/a", Vec::from(*b"x"))]);
        backend.deny("chunks/a");
        assert!(matches!(&*backend.read(Path::new("chunks/a")).await.unwrap_err(), ErrorKind::PermissionDenied(_)));
        assert!(backend.write(Path::new("chunks/a"), b"y", StorageTier::Hot).await.is_err());
        assert_eq!(backend.raw("chunks/a").unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_delete() {
        let backend = MockBackend::default();
        backend.write(Path::new("chunks/a"), b"data", StorageTier::Hot).await.unwrap();
        backend.delete(Path::new("chunks/a")).await.unwrap();
        assert!(!backend.exists(Path::new("chunks/a")).await.unwrap());
        let err = backend.delete(Path::new("chunks/a")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_folder() {
        let backend = MockBackend::with_files([
            ("chunks/one", Vec::from(*b"a")),
            ("chunks/two", Vec::from(*b"b")),
            ("states/v1", Vec::from(*b"c")),
        ]);
        let chunks = backend.list(Folder::Chunks).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|info| info.key.starts_with("chunks")));
        assert_eq!(backend.list_states().await.unwrap(), vec!["v1".to_string()]);
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let backend = MockBackend::default();
        assert!(backend.read(Path::new("../etc/passwd")).await.is_err());
        assert!(backend.write(Path::new("../escape"), b"bad", StorageTier::Hot).await.is_err());
    }

    #[test]
    #[should_panic(expected = "invalid path")]
    fn test_with_files_panics_on_bad_path() {
        MockBackend::with_files([("../escape", Vec::from(*b"bad"))]);
    }
}
