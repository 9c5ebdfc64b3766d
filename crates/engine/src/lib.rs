//! Archive and restore engine for arca repositories.
//!
//! An [`Engine`] binds a blob store, a passphrase and a local snapshot cache.
//! [`Engine::archive`] brings a repository in line with a local directory
//! and records the result as a new version; [`Engine::restore`] brings a
//! local directory in line with a version. Both are pipelines of bounded
//! queues and report per-file problems in their result instead of failing
//! the run.
//!
//! # Architecture
//! - [`index`] walks a local root and pairs binaries with pointer files.
//! - [`pointer`] reads and writes pointer files.
//! - `archive` and `restore` hold the two runs.
//! - [`report`] is what a run hands back.
//! - [`error`] covers only what aborts a run.

mod archive;
mod context;
pub mod error;
mod fs;
pub mod index;
mod pipeline;
pub mod pointer;
mod query;
pub mod report;
mod restore;

pub use crate::report::{ArchiveReport, ArchiveStats, ItemFailure, RestoreReport, RestoreStats, RunStatus};
pub use arca_config::{ArchiveConfig, RepositoryConfig, RestoreConfig};
pub use arca_state::{BinaryProperties, CurrentEntry, PointerFileEntry};

use crate::error::{ErrorKind, Result};
use arca_crypto::{Codec, ContentHasher, Passphrase};
use arca_state::StateStore;
use arca_storage::BlobHandle;
use exn::ResultExt;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

pub struct Engine {
    store: BlobHandle,
    codec: Codec,
    hasher: ContentHasher,
    states: StateStore,
    cancel: CancellationToken,
}

impl Engine {
    /// An engine on an already opened blob store. `cache_dir` holds the
    /// downloaded state snapshots of this container.
    ///
    /// Cached snapshots are plaintext, so they are kept in a subdirectory
    /// only this passphrase finds. With any other passphrase the snapshot
    /// is downloaded again and fails to decrypt before anything is written.
    pub fn new(store: BlobHandle, passphrase: Passphrase, cache_dir: impl Into<PathBuf>) -> Self {
        let codec = Codec::new(passphrase.clone());
        let hasher = ContentHasher::new(&passphrase);
        let cache_dir = snapshot_cache(cache_dir.into(), &hasher);
        let states = StateStore::new(store.clone(), codec.clone(), cache_dir);
        Self {
            store,
            codec,
            hasher,
            states,
            cancel: CancellationToken::new(),
        }
    }

    /// Open the configured repository.
    pub async fn open(config: &RepositoryConfig) -> Result<Self> {
        config.validate().or_raise(|| ErrorKind::Config)?;
        config.log_fields();
        let store = config.open_store().await.or_raise(|| ErrorKind::Unreachable)?;
        let cache_dir = config.cache_dir().or_raise(|| ErrorKind::Config)?;
        Ok(Self::new(store, config.passphrase.clone(), cache_dir))
    }

    /// Tie every run of this engine to `cancel`. Cancelling it stops a run
    /// at its next queue operation and the run returns
    /// [`ErrorKind::Cancelled`]; an archive run then uploads no new version.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Archive `config.root` into the repository.
    pub async fn archive(&self, config: ArchiveConfig) -> Result<ArchiveReport> {
        archive::archive(self, config).await
    }

    /// Restore `config.targets` below `config.root` from the repository.
    pub async fn restore(&self, config: RestoreConfig) -> Result<RestoreReport> {
        restore::restore(self, config).await
    }

    async fn verify(&self) -> Result<()> {
        self.store.verify().await.or_raise(|| ErrorKind::Unreachable)?;
        tracing::debug!(backend = self.store.name(), "Blob store reachable");
        Ok(())
    }
}

/// Per-passphrase snapshot cache below `root`.
fn snapshot_cache(root: PathBuf, hasher: &ContentHasher) -> PathBuf {
    root.join(hasher.hash_bytes(b"state-cache").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_cache_depends_on_passphrase() {
        let root = PathBuf::from("/cache");
        let right = snapshot_cache(root.clone(), &ContentHasher::new(&Passphrase::new("right")));
        let again = snapshot_cache(root.clone(), &ContentHasher::new(&Passphrase::new("right")));
        let wrong = snapshot_cache(root.clone(), &ContentHasher::new(&Passphrase::new("wrong")));
        assert_eq!(right, again);
        assert_ne!(right, wrong);
        assert!(right.starts_with(&root));
    }
}
