//! Flat per-operation configuration.
//!
//! [`ArchiveOptions`] and [`RestoreOptions`] are the defaults read from the
//! configuration sources. Combined with the per-run inputs they become an
//! [`ArchiveConfig`] or [`RestoreConfig`], which the engine validates once
//! and then takes by value.

use crate::error::{ErrorKind, Result};
use arca_chunk::Chunker;
use arca_storage::StorageTier;
use exn::{OptionExt, ResultExt};
use serde::Deserialize;
use std::num::NonZeroUsize;
use std::path::{Component, Path, PathBuf};

/// Extension appended to a binary's name to form its pointer file name.
pub const POINTER_EXTENSION: &str = ".pointer.arca";

const DEFAULT_CONTAINER_SIZE: u64 = 4 * 1024 * 1024;
const DEFAULT_TRANSFER_PARALLELISM: usize = 8;

fn default_hash_parallelism() -> usize {
    std::thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(4)
}

fn ensure_directory(root: &Path) -> Result<()> {
    let metadata = std::fs::metadata(root)
        .or_raise(|| ErrorKind::Invalid(format!("root does not exist: {}", root.display())))?;
    if !metadata.is_dir() {
        exn::bail!(ErrorKind::Invalid(format!("root is not a directory: {}", root.display())));
    }
    Ok(())
}

fn ensure_parallelism(name: &str, value: usize) -> Result<()> {
    if value == 0 {
        exn::bail!(ErrorKind::Invalid(format!("{name} must be at least 1")));
    }
    Ok(())
}

// =============================================================================
// Archive
// =============================================================================

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ArchiveOptions {
    pub tier: StorageTier,
    pub chunking: Chunker,
    pub fast_hash: bool,
    pub remove_local: bool,
    pub pack_threshold: Option<u64>,
    pub container_size: u64,
    pub hash_parallelism: Option<usize>,
    pub transfer_parallelism: usize,
}
impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            tier: StorageTier::Cool,
            chunking: Chunker::WholeFile,
            fast_hash: false,
            remove_local: false,
            pack_threshold: None,
            container_size: DEFAULT_CONTAINER_SIZE,
            hash_parallelism: None,
            transfer_parallelism: DEFAULT_TRANSFER_PARALLELISM,
        }
    }
}
impl ArchiveOptions {
    pub fn into_config(self, root: impl Into<PathBuf>) -> ArchiveConfig {
        ArchiveConfig {
            root: root.into(),
            tier: self.tier,
            chunking: self.chunking,
            fast_hash: self.fast_hash,
            remove_local: self.remove_local,
            pack_threshold: self.pack_threshold,
            container_size: self.container_size,
            hash_parallelism: self.hash_parallelism.unwrap_or_else(default_hash_parallelism),
            transfer_parallelism: self.transfer_parallelism,
        }
    }
}

/// Everything one archive run needs to know.
#[derive(Clone, Debug)]
pub struct ArchiveConfig {
    /// Local directory to archive.
    pub root: PathBuf,
    /// Requested tier. Small objects requested into the archive tier are
    /// stored cold instead.
    pub tier: StorageTier,
    /// [`Chunker::WholeFile`] disables in-file deduplication.
    pub chunking: Chunker,
    /// Trust the hash in an existing pointer file when the binary's size and
    /// modification time match it.
    pub fast_hash: bool,
    /// Delete binaries once archived, leaving only pointer files.
    pub remove_local: bool,
    /// Binaries at or below this size are packed into shared container
    /// chunks. `None` disables packing.
    pub pack_threshold: Option<u64>,
    /// Upper bound for a container chunk's plaintext size.
    pub container_size: u64,
    pub hash_parallelism: usize,
    pub transfer_parallelism: usize,
}

impl ArchiveConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ArchiveOptions::default().into_config(root)
    }

    /// Whether content-defined chunking (and with it in-file deduplication)
    /// is enabled.
    pub fn dedup(&self) -> bool {
        !matches!(self.chunking, Chunker::WholeFile)
    }

    pub fn validate(&self) -> Result<()> {
        ensure_directory(&self.root)?;
        self.chunking
            .validate()
            .or_raise(|| ErrorKind::Invalid("chunking parameters".to_string()))?;
        ensure_parallelism("hash_parallelism", self.hash_parallelism)?;
        ensure_parallelism("transfer_parallelism", self.transfer_parallelism)?;
        if let Some(threshold) = self.pack_threshold
            && (threshold == 0 || threshold > self.container_size)
        {
            exn::bail!(ErrorKind::Invalid(format!(
                "pack_threshold ({threshold}) must be between 1 and container_size ({})",
                self.container_size
            )));
        }
        Ok(())
    }

    /// Log the reviewed list of archive settings.
    pub fn log_fields(&self) {
        tracing::info!(
            root = %self.root.display(),
            tier = %self.tier,
            dedup = self.dedup(),
            fast_hash = self.fast_hash,
            remove_local = self.remove_local,
            pack_threshold = ?self.pack_threshold,
            container_size = self.container_size,
            hash_parallelism = self.hash_parallelism,
            transfer_parallelism = self.transfer_parallelism,
            "Archive configuration"
        );
    }
}

// =============================================================================
// Restore
// =============================================================================

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RestoreOptions {
    pub keep_pointers: bool,
    pub request_rehydration: bool,
    pub hash_parallelism: Option<usize>,
    pub transfer_parallelism: usize,
}
impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            keep_pointers: true,
            request_rehydration: true,
            hash_parallelism: None,
            transfer_parallelism: DEFAULT_TRANSFER_PARALLELISM,
        }
    }
}
impl RestoreOptions {
    pub fn into_config(self, root: impl Into<PathBuf>, targets: Vec<String>) -> RestoreConfig {
        RestoreConfig {
            root: root.into(),
            targets,
            keep_pointers: self.keep_pointers,
            version: None,
            request_rehydration: self.request_rehydration,
            hash_parallelism: self.hash_parallelism.unwrap_or_else(default_hash_parallelism),
            transfer_parallelism: self.transfer_parallelism,
        }
    }
}

/// Everything one restore run needs to know.
#[derive(Clone, Debug)]
pub struct RestoreConfig {
    /// Local directory to restore into.
    pub root: PathBuf,
    /// Files or directories to restore, relative to the root. Empty means
    /// everything.
    pub targets: Vec<String>,
    /// Keep pointer files next to restored binaries.
    pub keep_pointers: bool,
    /// Version to restore; `None` for the latest.
    pub version: Option<String>,
    /// Ask the store to rehydrate archived chunks that were needed.
    pub request_rehydration: bool,
    pub hash_parallelism: usize,
    pub transfer_parallelism: usize,
}

impl RestoreConfig {
    pub fn new(root: impl Into<PathBuf>, targets: Vec<String>) -> Self {
        RestoreOptions::default().into_config(root, targets)
    }

    /// Check the configuration and normalize every target to a relative
    /// name with `/` separators and without a pointer extension.
    pub fn validate(&mut self) -> Result<()> {
        ensure_directory(&self.root)?;
        ensure_parallelism("hash_parallelism", self.hash_parallelism)?;
        ensure_parallelism("transfer_parallelism", self.transfer_parallelism)?;
        self.targets = self
            .targets
            .iter()
            .map(|target| normalize_target(&self.root, target))
            .collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    /// Log the reviewed list of restore settings.
    pub fn log_fields(&self) {
        tracing::info!(
            root = %self.root.display(),
            targets = ?self.targets,
            keep_pointers = self.keep_pointers,
            version = ?self.version,
            request_rehydration = self.request_rehydration,
            hash_parallelism = self.hash_parallelism,
            transfer_parallelism = self.transfer_parallelism,
            "Restore configuration"
        );
    }
}

/// Turn a restore target into a relative name inside `root`.
///
/// Absolute targets must lie below `root`. An empty result (the root itself)
/// selects everything.
pub fn normalize_target(root: &Path, target: &str) -> Result<String> {
    let invalid = || ErrorKind::Invalid(format!("restore target is outside the root: {target}"));
    let path = Path::new(target);
    let relative = match path.is_absolute() {
        true => path.strip_prefix(root).or_raise(invalid)?,
        false => path,
    };
    let mut parts: Vec<&str> = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                parts.push(part.to_str().ok_or_raise(invalid)?);
            },
            Component::CurDir => {},
            Component::ParentDir => {
                if parts.pop().is_none() {
                    exn::bail!(invalid());
                }
            },
            Component::RootDir | Component::Prefix(_) => exn::bail!(invalid()),
        }
    }
    let mut name = parts.join("/");
    if let Some(stripped) = name.strip_suffix(POINTER_EXTENSION) {
        name = stripped.to_string();
    }
    Ok(name)
}
