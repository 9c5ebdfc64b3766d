//! Storage models.

use crate::StorageTier;
use std::path::{Path, PathBuf};
use time::UtcDateTime;

/// Top-level "folders" of a container.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Folder {
    /// One encrypted blob per chunk, named by the chunk's hex hash.
    Chunks,
    /// One encrypted state database per repository version.
    States,
}

impl Folder {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Chunks => "chunks",
            Self::States => "states",
        }
    }

    /// Key of the blob called `name` in this folder.
    pub fn key(&self, name: impl AsRef<str>) -> PathBuf {
        Path::new(self.prefix()).join(name.as_ref())
    }
}

/// Blob metadata returned by storage backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    /// Key relative to the container root, e.g. `chunks/<hash>`
    pub key: PathBuf,
    /// Stored (encrypted) size in bytes
    pub size: u64,
    /// Last modified timestamp
    pub modified: UtcDateTime,
    /// Current tier of the object
    pub tier: StorageTier,
    /// A rehydration has been requested and has not finished yet
    pub rehydrating: bool,
}
impl BlobInfo {
    pub fn new(key: impl Into<PathBuf>, size: u64, modified: UtcDateTime, tier: StorageTier) -> Self {
        Self {
            key: key.into(),
            size,
            modified,
            tier,
            rehydrating: false,
        }
    }

    pub fn with_rehydrating(mut self, rehydrating: bool) -> Self {
        self.rehydrating = rehydrating;
        self
    }

    /// Final key component, i.e. the blob name within its folder.
    pub fn name(&self) -> Option<&str> {
        self.key.file_name().and_then(|name| name.to_str())
    }
}
