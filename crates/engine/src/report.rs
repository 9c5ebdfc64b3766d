//! Run results.
//!
//! A run that returns `Ok` always carries concrete counts. Items that failed
//! on their own are listed in `failures`; a run with failures is a
//! [`RunStatus::PartialFailure`], not an error.

use std::fmt;

/// One file that could not be processed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemFailure {
    /// Relative name of the file (or directory) concerned.
    pub path: String,
    pub reason: String,
}

impl ItemFailure {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.reason)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    /// The run completed but some items failed.
    PartialFailure,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    /// Relative names found locally.
    pub indexed: u64,
    /// Binaries whose content was hashed (as opposed to trusted from their
    /// pointer file).
    pub hashed: u64,
    /// Binaries whose content was already in the repository.
    pub deduplicated: u64,
    /// Binaries uploaded in this run.
    pub uploaded: u64,
    pub chunks_uploaded: u64,
    /// Encrypted bytes written to the blob store.
    pub bytes_uploaded: u64,
    pub pointers_written: u64,
    /// Entries recorded in the new version, deletion markers excluded.
    pub entries_written: u64,
    /// Deletion markers recorded in the new version.
    pub deleted: u64,
    /// Local binaries removed after archiving.
    pub removed_local: u64,
    pub failed: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveReport {
    /// The version created by this run; `None` when nothing changed.
    pub version: Option<String>,
    pub stats: ArchiveStats,
    pub failures: Vec<ItemFailure>,
}

impl ArchiveReport {
    pub fn status(&self) -> RunStatus {
        status(&self.failures)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RestoreStats {
    /// Entries selected by the targets.
    pub resolved: u64,
    /// Binaries downloaded and written.
    pub restored: u64,
    /// Binaries that were already correct locally.
    pub skipped: u64,
    /// Binaries waiting for rehydration.
    pub pending: u64,
    pub chunks_downloaded: u64,
    /// Encrypted bytes read from the blob store.
    pub bytes_downloaded: u64,
    pub failed: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestoreReport {
    /// The version restored from; `None` when the repository is empty.
    pub version: Option<String>,
    pub stats: RestoreStats,
    /// Relative names that could not be restored yet because some of their
    /// chunks are in the archive tier. Rehydration has been requested if the
    /// run was configured to.
    pub pending_rehydration: Vec<String>,
    pub failures: Vec<ItemFailure>,
}

impl RestoreReport {
    pub fn status(&self) -> RunStatus {
        status(&self.failures)
    }
}

fn status(failures: &[ItemFailure]) -> RunStatus {
    match failures.is_empty() {
        true => RunStatus::Success,
        false => RunStatus::PartialFailure,
    }
}
