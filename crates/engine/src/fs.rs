use std::fs::{File, FileTimes, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use time::UtcDateTime;

/// Size and timestamps of a local binary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FileStamp {
    pub(crate) size: u64,
    pub(crate) created: UtcDateTime,
    pub(crate) modified: UtcDateTime,
}

impl FileStamp {
    /// Platforms that cannot report a creation time get the modification
    /// time instead.
    pub(crate) fn from_metadata(metadata: &Metadata) -> io::Result<Self> {
        let modified = UtcDateTime::from(metadata.modified()?);
        let created = metadata.created().map(UtcDateTime::from).unwrap_or(modified);
        Ok(Self {
            size: metadata.len(),
            created,
            modified,
        })
    }

    pub(crate) async fn of(path: &Path) -> io::Result<Self> {
        Self::from_metadata(&tokio::fs::metadata(path).await?)
    }
}

/// Set the modification time of an open file, and its creation time where
/// the platform allows it.
pub(crate) fn set_times(file: &File, created: UtcDateTime, modified: UtcDateTime) -> io::Result<()> {
    let times = FileTimes::new().set_modified(modified.into());
    #[cfg(windows)]
    let times = {
        use std::os::windows::fs::FileTimesExt;
        times.set_created(created.into())
    };
    #[cfg(target_os = "macos")]
    let times = {
        use std::os::macos::fs::FileTimesExt;
        times.set_created(created.into())
    };
    #[cfg(not(any(windows, target_os = "macos")))]
    let _ = created;
    file.set_times(times)
}

/// Hidden sibling a download is written to before it is renamed into place.
pub(crate) fn partial_path(target: &Path) -> PathBuf {
    let name = target.file_name().map(|name| name.to_string_lossy()).unwrap_or_default();
    target.with_file_name(format!(".{name}.arca-partial"))
}

/// Remove a file, treating "already gone" as success.
pub(crate) async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
