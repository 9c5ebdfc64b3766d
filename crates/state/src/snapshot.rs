//! State snapshots and repository versions.
//!
//! Every version is one encrypted SQLite file under `states/<version>`.
//! Snapshots never change once uploaded, so a decrypted copy in the local
//! cache directory (`<cache_dir>/<version>.db`) is valid forever.

use crate::error::{ErrorKind, Result};
use crate::{Database, Repository};
use arca_crypto::Codec;
use arca_storage::{BlobHandle, Folder, StorageTier};
use exn::ResultExt;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Duration, UtcDateTime};
use tokio::sync::Mutex;
use tracing::instrument;

/// Format of version names. Colons are replaced with dashes so names are
/// safe as file names and object keys, and names sort chronologically.
pub const VERSION_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]-[minute]-[second]");

fn parse_version(name: &str) -> Option<UtcDateTime> {
    UtcDateTime::parse(name, VERSION_FORMAT).ok()
}

/// Name for a version created at `now` that sorts after `latest`.
pub fn next_version_name(latest: Option<&str>, now: UtcDateTime) -> Result<String> {
    let mut candidate = now.truncate_to_second();
    if let Some(latest) = latest.and_then(parse_version)
        && candidate <= latest
    {
        candidate = latest + Duration::SECOND;
    }
    candidate.format(VERSION_FORMAT).or_raise(|| ErrorKind::InvalidData("version name"))
}

/// A downloaded version, open read-only.
#[derive(Debug)]
pub struct Snapshot {
    version: String,
    db: Database,
    repo: Repository,
}
impl Snapshot {
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    pub async fn close(self) {
        self.db.close().await;
    }
}

/// The writable database of an archive run.
///
/// Starts as a copy of the latest version (or empty) and becomes the next
/// version on [`StateStore::commit`] if anything changed.
#[derive(Debug)]
pub struct WorkingState {
    version: String,
    base: Option<String>,
    db: Database,
    repo: Repository,
    path: PathBuf,
}
impl WorkingState {
    /// Name the version will get if it is committed. Entries written during
    /// the run carry this name.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The version this working state was copied from.
    pub fn base(&self) -> Option<&str> {
        self.base.as_deref()
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }
}

/// Moves state snapshots between the blob store and the local cache.
pub struct StateStore {
    store: BlobHandle,
    codec: Codec,
    cache_dir: PathBuf,
    fetch_lock: Mutex<()>,
}

impl StateStore {
    pub fn new(store: BlobHandle, codec: Codec, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            codec,
            cache_dir: cache_dir.into(),
            fetch_lock: Mutex::new(()),
        }
    }

    fn cached_path(&self, version: &str) -> PathBuf {
        self.cache_dir.join(format!("{version}.db"))
    }

    async fn ensure_cache_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.cache_dir).await.or_raise(|| ErrorKind::Io)
    }

    /// Names of all versions, oldest first. Objects under `states/` whose
    /// names are not version names are ignored.
    pub async fn list_versions(&self) -> Result<Vec<String>> {
        let names = self.store.list_states().await.or_raise(|| ErrorKind::Storage)?;
        Ok(names
            .into_iter()
            .filter(|name| {
                let valid = parse_version(name).is_some();
                if !valid {
                    tracing::debug!(name = %name, "Ignoring foreign object in states folder");
                }
                valid
            })
            .collect())
    }

    pub async fn latest_version(&self) -> Result<Option<String>> {
        Ok(self.list_versions().await?.pop())
    }

    /// Download and decrypt `version` into the cache, unless it is cached
    /// already. Returns the path of the cached database.
    #[instrument(level = "debug", skip(self))]
    async fn fetch(&self, version: &str) -> Result<PathBuf> {
        let _guard = self.fetch_lock.lock().await;
        let target = self.cached_path(version);
        if tokio::fs::try_exists(&target).await.or_raise(|| ErrorKind::Io)? {
            tracing::trace!(version, "Using cached state snapshot");
            return Ok(target);
        }
        self.ensure_cache_dir().await?;

        let reader = self
            .store
            .reader(&Folder::States.key(version))
            .await
            .or_raise(|| ErrorKind::Storage)?;
        let partial = self.cache_dir.join(format!(".{version}.db.partial"));
        let codec = self.codec.clone();
        let output = partial.clone();
        let decrypted = tokio::task::spawn_blocking(move || -> arca_crypto::error::Result<u64> {
            let file = std::fs::File::create(&output).or_raise(|| arca_crypto::error::ErrorKind::Io)?;
            codec.decrypt(BufReader::new(reader), BufWriter::new(file))
        })
        .await
        .or_raise(|| ErrorKind::Io)?;

        let bytes = match decrypted {
            Ok(bytes) => bytes,
            Err(err) => {
                _ = tokio::fs::remove_file(&partial).await;
                if matches!(&*err, arca_crypto::error::ErrorKind::Decrypt) {
                    return Err(err.raise(ErrorKind::WrongPassphrase(version.to_string())));
                }
                return Err(err.raise(ErrorKind::Io));
            },
        };
        tokio::fs::rename(&partial, &target).await.or_raise(|| ErrorKind::Io)?;
        tracing::info!(version, bytes, "Downloaded state snapshot");
        Ok(target)
    }

    /// Open a version read-only.
    ///
    /// `version` may be any version name; the newest snapshot at or before
    /// it is opened, which holds exactly the entries up to that point.
    /// `None` opens the latest. Returns `None` if there is no such snapshot.
    pub async fn open_read_only(&self, version: Option<&str>) -> Result<Option<Snapshot>> {
        let versions = self.list_versions().await?;
        let resolved = match version {
            Some(requested) => versions.into_iter().rev().find(|name| name.as_str() <= requested),
            None => versions.into_iter().next_back(),
        };
        let Some(version) = resolved else {
            return Ok(None);
        };
        let path = self.fetch(&version).await?;
        let db = Database::open_read_only(&path).await?;
        let repo = Repository::from(&db);
        Ok(Some(Snapshot { version, db, repo }))
    }

    /// Start an archive run on a private copy of the latest version.
    #[instrument(level = "debug", skip(self))]
    pub async fn begin(&self) -> Result<WorkingState> {
        let base = self.latest_version().await?;
        let version = next_version_name(base.as_deref(), UtcDateTime::now())?;
        self.ensure_cache_dir().await?;

        let path = self.cache_dir.join(format!(".{version}.db.working"));
        remove_database_files(&path).await?;
        if let Some(base) = &base {
            let cached = self.fetch(base).await?;
            tokio::fs::copy(&cached, &path).await.or_raise(|| ErrorKind::Io)?;
        }
        let db = Database::connect(&path).await?;
        let repo = Repository::from(&db);
        tracing::debug!(version, base = ?base, "Started working state");
        Ok(WorkingState {
            version,
            base,
            db,
            repo,
            path,
        })
    }

    /// Upload the working state as a new version if anything changed.
    ///
    /// Returns the new version name, or `None` when nothing changed (no
    /// snapshot is created then).
    #[instrument(level = "debug", skip_all, fields(version = %state.version))]
    pub async fn commit(&self, state: WorkingState) -> Result<Option<String>> {
        let WorkingState { version, db, repo, path, .. } = state;
        let changed = repo.has_pending_changes();
        db.close().await;
        if !changed {
            remove_database_files(&path).await?;
            tracing::info!("No changes, no new state version");
            return Ok(None);
        }

        Database::compact(&path).await?;
        let mut writer = self
            .store
            .writer(&Folder::States.key(&version), StorageTier::Hot)
            .await
            .or_raise(|| ErrorKind::Storage)?;
        let codec = self.codec.clone();
        let input = path.clone();
        let uploaded = tokio::task::spawn_blocking(move || -> arca_crypto::error::Result<u64> {
            let file = std::fs::File::open(&input).or_raise(|| arca_crypto::error::ErrorKind::Io)?;
            let written = codec.encrypt(BufReader::new(file), &mut writer)?;
            writer.flush().or_raise(|| arca_crypto::error::ErrorKind::Io)?;
            Ok(written)
        })
        .await
        .or_raise(|| ErrorKind::Io)?
        .or_raise(|| ErrorKind::Storage)?;

        tokio::fs::rename(&path, self.cached_path(&version)).await.or_raise(|| ErrorKind::Io)?;
        tracing::info!(version, bytes = uploaded, "Uploaded new state version");
        Ok(Some(version))
    }

    /// Throw a working state away without uploading it.
    pub async fn discard(&self, state: WorkingState) -> Result<()> {
        state.db.close().await;
        remove_database_files(&state.path).await
    }
}

/// Remove a database file and its WAL side files, if present.
async fn remove_database_files(path: &Path) -> Result<()> {
    let mut wal = path.as_os_str().to_owned();
    wal.push("-wal");
    let mut shm = path.as_os_str().to_owned();
    shm.push("-shm");
    for file in [path.to_path_buf(), PathBuf::from(wal), PathBuf::from(shm)] {
        match tokio::fs::remove_file(&file).await {
            Ok(()) => {},
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
            Err(err) => return Err(exn::Exn::new(err).raise(ErrorKind::Io)),
        }
    }
    Ok(())
}
