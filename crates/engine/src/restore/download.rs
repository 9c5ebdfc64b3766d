//! Fetching binaries.
//!
//! A binary is materialized into a hidden partial file next to its target,
//! hashed on the way, and only renamed into place once the hash matches.
//! Content that does not check out is downloaded once more before the item
//! fails.

use super::{Planned, RestoreRun};
use crate::context::lock;
use crate::error::{Error, ErrorKind, Result, crypto_error, describe, state_error, storage_error};
use crate::fs::{partial_path, remove_if_exists, set_times};
use crate::pipeline::Outlet;
use crate::pointer::{PointerFile, pointer_path};
use arca_crypto::Hash;
use arca_state::BinaryProperties;
use arca_storage::error::ErrorKind as StorageErrorKind;
use arca_storage::{Folder, StorageTier};
use exn::ResultExt;
use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Downloads per binary before a failed integrity check is final.
const ATTEMPTS: u32 = 2;

enum Fetched {
    Restored,
    /// Some chunk is in the archive tier.
    Pending,
}

/// Skip binaries that already hold the right content locally.
pub(super) async fn verify(run: &RestoreRun, item: Planned, out: &Outlet<Planned>) -> Result<()> {
    let target = run.config.root.join(&item.entry.relative_name);
    match local_hash(run, &target, item.properties.original_size).await {
        Ok(Some(hash)) if hash == item.entry.hash => {
            tracing::debug!(path = %item.name(), "Binary already restored");
            run.stats.skipped.incr();
            match finish_pointer(run, &item, &target).await {
                Ok(()) => Ok(()),
                Err(err) => run.ctx.isolate(item.name(), err),
            }
        },
        Ok(_) => out.send(item).await,
        Err(err) => run.ctx.isolate(item.name(), err),
    }
}

/// Hash of the local binary at `target`, or `None` when there is none or
/// its size already rules it out.
async fn local_hash(run: &RestoreRun, target: &Path, size: u64) -> Result<Option<Hash>> {
    let metadata = match tokio::fs::symlink_metadata(target).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).or_raise(|| ErrorKind::Io),
    };
    if !metadata.is_file() {
        let err = io::Error::new(io::ErrorKind::AlreadyExists, "something other than a file is in the way");
        return Err(err).or_raise(|| ErrorKind::Io);
    }
    if metadata.len() != size {
        return Ok(None);
    }
    let hasher = run.hasher.clone();
    let path = target.to_path_buf();
    let hash = tokio::task::spawn_blocking(move || hasher.hash_file(&path))
        .await
        .or_raise(|| ErrorKind::Task)?
        .or_raise(|| ErrorKind::Io)?;
    Ok(Some(hash))
}

pub(super) async fn download(run: &RestoreRun, item: Planned) -> Result<()> {
    match restore_binary(run, &item).await {
        Ok(Fetched::Restored) => {
            run.stats.restored.incr();
            tracing::info!(path = %item.name(), size = item.properties.original_size, "Restored binary");
            Ok(())
        },
        Ok(Fetched::Pending) => {
            run.mark_pending(item.name());
            Ok(())
        },
        Err(err) => run.ctx.isolate(item.name(), err),
    }
}

async fn restore_binary(run: &RestoreRun, item: &Planned) -> Result<Fetched> {
    let target = run.config.root.join(&item.entry.relative_name);
    let partial = partial_path(&target);
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await.or_raise(|| ErrorKind::Io)?;
    }

    let mut attempt = 1;
    let fetched = loop {
        let result = match fetch(run, &item.properties, &partial).await {
            Ok(Some(actual)) if actual != item.properties.hash => Err(Error::from(ErrorKind::Integrity(format!(
                "restored content hashes to {actual}"
            )))),
            other => other,
        };
        match result {
            Ok(fetched) => break fetched,
            Err(err) => {
                discard_partial(&partial).await;
                if attempt >= ATTEMPTS || !matches!(&*err, ErrorKind::Integrity(_)) {
                    return Err(err);
                }
                tracing::warn!(path = %item.name(), error = %describe(&err), "Downloading again");
                attempt += 1;
            },
        }
    };
    if fetched.is_none() {
        discard_partial(&partial).await;
        return Ok(Fetched::Pending);
    }

    let created = item.entry.creation_time;
    let modified = item.entry.last_write_time;
    let stamped = partial.clone();
    tokio::task::spawn_blocking(move || {
        let file = File::options().write(true).open(&stamped)?;
        set_times(&file, created, modified)
    })
    .await
    .or_raise(|| ErrorKind::Task)?
    .or_raise(|| ErrorKind::Io)?;
    tokio::fs::rename(&partial, &target).await.or_raise(|| ErrorKind::Io)?;
    finish_pointer(run, item, &target).await?;
    Ok(Fetched::Restored)
}

/// Write the content of `props` to `partial` and return its hash, or `None`
/// if it cannot be read until rehydrated.
async fn fetch(run: &RestoreRun, props: &BinaryProperties, partial: &Path) -> Result<Option<Hash>> {
    if let Some(parent) = props.parent {
        let Some(container) = container(run, parent.hash).await? else {
            return Ok(None);
        };
        let hasher = run.hasher.clone();
        let partial = partial.to_path_buf();
        let size = props.original_size;
        let hash = tokio::task::spawn_blocking(move || -> Result<Hash> {
            let mut source = File::open(&container).or_raise(|| ErrorKind::Io)?;
            source.seek(SeekFrom::Start(parent.offset)).or_raise(|| ErrorKind::Io)?;
            let file = File::create(&partial).or_raise(|| ErrorKind::Io)?;
            let mut writer = hasher.writer(BufWriter::new(file));
            let copied = io::copy(&mut source.take(size), &mut writer).or_raise(|| ErrorKind::Io)?;
            if copied != size {
                exn::bail!(ErrorKind::Integrity(format!("container {} ends early", parent.hash)));
            }
            let (_, hash) = writer.finish().or_raise(|| ErrorKind::Io)?;
            Ok(hash)
        })
        .await
        .or_raise(|| ErrorKind::Task)??;
        return Ok(Some(hash));
    }

    let list = run.repo.chunk_list(&props.hash).await.map_err(state_error)?;
    let chunks = match list.is_empty() {
        true => vec![props.hash],
        false => list,
    };
    let file = tokio::fs::File::create(partial).await.or_raise(|| ErrorKind::Io)?.into_std().await;
    let mut writer = run.hasher.writer(BufWriter::new(file));
    for (i, hash) in chunks.iter().enumerate() {
        let key = Folder::Chunks.key(hash.to_string());
        let reader = match run.store.reader(&key).await {
            Ok(reader) => reader,
            Err(err) if matches!(&*err, StorageErrorKind::Archived(_)) => {
                request_rehydration(run, key, &chunks[i + 1..]).await;
                return Ok(None);
            },
            Err(err) => return Err(storage_error(err)),
        };
        let codec = run.codec.clone();
        let (returned, read) = tokio::task::spawn_blocking(move || -> Result<_> {
            let mut reader = Counted::new(reader);
            codec.decrypt(&mut reader, &mut writer).map_err(crypto_error)?;
            Ok((writer, reader.count))
        })
        .await
        .or_raise(|| ErrorKind::Task)??;
        writer = returned;
        run.stats.chunks_downloaded.incr();
        run.stats.bytes_downloaded.add(read);
    }
    let (_, hash) = writer.finish().or_raise(|| ErrorKind::Io)?;
    Ok(Some(hash))
}

/// Path of the decrypted container `hash` on local disk, downloading it on
/// first use. `None` while the container is archived.
async fn container(run: &RestoreRun, hash: Hash) -> Result<Option<PathBuf>> {
    run.containers
        .get_or_try_init(hash, || async move {
            let key = Folder::Chunks.key(hash.to_string());
            let reader = match run.store.reader(&key).await {
                Ok(reader) => reader,
                Err(err) if matches!(&*err, StorageErrorKind::Archived(_)) => {
                    request_rehydration(run, key, &[]).await;
                    return Ok(None);
                },
                Err(err) => return Err(storage_error(err)),
            };
            tokio::fs::create_dir_all(&run.scratch).await.or_raise(|| ErrorKind::Io)?;
            let path = run.scratch.join(hash.to_string());
            let codec = run.codec.clone();
            let hasher = run.hasher.clone();
            let out = path.clone();
            let (actual, read) = tokio::task::spawn_blocking(move || -> Result<(Hash, u64)> {
                let mut reader = Counted::new(reader);
                let file = File::create(&out).or_raise(|| ErrorKind::Io)?;
                let mut writer = hasher.writer(BufWriter::new(file));
                codec.decrypt(&mut reader, &mut writer).map_err(crypto_error)?;
                let (_, actual) = writer.finish().or_raise(|| ErrorKind::Io)?;
                Ok((actual, reader.count))
            })
            .await
            .or_raise(|| ErrorKind::Task)??;
            run.stats.chunks_downloaded.incr();
            run.stats.bytes_downloaded.add(read);
            if actual != hash {
                discard_partial(&path).await;
                exn::bail!(ErrorKind::Integrity(format!("container {hash} hashes to {actual}")));
            }
            tracing::debug!(container = %hash, "Downloaded container");
            Ok(Some(path))
        })
        .await
}

/// Ask for `archived` and every archived blob among `rest` to be
/// rehydrated, once per run, if the run is configured to.
async fn request_rehydration(run: &RestoreRun, archived: PathBuf, rest: &[Hash]) {
    if !run.config.request_rehydration {
        return;
    }
    let mut keys = vec![archived];
    for hash in rest {
        match run.repo.get_chunk(hash).await {
            Ok(Some(chunk)) if !chunk.tier.is_online() => keys.push(Folder::Chunks.key(hash.to_string())),
            Ok(_) => {},
            Err(err) => tracing::debug!(%hash, error = %describe(&err), "Cannot look up chunk tier"),
        }
    }
    for key in keys {
        let first = lock(&run.rehydrating).insert(key.clone());
        if !first {
            continue;
        }
        match run.store.rehydrate(&key, StorageTier::Cool).await {
            Ok(()) => tracing::info!(key = %key.display(), "Requested rehydration"),
            Err(err) => tracing::warn!(key = %key.display(), error = %describe(&err), "Rehydration request failed"),
        }
    }
}

/// Bring the pointer file next to a restored binary in line with the run's
/// settings.
async fn finish_pointer(run: &RestoreRun, item: &Planned, target: &Path) -> Result<()> {
    let path = pointer_path(target);
    if !run.config.keep_pointers {
        return remove_if_exists(&path).await.or_raise(|| ErrorKind::Io);
    }
    let pointer = PointerFile {
        hash: item.entry.hash,
        size: item.properties.original_size,
        created: item.entry.creation_time,
        modified: item.entry.last_write_time,
    };
    pointer.write_if_changed(&path).await.or_raise(|| ErrorKind::Io)?;
    Ok(())
}

async fn discard_partial(path: &Path) {
    if let Err(err) = remove_if_exists(path).await {
        tracing::warn!(path = %path.display(), %err, "Failed to remove partial download");
    }
}

/// Reader that counts the bytes read through it.
struct Counted<R> {
    inner: R,
    count: u64,
}

impl<R> Counted<R> {
    fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }
}

impl<R: Read> Read for Counted<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}
