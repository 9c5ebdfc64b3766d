//! Uploading new content.
//!
//! A binary is either streamed from disk as a single chunk or split by the
//! configured chunker, with each chunk stored under its own hash. Concurrent
//! uploads of the same binary or the same chunk are coalesced through the
//! run's in-flight maps, so each distinct chunk is written at most once.

use super::{ArchiveRun, Hashed};
use crate::error::{ErrorKind, Result, describe, state_error, storage_error};
use crate::pipeline::Outlet;
use arca_chunk::Chunker;
use arca_crypto::Hash;
use arca_state::{BinaryProperties, ChunkInfo};
use arca_storage::{Folder, StorageTier, effective_tier};
use exn::ResultExt;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::instrument;

/// Chunks read ahead of the upload.
const CHUNK_QUEUE: usize = 2;

pub(super) async fn upload(run: &ArchiveRun, item: Hashed, out: &Outlet<Hashed>) -> Result<()> {
    let uploaded = run.binaries.get_or_try_init(item.hash, || upload_binary(run, &item)).await;
    match uploaded {
        Ok(_) => out.send(item).await,
        Err(err) => run.ctx.isolate(item.name(), err),
    }
}

#[instrument(level = "debug", skip_all, fields(path = %item.name(), hash = %item.hash))]
async fn upload_binary(run: &ArchiveRun, item: &Hashed) -> Result<BinaryProperties> {
    let size = item.size().unwrap_or_default();
    let props = match run.config.chunking {
        Chunker::WholeFile => upload_whole(run, item, size).await?,
        chunker => upload_chunked(run, item, chunker).await?,
    };
    run.stats.uploaded.incr();
    tracing::info!(
        path = %item.name(),
        hash = %props.hash,
        size = props.original_size,
        archived = props.archived_size,
        tier = %props.tier,
        "Archived binary"
    );
    Ok(props)
}

async fn upload_whole(run: &ArchiveRun, item: &Hashed, size: u64) -> Result<BinaryProperties> {
    let path = item.pair.path.clone();
    let chunk = run
        .chunks
        .get_or_try_init(item.hash, || stream_chunk(run, path, item.hash, size))
        .await?;
    let props = BinaryProperties {
        hash: item.hash,
        original_size: chunk.original_size,
        archived_size: chunk.archived_size,
        tier: chunk.tier,
        parent: None,
    };
    run.repo
        .add_binary_properties(std::slice::from_ref(&props))
        .await
        .map_err(state_error)?;
    Ok(props)
}

/// Encrypt a file from disk straight into the store as chunk `hash`,
/// checking on the way that it still hashes to `hash`.
async fn stream_chunk(run: &ArchiveRun, path: PathBuf, hash: Hash, size: u64) -> Result<ChunkInfo> {
    if let Some(known) = run.repo.get_chunk(&hash).await.map_err(state_error)? {
        return Ok(known);
    }
    let tier = effective_tier(run.config.tier, size);
    let key = Folder::Chunks.key(hash.to_string());
    let mut writer = run.store.writer(&key, tier).await.map_err(storage_error)?;
    let codec = run.codec.clone();
    let hasher = run.hasher.clone();
    let (archived, read, actual) = tokio::task::spawn_blocking(move || -> Result<(u64, u64, Hash)> {
        let file = File::open(&path).or_raise(|| ErrorKind::Io)?;
        let mut tee = Tee {
            inner: BufReader::new(file),
            copy: hasher.writer(io::sink()),
        };
        let archived = codec.encrypt(&mut tee, &mut writer).or_raise(|| ErrorKind::Io)?;
        writer.flush().or_raise(|| ErrorKind::Storage)?;
        let read = tee.copy.written();
        let (_, actual) = tee.copy.finish().or_raise(|| ErrorKind::Io)?;
        Ok((archived, read, actual))
    })
    .await
    .or_raise(|| ErrorKind::Task)??;

    if actual != hash {
        discard_blob(run, &key).await;
        exn::bail!(ErrorKind::Integrity(format!("binary changed while it was archived (now {actual})")));
    }
    let info = ChunkInfo {
        hash,
        original_size: read,
        archived_size: archived,
        tier,
    };
    run.repo.add_chunks(std::slice::from_ref(&info)).await.map_err(state_error)?;
    run.stats.chunks_uploaded.incr();
    run.stats.bytes_uploaded.add(archived);
    Ok(info)
}

async fn upload_chunked(run: &ArchiveRun, item: &Hashed, chunker: Chunker) -> Result<BinaryProperties> {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<(Hash, Vec<u8>)>(CHUNK_QUEUE);
    let hasher = run.hasher.clone();
    let path = item.pair.path.clone();
    let producer = tokio::task::spawn_blocking(move || -> Result<(Hash, u64)> {
        let file = File::open(&path).or_raise(|| ErrorKind::Io)?;
        let mut whole = hasher.writer(io::sink());
        for chunk in chunker.chunks(BufReader::new(file)) {
            let chunk = chunk.or_raise(|| ErrorKind::Io)?;
            whole.write_all(&chunk).or_raise(|| ErrorKind::Io)?;
            if tx.blocking_send((hasher.hash_bytes(&chunk), chunk)).is_err() {
                exn::bail!(ErrorKind::Cancelled);
            }
        }
        let size = whole.written();
        let (_, hash) = whole.finish().or_raise(|| ErrorKind::Io)?;
        Ok((hash, size))
    });

    let mut hashes = Vec::new();
    let mut chunks: HashMap<Hash, ChunkInfo> = HashMap::new();
    while let Some((hash, data)) = rx.recv().await {
        if run.ctx.cancel.is_cancelled() {
            exn::bail!(ErrorKind::Cancelled);
        }
        let info = store_chunk(run, hash, data).await?;
        hashes.push(hash);
        chunks.insert(hash, info);
    }
    let (actual, size) = producer.await.or_raise(|| ErrorKind::Task)??;
    if actual != item.hash {
        exn::bail!(ErrorKind::Integrity(format!("binary changed while it was archived (now {actual})")));
    }

    let props = BinaryProperties {
        hash: item.hash,
        original_size: size,
        archived_size: chunks.values().map(|chunk| chunk.archived_size).sum(),
        tier: stored_tier(&chunks).unwrap_or_else(|| effective_tier(run.config.tier, size)),
        parent: None,
    };
    match hashes.as_slice() {
        [single] if *single == item.hash => {
            run.repo
                .add_binary_properties(std::slice::from_ref(&props))
                .await
                .map_err(state_error)?;
        },
        _ => {
            run.repo.add_chunked_binary(&props, &hashes).await.map_err(state_error)?;
        },
    }
    tracing::debug!(path = %item.name(), chunks = hashes.len(), distinct = chunks.len(), "Stored chunk list");
    Ok(props)
}

/// Coldest tier any of `chunks` is actually stored in, which decides when
/// the whole binary can be read.
fn stored_tier(chunks: &HashMap<Hash, ChunkInfo>) -> Option<StorageTier> {
    chunks.values().map(|chunk| chunk.tier).max()
}

/// Store an in-memory chunk under its hash, unless the repository already
/// has it.
pub(super) async fn store_chunk(run: &ArchiveRun, hash: Hash, data: Vec<u8>) -> Result<ChunkInfo> {
    run.chunks
        .get_or_try_init(hash, || async move {
            if let Some(known) = run.repo.get_chunk(&hash).await.map_err(state_error)? {
                tracing::trace!(%hash, "Chunk already archived");
                return Ok(known);
            }
            let size = data.len() as u64;
            let tier = effective_tier(run.config.tier, size);
            let codec = run.codec.clone();
            let encrypted = tokio::task::spawn_blocking(move || codec.encrypt_to_vec(&data))
                .await
                .or_raise(|| ErrorKind::Task)?
                .or_raise(|| ErrorKind::Io)?;
            run.store
                .write(&Folder::Chunks.key(hash.to_string()), &encrypted, tier)
                .await
                .map_err(storage_error)?;
            let info = ChunkInfo {
                hash,
                original_size: size,
                archived_size: encrypted.len() as u64,
                tier,
            };
            run.repo.add_chunks(std::slice::from_ref(&info)).await.map_err(state_error)?;
            run.stats.chunks_uploaded.incr();
            run.stats.bytes_uploaded.add(info.archived_size);
            tracing::trace!(%hash, size, archived = info.archived_size, %tier, "Uploaded chunk");
            Ok(info)
        })
        .await
}

pub(super) async fn discard_blob(run: &ArchiveRun, key: &Path) {
    if let Err(err) = run.store.delete(key).await {
        tracing::warn!(key = %key.display(), error = %describe(&err), "Failed to delete discarded blob");
    }
}

/// Reader that copies everything it reads into a writer.
struct Tee<R, W> {
    inner: R,
    copy: W,
}

impl<R: Read, W: Write> Read for Tee<R, W> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.copy.write_all(&buf[..n])?;
        Ok(n)
    }
}
