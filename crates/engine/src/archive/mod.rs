//! The archive run.
//!
//! ```text
//! index ─▶ hash ─▶ route ─┬─▶ upload ──┬─▶ pointer ─▶ state
//!                         ├─▶ pack ────┤
//!                         └────────────┘
//! ```
//!
//! `index` walks the root on a blocking thread. `hash` workers establish
//! each pair's content hash. `route` looks the hash up in the working state
//! and sends known content straight on, small new binaries to the packer
//! and everything else to the `upload` workers. `pointer` workers write
//! pointer files and `state` batches the resulting entries into the working
//! database. Deletion markers, the commit and local removal happen once the
//! pipeline has drained.

mod finalize;
mod hash;
mod pack;
mod route;
mod upload;

use crate::Engine;
use crate::context::{Counter, InFlight, RunContext, lock};
use crate::error::{ErrorKind, Result, describe, state_error};
use crate::fs::FileStamp;
use crate::index::{Index, IndexedPair, is_below};
use crate::pipeline::{Outlet, Pipeline};
use crate::pointer::PointerFile;
use crate::report::{ArchiveReport, ArchiveStats, ItemFailure};
use arca_config::ArchiveConfig;
use arca_crypto::{Codec, ContentHasher, Hash};
use arca_state::{BinaryProperties, ChunkInfo, PointerFileEntry, Repository};
use arca_storage::BlobHandle;
use exn::ResultExt;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use time::UtcDateTime;
use tracing::instrument;

const INDEX_QUEUE: usize = 1000;
const HASH_QUEUE: usize = 1000;
const UPLOAD_QUEUE: usize = 16;
const POINTER_QUEUE: usize = 1000;
const STATE_QUEUE: usize = 1000;

/// What is known locally about a pair once its hash is established.
#[derive(Clone, Debug)]
pub(crate) enum Local {
    /// The binary exists, with the stamp it had when it was hashed.
    Binary(FileStamp),
    /// Only the pointer file exists; the binary was removed after an
    /// earlier archive.
    PointerOnly(PointerFile),
}

#[derive(Clone, Debug)]
pub(crate) struct Hashed {
    pub(crate) pair: IndexedPair,
    pub(crate) hash: Hash,
    pub(crate) local: Local,
}

impl Hashed {
    pub(crate) fn name(&self) -> &str {
        &self.pair.relative_name
    }

    /// Size of the local binary, `None` for pointer-only pairs.
    pub(crate) fn size(&self) -> Option<u64> {
        match &self.local {
            Local::Binary(stamp) => Some(stamp.size),
            Local::PointerOnly(_) => None,
        }
    }

    fn times(&self) -> (UtcDateTime, UtcDateTime) {
        match &self.local {
            Local::Binary(stamp) => (stamp.created, stamp.modified),
            Local::PointerOnly(pointer) => (pointer.created, pointer.modified),
        }
    }

    pub(crate) fn entry(&self) -> PointerFileEntry {
        let (creation_time, last_write_time) = self.times();
        PointerFileEntry {
            relative_name: self.pair.relative_name.clone(),
            hash: self.hash,
            creation_time,
            last_write_time,
            is_deleted: false,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ArchiveCounters {
    pub(crate) indexed: Counter,
    pub(crate) hashed: Counter,
    pub(crate) deduplicated: Counter,
    pub(crate) uploaded: Counter,
    pub(crate) chunks_uploaded: Counter,
    pub(crate) bytes_uploaded: Counter,
    pub(crate) pointers_written: Counter,
    pub(crate) entries_written: Counter,
    pub(crate) removed_local: Counter,
}

/// Everything the stages of one archive run share.
pub(crate) struct ArchiveRun {
    pub(crate) config: ArchiveConfig,
    pub(crate) store: BlobHandle,
    pub(crate) codec: Codec,
    pub(crate) hasher: ContentHasher,
    pub(crate) repo: Repository,
    pub(crate) version: String,
    pub(crate) ctx: RunContext,
    pub(crate) stats: ArchiveCounters,
    /// Relative names found locally.
    seen: Mutex<HashSet<String>>,
    /// Directories that could not be fully listed. Nothing below them is
    /// marked deleted.
    unlisted: Mutex<Vec<String>>,
    pub(crate) binaries: InFlight<Hash, BinaryProperties>,
    pub(crate) chunks: InFlight<Hash, ChunkInfo>,
    /// Binaries to delete once the new version is committed.
    pub(crate) removals: Mutex<Vec<(String, PathBuf)>>,
}

impl ArchiveRun {
    fn index(&self, out: &Outlet<IndexedPair>) -> Result<()> {
        for item in Index::new(&self.config.root) {
            match item {
                Ok(pair) => {
                    self.stats.indexed.incr();
                    lock(&self.seen).insert(pair.relative_name.clone());
                    out.blocking_send(pair)?;
                },
                Err(failure) => {
                    lock(&self.unlisted).push(failure.path.clone());
                    self.ctx.fail(failure);
                },
            }
        }
        tracing::info!(indexed = self.stats.indexed.get(), "Indexing complete");
        Ok(())
    }

    /// Write deletion markers for current entries that were not found
    /// locally.
    async fn record_deletions(&self) -> Result<u64> {
        let seen = std::mem::take(&mut *lock(&self.seen));
        let unlisted = std::mem::take(&mut *lock(&self.unlisted));
        if unlisted.iter().any(|dir| dir == ".") {
            tracing::warn!("Root directory could not be listed, not recording deletions");
            return Ok(0);
        }
        let deleted = self
            .repo
            .delete_entries(&self.version, |name| {
                !seen.contains(name) && !unlisted.iter().any(|dir| is_below(name, dir))
            })
            .await
            .map_err(state_error)?;
        if deleted > 0 {
            tracing::info!(deleted, "Recorded deletions");
        }
        Ok(deleted)
    }

    async fn remove_local(&self) {
        let removals = std::mem::take(&mut *lock(&self.removals));
        for (name, path) in removals {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    tracing::debug!(path = %name, "Removed local binary");
                    self.stats.removed_local.incr();
                },
                Err(err) => self.ctx.fail(ItemFailure::new(name, format!("cannot remove local binary: {err}"))),
            }
        }
    }

    fn report(&self, version: Option<String>, deleted: u64) -> ArchiveReport {
        let failures = self.ctx.take_failures();
        let stats = ArchiveStats {
            indexed: self.stats.indexed.get(),
            hashed: self.stats.hashed.get(),
            deduplicated: self.stats.deduplicated.get(),
            uploaded: self.stats.uploaded.get(),
            chunks_uploaded: self.stats.chunks_uploaded.get(),
            bytes_uploaded: self.stats.bytes_uploaded.get(),
            pointers_written: self.stats.pointers_written.get(),
            entries_written: self.stats.entries_written.get(),
            deleted,
            removed_local: self.stats.removed_local.get(),
            failed: failures.len() as u64,
        };
        ArchiveReport {
            version,
            stats,
            failures,
        }
    }
}

#[instrument(skip_all, fields(root = %config.root.display()))]
pub(crate) async fn archive(engine: &Engine, config: ArchiveConfig) -> Result<ArchiveReport> {
    config.validate().or_raise(|| ErrorKind::Config)?;
    config.log_fields();
    engine.verify().await?;
    let state = engine.states.begin().await.map_err(state_error)?;
    tracing::info!(version = state.version(), base = ?state.base(), "Archive started");

    let run = Arc::new(ArchiveRun {
        store: Arc::clone(&engine.store),
        codec: engine.codec.clone(),
        hasher: engine.hasher.clone(),
        repo: state.repository().clone(),
        version: state.version().to_string(),
        ctx: RunContext::new(engine.cancel.child_token()),
        stats: ArchiveCounters::default(),
        seen: Mutex::default(),
        unlisted: Mutex::default(),
        binaries: InFlight::default(),
        chunks: InFlight::default(),
        removals: Mutex::default(),
        config,
    });

    let deleted = match run_stages(Arc::clone(&run)).await {
        Ok(()) => run.record_deletions().await,
        Err(err) => Err(err),
    };
    let deleted = match deleted {
        Ok(deleted) => deleted,
        Err(err) => {
            if let Err(discard) = engine.states.discard(state).await {
                tracing::warn!(error = %describe(&discard), "Failed to discard working state");
            }
            return Err(err);
        },
    };
    let version = engine.states.commit(state).await.map_err(state_error)?;
    run.remove_local().await;

    let report = run.report(version, deleted);
    tracing::info!(
        version = ?report.version,
        indexed = report.stats.indexed,
        uploaded = report.stats.uploaded,
        deduplicated = report.stats.deduplicated,
        bytes_uploaded = report.stats.bytes_uploaded,
        deleted = report.stats.deleted,
        failed = report.stats.failed,
        "Archive complete"
    );
    Ok(report)
}

async fn run_stages(run: Arc<ArchiveRun>) -> Result<()> {
    let mut pipeline = Pipeline::new(run.ctx.cancel.clone());
    let (indexed, indexed_rx) = pipeline.queue(INDEX_QUEUE);
    let (hashed, hashed_rx) = pipeline.queue(HASH_QUEUE);
    let (uploads, uploads_rx) = pipeline.queue(UPLOAD_QUEUE);
    let (packs, packs_rx) = pipeline.queue(HASH_QUEUE);
    let (stored, stored_rx) = pipeline.queue(POINTER_QUEUE);
    let (entries, entries_rx) = pipeline.queue(STATE_QUEUE);

    let index_run = Arc::clone(&run);
    pipeline.spawn_blocking("index", move || index_run.index(&indexed));

    let hash_run = Arc::clone(&run);
    pipeline.spawn_workers("hash", run.config.hash_parallelism, indexed_rx, move |pair| {
        let run = Arc::clone(&hash_run);
        let hashed = hashed.clone();
        async move { hash::hash(&run, pair, &hashed).await }
    });

    pipeline.spawn(
        "route",
        route::route(Arc::clone(&run), hashed_rx, uploads, packs, stored.clone()),
    );

    let upload_run = Arc::clone(&run);
    let upload_out = stored.clone();
    pipeline.spawn_workers("upload", run.config.transfer_parallelism, uploads_rx, move |item| {
        let run = Arc::clone(&upload_run);
        let stored = upload_out.clone();
        async move { upload::upload(&run, item, &stored).await }
    });

    pipeline.spawn("pack", pack::pack(Arc::clone(&run), packs_rx, stored));

    let pointer_run = Arc::clone(&run);
    pipeline.spawn_workers("pointer", run.config.hash_parallelism, stored_rx, move |item| {
        let run = Arc::clone(&pointer_run);
        let entries = entries.clone();
        async move { finalize::write_pointer(&run, item, &entries).await }
    });

    pipeline.spawn("state", finalize::write_entries(Arc::clone(&run), entries_rx));

    pipeline.join().await
}
