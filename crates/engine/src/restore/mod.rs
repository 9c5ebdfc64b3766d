//! The restore run.
//!
//! ```text
//! resolve ─▶ verify ─▶ download
//! ```
//!
//! `resolve` streams the current entries of the chosen version that match
//! the targets. `verify` workers skip binaries that are already correct
//! locally, and `download` workers fetch, decrypt and check the rest before
//! moving them into place. Binaries with chunks in the archive tier are
//! reported as pending rehydration instead of failing.

mod download;
mod resolve;

use crate::Engine;
use crate::context::{Counter, InFlight, RunContext, lock};
use crate::error::{ErrorKind, Result, describe, state_error};
use crate::pipeline::Pipeline;
use crate::report::{ItemFailure, RestoreReport, RestoreStats};
use arca_config::RestoreConfig;
use arca_crypto::{Codec, ContentHasher, Hash};
use arca_state::{BinaryProperties, PointerFileEntry, Repository};
use arca_storage::BlobHandle;
use exn::ResultExt;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::instrument;

const RESOLVE_QUEUE: usize = 1000;
const DOWNLOAD_QUEUE: usize = 16;

/// An entry selected for restore, with the properties of its content.
#[derive(Clone, Debug)]
pub(crate) struct Planned {
    pub(crate) entry: PointerFileEntry,
    pub(crate) properties: BinaryProperties,
}

impl Planned {
    pub(crate) fn name(&self) -> &str {
        &self.entry.relative_name
    }
}

#[derive(Debug, Default)]
pub(crate) struct RestoreCounters {
    pub(crate) resolved: Counter,
    pub(crate) restored: Counter,
    pub(crate) skipped: Counter,
    pub(crate) chunks_downloaded: Counter,
    pub(crate) bytes_downloaded: Counter,
}

pub(crate) struct RestoreRun {
    pub(crate) config: RestoreConfig,
    pub(crate) store: BlobHandle,
    pub(crate) codec: Codec,
    pub(crate) hasher: ContentHasher,
    pub(crate) repo: Repository,
    pub(crate) version: String,
    pub(crate) ctx: RunContext,
    pub(crate) stats: RestoreCounters,
    /// Relative names waiting for rehydration.
    pub(crate) pending: Mutex<Vec<String>>,
    /// Decrypted containers on local disk, or `None` while archived.
    pub(crate) containers: InFlight<Hash, Option<PathBuf>>,
    /// Blobs rehydration was already requested for.
    pub(crate) rehydrating: Mutex<HashSet<PathBuf>>,
    /// Hidden directory for decrypted containers, removed after the run.
    pub(crate) scratch: PathBuf,
}

impl RestoreRun {
    pub(crate) fn mark_pending(&self, name: &str) {
        tracing::info!(path = %name, "Waiting for rehydration");
        lock(&self.pending).push(name.to_string());
    }

    async fn remove_scratch(&self) {
        match tokio::fs::remove_dir_all(&self.scratch).await {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %self.scratch.display(), %err, "Failed to remove container scratch directory");
            },
            _ => {},
        }
    }

    fn report(&self) -> RestoreReport {
        let failures = self.ctx.take_failures();
        let mut pending = std::mem::take(&mut *lock(&self.pending));
        pending.sort();
        let stats = RestoreStats {
            resolved: self.stats.resolved.get(),
            restored: self.stats.restored.get(),
            skipped: self.stats.skipped.get(),
            pending: pending.len() as u64,
            chunks_downloaded: self.stats.chunks_downloaded.get(),
            bytes_downloaded: self.stats.bytes_downloaded.get(),
            failed: failures.len() as u64,
        };
        RestoreReport {
            version: Some(self.version.clone()),
            stats,
            pending_rehydration: pending,
            failures,
        }
    }
}

#[instrument(skip_all, fields(root = %config.root.display()))]
pub(crate) async fn restore(engine: &Engine, mut config: RestoreConfig) -> Result<RestoreReport> {
    config.validate().or_raise(|| ErrorKind::Config)?;
    config.log_fields();
    engine.verify().await?;

    let snapshot = engine
        .states
        .open_read_only(config.version.as_deref())
        .await
        .map_err(state_error)?;
    let Some(snapshot) = snapshot else {
        if let Some(version) = config.version {
            exn::bail!(ErrorKind::VersionNotFound(version));
        }
        tracing::info!("Repository has no versions yet, nothing to restore");
        return Ok(empty_report(&config.targets));
    };
    tracing::info!(version = snapshot.version(), "Restore started");

    let scratch = config.root.join(format!(".arca-containers-{}", std::process::id()));
    let run = Arc::new(RestoreRun {
        store: Arc::clone(&engine.store),
        codec: engine.codec.clone(),
        hasher: engine.hasher.clone(),
        repo: snapshot.repository().clone(),
        version: snapshot.version().to_string(),
        ctx: RunContext::new(engine.cancel.child_token()),
        stats: RestoreCounters::default(),
        pending: Mutex::default(),
        containers: InFlight::default(),
        rehydrating: Mutex::default(),
        scratch,
        config,
    });

    let result = run_stages(Arc::clone(&run)).await;
    run.remove_scratch().await;
    snapshot.close().await;
    if let Err(err) = result {
        tracing::error!(error = %describe(&err), "Restore aborted");
        return Err(err);
    }

    let report = run.report();
    tracing::info!(
        version = ?report.version,
        resolved = report.stats.resolved,
        restored = report.stats.restored,
        skipped = report.stats.skipped,
        pending = report.stats.pending,
        bytes_downloaded = report.stats.bytes_downloaded,
        failed = report.stats.failed,
        "Restore complete"
    );
    Ok(report)
}

/// Report for a repository without any version: every specific target is
/// missing.
fn empty_report(targets: &[String]) -> RestoreReport {
    let failures: Vec<ItemFailure> = targets
        .iter()
        .filter(|target| !target.is_empty())
        .map(|target| ItemFailure::new(target, "not found in repository"))
        .collect();
    RestoreReport {
        version: None,
        stats: RestoreStats {
            failed: failures.len() as u64,
            ..RestoreStats::default()
        },
        pending_rehydration: Vec::new(),
        failures,
    }
}

async fn run_stages(run: Arc<RestoreRun>) -> Result<()> {
    let mut pipeline = Pipeline::new(run.ctx.cancel.clone());
    let (planned, planned_rx) = pipeline.queue(RESOLVE_QUEUE);
    let (downloads, downloads_rx) = pipeline.queue(DOWNLOAD_QUEUE);

    pipeline.spawn("resolve", resolve::resolve(Arc::clone(&run), planned));

    let verify_run = Arc::clone(&run);
    pipeline.spawn_workers("verify", run.config.hash_parallelism, planned_rx, move |item| {
        let run = Arc::clone(&verify_run);
        let downloads = downloads.clone();
        async move { download::verify(&run, item, &downloads).await }
    });

    let download_run = Arc::clone(&run);
    pipeline.spawn_workers("download", run.config.transfer_parallelism, downloads_rx, move |item| {
        let run = Arc::clone(&download_run);
        async move { download::download(&run, item).await }
    });

    pipeline.join().await
}
