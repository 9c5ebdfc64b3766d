use super::{ArchiveRun, Hashed, Local};
use crate::error::{ErrorKind, Result};
use crate::fs::FileStamp;
use crate::index::IndexedPair;
use crate::pipeline::Outlet;
use crate::pointer::PointerFile;
use exn::ResultExt;

/// Establish the content hash of a pair and pass it on.
pub(super) async fn hash(run: &ArchiveRun, pair: IndexedPair, out: &Outlet<Hashed>) -> Result<()> {
    let name = pair.relative_name.clone();
    match hashed(run, pair).await {
        Ok(item) => out.send(item).await,
        Err(err) => run.ctx.isolate(&name, err),
    }
}

async fn hashed(run: &ArchiveRun, pair: IndexedPair) -> Result<Hashed> {
    if !pair.pair.has_binary() {
        let pointer = PointerFile::read(&pair.pointer_path()).await.or_raise(|| ErrorKind::Io)?;
        return Ok(Hashed {
            hash: pointer.hash,
            local: Local::PointerOnly(pointer),
            pair,
        });
    }

    let stamp = FileStamp::of(&pair.path).await.or_raise(|| ErrorKind::Io)?;
    if run.config.fast_hash
        && let Some(existing) = trusted_pointer(&pair, &stamp).await
    {
        tracing::trace!(path = %pair.relative_name, "Trusting pointer file hash");
        return Ok(Hashed {
            hash: existing.hash,
            local: Local::Binary(stamp),
            pair,
        });
    }

    let hasher = run.hasher.clone();
    let path = pair.path.clone();
    let hash = tokio::task::spawn_blocking(move || hasher.hash_file(&path))
        .await
        .or_raise(|| ErrorKind::Task)?
        .or_raise(|| ErrorKind::Io)?;
    run.stats.hashed.incr();
    tracing::trace!(path = %pair.relative_name, %hash, "Hashed binary");
    Ok(Hashed {
        hash,
        local: Local::Binary(stamp),
        pair,
    })
}

/// The pointer file next to the binary, if it reads and still matches
/// `stamp`. A broken pointer is simply rewritten later.
async fn trusted_pointer(pair: &IndexedPair, stamp: &FileStamp) -> Option<PointerFile> {
    if !pair.pair.has_pointer() {
        return None;
    }
    let pointer = PointerFile::read(&pair.pointer_path())
        .await
        .inspect_err(|err| tracing::debug!(path = %pair.relative_name, %err, "Ignoring unreadable pointer file"))
        .ok()?;
    pointer.matches(stamp.size, stamp.modified).then_some(pointer)
}
