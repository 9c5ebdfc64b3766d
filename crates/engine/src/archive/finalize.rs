use super::{ArchiveRun, Hashed, Local};
use crate::context::lock;
use crate::error::{ErrorKind, Result, state_error};
use crate::pipeline::{Outlet, next};
use crate::pointer::PointerFile;
use arca_state::PointerFileEntry;
use exn::ResultExt;
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;

/// Entries upserted per transaction.
const STATE_BATCH: usize = 256;

/// Bring the pointer file of a stored pair up to date and emit its entry.
pub(super) async fn write_pointer(run: &ArchiveRun, item: Hashed, out: &Outlet<PointerFileEntry>) -> Result<()> {
    if let Local::Binary(stamp) = &item.local {
        let pointer = PointerFile {
            hash: item.hash,
            size: stamp.size,
            created: stamp.created,
            modified: stamp.modified,
        };
        let written = pointer
            .write_if_changed(&item.pair.pointer_path())
            .await
            .or_raise(|| ErrorKind::Io);
        match written {
            Ok(true) => run.stats.pointers_written.incr(),
            Ok(false) => {},
            Err(err) => return run.ctx.isolate(item.name(), err),
        }
        if run.config.remove_local {
            lock(&run.removals).push((item.pair.relative_name.clone(), item.pair.path.clone()));
        }
    }
    out.send(item.entry()).await
}

/// Upsert entries into the working state in batches.
pub(super) async fn write_entries(run: Arc<ArchiveRun>, mut input: Receiver<PointerFileEntry>) -> Result<()> {
    let mut batch = Vec::with_capacity(STATE_BATCH);
    while let Some(entry) = next(&mut input, &run.ctx.cancel).await {
        batch.push(entry);
        while batch.len() < STATE_BATCH
            && let Ok(entry) = input.try_recv()
        {
            batch.push(entry);
        }
        let written = run
            .repo
            .upsert_pointer_file_entries(&run.version, &batch)
            .await
            .map_err(state_error)?;
        run.stats.entries_written.add(written);
        tracing::debug!(batch = batch.len(), written, "Upserted pointer file entries");
        batch.clear();
    }
    Ok(())
}
