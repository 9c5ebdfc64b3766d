use super::{ArchiveRun, Hashed};
use crate::error::{Result, state_error};
use crate::pipeline::{Outlet, next};
use crate::report::ItemFailure;
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;

/// Decide where each hashed pair goes next.
///
/// Content the working state already knows needs no upload. New binaries at
/// or below the pack threshold go to the packer, the rest to the uploaders.
pub(super) async fn route(
    run: Arc<ArchiveRun>,
    mut input: Receiver<Hashed>,
    uploads: Outlet<Hashed>,
    packs: Outlet<Hashed>,
    stored: Outlet<Hashed>,
) -> Result<()> {
    while let Some(item) = next(&mut input, &run.ctx.cancel).await {
        let known = run.repo.get_binary_properties(&item.hash).await.map_err(state_error)?;
        match (known, item.size()) {
            (Some(_), size) => {
                if size.is_some() {
                    run.stats.deduplicated.incr();
                }
                tracing::trace!(path = %item.name(), hash = %item.hash, "Content already archived");
                stored.send(item).await?;
            },
            (None, None) => run.ctx.fail(ItemFailure::new(
                item.name(),
                format!("pointer file refers to content {} that is not in the repository", item.hash),
            )),
            (None, Some(size)) if run.config.pack_threshold.is_some_and(|threshold| size <= threshold) => {
                packs.send(item).await?;
            },
            (None, Some(_)) => uploads.send(item).await?,
        }
    }
    Ok(())
}
