use super::{Planned, RestoreRun};
use crate::error::{ErrorKind, Result, state_error};
use crate::index::is_below;
use crate::pipeline::Outlet;
use crate::report::ItemFailure;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;

/// Stream the entries selected by the run's targets. An empty target list
/// selects everything; a target selects the entry of that name and
/// everything below it. Entries selected by several targets are restored
/// once.
pub(super) async fn resolve(run: Arc<RestoreRun>, out: Outlet<Planned>) -> Result<()> {
    let targets = match run.config.targets.is_empty() {
        true => vec![String::new()],
        false => run.config.targets.clone(),
    };
    let mut selected: HashSet<String> = HashSet::new();

    for target in &targets {
        let mut matched = 0u64;
        let prefix = (!target.is_empty()).then_some(target.as_str());
        let mut entries = run.repo.current_entries(prefix, None);
        while let Some(current) = entries.next().await {
            if run.ctx.cancel.is_cancelled() {
                exn::bail!(ErrorKind::Cancelled);
            }
            let current = current.map_err(state_error)?;
            let name = current.entry.relative_name.clone();
            if !selects(target, &name) {
                continue;
            }
            matched += 1;
            if !selected.insert(name.clone()) {
                continue;
            }
            let Some(properties) = current.properties else {
                run.ctx.fail(ItemFailure::new(name, format!("no properties recorded for content {}", current.entry.hash)));
                continue;
            };
            run.stats.resolved.incr();
            out.send(Planned {
                entry: current.entry,
                properties,
            })
            .await?;
        }
        if matched == 0 && !target.is_empty() {
            run.ctx.fail(ItemFailure::new(target, format!("not found in version {}", run.version)));
        }
    }
    tracing::info!(resolved = run.stats.resolved.get(), "Resolved restore targets");
    Ok(())
}

fn selects(target: &str, name: &str) -> bool {
    target.is_empty() || name == target || is_below(name, target)
}
