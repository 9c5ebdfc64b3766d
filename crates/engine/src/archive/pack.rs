//! Packing small binaries.
//!
//! Small binaries are concatenated into container chunks of at most
//! `container_size` plaintext bytes. Each member gets its own
//! [`BinaryProperties`] pointing at the container through a [`Parent`], with
//! its share of the container's archived size.

use super::upload::store_chunk;
use super::{ArchiveRun, Hashed};
use crate::error::{ErrorKind, Result, describe, state_error};
use crate::pipeline::{Outlet, next};
use crate::report::ItemFailure;
use arca_crypto::Hash;
use arca_state::{BinaryProperties, Parent};
use exn::ResultExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;

#[derive(Debug)]
struct Member {
    hash: Hash,
    offset: u64,
    size: u64,
}

/// The container being filled.
#[derive(Default)]
struct Container {
    buffer: Vec<u8>,
    members: Vec<Member>,
    /// Pairs waiting for each member's content to be stored.
    waiting: HashMap<Hash, Vec<Hashed>>,
}

impl Container {
    fn push(&mut self, item: Hashed, data: &[u8]) {
        self.members.push(Member {
            hash: item.hash,
            offset: self.buffer.len() as u64,
            size: data.len() as u64,
        });
        self.buffer.extend_from_slice(data);
        self.waiting.entry(item.hash).or_default().push(item);
    }

    fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

pub(super) async fn pack(run: Arc<ArchiveRun>, mut input: Receiver<Hashed>, out: Outlet<Hashed>) -> Result<()> {
    let mut packed: HashSet<Hash> = HashSet::new();
    let mut container = Container::default();
    let limit = run.config.container_size;

    while let Some(item) = next(&mut input, &run.ctx.cancel).await {
        if packed.contains(&item.hash) {
            out.send(item).await?;
            continue;
        }
        if let Some(waiting) = container.waiting.get_mut(&item.hash) {
            waiting.push(item);
            continue;
        }
        let data = match read_member(&run, &item).await {
            Ok(data) => data,
            Err(err) => {
                run.ctx.isolate(item.name(), err)?;
                continue;
            },
        };
        if !container.is_empty() && (container.buffer.len() + data.len()) as u64 > limit {
            flush(&run, std::mem::take(&mut container), &mut packed, &out).await?;
        }
        container.push(item, &data);
    }

    if !container.is_empty() && !run.ctx.cancel.is_cancelled() {
        flush(&run, container, &mut packed, &out).await?;
    }
    Ok(())
}

/// Read a small binary into memory and check it still has its hash.
async fn read_member(run: &ArchiveRun, item: &Hashed) -> Result<Vec<u8>> {
    let data = tokio::fs::read(&item.pair.path).await.or_raise(|| ErrorKind::Io)?;
    let hasher = run.hasher.clone();
    let (data, actual) = tokio::task::spawn_blocking(move || {
        let hash = hasher.hash_bytes(&data);
        (data, hash)
    })
    .await
    .or_raise(|| ErrorKind::Task)?;
    if actual != item.hash {
        exn::bail!(ErrorKind::Integrity(format!("binary changed while it was archived (now {actual})")));
    }
    Ok(data)
}

async fn flush(run: &ArchiveRun, container: Container, packed: &mut HashSet<Hash>, out: &Outlet<Hashed>) -> Result<()> {
    let Container {
        buffer,
        members,
        waiting,
    } = container;
    match store_container(run, buffer, &members).await {
        Ok(()) => {
            packed.extend(members.iter().map(|member| member.hash));
            for item in waiting.into_values().flatten() {
                out.send(item).await?;
            }
            Ok(())
        },
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            let reason = describe(&err);
            for item in waiting.into_values().flatten() {
                run.ctx.fail(ItemFailure::new(item.name(), reason.clone()));
            }
            Ok(())
        },
    }
}

async fn store_container(run: &ArchiveRun, buffer: Vec<u8>, members: &[Member]) -> Result<()> {
    let total = buffer.len() as u64;
    let hasher = run.hasher.clone();
    let (hash, buffer) = tokio::task::spawn_blocking(move || (hasher.hash_bytes(&buffer), buffer))
        .await
        .or_raise(|| ErrorKind::Task)?;
    let chunk = store_chunk(run, hash, buffer).await?;

    let props: Vec<BinaryProperties> = members
        .iter()
        .map(|member| BinaryProperties {
            hash: member.hash,
            original_size: member.size,
            archived_size: share(chunk.archived_size, member.size, total),
            tier: chunk.tier,
            parent: Some(Parent {
                hash: chunk.hash,
                offset: member.offset,
            }),
        })
        .collect();
    run.repo.add_binary_properties(&props).await.map_err(state_error)?;
    run.stats.uploaded.add(members.len() as u64);
    tracing::info!(
        container = %chunk.hash,
        members = members.len(),
        size = total,
        archived = chunk.archived_size,
        tier = %chunk.tier,
        "Archived container"
    );
    Ok(())
}

/// `part`'s proportional share of `archived`, rounded down.
fn share(archived: u64, part: u64, total: u64) -> u64 {
    if total == 0 {
        return 0;
    }
    let share = u128::from(archived) * u128::from(part) / u128::from(total);
    u64::try_from(share).unwrap_or(archived)
}
