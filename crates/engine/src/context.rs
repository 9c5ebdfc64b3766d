//! Per-run mutable state.
//!
//! Everything a run mutates (failure list, counters, in-flight caches) lives
//! in a context created for that run and dropped with it.

use crate::error::{Error, Result, describe};
use crate::report::ItemFailure;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

pub(crate) struct RunContext {
    pub(crate) cancel: CancellationToken,
    failures: Mutex<Vec<ItemFailure>>,
}

impl RunContext {
    pub(crate) fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            failures: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn fail(&self, failure: ItemFailure) {
        tracing::warn!(path = %failure.path, reason = %failure.reason, "Item failed");
        lock(&self.failures).push(failure);
    }

    /// Record `err` against `path` if it only concerns that item, or hand it
    /// back if the whole run has to stop.
    pub(crate) fn isolate(&self, path: &str, err: Error) -> Result<()> {
        if err.is_fatal() {
            return Err(err);
        }
        self.fail(ItemFailure::new(path, describe(&err)));
        Ok(())
    }

    /// Failures sorted by path.
    pub(crate) fn take_failures(&self) -> Vec<ItemFailure> {
        let mut failures = std::mem::take(&mut *lock(&self.failures));
        failures.sort_by(|a, b| a.path.cmp(&b.path));
        failures
    }
}

/// Lock a mutex, ignoring poisoning. Nothing guarded here can be left
/// half-updated by a panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
pub(crate) struct Counter(AtomicU64);

impl Counter {
    pub(crate) fn incr(&self) {
        self.add(1);
    }

    pub(crate) fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Coalesces concurrent work on the same key: the first caller runs the
/// initializer, everyone else waits for its result. A failed initializer
/// leaves the key empty so the next caller tries again.
pub(crate) struct InFlight<K, V> {
    cells: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> Default for InFlight<K, V> {
    fn default() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash, V: Clone> InFlight<K, V> {
    pub(crate) async fn get_or_try_init<E, F, Fut>(&self, key: K, init: F) -> std::result::Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
    {
        let cell = Arc::clone(lock(&self.cells).entry(key).or_default());
        cell.get_or_try_init(init).await.cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_in_flight_runs_initializer_once() {
        let cache: Arc<InFlight<&str, u64>> = Arc::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            tasks.spawn(async move {
                cache
                    .get_or_try_init("chunk", || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        Ok::<_, std::io::Error>(42)
                    })
                    .await
                    .unwrap()
            });
        }
        while let Some(value) = tasks.join_next().await {
            assert_eq!(value.unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_in_flight_retries_after_failure() {
        let cache: InFlight<u8, u8> = InFlight::default();
        let failed = cache.get_or_try_init(1, || async { Err::<u8, _>("offline") }).await;
        assert_eq!(failed, Err("offline"));
        let value = cache.get_or_try_init(1, || async { Ok::<_, &str>(7) }).await;
        assert_eq!(value, Ok(7));
    }

    #[test]
    fn test_isolate_keeps_fatal_errors() {
        let ctx = RunContext::new(CancellationToken::new());
        assert!(ctx.isolate("a.txt", ErrorKind::Storage.into()).is_ok());
        assert!(ctx.isolate("b.txt", ErrorKind::WrongPassphrase.into()).is_err());
        let failures = ctx.take_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].path, "a.txt");
        assert_eq!(failures[0].reason, "blob store error");
    }
}
