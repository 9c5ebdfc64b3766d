//! A small typed pipeline.
//!
//! Stages are tasks connected by bounded queues. Every stage owns the
//! sending halves ([`Outlet`]s) of its output queues, so a queue closes when
//! the last task feeding it finishes and its consumers drain what is left and
//! stop (close-on-drain). A stage that returns an error trips the run's
//! cancellation token; every other stage notices at its next send or receive
//! and unwinds (propagate-cancellation).

use crate::error::{ErrorKind, Result, describe};
use exn::ResultExt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Sending half of a stage queue.
pub(crate) struct Outlet<T> {
    tx: mpsc::Sender<T>,
    cancel: CancellationToken,
}

impl<T> Clone for Outlet<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T> Outlet<T> {
    /// Wait for room in the queue. Fails once the run is cancelled or every
    /// consumer is gone.
    pub(crate) async fn send(&self, item: T) -> Result<()> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => exn::bail!(ErrorKind::Cancelled),
            sent = self.tx.send(item) => sent.map_err(|_| ErrorKind::Cancelled.into()),
        }
    }

    /// [`send`](Self::send) for producers running on a blocking thread.
    pub(crate) fn blocking_send(&self, item: T) -> Result<()> {
        if self.cancel.is_cancelled() {
            exn::bail!(ErrorKind::Cancelled);
        }
        self.tx.blocking_send(item).map_err(|_| ErrorKind::Cancelled.into())
    }
}

/// Receive the next item, or `None` once the queue is drained and closed or
/// the run is cancelled.
pub(crate) async fn next<T>(rx: &mut mpsc::Receiver<T>, cancel: &CancellationToken) -> Option<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        item = rx.recv() => item,
    }
}

pub(crate) struct Pipeline {
    tasks: JoinSet<(&'static str, Result<()>)>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub(crate) fn new(cancel: CancellationToken) -> Self {
        Self {
            tasks: JoinSet::new(),
            cancel,
        }
    }

    pub(crate) fn queue<T>(&self, capacity: usize) -> (Outlet<T>, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(capacity);
        let outlet = Outlet {
            tx,
            cancel: self.cancel.clone(),
        };
        (outlet, rx)
    }

    pub(crate) fn spawn<F>(&mut self, stage: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.tasks.spawn(async move { (stage, task.await) });
    }

    /// Run a blocking producer, such as a directory walk, as a stage.
    pub(crate) fn spawn_blocking<F>(&mut self, stage: &'static str, task: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.spawn(stage, async move {
            tokio::task::spawn_blocking(task).await.or_raise(|| ErrorKind::Task).and_then(|result| result)
        });
    }

    /// Start `workers` tasks that share one input queue and call `handler`
    /// for each item. An error from `handler` is fatal to the run; per-item
    /// failures must be recorded by the handler itself.
    pub(crate) fn spawn_workers<T, F, Fut>(
        &mut self,
        stage: &'static str,
        workers: usize,
        input: mpsc::Receiver<T>,
        handler: F,
    ) where
        T: Send + 'static,
        F: Fn(T) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let input = Arc::new(Mutex::new(input));
        for _ in 0..workers.max(1) {
            let input = Arc::clone(&input);
            let handler = handler.clone();
            let cancel = self.cancel.clone();
            self.spawn(stage, async move {
                loop {
                    let item = {
                        let mut rx = input.lock().await;
                        next(&mut rx, &cancel).await
                    };
                    let Some(item) = item else {
                        return Ok(());
                    };
                    handler(item).await?;
                }
            });
        }
    }

    /// Wait for every stage. The first real error wins over the
    /// cancellations it caused in other stages.
    pub(crate) async fn join(mut self) -> Result<()> {
        let mut first: Option<crate::error::Error> = None;
        while let Some(joined) = self.tasks.join_next().await {
            let (stage, result) = match joined {
                Ok(joined) => joined,
                Err(err) => ("unknown", Err(exn::Exn::new(err).raise(ErrorKind::Task))),
            };
            let Err(err) = result else {
                continue;
            };
            self.cancel.cancel();
            tracing::debug!(stage, error = %describe(&err), "Pipeline stage stopped");
            let replace = match &first {
                None => true,
                Some(existing) => matches!(**existing, ErrorKind::Cancelled) && !matches!(*err, ErrorKind::Cancelled),
            };
            if replace {
                first = Some(err);
            }
        }
        match first {
            Some(err) => Err(err),
            None if self.cancel.is_cancelled() => exn::bail!(ErrorKind::Cancelled),
            None => Ok(()),
        }
    }
}
