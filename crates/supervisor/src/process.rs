//! The capability handle passed to every running worker

use crate::supervisor::Supervisor;
use crate::worker::{Worker, WorkerHandle};
use anyhow::anyhow;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::Span;

/// Handle given to a worker body.
///
/// Exposes readiness publication, the shutdown signal, child spawning and
/// the worker's tracing span.
#[derive(Debug, Clone)]
pub struct Process {
    inner: Arc<ProcessInner>,
}

#[derive(Debug)]
struct ProcessInner {
    name: String,
    supervisor: Supervisor,
    token: CancellationToken,
    span: Span,
}

impl Process {
    pub(crate) fn new(
        supervisor: Supervisor,
        name: String,
        token: CancellationToken,
        span: Span,
    ) -> Self {
        Self {
            inner: Arc::new(ProcessInner {
                name,
                supervisor,
                token,
                span,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Mark this worker ready, releasing workers that require it.
    pub fn ready(&self) {
        self.inner.supervisor.mark_ready(&self.inner.name);
    }

    /// Completes once this worker has been asked to stop.
    pub fn shutdown(&self) -> WaitForCancellationFuture<'_> {
        self.inner.token.cancelled()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Token cancelled on shutdown, for handing to code outside the worker.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Start a child worker. Children are shut down with their parent.
    pub fn go(&self, worker: Worker) -> WorkerHandle {
        self.inner.supervisor.start(worker, Some(&self.inner.token))
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.inner.supervisor
    }

    /// Span the worker body runs in; attach it to tasks spawned on its behalf.
    pub fn span(&self) -> &Span {
        &self.inner.span
    }

    /// Run `run`, making sure `cleanup` executes if shutdown arrives first.
    ///
    /// After cleanup, `run` gets the supervisor's grace period to finish and
    /// is dropped if it does not, which is reported as an error.
    ///
    /// # Errors
    /// Returns the error of `run`, the error of `cleanup`, or an abandonment error.
    pub async fn do_clean<T, R, C>(&self, run: R, cleanup: C) -> anyhow::Result<T>
    where
        R: Future<Output = anyhow::Result<T>>,
        C: Future<Output = anyhow::Result<()>>,
    {
        tokio::pin!(run);
        tokio::select! {
            biased;
            result = &mut run => return result,
            () = self.inner.token.cancelled() => {}
        }

        let cleaned = cleanup.await;
        let grace = self.inner.supervisor.grace();
        let result = match tokio::time::timeout(grace, &mut run).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("{} abandoned after shutdown", self.inner.name)),
        };
        cleaned.and(result)
    }
}
