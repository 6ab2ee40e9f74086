//! Worker definitions and handles

use crate::process::Process;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::warn;

type RunFn = dyn Fn(Process) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// A named unit of work to be run by a `Supervisor`.
///
/// The body is a closure rather than a future so that a retrying worker can
/// be started again after it fails.
#[derive(Clone)]
pub struct Worker {
    pub(crate) name: String,
    pub(crate) requires: Vec<String>,
    pub(crate) retry: bool,
    pub(crate) run: Arc<RunFn>,
}

impl Worker {
    pub fn new<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(Process) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            requires: Vec::new(),
            retry: false,
            run: Arc::new(move |process| Box::pin(run(process))),
        }
    }

    /// Workers that must call `Process::ready` before this one starts.
    #[must_use]
    pub fn requires<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires.extend(names.into_iter().map(Into::into));
        self
    }

    /// Restart the worker with backoff when it returns an error.
    #[must_use]
    pub fn retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("requires", &self.requires)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Control over a started worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub(crate) name: String,
    pub(crate) token: CancellationToken,
    pub(crate) done: watch::Receiver<bool>,
    pub(crate) grace: Duration,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the worker (and its children) to stop.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Wait for the worker to finish.
    pub async fn wait(&self) {
        let mut done = self.done.clone();
        // A closed channel also means the worker is gone.
        let _ = done.wait_for(|finished| *finished).await;
    }

    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    /// Shut the worker down and wait for it, giving up after the grace period.
    ///
    /// Returns `false` if the worker had to be abandoned.
    pub async fn stop(&self) -> bool {
        self.shutdown();
        if tokio::time::timeout(self.grace, self.wait()).await.is_err() {
            warn!(worker = %self.name, "worker did not stop within grace period, abandoning");
            return false;
        }
        true
    }
}
