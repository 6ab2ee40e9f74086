//! Supervisor implementation

use crate::backoff::ExponentialBackoff;
use crate::error::SupervisorError;
use crate::panic;
use crate::process::Process;
use crate::worker::{Worker, WorkerHandle};
use futures::FutureExt;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

const DEFAULT_GRACE: Duration = Duration::from_secs(10);

/// Runs workers and coordinates their shutdown.
///
/// Cloning is cheap; all clones share one set of workers.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    grace: Duration,
    shutdown_requested: AtomicBool,
    shutdown_done: CancellationToken,
    live: watch::Sender<usize>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    running: bool,
    pending: Vec<Worker>,
    workers: Vec<Registered>,
    ready: HashMap<String, watch::Sender<bool>>,
    errors: Vec<SupervisorError>,
}

struct Registered {
    requires: Vec<String>,
    handle: WorkerHandle,
}

/// Decrements the live count and marks the worker done when its task ends.
struct Finished {
    supervisor: Supervisor,
    done: watch::Sender<bool>,
}

impl Drop for Finished {
    fn drop(&mut self) {
        self.done.send_replace(true);
        self.supervisor.inner.live.send_modify(|live| *live = live.saturating_sub(1));
    }
}

impl Supervisor {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_grace(name, DEFAULT_GRACE)
    }

    /// A supervisor that waits `grace` for each shutdown step before abandoning workers.
    pub fn with_grace(name: impl Into<String>, grace: Duration) -> Self {
        panic::install_hook();
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                grace,
                shutdown_requested: AtomicBool::new(false),
                shutdown_done: CancellationToken::new(),
                live: watch::Sender::new(0),
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn grace(&self) -> Duration {
        self.inner.grace
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a top-level worker. Workers registered after `run` has
    /// started are started immediately.
    pub fn supervise(&self, worker: Worker) {
        let running = {
            let mut state = self.state();
            if !state.running {
                state.pending.push(worker.clone());
            }
            state.running
        };
        if running {
            self.start(worker, None);
        }
    }

    /// Start every registered worker and wait until they have all finished
    /// or shutdown has completed. Returns every recorded failure.
    pub async fn run(&self) -> Vec<SupervisorError> {
        let pending = {
            let mut state = self.state();
            state.running = true;
            std::mem::take(&mut state.pending)
        };
        info!(supervisor = %self.inner.name, workers = pending.len(), "starting workers");
        for worker in pending {
            self.start(worker, None);
        }

        let mut live = self.inner.live.subscribe();
        tokio::select! {
            _ = async { live.wait_for(|live| *live == 0).await.is_ok() } => {}
            () = self.inner.shutdown_done.cancelled() => {}
        }

        std::mem::take(&mut self.state().errors)
    }

    /// Request coordinated shutdown. Safe to call any number of times.
    pub fn shutdown(&self) {
        if self.inner.shutdown_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(supervisor = %self.inner.name, "shutting down");
        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor.shutdown_in_layers().await;
            supervisor.inner.shutdown_done.cancel();
        });
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Names of workers that have called `ready`.
    pub fn ready_workers(&self) -> Vec<String> {
        let state = self.state();
        let mut names: Vec<String> = state
            .ready
            .iter()
            .filter(|(_, ready)| *ready.borrow())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub(crate) fn mark_ready(&self, name: &str) {
        debug!(worker = %name, "ready");
        self.state()
            .ready
            .entry(name.to_string())
            .or_insert_with(|| watch::Sender::new(false))
            .send_replace(true);
    }

    fn ready_receiver(&self, name: &str) -> watch::Receiver<bool> {
        self.state()
            .ready
            .entry(name.to_string())
            .or_insert_with(|| watch::Sender::new(false))
            .subscribe()
    }

    fn record(&self, error: SupervisorError) {
        error!(supervisor = %self.inner.name, "{error}");
        self.state().errors.push(error);
    }

    pub(crate) fn start(&self, worker: Worker, parent: Option<&CancellationToken>) -> WorkerHandle {
        let token = parent.map_or_else(CancellationToken::new, CancellationToken::child_token);
        let (done, done_rx) = watch::channel(false);
        let handle = WorkerHandle {
            name: worker.name.clone(),
            token: token.clone(),
            done: done_rx,
            grace: self.inner.grace,
        };

        if parent.is_none() {
            self.state().workers.push(Registered {
                requires: worker.requires.clone(),
                handle: handle.clone(),
            });
            if self.is_shutting_down() {
                debug!(worker = %worker.name, "not starting worker during shutdown");
                token.cancel();
                done.send_replace(true);
                return handle;
            }
        }

        self.inner.live.send_modify(|live| *live += 1);
        let finished = Finished {
            supervisor: self.clone(),
            done,
        };
        let span = info_span!("worker", name = %worker.name);
        let supervisor = self.clone();
        tokio::spawn(async move {
            let _finished = finished;
            supervisor.run_worker(worker, token, span).await;
        });
        handle
    }

    async fn run_worker(&self, worker: Worker, token: CancellationToken, span: Span) {
        for dependency in &worker.requires {
            let mut ready = self.ready_receiver(dependency);
            debug!(worker = %worker.name, %dependency, "waiting for dependency");
            tokio::select! {
                () = token.cancelled() => return,
                became_ready = async { ready.wait_for(|ready| *ready).await.is_ok() } => {
                    if !became_ready {
                        return;
                    }
                }
            }
        }

        let mut backoff = ExponentialBackoff::default();
        loop {
            let process = Process::new(self.clone(), worker.name.clone(), token.clone(), span.clone());
            let started = Instant::now();
            let outcome = AssertUnwindSafe((worker.run)(process).instrument(span.clone()))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => {
                    debug!(worker = %worker.name, "worker exited");
                    return;
                }
                Ok(Err(error)) if worker.retry => {
                    if token.is_cancelled() {
                        info!(worker = %worker.name, "worker exited with error during shutdown: {error:#}");
                        return;
                    }
                    if started.elapsed() > backoff.max() {
                        backoff.reset();
                    }
                    let delay = backoff.next_backoff();
                    warn!(worker = %worker.name, ?delay, "worker failed, restarting: {error:#}");
                    tokio::select! {
                        () = token.cancelled() => return,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Ok(Err(error)) => {
                    self.record(SupervisorError::Worker {
                        name: worker.name.clone(),
                        error,
                    });
                    self.shutdown();
                    return;
                }
                Err(payload) => {
                    self.record(SupervisorError::Panic {
                        name: worker.name.clone(),
                        message: panic::message(payload.as_ref()),
                        backtrace: panic::take_backtrace(),
                    });
                    self.shutdown();
                    return;
                }
            }
        }
    }

    /// Top-level workers grouped by dependency depth, deepest first.
    fn shutdown_layers(&self) -> Vec<Vec<WorkerHandle>> {
        let state = self.state();
        let requires: HashMap<&str, &[String]> = state
            .workers
            .iter()
            .map(|w| (w.handle.name.as_str(), w.requires.as_slice()))
            .collect();

        let mut layers: BTreeMap<usize, Vec<WorkerHandle>> = BTreeMap::new();
        for worker in &state.workers {
            let level = dependency_depth(&worker.handle.name, &requires, &mut Vec::new());
            layers.entry(level).or_default().push(worker.handle.clone());
        }
        layers.into_values().rev().collect()
    }

    async fn shutdown_in_layers(&self) {
        for layer in self.shutdown_layers() {
            for handle in &layer {
                handle.shutdown();
            }
            let waiting = join_all(layer.iter().map(WorkerHandle::wait));
            if tokio::time::timeout(self.inner.grace, waiting).await.is_err() {
                let abandoned: Vec<&str> = layer
                    .iter()
                    .filter(|handle| !handle.is_finished())
                    .map(WorkerHandle::name)
                    .collect();
                warn!(?abandoned, "workers did not stop within grace period, abandoning");
            }
        }

        // Children are cancelled with their parents but may still be winding down.
        let mut live = self.inner.live.subscribe();
        let children = async { live.wait_for(|live| *live == 0).await.is_ok() };
        if tokio::time::timeout(self.inner.grace, children).await.is_err() {
            warn!(remaining = *self.inner.live.borrow(), "abandoning remaining workers");
        }
        info!(supervisor = %self.inner.name, "shutdown complete");
    }
}

/// Length of the longest `requires` chain below `name`.
fn dependency_depth<'a>(
    name: &'a str,
    requires: &HashMap<&'a str, &'a [String]>,
    visiting: &mut Vec<&'a str>,
) -> usize {
    if visiting.contains(&name) {
        return 0;
    }
    visiting.push(name);
    let result = requires
        .get(name)
        .and_then(|deps| {
            deps.iter()
                .map(|dep| 1 + dependency_depth(dep, requires, visiting))
                .max()
        })
        .unwrap_or(0);
    visiting.pop();
    result
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("name", &self.inner.name)
            .field("grace", &self.inner.grace)
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}
