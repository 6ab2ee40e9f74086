//! Invoker
//!
//! Numbers the snapshots the aggregator emits, keeps the last ten of them
//! for the snapshot API and tells every notify command where to fetch the
//! new one. While a round of notifications is running, newer snapshots
//! replace the one waiting rather than queueing behind it.

use anyhow::Context;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use supervisor::{Process, Worker};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub const INVOKER_WORKER: &str = "invoker";

/// Number of snapshots kept.
const HISTORY_LENGTH: u64 = 10;

/// The most recent snapshots by id.
#[derive(Debug, Default)]
pub struct SnapshotHistory {
    inner: Mutex<History>,
}

#[derive(Debug, Default)]
struct History {
    current: u64,
    snapshots: BTreeMap<u64, String>,
}

impl SnapshotHistory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, History> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `snapshot` under the next id and forgets those that fell out
    /// of the window. Ids start at 1.
    pub fn record(&self, snapshot: String) -> u64 {
        let mut history = self.lock();
        history.current += 1;
        let id = history.current;
        history.snapshots.insert(id, snapshot);
        let horizon = id.saturating_sub(HISTORY_LENGTH);
        history.snapshots.retain(|&kept, _| kept > horizon);
        id
    }

    pub fn get(&self, id: u64) -> Option<String> {
        self.lock().snapshots.get(&id).cloned()
    }

    /// Retained ids, oldest first.
    pub fn ids(&self) -> Vec<u64> {
        self.lock().snapshots.keys().copied().collect()
    }
}

#[derive(Debug)]
pub struct Invoker {
    snapshots: tokio::sync::Mutex<mpsc::Receiver<String>>,
    history: Arc<SnapshotHistory>,
    notify: Vec<String>,
    api_authority: String,
    /// Latest snapshot not yet picked up by the notifier
    pending: Mutex<Option<String>>,
}

impl Invoker {
    pub fn new(
        snapshots: mpsc::Receiver<String>,
        history: Arc<SnapshotHistory>,
        notify: Vec<String>,
        api_authority: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            snapshots: tokio::sync::Mutex::new(snapshots),
            history,
            notify,
            api_authority,
            pending: Mutex::new(None),
        })
    }

    pub fn worker(self: &Arc<Self>) -> Worker {
        let invoker = Arc::clone(self);
        Worker::new(INVOKER_WORKER, move |p| {
            let invoker = Arc::clone(&invoker);
            async move { invoker.work(p).await }
        })
    }

    fn pending(&self) -> MutexGuard<'_, Option<String>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn work(self: &Arc<Self>, p: Process) -> anyhow::Result<()> {
        let mut snapshots = self.snapshots.lock().await;
        p.ready();

        let (signal_tx, signal_rx) = mpsc::channel::<()>(1);
        let notifier = p.go(self.notifier(signal_rx));

        loop {
            tokio::select! {
                () = p.shutdown() => break,
                snapshot = snapshots.recv() => {
                    let Some(snapshot) = snapshot else { break };
                    if self.pending().replace(snapshot).is_some() {
                        debug!("replacing snapshot waiting for notification");
                    }
                    // A full channel means the notifier has a wakeup queued already.
                    let _ = signal_tx.try_send(());
                }
            }
        }

        notifier.stop().await;
        Ok(())
    }

    /// Child worker that records and announces pending snapshots.
    fn notifier(self: &Arc<Self>, signals: mpsc::Receiver<()>) -> Worker {
        let invoker = Arc::clone(self);
        let signals = Arc::new(tokio::sync::Mutex::new(signals));
        Worker::new("invoker-notify", move |p| {
            let invoker = Arc::clone(&invoker);
            let signals = Arc::clone(&signals);
            async move {
                let mut signals = signals.lock().await;
                loop {
                    tokio::select! {
                        () = p.shutdown() => return Ok(()),
                        signal = signals.recv() => {
                            if signal.is_none() {
                                return Ok(());
                            }
                            let snapshot = invoker.pending().take();
                            if let Some(snapshot) = snapshot {
                                invoker.process(&p, snapshot).await;
                            }
                        }
                    }
                }
            }
        })
    }

    async fn process(&self, p: &Process, snapshot: String) {
        let id = self.history.record(snapshot);
        let url = format!("http://{}/snapshots/{id}", self.api_authority);
        info!(id, "new snapshot");

        for command in &self.notify {
            if p.is_shutdown() {
                return;
            }
            match notify(p, command, &url).await {
                Ok(()) => debug!(notify = %command, id, "notified"),
                Err(e) => warn!(notify = %command, id, "notification failed: {e:#}"),
            }
        }
    }
}

/// Runs `<command> <url>` through the shell once and waits for it.
async fn notify(p: &Process, command: &str, url: &str) -> anyhow::Result<()> {
    let line = format!("{command} {url}");
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(&line)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("starting {line:?}"))?;
    let (kill_tx, kill_rx) = oneshot::channel::<()>();

    let run = async move {
        let status = tokio::select! {
            status = child.wait() => status.with_context(|| format!("waiting for {line:?}"))?,
            _ = kill_rx => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                anyhow::bail!("{line:?} killed on shutdown");
            }
        };
        if !status.success() {
            anyhow::bail!("{line:?} exited with {status}");
        }
        Ok(())
    };

    p.do_clean(run, async move {
        let _ = kill_tx.send(());
        Ok(())
    })
    .await
}
