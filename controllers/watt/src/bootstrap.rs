//! Bootstrap watcher
//!
//! Watches the initial source kinds under the empty watch id, which is what
//! gates the first snapshot. A kind the cluster does not serve yet (usually
//! a CRD that is not installed) is reported once as an error together with
//! an empty list, so it does not hold bootstrap back, and discovery is
//! re-run periodically until it shows up.

use crate::aggregator::BOOTSTRAP_WATCH_ID;
use crate::events::{K8sEvent, make_error_event};
use crate::kube_watch::{KindWatch, KindWatcher};
use std::sync::Arc;
use std::time::Duration;
use supervisor::{Process, Worker};
use tokio::sync::mpsc;
use tracing::{info, warn};
use watt_api::KubernetesWatchSpec;

pub const BOOTSTRAP_SOURCE: &str = "kubebootstrap";

const REDISCOVERY_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct KubeBootstrap {
    watcher: Arc<dyn KindWatcher>,
    kinds: Vec<String>,
    namespace: String,
    field_selector: String,
    label_selector: String,
    events: mpsc::Sender<K8sEvent>,
    rediscovery: Duration,
}

impl KubeBootstrap {
    pub fn new(
        watcher: Arc<dyn KindWatcher>,
        kinds: Vec<String>,
        namespace: String,
        field_selector: String,
        label_selector: String,
        events: mpsc::Sender<K8sEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            watcher,
            kinds,
            namespace,
            field_selector,
            label_selector,
            events,
            rediscovery: REDISCOVERY_INTERVAL,
        })
    }

    #[cfg(test)]
    fn with_rediscovery(mut self: Arc<Self>, interval: Duration) -> Arc<Self> {
        if let Some(bootstrap) = Arc::get_mut(&mut self) {
            bootstrap.rediscovery = interval;
        }
        self
    }

    pub fn worker(self: &Arc<Self>) -> Worker {
        let bootstrap = Arc::clone(self);
        Worker::new(BOOTSTRAP_SOURCE, move |p| {
            let bootstrap = Arc::clone(&bootstrap);
            async move { bootstrap.work(p).await }
        })
    }

    async fn work(&self, p: Process) -> anyhow::Result<()> {
        let mut pending = self.kinds.clone();
        let mut reported = Vec::new();
        if !self.start_pending(&p, &mut pending, &mut reported).await {
            return Ok(());
        }
        p.ready();

        let mut rediscovery = tokio::time::interval(self.rediscovery);
        rediscovery.tick().await;
        while !pending.is_empty() {
            tokio::select! {
                () = p.shutdown() => return Ok(()),
                _ = rediscovery.tick() => {}
            }
            info!(pending = ?pending, "retrying pending kinds");
            if let Err(e) = self.watcher.refresh().await {
                warn!("discovery failed: {e:#}");
                continue;
            }
            if !self.start_pending(&p, &mut pending, &mut reported).await {
                return Ok(());
            }
        }

        p.shutdown().await;
        Ok(())
    }

    /// Starts a watch for every pending kind that now resolves. Returns
    /// `false` if shutdown interrupted reporting.
    async fn start_pending(
        &self,
        p: &Process,
        pending: &mut Vec<String>,
        reported: &mut Vec<String>,
    ) -> bool {
        let mut still_pending = Vec::new();
        for kind in pending.drain(..) {
            let spec = KubernetesWatchSpec {
                kind: kind.clone(),
                namespace: self.namespace.clone(),
                field_selector: self.field_selector.clone(),
                label_selector: self.label_selector.clone(),
            };
            let watch = KindWatch::new(BOOTSTRAP_WATCH_ID.to_string(), &spec);
            let name = format!("{BOOTSTRAP_SOURCE}:{kind}");
            if let Some(worker) = self.watcher.watch(name, watch, self.events.clone()) {
                info!(%kind, "starting watch");
                p.go(worker);
                continue;
            }

            info!(%kind, "kind does not exist in the cluster at this time, will try later");
            if !reported.contains(&kind) {
                let error = make_error_event(
                    BOOTSTRAP_SOURCE,
                    format!("kind {kind:?} is not served by the cluster"),
                );
                let empty = K8sEvent::resources(BOOTSTRAP_WATCH_ID, kind.clone(), Vec::new());
                for event in [error, empty] {
                    tokio::select! {
                        () = p.shutdown() => return false,
                        sent = self.events.send(event) => {
                            if sent.is_err() {
                                return false;
                            }
                        }
                    }
                }
                reported.push(kind.clone());
            }
            still_pending.push(kind);
        }
        *pending = still_pending;
        true
    }
}
