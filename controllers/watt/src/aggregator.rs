//! Aggregator
//!
//! Folds Kubernetes and Consul events into one view of the world, asks the
//! watch hook which watches that view calls for, and emits a snapshot once
//! every watch the hook asked for has reported at least once.
//!
//! Kubernetes events arrive much faster than snapshots can be built, so
//! they are coalesced: every event is applied to state as soon as it is
//! read, but a dedicated child worker runs at most one notification at a
//! time and the main loop only hands it a new request when it is idle.
//! Consul events are applied and notified directly.

use crate::annotations::{is_annotated_kind, parse_annotation_resources};
use crate::events::{ConsulEvent, K8sEvent};
use crate::hook::WatchHook;
use crate::limiter::{Decision, Limiter};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use supervisor::{Process, Worker};
use tokio::sync::{Mutex, mpsc};
use tracing::{Instrument, debug, info, warn};
use watt_api::{
    ConsulSnapshot, ConsulWatchSpec, Endpoints, KubernetesWatchSpec, Resource, Snapshot, WatchSet,
    WattError,
};

pub const AGGREGATOR_WORKER: &str = "aggregator";

/// Capacity of the directive and snapshot channels.
pub const OUTPUT_CAPACITY: usize = 100;

/// Watch id of the bootstrap watcher.
pub const BOOTSTRAP_WATCH_ID: &str = "";

/// Senders feeding the aggregator.
#[derive(Debug, Clone)]
pub struct AggregatorInputs {
    pub kubernetes_events: mpsc::Sender<K8sEvent>,
    pub consul_events: mpsc::Sender<ConsulEvent>,
}

/// Where the aggregator publishes watch directives and snapshots.
#[derive(Debug, Clone)]
pub struct AggregatorOutputs {
    pub k8s_watches: mpsc::Sender<Vec<KubernetesWatchSpec>>,
    pub consul_watches: mpsc::Sender<Vec<ConsulWatchSpec>>,
    pub snapshots: mpsc::Sender<String>,
}

#[derive(Debug)]
struct Inputs {
    kubernetes_events: mpsc::Receiver<K8sEvent>,
    consul_events: mpsc::Receiver<ConsulEvent>,
}

#[derive(Debug, Default)]
struct Resources {
    /// Watch ids that have delivered at least one event
    ids: BTreeSet<String>,
    /// watch id -> kind -> latest list
    kubernetes: BTreeMap<String, BTreeMap<String, Vec<Resource>>>,
    /// Keyed by service name, so equally named services in different
    /// datacenters overwrite each other.
    consul: BTreeMap<String, Endpoints>,
}

#[derive(Debug)]
pub struct Aggregator {
    inputs: Mutex<Inputs>,
    outputs: AggregatorOutputs,
    required_kinds: Vec<String>,
    hook: Arc<dyn WatchHook>,
    limiter: Arc<dyn Limiter>,

    // Lock order: errors before resources.
    errors: RwLock<BTreeMap<String, Vec<WattError>>>,
    resources: RwLock<Resources>,

    /// Serialises notifications.
    notify_mux: Mutex<()>,
    /// Latched once the first snapshot may go out; written under `notify_mux`.
    bootstrapped: AtomicBool,
}

impl Aggregator {
    pub fn new(
        required_kinds: Vec<String>,
        hook: Arc<dyn WatchHook>,
        limiter: Arc<dyn Limiter>,
        outputs: AggregatorOutputs,
    ) -> (Arc<Self>, AggregatorInputs) {
        let (kubernetes_tx, kubernetes_rx) = mpsc::channel(1);
        let (consul_tx, consul_rx) = mpsc::channel(1);
        let aggregator = Arc::new(Self {
            inputs: Mutex::new(Inputs {
                kubernetes_events: kubernetes_rx,
                consul_events: consul_rx,
            }),
            outputs,
            required_kinds,
            hook,
            limiter,
            errors: RwLock::new(BTreeMap::new()),
            resources: RwLock::new(Resources::default()),
            notify_mux: Mutex::new(()),
            bootstrapped: AtomicBool::new(false),
        });
        let inputs = AggregatorInputs {
            kubernetes_events: kubernetes_tx,
            consul_events: consul_tx,
        };
        (aggregator, inputs)
    }

    /// The supervised worker running the intake loop.
    pub fn worker(self: &Arc<Self>) -> Worker {
        let aggregator = Arc::clone(self);
        Worker::new(AGGREGATOR_WORKER, move |p| {
            let aggregator = Arc::clone(&aggregator);
            async move { aggregator.work(p).await }
        })
    }

    /// Whether snapshots are being emitted. Never goes back to `false`.
    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::SeqCst)
    }

    async fn work(self: &Arc<Self>, p: Process) -> anyhow::Result<()> {
        let mut inputs = self.inputs.lock().await;
        let Inputs {
            kubernetes_events,
            consul_events,
        } = &mut *inputs;
        p.ready();

        let (process_tx, process_rx) = mpsc::channel::<()>(1);
        let processor = p.go(self.processor(process_rx));

        // Set when state has changed since the processor was last signalled.
        let mut dirty = false;
        loop {
            tokio::select! {
                () = p.shutdown() => break,
                Some(event) = kubernetes_events.recv() => {
                    self.set_kubernetes_resources(event);
                    dirty = true;
                }
                permit = process_tx.reserve(), if dirty => {
                    let Ok(permit) = permit else { break };
                    permit.send(());
                    dirty = false;
                    // Block for the next event rather than spinning on the
                    // processor channel.
                    tokio::select! {
                        () = p.shutdown() => break,
                        Some(event) = kubernetes_events.recv() => {
                            self.set_kubernetes_resources(event);
                            dirty = true;
                        }
                        Some(event) = consul_events.recv() => {
                            self.update_consul_resources(event);
                            self.maybe_notify(&p).await;
                        }
                        else => break,
                    }
                }
                Some(event) = consul_events.recv() => {
                    self.update_consul_resources(event);
                    self.maybe_notify(&p).await;
                }
                else => break,
            }
        }

        processor.stop().await;
        Ok(())
    }

    /// Child worker running one notification per signal.
    fn processor(self: &Arc<Self>, process_rx: mpsc::Receiver<()>) -> Worker {
        let aggregator = Arc::clone(self);
        let process_rx = Arc::new(Mutex::new(process_rx));
        Worker::new("aggregator-notify", move |p| {
            let aggregator = Arc::clone(&aggregator);
            let process_rx = Arc::clone(&process_rx);
            async move {
                let mut process_rx = process_rx.lock().await;
                loop {
                    tokio::select! {
                        () = p.shutdown() => return Ok(()),
                        signal = process_rx.recv() => match signal {
                            Some(()) => aggregator.maybe_notify(&p).await,
                            None => return Ok(()),
                        },
                    }
                }
            }
        })
    }

    fn read_errors(&self) -> RwLockReadGuard<'_, BTreeMap<String, Vec<WattError>>> {
        self.errors.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_errors(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Vec<WattError>>> {
        self.errors.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_resources(&self) -> RwLockReadGuard<'_, Resources> {
        self.resources.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_resources(&self) -> RwLockWriteGuard<'_, Resources> {
        self.resources.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_kubernetes_resources(&self, event: K8sEvent) {
        if !event.errors.is_empty() {
            let mut errors = self.write_errors();
            for error in event.errors {
                errors.entry(error.source.clone()).or_default().push(error);
            }
            return;
        }

        debug!(watch_id = %event.watch_id, kind = %event.kind, count = event.resources.len(), "kubernetes event");
        let mut resources = self.write_resources();
        resources.ids.insert(event.watch_id.clone());
        resources
            .kubernetes
            .entry(event.watch_id)
            .or_default()
            .insert(event.kind, event.resources);
    }

    fn update_consul_resources(&self, event: ConsulEvent) {
        debug!(watch_id = %event.watch_id, service = %event.endpoints.service, count = event.endpoints.endpoints.len(), "consul event");
        let mut resources = self.write_resources();
        resources.ids.insert(event.watch_id);
        resources
            .consul
            .insert(event.endpoints.service.clone(), event.endpoints);
    }

    /// The current view, with annotation resources expanded.
    pub fn snapshot(&self) -> Snapshot {
        let errors = self.read_errors();
        let resources = self.read_resources();

        let mut kubernetes: BTreeMap<String, Vec<Resource>> = BTreeMap::new();
        let mut errors = errors.clone();
        for by_kind in resources.kubernetes.values() {
            for (kind, list) in by_kind {
                kubernetes
                    .entry(kind.clone())
                    .or_default()
                    .extend(list.iter().cloned());
                for parent in list.iter().filter(|resource| is_annotated_kind(resource)) {
                    let (children, problems) = parse_annotation_resources(parent);
                    for child in children {
                        kubernetes.entry(child.kind.clone()).or_default().push(child);
                    }
                    for problem in problems {
                        errors.entry(problem.source.clone()).or_default().push(problem);
                    }
                }
            }
        }

        Snapshot {
            consul: ConsulSnapshot {
                endpoints: resources.consul.clone(),
            },
            kubernetes,
            errors,
        }
    }

    fn is_kubernetes_bootstrapped(&self) -> bool {
        let resources = self.read_resources();
        resources
            .kubernetes
            .get(BOOTSTRAP_WATCH_ID)
            .is_some_and(|by_kind| {
                self.required_kinds
                    .iter()
                    .all(|kind| by_kind.contains_key(kind))
            })
    }

    /// Every watch in `watches` has delivered at least once.
    fn is_complete(&self, watches: &WatchSet) -> bool {
        let resources = self.read_resources();
        let mut complete = true;
        for watch_id in watches.watch_ids() {
            if resources.ids.contains(&watch_id) {
                debug!(%watch_id, "initialized watch");
            } else {
                debug!(%watch_id, "waiting for watch");
                complete = false;
            }
        }
        complete
    }

    async fn maybe_notify(self: &Arc<Self>, p: &Process) {
        match self.limiter.limit(tokio::time::Instant::now()) {
            Decision::Now => self.notify(p).await,
            Decision::Defer(delay) => {
                let aggregator = Arc::clone(self);
                let p = p.clone();
                let span = p.span().clone();
                tokio::spawn(
                    async move {
                        tokio::select! {
                            () = p.shutdown() => {}
                            () = tokio::time::sleep(delay) => aggregator.notify(&p).await,
                        }
                    }
                    .instrument(span),
                );
            }
            Decision::Drop => {}
        }
    }

    async fn notify(&self, p: &Process) {
        let _serial = self.notify_mux.lock().await;

        if !self.is_kubernetes_bootstrapped() {
            return;
        }

        let watches = self.watches(p).await;
        debug!(
            kubernetes = watches.kubernetes_watches.len(),
            consul = watches.consul_watches.len(),
            "found watches"
        );
        if !publish(p, &self.outputs.k8s_watches, watches.kubernetes_watches.clone()).await
            || !publish(p, &self.outputs.consul_watches, watches.consul_watches.clone()).await
        {
            return;
        }

        if !self.is_bootstrapped() && self.is_complete(&watches) {
            info!("bootstrapped");
            self.bootstrapped.store(true, Ordering::SeqCst);
        }

        if self.is_bootstrapped() {
            match self.snapshot().to_json() {
                Ok(snapshot) => {
                    publish(p, &self.outputs.snapshots, snapshot).await;
                }
                Err(e) => warn!("generate snapshot failed: {e}"),
            }
        }
    }

    async fn watches(&self, p: &Process) -> WatchSet {
        let snapshot = match self.snapshot().to_json() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("generate snapshot failed: {e}");
                return WatchSet::default();
            }
        };
        self.hook.watches(p, &snapshot).await.interpolate()
    }
}

/// Send `value` unless shutdown comes first. Returns `false` on shutdown.
async fn publish<T: Send>(p: &Process, tx: &mpsc::Sender<T>, value: T) -> bool {
    tokio::select! {
        sent = tx.send(value) => {
            if sent.is_err() {
                debug!("output receiver gone");
            }
            true
        }
        () = p.shutdown() => false,
    }
}
