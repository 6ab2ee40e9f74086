//! Watch managers
//!
//! A watch manager owns one child worker per watch. Each directive it
//! receives is the complete desired set: watches that are new get a
//! worker, watches that disappeared have theirs stopped, and everything
//! else is left running untouched.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use supervisor::{Process, Worker, WorkerHandle};
use tokio::sync::mpsc;
use tracing::{info, warn};
use watt_api::{ConsulWatchSpec, KubernetesWatchSpec};

/// A watch directive entry with a stable worker name.
pub trait WatchSpec: Clone + Debug + Send + Sync + 'static {
    fn worker_name(&self) -> String;
}

impl WatchSpec for KubernetesWatchSpec {
    fn worker_name(&self) -> String {
        format!("kubernetes:{}", self.watch_id())
    }
}

impl WatchSpec for ConsulWatchSpec {
    fn worker_name(&self) -> String {
        format!("consul:{}", self.watch_id())
    }
}

/// Builds the worker that runs one watch.
pub trait WatchMaker<S>: Send + Sync + Debug {
    /// # Errors
    /// Returns an error if the watch cannot be set up; the watch is skipped.
    fn make_worker(&self, name: String, spec: &S) -> anyhow::Result<Worker>;
}

#[derive(Debug)]
pub struct WatchManager<S> {
    name: String,
    maker: Arc<dyn WatchMaker<S>>,
    directives: tokio::sync::Mutex<mpsc::Receiver<Vec<S>>>,
    watched: Mutex<BTreeMap<String, WorkerHandle>>,
}

impl<S: WatchSpec> WatchManager<S> {
    pub fn new(
        name: impl Into<String>,
        maker: Arc<dyn WatchMaker<S>>,
        directives: mpsc::Receiver<Vec<S>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            maker,
            directives: tokio::sync::Mutex::new(directives),
            watched: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn worker(self: &Arc<Self>) -> Worker {
        let manager = Arc::clone(self);
        Worker::new(self.name.clone(), move |p| {
            let manager = Arc::clone(&manager);
            async move { manager.work(p).await }
        })
    }

    /// Worker names of the watches currently running.
    pub fn watched(&self) -> Vec<String> {
        self.watches().keys().cloned().collect()
    }

    fn watches(&self) -> MutexGuard<'_, BTreeMap<String, WorkerHandle>> {
        self.watched.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn work(&self, p: Process) -> anyhow::Result<()> {
        let mut directives = self.directives.lock().await;
        p.ready();

        loop {
            tokio::select! {
                () = p.shutdown() => {
                    info!("shutdown initiated");
                    break;
                }
                directive = directives.recv() => match directive {
                    Some(specs) => self.reconcile(&p, specs).await,
                    None => break,
                },
            }
        }

        // Forget the children so a restart starts afresh.
        let running: Vec<WorkerHandle> = std::mem::take(&mut *self.watches()).into_values().collect();
        for handle in running {
            handle.stop().await;
        }
        Ok(())
    }

    async fn reconcile(&self, p: &Process, specs: Vec<S>) {
        info!(count = specs.len(), "processing watch specs");
        let desired: BTreeMap<String, S> = specs
            .into_iter()
            .map(|spec| (spec.worker_name(), spec))
            .collect();

        let stale: Vec<WorkerHandle> = {
            let mut watched = self.watches();
            let names: Vec<String> = watched
                .keys()
                .filter(|name| !desired.contains_key(*name))
                .cloned()
                .collect();
            names.iter().filter_map(|name| watched.remove(name)).collect()
        };
        for handle in stale {
            info!(watch = %handle.name(), "removing watch");
            handle.stop().await;
        }

        for (name, spec) in desired {
            if self.watches().contains_key(&name) {
                continue;
            }
            match self.maker.make_worker(name.clone(), &spec) {
                Ok(worker) => {
                    info!(watch = %name, "adding watch");
                    let handle = p.go(worker);
                    self.watches().insert(name, handle);
                }
                Err(e) => warn!(watch = %name, "failed to create watch: {e:#}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use supervisor::{Supervisor, SupervisorError};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    #[derive(Debug, Default)]
    struct CountingMaker {
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
    }

    impl WatchMaker<ConsulWatchSpec> for CountingMaker {
        fn make_worker(&self, name: String, spec: &ConsulWatchSpec) -> anyhow::Result<Worker> {
            if spec.service_name == "broken" {
                anyhow::bail!("cannot watch {}", spec.service_name);
            }
            let starts = Arc::clone(&self.starts);
            let stops = Arc::clone(&self.stops);
            Ok(Worker::new(name, move |p| {
                let starts = Arc::clone(&starts);
                let stops = Arc::clone(&stops);
                async move {
                    starts.fetch_add(1, Ordering::SeqCst);
                    p.shutdown().await;
                    stops.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
        }
    }

    fn spec(service: &str) -> ConsulWatchSpec {
        ConsulWatchSpec {
            consul_address: "127.0.0.1".to_string(),
            service_name: service.to_string(),
            ..Default::default()
        }
    }

    fn specs(services: &[&str]) -> Vec<ConsulWatchSpec> {
        services.iter().map(|service| spec(service)).collect()
    }

    struct Harness {
        directives: mpsc::Sender<Vec<ConsulWatchSpec>>,
        manager: Arc<WatchManager<ConsulWatchSpec>>,
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
        supervisor: Supervisor,
        run: JoinHandle<Vec<SupervisorError>>,
    }

    fn start() -> Harness {
        let maker = CountingMaker::default();
        let starts = Arc::clone(&maker.starts);
        let stops = Arc::clone(&maker.stops);
        let (directives, rx) = mpsc::channel(10);
        let manager = WatchManager::new("consulwatchman", Arc::new(maker), rx);

        let supervisor = Supervisor::with_grace("test", Duration::from_secs(2));
        supervisor.supervise(manager.worker());
        let run = tokio::spawn({
            let supervisor = supervisor.clone();
            async move { supervisor.run().await }
        });
        Harness {
            directives,
            manager,
            starts,
            stops,
            supervisor,
            run,
        }
    }

    async fn wait_for(counter: &AtomicUsize, value: usize) {
        timeout(Duration::from_secs(5), async {
            while counter.load(Ordering::SeqCst) != value {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_worker_names() {
        assert_eq!(spec("foo").worker_name(), "consul:127.0.0.1||foo");
        let kubernetes = KubernetesWatchSpec {
            kind: "service".to_string(),
            namespace: "default".to_string(),
            ..Default::default()
        };
        assert_eq!(kubernetes.worker_name(), "kubernetes:service|default");
    }

    #[tokio::test]
    async fn test_reconcile_without_churn() {
        let harness = start();

        harness.directives.send(specs(&["foo", "bar", "baz"])).await.unwrap();
        wait_for(&harness.starts, 3).await;
        assert_eq!(
            harness.manager.watched(),
            vec![
                "consul:127.0.0.1||bar",
                "consul:127.0.0.1||baz",
                "consul:127.0.0.1||foo"
            ]
        );

        harness.directives.send(specs(&["bar", "baz"])).await.unwrap();
        wait_for(&harness.stops, 1).await;
        assert_eq!(
            harness.manager.watched(),
            vec!["consul:127.0.0.1||bar", "consul:127.0.0.1||baz"]
        );

        harness.directives.send(specs(&["bar", "baz"])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            harness.manager.watched(),
            vec!["consul:127.0.0.1||bar", "consul:127.0.0.1||baz"]
        );
        assert_eq!(harness.starts.load(Ordering::SeqCst), 3);
        assert_eq!(harness.stops.load(Ordering::SeqCst), 1);

        harness.supervisor.shutdown();
        let errors = harness.run.await.unwrap();
        assert!(errors.is_empty());
        assert_eq!(harness.stops.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_closed_directives_stop_every_watch() {
        let harness = start();
        harness.directives.send(specs(&["foo", "bar"])).await.unwrap();
        wait_for(&harness.starts, 2).await;

        drop(harness.directives);
        wait_for(&harness.stops, 2).await;
        assert!(harness.manager.watched().is_empty());

        harness.supervisor.shutdown();
        assert!(harness.run.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_creation_failure_skips_only_that_watch() {
        let harness = start();
        harness.directives.send(specs(&["broken", "web"])).await.unwrap();
        wait_for(&harness.starts, 1).await;
        assert_eq!(harness.manager.watched(), vec!["consul:127.0.0.1||web"]);

        harness.supervisor.shutdown();
        assert!(harness.run.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_specs_start_once() {
        let harness = start();
        harness.directives.send(specs(&["web", "web"])).await.unwrap();
        wait_for(&harness.starts, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(harness.starts.load(Ordering::SeqCst), 1);

        harness.supervisor.shutdown();
        assert!(harness.run.await.unwrap().is_empty());
    }
}
