//! Test utilities for unit testing the agent
//!
//! Helpers for building resources and events, for running code inside a
//! supervised worker, and a watch hook backed by a closure.

#[cfg(test)]
use crate::events::K8sEvent;
#[cfg(test)]
use crate::hook::WatchHook;
#[cfg(test)]
use serde_json::json;
#[cfg(test)]
use std::fmt;
#[cfg(test)]
use std::future::Future;
#[cfg(test)]
use std::sync::{Arc, Mutex};
#[cfg(test)]
use std::time::Duration;
#[cfg(test)]
use supervisor::{Process, Supervisor, Worker};
#[cfg(test)]
use tokio::sync::oneshot;
#[cfg(test)]
use watt_api::{Resource, Snapshot, WatchSet};

/// Helper to create a namespaced resource
#[cfg(test)]
pub fn resource(api_version: &str, kind: &str, name: &str, namespace: &str) -> Resource {
    Resource::from_value(json!({
        "apiVersion": api_version,
        "kind": kind,
        "metadata": {
            "name": name,
            "namespace": namespace,
            "resourceVersion": "1",
        }
    }))
    .unwrap()
}

/// Helper to create a bootstrap event (empty watch id)
#[cfg(test)]
pub fn bootstrap_event(kind: &str, resources: Vec<Resource>) -> K8sEvent {
    K8sEvent::resources("", kind, resources)
}

/// Run `f` as the body of a supervised worker and return its output.
#[cfg(test)]
pub async fn with_process<F, Fut, T>(f: F) -> T
where
    F: FnOnce(Process) -> Fut + Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let supervisor = Supervisor::with_grace("test", Duration::from_secs(2));
    let (tx, rx) = oneshot::channel();
    let body = Mutex::new(Some((f, tx)));
    supervisor.supervise(Worker::new("test", move |p| {
        let body = body.lock().unwrap().take();
        async move {
            if let Some((f, tx)) = body {
                let _ = tx.send(f(p).await);
            }
            Ok(())
        }
    }));
    let errors = supervisor.run().await;
    assert!(errors.is_empty(), "worker failed: {errors:?}");
    rx.await.unwrap()
}

/// A watch hook answering from a closure over the decoded snapshot.
#[cfg(test)]
#[derive(Clone)]
pub struct FnWatchHook {
    f: Arc<dyn Fn(&Snapshot) -> WatchSet + Send + Sync>,
}

#[cfg(test)]
impl FnWatchHook {
    pub fn new(f: impl Fn(&Snapshot) -> WatchSet + Send + Sync + 'static) -> Self {
        Self { f: Arc::new(f) }
    }

    /// A hook that never asks for any watches.
    pub fn empty() -> Self {
        Self::new(|_| WatchSet::default())
    }
}

#[cfg(test)]
impl fmt::Debug for FnWatchHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnWatchHook").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl WatchHook for FnWatchHook {
    async fn watches(&self, _p: &Process, snapshot: &str) -> WatchSet {
        let snapshot = Snapshot::from_json(snapshot).unwrap();
        (self.f)(&snapshot)
    }
}
