//! Kubernetes list/watch adapter.
//!
//! Kinds are given the way users type them (`service`, `services`,
//! `Mapping.v2.getambassador.io`, ...) and resolved against API discovery.
//! Each watch follows one kind with `kube_runtime::watcher` and emits the
//! complete current list after the initial sync and after every change.

use crate::events::K8sEvent;
use crate::watchman::WatchMaker;
use anyhow::Context;
use futures::StreamExt;
use kube::Client;
use kube::api::{Api, ApiResource, DynamicObject};
use kube::core::TypeMeta;
use kube::discovery::{Discovery, Scope};
use kube_runtime::watcher;
use kube_runtime::watcher::Event;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use supervisor::{Process, Worker};
use tokio::sync::mpsc;
use tracing::{debug, info};
use watt_api::{KubernetesWatchSpec, Resource};

/// A resource kind served by the API server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServedKind {
    pub resource: ApiResource,
    pub namespaced: bool,
    /// Served at the group's preferred version
    pub preferred: bool,
}

/// Every kind found by discovery, in discovery order.
#[derive(Debug, Clone, Default)]
pub struct KindIndex {
    kinds: Vec<ServedKind>,
}

impl KindIndex {
    pub fn new(kinds: Vec<ServedKind>) -> Self {
        Self { kinds }
    }

    fn from_discovery(discovery: &Discovery) -> Self {
        let mut kinds = Vec::new();
        for group in discovery.groups_alphabetical() {
            let preferred = group.preferred_version_or_latest().to_string();
            for version in group.versions() {
                for (resource, capabilities) in group.versioned_resources(version) {
                    kinds.push(ServedKind {
                        resource,
                        namespaced: matches!(capabilities.scope, Scope::Namespaced),
                        preferred: version == preferred,
                    });
                }
            }
        }
        Self { kinds }
    }

    /// Resolves `kind`, `plural`, `kind.version.group`, `kind.group` or
    /// `kind.version` (core group), case-insensitively. Preferred versions win.
    pub fn resolve(&self, kind: &str) -> Option<&ServedKind> {
        let kind = kind.trim().to_ascii_lowercase();
        let (name, qualifier) = kind.split_once('.').unwrap_or((kind.as_str(), ""));

        self.kinds
            .iter()
            .filter(|served| {
                let resource = &served.resource;
                let name_matches =
                    resource.kind.to_ascii_lowercase() == name || resource.plural == name;
                let qualifier_matches = qualifier.is_empty()
                    || qualifier == resource.group
                    || qualifier == format!("{}.{}", resource.version, resource.group)
                    || (resource.group.is_empty() && qualifier == resource.version);
                name_matches && qualifier_matches
            })
            .min_by_key(|served| !served.preferred)
    }
}

/// Latest state of one watched kind, fed by watcher events.
#[derive(Debug, Clone)]
pub struct ResourceStore {
    api_resource: ApiResource,
    objects: BTreeMap<(String, String), Resource>,
    /// Objects seen during an initial (re)list
    relist: Option<BTreeMap<(String, String), Resource>>,
}

impl ResourceStore {
    pub fn new(api_resource: ApiResource) -> Self {
        Self {
            api_resource,
            objects: BTreeMap::new(),
            relist: None,
        }
    }

    /// Applies a watcher event. Returns the full current list when it
    /// should be emitted.
    ///
    /// # Errors
    /// Returns an error if an object cannot be represented as a `Resource`.
    pub fn apply(&mut self, event: Event<DynamicObject>) -> anyhow::Result<Option<Vec<Resource>>> {
        match event {
            Event::Init => {
                self.relist = Some(BTreeMap::new());
                Ok(None)
            }
            Event::InitApply(object) => {
                let resource = self.to_resource(object)?;
                self.relist
                    .get_or_insert_with(BTreeMap::new)
                    .insert(key(&resource), resource);
                Ok(None)
            }
            Event::InitDone => {
                if let Some(objects) = self.relist.take() {
                    self.objects = objects;
                }
                Ok(Some(self.list()))
            }
            Event::Apply(object) => {
                let resource = self.to_resource(object)?;
                // Only updates are filtered; a new object is always reported.
                let skip = self.objects.get(&key(&resource)).is_some_and(|old| {
                    is_noise(&resource)
                        || (!old.resource_version().is_empty()
                            && old.resource_version() == resource.resource_version())
                });
                self.objects.insert(key(&resource), resource);
                Ok((!skip).then(|| self.list()))
            }
            Event::Delete(object) => {
                let resource = self.to_resource(object)?;
                let removed = self.objects.remove(&key(&resource)).is_some();
                Ok(removed.then(|| self.list()))
            }
        }
    }

    pub fn list(&self) -> Vec<Resource> {
        self.objects.values().cloned().collect()
    }

    fn to_resource(&self, mut object: DynamicObject) -> anyhow::Result<Resource> {
        // List responses omit the type of their items.
        if object.types.is_none() {
            object.types = Some(TypeMeta {
                api_version: self.api_resource.api_version.clone(),
                kind: self.api_resource.kind.clone(),
            });
        }
        Ok(Resource::from_value(serde_json::to_value(object)?)?)
    }
}

fn key(resource: &Resource) -> (String, String) {
    (resource.namespace().to_string(), resource.name().to_string())
}

/// Updates to kube-system Endpoints come every few seconds and carry nothing useful.
fn is_noise(resource: &Resource) -> bool {
    resource.kind == "Endpoints" && resource.namespace() == "kube-system"
}

/// One list/watch subscription.
#[derive(Debug, Clone)]
pub struct KindWatch {
    pub watch_id: String,
    /// The kind as requested; events are reported under this name
    pub kind: String,
    pub namespace: String,
    pub field_selector: String,
    pub label_selector: String,
}

impl KindWatch {
    pub fn new(watch_id: String, spec: &KubernetesWatchSpec) -> Self {
        Self {
            watch_id,
            kind: spec.kind.clone(),
            namespace: spec.namespace.clone(),
            field_selector: spec.field_selector.clone(),
            label_selector: spec.label_selector.clone(),
        }
    }
}

/// Starts watches for kinds the cluster serves.
#[async_trait::async_trait]
pub trait KindWatcher: Send + Sync + fmt::Debug {
    /// Worker running `watch`, or `None` if its kind is not served.
    fn watch(&self, name: String, watch: KindWatch, events: mpsc::Sender<K8sEvent>) -> Option<Worker>;

    /// Re-run discovery so newly installed kinds resolve.
    async fn refresh(&self) -> anyhow::Result<()>;
}

/// `KindWatcher` backed by the API server.
#[derive(Clone)]
pub struct KubeWatcher {
    client: Client,
    index: Arc<RwLock<KindIndex>>,
}

impl fmt::Debug for KubeWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeWatcher")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl KubeWatcher {
    /// # Errors
    /// Returns an error if initial discovery fails.
    pub async fn new(client: Client) -> Result<Self, kube::Error> {
        let watcher = Self {
            client,
            index: Arc::new(RwLock::new(KindIndex::default())),
        };
        watcher.discover().await?;
        Ok(watcher)
    }

    async fn discover(&self) -> Result<(), kube::Error> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        let index = KindIndex::from_discovery(&discovery);
        debug!(kinds = index.kinds.len(), "discovery complete");
        *self.index.write().unwrap_or_else(PoisonError::into_inner) = index;
        Ok(())
    }

    fn resolve(&self, kind: &str) -> Option<ServedKind> {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .resolve(kind)
            .cloned()
    }

    fn api(&self, served: &ServedKind, namespace: &str) -> Api<DynamicObject> {
        if served.namespaced && !namespace.is_empty() {
            Api::namespaced_with(self.client.clone(), namespace, &served.resource)
        } else {
            Api::all_with(self.client.clone(), &served.resource)
        }
    }
}

#[async_trait::async_trait]
impl KindWatcher for KubeWatcher {
    fn watch(&self, name: String, watch: KindWatch, events: mpsc::Sender<K8sEvent>) -> Option<Worker> {
        let served = self.resolve(&watch.kind)?;
        let api = self.api(&served, &watch.namespace);
        Some(
            Worker::new(name, move |p| {
                let api = api.clone();
                let watch = watch.clone();
                let events = events.clone();
                let api_resource = served.resource.clone();
                async move { run_watch(&p, api, api_resource, &watch, &events).await }
            })
            .retry(true),
        )
    }

    async fn refresh(&self) -> anyhow::Result<()> {
        self.discover().await.context("running API discovery")
    }
}

async fn run_watch(
    p: &Process,
    api: Api<DynamicObject>,
    api_resource: ApiResource,
    watch: &KindWatch,
    events: &mpsc::Sender<K8sEvent>,
) -> anyhow::Result<()> {
    let mut config = watcher::Config::default();
    if !watch.field_selector.is_empty() {
        config = config.fields(&watch.field_selector);
    }
    if !watch.label_selector.is_empty() {
        config = config.labels(&watch.label_selector);
    }

    let stream = watcher(api, config);
    let mut stream = std::pin::pin!(stream);
    let mut store = ResourceStore::new(api_resource);
    let namespace = if watch.namespace.is_empty() { "*" } else { watch.namespace.as_str() };

    loop {
        let event = tokio::select! {
            () = p.shutdown() => return Ok(()),
            event = stream.next() => event,
        };
        let event = match event {
            Some(Ok(event)) => event,
            Some(Err(e)) => return Err(e).with_context(|| format!("watching {:?}", watch.kind)),
            None => anyhow::bail!("watch stream for {:?} ended", watch.kind),
        };

        let Some(resources) = store.apply(event)? else {
            continue;
        };
        info!(kind = %watch.kind, %namespace, count = resources.len(), "found resources");
        let event = K8sEvent::resources(watch.watch_id.clone(), watch.kind.clone(), resources);
        tokio::select! {
            () = p.shutdown() => return Ok(()),
            sent = events.send(event) => {
                if sent.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// Builds workers for hook-requested Kubernetes watches.
#[derive(Debug)]
pub struct KubernetesWatchMaker {
    watcher: Arc<dyn KindWatcher>,
    events: mpsc::Sender<K8sEvent>,
}

impl KubernetesWatchMaker {
    pub fn new(watcher: Arc<dyn KindWatcher>, events: mpsc::Sender<K8sEvent>) -> Self {
        Self { watcher, events }
    }
}

impl WatchMaker<KubernetesWatchSpec> for KubernetesWatchMaker {
    fn make_worker(&self, name: String, spec: &KubernetesWatchSpec) -> anyhow::Result<Worker> {
        let watch = KindWatch::new(spec.watch_id(), spec);
        self.watcher
            .watch(name, watch, self.events.clone())
            .with_context(|| format!("kind {:?} is not served by the cluster", spec.kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Endpoints, Service};
    use k8s_openapi::api::networking::v1::Ingress;
    use serde_json::json;

    fn served(resource: ApiResource, namespaced: bool, preferred: bool) -> ServedKind {
        ServedKind {
            resource,
            namespaced,
            preferred,
        }
    }

    fn custom(group: &str, version: &str, kind: &str, plural: &str) -> ApiResource {
        ApiResource {
            group: group.to_string(),
            version: version.to_string(),
            api_version: format!("{group}/{version}"),
            kind: kind.to_string(),
            plural: plural.to_string(),
        }
    }

    fn index() -> KindIndex {
        KindIndex::new(vec![
            served(ApiResource::erase::<Service>(&()), true, true),
            served(custom("extensions", "v1beta1", "Ingress", "ingresses"), true, true),
            served(custom("getambassador.io", "v1", "Mapping", "mappings"), true, false),
            served(custom("getambassador.io", "v2", "Mapping", "mappings"), true, true),
            served(ApiResource::erase::<Ingress>(&()), true, true),
        ])
    }

    #[test]
    fn test_resolve_names() {
        let index = index();
        assert_eq!(index.resolve("service").unwrap().resource.kind, "Service");
        assert_eq!(index.resolve("Services").unwrap().resource.kind, "Service");
        assert_eq!(index.resolve("service.v1").unwrap().resource.kind, "Service");
        assert!(index.resolve("widget").is_none());
    }

    #[test]
    fn test_resolve_prefers_preferred_version() {
        let index = index();
        assert_eq!(index.resolve("mapping").unwrap().resource.version, "v2");
        assert_eq!(index.resolve("mappings.getambassador.io").unwrap().resource.version, "v2");
        assert_eq!(index.resolve("Mapping.v1.getambassador.io").unwrap().resource.version, "v1");
    }

    #[test]
    fn test_resolve_group_qualifier() {
        let index = index();
        assert_eq!(index.resolve("ingress").unwrap().resource.group, "extensions");
        assert_eq!(
            index.resolve("ingress.networking.k8s.io").unwrap().resource.group,
            "networking.k8s.io"
        );
        assert_eq!(
            index.resolve("ingresses.v1.networking.k8s.io").unwrap().resource.version,
            "v1"
        );
    }

    fn object(name: &str, namespace: &str, version: &str) -> DynamicObject {
        let mut object = DynamicObject::new(name, &ApiResource::erase::<Service>(&()))
            .within(namespace)
            .data(json!({"spec": {"ports": [{"port": 80}]}}));
        object.metadata.resource_version = Some(version.to_string());
        object
    }

    fn names(resources: &[Resource]) -> Vec<&str> {
        resources.iter().map(Resource::name).collect()
    }

    #[test]
    fn test_initial_list_is_emitted_once() {
        let mut store = ResourceStore::new(ApiResource::erase::<Service>(&()));
        assert!(store.apply(Event::Init).unwrap().is_none());
        assert!(store.apply(Event::InitApply(object("b", "default", "1"))).unwrap().is_none());
        assert!(store.apply(Event::InitApply(object("a", "default", "1"))).unwrap().is_none());

        let list = store.apply(Event::InitDone).unwrap().unwrap();
        assert_eq!(names(&list), vec!["a", "b"]);
        assert_eq!(list[0].api_version, "v1");
        assert_eq!(list[0].kind, "Service");
        assert_eq!(list[0].spec, Some(json!({"ports": [{"port": 80}]})));
    }

    #[test]
    fn test_empty_initial_list_is_emitted() {
        let mut store = ResourceStore::new(ApiResource::erase::<Service>(&()));
        store.apply(Event::Init).unwrap();
        assert_eq!(store.apply(Event::InitDone).unwrap(), Some(Vec::new()));
    }

    #[test]
    fn test_same_resource_version_is_suppressed() {
        let mut store = ResourceStore::new(ApiResource::erase::<Service>(&()));
        assert!(store.apply(Event::Apply(object("a", "default", "1"))).unwrap().is_some());
        assert!(store.apply(Event::Apply(object("a", "default", "1"))).unwrap().is_none());
        assert!(store.apply(Event::Apply(object("a", "default", "2"))).unwrap().is_some());
    }

    #[test]
    fn test_delete() {
        let mut store = ResourceStore::new(ApiResource::erase::<Service>(&()));
        store.apply(Event::Apply(object("a", "default", "1"))).unwrap();
        store.apply(Event::Apply(object("b", "default", "1"))).unwrap();
        let list = store.apply(Event::Delete(object("a", "default", "1"))).unwrap().unwrap();
        assert_eq!(names(&list), vec!["b"]);
        assert!(store.apply(Event::Delete(object("a", "default", "1"))).unwrap().is_none());
    }

    #[test]
    fn test_relist_replaces_state() {
        let mut store = ResourceStore::new(ApiResource::erase::<Service>(&()));
        store.apply(Event::Apply(object("gone", "default", "1"))).unwrap();
        store.apply(Event::Init).unwrap();
        store.apply(Event::InitApply(object("kept", "default", "3"))).unwrap();
        assert_eq!(names(&store.list()), vec!["gone"]);
        let list = store.apply(Event::InitDone).unwrap().unwrap();
        assert_eq!(names(&list), vec!["kept"]);
    }

    #[test]
    fn test_kube_system_endpoints_updates_are_suppressed() {
        let mut store = ResourceStore::new(ApiResource::erase::<Endpoints>(&()));
        let endpoints = |namespace: &str, version: &str| {
            let mut object = DynamicObject::new("ep", &ApiResource::erase::<Endpoints>(&())).within(namespace);
            object.metadata.resource_version = Some(version.to_string());
            object
        };

        let list = store.apply(Event::Apply(endpoints("kube-system", "1"))).unwrap().unwrap();
        assert_eq!(list.len(), 1);
        assert!(store.apply(Event::Apply(endpoints("kube-system", "2"))).unwrap().is_none());
        assert_eq!(store.list()[0].resource_version(), "2");

        let list = store.apply(Event::Apply(endpoints("default", "1"))).unwrap().unwrap();
        assert_eq!(list.len(), 2);
        assert!(store.apply(Event::Apply(endpoints("default", "2"))).unwrap().is_some());

        let list = store.apply(Event::Delete(endpoints("kube-system", "2"))).unwrap().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].namespace(), "default");
    }

    #[derive(Debug)]
    struct NoKinds;

    #[async_trait::async_trait]
    impl KindWatcher for NoKinds {
        fn watch(&self, _name: String, _watch: KindWatch, _events: mpsc::Sender<K8sEvent>) -> Option<Worker> {
            None
        }

        async fn refresh(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_unknown_kind_fails_creation() {
        let (events, _rx) = mpsc::channel(1);
        let maker = KubernetesWatchMaker::new(Arc::new(NoKinds), events);
        let spec = KubernetesWatchSpec {
            kind: "widget".to_string(),
            ..Default::default()
        };
        let error = maker.make_worker("kubernetes:widget".to_string(), &spec).unwrap_err();
        assert!(error.to_string().contains("widget"));
    }
}
