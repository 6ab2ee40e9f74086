//! Events flowing from the watch managers into the aggregator.

use watt_api::{Endpoints, Resource, WattError};

/// Current contents of one Kubernetes watch for one kind.
///
/// An event with `errors` carries no resources; it is recorded in the
/// aggregator's error map and leaves the resource map alone.
#[derive(Debug, Clone, PartialEq)]
pub struct K8sEvent {
    pub watch_id: String,
    pub kind: String,
    pub resources: Vec<Resource>,
    pub errors: Vec<WattError>,
}

impl K8sEvent {
    pub fn resources(watch_id: impl Into<String>, kind: impl Into<String>, resources: Vec<Resource>) -> Self {
        Self {
            watch_id: watch_id.into(),
            kind: kind.into(),
            resources,
            errors: Vec::new(),
        }
    }
}

/// An error-only event attributed to `source`.
pub fn make_error_event(source: &str, message: impl Into<String>) -> K8sEvent {
    K8sEvent {
        watch_id: String::new(),
        kind: String::new(),
        resources: Vec::new(),
        errors: vec![WattError::new(source, message)],
    }
}

/// Current membership of one Consul service watch.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsulEvent {
    pub watch_id: String,
    pub endpoints: Endpoints,
}
