//! Schemaless Kubernetes resources
//!
//! The agent never interprets resource payloads beyond the metadata
//! conventions below, so resources are kept as JSON with a few typed
//! accessors. Fields the model does not name are carried in `extras` and
//! survive a serialize/deserialize round trip.

use crate::error::ApiError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A Kubernetes-style object.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "apiVersion", default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
    /// Top-level fields other than the ones above (`data`, `type`, ...)
    #[serde(flatten)]
    pub extras: BTreeMap<String, Value>,
}

impl Resource {
    /// Decode a resource from an arbitrary JSON value.
    ///
    /// # Errors
    /// Returns `ApiError::InvalidResource` if the value is not an object and
    /// `ApiError::Serialization` if a known field has the wrong shape.
    pub fn from_value(value: Value) -> Result<Self, ApiError> {
        if !value.is_object() {
            return Err(ApiError::InvalidResource(format!(
                "expected an object, got {value}"
            )));
        }
        Ok(serde_json::from_value(value)?)
    }

    fn metadata_str(&self, key: &str) -> &str {
        self.metadata
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.metadata_str("name")
    }

    /// Namespace, empty for cluster-scoped resources.
    pub fn namespace(&self) -> &str {
        self.metadata_str("namespace")
    }

    pub fn resource_version(&self) -> &str {
        self.metadata_str("resourceVersion")
    }

    pub fn labels(&self) -> Option<&Map<String, Value>> {
        self.metadata.get("labels").and_then(Value::as_object)
    }

    pub fn annotations(&self) -> Option<&Map<String, Value>> {
        self.metadata.get("annotations").and_then(Value::as_object)
    }

    /// Value of a single string annotation.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations()
            .and_then(|annotations| annotations.get(key))
            .and_then(Value::as_str)
    }

    pub fn set_namespace(&mut self, namespace: &str) {
        self.metadata
            .insert("namespace".to_string(), Value::String(namespace.to_string()));
    }

    pub fn set_labels(&mut self, labels: Map<String, Value>) {
        self.metadata
            .insert("labels".to_string(), Value::Object(labels));
    }

    /// Splits `apiVersion` into `(group, version)`. The core group is empty.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version.as_str()),
        }
    }

    /// Qualified kind: `<Kind>.<version>.<group>`, e.g. `Service.v1.`.
    pub fn qkind(&self) -> String {
        let (group, version) = self.group_version();
        format!("{}.{}.{}", self.kind, version, group)
    }

    /// Qualified name: `<name>.<namespace>`, or just `<name>` when cluster-scoped.
    pub fn qname(&self) -> String {
        let namespace = self.namespace();
        if namespace.is_empty() {
            self.name().to_string()
        } else {
            format!("{}.{}", self.name(), namespace)
        }
    }
}
