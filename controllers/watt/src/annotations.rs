//! Resources declared inside `getambassador.io/config` annotations.
//!
//! Services and Ingresses may carry a YAML stream of Ambassador resources
//! in their config annotation. Each document is turned into a standalone
//! resource that lives in the parent's namespace. Documents that cannot be
//! used are reported as snapshot errors and skipped.

use serde::Deserialize;
use serde_json::{Map, Value};
use watt_api::{Resource, WattError};

pub const CONFIG_ANNOTATION: &str = "getambassador.io/config";

/// Qualified kinds whose config annotation is expanded.
const ANNOTATED_QKINDS: [&str; 4] = [
    "Service.v1.",
    "Ingress.v1beta1.extensions",
    "Ingress.v1beta1.networking.k8s.io",
    "Ingress.v1.networking.k8s.io",
];

const LEGACY_GROUP: &str = "ambassador/";
const GROUP: &str = "getambassador.io/";

pub fn is_annotated_kind(resource: &Resource) -> bool {
    ANNOTATED_QKINDS.contains(&resource.qkind().as_str())
}

/// Resources declared in `parent`'s config annotation, and errors for the
/// documents that had to be skipped.
pub fn parse_annotation_resources(parent: &Resource) -> (Vec<Resource>, Vec<WattError>) {
    let mut resources = Vec::new();
    let mut errors = Vec::new();
    let Some(config) = parent.annotation(CONFIG_ANNOTATION) else {
        return (resources, errors);
    };
    let source = format!("{}/{}", parent.qkind(), parent.qname());

    for document in serde_yaml::Deserializer::from_str(config) {
        let value = match document_to_json(document) {
            Ok(Value::Null) => continue,
            Ok(value) => value,
            Err(e) => {
                errors.push(WattError::new(
                    source.clone(),
                    format!("annotation {CONFIG_ANNOTATION}: {e}"),
                ));
                // The parser cannot resynchronise after a syntax error.
                break;
            }
        };
        let Value::Object(document) = value else {
            errors.push(WattError::new(
                source.clone(),
                format!("annotation {CONFIG_ANNOTATION}: expected a mapping, got {value}"),
            ));
            continue;
        };

        let mut child = match Resource::from_value(Value::Object(reparent(document))) {
            Ok(child) => child,
            Err(e) => {
                errors.push(WattError::new(
                    source.clone(),
                    format!("annotation {CONFIG_ANNOTATION}: {e}"),
                ));
                continue;
            }
        };

        if let Some(version) = child.api_version.strip_prefix(LEGACY_GROUP) {
            child.api_version = format!("{GROUP}{version}");
        }
        if !child.api_version.starts_with(GROUP) {
            errors.push(WattError::new(
                format!(
                    "{source}: annotation {CONFIG_ANNOTATION}: {}/{}",
                    child.qkind(),
                    child.qname()
                ),
                format!("unsupported apiVersion {:?}", child.api_version),
            ));
            continue;
        }

        if child.namespace().is_empty() {
            child.set_namespace(parent.namespace());
        }
        if child.labels().is_none()
            && let Some(labels) = parent.labels()
        {
            child.set_labels(labels.clone());
        }
        resources.push(child);
    }

    (resources, errors)
}

fn document_to_json(document: serde_yaml::Deserializer<'_>) -> anyhow::Result<Value> {
    let yaml = serde_yaml::Value::deserialize(document)?;
    Ok(serde_json::to_value(yaml)?)
}

/// Moves the flat annotation layout into `metadata` and `spec`.
fn reparent(document: Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    let mut metadata = Map::new();
    let mut spec = Map::new();

    for (key, value) in document {
        match key.as_str() {
            "apiVersion" | "kind" | "status" => {
                out.insert(key, value);
            }
            "metadata" => {
                if let Value::Object(fields) = value {
                    metadata.extend(fields);
                }
            }
            "spec" => {
                if let Value::Object(fields) = value {
                    spec.extend(fields);
                }
            }
            "name" | "namespace" | "generation" => {
                metadata.insert(key, value);
            }
            "metadata_labels" => {
                metadata.insert("labels".to_string(), value);
            }
            _ => {
                spec.insert(key, value);
            }
        }
    }

    out.insert("metadata".to_string(), Value::Object(metadata));
    out.insert("spec".to_string(), Value::Object(spec));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::resource;
    use serde_json::json;

    fn annotated(kind: &str, api_version: &str, config: &str) -> Resource {
        let mut parent = resource(api_version, kind, "svc", "somens");
        parent.metadata.insert(
            "annotations".to_string(),
            json!({ CONFIG_ANNOTATION: config }),
        );
        parent
    }

    #[test]
    fn test_annotated_kinds() {
        assert!(is_annotated_kind(&resource("v1", "Service", "a", "ns")));
        assert!(is_annotated_kind(&resource("networking.k8s.io/v1", "Ingress", "a", "ns")));
        assert!(is_annotated_kind(&resource("extensions/v1beta1", "Ingress", "a", "ns")));
        assert!(!is_annotated_kind(&resource("getambassador.io/v2", "Host", "a", "ns")));
        assert!(!is_annotated_kind(&resource("v1", "ConfigMap", "a", "ns")));
    }

    #[test]
    fn test_legacy_mapping_is_expanded() {
        let parent = annotated(
            "Service",
            "v1",
            "apiVersion: ambassador/v1\nkind: Mapping\nname: m1\nprefix: /foo/",
        );
        let (resources, errors) = parse_annotation_resources(&parent);
        assert!(errors.is_empty());
        assert_eq!(resources.len(), 1);

        let mapping = &resources[0];
        assert_eq!(mapping.api_version, "getambassador.io/v1");
        assert_eq!(mapping.kind, "Mapping");
        assert_eq!(mapping.name(), "m1");
        assert_eq!(mapping.namespace(), "somens");
        assert_eq!(mapping.spec, Some(json!({"prefix": "/foo/"})));
    }

    #[test]
    fn test_multiple_documents() {
        let parent = annotated(
            "Service",
            "v1",
            "\n---\napiVersion: getambassador.io/v2\nkind: Module\nname: ambassador\nconfig:\n  diagnostics:\n    enabled: true\n---\napiVersion: getambassador.io/v2\nkind: KubernetesEndpointResolver\nname: endpoint",
        );
        let (resources, errors) = parse_annotation_resources(&parent);
        assert!(errors.is_empty());
        let kinds: Vec<_> = resources.iter().map(|r| r.kind.as_str()).collect();
        assert_eq!(kinds, vec!["Module", "KubernetesEndpointResolver"]);
        assert_eq!(
            resources[0].spec,
            Some(json!({"config": {"diagnostics": {"enabled": true}}}))
        );
    }

    #[test]
    fn test_labels() {
        let mut parent = annotated(
            "Service",
            "v1",
            "apiVersion: getambassador.io/v2\nkind: Mapping\nname: own\nmetadata_labels:\n  bleep: blorp\n---\napiVersion: getambassador.io/v2\nkind: Mapping\nname: inherited",
        );
        parent.set_labels(json!({"use": "theselabels"}).as_object().cloned().unwrap());

        let (resources, errors) = parse_annotation_resources(&parent);
        assert!(errors.is_empty());
        assert_eq!(resources[0].labels(), json!({"bleep": "blorp"}).as_object());
        assert_eq!(resources[1].labels(), json!({"use": "theselabels"}).as_object());
    }

    #[test]
    fn test_explicit_namespace_is_kept() {
        let parent = annotated(
            "Ingress",
            "networking.k8s.io/v1",
            "apiVersion: getambassador.io/v2\nkind: Mapping\nname: m\nnamespace: other\nspec:\n  service: quote:80\nprefix: /q/",
        );
        let (resources, _) = parse_annotation_resources(&parent);
        assert_eq!(resources[0].namespace(), "other");
        assert_eq!(
            resources[0].spec,
            Some(json!({"service": "quote:80", "prefix": "/q/"}))
        );
    }

    #[test]
    fn test_foreign_api_version_is_an_error() {
        let parent = annotated(
            "Service",
            "v1",
            "apiVersion: example.com/v1\nkind: Widget\nname: w",
        );
        let (resources, errors) = parse_annotation_resources(&parent);
        assert!(resources.is_empty());
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].source,
            "Service.v1./svc.somens: annotation getambassador.io/config: Widget.v1.example.com/w"
        );
    }

    #[test]
    fn test_yaml_error_is_reported_against_parent() {
        let parent = annotated("Service", "v1", "apiVersion: [unterminated");
        let (resources, errors) = parse_annotation_resources(&parent);
        assert!(resources.is_empty());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].source, "Service.v1./svc.somens");
        assert!(errors[0].message.starts_with("annotation getambassador.io/config: "));
    }

    #[test]
    fn test_no_annotation() {
        let (resources, errors) = parse_annotation_resources(&resource("v1", "Service", "a", "ns"));
        assert!(resources.is_empty());
        assert!(errors.is_empty());
    }
}
