//! Watch directives
//!
//! A `WatchSet` is what a watch hook prints on stdout. Field names follow the
//! hook wire format (`kubernetes-watches`, `consul-address`, ...); the
//! camelCase spellings are accepted as aliases. Unknown fields are rejected.

use serde::{Deserialize, Deserializer, Serialize};

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// A Kubernetes list/watch subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KubernetesWatchSpec {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(rename = "field-selector", alias = "fieldSelector", default)]
    pub field_selector: String,
    #[serde(rename = "label-selector", alias = "labelSelector", default)]
    pub label_selector: String,
}

impl KubernetesWatchSpec {
    /// Non-empty fields joined with `|`, kind first.
    pub fn watch_id(&self) -> String {
        [
            self.kind.as_str(),
            self.namespace.as_str(),
            self.field_selector.as_str(),
            self.label_selector.as_str(),
        ]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("|")
    }

    fn interpolate_with<F>(&mut self, lookup: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for field in [
            &mut self.kind,
            &mut self.namespace,
            &mut self.field_selector,
            &mut self.label_selector,
        ] {
            *field = expand(field, lookup);
        }
    }
}

/// A Consul service health subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsulWatchSpec {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "consul-address", alias = "consulAddress", default)]
    pub consul_address: String,
    #[serde(default)]
    pub datacenter: String,
    #[serde(rename = "service-name", alias = "serviceName", default)]
    pub service_name: String,
    /// Name of the TLS secret the consumer pairs with these endpoints.
    /// Carried through for the consumer; not part of the watch identity.
    #[serde(default)]
    pub secret: String,
}

impl ConsulWatchSpec {
    /// `<consulAddress>|<datacenter>|<serviceName>`
    pub fn watch_id(&self) -> String {
        format!(
            "{}|{}|{}",
            self.consul_address, self.datacenter, self.service_name
        )
    }

    fn interpolate_with<F>(&mut self, lookup: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for field in [
            &mut self.id,
            &mut self.consul_address,
            &mut self.datacenter,
            &mut self.service_name,
            &mut self.secret,
        ] {
            *field = expand(field, lookup);
        }
    }
}

/// The complete desired set of watches.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchSet {
    #[serde(
        rename = "kubernetes-watches",
        alias = "kubernetesWatches",
        default,
        deserialize_with = "null_as_empty"
    )]
    pub kubernetes_watches: Vec<KubernetesWatchSpec>,
    #[serde(
        rename = "consul-watches",
        alias = "consulWatches",
        default,
        deserialize_with = "null_as_empty"
    )]
    pub consul_watches: Vec<ConsulWatchSpec>,
}

impl WatchSet {
    /// Every watch id this set asks for.
    pub fn watch_ids(&self) -> impl Iterator<Item = String> + '_ {
        self.kubernetes_watches
            .iter()
            .map(KubernetesWatchSpec::watch_id)
            .chain(self.consul_watches.iter().map(ConsulWatchSpec::watch_id))
    }

    /// Appends another hook's watches to this one.
    pub fn extend(&mut self, other: WatchSet) {
        self.kubernetes_watches.extend(other.kubernetes_watches);
        self.consul_watches.extend(other.consul_watches);
    }

    /// Replaces `$NAME` and `${NAME}` references using the process environment.
    #[must_use]
    pub fn interpolate(self) -> Self {
        self.interpolate_with(|name| std::env::var(name).ok())
    }

    /// Replaces `$NAME` and `${NAME}` references using `lookup`.
    ///
    /// References that `lookup` cannot resolve are left as written, so an
    /// empty environment is a fixed point.
    #[must_use]
    pub fn interpolate_with<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        for spec in &mut self.kubernetes_watches {
            spec.interpolate_with(&lookup);
        }
        for spec in &mut self.consul_watches {
            spec.interpolate_with(&lookup);
        }
        self
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn expand<F>(input: &str, lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !is_name_char(c))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        let reference = &rest[pos..pos + 1 + consumed];
        match (name.is_empty(), lookup(name)) {
            (false, Some(value)) => out.push_str(&value),
            _ => out.push_str(if consumed == 0 { "$" } else { reference }),
        }
        rest = &rest[pos + 1 + consumed..];
    }

    out.push_str(rest);
    out
}
