//! Consul API models
//!
//! These follow the JSON shapes of the Consul HTTP API, which uses
//! PascalCase field names.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConsulError;

/// Options for blocking queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Datacenter to query; the agent's own when unset
    pub datacenter: Option<String>,
    /// Block until the result changes past this index (0 = return immediately)
    pub index: u64,
    /// Maximum time to block
    pub wait: Option<Duration>,
}

/// A response together with its `X-Consul-Index`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult<T> {
    pub value: T,
    pub index: u64,
}

/// An entry of `/v1/health/service/<service>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceEntry {
    pub node: Node,
    pub service: AgentService,
    #[serde(default)]
    pub checks: Vec<HealthCheck>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Node {
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub datacenter: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentService {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthCheck {
    #[serde(rename = "CheckID", default)]
    pub check_id: String,
    #[serde(default)]
    pub status: String,
}

/// Body of `PUT /v1/session/create`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionRequest {
    pub name: String,
    /// Go duration string, e.g. `15s`
    #[serde(rename = "TTL")]
    pub ttl: String,
    /// `release` or `delete`
    pub behavior: String,
    pub lock_delay: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct SessionCreated {
    #[serde(rename = "ID")]
    pub id: String,
}

/// An entry of `/v1/kv/<key>`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KvPair {
    pub key: String,
    /// Base64-encoded value
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub modify_index: u64,
}

impl KvPair {
    /// # Errors
    /// Returns `ConsulError::Decode` if the stored value is not base64.
    pub fn decoded_value(&self) -> Result<Vec<u8>, ConsulError> {
        match &self.value {
            Some(value) => Ok(STANDARD.decode(value)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn encode(value: &[u8]) -> String {
        STANDARD.encode(value)
    }
}

/// `/v1/agent/connect/ca/roots`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CaRoots {
    #[serde(rename = "ActiveRootID", default)]
    pub active_root_id: String,
    #[serde(default)]
    pub trust_domain: String,
    #[serde(default)]
    pub roots: Vec<CaRoot>,
}

impl CaRoots {
    pub fn active(&self) -> Option<&CaRoot> {
        self.roots
            .iter()
            .find(|root| root.id == self.active_root_id)
            .or_else(|| self.roots.iter().find(|root| root.active))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CaRoot {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub root_cert: String,
    #[serde(default)]
    pub active: bool,
}

/// `/v1/agent/connect/ca/leaf/<service>`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LeafCert {
    #[serde(default)]
    pub serial_number: String,
    #[serde(rename = "CertPEM", default)]
    pub cert_pem: String,
    #[serde(rename = "PrivateKeyPEM", default)]
    pub private_key_pem: String,
    #[serde(default)]
    pub service: String,
    #[serde(rename = "ServiceURI", default)]
    pub service_uri: String,
    #[serde(default)]
    pub valid_after: String,
    #[serde(default)]
    pub valid_before: String,
}
