//! Aggregated snapshots
//!
//! A snapshot is rendered as pretty-printed JSON with four-space indentation
//! and lexicographically sorted keys at every level, so equal inputs always
//! produce byte-identical output.

use crate::consul::Endpoints;
use crate::error::ApiError;
use crate::resource::Resource;
use serde::{Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;
use std::collections::BTreeMap;

/// A problem attached to a snapshot rather than raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WattError {
    pub source: String,
    pub message: String,
    /// Unix seconds
    pub timestamp: i64,
}

impl WattError {
    pub fn new(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            message: message.into(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConsulSnapshot {
    #[serde(rename = "Endpoints", default)]
    pub endpoints: BTreeMap<String, Endpoints>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "Consul", default)]
    pub consul: ConsulSnapshot,
    /// Resources by watched kind
    #[serde(rename = "Kubernetes", default)]
    pub kubernetes: BTreeMap<String, Vec<Resource>>,
    /// Errors by source
    #[serde(rename = "Errors", default)]
    pub errors: BTreeMap<String, Vec<WattError>>,
}

impl Snapshot {
    /// Canonical JSON rendering.
    ///
    /// The snapshot goes through `serde_json::Value` first: its maps are
    /// ordered, which sorts resource payload keys as well as our own.
    ///
    /// # Errors
    /// Returns `ApiError::Serialization` if a payload cannot be represented as JSON.
    pub fn to_json(&self) -> Result<String, ApiError> {
        let value = serde_json::to_value(self)?;
        let mut out = Vec::new();
        let mut serializer =
            serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
        value.serialize(&mut serializer)?;
        String::from_utf8(out).map_err(|e| ApiError::InvalidResource(e.to_string()))
    }

    /// # Errors
    /// Returns `ApiError::Serialization` if `json` is not a snapshot.
    pub fn from_json(json: &str) -> Result<Self, ApiError> {
        Ok(serde_json::from_str(json)?)
    }
}
