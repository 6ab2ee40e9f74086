//! Watt API types
//!
//! Data model shared by the watt agent, its watch hooks and its snapshot
//! consumers:
//! - `Resource`: a schemaless Kubernetes object with typed accessors
//! - `KubernetesWatchSpec` / `ConsulWatchSpec` / `WatchSet`: the watch
//!   directives produced by hooks
//! - `Endpoints`: Consul service membership
//! - `Snapshot`: the aggregated view handed to receivers, rendered as
//!   canonical JSON

pub mod consul;
pub mod error;
pub mod resource;
pub mod snapshot;
pub mod watch;

pub use consul::{Endpoint, Endpoints};
pub use error::ApiError;
pub use resource::Resource;
pub use snapshot::{ConsulSnapshot, Snapshot, WattError};
pub use watch::{ConsulWatchSpec, KubernetesWatchSpec, WatchSet};
