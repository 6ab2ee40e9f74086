//! ConsulClient trait for mocking
//!
//! The concrete `ConsulClient` implements this trait, and tests use
//! `MockConsulClient` (feature `test-util`).

use crate::error::ConsulError;
use crate::models::{
    CaRoots, KvPair, LeafCert, QueryOptions, QueryResult, ServiceEntry, SessionRequest,
};

/// Consul operations used by the watt agent.
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ConsulClientTrait: Send + Sync {
    /// Address of the agent this client talks to
    fn address(&self) -> &str;

    /// Passing instances of `service` (blocking query).
    async fn health_service(
        &self,
        service: &str,
        options: &QueryOptions,
    ) -> Result<QueryResult<Vec<ServiceEntry>>, ConsulError>;

    // Sessions
    async fn session_create(&self, request: &SessionRequest) -> Result<String, ConsulError>;
    /// Fails with `ConsulError::NotFound` once the session has expired.
    async fn session_renew(&self, id: &str) -> Result<(), ConsulError>;
    async fn session_destroy(&self, id: &str) -> Result<(), ConsulError>;

    // KV
    async fn kv_get(&self, key: &str) -> Result<Option<KvPair>, ConsulError>;
    async fn kv_acquire(&self, key: &str, session: &str, value: &[u8]) -> Result<bool, ConsulError>;
    async fn kv_release(&self, key: &str, session: &str) -> Result<bool, ConsulError>;

    // Connect CA (blocking queries)
    async fn connect_ca_roots(&self, options: &QueryOptions) -> Result<QueryResult<CaRoots>, ConsulError>;
    async fn connect_leaf(
        &self,
        service: &str,
        options: &QueryOptions,
    ) -> Result<QueryResult<LeafCert>, ConsulError>;
}
