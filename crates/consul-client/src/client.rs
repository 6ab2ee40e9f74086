//! Consul HTTP API client
//!
//! Implements the subset of the Consul agent API the watt agent needs:
//! `/v1/health/service`, `/v1/session`, `/v1/kv` and `/v1/agent/connect/ca`.

use crate::consul_trait::ConsulClientTrait;
use crate::error::ConsulError;
use crate::models::{
    CaRoots, KvPair, LeafCert, QueryOptions, QueryResult, ServiceEntry, SessionCreated,
    SessionRequest,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// Default request timeout for non-blocking calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Consul's own default for blocking queries
const DEFAULT_WAIT: Duration = Duration::from_secs(300);
/// Header carrying the blocking-query index
const INDEX_HEADER: &str = "X-Consul-Index";

/// Consul API client
#[derive(Debug, Clone)]
pub struct ConsulClient {
    client: Client,
    address: String,
    base_url: String,
}

impl ConsulClient {
    /// Create a new Consul client
    ///
    /// # Arguments
    /// * `address` - agent address, e.g. `127.0.0.1:8500` or `https://consul:8501`
    ///
    /// # Errors
    /// Returns `ConsulError::InvalidRequest` for an empty address.
    pub fn new(address: impl Into<String>) -> Result<Self, ConsulError> {
        let address = address.into();
        if address.trim().is_empty() {
            return Err(ConsulError::InvalidRequest(
                "Consul address must not be empty".to_string(),
            ));
        }
        let base_url = if address.contains("://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };
        let client = Client::builder().build()?;

        Ok(Self {
            client,
            address,
            base_url,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, %url, "Consul request");
        self.client
            .request(method, url)
            .header("Accept", "application/json")
    }

    fn blocking(&self, path: &str, options: &QueryOptions) -> RequestBuilder {
        let wait = options.wait.unwrap_or(DEFAULT_WAIT);
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(datacenter) = options.datacenter.as_deref().filter(|dc| !dc.is_empty()) {
            query.push(("dc", datacenter.to_string()));
        }
        if options.index > 0 {
            query.push(("index", options.index.to_string()));
            query.push(("wait", format!("{}ms", wait.as_millis())));
        }
        // Consul adds up to wait/16 of jitter on top of the requested wait.
        self.request(reqwest::Method::GET, path)
            .query(&query)
            .timeout(wait + wait / 16 + REQUEST_TIMEOUT)
    }

    async fn check(response: Response, what: &str) -> Result<Response, ConsulError> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ConsulError::NotFound(what.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConsulError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ConsulError> {
        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn query<T: DeserializeOwned>(
        &self,
        path: &str,
        what: &str,
        options: &QueryOptions,
    ) -> Result<QueryResult<T>, ConsulError> {
        let response = self.blocking(path, options).send().await?;
        let response = Self::check(response, what).await?;
        let index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);
        let value = Self::decode(response).await?;
        Ok(QueryResult { value, index })
    }

    async fn put_bool(&self, path: &str, query: &[(&str, &str)], body: Vec<u8>) -> Result<bool, ConsulError> {
        let response = self
            .request(reqwest::Method::PUT, path)
            .query(query)
            .timeout(REQUEST_TIMEOUT)
            .body(body)
            .send()
            .await?;
        let response = Self::check(response, path).await?;
        Self::decode(response).await
    }
}

fn segment(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Keys keep their `/` separators.
fn key_path(key: &str) -> String {
    key.split('/').map(segment).collect::<Vec<_>>().join("/")
}

#[async_trait::async_trait]
impl ConsulClientTrait for ConsulClient {
    fn address(&self) -> &str {
        &self.address
    }

    async fn health_service(
        &self,
        service: &str,
        options: &QueryOptions,
    ) -> Result<QueryResult<Vec<ServiceEntry>>, ConsulError> {
        let path = format!("/v1/health/service/{}?passing=true", segment(service));
        self.query(&path, service, options).await
    }

    async fn session_create(&self, request: &SessionRequest) -> Result<String, ConsulError> {
        let response = self
            .request(reqwest::Method::PUT, "/v1/session/create")
            .timeout(REQUEST_TIMEOUT)
            .json(request)
            .send()
            .await?;
        let response = Self::check(response, "session").await?;
        let created: SessionCreated = Self::decode(response).await?;
        Ok(created.id)
    }

    async fn session_renew(&self, id: &str) -> Result<(), ConsulError> {
        let path = format!("/v1/session/renew/{}", segment(id));
        let response = self
            .request(reqwest::Method::PUT, &path)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Self::check(response, &format!("session {id}")).await?;
        Ok(())
    }

    async fn session_destroy(&self, id: &str) -> Result<(), ConsulError> {
        let path = format!("/v1/session/destroy/{}", segment(id));
        self.put_bool(&path, &[], Vec::new()).await?;
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<KvPair>, ConsulError> {
        let path = format!("/v1/kv/{}", key_path(key));
        let response = self
            .request(reqwest::Method::GET, &path)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        match Self::check(response, key).await {
            Ok(response) => {
                let pairs: Vec<KvPair> = Self::decode(response).await?;
                Ok(pairs.into_iter().next())
            }
            Err(ConsulError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn kv_acquire(&self, key: &str, session: &str, value: &[u8]) -> Result<bool, ConsulError> {
        let path = format!("/v1/kv/{}", key_path(key));
        self.put_bool(&path, &[("acquire", session)], value.to_vec())
            .await
    }

    async fn kv_release(&self, key: &str, session: &str) -> Result<bool, ConsulError> {
        let path = format!("/v1/kv/{}", key_path(key));
        self.put_bool(&path, &[("release", session)], Vec::new())
            .await
    }

    async fn connect_ca_roots(&self, options: &QueryOptions) -> Result<QueryResult<CaRoots>, ConsulError> {
        self.query("/v1/agent/connect/ca/roots", "CA roots", options)
            .await
    }

    async fn connect_leaf(
        &self,
        service: &str,
        options: &QueryOptions,
    ) -> Result<QueryResult<LeafCert>, ConsulError> {
        let path = format!("/v1/agent/connect/ca/leaf/{}", segment(service));
        self.query(&path, service, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_without_scheme_gets_http() {
        let client = ConsulClient::new("127.0.0.1:8500").unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:8500");
        assert_eq!(client.address(), "127.0.0.1:8500");
    }

    #[test]
    fn test_address_with_scheme_is_kept() {
        let client = ConsulClient::new("https://consul.example:8501/").unwrap();
        assert_eq!(client.base_url(), "https://consul.example:8501");
    }

    #[test]
    fn test_empty_address_is_rejected() {
        assert!(matches!(
            ConsulClient::new("  "),
            Err(ConsulError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_key_path_keeps_separators() {
        assert_eq!(key_path("amb/leader lock"), "amb/leader%20lock");
    }
}
