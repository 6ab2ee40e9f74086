//! Consul Connect leadership
//!
//! At most one replica holds a Consul lock on the service's leader key.
//! While it does, it follows the Connect CA roots and the leaf certificate
//! issued for the service, and keeps a Kubernetes TLS secret holding the
//! leaf chained with the active root. Losing the lock (renewal failure or
//! someone else's session on the key) stops the certificate watches and
//! the replica goes back to campaigning.

use crate::config::ConnectConfig;
use crate::consul_watch::advance;
use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use consul_client::{CaRoots, ConsulClientTrait, ConsulError, LeafCert, QueryOptions, SessionRequest};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use kube::api::{Api, Patch, PatchParams};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use supervisor::{Process, Worker};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CONNECT_WORKER: &str = "consul-connect";

const SESSION_TTL: Duration = Duration::from_secs(15);
const RETRY_INTERVAL: Duration = Duration::from_secs(10);
const FIELD_MANAGER: &str = "watt";
const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";

/// Value stored under the leader key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockValue {
    pub holder: String,
    pub lock_created_time: String,
}

/// Writes TLS material into the cluster.
#[async_trait]
pub trait SecretWriter: Send + Sync + fmt::Debug {
    /// # Errors
    /// Returns an error if the secret cannot be written.
    async fn write_tls(&self, namespace: &str, name: &str, chain: &str, key: &str) -> anyhow::Result<()>;
}

/// Server-side applies `kubernetes.io/tls` secrets.
#[derive(Clone)]
pub struct KubeSecretWriter {
    client: Client,
}

impl KubeSecretWriter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl fmt::Debug for KubeSecretWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeSecretWriter").finish_non_exhaustive()
    }
}

fn tls_secret(namespace: &str, name: &str, chain: &str, key: &str) -> Secret {
    let data = BTreeMap::from([
        ("tls.crt".to_string(), ByteString(chain.as_bytes().to_vec())),
        ("tls.key".to_string(), ByteString(key.as_bytes().to_vec())),
    ]);
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        type_: Some(TLS_SECRET_TYPE.to_string()),
        data: Some(data),
        ..Default::default()
    }
}

#[async_trait]
impl SecretWriter for KubeSecretWriter {
    async fn write_tls(&self, namespace: &str, name: &str, chain: &str, key: &str) -> anyhow::Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = tls_secret(namespace, name, chain, key);
        api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&secret))
            .await
            .with_context(|| format!("applying secret {namespace}/{name}"))?;
        Ok(())
    }
}

/// Leaf certificate followed by the CA root, newline separated.
fn chain(leaf: &str, root: &str) -> String {
    let mut chain = leaf.to_string();
    if !chain.is_empty() && !chain.ends_with('\n') {
        chain.push('\n');
    }
    chain.push_str(root);
    chain
}

pub struct ConnectLeader {
    config: ConnectConfig,
    consul: Arc<dyn ConsulClientTrait>,
    secrets: Arc<dyn SecretWriter>,
    holder: String,
    retry: Duration,
    renew: Duration,
}

impl fmt::Debug for ConnectLeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectLeader")
            .field("config", &self.config)
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

impl ConnectLeader {
    pub fn new(
        config: ConnectConfig,
        consul: Arc<dyn ConsulClientTrait>,
        secrets: Arc<dyn SecretWriter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            consul,
            secrets,
            holder: Uuid::new_v4().to_string(),
            retry: RETRY_INTERVAL,
            renew: SESSION_TTL / 2,
        })
    }

    #[cfg(test)]
    fn with_timing(mut self: Arc<Self>, retry: Duration, renew: Duration) -> Arc<Self> {
        if let Some(leader) = Arc::get_mut(&mut self) {
            leader.retry = retry;
            leader.renew = renew;
        }
        self
    }

    pub fn worker(self: &Arc<Self>) -> Worker {
        let leader = Arc::clone(self);
        Worker::new(CONNECT_WORKER, move |p| {
            let leader = Arc::clone(&leader);
            async move { leader.work(p).await }
        })
    }

    async fn work(&self, p: Process) -> anyhow::Result<()> {
        p.ready();
        loop {
            if let Err(e) = self.campaign(&p).await {
                warn!("leadership attempt failed: {e:#}");
            }
            tokio::select! {
                () = p.shutdown() => return Ok(()),
                () = tokio::time::sleep(self.retry) => {}
            }
        }
    }

    async fn campaign(&self, p: &Process) -> anyhow::Result<()> {
        let request = SessionRequest {
            name: format!("{}-leader", self.config.service_name),
            ttl: format!("{}s", SESSION_TTL.as_secs()),
            behavior: "release".to_string(),
            lock_delay: "0s".to_string(),
        };
        let session = self
            .consul
            .session_create(&request)
            .await
            .context("creating session")?;

        let led = self.lead(p, &session).await;

        let key = self.config.lock_key();
        if let Err(e) = self.consul.kv_release(&key, &session).await {
            debug!(%key, "releasing lock: {e}");
        }
        if let Err(e) = self.consul.session_destroy(&session).await {
            warn!(%session, "destroying session: {e}");
        }
        led
    }

    async fn lead(&self, p: &Process, session: &str) -> anyhow::Result<()> {
        let key = self.config.lock_key();
        let value = serde_json::to_vec(&LockValue {
            holder: self.holder.clone(),
            lock_created_time: Utc::now().to_rfc3339(),
        })?;
        let acquired = self
            .consul
            .kv_acquire(&key, session, &value)
            .await
            .with_context(|| format!("acquiring {key}"))?;
        if !acquired {
            debug!(%key, "lock is held by another replica");
            return Ok(());
        }
        info!(%key, holder = %self.holder, "acquired leadership");

        let (roots_tx, mut roots) = watch::channel(None);
        let (leaf_tx, mut leaf) = watch::channel(None);
        let children = [
            p.go(self.roots_worker(Arc::new(roots_tx))),
            p.go(self.leaf_worker(Arc::new(leaf_tx))),
        ];

        let mut renew = tokio::time::interval(self.renew);
        renew.tick().await;
        let outcome = loop {
            tokio::select! {
                () = p.shutdown() => break Ok(()),
                _ = renew.tick() => match self.still_leader(&key, session).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(%key, "lost leadership");
                        break Ok(());
                    }
                    Err(e) => break Err(e),
                },
                Ok(()) = roots.changed() => self.publish(&roots, &leaf).await,
                Ok(()) = leaf.changed() => self.publish(&roots, &leaf).await,
            }
        };

        for child in &children {
            child.stop().await;
        }
        outcome
    }

    async fn still_leader(&self, key: &str, session: &str) -> anyhow::Result<bool> {
        match self.consul.session_renew(session).await {
            Ok(()) => {}
            Err(ConsulError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e).context("renewing session"),
        }
        let pair = self.consul.kv_get(key).await.with_context(|| format!("reading {key}"))?;
        Ok(pair.is_some_and(|pair| pair.session.as_deref() == Some(session)))
    }

    async fn publish(
        &self,
        roots: &watch::Receiver<Option<CaRoots>>,
        leaf: &watch::Receiver<Option<LeafCert>>,
    ) {
        let roots = roots.borrow().clone();
        let leaf = leaf.borrow().clone();
        let (Some(roots), Some(leaf)) = (roots, leaf) else {
            return;
        };
        let Some(root) = roots.active() else {
            warn!("no active CA root yet");
            return;
        };

        let chain = chain(&leaf.cert_pem, &root.root_cert);
        let (namespace, name) = (&self.config.secret_namespace, &self.config.secret_name);
        match self.secrets.write_tls(namespace, name, &chain, &leaf.private_key_pem).await {
            Ok(()) => info!(secret = %format!("{namespace}/{name}"), serial = %leaf.serial_number, "wrote connect certificate"),
            Err(e) => warn!("writing connect certificate: {e:#}"),
        }
    }

    fn roots_worker(&self, roots: Arc<watch::Sender<Option<CaRoots>>>) -> Worker {
        let consul = Arc::clone(&self.consul);
        Worker::new(format!("{CONNECT_WORKER}:roots"), move |p| {
            let consul = Arc::clone(&consul);
            let roots = Arc::clone(&roots);
            async move {
                let mut last = None;
                loop {
                    let options = QueryOptions {
                        index: last.unwrap_or(0),
                        ..Default::default()
                    };
                    let result = tokio::select! {
                        () = p.shutdown() => return Ok(()),
                        result = consul.connect_ca_roots(&options) => result.context("watching CA roots")?,
                    };
                    let (next, changed) = advance(last, result.index);
                    last = Some(next);
                    if changed {
                        roots.send_replace(Some(result.value));
                    }
                }
            }
        })
        .retry(true)
    }

    fn leaf_worker(&self, leaf: Arc<watch::Sender<Option<LeafCert>>>) -> Worker {
        let consul = Arc::clone(&self.consul);
        let service = self.config.service_name.clone();
        Worker::new(format!("{CONNECT_WORKER}:leaf"), move |p| {
            let consul = Arc::clone(&consul);
            let leaf = Arc::clone(&leaf);
            let service = service.clone();
            async move {
                let mut last = None;
                loop {
                    let options = QueryOptions {
                        index: last.unwrap_or(0),
                        ..Default::default()
                    };
                    let result = tokio::select! {
                        () = p.shutdown() => return Ok(()),
                        result = consul.connect_leaf(&service, &options) => result
                            .with_context(|| format!("watching leaf certificate of {service}"))?,
                    };
                    let (next, changed) = advance(last, result.index);
                    last = Some(next);
                    if changed {
                        leaf.send_replace(Some(result.value));
                    }
                }
            }
        })
        .retry(true)
    }
}
