//! Consul service health watches.
//!
//! Each watch follows the passing instances of one service with Consul
//! blocking queries and emits the full membership whenever the index moves.

use crate::events::ConsulEvent;
use crate::watchman::WatchMaker;
use anyhow::Context;
use consul_client::{ConsulClient, ConsulClientTrait, ConsulError, QueryOptions, ServiceEntry};
use std::fmt;
use std::sync::Arc;
use supervisor::{Process, Worker};
use tokio::sync::mpsc;
use tracing::{debug, info};
use watt_api::{ConsulWatchSpec, Endpoint, Endpoints};

/// Opens a client for a Consul agent address.
pub type ClientFactory =
    Arc<dyn Fn(&str) -> Result<Arc<dyn ConsulClientTrait>, ConsulError> + Send + Sync>;

/// Factory for real agents.
pub fn http_clients() -> ClientFactory {
    Arc::new(|address| {
        let client: Arc<dyn ConsulClientTrait> = Arc::new(ConsulClient::new(address)?);
        Ok(client)
    })
}

/// Builds workers for hook-requested Consul watches.
pub struct ConsulWatchMaker {
    clients: ClientFactory,
    events: mpsc::Sender<ConsulEvent>,
}

impl ConsulWatchMaker {
    pub fn new(clients: ClientFactory, events: mpsc::Sender<ConsulEvent>) -> Self {
        Self { clients, events }
    }
}

impl fmt::Debug for ConsulWatchMaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsulWatchMaker").finish_non_exhaustive()
    }
}

impl WatchMaker<ConsulWatchSpec> for ConsulWatchMaker {
    fn make_worker(&self, name: String, spec: &ConsulWatchSpec) -> anyhow::Result<Worker> {
        if spec.service_name.is_empty() {
            anyhow::bail!("consul watch {:?} has no service name", spec.watch_id());
        }
        let client = (self.clients)(&spec.consul_address)
            .with_context(|| format!("connecting to consul at {:?}", spec.consul_address))?;
        let spec = spec.clone();
        let events = self.events.clone();

        Ok(Worker::new(name, move |p| {
            let client = Arc::clone(&client);
            let spec = spec.clone();
            let events = events.clone();
            async move { watch_service(&p, client.as_ref(), &spec, &events).await }
        })
        .retry(true))
    }
}

/// Whether a result at `index` is news after `last`, and the index to
/// block on next.
pub(crate) fn advance(last: Option<u64>, index: u64) -> (u64, bool) {
    match last {
        None => (index, true),
        Some(last) if index == last => (last, false),
        // Consul's index can go backwards after a snapshot restore.
        Some(last) if index < last => (0, true),
        Some(_) => (index, true),
    }
}

fn to_endpoints(service: &str, entries: Vec<ServiceEntry>) -> Endpoints {
    let endpoints = entries
        .into_iter()
        .map(|entry| {
            let address = if entry.service.address.is_empty() {
                entry.node.address
            } else {
                entry.service.address
            };
            Endpoint {
                id: entry.service.id,
                service: entry.service.service,
                address,
                port: entry.service.port,
                tags: entry.service.tags.unwrap_or_default(),
            }
        })
        .collect();
    Endpoints {
        service: service.to_string(),
        endpoints,
    }
}

async fn watch_service(
    p: &Process,
    client: &dyn ConsulClientTrait,
    spec: &ConsulWatchSpec,
    events: &mpsc::Sender<ConsulEvent>,
) -> anyhow::Result<()> {
    let watch_id = spec.watch_id();
    let datacenter = (!spec.datacenter.is_empty()).then(|| spec.datacenter.clone());
    let mut last = None;
    p.ready();

    loop {
        let options = QueryOptions {
            datacenter: datacenter.clone(),
            index: last.unwrap_or(0),
            wait: None,
        };
        let result = tokio::select! {
            () = p.shutdown() => return Ok(()),
            result = client.health_service(&spec.service_name, &options) => result
                .with_context(|| format!("health of {:?} at {}", spec.service_name, client.address()))?,
        };

        let (next, changed) = advance(last, result.index);
        last = Some(next);
        if !changed {
            debug!(%watch_id, index = result.index, "no change");
            continue;
        }

        let endpoints = to_endpoints(&spec.service_name, result.value);
        info!(%watch_id, count = endpoints.endpoints.len(), "found endpoints");
        let event = ConsulEvent {
            watch_id: watch_id.clone(),
            endpoints,
        };
        tokio::select! {
            () = p.shutdown() => return Ok(()),
            sent = events.send(event) => {
                if sent.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consul_client::{AgentService, MockConsulClient, Node};
    use std::time::Duration;
    use supervisor::Supervisor;
    use tokio::time::timeout;

    fn mock_clients(mock: &MockConsulClient) -> ClientFactory {
        let mock = mock.clone();
        Arc::new(move |_| {
            let client: Arc<dyn ConsulClientTrait> = Arc::new(mock.clone());
            Ok(client)
        })
    }

    fn spec(service: &str) -> ConsulWatchSpec {
        ConsulWatchSpec {
            consul_address: "127.0.0.1:8500".to_string(),
            service_name: service.to_string(),
            ..Default::default()
        }
    }

    async fn next(events: &mut mpsc::Receiver<ConsulEvent>) -> ConsulEvent {
        timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap()
    }

    #[test]
    fn test_advance() {
        assert_eq!(advance(None, 5), (5, true));
        assert_eq!(advance(Some(5), 5), (5, false));
        assert_eq!(advance(Some(5), 7), (7, true));
        assert_eq!(advance(Some(7), 3), (0, true));
    }

    #[test]
    fn test_address_falls_back_to_node() {
        let entry = |service_address: &str, tags| ServiceEntry {
            node: Node {
                node: "node-1".to_string(),
                address: "10.0.0.1".to_string(),
                datacenter: "dc1".to_string(),
            },
            service: AgentService {
                id: "bar-1".to_string(),
                service: "bar".to_string(),
                address: service_address.to_string(),
                port: 80,
                tags,
            },
            checks: Vec::new(),
        };
        let endpoints = to_endpoints(
            "bar",
            vec![entry("", None), entry("1.2.3.4", Some(vec!["primary".to_string()]))],
        );
        assert_eq!(endpoints.service, "bar");
        assert_eq!(endpoints.endpoints[0].address, "10.0.0.1");
        assert!(endpoints.endpoints[0].tags.is_empty());
        assert_eq!(endpoints.endpoints[1].address, "1.2.3.4");
        assert_eq!(endpoints.endpoints[1].tags, vec!["primary"]);
    }

    #[test]
    fn test_service_name_is_required() {
        let (tx, _events) = mpsc::channel(1);
        let maker = ConsulWatchMaker::new(mock_clients(&MockConsulClient::new("mock")), tx);
        assert!(maker.make_worker("consul:x".to_string(), &spec("")).is_err());
    }

    #[tokio::test]
    async fn test_emits_initial_membership_then_changes() {
        let mock = MockConsulClient::new("127.0.0.1:8500");
        let (tx, mut events) = mpsc::channel(10);
        let maker = ConsulWatchMaker::new(mock_clients(&mock), tx);
        let worker = maker
            .make_worker("consul:127.0.0.1:8500||bar".to_string(), &spec("bar"))
            .unwrap();

        let supervisor = Supervisor::with_grace("test", Duration::from_secs(2));
        supervisor.supervise(worker);
        let run = tokio::spawn({
            let supervisor = supervisor.clone();
            async move { supervisor.run().await }
        });

        // Unknown services are reported with no endpoints.
        let first = next(&mut events).await;
        assert_eq!(first.watch_id, "127.0.0.1:8500||bar");
        assert_eq!(first.endpoints.service, "bar");
        assert!(first.endpoints.endpoints.is_empty());

        mock.set_service("bar", vec![("bar-1", "1.2.3.4", 80), ("bar-2", "", 81)]);
        let second = next(&mut events).await;
        assert_eq!(second.endpoints.endpoints.len(), 2);
        assert_eq!(second.endpoints.endpoints[0].address, "1.2.3.4");
        assert_eq!(second.endpoints.endpoints[1].address, "10.0.0.1");
        assert_eq!(second.endpoints.endpoints[1].port, 81);

        supervisor.shutdown();
        assert!(run.await.unwrap().is_empty());
    }
}
