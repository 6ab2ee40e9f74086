//! Agent wiring.
//!
//! Builds every worker from the configuration, connects them with
//! channels and runs them under one supervisor:
//!
//! - `kubewatchman` / `consulwatchman`: run the watches the hook asks for
//! - `aggregator`: requires both watch managers
//! - `kubebootstrap`, `invoker`: require the aggregator
//! - `api`: serves snapshot history
//! - `consul-connect`: only with `--consul-connect`

use crate::aggregator::{AGGREGATOR_WORKER, Aggregator, AggregatorOutputs, OUTPUT_CAPACITY};
use crate::bootstrap::KubeBootstrap;
use crate::config::WattConfig;
use crate::connect::{ConnectLeader, KubeSecretWriter};
use crate::consul_watch::{ConsulWatchMaker, http_clients};
use crate::error::ControllerError;
use crate::hook::ExecWatchHook;
use crate::invoker::{Invoker, SnapshotHistory};
use crate::kube_watch::{KindWatcher, KubeWatcher, KubernetesWatchMaker};
use crate::limiter::{IntervalLimiter, Limiter, Unlimited};
use crate::snapshot_server::api_worker;
use crate::watchman::WatchManager;
use consul_client::ConsulClient;
use kube::Client;
use std::sync::Arc;
use supervisor::Supervisor;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{error, info};

const KUBE_WATCH_MANAGER: &str = "kubewatchman";
const CONSUL_WATCH_MANAGER: &str = "consulwatchman";

/// The assembled agent.
#[derive(Debug)]
pub struct Controller {
    supervisor: Supervisor,
}

impl Controller {
    /// Connects to the cluster and registers every worker.
    ///
    /// # Errors
    /// Returns an error if the Kubernetes client cannot be created, API
    /// discovery fails, or the Connect Consul address is invalid.
    pub async fn new(config: WattConfig) -> Result<Self, ControllerError> {
        info!("Initializing watt");
        let client = Client::try_default().await?;
        let kinds: Arc<dyn KindWatcher> = Arc::new(KubeWatcher::new(client.clone()).await?);

        let (k8s_watches, k8s_directives) = mpsc::channel(OUTPUT_CAPACITY);
        let (consul_watches, consul_directives) = mpsc::channel(OUTPUT_CAPACITY);
        let (snapshots, snapshot_rx) = mpsc::channel(OUTPUT_CAPACITY);
        let limiter: Arc<dyn Limiter> = if config.interval.is_zero() {
            Arc::new(Unlimited)
        } else {
            Arc::new(IntervalLimiter::new(config.interval))
        };
        let (aggregator, inputs) = Aggregator::new(
            config.required_kinds.clone(),
            Arc::new(ExecWatchHook::new(config.watch_hooks.clone())),
            limiter,
            AggregatorOutputs {
                k8s_watches,
                consul_watches,
                snapshots,
            },
        );

        let kube_manager = WatchManager::new(
            KUBE_WATCH_MANAGER,
            Arc::new(KubernetesWatchMaker::new(
                Arc::clone(&kinds),
                inputs.kubernetes_events.clone(),
            )),
            k8s_directives,
        );
        let consul_manager = WatchManager::new(
            CONSUL_WATCH_MANAGER,
            Arc::new(ConsulWatchMaker::new(http_clients(), inputs.consul_events.clone())),
            consul_directives,
        );
        let bootstrap = KubeBootstrap::new(
            kinds,
            config.required_kinds.clone(),
            config.namespace.clone(),
            config.field_selector.clone(),
            config.label_selector.clone(),
            inputs.kubernetes_events,
        );
        let history = Arc::new(SnapshotHistory::new());
        let invoker = Invoker::new(
            snapshot_rx,
            Arc::clone(&history),
            config.notify.clone(),
            config.api_authority(),
        );

        let supervisor = Supervisor::with_grace("watt", config.shutdown_grace);
        supervisor.supervise(kube_manager.worker());
        supervisor.supervise(consul_manager.worker());
        supervisor.supervise(
            aggregator
                .worker()
                .requires([KUBE_WATCH_MANAGER, CONSUL_WATCH_MANAGER]),
        );
        supervisor.supervise(bootstrap.worker().requires([AGGREGATOR_WORKER]));
        supervisor.supervise(invoker.worker().requires([AGGREGATOR_WORKER]));
        supervisor.supervise(api_worker(config.listen, history));

        if let Some(connect) = config.connect {
            info!(
                consul = %connect.consul_address,
                service = %connect.service_name,
                secret = %format!("{}/{}", connect.secret_namespace, connect.secret_name),
                "Consul Connect leadership enabled"
            );
            let consul = Arc::new(ConsulClient::new(connect.consul_address.clone())?);
            let leader = ConnectLeader::new(connect, consul, Arc::new(KubeSecretWriter::new(client)));
            supervisor.supervise(leader.worker());
        }

        Ok(Self { supervisor })
    }

    /// Runs until shutdown (SIGINT/SIGTERM) or a worker fails.
    ///
    /// # Errors
    /// Returns `ControllerError::Workers` with every recorded failure.
    pub async fn run(self) -> Result<(), ControllerError> {
        let mut terminate = signal(SignalKind::terminate())?;
        let signals = tokio::spawn({
            let supervisor = self.supervisor.clone();
            async move {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            error!("listening for SIGINT: {e}");
                        }
                    }
                    _ = terminate.recv() => {}
                }
                info!("signal received, shutting down");
                supervisor.shutdown();
            }
        });

        let errors = self.supervisor.run().await;
        signals.abort();
        if errors.is_empty() {
            info!("watt stopped");
            Ok(())
        } else {
            Err(ControllerError::Workers(errors))
        }
    }
}
