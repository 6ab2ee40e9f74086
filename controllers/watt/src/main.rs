//! watt
//!
//! Watches Kubernetes resources and Consul services, folds what it sees
//! into consolidated JSON snapshots, and tells receivers where to fetch
//! each new snapshot:
//! - Bootstrap sources (`--source`) gate the first snapshot
//! - Watch hooks (`--watch`) decide which further watches to run
//! - Notify commands (`--notify`) are called with each snapshot URL
//! - Snapshots are served on `http://localhost:<port>/snapshots/<id>`

mod aggregator;
mod annotations;
mod bootstrap;
mod config;
mod connect;
mod consul_watch;
mod controller;
mod error;
mod events;
mod hook;
mod invoker;
mod kube_watch;
mod limiter;
mod snapshot_server;
#[cfg(test)]
mod test_utils;
mod watchman;

use crate::config::Cli;
use crate::controller::Controller;
use crate::error::ControllerError;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    // kube and reqwest both pull in rustls; pick the provider explicitly.
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version are not errors.
            let code = i32::from(e.use_stderr());
            let _ = e.print();
            std::process::exit(code);
        }
    };
    let config = cli.into_config()?;

    info!("Starting watt {}", env!("CARGO_PKG_VERSION"));
    info!("  Namespace: {}", if config.namespace.is_empty() { "all namespaces" } else { &config.namespace });
    info!("  Sources: {}", config.required_kinds.join(", "));
    info!("  Snapshot API: {}", config.listen);
    info!("  Interval: {:?}", config.interval);

    let controller = Controller::new(config).await?;
    controller.run().await
}
