//! Agent error types.
//!
//! Errors that terminate the agent. Everything that happens inside a
//! running worker is either recovered locally or reported through the
//! supervisor and ends up in `ControllerError::Workers`.

use consul_client::ConsulError;
use kube::Error as KubeError;
use supervisor::SupervisorError;
use thiserror::Error;

/// Errors that can occur in the watt agent.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Consul API error
    #[error("Consul error: {0}")]
    Consul(#[from] ConsulError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error (listener bind, signal handler)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// One or more workers failed
    #[error("{} worker(s) failed: {}", .0.len(), .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Workers(Vec<SupervisorError>),
}
