//! Supervisor errors

use thiserror::Error;

/// A failure recorded by the supervisor and returned from `Supervisor::run`.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A worker returned an error and was not restarted
    #[error("worker {name} failed: {error:#}")]
    Worker { name: String, error: anyhow::Error },

    /// A worker panicked
    #[error("worker {name} panicked: {message}\n{backtrace}")]
    Panic {
        name: String,
        message: String,
        backtrace: String,
    },
}

impl SupervisorError {
    /// Name of the worker the error came from.
    pub fn worker(&self) -> &str {
        match self {
            Self::Worker { name, .. } | Self::Panic { name, .. } => name,
        }
    }
}
