//! Worker supervision
//!
//! A `Supervisor` runs named async workers. Each worker may require other
//! workers to become ready before it starts and may ask to be restarted
//! with capped exponential backoff when it fails. Shutdown is coordinated:
//! dependants are stopped before the workers they depend on, and workers
//! that ignore shutdown for longer than the grace period are abandoned.
//! Panics inside workers are converted into errors with a backtrace and
//! returned from `Supervisor::run`.
//!
//! # Example
//!
//! ```no_run
//! use supervisor::{Supervisor, Worker};
//!
//! # async fn example() {
//! let supervisor = Supervisor::new("example");
//! supervisor.supervise(Worker::new("producer", |p| async move {
//!     p.ready();
//!     p.shutdown().await;
//!     Ok(())
//! }));
//! supervisor.supervise(
//!     Worker::new("consumer", |p| async move {
//!         p.shutdown().await;
//!         Ok(())
//!     })
//!     .requires(["producer"]),
//! );
//! let errors = supervisor.run().await;
//! assert!(errors.is_empty());
//! # }
//! ```

pub mod backoff;
pub mod error;
mod panic;
pub mod process;
mod supervisor;
#[cfg(test)]
mod supervisor_test;
pub mod worker;

pub use backoff::ExponentialBackoff;
pub use error::SupervisorError;
pub use process::Process;
pub use supervisor::Supervisor;
pub use worker::{Worker, WorkerHandle};
