//! Consul HTTP API Client
//!
//! A small async client for the parts of the Consul agent API used to
//! follow service membership and to hold a Connect leadership lock.
//!
//! # Example
//!
//! ```no_run
//! use consul_client::{ConsulClient, ConsulClientTrait, QueryOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ConsulClient::new("127.0.0.1:8500")?;
//!
//! // Initial read, then block until membership changes
//! let first = client.health_service("web", &QueryOptions::default()).await?;
//! let next = client
//!     .health_service("web", &QueryOptions { index: first.index, ..Default::default() })
//!     .await?;
//! println!("{} instances", next.value.len());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod consul_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::ConsulClient;
pub use consul_trait::ConsulClientTrait;
pub use error::ConsulError;
pub use models::*;
#[cfg(feature = "test-util")]
pub use mock::MockConsulClient;
