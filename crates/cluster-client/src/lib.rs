//! Kubernetes object-store client for the torchrun controller
//!
//! Reconcilers talk to the cluster only through [`ClusterClientTrait`]. The
//! production implementation, [`ClusterClient`], wraps `kube::Api`; the
//! in-memory [`MockClusterClient`] (feature `test-util`) keeps resource
//! versions and rejects stale writes the same way the API server does.
//!
//! # Example
//!
//! ```no_run
//! use cluster_client::{ClusterClient, ClusterClientTrait, ClusterError};
//!
//! # async fn example() -> Result<(), ClusterError> {
//! let client = ClusterClient::try_default().await?;
//! match client.get_torchrun_queue("ml", "dev").await {
//!     Ok(queue) => println!("scheduler queue {}", queue.spec.queue.name),
//!     Err(ClusterError::NotFound(_)) => println!("queue missing"),
//!     Err(e) => return Err(e),
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
#[path = "trait.rs"]
pub mod cluster_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::ClusterClient;
pub use cluster_trait::ClusterClientTrait;
pub use error::ClusterError;
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockClusterClient;
