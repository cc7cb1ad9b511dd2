//! Controller-specific error types.
//!
//! This module defines error types specific to the torchrun controller
//! that are not covered by upstream library errors.

use cluster_client::ClusterError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the torchrun controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes client error (startup and watch plumbing)
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Object-store operation failed
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Referenced TorchrunQueue does not exist
    #[error("TorchrunQueue not found: {0}")]
    QueueNotFound(String),

    /// Queue pod template cannot produce worker pods
    #[error("Invalid pod template: {0}")]
    InvalidPodTemplate(String),

    /// Workspace preparation pod failed
    #[error("Workspace sync failed: {0}")]
    WorkspaceSyncFailed(String),

    /// No storage class could be resolved for the workspace volume
    #[error("No storage class for workspace volume: {0}")]
    NoStorageClass(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Probe/metrics server I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControllerError {
    /// Errors that retrying cannot fix; the object needs a spec change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ControllerError::QueueNotFound(_)
                | ControllerError::InvalidPodTemplate(_)
                | ControllerError::WorkspaceSyncFailed(_)
        )
    }

    /// Short label for metrics.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            ControllerError::Kube(_) => "Kube",
            ControllerError::Cluster(ClusterError::Conflict(_)) => "Conflict",
            ControllerError::Cluster(_) => "Cluster",
            ControllerError::InvalidConfig(_) => "InvalidConfig",
            ControllerError::QueueNotFound(_) => "QueueNotFound",
            ControllerError::InvalidPodTemplate(_) => "InvalidPodTemplate",
            ControllerError::WorkspaceSyncFailed(_) => "SyncFailed",
            ControllerError::NoStorageClass(_) => "NoStorageClass",
            ControllerError::Serialization(_) => "Serialization",
            ControllerError::Metrics(_) => "Metrics",
            ControllerError::Watch(_) => "Watch",
            ControllerError::Io(_) => "Io",
        }
    }
}
