//! Cluster client errors

use thiserror::Error;

/// Errors returned by [`crate::ClusterClientTrait`] operations
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Create raced with another writer
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Write carried a stale resource version
    #[error("Conflict: {0}")]
    Conflict(String),

    /// API server unreachable or failing
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Object is missing fields required for the operation (name, namespace, ...)
    #[error("Invalid object: {0}")]
    InvalidObject(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other Kubernetes client error
    #[error("Kubernetes error: {0}")]
    Kube(kube::Error),
}

impl ClusterError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        if let kube::Error::Api(ae) = &err {
            match ae.code {
                404 => return ClusterError::NotFound(ae.message.clone()),
                409 if ae.reason == "AlreadyExists" => {
                    return ClusterError::AlreadyExists(ae.message.clone());
                }
                409 => return ClusterError::Conflict(ae.message.clone()),
                code if code >= 500 => return ClusterError::Unavailable(ae.message.clone()),
                _ => {}
            }
        }
        ClusterError::Kube(err)
    }
}
