//! ClusterClient trait for mocking
//!
//! This trait abstracts object-store access so reconcilers can be exercised
//! against [`crate::MockClusterClient`] in unit tests.

use crate::error::ClusterError;
use crds::{TorchrunJob, TorchrunQueue};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::api::{ApiResource, DynamicObject};
use std::collections::BTreeMap;

/// Trait for object-store operations used by the torchrun reconcilers
///
/// Writes that take a full object use its `metadata.resourceVersion` as a
/// precondition; a stale version yields [`ClusterError::Conflict`].
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ClusterClientTrait: Send + Sync {
    // TorchrunJob
    async fn get_torchrun_job(&self, namespace: &str, name: &str) -> Result<TorchrunJob, ClusterError>;
    /// Writes `job.status` through the status subresource.
    async fn patch_torchrun_job_status(&self, job: &TorchrunJob) -> Result<TorchrunJob, ClusterError>;

    // TorchrunQueue
    async fn get_torchrun_queue(&self, namespace: &str, name: &str) -> Result<TorchrunQueue, ClusterError>;
    /// Writes `queue.status` through the status subresource.
    async fn patch_torchrun_queue_status(&self, queue: &TorchrunQueue) -> Result<TorchrunQueue, ClusterError>;
    /// Replaces the finalizer list of `queue`.
    async fn patch_torchrun_queue_finalizers(
        &self,
        queue: &TorchrunQueue,
        finalizers: &[String],
    ) -> Result<TorchrunQueue, ClusterError>;

    // Core workloads
    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim, ClusterError>;
    async fn create_pvc(&self, namespace: &str, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim, ClusterError>;
    /// Merges `labels` into the labels of `pvc`.
    async fn patch_pvc_labels(
        &self,
        pvc: &PersistentVolumeClaim,
        labels: &BTreeMap<String, String>,
    ) -> Result<PersistentVolumeClaim, ClusterError>;
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError>;
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, ClusterError>;
    async fn get_batch_job(&self, namespace: &str, name: &str) -> Result<Job, ClusterError>;
    async fn create_batch_job(&self, namespace: &str, job: &Job) -> Result<Job, ClusterError>;

    /// Name of the StorageClass annotated as the cluster default, if any.
    async fn default_storage_class(&self) -> Result<Option<String>, ClusterError>;

    // Arbitrary resources (scheduler queues, queue-declared resources).
    // `namespace: None` addresses cluster-scoped objects.
    async fn get_dynamic(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject, ClusterError>;
    async fn create_dynamic(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError>;
    async fn replace_dynamic(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError>;
    async fn list_dynamic(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, ClusterError>;
    async fn delete_dynamic(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), ClusterError>;
}

/// Namespace and name of an object, or `InvalidObject` if either is missing.
pub(crate) fn object_key(
    metadata: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
) -> Result<(String, String), ClusterError> {
    let name = metadata
        .name
        .clone()
        .ok_or_else(|| ClusterError::InvalidObject("object has no name".to_string()))?;
    let namespace = metadata
        .namespace
        .clone()
        .ok_or_else(|| ClusterError::InvalidObject(format!("object {} has no namespace", name)))?;
    Ok((namespace, name))
}
