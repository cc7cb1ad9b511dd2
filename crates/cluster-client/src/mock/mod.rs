//! Mock ClusterClient for unit testing
//!
//! This module provides an in-memory implementation of `ClusterClientTrait`
//! that can be used in unit tests without a running API server.
//!
//! - `store.rs` - versioned per-kind object store with conflict detection
//!
//! Nothing in the mock runs controllers: pods and batch jobs stay in whatever
//! state the test puts them in via the `set_*` helpers.

mod store;

use crate::cluster_trait::{ClusterClientTrait, object_key};
use crate::error::ClusterError;
use crds::{TorchrunJob, TorchrunQueue};
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{ApiResource, DynamicObject};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use store::{Store, matches_selector};

/// Mock ClusterClient for testing
///
/// Clones share the same underlying stores, so a test can keep one handle
/// for setup/inspection while the reconciler owns another.
#[derive(Clone)]
pub struct MockClusterClient {
    torchrun_jobs: Store<TorchrunJob>,
    torchrun_queues: Store<TorchrunQueue>,
    pvcs: Store<PersistentVolumeClaim>,
    pods: Store<Pod>,
    batch_jobs: Store<Job>,
    // (apiVersion, kind) -> store
    dynamic: Arc<Mutex<HashMap<(String, String), Store<DynamicObject>>>>,
    default_storage_class: Arc<Mutex<Option<String>>>,
    // operation name -> error message returned while set
    failures: Arc<Mutex<HashMap<String, String>>>,
    creates: Arc<Mutex<HashMap<String, usize>>>,
    versions: Arc<AtomicU64>,
}

impl std::fmt::Debug for MockClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockClusterClient").finish_non_exhaustive()
    }
}

impl Default for MockClusterClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClusterClient {
    /// Create an empty mock store
    #[must_use]
    pub fn new() -> Self {
        let versions = Arc::new(AtomicU64::new(0));
        Self {
            torchrun_jobs: Store::new("TorchrunJob", versions.clone()),
            torchrun_queues: Store::new("TorchrunQueue", versions.clone()),
            pvcs: Store::new("PersistentVolumeClaim", versions.clone()),
            pods: Store::new("Pod", versions.clone()),
            batch_jobs: Store::new("Job", versions.clone()),
            dynamic: Arc::new(Mutex::new(HashMap::new())),
            default_storage_class: Arc::new(Mutex::new(None)),
            failures: Arc::new(Mutex::new(HashMap::new())),
            creates: Arc::new(Mutex::new(HashMap::new())),
            versions,
        }
    }

    /// Add a TorchrunJob to the mock store (for test setup)
    pub fn add_torchrun_job(&self, job: TorchrunJob) -> TorchrunJob {
        let namespace = job.metadata.namespace.clone().unwrap_or_default();
        self.torchrun_jobs.create(&namespace, &job).unwrap()
    }

    /// Add a TorchrunQueue to the mock store (for test setup)
    pub fn add_torchrun_queue(&self, queue: TorchrunQueue) -> TorchrunQueue {
        let namespace = queue.metadata.namespace.clone().unwrap_or_default();
        self.torchrun_queues.create(&namespace, &queue).unwrap()
    }

    /// Remove a TorchrunQueue outright (object gone, no finalizer processing)
    pub fn remove_torchrun_queue(&self, namespace: &str, name: &str) {
        self.torchrun_queues.remove(namespace, name);
    }

    /// Remove a batch Job, as the TTL-after-finished controller would
    pub fn remove_batch_job(&self, namespace: &str, name: &str) {
        self.batch_jobs.remove(namespace, name);
    }

    /// Set the deletion timestamp of a TorchrunJob, as `kubectl delete` would
    pub fn mark_torchrun_job_deleted(&self, namespace: &str, name: &str) {
        self.torchrun_jobs
            .update(namespace, name, None, |job| {
                job.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            })
            .unwrap();
    }

    /// Set the deletion timestamp of a TorchrunQueue. The object stays until
    /// its finalizers are cleared.
    pub fn mark_torchrun_queue_deleted(&self, namespace: &str, name: &str) {
        self.torchrun_queues
            .update(namespace, name, None, |queue| {
                queue.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            })
            .unwrap();
    }

    /// Replace a TorchrunQueue spec (simulates an operator edit)
    pub fn update_torchrun_queue_spec(&self, namespace: &str, name: &str, spec: crds::TorchrunQueueSpec) {
        self.torchrun_queues
            .update(namespace, name, None, |queue| {
                queue.spec = spec;
                queue.metadata.generation = Some(queue.metadata.generation.unwrap_or(1) + 1);
            })
            .unwrap();
    }

    /// Set the phase and message of a pod
    pub fn set_pod_phase(&self, namespace: &str, name: &str, phase: &str, message: Option<&str>) {
        self.pods
            .update(namespace, name, None, |pod| {
                let status = pod.status.get_or_insert_with(PodStatus::default);
                status.phase = Some(phase.to_string());
                status.message = message.map(str::to_string);
            })
            .unwrap();
    }

    /// Replace the status of a batch job
    pub fn set_batch_job_status(&self, namespace: &str, name: &str, status: JobStatus) {
        self.batch_jobs
            .update(namespace, name, None, |job| job.status = Some(status))
            .unwrap();
    }

    /// Bump the resource version of a PVC without changing it (simulates a concurrent writer)
    pub fn touch_pvc(&self, namespace: &str, name: &str) {
        self.pvcs.update(namespace, name, None, |_| {}).unwrap();
    }

    /// Set the StorageClass reported as the cluster default
    pub fn set_default_storage_class(&self, name: Option<&str>) {
        *self.default_storage_class.lock().unwrap() = name.map(str::to_string);
    }

    /// Make every call of `operation` (a trait method name) fail with `Unavailable`
    pub fn fail_operation(&self, operation: &str, message: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(operation.to_string(), message.to_string());
    }

    /// Stop injecting failures
    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    // Inspection helpers

    #[must_use]
    pub fn torchrun_job(&self, namespace: &str, name: &str) -> Option<TorchrunJob> {
        self.torchrun_jobs.find(namespace, name)
    }

    #[must_use]
    pub fn torchrun_queue(&self, namespace: &str, name: &str) -> Option<TorchrunQueue> {
        self.torchrun_queues.find(namespace, name)
    }

    #[must_use]
    pub fn pvc(&self, namespace: &str, name: &str) -> Option<PersistentVolumeClaim> {
        self.pvcs.find(namespace, name)
    }

    #[must_use]
    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.pods.find(namespace, name)
    }

    #[must_use]
    pub fn batch_job(&self, namespace: &str, name: &str) -> Option<Job> {
        self.batch_jobs.find(namespace, name)
    }

    #[must_use]
    pub fn pod_count(&self) -> usize {
        self.pods.len()
    }

    #[must_use]
    pub fn batch_job_count(&self) -> usize {
        self.batch_jobs.len()
    }

    #[must_use]
    pub fn pvc_count(&self) -> usize {
        self.pvcs.len()
    }

    /// All stored objects of the given resource type
    #[must_use]
    pub fn dynamic_objects(&self, resource: &ApiResource) -> Vec<DynamicObject> {
        self.dynamic_store(resource).list()
    }

    /// Number of successful create calls for `kind` (e.g. "Pod", "Queue")
    #[must_use]
    pub fn create_count(&self, kind: &str) -> usize {
        self.creates.lock().unwrap().get(kind).copied().unwrap_or(0)
    }

    fn check(&self, operation: &str) -> Result<(), ClusterError> {
        match self.failures.lock().unwrap().get(operation) {
            Some(message) => Err(ClusterError::Unavailable(message.clone())),
            None => Ok(()),
        }
    }

    fn record_create(&self, kind: &str) {
        *self.creates.lock().unwrap().entry(kind.to_string()).or_insert(0) += 1;
    }

    fn dynamic_store(&self, resource: &ApiResource) -> Store<DynamicObject> {
        self.dynamic
            .lock()
            .unwrap()
            .entry((resource.api_version.clone(), resource.kind.clone()))
            .or_insert_with(|| Store::new("DynamicObject", self.versions.clone()))
            .clone()
    }
}

#[async_trait::async_trait]
impl ClusterClientTrait for MockClusterClient {
    async fn get_torchrun_job(&self, namespace: &str, name: &str) -> Result<TorchrunJob, ClusterError> {
        self.check("get_torchrun_job")?;
        self.torchrun_jobs.get(namespace, name)
    }

    async fn patch_torchrun_job_status(&self, job: &TorchrunJob) -> Result<TorchrunJob, ClusterError> {
        self.check("patch_torchrun_job_status")?;
        let (namespace, name) = object_key(&job.metadata)?;
        let status = job.status.clone();
        self.torchrun_jobs.update(
            &namespace,
            &name,
            job.metadata.resource_version.as_deref(),
            |stored| stored.status = status,
        )
    }

    async fn get_torchrun_queue(&self, namespace: &str, name: &str) -> Result<TorchrunQueue, ClusterError> {
        self.check("get_torchrun_queue")?;
        self.torchrun_queues.get(namespace, name)
    }

    async fn patch_torchrun_queue_status(&self, queue: &TorchrunQueue) -> Result<TorchrunQueue, ClusterError> {
        self.check("patch_torchrun_queue_status")?;
        let (namespace, name) = object_key(&queue.metadata)?;
        let status = queue.status.clone();
        self.torchrun_queues.update(
            &namespace,
            &name,
            queue.metadata.resource_version.as_deref(),
            |stored| stored.status = status,
        )
    }

    async fn patch_torchrun_queue_finalizers(
        &self,
        queue: &TorchrunQueue,
        finalizers: &[String],
    ) -> Result<TorchrunQueue, ClusterError> {
        self.check("patch_torchrun_queue_finalizers")?;
        let (namespace, name) = object_key(&queue.metadata)?;
        let updated = self.torchrun_queues.update(
            &namespace,
            &name,
            queue.metadata.resource_version.as_deref(),
            |stored| stored.metadata.finalizers = Some(finalizers.to_vec()),
        )?;
        if updated.metadata.deletion_timestamp.is_some() && finalizers.is_empty() {
            self.torchrun_queues.remove(&namespace, &name);
        }
        Ok(updated)
    }

    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim, ClusterError> {
        self.check("get_pvc")?;
        self.pvcs.get(namespace, name)
    }

    async fn create_pvc(&self, namespace: &str, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim, ClusterError> {
        self.check("create_pvc")?;
        let created = self.pvcs.create(namespace, pvc)?;
        self.record_create("PersistentVolumeClaim");
        Ok(created)
    }

    async fn patch_pvc_labels(
        &self,
        pvc: &PersistentVolumeClaim,
        labels: &BTreeMap<String, String>,
    ) -> Result<PersistentVolumeClaim, ClusterError> {
        self.check("patch_pvc_labels")?;
        let (namespace, name) = object_key(&pvc.metadata)?;
        self.pvcs.update(
            &namespace,
            &name,
            pvc.metadata.resource_version.as_deref(),
            |stored| {
                let existing = stored.metadata.labels.get_or_insert_with(BTreeMap::new);
                existing.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
            },
        )
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError> {
        self.check("get_pod")?;
        self.pods.get(namespace, name)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, ClusterError> {
        self.check("create_pod")?;
        let mut pod = pod.clone();
        pod.status.get_or_insert_with(PodStatus::default).phase = Some("Pending".to_string());
        let created = self.pods.create(namespace, &pod)?;
        self.record_create("Pod");
        Ok(created)
    }

    async fn get_batch_job(&self, namespace: &str, name: &str) -> Result<Job, ClusterError> {
        self.check("get_batch_job")?;
        self.batch_jobs.get(namespace, name)
    }

    async fn create_batch_job(&self, namespace: &str, job: &Job) -> Result<Job, ClusterError> {
        self.check("create_batch_job")?;
        let created = self.batch_jobs.create(namespace, job)?;
        self.record_create("Job");
        Ok(created)
    }

    async fn default_storage_class(&self) -> Result<Option<String>, ClusterError> {
        self.check("default_storage_class")?;
        Ok(self.default_storage_class.lock().unwrap().clone())
    }

    async fn get_dynamic(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject, ClusterError> {
        self.check("get_dynamic")?;
        self.dynamic_store(resource).get(namespace.unwrap_or_default(), name)
    }

    async fn create_dynamic(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError> {
        self.check("create_dynamic")?;
        let created = self.dynamic_store(resource).create(namespace.unwrap_or_default(), obj)?;
        self.record_create(&resource.kind);
        Ok(created)
    }

    async fn replace_dynamic(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError> {
        self.check("replace_dynamic")?;
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| ClusterError::InvalidObject(format!("{} has no name", resource.kind)))?;
        // A replace without a resource version is rejected by the API server.
        let resource_version = obj.metadata.resource_version.as_deref().ok_or_else(|| {
            ClusterError::InvalidObject(format!("{} {} replaced without resourceVersion", resource.kind, name))
        })?;
        let replacement = obj.clone();
        self.dynamic_store(resource).update(
            namespace.unwrap_or_default(),
            &name,
            Some(resource_version),
            |stored| {
                let uid = stored.metadata.uid.clone();
                let created = stored.metadata.creation_timestamp.clone();
                *stored = replacement;
                stored.metadata.uid = uid;
                stored.metadata.creation_timestamp = created;
            },
        )
    }

    async fn list_dynamic(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, ClusterError> {
        self.check("list_dynamic")?;
        Ok(self
            .dynamic_store(resource)
            .list()
            .into_iter()
            .filter(|obj| namespace.is_none_or(|ns| obj.metadata.namespace.as_deref() == Some(ns)))
            .filter(|obj| matches_selector(obj.metadata.labels.as_ref(), label_selector))
            .collect())
    }

    async fn delete_dynamic(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), ClusterError> {
        self.check("delete_dynamic")?;
        let ns = namespace.unwrap_or_default();
        self.dynamic_store(resource)
            .remove(ns, name)
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound(format!("{} {} not found", resource.kind, name)))
    }
}
