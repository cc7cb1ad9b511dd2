//! kube-rs backed implementation of [`ClusterClientTrait`].

use crate::cluster_trait::{ClusterClientTrait, object_key};
use crate::error::ClusterError;
use crds::{TorchrunJob, TorchrunQueue};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::debug;

const DEFAULT_CLASS_ANNOTATION: &str = "storageclass.kubernetes.io/is-default-class";
const BETA_DEFAULT_CLASS_ANNOTATION: &str = "storageclass.beta.kubernetes.io/is-default-class";

/// Object-store client backed by the Kubernetes API server
#[derive(Clone)]
pub struct ClusterClient {
    client: Client,
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient").finish_non_exhaustive()
    }
}

impl ClusterClient {
    /// Wraps an existing kube client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Builds a client from the in-cluster or kubeconfig environment.
    pub async fn try_default() -> Result<Self, ClusterError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    /// Underlying kube client, for watchers.
    #[must_use]
    pub fn kube_client(&self) -> Client {
        self.client.clone()
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn dynamic(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }
}

/// Merge patch body that only applies if the object is still at `resource_version`.
fn guarded_patch(resource_version: Option<&String>, body: serde_json::Value) -> serde_json::Value {
    let mut patch = body;
    if let Some(rv) = resource_version {
        patch["metadata"]["resourceVersion"] = json!(rv);
    }
    patch
}

#[async_trait::async_trait]
impl ClusterClientTrait for ClusterClient {
    async fn get_torchrun_job(&self, namespace: &str, name: &str) -> Result<TorchrunJob, ClusterError> {
        Ok(self.namespaced::<TorchrunJob>(namespace).get(name).await?)
    }

    async fn patch_torchrun_job_status(&self, job: &TorchrunJob) -> Result<TorchrunJob, ClusterError> {
        let (namespace, name) = object_key(&job.metadata)?;
        let patch = guarded_patch(
            job.metadata.resource_version.as_ref(),
            json!({ "status": job.status }),
        );
        debug!("Patching TorchrunJob {}/{} status", namespace, name);
        Ok(self
            .namespaced::<TorchrunJob>(&namespace)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn get_torchrun_queue(&self, namespace: &str, name: &str) -> Result<TorchrunQueue, ClusterError> {
        Ok(self.namespaced::<TorchrunQueue>(namespace).get(name).await?)
    }

    async fn patch_torchrun_queue_status(&self, queue: &TorchrunQueue) -> Result<TorchrunQueue, ClusterError> {
        let (namespace, name) = object_key(&queue.metadata)?;
        let patch = guarded_patch(
            queue.metadata.resource_version.as_ref(),
            json!({ "status": queue.status }),
        );
        debug!("Patching TorchrunQueue {}/{} status", namespace, name);
        Ok(self
            .namespaced::<TorchrunQueue>(&namespace)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn patch_torchrun_queue_finalizers(
        &self,
        queue: &TorchrunQueue,
        finalizers: &[String],
    ) -> Result<TorchrunQueue, ClusterError> {
        let (namespace, name) = object_key(&queue.metadata)?;
        let patch = guarded_patch(
            queue.metadata.resource_version.as_ref(),
            json!({ "metadata": { "finalizers": finalizers } }),
        );
        Ok(self
            .namespaced::<TorchrunQueue>(&namespace)
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim, ClusterError> {
        Ok(self.namespaced::<PersistentVolumeClaim>(namespace).get(name).await?)
    }

    async fn create_pvc(&self, namespace: &str, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim, ClusterError> {
        Ok(self
            .namespaced::<PersistentVolumeClaim>(namespace)
            .create(&PostParams::default(), pvc)
            .await?)
    }

    async fn patch_pvc_labels(
        &self,
        pvc: &PersistentVolumeClaim,
        labels: &BTreeMap<String, String>,
    ) -> Result<PersistentVolumeClaim, ClusterError> {
        let (namespace, name) = object_key(&pvc.metadata)?;
        let patch = guarded_patch(
            pvc.metadata.resource_version.as_ref(),
            json!({ "metadata": { "labels": labels } }),
        );
        Ok(self
            .namespaced::<PersistentVolumeClaim>(&namespace)
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError> {
        Ok(self.namespaced::<Pod>(namespace).get(name).await?)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, ClusterError> {
        Ok(self.namespaced::<Pod>(namespace).create(&PostParams::default(), pod).await?)
    }

    async fn get_batch_job(&self, namespace: &str, name: &str) -> Result<Job, ClusterError> {
        Ok(self.namespaced::<Job>(namespace).get(name).await?)
    }

    async fn create_batch_job(&self, namespace: &str, job: &Job) -> Result<Job, ClusterError> {
        Ok(self.namespaced::<Job>(namespace).create(&PostParams::default(), job).await?)
    }

    async fn default_storage_class(&self) -> Result<Option<String>, ClusterError> {
        let classes: Api<StorageClass> = Api::all(self.client.clone());
        let list = classes.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .find(|sc| {
                sc.metadata.annotations.as_ref().is_some_and(|a| {
                    a.get(DEFAULT_CLASS_ANNOTATION)
                        .or_else(|| a.get(BETA_DEFAULT_CLASS_ANNOTATION))
                        .is_some_and(|v| v == "true")
                })
            })
            .and_then(|sc| sc.metadata.name))
    }

    async fn get_dynamic(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject, ClusterError> {
        Ok(self.dynamic(resource, namespace).get(name).await?)
    }

    async fn create_dynamic(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError> {
        Ok(self
            .dynamic(resource, namespace)
            .create(&PostParams::default(), obj)
            .await?)
    }

    async fn replace_dynamic(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError> {
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| ClusterError::InvalidObject(format!("{} has no name", resource.kind)))?;
        Ok(self
            .dynamic(resource, namespace)
            .replace(&name, &PostParams::default(), obj)
            .await?)
    }

    async fn list_dynamic(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, ClusterError> {
        let list = self
            .dynamic(resource, namespace)
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }

    async fn delete_dynamic(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), ClusterError> {
        self.dynamic(resource, namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }
}
