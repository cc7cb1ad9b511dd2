//! TorchrunQueue reconciler
//!
//! Mirrors each TorchrunQueue into a cluster-scoped kai-scheduler `Queue`
//! and creates the queue-declared resources in the queue's namespace. The
//! scheduler queue cannot carry an owner reference to the namespaced
//! TorchrunQueue, so it is found again by label for cleanup; the
//! `torchrun.ai/queue-cleanup` finalizer keeps the TorchrunQueue around until
//! that cleanup has run.

use super::{Reconciler, Requeue};
use crate::error::ControllerError;
use crate::naming::{self, QUEUE_FINALIZER};
use crate::status::set_condition;
use crate::template;
use chrono::Utc;
use cluster_client::{ClusterClientTrait, ClusterError};
use crds::{
    ConditionStatus, QueuePhase, QueueResourceTemplate, ResourceQuota, ResourceStatus, TorchrunQueue,
    TorchrunQueueStatus, condition_types,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Resource, ResourceExt};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

/// kai-scheduler `Queue` (scheduling.run.ai/v2, cluster scoped).
#[must_use]
pub fn scheduler_queue_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk("scheduling.run.ai", "v2", "Queue"), "queues")
}

/// Scheduler queue mirrored from `queue`.
#[must_use]
pub fn build_scheduler_queue(queue: &TorchrunQueue) -> DynamicObject {
    let spec = &queue.spec.queue;
    let quota = |q: &ResourceQuota| {
        json!({
            "quota": q.quota,
            "limit": q.limit,
            "overQuotaWeight": q.over_quota_weight,
        })
    };
    let mut obj = DynamicObject::new(&spec.name, &scheduler_queue_resource()).data(json!({
        "spec": {
            "parentQueue": spec.parent_queue,
            "resources": {
                "cpu": quota(&spec.resources.cpu),
                "gpu": quota(&spec.resources.gpu),
                "memory": quota(&spec.resources.memory),
            }
        }
    }));
    obj.metadata.labels = Some(naming::queue_labels(queue));
    obj
}

/// Outcome of syncing the scheduler queue.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SchedulerQueueState {
    Ready,
    /// The scheduler queue could not be created (e.g. its CRD is not installed)
    Missing(String),
    /// Reading the scheduler queue failed
    Unknown(String),
}

/// `true` when every top-level key of `desired` has the same value in `existing`.
fn contains_desired(existing: &Value, desired: &Value) -> bool {
    match desired.as_object() {
        Some(fields) => fields.iter().all(|(key, value)| existing.get(key) == Some(value)),
        None => existing == desired,
    }
}

fn labels_contain(existing: Option<&BTreeMap<String, String>>, desired: Option<&BTreeMap<String, String>>) -> bool {
    desired
        .into_iter()
        .flatten()
        .all(|(k, v)| existing.and_then(|labels| labels.get(k)) == Some(v))
}

/// `true` when the two statuses differ in anything but `lastUpdateTime`.
fn queue_status_changed(before: Option<&TorchrunQueueStatus>, after: &TorchrunQueueStatus) -> bool {
    let strip = |status: &TorchrunQueueStatus| {
        let mut status = status.clone();
        status.last_update_time = None;
        status
    };
    before.map(strip) != Some(strip(after))
}

/// Typed resource and object for a queue-declared resource.
fn build_queue_resource(
    queue: &TorchrunQueue,
    resource: &QueueResourceTemplate,
    name: &str,
) -> Result<(ApiResource, DynamicObject), ControllerError> {
    let field = |key: &str| {
        resource
            .template
            .get(key)
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                ClusterError::InvalidObject(format!("resource {} template has no {}", resource.name, key))
            })
    };
    let api_version = field("apiVersion")?;
    let kind = field("kind")?;
    let (group, version) = api_version.split_once('/').unwrap_or(("", api_version.as_str()));
    let api_resource = ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, &kind));

    let mut data = resource.template.clone();
    let declared_meta = match data.as_object_mut() {
        Some(fields) => {
            fields.remove("apiVersion");
            fields.remove("kind");
            fields.remove("metadata")
        }
        None => None,
    };
    let declared_meta: ObjectMeta = match declared_meta {
        Some(meta) => serde_json::from_value(meta)?,
        None => ObjectMeta::default(),
    };

    let mut labels = declared_meta.labels.unwrap_or_default();
    labels.extend(naming::queue_labels(queue));

    let mut obj = DynamicObject::new(name, &api_resource)
        .within(&queue.namespace().unwrap_or_else(|| "default".to_string()))
        .data(data);
    obj.metadata.labels = Some(labels);
    obj.metadata.annotations = declared_meta.annotations;
    obj.metadata.owner_references = queue.controller_owner_ref(&()).map(|owner| vec![owner]);
    Ok((api_resource, obj))
}

impl Reconciler {
    /// Reconciles one TorchrunQueue.
    pub async fn reconcile_torchrun_queue(&self, namespace: &str, name: &str) -> Result<Requeue, ControllerError> {
        let client: &dyn ClusterClientTrait = &*self.client;
        let mut queue = match client.get_torchrun_queue(namespace, name).await {
            Ok(queue) => queue,
            Err(ClusterError::NotFound(_)) => {
                debug!("TorchrunQueue {}/{} no longer exists, cleaning up scheduler queues", namespace, name);
                self.cleanup_scheduler_queues(namespace, name, None).await?;
                return Ok(Requeue::Never);
            }
            Err(e) => return Err(e.into()),
        };
        debug!("Reconciling TorchrunQueue {}/{}", namespace, name);

        if queue.metadata.deletion_timestamp.is_some() {
            return self.finalize_torchrun_queue(queue).await;
        }

        if !queue.finalizers().iter().any(|f| f == QUEUE_FINALIZER) {
            let mut finalizers = queue.finalizers().to_vec();
            finalizers.push(QUEUE_FINALIZER.to_string());
            queue = client.patch_torchrun_queue_finalizers(&queue, &finalizers).await?;
            debug!("Added finalizer to TorchrunQueue {}/{}", namespace, name);
        }

        let before = queue.status.clone();
        let mut status = before.clone().unwrap_or_default();
        status.observed_generation = queue.metadata.generation;
        status.last_update_time = Some(Utc::now());

        if let Err(e) = validate_queue(&queue) {
            error!("TorchrunQueue {}/{} is invalid: {}", namespace, name, e);
            set_condition(
                &mut status.conditions,
                condition_types::VALID,
                ConditionStatus::False,
                "ValidationError",
                e.to_string(),
            );
            self.metrics.record_terminal_failure(e.reason());
            self.persist_queue_status(&mut queue, before.as_ref(), status).await?;
            return Ok(Requeue::Never);
        }
        set_condition(
            &mut status.conditions,
            condition_types::VALID,
            ConditionStatus::True,
            "ValidationSucceeded",
            "Pod template is valid",
        );

        let mut resource_statuses = Vec::with_capacity(queue.spec.resources.len());
        for resource in &queue.spec.resources {
            resource_statuses.push(self.apply_queue_resource(&queue, resource).await);
        }
        let resources_ready = resource_statuses.iter().all(|r| r.ready);
        let unready: Vec<&str> = resource_statuses
            .iter()
            .filter(|r| !r.ready)
            .map(|r| r.name.as_str())
            .collect();
        if resources_ready {
            set_condition(
                &mut status.conditions,
                condition_types::RESOURCES_READY,
                ConditionStatus::True,
                "ResourcesReady",
                format!("{} resource(s) applied", resource_statuses.len()),
            );
        } else {
            set_condition(
                &mut status.conditions,
                condition_types::RESOURCES_READY,
                ConditionStatus::False,
                "ResourcesNotReady",
                format!("failed to apply: {}", unready.join(", ")),
            );
        }
        status.resources_ready = resources_ready;
        status.resource_statuses = resource_statuses;

        let scheduler_queue = self.sync_scheduler_queue(&queue).await?;
        match &scheduler_queue {
            SchedulerQueueState::Ready => {
                set_condition(
                    &mut status.conditions,
                    condition_types::QUEUE_READY,
                    ConditionStatus::True,
                    "QueueSynced",
                    format!("Scheduler queue {} is in sync", queue.spec.queue.name),
                );
                status.phase = QueuePhase::Active;
            }
            SchedulerQueueState::Missing(message) => {
                set_condition(
                    &mut status.conditions,
                    condition_types::QUEUE_READY,
                    ConditionStatus::False,
                    "QueueMissing",
                    message.clone(),
                );
                status.phase = QueuePhase::Updating;
            }
            SchedulerQueueState::Unknown(message) => {
                set_condition(
                    &mut status.conditions,
                    condition_types::QUEUE_READY,
                    ConditionStatus::Unknown,
                    "QueueUnreadable",
                    message.clone(),
                );
                status.phase = QueuePhase::Active;
            }
        }

        self.persist_queue_status(&mut queue, before.as_ref(), status).await?;

        if scheduler_queue == SchedulerQueueState::Ready && resources_ready {
            Ok(Requeue::Never)
        } else {
            Ok(Requeue::After(self.config.queue_requeue))
        }
    }

    /// Deletion path: mark `Terminating`, delete mirrored scheduler queues,
    /// release the finalizer.
    async fn finalize_torchrun_queue(&self, mut queue: TorchrunQueue) -> Result<Requeue, ControllerError> {
        let namespace = queue.namespace().unwrap_or_else(|| "default".to_string());
        let name = queue.name_any();
        if !queue.finalizers().iter().any(|f| f == QUEUE_FINALIZER) {
            debug!("TorchrunQueue {}/{} is being deleted, nothing to clean up", namespace, name);
            return Ok(Requeue::Never);
        }
        info!("TorchrunQueue {}/{} is being deleted", namespace, name);

        let already_terminating = queue.status.as_ref().is_some_and(|s| s.phase == QueuePhase::Terminating);
        if !already_terminating {
            queue.status.get_or_insert_with(TorchrunQueueStatus::default).phase = QueuePhase::Terminating;
            match self.client.patch_torchrun_queue_status(&queue).await {
                Ok(updated) => queue = updated,
                Err(e) => warn!("Failed to mark TorchrunQueue {}/{} terminating: {}", namespace, name, e),
            }
        }

        self.cleanup_scheduler_queues(&namespace, &name, None).await?;

        let remaining: Vec<String> = queue
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != QUEUE_FINALIZER)
            .cloned()
            .collect();
        self.client.patch_torchrun_queue_finalizers(&queue, &remaining).await?;
        info!("Released finalizer of TorchrunQueue {}/{}", namespace, name);
        Ok(Requeue::Never)
    }

    /// Deletes the scheduler queues mirrored from `namespace/name`, except
    /// the one named `keep`. Returns how many were deleted.
    async fn cleanup_scheduler_queues(
        &self,
        namespace: &str,
        name: &str,
        keep: Option<&str>,
    ) -> Result<usize, ControllerError> {
        let resource = scheduler_queue_resource();
        let selector = naming::queue_selector(namespace, name);
        let mirrored = match self.client.list_dynamic(&resource, None, &selector).await {
            Ok(mirrored) => mirrored,
            // Scheduler CRD not installed
            Err(ClusterError::NotFound(_)) => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut deleted = 0;
        for obj in mirrored {
            let queue_name = obj.name_any();
            if keep == Some(queue_name.as_str()) {
                continue;
            }
            match self.client.delete_dynamic(&resource, None, &queue_name).await {
                Ok(()) => {
                    info!("Deleted scheduler queue {} of TorchrunQueue {}/{}", queue_name, namespace, name);
                    deleted += 1;
                }
                Err(ClusterError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(deleted)
    }

    /// Creates or replaces the scheduler queue. A stale write is returned as
    /// an error so the reconcile is retried.
    async fn sync_scheduler_queue(&self, queue: &TorchrunQueue) -> Result<SchedulerQueueState, ControllerError> {
        let resource = scheduler_queue_resource();
        let mut desired = build_scheduler_queue(queue);
        let queue_name = queue.spec.queue.name.clone();

        let state = match self.client.get_dynamic(&resource, None, &queue_name).await {
            Ok(existing) => {
                let in_sync = existing.data.get("spec") == desired.data.get("spec")
                    && labels_contain(existing.metadata.labels.as_ref(), desired.metadata.labels.as_ref());
                if !in_sync {
                    desired.metadata.resource_version = existing.metadata.resource_version.clone();
                    self.client.replace_dynamic(&resource, None, &desired).await?;
                    info!("Updated scheduler queue {}", queue_name);
                }
                SchedulerQueueState::Ready
            }
            Err(ClusterError::NotFound(_)) => match self.client.create_dynamic(&resource, None, &desired).await {
                Ok(_) => {
                    info!("Created scheduler queue {} (parent {})", queue_name, queue.spec.queue.parent_queue);
                    SchedulerQueueState::Ready
                }
                Err(ClusterError::NotFound(message)) => {
                    warn!("Cannot create scheduler queue {}: {}", queue_name, message);
                    SchedulerQueueState::Missing(format!("scheduler queue {} could not be created: {}", queue_name, message))
                }
                Err(e) => return Err(e.into()),
            },
            Err(e) => {
                warn!("Failed to read scheduler queue {}: {}", queue_name, e);
                SchedulerQueueState::Unknown(e.to_string())
            }
        };

        if state == SchedulerQueueState::Ready {
            // A renamed scheduler queue leaves the previous one behind.
            let namespace = queue.namespace().unwrap_or_else(|| "default".to_string());
            self.cleanup_scheduler_queues(&namespace, &queue.name_any(), Some(&queue_name))
                .await?;
        }
        Ok(state)
    }

    /// Creates or updates one queue-declared resource. Failures are reported
    /// in the returned status rather than failing the reconcile.
    async fn apply_queue_resource(&self, queue: &TorchrunQueue, resource: &QueueResourceTemplate) -> ResourceStatus {
        let name = resource.object_name(&queue.name_any());
        let kind = resource
            .template
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match self.try_apply_queue_resource(queue, resource, &name).await {
            Ok(message) => ResourceStatus {
                name,
                kind,
                ready: true,
                message,
            },
            Err(e) => {
                warn!(
                    "Failed to apply resource {} of TorchrunQueue {}/{}: {}",
                    name,
                    queue.namespace().unwrap_or_default(),
                    queue.name_any(),
                    e
                );
                ResourceStatus {
                    name,
                    kind,
                    ready: false,
                    message: e.to_string(),
                }
            }
        }
    }

    async fn try_apply_queue_resource(
        &self,
        queue: &TorchrunQueue,
        resource: &QueueResourceTemplate,
        name: &str,
    ) -> Result<String, ControllerError> {
        let (api_resource, mut desired) = build_queue_resource(queue, resource, name)?;
        let namespace = desired.metadata.namespace.clone();

        match self.client.get_dynamic(&api_resource, namespace.as_deref(), name).await {
            Ok(existing) => {
                if resource.immutable {
                    return Ok("exists (immutable)".to_string());
                }
                let in_sync = contains_desired(&existing.data, &desired.data)
                    && labels_contain(existing.metadata.labels.as_ref(), desired.metadata.labels.as_ref());
                if in_sync {
                    return Ok("up to date".to_string());
                }
                desired.metadata.resource_version = existing.metadata.resource_version.clone();
                self.client
                    .replace_dynamic(&api_resource, namespace.as_deref(), &desired)
                    .await?;
                info!("Updated {} {} for TorchrunQueue {}", api_resource.kind, name, queue.name_any());
                Ok("updated".to_string())
            }
            Err(ClusterError::NotFound(_)) => {
                match self
                    .client
                    .create_dynamic(&api_resource, namespace.as_deref(), &desired)
                    .await
                {
                    Ok(_) | Err(ClusterError::AlreadyExists(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                info!("Created {} {} for TorchrunQueue {}", api_resource.kind, name, queue.name_any());
                Ok("created".to_string())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Writes `status` if it differs from `before` in anything but `lastUpdateTime`.
    async fn persist_queue_status(
        &self,
        queue: &mut TorchrunQueue,
        before: Option<&TorchrunQueueStatus>,
        status: TorchrunQueueStatus,
    ) -> Result<(), ControllerError> {
        if !queue_status_changed(before, &status) {
            return Ok(());
        }
        queue.status = Some(status);
        let stored = self.client.patch_torchrun_queue_status(queue).await?;
        queue.metadata.resource_version = stored.metadata.resource_version;
        Ok(())
    }
}

/// Checks what jobs on this queue depend on: a scheduler queue name and a
/// usable trainer pod template.
fn validate_queue(queue: &TorchrunQueue) -> Result<(), ControllerError> {
    if queue.spec.queue.name.trim().is_empty() {
        return Err(ControllerError::InvalidConfig("spec.queue.name must not be empty".to_string()));
    }
    template::resolve_pod_spec(queue).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_queue;

    #[test]
    fn test_scheduler_queue_document() {
        let mut queue = create_test_queue("dev", "ml", "team-a");
        queue.spec.queue.parent_queue = "research".to_string();
        queue.spec.queue.resources.gpu.quota = 8;

        let obj = build_scheduler_queue(&queue);
        assert_eq!(obj.metadata.name.as_deref(), Some("team-a"));
        assert!(obj.metadata.namespace.is_none());
        assert_eq!(obj.data["spec"]["parentQueue"], "research");
        assert_eq!(obj.data["spec"]["resources"]["gpu"]["quota"], 8);
        assert_eq!(obj.data["spec"]["resources"]["gpu"]["limit"], -1);
        assert_eq!(obj.data["spec"]["resources"]["cpu"]["overQuotaWeight"], 1);
        let labels = obj.metadata.labels.unwrap();
        assert_eq!(labels.get(naming::QUEUE_LABEL).map(String::as_str), Some("dev"));
        assert_eq!(labels.get(naming::QUEUE_NAMESPACE_LABEL).map(String::as_str), Some("ml"));
    }

    #[test]
    fn test_queue_resource_keeps_declared_metadata() {
        let queue = create_test_queue("dev", "ml", "team-a");
        let resource = QueueResourceTemplate {
            name: "datasets".to_string(),
            name_mode: crds::NameMode::Prefix,
            immutable: false,
            template: json!({
                "apiVersion": "v1",
                "kind": "PersistentVolumeClaim",
                "metadata": { "name": "datasets", "labels": { "tier": "data" } },
                "spec": { "accessModes": ["ReadWriteMany"] }
            }),
        };

        let (api_resource, obj) = build_queue_resource(&queue, &resource, "dev-datasets").unwrap();
        assert_eq!(api_resource.kind, "PersistentVolumeClaim");
        assert_eq!(api_resource.plural, "persistentvolumeclaims");
        assert_eq!(obj.metadata.name.as_deref(), Some("dev-datasets"));
        assert_eq!(obj.metadata.namespace.as_deref(), Some("ml"));
        let labels = obj.metadata.labels.unwrap();
        assert_eq!(labels.get("tier").map(String::as_str), Some("data"));
        assert_eq!(labels.get(naming::QUEUE_LABEL).map(String::as_str), Some("dev"));
        assert!(obj.data.get("metadata").is_none());
        assert_eq!(obj.data["spec"]["accessModes"][0], "ReadWriteMany");
        assert_eq!(obj.metadata.owner_references.unwrap()[0].kind, "TorchrunQueue");
    }

    #[test]
    fn test_queue_resource_requires_type() {
        let queue = create_test_queue("dev", "ml", "team-a");
        let resource = QueueResourceTemplate {
            name: "config".to_string(),
            name_mode: crds::NameMode::Exact,
            immutable: false,
            template: json!({ "data": { "a": "b" } }),
        };
        assert!(build_queue_resource(&queue, &resource, "config").is_err());
    }

    #[test]
    fn test_update_time_alone_is_not_a_change() {
        let before = TorchrunQueueStatus {
            last_update_time: Some(Utc::now()),
            ..Default::default()
        };
        let mut after = before.clone();
        after.last_update_time = Some(Utc::now() + chrono::Duration::seconds(5));
        assert!(!queue_status_changed(Some(&before), &after));
        after.phase = QueuePhase::Updating;
        assert!(queue_status_changed(Some(&before), &after));
        assert!(queue_status_changed(None, &TorchrunQueueStatus::default()));
    }

    #[test]
    fn test_empty_scheduler_queue_name_is_invalid() {
        let queue = create_test_queue("dev", "ml", " ");
        assert!(matches!(validate_queue(&queue), Err(ControllerError::InvalidConfig(_))));
    }
}
