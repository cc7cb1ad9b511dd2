//! TorchrunQueue CRD
//!
//! Reusable infrastructure policy shared by many jobs: the trainer pod
//! template, distributed-training defaults, the mirrored kai-scheduler queue,
//! storage defaults and queue-scoped resources.

use crate::condition::Condition;
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "torchrun.ai",
    version = "v1alpha1",
    kind = "TorchrunQueue",
    namespaced,
    status = "TorchrunQueueStatus",
    shortname = "tq",
    printcolumn = r#"{"name":"Scheduler Queue","type":"string","jsonPath":".spec.queue.name"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TorchrunQueueSpec {
    /// kai-scheduler queue this TorchrunQueue mirrors
    pub queue: SchedulerQueueSpec,

    #[serde(default)]
    pub distributed: DistributedConfig,

    /// Storage defaults for jobs on this queue
    #[serde(default)]
    pub workspace_storage: QueueWorkspaceStorage,

    /// Worker pod template. The first container must be named `trainer`.
    #[serde(default)]
    pub pod_template: PodTemplate,

    /// Objects created alongside the queue (PVCs, ConfigMaps, ...)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<QueueResourceTemplate>,

    /// Service account for preparation and worker pods
    #[serde(default = "default_service_account_name")]
    pub service_account_name: String,
}

impl Default for TorchrunQueueSpec {
    fn default() -> Self {
        Self {
            queue: SchedulerQueueSpec::default(),
            distributed: DistributedConfig::default(),
            workspace_storage: QueueWorkspaceStorage::default(),
            pod_template: PodTemplate::default(),
            resources: Vec::new(),
            service_account_name: default_service_account_name(),
        }
    }
}

fn default_service_account_name() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerQueueSpec {
    /// Name of the cluster-scoped kai-scheduler queue
    pub name: String,

    #[serde(default = "default_parent_queue")]
    pub parent_queue: String,

    #[serde(default)]
    pub resources: QueueResources,
}

impl Default for SchedulerQueueSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            parent_queue: default_parent_queue(),
            resources: QueueResources::default(),
        }
    }
}

fn default_parent_queue() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueResources {
    #[serde(default)]
    pub cpu: ResourceQuota,
    #[serde(default)]
    pub gpu: ResourceQuota,
    #[serde(default)]
    pub memory: ResourceQuota,
}

/// Quota settings for one resource; `-1` means unlimited.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceQuota {
    #[serde(default = "unlimited")]
    pub quota: i64,
    #[serde(default = "unlimited")]
    pub limit: i64,
    #[serde(default = "default_over_quota_weight")]
    pub over_quota_weight: i64,
}

impl Default for ResourceQuota {
    fn default() -> Self {
        Self {
            quota: unlimited(),
            limit: unlimited(),
            over_quota_weight: default_over_quota_weight(),
        }
    }
}

fn unlimited() -> i64 {
    -1
}

fn default_over_quota_weight() -> i64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DistributedConfig {
    #[serde(default)]
    pub backend: DistributedBackend,

    /// torchrun rendezvous backend (`etcd-v2`, `c10d`, `static`). Empty means `c10d`.
    #[serde(default = "default_rdzv_backend")]
    pub rdzv_backend: String,

    #[serde(default = "default_rdzv_endpoint")]
    pub rdzv_endpoint: String,

    #[serde(default = "default_port")]
    #[schemars(range(min = 1024, max = 65535))]
    pub port: i32,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            backend: DistributedBackend::default(),
            rdzv_backend: default_rdzv_backend(),
            rdzv_endpoint: default_rdzv_endpoint(),
            port: default_port(),
        }
    }
}

fn default_rdzv_backend() -> String {
    "etcd-v2".to_string()
}

fn default_rdzv_endpoint() -> String {
    "etcd.etcd-system.svc.cluster.local:2379".to_string()
}

fn default_port() -> i32 {
    29500
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DistributedBackend {
    #[default]
    Nccl,
    Gloo,
    Mpi,
}

impl DistributedBackend {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DistributedBackend::Nccl => "nccl",
            DistributedBackend::Gloo => "gloo",
            DistributedBackend::Mpi => "mpi",
        }
    }
}

/// Queue-level storage defaults. Job settings take precedence.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueWorkspaceStorage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplate {
    #[serde(default)]
    pub metadata: PodTemplateMetadata,

    /// Pod spec document; validated when a job is launched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "crate::schema::free_form_object")]
    pub spec: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplateMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// An object the queue creates in its namespace.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueResourceTemplate {
    /// Logical name of the resource
    pub name: String,

    #[serde(default)]
    pub name_mode: NameMode,

    /// Create once, never update
    #[serde(default)]
    pub immutable: bool,

    /// Full object manifest (`apiVersion`, `kind`, `metadata`, ...)
    #[schemars(schema_with = "crate::schema::free_form_object")]
    pub template: serde_json::Value,
}

impl QueueResourceTemplate {
    /// Name of the created object for a queue named `queue_name`.
    #[must_use]
    pub fn object_name(&self, queue_name: &str) -> String {
        match self.name_mode {
            NameMode::Exact => self.name.clone(),
            NameMode::Prefix => format!("{}-{}", queue_name, self.name),
        }
    }

    /// `metadata.name` declared inside the template, if any.
    #[must_use]
    pub fn template_name(&self) -> Option<&str> {
        self.template
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(serde_json::Value::as_str)
            .filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NameMode {
    /// Use the logical name verbatim
    #[default]
    Exact,
    /// Prefix the logical name with the queue name
    Prefix,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum QueuePhase {
    #[default]
    Active,
    /// The mirrored scheduler queue is missing
    Updating,
    Terminating,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TorchrunQueueStatus {
    #[serde(default)]
    pub phase: QueuePhase,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub resources_ready: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_statuses: Vec<ResourceStatus>,
}

/// Observed state of one queue resource.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub name: String,
    pub kind: String,
    pub ready: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}
