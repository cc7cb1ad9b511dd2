//! TorchrunJob CRD
//!
//! A single distributed training run. The controller prepares a shared
//! workspace volume, then launches `numNodes` replicas of the queue's trainer
//! container running `torchrun`.

use crate::condition::Condition;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{EnvVar, Volume};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "torchrun.ai",
    version = "v1alpha1",
    kind = "TorchrunJob",
    namespaced,
    status = "TorchrunJobStatus",
    shortname = "tj",
    shortname = "trj",
    printcolumn = r#"{"name":"Queue","type":"string","jsonPath":".spec.queue"}"#,
    printcolumn = r#"{"name":"Nodes","type":"integer","jsonPath":".spec.numNodes"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Workers","type":"string","jsonPath":".status.workersStatus"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TorchrunJobSpec {
    /// Name of the TorchrunQueue (same namespace) that supplies the pod template
    pub queue: String,

    /// Application-level job name, used as the rendezvous id and to name the
    /// workspace volume. Defaults to the object name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub job_name: String,

    /// Unique id used in labels. Defaults to the object UID.
    #[serde(default, rename = "jobID", skip_serializing_if = "String::is_empty")]
    pub job_id: String,

    /// Training command passed to `torchrun --no-python`
    pub command: String,

    /// Shell command run before torchrun (e.g. `pip install -r requirements.txt`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_command: Option<String>,

    /// Number of nodes (replicas)
    #[serde(default = "default_num_nodes")]
    #[schemars(range(min = 1))]
    pub num_nodes: i32,

    /// Workspace volume and preparation settings
    #[serde(default)]
    pub workspace_storage: WorkspaceStorageSpec,

    #[serde(default)]
    pub reliability: ReliabilityPolicy,

    /// Extra environment variables for the trainer container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "crate::schema::free_form_object_list")]
    pub env: Vec<EnvVar>,

    #[serde(default)]
    pub volumes: VolumeSpec,

    /// Create the compute job suspended
    #[serde(default)]
    pub suspend: bool,

    /// Annotations added to every worker pod (override generated ones)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Labels added to every worker pod (override generated ones)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl Default for TorchrunJobSpec {
    fn default() -> Self {
        Self {
            queue: String::new(),
            job_name: String::new(),
            job_id: String::new(),
            command: String::new(),
            setup_command: None,
            num_nodes: default_num_nodes(),
            workspace_storage: WorkspaceStorageSpec::default(),
            reliability: ReliabilityPolicy::default(),
            env: Vec::new(),
            volumes: VolumeSpec::default(),
            suspend: false,
            annotations: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }
}

fn default_num_nodes() -> i32 {
    1
}

/// Per-job workspace overrides. Unset fields fall back to the queue, then to
/// controller defaults.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceStorageSpec {
    /// Volume size, e.g. `20Gi`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,

    /// Image of the preparation pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Where the workspace is mounted in the trainer container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,

    /// `zip` (default), `git`, `s3`, or anything else for a pre-populated volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Source location. For `git`, a ref may follow `#`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Access mode of the workspace volume, `ReadWriteOnce` when unset.
    /// Every worker mounts the volume during its init step, so jobs with
    /// `numNodes > 1` spread over several nodes need `ReadWriteMany`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_mode: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReliabilityPolicy {
    /// Backoff limit of the compute job
    #[serde(default = "default_max_restarts")]
    #[schemars(range(min = 0))]
    pub max_restarts: i32,

    #[serde(default)]
    pub restart_policy: WorkerRestartPolicy,

    #[serde(default = "default_ttl_seconds_after_finished")]
    pub ttl_seconds_after_finished: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,
}

impl Default for ReliabilityPolicy {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            restart_policy: WorkerRestartPolicy::default(),
            ttl_seconds_after_finished: default_ttl_seconds_after_finished(),
            active_deadline_seconds: None,
        }
    }
}

fn default_max_restarts() -> i32 {
    3
}

#[allow(clippy::unnecessary_wraps, reason = "serde default for an optional field")]
fn default_ttl_seconds_after_finished() -> Option<i32> {
    Some(3600)
}

/// Pod restart policy of the worker pods.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum WorkerRestartPolicy {
    #[default]
    OnFailure,
    Never,
}

impl WorkerRestartPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerRestartPolicy::OnFailure => "OnFailure",
            WorkerRestartPolicy::Never => "Never",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    /// Mounts added to the trainer container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_mounts: Vec<AdditionalMount>,

    /// Volumes added to the worker pod
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "crate::schema::free_form_object_list")]
    pub additional_volumes: Vec<Volume>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalMount {
    pub name: String,
    pub mount_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
    #[serde(default)]
    pub read_only: bool,
}

/// Lifecycle phase of a TorchrunJob.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum JobPhase {
    /// Queue not resolved yet or workspace not provisioned
    #[default]
    Pending,
    /// Workspace preparation pod running
    Syncing,
    /// Workspace ready, waiting for the scheduler to start workers
    Queued,
    Running,
    Suspended,
    Succeeded,
    Failed,
    TimedOut,
    Preempted,
    Deleted,
    /// State could not be determined
    Unknown,
}

impl JobPhase {
    /// Phases after which the job makes no further progress.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, JobPhase::Succeeded | JobPhase::Failed | JobPhase::TimedOut)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            JobPhase::Pending => "Pending",
            JobPhase::Syncing => "Syncing",
            JobPhase::Queued => "Queued",
            JobPhase::Running => "Running",
            JobPhase::Suspended => "Suspended",
            JobPhase::Succeeded => "Succeeded",
            JobPhase::Failed => "Failed",
            JobPhase::TimedOut => "TimedOut",
            JobPhase::Preempted => "Preempted",
            JobPhase::Deleted => "Deleted",
            JobPhase::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker counts mirrored from the compute job.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    #[serde(default)]
    pub pending: i32,
    #[serde(default)]
    pub ready: i32,
    #[serde(default)]
    pub running: i32,
    #[serde(default)]
    pub failed: i32,
    #[serde(default)]
    pub succeeded: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TorchrunJobStatus {
    #[serde(default)]
    pub phase: JobPhase,

    #[serde(default)]
    pub num_nodes: i32,

    /// Human-readable worker summary, e.g. `2/4 running`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workers_status: String,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub workers: WorkerStatus,

    /// Failed worker attempts observed on the compute job
    #[serde(default)]
    pub restarts: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,

    /// Last reconcile that looked at this job. Refreshed with every status
    /// change and at least once per running re-queue interval otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<DateTime<Utc>>,
}
