//! Deterministic names and label keys of controller-managed objects.

use crds::{TorchrunJob, TorchrunQueue};
use kube::ResourceExt;
use std::collections::BTreeMap;

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "torchrun-controller";

pub const APP_LABEL: &str = "app";
pub const APP_VALUE: &str = "torchrun";

pub const JOB_NAME_LABEL: &str = "torchrun.ai/job-name";
pub const JOB_ID_LABEL: &str = "torchrun.ai/job-id";
pub const JOB_QUEUE_LABEL: &str = "torchrun.ai/job-queue";
pub const TYPE_LABEL: &str = "torchrun.ai/type";
pub const ROLE_LABEL: &str = "torchrun.ai/role";
/// Single source of truth for workspace readiness; only ever moves to "true".
pub const SYNC_COMPLETED_LABEL: &str = "torchrun.ai/sync-completed";

pub const QUEUE_MANAGED_BY_LABEL: &str = "torchrun.ai/managed-by";
pub const QUEUE_MANAGED_BY_VALUE: &str = "torchrunqueue-controller";
pub const QUEUE_LABEL: &str = "torchrun.ai/queue";
pub const QUEUE_NAMESPACE_LABEL: &str = "torchrun.ai/queue-namespace";
pub const KAI_QUEUE_LABEL: &str = "kai.scheduler/queue";

pub const QUEUE_FINALIZER: &str = "torchrun.ai/queue-cleanup";

/// Marker written by the preparation pod once the workspace is populated.
pub const SYNC_MARKER_FILE: &str = ".sync_success";
/// Mount path of the workspace volume inside the preparation pod.
pub const SYNC_MOUNT_PATH: &str = "/workspace";
/// Mount path of the workspace volume inside the init step of worker pods.
pub const INIT_MOUNT_PATH: &str = "/workspace-pvc";

pub const TRAINER_CONTAINER: &str = "trainer";
pub const SYNC_CONTAINER: &str = "sync";
pub const INIT_CONTAINER: &str = "workspace-sync";
pub const WORKSPACE_PVC_VOLUME: &str = "workspace-pvc";
pub const WORKSPACE_VOLUME: &str = "workspace";

/// Selector matching every child object this controller creates.
#[must_use]
pub fn managed_selector() -> String {
    format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE)
}

/// Application-level job name; the object name when unset.
#[must_use]
pub fn job_name(job: &TorchrunJob) -> String {
    if job.spec.job_name.is_empty() {
        job.name_any()
    } else {
        job.spec.job_name.clone()
    }
}

/// Job id used in labels; the object UID when unset.
#[must_use]
pub fn job_id(job: &TorchrunJob) -> String {
    if job.spec.job_id.is_empty() {
        job.uid().unwrap_or_else(|| job.name_any())
    } else {
        job.spec.job_id.clone()
    }
}

/// Workspace volume claim. Named from the application-level job name so a
/// resubmitted run with the same `jobName` reuses the prepared workspace.
#[must_use]
pub fn workspace_pvc_name(job: &TorchrunJob) -> String {
    format!("{}-workspace", job_name(job))
}

#[must_use]
pub fn sync_pod_name(job: &TorchrunJob) -> String {
    format!("{}-sync", job.name_any())
}

#[must_use]
pub fn compute_job_name(job: &TorchrunJob) -> String {
    job.name_any()
}

/// Labels shared by all children of a job.
#[must_use]
pub fn job_labels(job: &TorchrunJob) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (JOB_NAME_LABEL.to_string(), job_name(job)),
    ])
}

/// Labels that tie an object to the queue that created it.
#[must_use]
pub fn queue_labels(queue: &TorchrunQueue) -> BTreeMap<String, String> {
    BTreeMap::from([
        (QUEUE_MANAGED_BY_LABEL.to_string(), QUEUE_MANAGED_BY_VALUE.to_string()),
        (QUEUE_LABEL.to_string(), queue.name_any()),
        (QUEUE_NAMESPACE_LABEL.to_string(), queue.namespace().unwrap_or_default()),
    ])
}

/// Selector for scheduler queues mirrored from `namespace/name`.
#[must_use]
pub fn queue_selector(namespace: &str, name: &str) -> String {
    format!(
        "{}={},{}={},{}={}",
        QUEUE_MANAGED_BY_LABEL, QUEUE_MANAGED_BY_VALUE, QUEUE_LABEL, name, QUEUE_NAMESPACE_LABEL, namespace
    )
}

/// Quotes `value` for a POSIX shell.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
