//! Workspace volume and preparation pod lifecycle.
//!
//! Every job gets a ReadWriteOnce volume that a one-shot preparation pod
//! populates (upload, download, clone, ...). When the pod succeeds the
//! reconciler flips the volume's `torchrun.ai/sync-completed` label to
//! `true`; worker pods only start copying once the marker file exists.

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::naming::{
    self, ROLE_LABEL, SYNC_COMPLETED_LABEL, SYNC_CONTAINER, SYNC_MARKER_FILE, SYNC_MOUNT_PATH, TYPE_LABEL,
    WORKSPACE_VOLUME, shell_quote,
};
use cluster_client::{ClusterClientTrait, ClusterError};
use crds::{TorchrunJob, TorchrunQueue, WorkspaceStorageSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, Pod,
    PodSpec, ResourceRequirements, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Env var prefixes forwarded from the job to the preparation pod (cloud credentials).
const FORWARDED_ENV_PREFIXES: [&str; 3] = ["AWS_", "GOOGLE_", "AZURE_"];
const UPLOAD_POLL_SECONDS: u64 = 5;
const DEFAULT_ACCESS_MODE: &str = "ReadWriteOnce";

/// Observed state of a job's workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceState {
    /// Volume does not exist yet
    NotProvisioned,
    /// Volume exists; preparation pod absent or not started
    Preparing,
    /// Preparation pod running
    Syncing,
    /// Volume labelled sync-completed
    Ready,
    /// Preparation pod failed with the given message
    Failed(String),
}

/// How the preparation pod fills the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceSource {
    /// Wait for `workspace.zip` to be copied into the volume
    Upload,
    /// Download and extract a zip archive
    Archive { url: String },
    Git { url: String, git_ref: String },
    /// `aws s3 cp` a tar.gz archive
    S3 { url: String },
    /// Volume is already populated
    Existing,
}

impl WorkspaceSource {
    #[must_use]
    pub fn from_spec(spec: &WorkspaceStorageSpec) -> Self {
        let url = spec.url.clone().filter(|u| !u.is_empty());
        match spec.source.as_deref().unwrap_or("zip") {
            "" | "zip" => match url {
                Some(url) => WorkspaceSource::Archive { url },
                None => WorkspaceSource::Upload,
            },
            "git" => {
                let raw = url.unwrap_or_default();
                let (url, git_ref) = match raw.rsplit_once('#') {
                    Some((url, git_ref)) if !git_ref.is_empty() => (url.to_string(), git_ref.to_string()),
                    _ => (raw.trim_end_matches('#').to_string(), "main".to_string()),
                };
                WorkspaceSource::Git { url, git_ref }
            }
            "s3" => WorkspaceSource::S3 {
                url: url.unwrap_or_default(),
            },
            _ => WorkspaceSource::Existing,
        }
    }

    /// POSIX shell script run by the preparation pod. Every path ends by
    /// touching the marker file; any failure exits non-zero.
    #[must_use]
    pub fn script(&self, upload_timeout: Duration) -> String {
        let marker = format!("{}/{}", SYNC_MOUNT_PATH, SYNC_MARKER_FILE);
        let body = match self {
            WorkspaceSource::Upload => {
                let timeout = upload_timeout.as_secs();
                format!(
                    r#"echo "Waiting for workspace.zip to be uploaded (timeout {timeout}s)..."
elapsed=0
while [ ! -f /workspace/workspace.zip ]; do
  if [ "$elapsed" -ge {timeout} ]; then
    echo "ERROR: timed out after {timeout}s waiting for workspace.zip" >&2
    exit 1
  fi
  sleep {poll}
  elapsed=$((elapsed + {poll}))
done
echo "Validating workspace.zip..."
if ! unzip -t /workspace/workspace.zip > /dev/null 2>&1; then
  echo "ERROR: workspace.zip is corrupted or invalid" >&2
  exit 1
fi
echo "Extracting workspace.zip..."
unzip -q -o /workspace/workspace.zip -d /workspace/
rm -f /workspace/workspace.zip"#,
                    poll = UPLOAD_POLL_SECONDS
                )
            }
            WorkspaceSource::Archive { url } => format!(
                r#"echo "Downloading workspace archive..."
wget -q -O /workspace/workspace.zip {url}
if ! unzip -t /workspace/workspace.zip > /dev/null 2>&1; then
  echo "ERROR: downloaded archive is corrupted or invalid" >&2
  exit 1
fi
unzip -q -o /workspace/workspace.zip -d /workspace/
rm -f /workspace/workspace.zip"#,
                url = shell_quote(url)
            ),
            WorkspaceSource::Git { url, git_ref } => format!(
                r#"echo "Cloning repository..."
clone_dir="$(mktemp -d)"
git clone --branch {git_ref} --depth 1 {url} "$clone_dir"
cp -a "$clone_dir"/. /workspace/
rm -rf "$clone_dir""#,
                git_ref = shell_quote(git_ref),
                url = shell_quote(url)
            ),
            WorkspaceSource::S3 { url } => format!(
                r#"echo "Downloading workspace from S3..."
aws s3 cp {url} /workspace/workspace.tar.gz
tar -xzf /workspace/workspace.tar.gz -C /workspace/
rm -f /workspace/workspace.tar.gz"#,
                url = shell_quote(url)
            ),
            WorkspaceSource::Existing => r#"echo "Using existing workspace""#.to_string(),
        };
        format!("set -e\n{body}\ntouch {marker}\necho \"Workspace sync completed\"\n")
    }
}

/// Manages the workspace volume and preparation pod of a job.
pub struct WorkspaceManager<'a> {
    client: &'a dyn ClusterClientTrait,
    config: &'a ControllerConfig,
}

impl<'a> WorkspaceManager<'a> {
    pub fn new(client: &'a dyn ClusterClientTrait, config: &'a ControllerConfig) -> Self {
        Self { client, config }
    }

    /// Creates the workspace volume if it does not exist. An existing volume
    /// is never modified.
    pub async fn ensure_volume(&self, job: &TorchrunJob, queue: &TorchrunQueue) -> Result<(), ControllerError> {
        let namespace = job.namespace().unwrap_or_else(|| "default".to_string());
        let pvc_name = naming::workspace_pvc_name(job);

        match self.client.get_pvc(&namespace, &pvc_name).await {
            Ok(_) => return Ok(()),
            Err(ClusterError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let storage_class = self.resolve_storage_class(job, queue).await?;
        let size = resolve_size(job, queue, self.config);
        let pvc = build_volume(job, &pvc_name, &size, &storage_class);

        info!(
            "Creating workspace volume {}/{} ({} on {})",
            namespace, pvc_name, size, storage_class
        );
        match self.client.create_pvc(&namespace, &pvc).await {
            Ok(_) | Err(ClusterError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Creates the preparation pod unless the workspace is already ready or
    /// the pod already exists.
    pub async fn ensure_preparation_pod(&self, job: &TorchrunJob, queue: &TorchrunQueue) -> Result<(), ControllerError> {
        let namespace = job.namespace().unwrap_or_else(|| "default".to_string());
        let pvc = self.client.get_pvc(&namespace, &naming::workspace_pvc_name(job)).await?;
        if is_sync_completed(&pvc) {
            debug!("Workspace for {}/{} already synced, no preparation pod needed", namespace, job.name_any());
            return Ok(());
        }

        let pod_name = naming::sync_pod_name(job);
        match self.client.get_pod(&namespace, &pod_name).await {
            Ok(_) => return Ok(()),
            Err(ClusterError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let pod = build_preparation_pod(job, queue, self.config);
        info!("Creating workspace preparation pod {}/{}", namespace, pod_name);
        match self.client.create_pod(&namespace, &pod).await {
            Ok(_) | Err(ClusterError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// `true` once the workspace is ready. A failed preparation pod is a
    /// terminal `WorkspaceSyncFailed` error.
    pub async fn check_ready(&self, job: &TorchrunJob) -> Result<bool, ControllerError> {
        match self.observe(job).await? {
            WorkspaceState::Ready => Ok(true),
            WorkspaceState::Failed(message) => Err(ControllerError::WorkspaceSyncFailed(message)),
            WorkspaceState::NotProvisioned | WorkspaceState::Preparing | WorkspaceState::Syncing => Ok(false),
        }
    }

    /// Reads the workspace state. Observing a succeeded preparation pod marks
    /// the volume ready.
    pub async fn observe(&self, job: &TorchrunJob) -> Result<WorkspaceState, ControllerError> {
        let namespace = job.namespace().unwrap_or_else(|| "default".to_string());
        let pvc = match self.client.get_pvc(&namespace, &naming::workspace_pvc_name(job)).await {
            Ok(pvc) => pvc,
            Err(ClusterError::NotFound(_)) => return Ok(WorkspaceState::NotProvisioned),
            Err(e) => return Err(e.into()),
        };
        if is_sync_completed(&pvc) {
            return Ok(WorkspaceState::Ready);
        }

        let pod = match self.client.get_pod(&namespace, &naming::sync_pod_name(job)).await {
            Ok(pod) => pod,
            Err(ClusterError::NotFound(_)) => return Ok(WorkspaceState::Preparing),
            Err(e) => return Err(e.into()),
        };

        match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
            Some("Succeeded") => {
                self.mark_sync_completed(&pvc).await?;
                Ok(WorkspaceState::Ready)
            }
            Some("Failed") => {
                let message = pod_failure_message(&pod);
                warn!("Workspace preparation for {}/{} failed: {}", namespace, job.name_any(), message);
                Ok(WorkspaceState::Failed(message))
            }
            Some("Running" | "Unknown") => Ok(WorkspaceState::Syncing),
            _ => Ok(WorkspaceState::Preparing),
        }
    }

    async fn mark_sync_completed(&self, pvc: &PersistentVolumeClaim) -> Result<(), ControllerError> {
        let labels = BTreeMap::from([(SYNC_COMPLETED_LABEL.to_string(), "true".to_string())]);
        self.client.patch_pvc_labels(pvc, &labels).await?;
        info!(
            "Workspace volume {}/{} marked sync-completed",
            pvc.namespace().unwrap_or_default(),
            pvc.name_any()
        );
        Ok(())
    }

    /// job → queue → controller default → cluster default StorageClass.
    async fn resolve_storage_class(&self, job: &TorchrunJob, queue: &TorchrunQueue) -> Result<String, ControllerError> {
        let configured = non_empty(job.spec.workspace_storage.storage_class.as_ref())
            .or_else(|| non_empty(queue.spec.workspace_storage.storage_class.as_ref()))
            .or_else(|| non_empty(self.config.default_storage_class.as_ref()));
        if let Some(class) = configured {
            return Ok(class);
        }
        self.client.default_storage_class().await?.ok_or_else(|| {
            ControllerError::NoStorageClass(format!(
                "job {} sets no storageClass and the cluster has no default StorageClass",
                job.name_any()
            ))
        })
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.is_empty()).cloned()
}

fn resolve_size(job: &TorchrunJob, queue: &TorchrunQueue, config: &ControllerConfig) -> String {
    non_empty(job.spec.workspace_storage.size.as_ref())
        .or_else(|| non_empty(queue.spec.workspace_storage.size.as_ref()))
        .unwrap_or_else(|| config.default_workspace_size.clone())
}

/// Workspace mount path in the trainer container: job → queue → controller default.
#[must_use]
pub fn resolve_mount_path(job: &TorchrunJob, queue: &TorchrunQueue, config: &ControllerConfig) -> String {
    non_empty(job.spec.workspace_storage.mount_path.as_ref())
        .or_else(|| non_empty(queue.spec.workspace_storage.mount_path.as_ref()))
        .unwrap_or_else(|| config.default_mount_path.clone())
}

fn is_sync_completed(pvc: &PersistentVolumeClaim) -> bool {
    pvc.labels().get(SYNC_COMPLETED_LABEL).is_some_and(|v| v == "true")
}

fn owner_references(job: &TorchrunJob) -> Option<Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference>> {
    job.controller_owner_ref(&()).map(|owner| vec![owner])
}

pub(crate) fn build_volume(job: &TorchrunJob, name: &str, size: &str, storage_class: &str) -> PersistentVolumeClaim {
    let mut labels = naming::job_labels(job);
    labels.insert(TYPE_LABEL.to_string(), "workspace".to_string());
    labels.insert(SYNC_COMPLETED_LABEL.to_string(), "false".to_string());

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: job.namespace(),
            labels: Some(labels),
            owner_references: owner_references(job),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![
                non_empty(job.spec.workspace_storage.access_mode.as_ref())
                    .unwrap_or_else(|| DEFAULT_ACCESS_MODE.to_string()),
            ]),
            storage_class_name: Some(storage_class.to_string()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), Quantity(size.to_string()))])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn build_preparation_pod(job: &TorchrunJob, queue: &TorchrunQueue, config: &ControllerConfig) -> Pod {
    let storage = &job.spec.workspace_storage;
    let image = non_empty(storage.image.as_ref())
        .or_else(|| non_empty(queue.spec.workspace_storage.image.as_ref()))
        .unwrap_or_else(|| config.sync_image.clone());
    let pull_policy = non_empty(storage.image_pull_policy.as_ref())
        .or_else(|| non_empty(queue.spec.workspace_storage.image_pull_policy.as_ref()))
        .unwrap_or_else(|| "IfNotPresent".to_string());
    let script = WorkspaceSource::from_spec(storage).script(config.upload_timeout);

    let mut env = vec![EnvVar {
        name: "TORCHRUN_JOB_NAME".to_string(),
        value: Some(naming::job_name(job)),
        ..Default::default()
    }];
    env.extend(
        job.spec
            .env
            .iter()
            .filter(|var| FORWARDED_ENV_PREFIXES.iter().any(|prefix| var.name.starts_with(prefix)))
            .cloned(),
    );

    let mut labels = naming::job_labels(job);
    labels.insert(ROLE_LABEL.to_string(), "sync".to_string());

    let quantities = |cpu: &str, memory: &str| {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ])
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(naming::sync_pod_name(job)),
            namespace: job.namespace(),
            labels: Some(labels),
            owner_references: owner_references(job),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            service_account_name: Some(queue.spec.service_account_name.clone()),
            containers: vec![Container {
                name: SYNC_CONTAINER.to_string(),
                image: Some(image),
                image_pull_policy: Some(pull_policy),
                command: Some(vec!["/bin/sh".to_string(), "-c".to_string(), script]),
                working_dir: Some(SYNC_MOUNT_PATH.to_string()),
                env: Some(env),
                volume_mounts: Some(vec![VolumeMount {
                    name: WORKSPACE_VOLUME.to_string(),
                    mount_path: SYNC_MOUNT_PATH.to_string(),
                    ..Default::default()
                }]),
                resources: Some(ResourceRequirements {
                    requests: Some(quantities("1", "2Gi")),
                    limits: Some(quantities("2", "4Gi")),
                    ..Default::default()
                }),
                termination_message_policy: Some("FallbackToLogsOnError".to_string()),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: WORKSPACE_VOLUME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: naming::workspace_pvc_name(job),
                    read_only: None,
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn pod_failure_message(pod: &Pod) -> String {
    let Some(status) = pod.status.as_ref() else {
        return "workspace preparation pod failed".to_string();
    };
    if let Some(message) = status.message.as_ref().filter(|m| !m.is_empty()) {
        return message.clone();
    }
    status
        .container_statuses
        .iter()
        .flatten()
        .filter_map(|cs| cs.state.as_ref().and_then(|s| s.terminated.as_ref()))
        .find_map(|terminated| {
            terminated
                .message
                .clone()
                .filter(|m| !m.trim().is_empty())
                .map(|m| m.trim().to_string())
                .or_else(|| {
                    terminated
                        .reason
                        .as_ref()
                        .map(|reason| format!("{} (exit code {})", reason, terminated.exit_code))
                })
        })
        .unwrap_or_else(|| "workspace preparation pod failed".to_string())
}
