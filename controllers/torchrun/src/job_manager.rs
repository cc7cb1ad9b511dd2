//! Compute job construction.
//!
//! A compute job is an Indexed batch/v1 Job with one completion per node.
//! Each worker pod is the queue's pod template plus an init step that copies
//! the prepared workspace into a pod-local volume, and a trainer command that
//! launches `torchrun`.

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::naming::{
    self, APP_LABEL, APP_VALUE, INIT_CONTAINER, INIT_MOUNT_PATH, JOB_ID_LABEL, JOB_NAME_LABEL, JOB_QUEUE_LABEL,
    KAI_QUEUE_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE, SYNC_MARKER_FILE, WORKSPACE_PVC_VOLUME, WORKSPACE_VOLUME,
    shell_quote,
};
use crate::template;
use crate::workspace::resolve_mount_path;
use cluster_client::{ClusterClientTrait, ClusterError};
use crds::{TorchrunJob, TorchrunQueue};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use tracing::{debug, info};

const GPU_RESOURCE: &str = "nvidia.com/gpu";

/// Creates the compute job of a TorchrunJob.
pub struct JobManager<'a> {
    client: &'a dyn ClusterClientTrait,
    config: &'a ControllerConfig,
}

impl<'a> JobManager<'a> {
    pub fn new(client: &'a dyn ClusterClientTrait, config: &'a ControllerConfig) -> Self {
        Self { client, config }
    }

    /// Creates the compute job unless it already exists. The existing job is
    /// never modified.
    pub async fn create_compute_job(&self, job: &TorchrunJob, queue: &TorchrunQueue) -> Result<(), ControllerError> {
        let namespace = job.namespace().unwrap_or_else(|| "default".to_string());
        let name = naming::compute_job_name(job);

        match self.client.get_batch_job(&namespace, &name).await {
            Ok(_) => {
                debug!("Compute job {}/{} already exists", namespace, name);
                return Ok(());
            }
            Err(ClusterError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let compute_job = build_compute_job(job, queue, self.config)?;
        info!(
            "Creating compute job {}/{} ({} node(s), queue {})",
            namespace, name, job.spec.num_nodes, queue.spec.queue.name
        );
        match self.client.create_batch_job(&namespace, &compute_job).await {
            Ok(_) | Err(ClusterError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Builds the compute job in memory. Fails with `InvalidPodTemplate` when
/// the queue's template cannot host a trainer.
pub(crate) fn build_compute_job(
    job: &TorchrunJob,
    queue: &TorchrunQueue,
    config: &ControllerConfig,
) -> Result<Job, ControllerError> {
    let mut pod_spec = template::resolve_pod_spec(queue)?;
    let mount_path = resolve_mount_path(job, queue, config);

    pod_spec.scheduler_name = Some(config.scheduler_name.clone());
    pod_spec.restart_policy = Some(job.spec.reliability.restart_policy.as_str().to_string());
    if pod_spec.service_account_name.as_deref().is_none_or(str::is_empty) {
        pod_spec.service_account_name = Some(queue.spec.service_account_name.clone());
    }

    attach_workspace(job, config, &mut pod_spec, &mount_path);

    let nproc = pod_spec.containers.first().map(gpu_request).unwrap_or(1);
    let command = torchrun_command(job, queue, nproc);
    let env = controller_env(job, queue);

    let trainer = &mut pod_spec.containers[0];
    trainer.command = Some(vec!["/bin/bash".to_string(), "-c".to_string(), command]);
    trainer.args = None;
    let trainer_env = trainer.env.get_or_insert_with(Vec::new);
    trainer_env.extend(env);
    trainer_env.extend(job.spec.env.iter().cloned());
    trainer
        .volume_mounts
        .get_or_insert_with(Vec::new)
        .extend(job.spec.volumes.additional_mounts.iter().map(|mount| VolumeMount {
            name: mount.name.clone(),
            mount_path: mount.mount_path.clone(),
            sub_path: mount.sub_path.clone(),
            read_only: Some(mount.read_only),
            ..Default::default()
        }));
    pod_spec
        .volumes
        .get_or_insert_with(Vec::new)
        .extend(job.spec.volumes.additional_volumes.iter().cloned());

    let num_nodes = job.spec.num_nodes;
    Ok(Job {
        metadata: ObjectMeta {
            name: Some(naming::compute_job_name(job)),
            namespace: job.namespace(),
            labels: Some(job_object_labels(job)),
            owner_references: job.controller_owner_ref(&()).map(|owner| vec![owner]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            parallelism: Some(num_nodes),
            completions: Some(num_nodes),
            completion_mode: Some("Indexed".to_string()),
            backoff_limit: Some(job.spec.reliability.max_restarts),
            ttl_seconds_after_finished: job.spec.reliability.ttl_seconds_after_finished,
            active_deadline_seconds: job.spec.reliability.active_deadline_seconds,
            suspend: Some(job.spec.suspend),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels(job, queue)),
                    annotations: Some(pod_annotations(job, queue)),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Adds the init step and the two workspace volumes, and mounts the
/// pod-local copy into the trainer.
fn attach_workspace(job: &TorchrunJob, config: &ControllerConfig, pod_spec: &mut PodSpec, mount_path: &str) {
    let marker = format!("{}/{}", INIT_MOUNT_PATH, SYNC_MARKER_FILE);
    let script = format!(
        "while [ ! -f {marker} ]; do echo 'Waiting for workspace sync...'; sleep 5; done; cp -a {src}/. {dst}/",
        marker = marker,
        src = INIT_MOUNT_PATH,
        dst = shell_quote(mount_path)
    );

    pod_spec.init_containers.get_or_insert_with(Vec::new).push(Container {
        name: INIT_CONTAINER.to_string(),
        image: Some(config.init_image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
        args: Some(vec![script]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: WORKSPACE_PVC_VOLUME.to_string(),
                mount_path: INIT_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: WORKSPACE_VOLUME.to_string(),
                mount_path: mount_path.to_string(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    });

    pod_spec.containers[0]
        .volume_mounts
        .get_or_insert_with(Vec::new)
        .push(VolumeMount {
            name: WORKSPACE_VOLUME.to_string(),
            mount_path: mount_path.to_string(),
            ..Default::default()
        });

    let volumes = pod_spec.volumes.get_or_insert_with(Vec::new);
    volumes.push(Volume {
        name: WORKSPACE_PVC_VOLUME.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: naming::workspace_pvc_name(job),
            read_only: None,
        }),
        ..Default::default()
    });
    volumes.push(Volume {
        name: WORKSPACE_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    });
}

/// GPUs requested by a container; 1 when absent or zero.
fn gpu_request(container: &Container) -> i64 {
    container
        .resources
        .as_ref()
        .and_then(|r| r.requests.as_ref())
        .and_then(|requests| requests.get(GPU_RESOURCE))
        .and_then(|quantity| quantity.0.trim().parse::<i64>().ok())
        .filter(|gpus| *gpus > 0)
        .unwrap_or(1)
}

/// Shell command run by the trainer container.
#[must_use]
pub fn torchrun_command(job: &TorchrunJob, queue: &TorchrunQueue, nproc: i64) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(setup) = job.spec.setup_command.as_ref().filter(|s| !s.trim().is_empty()) {
        parts.push(setup.clone());
        parts.push("&&".to_string());
    }
    parts.push("torchrun".to_string());

    let rdzv_id = naming::job_name(job);
    if job.spec.num_nodes > 1 {
        let distributed = &queue.spec.distributed;
        parts.extend([
            "--node_rank $(JOB_COMPLETION_INDEX)".to_string(),
            format!("--nnodes {}", job.spec.num_nodes),
            format!("--nproc-per-node {}", nproc),
            format!("--rdzv-backend {}", distributed.rdzv_backend),
            format!("--rdzv-endpoint {}", distributed.rdzv_endpoint),
        ]);
    } else {
        parts.extend(["--standalone".to_string(), format!("--nproc-per-node {}", nproc)]);
    }
    parts.push(format!("--rdzv-id {}", rdzv_id));
    parts.push("--no-python".to_string());
    parts.push(job.spec.command.clone());
    parts.join(" ")
}

fn controller_env(job: &TorchrunJob, queue: &TorchrunQueue) -> Vec<EnvVar> {
    let var = |name: &str, value: String| EnvVar {
        name: name.to_string(),
        value: Some(value),
        ..Default::default()
    };
    vec![
        var("TORCHRUN_JOB_NAME", naming::job_name(job)),
        var("TORCHRUN_JOB_ID", naming::job_id(job)),
        var("TORCHRUN_NUM_NODES", job.spec.num_nodes.to_string()),
        var("TORCHRUN_DIST_BACKEND", queue.spec.distributed.backend.as_str().to_string()),
        var("MASTER_PORT", queue.spec.distributed.port.to_string()),
    ]
}

fn identity_labels(job: &TorchrunJob) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.to_string(), APP_VALUE.to_string()),
        (JOB_ID_LABEL.to_string(), naming::job_id(job)),
        (JOB_NAME_LABEL.to_string(), naming::job_name(job)),
        (JOB_QUEUE_LABEL.to_string(), job.spec.queue.clone()),
    ])
}

fn job_object_labels(job: &TorchrunJob) -> BTreeMap<String, String> {
    let mut labels = identity_labels(job);
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
    labels
}

/// Controller labels, then queue template labels, then job labels; later wins.
fn pod_labels(job: &TorchrunJob, queue: &TorchrunQueue) -> BTreeMap<String, String> {
    let mut labels = identity_labels(job);
    labels.insert(KAI_QUEUE_LABEL.to_string(), queue.spec.queue.name.clone());
    labels.extend(queue.spec.pod_template.metadata.labels.clone());
    labels.extend(job.spec.labels.clone());
    labels
}

fn pod_annotations(job: &TorchrunJob, queue: &TorchrunQueue) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::from([
        (JOB_ID_LABEL.to_string(), naming::job_id(job)),
        (JOB_NAME_LABEL.to_string(), naming::job_name(job)),
        (JOB_QUEUE_LABEL.to_string(), job.spec.queue.clone()),
    ]);
    annotations.extend(queue.spec.pod_template.metadata.annotations.clone());
    annotations.extend(job.spec.annotations.clone());
    annotations
}
