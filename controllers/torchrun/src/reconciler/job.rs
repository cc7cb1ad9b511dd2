//! TorchrunJob reconciler

use super::{Reconciler, Requeue};
use crate::error::ControllerError;
use crate::job_manager::JobManager;
use crate::naming;
use crate::status::{StatusManager, compute_job_created, find_condition, set_condition};
use crate::workspace::WorkspaceManager;
use chrono::Utc;
use cluster_client::{ClusterClientTrait, ClusterError};
use crds::{Condition, ConditionStatus, JobPhase, TorchrunJob, TorchrunJobStatus, condition_types};
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

fn conditions_mut(job: &mut TorchrunJob) -> &mut Vec<Condition> {
    &mut job.status.get_or_insert_with(TorchrunJobStatus::default).conditions
}

impl Reconciler {
    /// Drives one TorchrunJob towards its workspace and compute job.
    ///
    /// Configuration errors (missing queue, unusable pod template) and a
    /// failed workspace preparation end in phase `Failed` and return
    /// `Requeue::Never`; store errors are returned for backoff.
    pub async fn reconcile_torchrun_job(&self, namespace: &str, name: &str) -> Result<Requeue, ControllerError> {
        let mut job = match self.client.get_torchrun_job(namespace, name).await {
            Ok(job) => job,
            Err(ClusterError::NotFound(_)) => {
                debug!("TorchrunJob {}/{} no longer exists", namespace, name);
                return Ok(Requeue::Never);
            }
            Err(e) => return Err(e.into()),
        };
        debug!("Reconciling TorchrunJob {}/{}", namespace, name);

        let before = job.status.clone();
        let client: &dyn ClusterClientTrait = &*self.client;
        let status = StatusManager::new(client, &self.config);

        if job.metadata.deletion_timestamp.is_some() {
            info!("TorchrunJob {}/{} is being deleted", namespace, name);
            status.recompute(&mut job).await;
            if let Err(e) = status.persist(&mut job, before.as_ref()).await {
                warn!("Failed to record deletion of TorchrunJob {}/{}: {}", namespace, name, e);
            }
            return Ok(Requeue::Never);
        }

        if compute_job_created(before.as_ref()) {
            return self.observe_compute_job(&mut job, before.as_ref()).await;
        }

        let queue = match client.get_torchrun_queue(namespace, &job.spec.queue).await {
            Ok(queue) => queue,
            Err(ClusterError::NotFound(_)) => {
                let err = ControllerError::QueueNotFound(format!("{}/{}", namespace, job.spec.queue));
                let message = format!("TorchrunQueue {} does not exist in namespace {}", job.spec.queue, namespace);
                set_condition(
                    conditions_mut(&mut job),
                    condition_types::QUEUE_NOT_FOUND,
                    ConditionStatus::True,
                    "QueueNotFound",
                    message,
                );
                return self.fail_terminal(&mut job, before.as_ref(), &err).await;
            }
            Err(e) => return Err(e.into()),
        };
        let queue_was_missing = job
            .status
            .as_ref()
            .and_then(|s| find_condition(&s.conditions, condition_types::QUEUE_NOT_FOUND))
            .is_some();
        if queue_was_missing {
            let message = format!("TorchrunQueue {} resolved", job.spec.queue);
            set_condition(
                conditions_mut(&mut job),
                condition_types::QUEUE_NOT_FOUND,
                ConditionStatus::False,
                "QueueFound",
                message,
            );
        }

        let workspace = WorkspaceManager::new(client, &self.config);
        workspace.ensure_volume(&job, &queue).await?;
        let pvc_name = naming::workspace_pvc_name(&job);
        set_condition(
            conditions_mut(&mut job),
            condition_types::PROVISIONED,
            ConditionStatus::True,
            "VolumeProvisioned",
            format!("Workspace volume {} provisioned", pvc_name),
        );

        match workspace.check_ready(&job).await {
            Ok(true) => {}
            Ok(false) => {
                if let Err(e) = workspace.ensure_preparation_pod(&job, &queue).await {
                    error!("Failed to create preparation pod for TorchrunJob {}/{}: {}", namespace, name, e);
                    set_condition(
                        conditions_mut(&mut job),
                        condition_types::WORKSPACE_SYNC,
                        ConditionStatus::False,
                        "CreateSyncPodFailed",
                        e.to_string(),
                    );
                    if let Err(persist_err) = status.persist(&mut job, before.as_ref()).await {
                        warn!("Failed to update TorchrunJob {}/{} status: {}", namespace, name, persist_err);
                    }
                    return Err(e);
                }
                set_condition(
                    conditions_mut(&mut job),
                    condition_types::WORKSPACE_SYNC,
                    ConditionStatus::True,
                    "SyncInProgress",
                    "Workspace preparation in progress",
                );
                let phase = status.recompute(&mut job).await;
                status.persist(&mut job, before.as_ref()).await?;
                debug!("TorchrunJob {}/{} waiting for workspace ({})", namespace, name, phase);
                return Ok(Requeue::After(self.config.sync_requeue));
            }
            Err(ControllerError::WorkspaceSyncFailed(message)) => {
                let conditions = conditions_mut(&mut job);
                set_condition(
                    conditions,
                    condition_types::WORKSPACE_SYNC,
                    ConditionStatus::False,
                    "SyncFailed",
                    message.clone(),
                );
                set_condition(
                    conditions,
                    condition_types::FAILED,
                    ConditionStatus::True,
                    "SyncFailed",
                    message.clone(),
                );
                let err = ControllerError::WorkspaceSyncFailed(message);
                return self.fail_terminal(&mut job, before.as_ref(), &err).await;
            }
            Err(e) => return Err(e),
        }

        let conditions = conditions_mut(&mut job);
        set_condition(
            conditions,
            condition_types::WORKSPACE_READY,
            ConditionStatus::True,
            "WorkspaceReady",
            format!("Workspace volume {} is synced", pvc_name),
        );
        set_condition(
            conditions,
            condition_types::WORKSPACE_SYNC,
            ConditionStatus::False,
            "SyncCompleted",
            "Workspace preparation completed",
        );

        match JobManager::new(client, &self.config).create_compute_job(&job, &queue).await {
            Ok(()) => {}
            Err(e) if e.is_terminal() => {
                let message = e.to_string();
                let conditions = conditions_mut(&mut job);
                set_condition(
                    conditions,
                    condition_types::JOB_CREATED,
                    ConditionStatus::False,
                    "InvalidPodTemplate",
                    message.clone(),
                );
                set_condition(
                    conditions,
                    condition_types::FAILED,
                    ConditionStatus::True,
                    "InvalidPodTemplate",
                    message,
                );
                return self.fail_terminal(&mut job, before.as_ref(), &e).await;
            }
            Err(e) => {
                error!("Failed to create compute job for TorchrunJob {}/{}: {}", namespace, name, e);
                set_condition(
                    conditions_mut(&mut job),
                    condition_types::JOB_CREATED,
                    ConditionStatus::False,
                    "CreateFailed",
                    e.to_string(),
                );
                if let Err(persist_err) = status.persist(&mut job, before.as_ref()).await {
                    warn!("Failed to update TorchrunJob {}/{} status: {}", namespace, name, persist_err);
                }
                return Err(e);
            }
        }

        let compute_job_name = naming::compute_job_name(&job);
        set_condition(
            conditions_mut(&mut job),
            condition_types::JOB_CREATED,
            ConditionStatus::True,
            "JobCreated",
            format!("Compute job {} created", compute_job_name),
        );
        self.observe_compute_job(&mut job, before.as_ref()).await
    }

    /// Tracks a job whose compute job was created. Nothing is created again,
    /// even after the compute job is garbage-collected.
    async fn observe_compute_job(
        &self,
        job: &mut TorchrunJob,
        before: Option<&TorchrunJobStatus>,
    ) -> Result<Requeue, ControllerError> {
        let status = StatusManager::new(&*self.client, &self.config);
        let phase = status.recompute(job).await;
        status.persist(job, before).await?;

        if phase.is_terminal() {
            info!(
                "TorchrunJob {}/{} finished with phase {}",
                job.metadata.namespace.as_deref().unwrap_or_default(),
                job.name_any(),
                phase
            );
            Ok(Requeue::Never)
        } else {
            Ok(Requeue::After(self.config.running_requeue))
        }
    }

    /// Records a terminal failure: phase `Failed`, persisted, no requeue.
    /// The caller sets the conditions describing the failure.
    async fn fail_terminal(
        &self,
        job: &mut TorchrunJob,
        before: Option<&TorchrunJobStatus>,
        err: &ControllerError,
    ) -> Result<Requeue, ControllerError> {
        error!(
            "TorchrunJob {}/{} failed: {}",
            job.metadata.namespace.as_deref().unwrap_or_default(),
            job.metadata.name.as_deref().unwrap_or_default(),
            err
        );
        let num_nodes = job.spec.num_nodes;
        let status = job.status.get_or_insert_with(TorchrunJobStatus::default);
        status.phase = JobPhase::Failed;
        status.num_nodes = num_nodes;
        status.last_reconcile_time = Some(Utc::now());

        if before.map(|s| s.phase) != Some(JobPhase::Failed) {
            self.metrics.record_terminal_failure(err.reason());
        }
        StatusManager::new(&*self.client, &self.config)
            .persist(job, before)
            .await?;
        Ok(Requeue::Never)
    }
}
