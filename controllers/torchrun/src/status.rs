//! TorchrunJob status derivation.
//!
//! The phase is recomputed from what is observed in the cluster on every
//! reconcile. The stored phase is only consulted once the compute job has
//! been created and has since disappeared (TTL cleanup), so a finished run
//! keeps its outcome. [`derive_phase`] and
//! [`apply_observation`] are pure; [`StatusManager`] gathers the observation
//! and persists the result.

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::naming;
use crate::workspace::{WorkspaceManager, WorkspaceState};
use chrono::{DateTime, Utc};
use cluster_client::{ClusterClientTrait, ClusterError};
use crds::{Condition, ConditionStatus, JobPhase, TorchrunJob, TorchrunJobStatus, WorkerStatus, condition_types};
use k8s_openapi::api::batch::v1::Job;
use kube::ResourceExt;
use std::time::Duration;
use tracing::{debug, warn};

/// Upserts a condition by type. An entry whose status is unchanged is left
/// as is (reason, message and transition time included).
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
) {
    let now = Utc::now();
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) if existing.status == status => {}
        Some(existing) => {
            existing.status = status;
            existing.reason = reason.to_string();
            existing.message = message.into();
            existing.last_transition_time = Some(now);
        }
        None => conditions.push(Condition {
            type_: type_.to_string(),
            status,
            last_transition_time: Some(now),
            reason: reason.to_string(),
            message: message.into(),
        }),
    }
}

#[must_use]
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Counters read from the compute job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComputeJobObservation {
    pub suspended: bool,
    pub deadline_exceeded: bool,
    pub active: i32,
    pub ready: i32,
    pub succeeded: i32,
    pub failed: i32,
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
}

impl ComputeJobObservation {
    #[must_use]
    pub fn from_job(job: &Job) -> Self {
        let status = job.status.clone().unwrap_or_default();
        let deadline_exceeded = status.conditions.iter().flatten().any(|c| {
            c.type_ == "Failed" && c.status == "True" && c.reason.as_deref() == Some("DeadlineExceeded")
        });
        Self {
            suspended: job.spec.as_ref().and_then(|s| s.suspend).unwrap_or(false),
            deadline_exceeded,
            active: status.active.unwrap_or(0),
            ready: status.ready.unwrap_or(0),
            succeeded: status.succeeded.unwrap_or(0),
            failed: status.failed.unwrap_or(0),
            start_time: status.start_time.map(|t| t.0),
            completion_time: status.completion_time.map(|t| t.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeJobState {
    /// Not created yet
    Absent,
    Present(ComputeJobObservation),
    /// Created earlier and since removed from the cluster
    Removed { last_phase: JobPhase },
    /// Read failed with something other than NotFound
    Unreadable,
}

/// Everything the phase depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub deleting: bool,
    /// `None` when the workspace could not be read
    pub workspace: Option<WorkspaceState>,
    pub compute: ComputeJobState,
}

fn workspace_phase(workspace: Option<&WorkspaceState>) -> JobPhase {
    match workspace {
        Some(WorkspaceState::Ready) => JobPhase::Queued,
        Some(WorkspaceState::Syncing) => JobPhase::Syncing,
        Some(WorkspaceState::Failed(_)) => JobPhase::Failed,
        Some(WorkspaceState::NotProvisioned | WorkspaceState::Preparing) | None => JobPhase::Pending,
    }
}

#[must_use]
pub fn derive_phase(observation: &Observation) -> JobPhase {
    if observation.deleting {
        return JobPhase::Deleted;
    }
    match &observation.compute {
        ComputeJobState::Unreadable => JobPhase::Unknown,
        ComputeJobState::Absent => workspace_phase(observation.workspace.as_ref()),
        ComputeJobState::Removed { last_phase } if last_phase.is_terminal() => *last_phase,
        ComputeJobState::Removed { .. } => JobPhase::Unknown,
        ComputeJobState::Present(compute) => {
            if compute.suspended {
                JobPhase::Suspended
            } else if compute.deadline_exceeded {
                JobPhase::TimedOut
            } else if compute.active > 0 {
                JobPhase::Running
            } else if compute.succeeded > 0 {
                JobPhase::Succeeded
            } else if compute.failed > 0 {
                JobPhase::Failed
            } else {
                workspace_phase(observation.workspace.as_ref())
            }
        }
    }
}

/// Writes the derived fields of `status` and returns the new phase.
pub fn apply_observation(
    status: &mut TorchrunJobStatus,
    observation: &Observation,
    num_nodes: i32,
    now: DateTime<Utc>,
) -> JobPhase {
    let phase = derive_phase(observation);
    status.phase = phase;
    status.num_nodes = num_nodes;

    match &observation.compute {
        ComputeJobState::Present(compute) => {
            status.workers = WorkerStatus {
                pending: (num_nodes - compute.active - compute.succeeded).max(0),
                ready: compute.ready,
                running: compute.active,
                failed: compute.failed,
                succeeded: compute.succeeded,
            };
            status.restarts = compute.failed;
            let started = compute.active > 0 || compute.succeeded > 0 || compute.failed > 0;
            if status.start_time.is_none() && started {
                status.start_time = Some(compute.start_time.unwrap_or(now));
            }
            if phase == JobPhase::Succeeded && status.completion_time.is_none() {
                status.completion_time = Some(compute.completion_time.unwrap_or(now));
            }
        }
        ComputeJobState::Absent => {
            status.workers = WorkerStatus {
                pending: num_nodes,
                ..Default::default()
            };
        }
        ComputeJobState::Removed { .. } | ComputeJobState::Unreadable => {}
    }
    status.workers_status = workers_summary(&status.workers, num_nodes);

    match phase {
        JobPhase::Running => {
            let ready = status.workers.ready;
            if ready >= num_nodes {
                set_condition(
                    &mut status.conditions,
                    condition_types::ALL_WORKERS_READY,
                    ConditionStatus::True,
                    "AllWorkersReady",
                    format!("{}/{} workers ready", ready, num_nodes),
                );
            } else {
                set_condition(
                    &mut status.conditions,
                    condition_types::ALL_WORKERS_READY,
                    ConditionStatus::False,
                    "WaitingForWorkers",
                    format!("{}/{} workers ready", ready, num_nodes),
                );
            }
        }
        JobPhase::Succeeded => set_condition(
            &mut status.conditions,
            condition_types::COMPLETED,
            ConditionStatus::True,
            "JobSucceeded",
            "All workers completed successfully",
        ),
        JobPhase::TimedOut => set_condition(
            &mut status.conditions,
            condition_types::FAILED,
            ConditionStatus::True,
            "DeadlineExceeded",
            "Job exceeded its active deadline",
        ),
        JobPhase::Failed => {
            if let ComputeJobState::Present(compute) = &observation.compute {
                set_condition(
                    &mut status.conditions,
                    condition_types::FAILED,
                    ConditionStatus::True,
                    "WorkersFailed",
                    format!("{} worker pod(s) failed", compute.failed),
                );
            }
        }
        _ => {}
    }

    status.last_reconcile_time = Some(now);
    phase
}

fn workers_summary(workers: &WorkerStatus, num_nodes: i32) -> String {
    if workers.running > 0 {
        format!("{}/{} running", workers.running, num_nodes)
    } else if workers.succeeded > 0 {
        format!("{}/{} succeeded", workers.succeeded, num_nodes)
    } else if workers.failed > 0 {
        format!("{}/{} failed", workers.failed, num_nodes)
    } else {
        format!("{}/{} ready", workers.ready, num_nodes)
    }
}

/// `true` once a compute job has been created for the job. Creation happens
/// at most once per TorchrunJob.
#[must_use]
pub fn compute_job_created(status: Option<&TorchrunJobStatus>) -> bool {
    status.is_some_and(|s| {
        s.completion_time.is_some()
            || find_condition(&s.conditions, condition_types::JOB_CREATED)
                .is_some_and(|c| c.status == ConditionStatus::True)
    })
}

/// `true` when the two statuses differ in anything but `lastReconcileTime`,
/// or when the stored reconcile timestamp is at least `refresh` old.
fn needs_write(before: Option<&TorchrunJobStatus>, after: Option<&TorchrunJobStatus>, refresh: Duration) -> bool {
    let strip = |status: Option<&TorchrunJobStatus>| {
        status.cloned().map(|mut s| {
            s.last_reconcile_time = None;
            s
        })
    };
    if strip(before) != strip(after) {
        return true;
    }
    match (
        before.and_then(|s| s.last_reconcile_time),
        after.and_then(|s| s.last_reconcile_time),
    ) {
        (Some(stored), Some(now)) => (now - stored).to_std().is_ok_and(|elapsed| elapsed >= refresh),
        (None, Some(_)) => true,
        _ => false,
    }
}

/// Recomputes and persists TorchrunJob status.
pub struct StatusManager<'a> {
    client: &'a dyn ClusterClientTrait,
    config: &'a ControllerConfig,
}

impl<'a> StatusManager<'a> {
    pub fn new(client: &'a dyn ClusterClientTrait, config: &'a ControllerConfig) -> Self {
        Self { client, config }
    }

    /// Reads the workspace and compute job of `job`.
    pub async fn observe(&self, job: &TorchrunJob) -> Observation {
        let namespace = job.namespace().unwrap_or_else(|| "default".to_string());
        let workspace = match WorkspaceManager::new(self.client, self.config).observe(job).await {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("Failed to read workspace of {}/{}: {}", namespace, job.name_any(), e);
                None
            }
        };
        let compute = match self.client.get_batch_job(&namespace, &naming::compute_job_name(job)).await {
            Ok(compute) => ComputeJobState::Present(ComputeJobObservation::from_job(&compute)),
            Err(ClusterError::NotFound(_)) if compute_job_created(job.status.as_ref()) => ComputeJobState::Removed {
                last_phase: job.status.as_ref().map(|s| s.phase).unwrap_or_default(),
            },
            Err(ClusterError::NotFound(_)) => ComputeJobState::Absent,
            Err(e) => {
                warn!("Failed to read compute job of {}/{}: {}", namespace, job.name_any(), e);
                ComputeJobState::Unreadable
            }
        };
        Observation {
            deleting: job.metadata.deletion_timestamp.is_some(),
            workspace,
            compute,
        }
    }

    /// Recomputes the derived status of `job` in memory.
    pub async fn recompute(&self, job: &mut TorchrunJob) -> JobPhase {
        let observation = self.observe(job).await;
        let num_nodes = job.spec.num_nodes;
        let status = job.status.get_or_insert_with(TorchrunJobStatus::default);
        let phase = apply_observation(status, &observation, num_nodes, Utc::now());
        debug!("Derived phase {} for {}/{}", phase, job.namespace().unwrap_or_default(), job.name_any());
        phase
    }

    /// Writes `job.status` if it differs from `before` in anything but the
    /// reconcile timestamp, or if the stored timestamp is older than the
    /// running re-queue interval. The job's resource version is the
    /// precondition; on success it is advanced to the stored one.
    pub async fn persist(&self, job: &mut TorchrunJob, before: Option<&TorchrunJobStatus>) -> Result<(), ControllerError> {
        if !needs_write(before, job.status.as_ref(), self.config.running_requeue) {
            return Ok(());
        }
        let stored = self.client.patch_torchrun_job_status(job).await?;
        job.metadata.resource_version = stored.metadata.resource_version;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::JobStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn observation(workspace: WorkspaceState, compute: ComputeJobState) -> Observation {
        Observation {
            deleting: false,
            workspace: Some(workspace),
            compute,
        }
    }

    fn running(active: i32, ready: i32) -> ComputeJobState {
        ComputeJobState::Present(ComputeJobObservation {
            active,
            ready,
            ..Default::default()
        })
    }

    #[test]
    fn test_set_condition_unchanged_status_is_noop() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "Provisioned", ConditionStatus::True, "Created", "first");
        let before = conditions.clone();
        set_condition(&mut conditions, "Provisioned", ConditionStatus::True, "Other", "second");
        assert_eq!(conditions, before);
    }

    #[test]
    fn test_set_condition_replaces_changed_status_in_place() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "WorkspaceSync", ConditionStatus::True, "SyncInProgress", "");
        set_condition(&mut conditions, "JobCreated", ConditionStatus::True, "JobCreated", "");
        set_condition(&mut conditions, "WorkspaceSync", ConditionStatus::False, "SyncCompleted", "done");

        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0].type_, "WorkspaceSync");
        assert_eq!(conditions[0].status, ConditionStatus::False);
        assert_eq!(conditions[0].reason, "SyncCompleted");
        assert_eq!(conditions[1].type_, "JobCreated");
    }

    #[test]
    fn test_phase_without_compute_job_follows_workspace() {
        let cases = [
            (WorkspaceState::NotProvisioned, JobPhase::Pending),
            (WorkspaceState::Preparing, JobPhase::Pending),
            (WorkspaceState::Syncing, JobPhase::Syncing),
            (WorkspaceState::Ready, JobPhase::Queued),
            (WorkspaceState::Failed("boom".to_string()), JobPhase::Failed),
        ];
        for (workspace, expected) in cases {
            assert_eq!(derive_phase(&observation(workspace, ComputeJobState::Absent)), expected);
        }
        let unreadable = Observation {
            deleting: false,
            workspace: None,
            compute: ComputeJobState::Absent,
        };
        assert_eq!(derive_phase(&unreadable), JobPhase::Pending);
    }

    #[test]
    fn test_phase_from_compute_job_counters() {
        let ready = WorkspaceState::Ready;
        assert_eq!(derive_phase(&observation(ready.clone(), running(2, 0))), JobPhase::Running);

        let present = |obs: ComputeJobObservation| observation(ready.clone(), ComputeJobState::Present(obs));
        assert_eq!(
            derive_phase(&present(ComputeJobObservation {
                succeeded: 2,
                ..Default::default()
            })),
            JobPhase::Succeeded
        );
        assert_eq!(
            derive_phase(&present(ComputeJobObservation {
                failed: 1,
                ..Default::default()
            })),
            JobPhase::Failed
        );
        assert_eq!(
            derive_phase(&present(ComputeJobObservation {
                suspended: true,
                active: 2,
                ..Default::default()
            })),
            JobPhase::Suspended
        );
        assert_eq!(
            derive_phase(&present(ComputeJobObservation {
                deadline_exceeded: true,
                failed: 2,
                ..Default::default()
            })),
            JobPhase::TimedOut
        );
        assert_eq!(derive_phase(&present(ComputeJobObservation::default())), JobPhase::Queued);
        assert_eq!(
            derive_phase(&observation(ready.clone(), ComputeJobState::Unreadable)),
            JobPhase::Unknown
        );
    }

    #[test]
    fn test_deletion_wins() {
        let mut obs = observation(WorkspaceState::Ready, running(1, 1));
        obs.deleting = true;
        assert_eq!(derive_phase(&obs), JobPhase::Deleted);
    }

    #[test]
    fn test_completion_time_written_once() {
        let mut status = TorchrunJobStatus::default();
        let done = observation(
            WorkspaceState::Ready,
            ComputeJobState::Present(ComputeJobObservation {
                succeeded: 2,
                ..Default::default()
            }),
        );
        let first = Utc::now();
        let later = first + chrono::Duration::seconds(30);

        assert_eq!(apply_observation(&mut status, &done, 2, first), JobPhase::Succeeded);
        assert_eq!(status.completion_time, Some(first));
        apply_observation(&mut status, &done, 2, later);
        assert_eq!(status.completion_time, Some(first));
        assert_eq!(status.last_reconcile_time, Some(later));
        assert_eq!(status.workers_status, "2/2 succeeded");
        assert_eq!(
            find_condition(&status.conditions, condition_types::COMPLETED).map(|c| c.status),
            Some(ConditionStatus::True)
        );
    }

    #[test]
    fn test_workers_and_readiness_condition() {
        let mut status = TorchrunJobStatus::default();
        let now = Utc::now();

        apply_observation(&mut status, &observation(WorkspaceState::Ready, running(2, 1)), 2, now);
        assert_eq!(status.workers.running, 2);
        assert_eq!(status.workers_status, "2/2 running");
        assert_eq!(status.start_time, Some(now));
        assert_eq!(
            find_condition(&status.conditions, condition_types::ALL_WORKERS_READY).map(|c| c.status),
            Some(ConditionStatus::False)
        );

        apply_observation(&mut status, &observation(WorkspaceState::Ready, running(2, 2)), 2, now + chrono::Duration::seconds(5));
        assert_eq!(status.start_time, Some(now));
        assert_eq!(
            find_condition(&status.conditions, condition_types::ALL_WORKERS_READY).map(|c| c.status),
            Some(ConditionStatus::True)
        );
    }

    #[test]
    fn test_restarts_track_failed_pods() {
        let mut status = TorchrunJobStatus::default();
        let obs = observation(
            WorkspaceState::Ready,
            ComputeJobState::Present(ComputeJobObservation {
                active: 1,
                failed: 2,
                ..Default::default()
            }),
        );
        assert_eq!(apply_observation(&mut status, &obs, 1, Utc::now()), JobPhase::Running);
        assert_eq!(status.restarts, 2);
    }

    #[test]
    fn test_pending_summary_without_compute_job() {
        let mut status = TorchrunJobStatus::default();
        apply_observation(&mut status, &observation(WorkspaceState::Preparing, ComputeJobState::Absent), 3, Utc::now());
        assert_eq!(status.workers_status, "0/3 ready");
        assert_eq!(status.workers.pending, 3);
        assert!(status.start_time.is_none());
    }

    #[test]
    fn test_recent_reconcile_timestamp_alone_is_not_written() {
        let refresh = Duration::from_secs(10);
        let stamped = Utc::now();
        let before = TorchrunJobStatus {
            last_reconcile_time: Some(stamped),
            ..Default::default()
        };
        let mut after = before.clone();
        after.last_reconcile_time = Some(stamped + chrono::Duration::seconds(3));
        assert!(!needs_write(Some(&before), Some(&after), refresh));

        after.phase = JobPhase::Running;
        assert!(needs_write(Some(&before), Some(&after), refresh));
        assert!(needs_write(None, Some(&after), refresh));
    }

    #[test]
    fn test_stale_reconcile_timestamp_is_refreshed() {
        let refresh = Duration::from_secs(10);
        let stamped = Utc::now();
        let before = TorchrunJobStatus {
            last_reconcile_time: Some(stamped),
            ..Default::default()
        };
        let mut after = before.clone();
        after.last_reconcile_time = Some(stamped + chrono::Duration::seconds(10));
        assert!(needs_write(Some(&before), Some(&after), refresh));
    }

    #[test]
    fn test_removed_compute_job_keeps_terminal_phase() {
        let removed = |last_phase| observation(WorkspaceState::Ready, ComputeJobState::Removed { last_phase });
        assert_eq!(derive_phase(&removed(JobPhase::Succeeded)), JobPhase::Succeeded);
        assert_eq!(derive_phase(&removed(JobPhase::Failed)), JobPhase::Failed);
        assert_eq!(derive_phase(&removed(JobPhase::TimedOut)), JobPhase::TimedOut);
        assert_eq!(derive_phase(&removed(JobPhase::Running)), JobPhase::Unknown);

        let mut status = TorchrunJobStatus {
            workers: WorkerStatus {
                succeeded: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        apply_observation(&mut status, &removed(JobPhase::Succeeded), 2, Utc::now());
        assert_eq!(status.workers.succeeded, 2);
        assert_eq!(status.workers_status, "2/2 succeeded");
    }

    #[test]
    fn test_compute_job_created_from_condition_or_completion() {
        assert!(!compute_job_created(None));

        let mut status = TorchrunJobStatus::default();
        assert!(!compute_job_created(Some(&status)));
        set_condition(&mut status.conditions, condition_types::JOB_CREATED, ConditionStatus::False, "CreateFailed", "");
        assert!(!compute_job_created(Some(&status)));
        set_condition(&mut status.conditions, condition_types::JOB_CREATED, ConditionStatus::True, "JobCreated", "");
        assert!(compute_job_created(Some(&status)));

        let finished = TorchrunJobStatus {
            completion_time: Some(Utc::now()),
            ..Default::default()
        };
        assert!(compute_job_created(Some(&finished)));
    }

    #[test]
    fn test_observation_reads_compute_job_times() {
        let started = Utc::now() - chrono::Duration::minutes(5);
        let finished = Utc::now();
        let job = Job {
            status: Some(JobStatus {
                succeeded: Some(1),
                start_time: Some(Time(started)),
                completion_time: Some(Time(finished)),
                ..Default::default()
            }),
            ..Default::default()
        };
        let observed = ComputeJobObservation::from_job(&job);
        assert_eq!(observed.succeeded, 1);
        assert_eq!(observed.start_time, Some(started));
        assert_eq!(observed.completion_time, Some(finished));
    }
}
