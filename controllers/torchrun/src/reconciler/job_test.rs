//! Unit tests for the TorchrunJob reconciler

#[cfg(test)]
mod tests {
    use crate::error::ControllerError;
    use crate::naming::SYNC_COMPLETED_LABEL;
    use crate::reconciler::Requeue;
    use crate::status::find_condition;
    use crate::test_utils::*;
    use cluster_client::{ClusterError, MockClusterClient};
    use crds::{Condition, ConditionStatus, JobPhase, TorchrunJob, condition_types};
    use k8s_openapi::api::batch::v1::JobStatus;
    use std::time::Duration;

    const SYNC_REQUEUE: Requeue = Requeue::After(Duration::from_secs(5));
    const RUNNING_REQUEUE: Requeue = Requeue::After(Duration::from_secs(10));

    /// Job whose workspace needs no download and whose command exits at once.
    fn existing_workspace_job(name: &str, queue: &str) -> TorchrunJob {
        let mut job = create_test_job(name, "ml", queue);
        job.spec.command = "true".to_string();
        job.spec.workspace_storage.source = Some("existing".to_string());
        job
    }

    fn setup(name: &str) -> MockClusterClient {
        let client = MockClusterClient::new();
        client.add_torchrun_queue(create_test_queue("dev", "ml", "team-a"));
        client.add_torchrun_job(existing_workspace_job(name, "dev"));
        client
    }

    fn phase(client: &MockClusterClient, name: &str) -> JobPhase {
        client
            .torchrun_job("ml", name)
            .and_then(|job| job.status)
            .map(|status| status.phase)
            .unwrap_or_default()
    }

    fn condition(client: &MockClusterClient, name: &str, type_: &str) -> Option<Condition> {
        let status = client.torchrun_job("ml", name)?.status?;
        find_condition(&status.conditions, type_).cloned()
    }

    fn condition_status(client: &MockClusterClient, name: &str, type_: &str) -> Option<ConditionStatus> {
        condition(client, name, type_).map(|c| c.status)
    }

    #[tokio::test]
    async fn test_lifecycle_pending_to_succeeded() {
        let client = setup("run-1");
        let reconciler = create_test_reconciler(client.clone());

        // Volume and preparation pod created, pod not started yet
        assert_eq!(reconciler.reconcile_torchrun_job("ml", "run-1").await.unwrap(), SYNC_REQUEUE);
        assert_eq!(phase(&client, "run-1"), JobPhase::Pending);
        assert_eq!(
            condition_status(&client, "run-1", condition_types::PROVISIONED),
            Some(ConditionStatus::True)
        );
        assert!(client.pvc("ml", "run-1-workspace").is_some());
        assert!(client.pod("ml", "run-1-sync").is_some());

        client.set_pod_phase("ml", "run-1-sync", "Running", None);
        assert_eq!(reconciler.reconcile_torchrun_job("ml", "run-1").await.unwrap(), SYNC_REQUEUE);
        assert_eq!(phase(&client, "run-1"), JobPhase::Syncing);
        assert_eq!(
            condition_status(&client, "run-1", condition_types::WORKSPACE_SYNC),
            Some(ConditionStatus::True)
        );

        client.set_pod_phase("ml", "run-1-sync", "Succeeded", None);
        assert_eq!(reconciler.reconcile_torchrun_job("ml", "run-1").await.unwrap(), RUNNING_REQUEUE);
        assert_eq!(phase(&client, "run-1"), JobPhase::Queued);
        assert_eq!(
            condition_status(&client, "run-1", condition_types::JOB_CREATED),
            Some(ConditionStatus::True)
        );
        assert_eq!(
            condition_status(&client, "run-1", condition_types::WORKSPACE_READY),
            Some(ConditionStatus::True)
        );
        let sync = condition(&client, "run-1", condition_types::WORKSPACE_SYNC).unwrap();
        assert_eq!((sync.status, sync.reason.as_str()), (ConditionStatus::False, "SyncCompleted"));
        let labels = client.pvc("ml", "run-1-workspace").unwrap().metadata.labels.unwrap();
        assert_eq!(labels.get(SYNC_COMPLETED_LABEL).map(String::as_str), Some("true"));
        assert_eq!(client.batch_job_count(), 1);

        client.set_batch_job_status(
            "ml",
            "run-1",
            JobStatus {
                active: Some(1),
                ready: Some(1),
                ..Default::default()
            },
        );
        assert_eq!(reconciler.reconcile_torchrun_job("ml", "run-1").await.unwrap(), RUNNING_REQUEUE);
        assert_eq!(phase(&client, "run-1"), JobPhase::Running);
        assert_eq!(
            condition_status(&client, "run-1", condition_types::ALL_WORKERS_READY),
            Some(ConditionStatus::True)
        );

        client.set_batch_job_status(
            "ml",
            "run-1",
            JobStatus {
                succeeded: Some(1),
                ..Default::default()
            },
        );
        assert_eq!(reconciler.reconcile_torchrun_job("ml", "run-1").await.unwrap(), Requeue::Never);
        assert_eq!(phase(&client, "run-1"), JobPhase::Succeeded);
        assert_eq!(
            condition_status(&client, "run-1", condition_types::COMPLETED),
            Some(ConditionStatus::True)
        );
        let status = client.torchrun_job("ml", "run-1").unwrap().status.unwrap();
        assert!(status.completion_time.is_some());
        assert_eq!(status.workers_status, "1/1 succeeded");
        assert_eq!(client.batch_job_count(), 1);
    }

    /// Drives `name` until its compute job exists.
    async fn run_until_created(client: &MockClusterClient, reconciler: &crate::reconciler::Reconciler, name: &str) {
        reconciler.reconcile_torchrun_job("ml", name).await.unwrap();
        client.set_pod_phase("ml", &format!("{}-sync", name), "Succeeded", None);
        assert_eq!(reconciler.reconcile_torchrun_job("ml", name).await.unwrap(), RUNNING_REQUEUE);
        assert!(client.batch_job("ml", name).is_some());
    }

    #[tokio::test]
    async fn test_finished_job_is_not_relaunched_after_ttl_cleanup() {
        let client = setup("run-9");
        let reconciler = create_test_reconciler(client.clone());
        run_until_created(&client, &reconciler, "run-9").await;

        client.set_batch_job_status(
            "ml",
            "run-9",
            JobStatus {
                succeeded: Some(1),
                ..Default::default()
            },
        );
        assert_eq!(reconciler.reconcile_torchrun_job("ml", "run-9").await.unwrap(), Requeue::Never);
        let finished = client.torchrun_job("ml", "run-9").unwrap().status.unwrap();

        client.remove_batch_job("ml", "run-9");
        assert_eq!(reconciler.reconcile_torchrun_job("ml", "run-9").await.unwrap(), Requeue::Never);

        assert_eq!(phase(&client, "run-9"), JobPhase::Succeeded);
        assert!(client.batch_job("ml", "run-9").is_none());
        assert_eq!(client.create_count("Job"), 1);
        let status = client.torchrun_job("ml", "run-9").unwrap().status.unwrap();
        assert_eq!(status.completion_time, finished.completion_time);
        assert_eq!(status.workers_status, "1/1 succeeded");
    }

    #[tokio::test]
    async fn test_failed_run_is_not_relaunched_after_ttl_cleanup() {
        let client = setup("run-10");
        let reconciler = create_test_reconciler(client.clone());
        run_until_created(&client, &reconciler, "run-10").await;

        client.set_batch_job_status(
            "ml",
            "run-10",
            JobStatus {
                failed: Some(3),
                ..Default::default()
            },
        );
        assert_eq!(reconciler.reconcile_torchrun_job("ml", "run-10").await.unwrap(), Requeue::Never);
        assert_eq!(phase(&client, "run-10"), JobPhase::Failed);

        client.remove_batch_job("ml", "run-10");
        assert_eq!(reconciler.reconcile_torchrun_job("ml", "run-10").await.unwrap(), Requeue::Never);
        assert_eq!(phase(&client, "run-10"), JobPhase::Failed);
        assert_eq!(client.create_count("Job"), 1);
    }

    #[tokio::test]
    async fn test_repeated_reconcile_is_idempotent() {
        let client = setup("run-2");
        let reconciler = create_test_reconciler(client.clone());

        reconciler.reconcile_torchrun_job("ml", "run-2").await.unwrap();
        let first = client.torchrun_job("ml", "run-2").unwrap();

        reconciler.reconcile_torchrun_job("ml", "run-2").await.unwrap();
        let second = client.torchrun_job("ml", "run-2").unwrap();

        assert_eq!(client.create_count("Pod"), 1);
        assert_eq!(client.create_count("PersistentVolumeClaim"), 1);
        assert_eq!(second.status.as_ref().map(|s| s.phase), first.status.as_ref().map(|s| s.phase));
        // Nothing but the reconcile timestamp changed, so nothing was written
        assert_eq!(second.metadata.resource_version, first.metadata.resource_version);
    }

    #[tokio::test]
    async fn test_missing_job_is_ignored() {
        let reconciler = create_test_reconciler(MockClusterClient::new());
        assert_eq!(reconciler.reconcile_torchrun_job("ml", "ghost").await.unwrap(), Requeue::Never);
    }

    #[tokio::test]
    async fn test_missing_queue_fails_without_children() {
        let client = MockClusterClient::new();
        client.add_torchrun_job(existing_workspace_job("run-3", "absent"));
        let reconciler = create_test_reconciler(client.clone());

        assert_eq!(reconciler.reconcile_torchrun_job("ml", "run-3").await.unwrap(), Requeue::Never);
        assert_eq!(phase(&client, "run-3"), JobPhase::Failed);
        assert_eq!(
            condition_status(&client, "run-3", condition_types::QUEUE_NOT_FOUND),
            Some(ConditionStatus::True)
        );
        assert_eq!(client.pvc_count(), 0);
        assert_eq!(client.pod_count(), 0);
        assert!(
            reconciler
                .metrics
                .encode()
                .unwrap()
                .contains(r#"torchrun_controller_terminal_failures_total{reason="QueueNotFound"} 1"#)
        );

        // Staying failed is not a new failure
        assert_eq!(reconciler.reconcile_torchrun_job("ml", "run-3").await.unwrap(), Requeue::Never);
        assert!(
            reconciler
                .metrics
                .encode()
                .unwrap()
                .contains(r#"torchrun_controller_terminal_failures_total{reason="QueueNotFound"} 1"#)
        );

        // Creating the queue later lets the job proceed
        client.add_torchrun_queue(create_test_queue("absent", "ml", "team-a"));
        assert_eq!(reconciler.reconcile_torchrun_job("ml", "run-3").await.unwrap(), SYNC_REQUEUE);
        assert_eq!(phase(&client, "run-3"), JobPhase::Pending);
        assert_eq!(
            condition_status(&client, "run-3", condition_types::QUEUE_NOT_FOUND),
            Some(ConditionStatus::False)
        );
    }

    #[tokio::test]
    async fn test_failed_preparation_is_terminal() {
        let client = setup("run-4");
        let reconciler = create_test_reconciler(client.clone());
        reconciler.reconcile_torchrun_job("ml", "run-4").await.unwrap();

        client.set_pod_phase("ml", "run-4-sync", "Failed", Some("git clone failed"));
        assert_eq!(reconciler.reconcile_torchrun_job("ml", "run-4").await.unwrap(), Requeue::Never);
        assert_eq!(phase(&client, "run-4"), JobPhase::Failed);
        let sync = condition(&client, "run-4", condition_types::WORKSPACE_SYNC).unwrap();
        assert_eq!(sync.status, ConditionStatus::False);
        assert_eq!(sync.reason, "SyncFailed");
        assert_eq!(sync.message, "git clone failed");
        assert_eq!(
            condition_status(&client, "run-4", condition_types::FAILED),
            Some(ConditionStatus::True)
        );
        assert_eq!(client.batch_job_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_template_is_terminal() {
        let client = MockClusterClient::new();
        let mut queue = create_test_queue("dev", "ml", "team-a");
        queue.spec.pod_template.spec = Some(serde_json::json!({
            "containers": [{ "name": "worker", "image": "busybox" }]
        }));
        client.add_torchrun_queue(queue);
        client.add_torchrun_job(existing_workspace_job("run-5", "dev"));
        let reconciler = create_test_reconciler(client.clone());

        reconciler.reconcile_torchrun_job("ml", "run-5").await.unwrap();
        client.set_pod_phase("ml", "run-5-sync", "Succeeded", None);
        assert_eq!(reconciler.reconcile_torchrun_job("ml", "run-5").await.unwrap(), Requeue::Never);

        assert_eq!(phase(&client, "run-5"), JobPhase::Failed);
        let created = condition(&client, "run-5", condition_types::JOB_CREATED).unwrap();
        assert_eq!((created.status, created.reason.as_str()), (ConditionStatus::False, "InvalidPodTemplate"));
        assert_eq!(client.batch_job_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_create_error_is_returned() {
        let client = setup("run-6");
        let reconciler = create_test_reconciler(client.clone());
        reconciler.reconcile_torchrun_job("ml", "run-6").await.unwrap();
        client.set_pod_phase("ml", "run-6-sync", "Succeeded", None);

        client.fail_operation("create_batch_job", "apiserver down");
        let err = reconciler.reconcile_torchrun_job("ml", "run-6").await.unwrap_err();
        assert!(matches!(err, ControllerError::Cluster(ClusterError::Unavailable(_))));
        assert!(!err.is_terminal());
        let created = condition(&client, "run-6", condition_types::JOB_CREATED).unwrap();
        assert_eq!((created.status, created.reason.as_str()), (ConditionStatus::False, "CreateFailed"));

        client.clear_failures();
        assert_eq!(reconciler.reconcile_torchrun_job("ml", "run-6").await.unwrap(), RUNNING_REQUEUE);
        assert_eq!(
            condition_status(&client, "run-6", condition_types::JOB_CREATED),
            Some(ConditionStatus::True)
        );
        assert_eq!(client.batch_job_count(), 1);
    }

    #[tokio::test]
    async fn test_preparation_pod_create_error() {
        let client = setup("run-7");
        client.fail_operation("create_pod", "quota exceeded");
        let reconciler = create_test_reconciler(client.clone());

        assert!(reconciler.reconcile_torchrun_job("ml", "run-7").await.is_err());
        let sync = condition(&client, "run-7", condition_types::WORKSPACE_SYNC).unwrap();
        assert_eq!((sync.status, sync.reason.as_str()), (ConditionStatus::False, "CreateSyncPodFailed"));
        assert!(client.pvc("ml", "run-7-workspace").is_some());
        assert_eq!(client.pod_count(), 0);
    }

    #[tokio::test]
    async fn test_deleting_job_reports_deleted() {
        let client = setup("run-8");
        let reconciler = create_test_reconciler(client.clone());
        reconciler.reconcile_torchrun_job("ml", "run-8").await.unwrap();

        client.mark_torchrun_job_deleted("ml", "run-8");
        assert_eq!(reconciler.reconcile_torchrun_job("ml", "run-8").await.unwrap(), Requeue::Never);
        assert_eq!(phase(&client, "run-8"), JobPhase::Deleted);
        assert_eq!(client.create_count("Job"), 0);
    }

    #[tokio::test]
    async fn test_missing_storage_class_is_transient() {
        let client = setup("run-9");
        let metrics = std::sync::Arc::new(crate::metrics::Metrics::new().unwrap());
        let config = crate::config::ControllerConfig::default();
        let reconciler = crate::reconciler::Reconciler::new(Box::new(client.clone()), config, metrics);

        let err = reconciler.reconcile_torchrun_job("ml", "run-9").await.unwrap_err();
        assert!(matches!(err, ControllerError::NoStorageClass(_)));
        assert!(!err.is_terminal());

        client.set_default_storage_class(Some("local-path"));
        assert_eq!(reconciler.reconcile_torchrun_job("ml", "run-9").await.unwrap(), SYNC_REQUEUE);
        let pvc = client.pvc("ml", "run-9-workspace").unwrap();
        assert_eq!(pvc.spec.unwrap().storage_class_name.as_deref(), Some("local-path"));
    }
}
