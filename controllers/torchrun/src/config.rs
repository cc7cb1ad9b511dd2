//! Controller configuration loaded from environment variables.

use crate::error::ControllerError;
use std::net::SocketAddr;
use std::time::Duration;

/// Runtime settings shared by all reconcilers.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace to watch; `None` watches all namespaces
    pub namespace: Option<String>,
    /// `schedulerName` set on worker pods
    pub scheduler_name: String,
    /// Default image of the workspace preparation pod
    pub sync_image: String,
    /// Image of the init step that copies the workspace into worker pods
    pub init_image: String,
    /// Workspace volume size when neither job nor queue sets one
    pub default_workspace_size: String,
    /// Storage class when neither job nor queue sets one; falls back to the cluster default
    pub default_storage_class: Option<String>,
    /// Workspace mount path in the trainer container when neither job nor queue sets one
    pub default_mount_path: String,
    /// How long a zip-source preparation pod waits for an upload
    pub upload_timeout: Duration,
    /// Re-queue delay while the workspace is being prepared
    pub sync_requeue: Duration,
    /// Re-queue delay while the job runs
    pub running_requeue: Duration,
    /// Re-queue delay while a queue's scheduler queue is missing
    pub queue_requeue: Duration,
    pub debounce: Duration,
    pub concurrency: u16,
    /// Address of the probes/metrics server
    pub metrics_addr: SocketAddr,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            scheduler_name: "kai-scheduler".to_string(),
            sync_image: "alpine/git:2.45.2".to_string(),
            init_image: "alpine:3.18".to_string(),
            default_workspace_size: "10Gi".to_string(),
            default_storage_class: None,
            default_mount_path: "/workspace".to_string(),
            upload_timeout: Duration::from_secs(3600),
            sync_requeue: Duration::from_secs(5),
            running_requeue: Duration::from_secs(10),
            queue_requeue: Duration::from_secs(30),
            debounce: Duration::from_secs(5),
            concurrency: 3,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl ControllerConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. Unset or empty
    /// keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Ok(Self {
            namespace: get("WATCH_NAMESPACE"),
            scheduler_name: get("SCHEDULER_NAME").unwrap_or(defaults.scheduler_name),
            sync_image: get("WORKSPACE_SYNC_IMAGE").unwrap_or(defaults.sync_image),
            init_image: get("WORKSPACE_INIT_IMAGE").unwrap_or(defaults.init_image),
            default_workspace_size: get("WORKSPACE_DEFAULT_SIZE").unwrap_or(defaults.default_workspace_size),
            default_storage_class: get("WORKSPACE_STORAGE_CLASS"),
            default_mount_path: get("WORKSPACE_MOUNT_PATH").unwrap_or(defaults.default_mount_path),
            upload_timeout: seconds(get("SYNC_UPLOAD_TIMEOUT_SECONDS"), "SYNC_UPLOAD_TIMEOUT_SECONDS", defaults.upload_timeout)?,
            sync_requeue: seconds(get("SYNC_REQUEUE_SECONDS"), "SYNC_REQUEUE_SECONDS", defaults.sync_requeue)?,
            running_requeue: seconds(get("RUNNING_REQUEUE_SECONDS"), "RUNNING_REQUEUE_SECONDS", defaults.running_requeue)?,
            queue_requeue: seconds(get("QUEUE_REQUEUE_SECONDS"), "QUEUE_REQUEUE_SECONDS", defaults.queue_requeue)?,
            debounce: seconds(get("RECONCILE_DEBOUNCE_SECONDS"), "RECONCILE_DEBOUNCE_SECONDS", defaults.debounce)?,
            concurrency: match get("RECONCILE_CONCURRENCY") {
                Some(raw) => parse(&raw, "RECONCILE_CONCURRENCY")?,
                None => defaults.concurrency,
            },
            metrics_addr: match get("METRICS_ADDR") {
                Some(raw) => parse(&raw, "METRICS_ADDR")?,
                None => defaults.metrics_addr,
            },
        })
    }
}

fn parse<T: std::str::FromStr>(raw: &str, key: &str) -> Result<T, ControllerError> {
    raw.trim()
        .parse()
        .map_err(|_| ControllerError::InvalidConfig(format!("{} has an invalid value: {}", key, raw)))
}

fn seconds(raw: Option<String>, key: &str, default: Duration) -> Result<Duration, ControllerError> {
    match raw {
        Some(raw) => Ok(Duration::from_secs(parse(&raw, key)?)),
        None => Ok(default),
    }
}
