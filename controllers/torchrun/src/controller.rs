//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the cluster
//! client, reconciler, watchers and the probe server together.

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::health::{HealthState, run_health_server};
use crate::metrics::Metrics;
use crate::reconciler::Reconciler;
use crate::watcher::Watcher;
use cluster_client::ClusterClient;
use kube::Client;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Main controller for TorchrunJobs and TorchrunQueues.
pub struct Controller {
    job_watcher: JoinHandle<Result<(), ControllerError>>,
    queue_watcher: JoinHandle<Result<(), ControllerError>>,
    health_server: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates the controller and starts its background tasks.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing torchrun controller");

        let kube_client = Client::try_default().await?;
        let cluster_client = ClusterClient::new(kube_client.clone());
        let metrics = Arc::new(Metrics::new()?);

        let reconciler = Arc::new(Reconciler::new(
            Box::new(cluster_client),
            config.clone(),
            metrics.clone(),
        ));
        let watcher_instance = Arc::new(Watcher::new(reconciler, kube_client, config.namespace.clone()));
        let health = Arc::new(HealthState::new(metrics));

        let health_server = {
            let health = health.clone();
            let addr = config.metrics_addr;
            tokio::spawn(async move { run_health_server(addr, health).await })
        };

        let job_watcher = {
            let watcher = watcher_instance.clone();
            tokio::spawn(async move { watcher.watch_torchrun_jobs().await })
        };

        let queue_watcher = {
            let watcher = watcher_instance.clone();
            tokio::spawn(async move { watcher.watch_torchrun_queues().await })
        };

        health.set_ready(true);
        info!("Torchrun controller started");

        Ok(Self {
            job_watcher,
            queue_watcher,
            health_server,
        })
    }

    /// Runs until one of the background tasks exits.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        tokio::select! {
            result = &mut self.job_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("TorchrunJob watcher panicked: {}", e)))??;
            }
            result = &mut self.queue_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("TorchrunQueue watcher panicked: {}", e)))??;
            }
            result = &mut self.health_server => {
                result.map_err(|e| ControllerError::Watch(format!("Health server panicked: {}", e)))??;
            }
        }

        Ok(())
    }
}
