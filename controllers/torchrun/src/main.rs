//! Torchrun Controller
//!
//! Runs distributed PyTorch training on Kubernetes:
//! - TorchrunQueue: cluster-level training infrastructure (scheduler queue,
//!   worker pod template, shared resources)
//! - TorchrunJob: a training run submitted against a queue. The controller
//!   prepares a workspace volume, then launches an indexed batch Job of
//!   torchrun workers and reports its progress.

mod backoff;
mod config;
mod controller;
mod error;
mod health;
mod job_manager;
mod metrics;
mod naming;
mod reconciler;
mod status;
mod template;
mod watcher;
mod workspace;

#[cfg(test)]
mod test_utils;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Installs the ring provider for rustls. Must run after tracing is set up
/// so the already-installed case is reported.
fn install_crypto_provider() -> bool {
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("rustls crypto provider already installed");
        return false;
    }
    true
}

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    install_crypto_provider();

    info!("Starting Torchrun Controller");

    let config = ControllerConfig::from_env()?;

    info!("Configuration:");
    info!("  Namespace: {}", config.namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Scheduler: {}", config.scheduler_name);
    info!("  Workspace sync image: {}", config.sync_image);
    info!("  Workspace init image: {}", config.init_image);
    info!("  Default workspace size: {}", config.default_workspace_size);
    info!(
        "  Default storage class: {}",
        config.default_storage_class.as_deref().unwrap_or("cluster default")
    );
    info!("  Metrics address: {}", config.metrics_addr);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
